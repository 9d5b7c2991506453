//! The per-connection handshake driver.
//!
//! A [`Connection`] is caller-driven and non-blocking: `write_io` emits the
//! next pending flight into the caller's buffer, `read_io` consumes one
//! message from the peer's bytes. The caller shuttles buffers between the
//! two ends as data becomes available; there is no internal scheduler.
//!
//! Message order on the post-quantum TLS 1.3 paths:
//!
//! ```text
//! client                                server
//!   ClientHello          -->
//!                                         (selection)
//!                        <--  HelloRetryRequest?   + CCS
//!   CCS + ClientHello'   -->
//!                        <--  ServerHello  (+ CCS if not yet sent)
//!                        <--  EncryptedExtensions
//!                        <--  Finished
//!   Finished             -->
//! ```
//!
//! Change-cipher-spec markers exist for middlebox compatibility only and
//! never advance the state machine.

use std::collections::HashMap;

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, trace};

use pqtls_core::policy::CipherSuite;
use pqtls_core::select::{select, ClientOffer, Selected, Selection, WireFormat};
use pqtls_core::wire::{
    check_ccs_body, encode_alert, encode_ccs, encode_envelope, encode_encrypted_extensions_body,
    encode_handshake_message, decode_encrypted_extensions_body, parse_hybrid_share,
    read_envelope, read_handshake_header, ClientHello, KeyShareEntry, ServerHello, ServerShare,
    WireError, CONTENT_ALERT, CONTENT_CCS, CONTENT_HANDSHAKE, HELLO_RETRY_RANDOM,
    MSG_CLIENT_HELLO, MSG_ENCRYPTED_EXTENSIONS, MSG_FINISHED, MSG_SERVER_HELLO, RANDOM_LEN,
    SESSION_ID_LEN, TLS13_WIRE_VERSION,
};
use pqtls_crypto::{
    derive_handshake_secrets, finished_verify, hash, verify_data_matches, HandshakeSecrets,
    TranscriptHash,
};

use crate::config::ConnectionConfig;
use crate::error::HandshakeError;
use crate::exchange::{
    complete_classical, complete_hybrid, generate_ec_share, generate_hybrid_share,
    respond_classical, respond_hybrid, EcShare, HybridShare,
};
use crate::flags::HandshakeFlags;

/// Synthetic handshake type standing in for the first ClientHello after a
/// HelloRetryRequest (RFC 8446 section 4.4.1).
const MSG_MESSAGE_HASH: u8 = 254;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Driver states. Terminal states are `ApplicationData` and `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    // client
    SendClientHello,
    ExpectServerHello,
    SendCcsThenSecondClientHello,
    SendSecondClientHello,
    ExpectEncryptedExtensions,
    // server
    ExpectClientHello,
    SendHelloRetry,
    SendCcsAfterHelloRetry,
    ExpectSecondClientHello,
    SendServerHello,
    SendCcsAfterServerHello,
    SendEncryptedExtensions,
    // both
    SendFinished,
    ExpectFinished,
    ApplicationData,
    Aborted,
}

/// What kind of message the connection is about to read or write, mirroring
/// the driver-visible message sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    ClientHello,
    ServerHello,
    ChangeCipherSpec,
    EncryptedExtensions,
    Finished,
    ApplicationData,
    Aborted,
}

#[derive(Debug)]
pub struct Connection {
    role: Role,
    config: ConnectionConfig,
    state: HandshakeState,
    flags: HandshakeFlags,

    cipher_suite: Option<CipherSuite>,
    transcript: Option<TranscriptHash>,
    /// Raw first ClientHello, buffered until the suite (and therefore the
    /// transcript hash) is known.
    first_hello: Option<Vec<u8>>,

    client_random: [u8; RANDOM_LEN],
    session_id: Vec<u8>,
    offered_suites: Vec<u16>,
    advertised_groups: Vec<u16>,

    hybrid_share: Option<HybridShare>,
    ec_share: Option<EcShare>,
    /// Group indicated in a HelloRetryRequest, tracked on both sides.
    retry_group: Option<u16>,

    // Server-side carry-over between reading a ClientHello and answering it.
    offer: Option<ClientOffer>,
    peer_key_shares: HashMap<u16, Vec<u8>>,
    selection: Option<Selection>,
    ccs_sent: bool,

    negotiated: Option<Selected>,
    secrets: Option<HandshakeSecrets>,

    send_seq: u64,
    recv_seq: u64,
    alert_out: Option<Vec<u8>>,
}

impl Connection {
    pub fn client(config: ConnectionConfig) -> Result<Self, HandshakeError> {
        Self::new(Role::Client, config)
    }

    pub fn server(config: ConnectionConfig) -> Result<Self, HandshakeError> {
        Self::new(Role::Server, config)
    }

    fn new(role: Role, config: ConnectionConfig) -> Result<Self, HandshakeError> {
        // Configuration-time availability check: a policy the provider cannot
        // serve at all is rejected here, never mid-handshake.
        if config.first_available_curve().is_none() && config.first_available_kem_group().is_none()
        {
            return Err(HandshakeError::NoUsableGroup);
        }

        let mut client_random = [0u8; RANDOM_LEN];
        OsRng.fill_bytes(&mut client_random);
        let mut session_id = vec![0u8; SESSION_ID_LEN];
        OsRng.fill_bytes(&mut session_id);

        Ok(Self {
            role,
            state: match role {
                Role::Client => HandshakeState::SendClientHello,
                Role::Server => HandshakeState::ExpectClientHello,
            },
            flags: HandshakeFlags::new(),
            cipher_suite: None,
            transcript: None,
            first_hello: None,
            client_random,
            session_id,
            offered_suites: Vec::new(),
            advertised_groups: Vec::new(),
            hybrid_share: None,
            ec_share: None,
            retry_group: None,
            offer: None,
            peer_key_shares: HashMap::new(),
            selection: None,
            ccs_sent: false,
            negotiated: None,
            secrets: None,
            send_seq: 0,
            recv_seq: 0,
            alert_out: None,
            config,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn flags(&self) -> HandshakeFlags {
        self.flags
    }

    pub fn is_hello_retry(&self) -> bool {
        self.flags.is_hello_retry()
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.state == HandshakeState::ApplicationData
    }

    pub fn negotiated(&self) -> Option<&Selected> {
        self.negotiated.as_ref()
    }

    pub fn negotiated_cipher_suite(&self) -> Option<CipherSuite> {
        self.cipher_suite
    }

    pub fn handshake_secrets(&self) -> Option<&HandshakeSecrets> {
        self.secrets.as_ref()
    }

    pub fn send_sequence(&self) -> u64 {
        self.send_seq
    }

    pub fn recv_sequence(&self) -> u64 {
        self.recv_seq
    }

    pub(crate) fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Name of the negotiated hybrid group, or empty when classical (or
    /// nothing yet) was negotiated.
    pub fn kem_group_name(&self) -> &'static str {
        match self.negotiated {
            Some(Selected::Hybrid { group, .. }) => group.name,
            _ => "",
        }
    }

    /// Name of the negotiated classical curve, or empty when a hybrid group
    /// (or nothing yet) was negotiated.
    pub fn curve_name(&self) -> &'static str {
        match self.negotiated {
            Some(Selected::Classical { curve }) => curve.name,
            _ => "",
        }
    }

    /// Unified accessor: whichever of the two is active.
    pub fn key_exchange_group(&self) -> Option<&'static str> {
        match self.negotiated {
            Some(Selected::Hybrid { group, .. }) => Some(group.name),
            Some(Selected::Classical { curve }) => Some(curve.name),
            None => None,
        }
    }

    /// Whether the negotiated hybrid share encoding is length-prefixed.
    pub fn len_prefixed(&self) -> Option<bool> {
        match self.negotiated {
            Some(Selected::Hybrid { len_prefixed, .. }) => Some(len_prefixed),
            _ => None,
        }
    }

    /// The message the driver will produce or consume next.
    pub fn current_message(&self) -> MessageKind {
        match self.state {
            HandshakeState::SendClientHello
            | HandshakeState::SendSecondClientHello
            | HandshakeState::ExpectClientHello
            | HandshakeState::ExpectSecondClientHello => MessageKind::ClientHello,
            HandshakeState::ExpectServerHello
            | HandshakeState::SendHelloRetry
            | HandshakeState::SendServerHello => MessageKind::ServerHello,
            HandshakeState::SendCcsThenSecondClientHello
            | HandshakeState::SendCcsAfterHelloRetry
            | HandshakeState::SendCcsAfterServerHello => MessageKind::ChangeCipherSpec,
            HandshakeState::SendEncryptedExtensions
            | HandshakeState::ExpectEncryptedExtensions => MessageKind::EncryptedExtensions,
            HandshakeState::SendFinished | HandshakeState::ExpectFinished => MessageKind::Finished,
            HandshakeState::ApplicationData => MessageKind::ApplicationData,
            HandshakeState::Aborted => MessageKind::Aborted,
        }
    }

    /// Encoded fatal alert waiting to be flushed after an abort, if any.
    /// Returned at most once.
    pub fn take_alert(&mut self) -> Option<Vec<u8>> {
        self.alert_out.take()
    }

    /// Emit the next pending message, if the driver has one. A no-op in
    /// read-side and terminal states.
    pub fn write_io(&mut self, out: &mut Vec<u8>) -> Result<(), HandshakeError> {
        match self.state {
            HandshakeState::SendClientHello => {
                let result = self.write_first_client_hello(out);
                self.guard(result)
            }
            HandshakeState::SendCcsThenSecondClientHello => {
                out.extend_from_slice(&encode_ccs());
                self.send_seq += 1;
                self.state = HandshakeState::SendSecondClientHello;
                Ok(())
            }
            HandshakeState::SendSecondClientHello => {
                let result = self.write_second_client_hello(out);
                self.guard(result)
            }
            HandshakeState::SendHelloRetry => {
                let result = self.write_hello_retry(out);
                self.guard(result)
            }
            HandshakeState::SendCcsAfterHelloRetry => {
                out.extend_from_slice(&encode_ccs());
                self.send_seq += 1;
                self.ccs_sent = true;
                self.state = HandshakeState::ExpectSecondClientHello;
                Ok(())
            }
            HandshakeState::SendCcsAfterServerHello => {
                out.extend_from_slice(&encode_ccs());
                self.send_seq += 1;
                self.ccs_sent = true;
                self.state = HandshakeState::SendEncryptedExtensions;
                Ok(())
            }
            HandshakeState::SendServerHello => {
                let result = self.write_server_hello(out);
                self.guard(result)
            }
            HandshakeState::SendEncryptedExtensions => {
                let result = self.write_encrypted_extensions(out);
                self.guard(result)
            }
            HandshakeState::SendFinished => {
                let result = self.write_finished(out);
                self.guard(result)
            }
            HandshakeState::Aborted => Err(HandshakeError::InvalidState),
            _ => Ok(()),
        }
    }

    /// Consume one message from `input`, advancing it past the bytes read.
    /// A no-op until a complete message is buffered; io suspension happens
    /// only at this boundary.
    pub fn read_io(&mut self, input: &mut &[u8]) -> Result<(), HandshakeError> {
        if self.state == HandshakeState::Aborted {
            return Err(HandshakeError::InvalidState);
        }
        if !has_complete_envelope(input) {
            return Ok(());
        }

        let result = self.read_one(input);
        self.guard(result)
    }

    fn read_one(&mut self, input: &mut &[u8]) -> Result<(), HandshakeError> {
        let (content_type, payload) = read_envelope(input)?;
        self.recv_seq += 1;

        match content_type {
            CONTENT_CCS => {
                // Middlebox-compatibility marker; validated, then ignored.
                check_ccs_body(payload)?;
                trace!(role = ?self.role, "consumed change-cipher-spec");
                Ok(())
            }
            CONTENT_ALERT => {
                let description = payload.get(1).copied().unwrap_or(0);
                Err(HandshakeError::PeerAlert(description))
            }
            CONTENT_HANDSHAKE => {
                let (msg_type, body) = read_handshake_header(payload)?;
                let raw = payload.to_vec();
                self.handle_handshake_message(msg_type, body, &raw)
            }
            other => Err(HandshakeError::Wire(WireError::UnexpectedContentType(other))),
        }
    }

    fn handle_handshake_message(
        &mut self,
        msg_type: u8,
        body: &[u8],
        raw: &[u8],
    ) -> Result<(), HandshakeError> {
        match (self.role, self.state, msg_type) {
            (Role::Server, HandshakeState::ExpectClientHello, MSG_CLIENT_HELLO) => {
                self.on_client_hello(body, raw)
            }
            (Role::Server, HandshakeState::ExpectSecondClientHello, MSG_CLIENT_HELLO) => {
                self.on_second_client_hello(body, raw)
            }
            (Role::Client, HandshakeState::ExpectServerHello, MSG_SERVER_HELLO) => {
                self.on_server_hello(body, raw)
            }
            (Role::Client, HandshakeState::ExpectEncryptedExtensions, MSG_ENCRYPTED_EXTENSIONS) => {
                self.on_encrypted_extensions(body, raw)
            }
            (_, HandshakeState::ExpectFinished, MSG_FINISHED) => self.on_finished(body, raw),
            _ => Err(HandshakeError::UnexpectedMessage(self.state_name())),
        }
    }

    // ---- client writes -------------------------------------------------

    fn write_first_client_hello(&mut self, out: &mut Vec<u8>) -> Result<(), HandshakeError> {
        let policy = self.config.policy().clone();
        let format = WireFormat::from_draft_revision(policy.hybrid_draft_revision);

        let mut supported_groups = Vec::new();
        for group in &policy.kem_groups {
            if self.config.registry().is_available(group) {
                supported_groups.push(group.iana_id);
            }
        }
        for curve in &policy.curves {
            if self.config.registry().curve_is_available(curve) {
                supported_groups.push(curve.iana_id);
            }
        }

        let mut key_shares = Vec::new();
        if policy.initial_key_shares.pq {
            if let Some(group) = self.config.first_available_kem_group() {
                let (share, payload) =
                    generate_hybrid_share(self.config.provider(), group, format)?;
                key_shares.push(KeyShareEntry {
                    group: group.iana_id,
                    payload,
                });
                self.hybrid_share = Some(share);
            }
        }
        if policy.initial_key_shares.ec {
            if let Some(curve) = self.config.first_available_curve() {
                let (share, payload) = generate_ec_share(self.config.provider(), curve)?;
                key_shares.push(KeyShareEntry {
                    group: curve.iana_id,
                    payload,
                });
                self.ec_share = Some(share);
            }
        }

        self.offered_suites = policy.cipher_suites.iter().map(|s| s.iana_id()).collect();
        self.advertised_groups = supported_groups.clone();

        let hello = ClientHello {
            random: self.client_random,
            session_id: self.session_id.clone(),
            cipher_suites: self.offered_suites.clone(),
            supported_versions: vec![TLS13_WIRE_VERSION],
            supported_groups,
            key_shares,
        };

        let message = encode_handshake_message(MSG_CLIENT_HELLO, &hello.encode_body());
        self.first_hello = Some(message.clone());
        out.extend_from_slice(&encode_envelope(CONTENT_HANDSHAKE, &message));
        self.send_seq += 1;
        self.state = HandshakeState::ExpectServerHello;
        debug!(policy = policy.name, "client hello sent");
        Ok(())
    }

    fn write_second_client_hello(&mut self, out: &mut Vec<u8>) -> Result<(), HandshakeError> {
        let retry_group = self
            .retry_group
            .ok_or(HandshakeError::InvalidState)?;

        // Only the share for the indicated group; everything else is
        // unchanged from the first hello.
        let mut key_shares = Vec::new();
        if let Some(share) = &self.hybrid_share {
            let format =
                WireFormat::from_draft_revision(self.config.policy().hybrid_draft_revision);
            let payload = pqtls_core::wire::encode_hybrid_share(
                &share.ec.public,
                &share.kem.public,
                format,
            );
            key_shares.push(KeyShareEntry {
                group: share.group.iana_id,
                payload,
            });
        } else if let Some(share) = &self.ec_share {
            key_shares.push(KeyShareEntry {
                group: share.curve.iana_id,
                payload: share.ec.public.clone(),
            });
        }
        debug_assert_eq!(key_shares.first().map(|s| s.group), Some(retry_group));

        let hello = ClientHello {
            random: self.client_random,
            session_id: self.session_id.clone(),
            cipher_suites: self.offered_suites.clone(),
            supported_versions: vec![TLS13_WIRE_VERSION],
            supported_groups: self.advertised_groups.clone(),
            key_shares,
        };

        let message = encode_handshake_message(MSG_CLIENT_HELLO, &hello.encode_body());
        self.transcript_update(&message)?;
        out.extend_from_slice(&encode_envelope(CONTENT_HANDSHAKE, &message));
        self.send_seq += 1;
        self.state = HandshakeState::ExpectServerHello;
        debug!(group = retry_group, "second client hello sent");
        Ok(())
    }

    // ---- server reads --------------------------------------------------

    fn on_client_hello(&mut self, body: &[u8], raw: &[u8]) -> Result<(), HandshakeError> {
        let hello = ClientHello::decode_body(body)?;

        if !hello.supported_versions.contains(&TLS13_WIRE_VERSION) {
            return Err(HandshakeError::Wire(WireError::UnsupportedVersion(
                hello.supported_versions.first().copied().unwrap_or(0),
            )));
        }

        let suite = self.negotiate_cipher_suite(&hello.cipher_suites)?;
        let offer = self.build_offer(&hello)?;

        self.client_random = hello.random;
        self.session_id = hello.session_id.clone();
        self.peer_key_shares = hello
            .key_shares
            .iter()
            .map(|entry| (entry.group, entry.payload.clone()))
            .collect();

        let selection = select(self.config.registry(), self.config.policy(), &offer)?;
        self.cipher_suite = Some(suite);
        self.selection = Some(selection);
        self.offer = Some(offer);

        if selection.requires_hrr {
            // Transcript restarts from the synthetic message hash of the
            // first hello once a retry is on the books.
            let mut transcript = TranscriptHash::new(suite);
            transcript.update(&message_hash_of(suite, raw));
            self.transcript = Some(transcript);
            self.flags.set(HandshakeFlags::HELLO_RETRY_REQUEST);
            self.retry_group = Some(selection.selected.group_id());
            self.state = HandshakeState::SendHelloRetry;
        } else {
            let mut transcript = TranscriptHash::new(suite);
            transcript.update(raw);
            self.transcript = Some(transcript);
            self.state = HandshakeState::SendServerHello;
        }

        debug!(
            suite = suite.name(),
            hrr = selection.requires_hrr,
            group = selection.selected.group_id(),
            "client hello processed"
        );
        Ok(())
    }

    fn on_second_client_hello(&mut self, body: &[u8], raw: &[u8]) -> Result<(), HandshakeError> {
        let hello = ClientHello::decode_body(body)?;
        let selection = self.selection.ok_or(HandshakeError::InvalidState)?;
        let retry_group = self.retry_group.ok_or(HandshakeError::InvalidState)?;

        if hello.random != self.client_random {
            return Err(HandshakeError::IllegalParameter(
                "client random changed across retry",
            ));
        }
        let prior_offer = self.offer.as_ref().ok_or(HandshakeError::InvalidState)?;
        if hello.supported_groups != prior_offer.supported_groups {
            return Err(HandshakeError::IllegalParameter(
                "supported groups changed across retry",
            ));
        }
        for entry in &hello.key_shares {
            if !hello.supported_groups.contains(&entry.group) {
                return Err(HandshakeError::IllegalParameter(
                    "key share for unoffered group",
                ));
            }
        }

        let entry = hello
            .key_shares
            .iter()
            .find(|entry| entry.group == retry_group)
            .ok_or(HandshakeError::IllegalParameter(
                "retry hello still lacks the indicated key share",
            ))?;

        // For a hybrid retry, learn (and pin) the client's wire format now.
        let updated = match selection.selected {
            Selected::Hybrid { group, .. } => {
                let (_, _, format) = parse_hybrid_share(
                    &entry.payload,
                    group.curve.share_len,
                    group.kem.public_key_len,
                )?;
                if let Some(offer) = &mut self.offer {
                    match offer.hybrid_format {
                        Some(prior) if prior != format => {
                            return Err(HandshakeError::Wire(WireError::HybridShareShape));
                        }
                        _ => offer.hybrid_format = Some(format),
                    }
                }
                Selection {
                    selected: Selected::Hybrid {
                        group,
                        len_prefixed: format.is_length_prefixed(),
                    },
                    requires_hrr: selection.requires_hrr,
                }
            }
            Selected::Classical { curve } => {
                if entry.payload.len() != curve.share_len {
                    return Err(HandshakeError::Wire(WireError::LengthOverflow));
                }
                selection
            }
        };
        self.selection = Some(updated);

        self.peer_key_shares = hello
            .key_shares
            .iter()
            .map(|e| (e.group, e.payload.clone()))
            .collect();

        self.transcript_update(raw)?;
        self.state = HandshakeState::SendServerHello;
        debug!(group = retry_group, "second client hello processed");
        Ok(())
    }

    fn negotiate_cipher_suite(
        &self,
        client_suites: &[u16],
    ) -> Result<CipherSuite, HandshakeError> {
        for id in client_suites {
            if let Some(suite) = CipherSuite::from_id(*id) {
                if self.config.policy().cipher_suites.contains(&suite) {
                    return Ok(suite);
                }
            }
        }
        Err(HandshakeError::Selection(
            pqtls_core::select::SelectionError::NoMutualGroup,
        ))
    }

    fn build_offer(&self, hello: &ClientHello) -> Result<ClientOffer, HandshakeError> {
        let registry = self.config.registry();
        let mut hybrid_format = None;

        for entry in &hello.key_shares {
            if !hello.supported_groups.contains(&entry.group) {
                return Err(HandshakeError::IllegalParameter(
                    "key share for unoffered group",
                ));
            }
            if let Some(group) = registry.group_by_id(entry.group) {
                let (_, _, format) = parse_hybrid_share(
                    &entry.payload,
                    group.curve.share_len,
                    group.kem.public_key_len,
                )?;
                match hybrid_format {
                    Some(prior) if prior != format => {
                        return Err(HandshakeError::Wire(WireError::HybridShareShape));
                    }
                    _ => hybrid_format = Some(format),
                }
            }
        }

        Ok(ClientOffer {
            supported_groups: hello.supported_groups.clone(),
            key_share_groups: hello.key_shares.iter().map(|e| e.group).collect(),
            hybrid_format,
        })
    }

    // ---- server writes -------------------------------------------------

    fn write_hello_retry(&mut self, out: &mut Vec<u8>) -> Result<(), HandshakeError> {
        let selection = self.selection.ok_or(HandshakeError::InvalidState)?;
        let suite = self.cipher_suite.ok_or(HandshakeError::InvalidState)?;

        let retry = ServerHello {
            random: HELLO_RETRY_RANDOM,
            session_id_echo: self.session_id.clone(),
            cipher_suite: suite.iana_id(),
            key_share: ServerShare::Retry {
                selected_group: selection.selected.group_id(),
            },
        };

        let message = encode_handshake_message(MSG_SERVER_HELLO, &retry.encode_body());
        self.transcript_update(&message)?;
        out.extend_from_slice(&encode_envelope(CONTENT_HANDSHAKE, &message));
        self.send_seq += 1;
        self.state = HandshakeState::SendCcsAfterHelloRetry;
        debug!(group = selection.selected.group_id(), "hello retry sent");
        Ok(())
    }

    fn write_server_hello(&mut self, out: &mut Vec<u8>) -> Result<(), HandshakeError> {
        let selection = self.selection.ok_or(HandshakeError::InvalidState)?;
        let suite = self.cipher_suite.ok_or(HandshakeError::InvalidState)?;

        let (group_id, payload, shared) = match selection.selected {
            Selected::Hybrid {
                group,
                len_prefixed,
            } => {
                let client_payload = self
                    .peer_key_shares
                    .get(&group.iana_id)
                    .ok_or(HandshakeError::InvalidState)?;
                let format = if len_prefixed {
                    WireFormat::LengthPrefixed
                } else {
                    WireFormat::Concatenated
                };
                let (payload, shared) =
                    respond_hybrid(self.config.provider(), group, format, client_payload)?;
                (group.iana_id, payload, shared)
            }
            Selected::Classical { curve } => {
                let client_payload = self
                    .peer_key_shares
                    .get(&curve.iana_id)
                    .ok_or(HandshakeError::InvalidState)?;
                let (payload, shared) =
                    respond_classical(self.config.provider(), curve, client_payload)?;
                (curve.iana_id, payload, shared)
            }
        };

        let mut random = [0u8; RANDOM_LEN];
        OsRng.fill_bytes(&mut random);

        let hello = ServerHello {
            random,
            session_id_echo: self.session_id.clone(),
            cipher_suite: suite.iana_id(),
            key_share: ServerShare::Entry(KeyShareEntry {
                group: group_id,
                payload,
            }),
        };

        let message = encode_handshake_message(MSG_SERVER_HELLO, &hello.encode_body());
        self.transcript_update(&message)?;
        out.extend_from_slice(&encode_envelope(CONTENT_HANDSHAKE, &message));
        self.send_seq += 1;

        let transcript_hash = self.transcript_current()?;
        self.secrets = Some(derive_handshake_secrets(suite, &shared, &transcript_hash)?);
        self.negotiated = Some(selection.selected);

        self.state = if self.ccs_sent {
            HandshakeState::SendEncryptedExtensions
        } else {
            HandshakeState::SendCcsAfterServerHello
        };
        debug!(group = group_id, "server hello sent, secrets derived");
        Ok(())
    }

    fn write_encrypted_extensions(&mut self, out: &mut Vec<u8>) -> Result<(), HandshakeError> {
        let message = encode_handshake_message(
            MSG_ENCRYPTED_EXTENSIONS,
            &encode_encrypted_extensions_body(),
        );
        self.transcript_update(&message)?;
        out.extend_from_slice(&encode_envelope(CONTENT_HANDSHAKE, &message));
        self.send_seq += 1;
        self.state = HandshakeState::SendFinished;
        Ok(())
    }

    fn write_finished(&mut self, out: &mut Vec<u8>) -> Result<(), HandshakeError> {
        let suite = self.cipher_suite.ok_or(HandshakeError::InvalidState)?;
        let secrets = self.secrets.as_ref().ok_or(HandshakeError::InvalidState)?;
        let traffic_secret = match self.role {
            Role::Client => &secrets.client_handshake_secret,
            Role::Server => &secrets.server_handshake_secret,
        };

        let transcript_hash = self.transcript_current()?;
        let verify_data = finished_verify(suite, traffic_secret, &transcript_hash)?;
        let message = encode_handshake_message(MSG_FINISHED, &verify_data);
        self.transcript_update(&message)?;
        out.extend_from_slice(&encode_envelope(CONTENT_HANDSHAKE, &message));
        self.send_seq += 1;

        self.state = match self.role {
            Role::Server => HandshakeState::ExpectFinished,
            Role::Client => HandshakeState::ApplicationData,
        };
        trace!(role = ?self.role, "finished sent");
        Ok(())
    }

    // ---- client reads --------------------------------------------------

    fn on_server_hello(&mut self, body: &[u8], raw: &[u8]) -> Result<(), HandshakeError> {
        let hello = ServerHello::decode_body(body)?;

        let suite = CipherSuite::from_id(hello.cipher_suite).ok_or(
            HandshakeError::IllegalParameter("server chose an unknown cipher suite"),
        )?;
        if !self.offered_suites.contains(&hello.cipher_suite) {
            return Err(HandshakeError::IllegalParameter(
                "server chose a suite we never offered",
            ));
        }
        if let Some(prior) = self.cipher_suite {
            if prior != suite {
                return Err(HandshakeError::IllegalParameter(
                    "cipher suite changed after retry",
                ));
            }
        }

        if hello.is_hello_retry() {
            return self.on_hello_retry(&hello, suite, raw);
        }

        let entry = match &hello.key_share {
            ServerShare::Entry(entry) => entry,
            ServerShare::Retry { .. } => {
                return Err(HandshakeError::Wire(WireError::MissingExtension(
                    "key_share",
                )))
            }
        };

        // The server's choice must line up with a share we actually sent;
        // after a retry it must be exactly the indicated group.
        if let Some(retry_group) = self.retry_group {
            if entry.group != retry_group {
                return Err(HandshakeError::IllegalParameter(
                    "server deviated from its own retry request",
                ));
            }
        }

        let format = WireFormat::from_draft_revision(self.config.policy().hybrid_draft_revision);
        let (selected, shared) = if let Some(share) = &self.hybrid_share {
            if share.group.iana_id == entry.group {
                let shared =
                    complete_hybrid(self.config.provider(), share, format, &entry.payload)?;
                (
                    Selected::Hybrid {
                        group: share.group,
                        len_prefixed: format.is_length_prefixed(),
                    },
                    shared,
                )
            } else {
                self.classical_answer(entry)?
            }
        } else {
            self.classical_answer(entry)?
        };

        if self.transcript.is_none() {
            let mut transcript = TranscriptHash::new(suite);
            let first_hello = self
                .first_hello
                .as_ref()
                .ok_or(HandshakeError::InvalidState)?;
            transcript.update(first_hello);
            self.transcript = Some(transcript);
        }
        self.cipher_suite = Some(suite);
        self.transcript_update(raw)?;

        let transcript_hash = self.transcript_current()?;
        self.secrets = Some(derive_handshake_secrets(suite, &shared, &transcript_hash)?);
        self.negotiated = Some(selected);
        self.state = HandshakeState::ExpectEncryptedExtensions;
        debug!(group = entry.group, "server hello processed, secrets derived");
        Ok(())
    }

    fn classical_answer(
        &self,
        entry: &KeyShareEntry,
    ) -> Result<(Selected, zeroize::Zeroizing<Vec<u8>>), HandshakeError> {
        let share = self
            .ec_share
            .as_ref()
            .filter(|share| share.curve.iana_id == entry.group)
            .ok_or(HandshakeError::IllegalParameter(
                "server chose a group we sent no share for",
            ))?;
        let shared = complete_classical(self.config.provider(), share, &entry.payload)?;
        Ok((Selected::Classical { curve: share.curve }, shared))
    }

    fn on_hello_retry(
        &mut self,
        hello: &ServerHello,
        suite: CipherSuite,
        raw: &[u8],
    ) -> Result<(), HandshakeError> {
        if self.flags.is_hello_retry() {
            // One retry per connection; a second is a protocol violation.
            return Err(HandshakeError::IllegalParameter(
                "second hello retry request",
            ));
        }

        let selected_group = match hello.key_share {
            ServerShare::Retry { selected_group } => selected_group,
            ServerShare::Entry(_) => {
                return Err(HandshakeError::Wire(WireError::MalformedExtension(
                    "key_share",
                )))
            }
        };
        if !self.advertised_groups.contains(&selected_group) {
            return Err(HandshakeError::IllegalParameter(
                "retry asks for a group we never offered",
            ));
        }

        // Regenerate material for the indicated group only.
        let registry = self.config.registry();
        let format = WireFormat::from_draft_revision(self.config.policy().hybrid_draft_revision);
        if let Some(group) = registry.group_by_id(selected_group) {
            let (share, _) = generate_hybrid_share(self.config.provider(), group, format)?;
            self.hybrid_share = Some(share);
            self.ec_share = None;
        } else if let Some(curve) = registry.curve_by_id(selected_group) {
            let (share, _) = generate_ec_share(self.config.provider(), curve)?;
            self.ec_share = Some(share);
            self.hybrid_share = None;
        } else {
            return Err(HandshakeError::IllegalParameter(
                "retry asks for a group outside the catalog",
            ));
        }

        let first_hello = self
            .first_hello
            .as_ref()
            .ok_or(HandshakeError::InvalidState)?;
        let mut transcript = TranscriptHash::new(suite);
        transcript.update(&message_hash_of(suite, first_hello));
        transcript.update(raw);
        self.transcript = Some(transcript);

        self.cipher_suite = Some(suite);
        self.flags.set(HandshakeFlags::HELLO_RETRY_REQUEST);
        self.retry_group = Some(selected_group);
        self.state = HandshakeState::SendCcsThenSecondClientHello;
        debug!(group = selected_group, "hello retry processed");
        Ok(())
    }

    fn on_encrypted_extensions(&mut self, body: &[u8], raw: &[u8]) -> Result<(), HandshakeError> {
        decode_encrypted_extensions_body(body)?;
        self.transcript_update(raw)?;
        self.state = HandshakeState::ExpectFinished;
        Ok(())
    }

    fn on_finished(&mut self, body: &[u8], raw: &[u8]) -> Result<(), HandshakeError> {
        let suite = self.cipher_suite.ok_or(HandshakeError::InvalidState)?;
        let secrets = self.secrets.as_ref().ok_or(HandshakeError::InvalidState)?;
        let peer_secret = match self.role {
            Role::Client => &secrets.server_handshake_secret,
            Role::Server => &secrets.client_handshake_secret,
        };

        let transcript_hash = self.transcript_current()?;
        let expected = finished_verify(suite, peer_secret, &transcript_hash)?;
        if !verify_data_matches(&expected, body) {
            return Err(HandshakeError::FinishedVerification);
        }
        self.transcript_update(raw)?;

        self.state = match self.role {
            Role::Client => HandshakeState::SendFinished,
            Role::Server => HandshakeState::ApplicationData,
        };
        trace!(role = ?self.role, "peer finished verified");
        Ok(())
    }

    // ---- plumbing ------------------------------------------------------

    fn transcript_update(&mut self, bytes: &[u8]) -> Result<(), HandshakeError> {
        self.transcript
            .as_mut()
            .ok_or(HandshakeError::InvalidState)?
            .update(bytes);
        Ok(())
    }

    fn transcript_current(&self) -> Result<Vec<u8>, HandshakeError> {
        Ok(self
            .transcript
            .as_ref()
            .ok_or(HandshakeError::InvalidState)?
            .current())
    }

    fn state_name(&self) -> &'static str {
        match self.state {
            HandshakeState::SendClientHello => "sending client hello",
            HandshakeState::ExpectServerHello => "expecting server hello",
            HandshakeState::SendCcsThenSecondClientHello => "sending retry ccs",
            HandshakeState::SendSecondClientHello => "sending second client hello",
            HandshakeState::ExpectEncryptedExtensions => "expecting encrypted extensions",
            HandshakeState::ExpectClientHello => "expecting client hello",
            HandshakeState::SendHelloRetry => "sending hello retry",
            HandshakeState::SendCcsAfterHelloRetry => "sending post-retry ccs",
            HandshakeState::ExpectSecondClientHello => "expecting second client hello",
            HandshakeState::SendServerHello => "sending server hello",
            HandshakeState::SendCcsAfterServerHello => "sending post-hello ccs",
            HandshakeState::SendEncryptedExtensions => "sending encrypted extensions",
            HandshakeState::SendFinished => "sending finished",
            HandshakeState::ExpectFinished => "expecting finished",
            HandshakeState::ApplicationData => "application data",
            HandshakeState::Aborted => "aborted",
        }
    }

    /// Route every fallible step through here so an error tears the
    /// connection down exactly once: secrets wiped, alert queued, state
    /// pinned to `Aborted`.
    fn guard(&mut self, result: Result<(), HandshakeError>) -> Result<(), HandshakeError> {
        if let Err(err) = &result {
            debug!(role = ?self.role, error = %err, "handshake aborted");
            self.state = HandshakeState::Aborted;
            self.hybrid_share = None;
            self.ec_share = None;
            self.secrets = None;
            if let Some(description) = err.alert() {
                self.alert_out = Some(encode_alert(description));
            }
        }
        result
    }

    pub(crate) fn restore_serialized(
        config: ConnectionConfig,
        role: Role,
        cipher_suite: CipherSuite,
        secrets: HandshakeSecrets,
        send_seq: u64,
        recv_seq: u64,
    ) -> Result<Self, HandshakeError> {
        let mut conn = Self::new(role, config)?;
        conn.state = HandshakeState::ApplicationData;
        conn.cipher_suite = Some(cipher_suite);
        conn.secrets = Some(secrets);
        conn.send_seq = send_seq;
        conn.recv_seq = recv_seq;
        Ok(conn)
    }
}

fn has_complete_envelope(input: &[u8]) -> bool {
    if input.len() < 3 {
        return false;
    }
    let len = u16::from_be_bytes([input[1], input[2]]) as usize;
    input.len() >= 3 + len
}

/// RFC 8446 transcript substitution: after a HelloRetryRequest the first
/// ClientHello is replaced by `message_hash ‖ 00 00 ‖ Hash.length ‖ Hash(CH1)`.
fn message_hash_of(suite: CipherSuite, first_hello: &[u8]) -> Vec<u8> {
    let digest = hash(suite, first_hello);
    let mut out = Vec::with_capacity(4 + digest.len());
    out.push(MSG_MESSAGE_HASH);
    out.push(0);
    out.push(0);
    out.push(digest.len() as u8);
    out.extend_from_slice(&digest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pqtls_core::policy::PreferenceSet;

    #[test]
    fn fresh_connections_start_in_their_role_state() {
        let client =
            Connection::client(ConnectionConfig::new(PreferenceSet::default_pq())).expect("client");
        assert_eq!(client.state(), HandshakeState::SendClientHello);
        assert_eq!(client.current_message(), MessageKind::ClientHello);
        assert!(!client.is_hello_retry());
        assert_eq!(client.kem_group_name(), "");
        assert_eq!(client.curve_name(), "");
        assert_eq!(client.key_exchange_group(), None);

        let server =
            Connection::server(ConnectionConfig::new(PreferenceSet::default_pq())).expect("server");
        assert_eq!(server.state(), HandshakeState::ExpectClientHello);
    }

    #[test]
    fn unusable_policy_is_rejected_at_configuration_time() {
        use pqtls_core::registry::CapabilityProbe;
        // No curves at all and PQ disabled: nothing the provider can run.
        let policy = PreferenceSet::default_pq().with_curves(&[]);
        let config = ConnectionConfig::new(policy).with_probe(CapabilityProbe::classical_only());
        let err = Connection::client(config).unwrap_err();
        assert!(matches!(err, HandshakeError::NoUsableGroup));
        assert_eq!(err.alert(), None);
    }

    #[test]
    fn reading_garbage_aborts_with_a_decode_alert() {
        let config = ConnectionConfig::new(PreferenceSet::default_pq());
        let mut server = Connection::server(config).expect("server");
        let bogus = encode_envelope(CONTENT_HANDSHAKE, &[9, 0, 0, 1, 0xFF]);
        let mut input = bogus.as_slice();
        let err = server.read_io(&mut input).unwrap_err();
        assert!(matches!(err, HandshakeError::UnexpectedMessage(_)));
        assert_eq!(server.state(), HandshakeState::Aborted);
        let alert = server.take_alert().expect("alert queued");
        assert_eq!(alert[0], CONTENT_ALERT);
        assert!(server.take_alert().is_none());
        assert!(server.handshake_secrets().is_none());
    }

    #[test]
    fn write_io_is_a_no_op_in_read_states() {
        let config = ConnectionConfig::new(PreferenceSet::default_pq());
        let mut server = Connection::server(config).expect("server");
        let mut out = Vec::new();
        server.write_io(&mut out).expect("no-op");
        assert!(out.is_empty());
        assert_eq!(server.state(), HandshakeState::ExpectClientHello);
    }
}
