//! Handshake wire codecs.
//!
//! Messages travel in a minimal plaintext envelope (`u8` content type,
//! `u16` length) carrying either a change-cipher-spec marker, an alert, or a
//! TLS handshake message (`u8` type, `u24` length, body). The record layer
//! proper, encryption included, lives outside this crate.

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::error::ErrorKind;
use crate::select::WireFormat;

pub const CONTENT_CCS: u8 = 20;
pub const CONTENT_ALERT: u8 = 21;
pub const CONTENT_HANDSHAKE: u8 = 22;

pub const MSG_CLIENT_HELLO: u8 = 1;
pub const MSG_SERVER_HELLO: u8 = 2;
pub const MSG_ENCRYPTED_EXTENSIONS: u8 = 8;
pub const MSG_FINISHED: u8 = 20;

pub const EXT_SUPPORTED_GROUPS: u16 = 0x000A;
pub const EXT_SUPPORTED_VERSIONS: u16 = 0x002B;
pub const EXT_KEY_SHARE: u16 = 0x0033;

pub const TLS12_WIRE_VERSION: u16 = 0x0303;
pub const TLS13_WIRE_VERSION: u16 = 0x0304;

pub const RANDOM_LEN: usize = 32;
pub const SESSION_ID_LEN: usize = 32;

/// SHA-256 of "HelloRetryRequest"; a ServerHello carrying this random is a
/// HelloRetryRequest (RFC 8446 section 4.1.3).
pub const HELLO_RETRY_RANDOM: [u8; RANDOM_LEN] = [
    0xCF, 0x21, 0xAD, 0x74, 0xE5, 0x9A, 0x61, 0x11, 0xBE, 0x1D, 0x8C, 0x02, 0x1E, 0x65, 0xB8,
    0x91, 0xC2, 0xA2, 0x11, 0x16, 0x7A, 0xBB, 0x8C, 0x5E, 0x07, 0x9E, 0x09, 0xE2, 0xC8, 0xA8,
    0x33, 0x9C,
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message truncated")]
    Truncated,
    #[error("length field exceeds enclosing structure")]
    LengthOverflow,
    #[error("trailing bytes after message body")]
    TrailingBytes,
    #[error("unexpected content type {0}")]
    UnexpectedContentType(u8),
    #[error("unexpected handshake message type {0}")]
    UnexpectedMessageType(u8),
    #[error("unsupported protocol version {0:#06x}")]
    UnsupportedVersion(u16),
    #[error("hybrid share length matches neither wire format")]
    HybridShareShape,
    #[error("change-cipher-spec body must be a single 0x01 byte")]
    MalformedCcs,
    #[error("malformed {0} extension")]
    MalformedExtension(&'static str),
    #[error("required {0} extension missing")]
    MissingExtension(&'static str),
}

impl WireError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::DecodeError
    }
}

/// One `key_share` entry: a group id and its opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyShareEntry {
    pub group: u16,
    pub payload: Vec<u8>,
}

/// Parsed ClientHello, reduced to the fields negotiation consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub random: [u8; RANDOM_LEN],
    pub session_id: Vec<u8>,
    pub cipher_suites: Vec<u16>,
    pub supported_versions: Vec<u16>,
    pub supported_groups: Vec<u16>,
    pub key_shares: Vec<KeyShareEntry>,
}

/// The server's answer inside the `key_share` extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerShare {
    /// Full ServerHello: the chosen group with the server's share.
    Entry(KeyShareEntry),
    /// HelloRetryRequest: only the group the client must retry with.
    Retry { selected_group: u16 },
}

/// Parsed ServerHello (or HelloRetryRequest, distinguished by the random).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub random: [u8; RANDOM_LEN],
    pub session_id_echo: Vec<u8>,
    pub cipher_suite: u16,
    pub key_share: ServerShare,
}

impl ServerHello {
    pub fn is_hello_retry(&self) -> bool {
        self.random == HELLO_RETRY_RANDOM
    }
}

/// Wrap a handshake message body in its `type ‖ u24 len ‖ body` header.
pub fn encode_handshake_message(msg_type: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body.len());
    out.put_u8(msg_type);
    put_u24(&mut out, body.len());
    out.extend_from_slice(body);
    out
}

/// Wrap bytes in the outer plaintext envelope.
pub fn encode_envelope(content_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + payload.len());
    out.put_u8(content_type);
    out.put_u16(payload.len() as u16);
    out.extend_from_slice(payload);
    out
}

pub fn encode_ccs() -> Vec<u8> {
    encode_envelope(CONTENT_CCS, &[0x01])
}

pub fn encode_alert(description: u8) -> Vec<u8> {
    // level fatal (2) + description
    encode_envelope(CONTENT_ALERT, &[2, description])
}

/// Read one envelope off the front of `input`, advancing it.
pub fn read_envelope<'a>(input: &mut &'a [u8]) -> Result<(u8, &'a [u8]), WireError> {
    if input.len() < 3 {
        return Err(WireError::Truncated);
    }
    let content_type = input[0];
    let len = u16::from_be_bytes([input[1], input[2]]) as usize;
    if input.len() < 3 + len {
        return Err(WireError::Truncated);
    }
    let payload = &input[3..3 + len];
    *input = &input[3 + len..];
    Ok((content_type, payload))
}

/// Split a handshake payload into its type and body, verifying the header.
pub fn read_handshake_header(payload: &[u8]) -> Result<(u8, &[u8]), WireError> {
    if payload.len() < 4 {
        return Err(WireError::Truncated);
    }
    let msg_type = payload[0];
    let len = u32::from_be_bytes([0, payload[1], payload[2], payload[3]]) as usize;
    if payload.len() - 4 != len {
        return Err(WireError::LengthOverflow);
    }
    Ok((msg_type, &payload[4..]))
}

pub fn check_ccs_body(payload: &[u8]) -> Result<(), WireError> {
    if payload != [0x01] {
        return Err(WireError::MalformedCcs);
    }
    Ok(())
}

impl ClientHello {
    pub fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.put_u16(TLS12_WIRE_VERSION);
        out.extend_from_slice(&self.random);
        out.put_u8(self.session_id.len() as u8);
        out.extend_from_slice(&self.session_id);
        out.put_u16((self.cipher_suites.len() * 2) as u16);
        for suite in &self.cipher_suites {
            out.put_u16(*suite);
        }
        // legacy compression: null only
        out.put_u8(1);
        out.put_u8(0);

        let mut exts = Vec::with_capacity(128);

        exts.put_u16(EXT_SUPPORTED_VERSIONS);
        exts.put_u16((1 + self.supported_versions.len() * 2) as u16);
        exts.put_u8((self.supported_versions.len() * 2) as u8);
        for version in &self.supported_versions {
            exts.put_u16(*version);
        }

        exts.put_u16(EXT_SUPPORTED_GROUPS);
        exts.put_u16((2 + self.supported_groups.len() * 2) as u16);
        exts.put_u16((self.supported_groups.len() * 2) as u16);
        for group in &self.supported_groups {
            exts.put_u16(*group);
        }

        let shares_len: usize = self.key_shares.iter().map(|s| 4 + s.payload.len()).sum();
        exts.put_u16(EXT_KEY_SHARE);
        exts.put_u16((2 + shares_len) as u16);
        exts.put_u16(shares_len as u16);
        for share in &self.key_shares {
            exts.put_u16(share.group);
            exts.put_u16(share.payload.len() as u16);
            exts.extend_from_slice(&share.payload);
        }

        out.put_u16(exts.len() as u16);
        out.extend_from_slice(&exts);
        out
    }

    pub fn decode_body(mut body: &[u8]) -> Result<Self, WireError> {
        let legacy_version = take_u16(&mut body)?;
        if legacy_version != TLS12_WIRE_VERSION {
            return Err(WireError::UnsupportedVersion(legacy_version));
        }
        let random = take_random(&mut body)?;
        let session_id = take_u8_vec(&mut body)?;
        let suites_bytes = take_u16_slice(&mut body)?;
        let cipher_suites = split_u16s(suites_bytes)?;
        let compression = take_u8_vec(&mut body)?;
        if compression.is_empty() {
            return Err(WireError::Truncated);
        }

        let mut exts = take_u16_slice(&mut body)?;
        if !body.is_empty() {
            return Err(WireError::TrailingBytes);
        }

        let mut supported_versions = Vec::new();
        let mut supported_groups = Vec::new();
        let mut key_shares = Vec::new();

        while !exts.is_empty() {
            let ext_type = take_u16(&mut exts)?;
            let mut ext = take_u16_slice(&mut exts)?;
            match ext_type {
                EXT_SUPPORTED_VERSIONS => {
                    let list = take_u8_vec(&mut ext)?;
                    supported_versions = split_u16s(&list)?;
                    if !ext.is_empty() {
                        return Err(WireError::MalformedExtension("supported_versions"));
                    }
                }
                EXT_SUPPORTED_GROUPS => {
                    let list = take_u16_slice(&mut ext)?;
                    supported_groups = split_u16s(list)?;
                    if !ext.is_empty() {
                        return Err(WireError::MalformedExtension("supported_groups"));
                    }
                }
                EXT_KEY_SHARE => {
                    let mut list = take_u16_slice(&mut ext)?;
                    if !ext.is_empty() {
                        return Err(WireError::MalformedExtension("key_share"));
                    }
                    while !list.is_empty() {
                        let group = take_u16(&mut list)?;
                        let payload = take_u16_slice(&mut list)?.to_vec();
                        key_shares.push(KeyShareEntry { group, payload });
                    }
                }
                // Unknown extensions are legal and skipped.
                _ => {}
            }
        }

        if supported_groups.is_empty() {
            return Err(WireError::MissingExtension("supported_groups"));
        }

        Ok(Self {
            random,
            session_id,
            cipher_suites,
            supported_versions,
            supported_groups,
            key_shares,
        })
    }
}

impl ServerHello {
    pub fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.put_u16(TLS12_WIRE_VERSION);
        out.extend_from_slice(&self.random);
        out.put_u8(self.session_id_echo.len() as u8);
        out.extend_from_slice(&self.session_id_echo);
        out.put_u16(self.cipher_suite);
        out.put_u8(0); // null compression

        let mut exts = Vec::with_capacity(64);

        exts.put_u16(EXT_SUPPORTED_VERSIONS);
        exts.put_u16(2);
        exts.put_u16(TLS13_WIRE_VERSION);

        match &self.key_share {
            ServerShare::Entry(entry) => {
                exts.put_u16(EXT_KEY_SHARE);
                exts.put_u16((4 + entry.payload.len()) as u16);
                exts.put_u16(entry.group);
                exts.put_u16(entry.payload.len() as u16);
                exts.extend_from_slice(&entry.payload);
            }
            ServerShare::Retry { selected_group } => {
                exts.put_u16(EXT_KEY_SHARE);
                exts.put_u16(2);
                exts.put_u16(*selected_group);
            }
        }

        out.put_u16(exts.len() as u16);
        out.extend_from_slice(&exts);
        out
    }

    pub fn decode_body(mut body: &[u8]) -> Result<Self, WireError> {
        let legacy_version = take_u16(&mut body)?;
        if legacy_version != TLS12_WIRE_VERSION {
            return Err(WireError::UnsupportedVersion(legacy_version));
        }
        let random = take_random(&mut body)?;
        let session_id_echo = take_u8_vec(&mut body)?;
        let cipher_suite = take_u16(&mut body)?;
        let _compression = take_u8(&mut body)?;

        let mut exts = take_u16_slice(&mut body)?;
        if !body.is_empty() {
            return Err(WireError::TrailingBytes);
        }

        let is_retry = random == HELLO_RETRY_RANDOM;
        let mut selected_version = None;
        let mut key_share = None;

        while !exts.is_empty() {
            let ext_type = take_u16(&mut exts)?;
            let mut ext = take_u16_slice(&mut exts)?;
            match ext_type {
                EXT_SUPPORTED_VERSIONS => {
                    selected_version = Some(take_u16(&mut ext)?);
                    if !ext.is_empty() {
                        return Err(WireError::MalformedExtension("supported_versions"));
                    }
                }
                EXT_KEY_SHARE => {
                    if is_retry {
                        let selected_group = take_u16(&mut ext)?;
                        if !ext.is_empty() {
                            return Err(WireError::MalformedExtension("key_share"));
                        }
                        key_share = Some(ServerShare::Retry { selected_group });
                    } else {
                        let group = take_u16(&mut ext)?;
                        let payload = take_u16_slice(&mut ext)?.to_vec();
                        if !ext.is_empty() {
                            return Err(WireError::MalformedExtension("key_share"));
                        }
                        key_share = Some(ServerShare::Entry(KeyShareEntry { group, payload }));
                    }
                }
                _ => {}
            }
        }

        match selected_version {
            Some(TLS13_WIRE_VERSION) => {}
            Some(other) => return Err(WireError::UnsupportedVersion(other)),
            None => return Err(WireError::MissingExtension("supported_versions")),
        }

        Ok(Self {
            random,
            session_id_echo,
            cipher_suite,
            key_share: key_share.ok_or(WireError::MissingExtension("key_share"))?,
        })
    }
}

/// EncryptedExtensions with an empty extension block.
pub fn encode_encrypted_extensions_body() -> Vec<u8> {
    vec![0, 0]
}

pub fn decode_encrypted_extensions_body(mut body: &[u8]) -> Result<(), WireError> {
    let exts = take_u16_slice(&mut body)?;
    if !body.is_empty() || !exts.is_empty() {
        return Err(WireError::TrailingBytes);
    }
    Ok(())
}

/// Assemble a hybrid key-share payload from its two component shares.
pub fn encode_hybrid_share(ec_share: &[u8], kem_share: &[u8], format: WireFormat) -> Vec<u8> {
    match format {
        WireFormat::LengthPrefixed => {
            let mut out = Vec::with_capacity(4 + ec_share.len() + kem_share.len());
            out.put_u16(ec_share.len() as u16);
            out.extend_from_slice(ec_share);
            out.put_u16(kem_share.len() as u16);
            out.extend_from_slice(kem_share);
            out
        }
        WireFormat::Concatenated => {
            let mut out = Vec::with_capacity(ec_share.len() + kem_share.len());
            out.extend_from_slice(ec_share);
            out.extend_from_slice(kem_share);
            out
        }
    }
}

/// Split a hybrid payload whose component sizes are fixed by the group,
/// detecting which wire format the sender used from the exact length.
pub fn parse_hybrid_share<'a>(
    payload: &'a [u8],
    ec_len: usize,
    kem_len: usize,
) -> Result<(&'a [u8], &'a [u8], WireFormat), WireError> {
    if payload.len() == ec_len + kem_len {
        let (ec, kem) = payload.split_at(ec_len);
        return Ok((ec, kem, WireFormat::Concatenated));
    }
    if payload.len() == 4 + ec_len + kem_len {
        let mut cursor = payload;
        let ec = take_u16_slice(&mut cursor)?;
        let kem = take_u16_slice(&mut cursor)?;
        if ec.len() != ec_len || kem.len() != kem_len || !cursor.is_empty() {
            return Err(WireError::HybridShareShape);
        }
        return Ok((ec, kem, WireFormat::LengthPrefixed));
    }
    Err(WireError::HybridShareShape)
}

/// Strict variant: the format is already agreed, anything else is fatal.
pub fn parse_hybrid_share_as<'a>(
    payload: &'a [u8],
    ec_len: usize,
    kem_len: usize,
    format: WireFormat,
) -> Result<(&'a [u8], &'a [u8]), WireError> {
    let (ec, kem, seen) = parse_hybrid_share(payload, ec_len, kem_len)?;
    if seen != format {
        return Err(WireError::HybridShareShape);
    }
    Ok((ec, kem))
}

fn put_u24(out: &mut Vec<u8>, value: usize) {
    debug_assert!(value <= 0x00FF_FFFF);
    out.push((value >> 16) as u8);
    out.push((value >> 8) as u8);
    out.push(value as u8);
}

fn take_u8(input: &mut &[u8]) -> Result<u8, WireError> {
    if input.is_empty() {
        return Err(WireError::Truncated);
    }
    let value = input[0];
    input.advance(1);
    Ok(value)
}

fn take_u16(input: &mut &[u8]) -> Result<u16, WireError> {
    if input.len() < 2 {
        return Err(WireError::Truncated);
    }
    Ok(input.get_u16())
}

fn take_random(input: &mut &[u8]) -> Result<[u8; RANDOM_LEN], WireError> {
    if input.len() < RANDOM_LEN {
        return Err(WireError::Truncated);
    }
    let mut random = [0u8; RANDOM_LEN];
    random.copy_from_slice(&input[..RANDOM_LEN]);
    input.advance(RANDOM_LEN);
    Ok(random)
}

fn take_u8_vec(input: &mut &[u8]) -> Result<Vec<u8>, WireError> {
    let len = take_u8(input)? as usize;
    if input.len() < len {
        return Err(WireError::Truncated);
    }
    let out = input[..len].to_vec();
    input.advance(len);
    Ok(out)
}

fn take_u16_slice<'a>(input: &mut &'a [u8]) -> Result<&'a [u8], WireError> {
    let len = take_u16(input)? as usize;
    if input.len() < len {
        return Err(WireError::LengthOverflow);
    }
    let out = &input[..len];
    input.advance(len);
    Ok(out)
}

fn split_u16s(bytes: &[u8]) -> Result<Vec<u16>, WireError> {
    if bytes.len() % 2 != 0 {
        return Err(WireError::LengthOverflow);
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_client_hello() -> ClientHello {
        ClientHello {
            random: [7u8; RANDOM_LEN],
            session_id: vec![9u8; SESSION_ID_LEN],
            cipher_suites: vec![0x1301, 0x1302],
            supported_versions: vec![TLS13_WIRE_VERSION],
            supported_groups: vec![0x2F39, 0x001D, 0x0017],
            key_shares: vec![
                KeyShareEntry {
                    group: 0x2F39,
                    payload: vec![1, 2, 3, 4],
                },
                KeyShareEntry {
                    group: 0x001D,
                    payload: vec![5; 32],
                },
            ],
        }
    }

    #[test]
    fn client_hello_round_trips() {
        let hello = sample_client_hello();
        let decoded = ClientHello::decode_body(&hello.encode_body()).expect("decode");
        assert_eq!(decoded, hello);
    }

    #[test]
    fn client_hello_rejects_trailing_bytes() {
        let mut body = sample_client_hello().encode_body();
        body.push(0);
        assert_eq!(
            ClientHello::decode_body(&body),
            Err(WireError::TrailingBytes)
        );
    }

    #[test]
    fn client_hello_requires_supported_groups() {
        let mut hello = sample_client_hello();
        hello.supported_groups.clear();
        assert_eq!(
            ClientHello::decode_body(&hello.encode_body()),
            Err(WireError::MissingExtension("supported_groups"))
        );
    }

    #[test]
    fn server_hello_round_trips() {
        let hello = ServerHello {
            random: [3u8; RANDOM_LEN],
            session_id_echo: vec![9u8; SESSION_ID_LEN],
            cipher_suite: 0x1301,
            key_share: ServerShare::Entry(KeyShareEntry {
                group: 0x11EC,
                payload: vec![0xAB; 40],
            }),
        };
        let decoded = ServerHello::decode_body(&hello.encode_body()).expect("decode");
        assert_eq!(decoded, hello);
        assert!(!decoded.is_hello_retry());
    }

    #[test]
    fn hello_retry_round_trips() {
        let retry = ServerHello {
            random: HELLO_RETRY_RANDOM,
            session_id_echo: vec![],
            cipher_suite: 0x1302,
            key_share: ServerShare::Retry {
                selected_group: 0x2F3C,
            },
        };
        let decoded = ServerHello::decode_body(&retry.encode_body()).expect("decode");
        assert!(decoded.is_hello_retry());
        assert_eq!(
            decoded.key_share,
            ServerShare::Retry {
                selected_group: 0x2F3C
            }
        );
    }

    #[test]
    fn envelope_round_trips_and_detects_truncation() {
        let encoded = encode_envelope(CONTENT_HANDSHAKE, b"hello");
        let mut input = encoded.as_slice();
        let (content_type, payload) = read_envelope(&mut input).expect("read");
        assert_eq!(content_type, CONTENT_HANDSHAKE);
        assert_eq!(payload, b"hello");
        assert!(input.is_empty());

        let mut truncated = &encoded[..encoded.len() - 1];
        assert_eq!(read_envelope(&mut truncated), Err(WireError::Truncated));
    }

    #[test]
    fn handshake_header_checks_length() {
        let message = encode_handshake_message(MSG_FINISHED, &[1, 2, 3]);
        let (msg_type, body) = read_handshake_header(&message).expect("header");
        assert_eq!(msg_type, MSG_FINISHED);
        assert_eq!(body, &[1, 2, 3]);

        let mut bad = message.clone();
        bad.push(0xFF);
        assert_eq!(read_handshake_header(&bad), Err(WireError::LengthOverflow));
    }

    #[test]
    fn ccs_body_is_policed() {
        let encoded = encode_ccs();
        let mut input = encoded.as_slice();
        let (content_type, payload) = read_envelope(&mut input).expect("read");
        assert_eq!(content_type, CONTENT_CCS);
        check_ccs_body(payload).expect("ccs");
        assert_eq!(check_ccs_body(&[2]), Err(WireError::MalformedCcs));
    }

    #[test]
    fn hybrid_share_formats_are_distinguished_by_length() {
        let ec = vec![1u8; 32];
        let kem = vec![2u8; 800];

        let concat = encode_hybrid_share(&ec, &kem, WireFormat::Concatenated);
        let (ec_out, kem_out, format) = parse_hybrid_share(&concat, 32, 800).expect("concat");
        assert_eq!(format, WireFormat::Concatenated);
        assert_eq!(ec_out, &ec[..]);
        assert_eq!(kem_out, &kem[..]);

        let prefixed = encode_hybrid_share(&ec, &kem, WireFormat::LengthPrefixed);
        let (ec_out, kem_out, format) = parse_hybrid_share(&prefixed, 32, 800).expect("prefixed");
        assert_eq!(format, WireFormat::LengthPrefixed);
        assert_eq!(ec_out, &ec[..]);
        assert_eq!(kem_out, &kem[..]);
    }

    #[test]
    fn hybrid_share_with_wrong_size_is_rejected() {
        let payload = vec![0u8; 100];
        assert_eq!(
            parse_hybrid_share(&payload, 32, 800),
            Err(WireError::HybridShareShape)
        );
    }

    #[test]
    fn hybrid_share_with_lying_prefix_is_rejected() {
        let ec = vec![1u8; 32];
        let kem = vec![2u8; 800];
        let mut prefixed = encode_hybrid_share(&ec, &kem, WireFormat::LengthPrefixed);
        // Claim a longer EC component than the group allows.
        prefixed[0] = 0;
        prefixed[1] = 33;
        assert!(parse_hybrid_share(&prefixed, 32, 800).is_err());
    }

    #[test]
    fn strict_parse_enforces_the_agreed_format() {
        let ec = vec![1u8; 65];
        let kem = vec![2u8; 1184];
        let concat = encode_hybrid_share(&ec, &kem, WireFormat::Concatenated);
        assert_eq!(
            parse_hybrid_share_as(&concat, 65, 1184, WireFormat::LengthPrefixed),
            Err(WireError::HybridShareShape)
        );
        parse_hybrid_share_as(&concat, 65, 1184, WireFormat::Concatenated).expect("match");
    }
}
