//! Serialized-connection blob.
//!
//! Layout: an 8-byte magic-and-format prefix, the protocol version, the
//! cipher suite, both sequence numbers and a 2-byte terminator tag, followed
//! by the version-specific payload. For TLS 1.3 that payload is the three
//! handshake secrets (hash-sized each). A TLS 1.2 payload would instead
//! carry the master secret and both 32-byte randoms; the format reserves a
//! version byte for it but this encoder only emits 1.3.

use bytes::{Buf, BufMut};

use pqtls_core::policy::CipherSuite;
use pqtls_core::wire::{WireError, TLS13_WIRE_VERSION};
use pqtls_crypto::{HandshakeSecrets, Secret};

use crate::config::ConnectionConfig;
use crate::conn::{Connection, Role};
use crate::error::HandshakeError;

/// 8 bytes of magic + format version.
const SERIAL_MAGIC: [u8; 8] = *b"PQTLSC01";
/// Terminator tag closing the fixed prefix.
const SERIAL_TAG: u16 = 0x51C3;

impl Connection {
    /// Export a completed connection. Only valid once the handshake reached
    /// application data; partial handshakes have secrets in flight that must
    /// not leave the connection.
    pub fn serialize(&self) -> Result<Vec<u8>, HandshakeError> {
        if !self.is_handshake_complete() {
            return Err(HandshakeError::InvalidState);
        }
        let suite = self
            .negotiated_cipher_suite()
            .ok_or(HandshakeError::InvalidState)?;
        let secrets = self
            .handshake_secrets()
            .ok_or(HandshakeError::InvalidState)?;

        let hash_len = suite.hash_len();
        let mut out = Vec::with_capacity(8 + 2 + 2 + 8 + 8 + 2 + 3 * hash_len);
        out.extend_from_slice(&SERIAL_MAGIC);
        out.put_u16(TLS13_WIRE_VERSION);
        out.put_u16(suite.iana_id());
        out.put_u64(self.send_sequence());
        out.put_u64(self.recv_sequence());
        out.put_u16(SERIAL_TAG);
        out.extend_from_slice(secrets.extract_secret.as_bytes());
        out.extend_from_slice(secrets.client_handshake_secret.as_bytes());
        out.extend_from_slice(secrets.server_handshake_secret.as_bytes());
        Ok(out)
    }

    /// Rebuild a connection from an exported blob. The restored context
    /// resumes in application data with the same suite, secrets and sequence
    /// numbers, so record processing continues identically.
    pub fn deserialize(
        config: ConnectionConfig,
        role: Role,
        mut blob: &[u8],
    ) -> Result<Self, HandshakeError> {
        if blob.len() < 8 + 2 + 2 + 8 + 8 + 2 {
            return Err(HandshakeError::Wire(WireError::Truncated));
        }
        if blob[..8] != SERIAL_MAGIC {
            return Err(HandshakeError::Wire(WireError::UnexpectedContentType(
                blob[0],
            )));
        }
        blob.advance(8);

        let protocol_version = blob.get_u16();
        if protocol_version != TLS13_WIRE_VERSION {
            return Err(HandshakeError::Wire(WireError::UnsupportedVersion(
                protocol_version,
            )));
        }
        let suite = CipherSuite::from_id(blob.get_u16())
            .ok_or(HandshakeError::Wire(WireError::LengthOverflow))?;
        let send_seq = blob.get_u64();
        let recv_seq = blob.get_u64();
        if blob.get_u16() != SERIAL_TAG {
            return Err(HandshakeError::Wire(WireError::LengthOverflow));
        }

        let hash_len = suite.hash_len();
        if blob.len() != 3 * hash_len {
            return Err(HandshakeError::Wire(WireError::LengthOverflow));
        }
        let extract_secret = Secret::new(blob[..hash_len].to_vec());
        let client_handshake_secret = Secret::new(blob[hash_len..2 * hash_len].to_vec());
        let server_handshake_secret = Secret::new(blob[2 * hash_len..].to_vec());

        Connection::restore_serialized(
            config,
            role,
            suite,
            HandshakeSecrets {
                extract_secret,
                client_handshake_secret,
                server_handshake_secret,
            },
            send_seq,
            recv_seq,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pqtls_core::policy::PreferenceSet;

    #[test]
    fn incomplete_connection_refuses_to_serialize() {
        let conn =
            Connection::client(ConnectionConfig::new(PreferenceSet::default_pq())).expect("client");
        assert!(matches!(
            conn.serialize(),
            Err(HandshakeError::InvalidState)
        ));
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let config = ConnectionConfig::new(PreferenceSet::default_pq());
        let err = Connection::deserialize(config, Role::Client, b"PQTLSC01").unwrap_err();
        assert!(matches!(err, HandshakeError::Wire(WireError::Truncated)));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let config = ConnectionConfig::new(PreferenceSet::default_pq());
        let blob = vec![0u8; 64];
        let err = Connection::deserialize(config, Role::Client, &blob).unwrap_err();
        assert!(matches!(err, HandshakeError::Wire(_)));
    }
}
