//! Crypto collaborator for the pqtls negotiation core.
//!
//! Exposes the provider traits the handshake consumes, the bundled
//! RustCrypto/pqcrypto-backed provider, and the RFC 8446 key-schedule
//! helpers. No negotiation logic lives here.

pub mod provider;
pub mod schedule;

pub use provider::{
    probe_provider, CryptoError, CryptoProvider, EcdhKeyPair, KemKeyPair, RustCryptoProvider,
    SecretBytes,
};
pub use schedule::{
    derive_handshake_secrets, derive_secret, finished_key, finished_verify, hash, hkdf_expand_label,
    hkdf_extract, verify_data_matches, HandshakeSecrets, Secret, TranscriptHash,
};
