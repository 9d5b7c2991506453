//! Per-connection handshake driver for the pqtls stack.
//!
//! Owns the TLS 1.3 hybrid key-exchange state machine on both sides of the
//! connection: message ordering, transcript hashing, key-share exchange,
//! secret derivation and teardown. Negotiation rules and wire codecs come
//! from `pqtls-core`; primitives come from `pqtls-crypto`.

mod config;
mod conn;
mod error;
mod exchange;
mod flags;
mod serialize;

pub use config::ConnectionConfig;
pub use conn::{Connection, HandshakeState, MessageKind, Role};
pub use error::HandshakeError;
pub use flags::HandshakeFlags;
