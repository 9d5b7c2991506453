//! Connection-level error type.
//!
//! Every lower-level failure funnels into [`HandshakeError`]; `kind()` maps
//! it onto the public error table and `alert()` yields the TLS alert the
//! connection dispatched before aborting.

use thiserror::Error;

use pqtls_core::select::SelectionError;
use pqtls_core::wire::WireError;
use pqtls_core::ErrorKind;
use pqtls_crypto::CryptoError;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("illegal peer parameter: {0}")]
    IllegalParameter(&'static str),
    #[error("unexpected message while {0}")]
    UnexpectedMessage(&'static str),
    #[error("finished verification failed")]
    FinishedVerification,
    #[error("peer sent fatal alert {0}")]
    PeerAlert(u8),
    #[error("policy offers no group the linked provider can run")]
    NoUsableGroup,
    #[error("connection is not in a state that allows this operation")]
    InvalidState,
}

impl HandshakeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandshakeError::Wire(err) => err.kind(),
            HandshakeError::Selection(err) => err.kind(),
            HandshakeError::Crypto(err) => err.kind(),
            HandshakeError::IllegalParameter(_) => ErrorKind::IllegalParameter,
            HandshakeError::UnexpectedMessage(_) => ErrorKind::DecodeError,
            // Indistinguishable from any other internal failure on the wire.
            HandshakeError::FinishedVerification => ErrorKind::CryptoFailure,
            HandshakeError::PeerAlert(_) => ErrorKind::DecodeError,
            HandshakeError::NoUsableGroup => ErrorKind::Unavailable,
            HandshakeError::InvalidState => ErrorKind::Unavailable,
        }
    }

    /// Stable integer for the public error table.
    pub fn code(&self) -> u16 {
        self.kind().code()
    }

    /// Alert dispatched on the wire for handshake-time failures. A peer's
    /// own alert is never answered with another alert.
    pub fn alert(&self) -> Option<u8> {
        match self {
            HandshakeError::PeerAlert(_) => None,
            other => other.kind().alert(),
        }
    }
}
