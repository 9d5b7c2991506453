//! The library's public error table.
//!
//! Every failure surfaced by the stack collapses into one of five kinds, each
//! with a stable integer code and, for handshake-time failures, the TLS alert
//! dispatched before the connection aborts.

use std::fmt;

/// TLS alert descriptions used by this stack.
pub mod alert {
    pub const HANDSHAKE_FAILURE: u8 = 40;
    pub const ILLEGAL_PARAMETER: u8 = 47;
    pub const DECODE_ERROR: u8 = 50;
    pub const INTERNAL_ERROR: u8 = 80;
}

/// Stable classification of every error the stack can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Selection found no mutually supported group or curve.
    NoMutualGroup,
    /// Peer sent a share for a group it never offered, or an invalid share
    /// after a HelloRetryRequest.
    IllegalParameter,
    /// Wire-format mismatch or malformed message.
    DecodeError,
    /// An underlying primitive failed. Deliberately indistinguishable from
    /// other internal failures on the wire so KEM decapsulation errors leak
    /// nothing before MAC verification.
    CryptoFailure,
    /// A group was requested whose runtime availability probe is false.
    /// Surfaced at configuration time, never mid-handshake.
    Unavailable,
}

impl ErrorKind {
    /// Stable integer for the public error table.
    pub fn code(self) -> u16 {
        match self {
            ErrorKind::NoMutualGroup => 1,
            ErrorKind::IllegalParameter => 2,
            ErrorKind::DecodeError => 3,
            ErrorKind::CryptoFailure => 4,
            ErrorKind::Unavailable => 5,
        }
    }

    /// Alert description dispatched on the wire, if the failure happens
    /// during a handshake.
    pub fn alert(self) -> Option<u8> {
        match self {
            ErrorKind::NoMutualGroup => Some(alert::HANDSHAKE_FAILURE),
            ErrorKind::IllegalParameter => Some(alert::ILLEGAL_PARAMETER),
            ErrorKind::DecodeError => Some(alert::DECODE_ERROR),
            ErrorKind::CryptoFailure => Some(alert::INTERNAL_ERROR),
            ErrorKind::Unavailable => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorKind::NoMutualGroup => "no mutually supported key-exchange group",
            ErrorKind::IllegalParameter => "peer violated negotiation rules",
            ErrorKind::DecodeError => "malformed or mismatched wire format",
            ErrorKind::CryptoFailure => "crypto provider failure",
            ErrorKind::Unavailable => "group unavailable with the linked provider",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_and_distinct() {
        let kinds = [
            ErrorKind::NoMutualGroup,
            ErrorKind::IllegalParameter,
            ErrorKind::DecodeError,
            ErrorKind::CryptoFailure,
            ErrorKind::Unavailable,
        ];
        let codes: Vec<u16> = kinds.iter().map(|k| k.code()).collect();
        assert_eq!(codes, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn only_configuration_errors_lack_an_alert() {
        assert_eq!(ErrorKind::NoMutualGroup.alert(), Some(alert::HANDSHAKE_FAILURE));
        assert_eq!(ErrorKind::IllegalParameter.alert(), Some(alert::ILLEGAL_PARAMETER));
        assert_eq!(ErrorKind::DecodeError.alert(), Some(alert::DECODE_ERROR));
        assert_eq!(ErrorKind::CryptoFailure.alert(), Some(alert::INTERNAL_ERROR));
        assert_eq!(ErrorKind::Unavailable.alert(), None);
    }
}
