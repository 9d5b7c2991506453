//! Negotiation core for the pqtls hybrid key-exchange stack.
//!
//! This crate owns everything that decides *what* gets negotiated: the static
//! group catalog, runtime availability probing, named security policies, the
//! selection engine, and the handshake wire codecs. Driving the handshake and
//! touching key material is the connection crate's job.

pub mod error;
pub mod groups;
pub mod policy;
pub mod registry;
pub mod select;
pub mod wire;

pub use error::{alert, ErrorKind};
pub use groups::{
    curve_by_id, kem_group_by_id, CurveId, EcCurve, KemAlg, KemGroup, KemId, ALL_CURVES,
    ALL_KEM_GROUPS,
};
pub use policy::{CipherSuite, InitialKeyShares, PreferenceSet, TlsVersion};
pub use registry::{default_registry, CapabilityProbe, Registry};
pub use select::{
    predicted_ecdhe_curve, predicted_kem_group, select, ClientOffer, Selected, Selection,
    SelectionError, WireFormat,
};
pub use wire::{ClientHello, KeyShareEntry, ServerHello, ServerShare, WireError};
