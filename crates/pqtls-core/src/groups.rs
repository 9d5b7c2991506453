//! Static catalog of ECDHE curves, KEMs and the hybrid groups pairing them.
//!
//! Every record here is process-lifetime immutable and compared by IANA
//! identifier, never by address. The catalog is the single source of truth
//! for wire identifiers and share sizes; runtime availability is layered on
//! top by [`crate::registry::Registry`].

/// Classical ECDHE curve identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CurveId {
    Secp256r1,
    Secp384r1,
    Secp521r1,
    X25519,
}

/// Post-quantum KEM identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KemId {
    Kyber512R3,
    Kyber768R3,
    Kyber1024R3,
    MlKem768,
    MlKem1024,
}

impl KemId {
    /// True for the FIPS-203 final KEMs, which older providers may lack.
    pub fn is_mlkem(self) -> bool {
        matches!(self, KemId::MlKem768 | KemId::MlKem1024)
    }
}

/// An ECDHE curve as negotiated in the `supported_groups` extension.
#[derive(Debug, PartialEq, Eq)]
pub struct EcCurve {
    pub id: CurveId,
    pub iana_id: u16,
    pub name: &'static str,
    /// Size of the public share on the wire (SEC1 uncompressed point for the
    /// NIST curves, raw u-coordinate for x25519).
    pub share_len: usize,
}

/// A post-quantum KEM with its fixed wire sizes.
#[derive(Debug, PartialEq, Eq)]
pub struct KemAlg {
    pub id: KemId,
    pub name: &'static str,
    pub public_key_len: usize,
    pub ciphertext_len: usize,
    pub shared_secret_len: usize,
}

/// A hybrid key-exchange group: one classical curve paired with one KEM.
///
/// Identity is the IANA id. Two catalogs built by different means still agree
/// on equality as long as the ids match.
#[derive(Debug)]
pub struct KemGroup {
    pub iana_id: u16,
    pub name: &'static str,
    pub curve: &'static EcCurve,
    pub kem: &'static KemAlg,
}

impl PartialEq for KemGroup {
    fn eq(&self, other: &Self) -> bool {
        self.iana_id == other.iana_id
    }
}

impl Eq for KemGroup {}

pub const SECP256R1: EcCurve = EcCurve {
    id: CurveId::Secp256r1,
    iana_id: 0x0017,
    name: "secp256r1",
    share_len: 65,
};

pub const SECP384R1: EcCurve = EcCurve {
    id: CurveId::Secp384r1,
    iana_id: 0x0018,
    name: "secp384r1",
    share_len: 97,
};

pub const SECP521R1: EcCurve = EcCurve {
    id: CurveId::Secp521r1,
    iana_id: 0x0019,
    name: "secp521r1",
    share_len: 133,
};

pub const X25519: EcCurve = EcCurve {
    id: CurveId::X25519,
    iana_id: 0x001D,
    name: "x25519",
    share_len: 32,
};

/// Every curve the build knows about, most preferred first.
pub const ALL_CURVES: &[&EcCurve] = &[&X25519, &SECP256R1, &SECP384R1, &SECP521R1];

pub const KYBER512_R3: KemAlg = KemAlg {
    id: KemId::Kyber512R3,
    name: "kyber512r3",
    public_key_len: 800,
    ciphertext_len: 768,
    shared_secret_len: 32,
};

pub const KYBER768_R3: KemAlg = KemAlg {
    id: KemId::Kyber768R3,
    name: "kyber768r3",
    public_key_len: 1184,
    ciphertext_len: 1088,
    shared_secret_len: 32,
};

pub const KYBER1024_R3: KemAlg = KemAlg {
    id: KemId::Kyber1024R3,
    name: "kyber1024r3",
    public_key_len: 1568,
    ciphertext_len: 1568,
    shared_secret_len: 32,
};

pub const MLKEM768: KemAlg = KemAlg {
    id: KemId::MlKem768,
    name: "mlkem768",
    public_key_len: 1184,
    ciphertext_len: 1088,
    shared_secret_len: 32,
};

pub const MLKEM1024: KemAlg = KemAlg {
    id: KemId::MlKem1024,
    name: "mlkem1024",
    public_key_len: 1568,
    ciphertext_len: 1568,
    shared_secret_len: 32,
};

pub const X25519_KYBER512_R3: KemGroup = KemGroup {
    iana_id: 0x2F39,
    name: "X25519Kyber512Draft00",
    curve: &X25519,
    kem: &KYBER512_R3,
};

pub const SECP256R1_KYBER512_R3: KemGroup = KemGroup {
    iana_id: 0x2F3A,
    name: "SecP256r1Kyber512Draft00",
    curve: &SECP256R1,
    kem: &KYBER512_R3,
};

pub const X25519_KYBER768_R3: KemGroup = KemGroup {
    iana_id: 0x6399,
    name: "X25519Kyber768Draft00",
    curve: &X25519,
    kem: &KYBER768_R3,
};

pub const SECP256R1_KYBER768_R3: KemGroup = KemGroup {
    iana_id: 0x639A,
    name: "SecP256r1Kyber768Draft00",
    curve: &SECP256R1,
    kem: &KYBER768_R3,
};

pub const SECP384R1_KYBER768_R3: KemGroup = KemGroup {
    iana_id: 0x2F3C,
    name: "SecP384r1Kyber768Draft00",
    curve: &SECP384R1,
    kem: &KYBER768_R3,
};

pub const SECP521R1_KYBER1024_R3: KemGroup = KemGroup {
    iana_id: 0x2F3D,
    name: "SecP521r1Kyber1024Draft00",
    curve: &SECP521R1,
    kem: &KYBER1024_R3,
};

pub const SECP256R1_MLKEM768: KemGroup = KemGroup {
    iana_id: 0x11EB,
    name: "SecP256r1MLKEM768",
    curve: &SECP256R1,
    kem: &MLKEM768,
};

pub const X25519_MLKEM768: KemGroup = KemGroup {
    iana_id: 0x11EC,
    name: "X25519MLKEM768",
    curve: &X25519,
    kem: &MLKEM768,
};

pub const SECP384R1_MLKEM1024: KemGroup = KemGroup {
    iana_id: 0x11ED,
    name: "SecP384r1MLKEM1024",
    curve: &SECP384R1,
    kem: &MLKEM1024,
};

/// Every hybrid group the build knows about.
pub const ALL_KEM_GROUPS: &[&KemGroup] = &[
    &X25519_MLKEM768,
    &SECP256R1_MLKEM768,
    &SECP384R1_MLKEM1024,
    &X25519_KYBER512_R3,
    &SECP256R1_KYBER512_R3,
    &X25519_KYBER768_R3,
    &SECP256R1_KYBER768_R3,
    &SECP384R1_KYBER768_R3,
    &SECP521R1_KYBER1024_R3,
];

/// Look up a hybrid group by IANA id.
pub fn kem_group_by_id(iana_id: u16) -> Option<&'static KemGroup> {
    ALL_KEM_GROUPS
        .iter()
        .copied()
        .find(|g| g.iana_id == iana_id)
}

/// Look up a curve by IANA id.
pub fn curve_by_id(iana_id: u16) -> Option<&'static EcCurve> {
    ALL_CURVES.iter().copied().find(|c| c.iana_id == iana_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_ids_are_unique() {
        for (i, a) in ALL_KEM_GROUPS.iter().enumerate() {
            for b in &ALL_KEM_GROUPS[i + 1..] {
                assert_ne!(a.iana_id, b.iana_id, "{} vs {}", a.name, b.name);
            }
        }
        for (i, a) in ALL_CURVES.iter().enumerate() {
            for b in &ALL_CURVES[i + 1..] {
                assert_ne!(a.iana_id, b.iana_id);
            }
        }
    }

    #[test]
    fn lookup_by_id_round_trips() {
        for group in ALL_KEM_GROUPS {
            assert_eq!(kem_group_by_id(group.iana_id), Some(*group));
        }
        for curve in ALL_CURVES {
            assert_eq!(curve_by_id(curve.iana_id).map(|c| c.iana_id), Some(curve.iana_id));
        }
        assert!(kem_group_by_id(0x0017).is_none());
        assert!(curve_by_id(0x2F39).is_none());
    }

    #[test]
    fn mlkem_groups_are_flagged() {
        assert!(X25519_MLKEM768.kem.id.is_mlkem());
        assert!(SECP384R1_MLKEM1024.kem.id.is_mlkem());
        assert!(!SECP521R1_KYBER1024_R3.kem.id.is_mlkem());
    }
}
