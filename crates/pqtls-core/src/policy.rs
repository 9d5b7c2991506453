//! Named security policies binding ordered preference lists.
//!
//! A policy is a versioned, immutable bundle: which hybrid groups and curves
//! a peer offers (order = priority), which hybrid-draft revision its wire
//! encoding follows, and which cipher suites it accepts. Canonical policies
//! are looked up by name; test code builds ad-hoc sets with the `with_*`
//! modifiers.

use crate::groups::{
    EcCurve, KemGroup, SECP256R1, SECP256R1_KYBER512_R3, SECP256R1_KYBER768_R3,
    SECP256R1_MLKEM768, SECP384R1, SECP384R1_KYBER768_R3, SECP384R1_MLKEM1024, SECP521R1,
    SECP521R1_KYBER1024_R3, X25519, X25519_KYBER512_R3, X25519_KYBER768_R3, X25519_MLKEM768,
};

/// TLS 1.3 AEAD cipher suites this stack negotiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    Aes128GcmSha256,
    Aes256GcmSha384,
}

impl CipherSuite {
    pub fn iana_id(self) -> u16 {
        match self {
            CipherSuite::Aes128GcmSha256 => 0x1301,
            CipherSuite::Aes256GcmSha384 => 0x1302,
        }
    }

    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            0x1301 => Some(CipherSuite::Aes128GcmSha256),
            0x1302 => Some(CipherSuite::Aes256GcmSha384),
            _ => None,
        }
    }

    /// Width of the suite's transcript hash and of every derived secret.
    pub fn hash_len(self) -> usize {
        match self {
            CipherSuite::Aes128GcmSha256 => 32,
            CipherSuite::Aes256GcmSha384 => 48,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CipherSuite::Aes128GcmSha256 => "TLS_AES_128_GCM_SHA256",
            CipherSuite::Aes256GcmSha384 => "TLS_AES_256_GCM_SHA384",
        }
    }
}

/// Minimum protocol version a policy tolerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls10,
    Tls12,
    Tls13,
}

impl TlsVersion {
    pub fn wire(self) -> u16 {
        match self {
            TlsVersion::Tls10 => 0x0301,
            TlsVersion::Tls12 => 0x0303,
            TlsVersion::Tls13 => 0x0304,
        }
    }
}

/// Which key shares the ClientHello carries up front.
///
/// `supported_groups` always advertises the full preference lists; this only
/// controls whether a generated share accompanies the head of each list. A
/// client that defers its classical share forces the server through a
/// HelloRetryRequest round when no hybrid group is mutual.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialKeyShares {
    pub pq: bool,
    pub ec: bool,
}

impl Default for InitialKeyShares {
    fn default() -> Self {
        Self { pq: true, ec: true }
    }
}

/// An ordered key-exchange preference set, tagged with the hybrid-draft
/// revision its wire format follows.
///
/// Invariant: no duplicate IANA id within either list. The constructor
/// enforces it by keeping the earliest occurrence and dropping the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreferenceSet {
    pub name: &'static str,
    pub kem_groups: Vec<&'static KemGroup>,
    pub curves: Vec<&'static EcCurve>,
    pub cipher_suites: Vec<CipherSuite>,
    /// 0 = concatenated hybrid shares, 5 = length-prefixed.
    pub hybrid_draft_revision: u8,
    pub min_tls_version: TlsVersion,
    pub initial_key_shares: InitialKeyShares,
}

impl PreferenceSet {
    pub fn new(
        name: &'static str,
        kem_groups: &[&'static KemGroup],
        curves: &[&'static EcCurve],
    ) -> Self {
        Self {
            name,
            kem_groups: dedup_by_id(kem_groups, |g| g.iana_id),
            curves: dedup_by_id(curves, |c| c.iana_id),
            cipher_suites: vec![CipherSuite::Aes128GcmSha256, CipherSuite::Aes256GcmSha384],
            hybrid_draft_revision: 5,
            min_tls_version: TlsVersion::Tls13,
            initial_key_shares: InitialKeyShares::default(),
        }
    }

    /// Look up a canonical policy by name.
    pub fn named(name: &str) -> Option<Self> {
        match name {
            "default_pq" => Some(Self::default_pq()),
            "20250721" => Some(Self::dated_20250721()),
            "PQ-TLS-1-2-2023-10" => Some(Self::pq_tls_1_2_2023_10()),
            "PQ-TLS-1-0-2021-05" => Some(Self::pq_tls_1_0_2021_05()),
            "PQ-TLS-1-0-2023-01" => Some(Self::pq_tls_1_0_2023_01()),
            "classical" => Some(Self::classical()),
            _ => None,
        }
    }

    /// The recommended post-quantum policy: alias of the newest dated one.
    pub fn default_pq() -> Self {
        Self {
            name: "default_pq",
            ..Self::dated_20250721()
        }
    }

    /// ML-KEM era policy. Kyber round-3 groups are retired here.
    pub fn dated_20250721() -> Self {
        Self::new(
            "20250721",
            &[&X25519_MLKEM768, &SECP256R1_MLKEM768, &SECP384R1_MLKEM1024],
            &[&X25519, &SECP256R1, &SECP384R1, &SECP521R1],
        )
    }

    /// 2023 Kyber policy: Kyber-768 first, secp256r1 preferred over x25519
    /// for the hybrid component, length-prefixed shares.
    pub fn pq_tls_1_2_2023_10() -> Self {
        Self::new(
            "PQ-TLS-1-2-2023-10",
            &[
                &SECP256R1_KYBER768_R3,
                &X25519_KYBER768_R3,
                &SECP384R1_KYBER768_R3,
                &SECP521R1_KYBER1024_R3,
                &SECP256R1_KYBER512_R3,
                &X25519_KYBER512_R3,
            ],
            &[&SECP256R1, &X25519, &SECP384R1, &SECP521R1],
        )
    }

    /// Legacy 2021 policy: Kyber-512 only, draft-0 length-prefixed shares.
    pub fn pq_tls_1_0_2021_05() -> Self {
        let mut set = Self::new(
            "PQ-TLS-1-0-2021-05",
            &[&X25519_KYBER512_R3, &SECP256R1_KYBER512_R3],
            &[&X25519, &SECP256R1, &SECP384R1, &SECP521R1],
        );
        set.hybrid_draft_revision = 0;
        set.min_tls_version = TlsVersion::Tls10;
        set
    }

    /// Same group order as the 2021 policy but speaking draft revision 5.
    pub fn pq_tls_1_0_2023_01() -> Self {
        let mut set = Self::pq_tls_1_0_2021_05();
        set.name = "PQ-TLS-1-0-2023-01";
        set.hybrid_draft_revision = 5;
        set
    }

    /// Classical-only policy: no hybrid groups at all.
    pub fn classical() -> Self {
        Self::new(
            "classical",
            &[],
            &[&X25519, &SECP256R1, &SECP384R1, &SECP521R1],
        )
    }

    pub fn with_kem_groups(mut self, kem_groups: &[&'static KemGroup]) -> Self {
        self.kem_groups = dedup_by_id(kem_groups, |g| g.iana_id);
        self
    }

    pub fn with_curves(mut self, curves: &[&'static EcCurve]) -> Self {
        self.curves = dedup_by_id(curves, |c| c.iana_id);
        self
    }

    pub fn with_draft_revision(mut self, revision: u8) -> Self {
        debug_assert!(revision == 0 || revision == 5);
        self.hybrid_draft_revision = revision;
        self
    }

    pub fn with_cipher_suites(mut self, suites: &[CipherSuite]) -> Self {
        self.cipher_suites = suites.to_vec();
        self
    }

    /// Advertise curves but send no classical share in the first ClientHello.
    pub fn with_deferred_ec_share(mut self) -> Self {
        self.initial_key_shares.ec = false;
        self
    }

    /// Revision 0 of the hybrid draft length-prefixes each share component;
    /// revision 5 switched to plain concatenation.
    pub fn uses_length_prefix(&self) -> bool {
        self.hybrid_draft_revision == 0
    }

    pub fn includes_kem_group(&self, iana_id: u16) -> bool {
        self.kem_groups.iter().any(|g| g.iana_id == iana_id)
    }

    pub fn includes_curve(&self, iana_id: u16) -> bool {
        self.curves.iter().any(|c| c.iana_id == iana_id)
    }
}

fn dedup_by_id<T: Copy>(items: &[T], id: impl Fn(T) -> u16) -> Vec<T> {
    let mut seen: Vec<u16> = Vec::with_capacity(items.len());
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let item_id = id(*item);
        if !seen.contains(&item_id) {
            seen.push(item_id);
            out.push(*item);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_policies_resolve_by_name() {
        for name in [
            "default_pq",
            "20250721",
            "PQ-TLS-1-2-2023-10",
            "PQ-TLS-1-0-2021-05",
            "PQ-TLS-1-0-2023-01",
            "classical",
        ] {
            let policy = PreferenceSet::named(name).expect(name);
            assert!(!policy.curves.is_empty());
        }
        assert!(PreferenceSet::named("PQ-TLS-9-9").is_none());
    }

    #[test]
    fn draft_revisions_match_policy_era() {
        assert_eq!(PreferenceSet::pq_tls_1_0_2021_05().hybrid_draft_revision, 0);
        assert_eq!(PreferenceSet::pq_tls_1_0_2023_01().hybrid_draft_revision, 5);
        assert!(PreferenceSet::pq_tls_1_0_2021_05().uses_length_prefix());
        assert!(!PreferenceSet::default_pq().uses_length_prefix());
    }

    #[test]
    fn duplicate_entries_keep_first_occurrence() {
        let set = PreferenceSet::new(
            "dup",
            &[&X25519_KYBER512_R3, &SECP256R1_KYBER768_R3, &X25519_KYBER512_R3],
            &[&X25519, &X25519, &SECP256R1],
        );
        assert_eq!(set.kem_groups.len(), 2);
        assert_eq!(set.kem_groups[0].iana_id, X25519_KYBER512_R3.iana_id);
        assert_eq!(set.curves.len(), 2);
    }

    #[test]
    fn classical_policy_has_no_kem_groups() {
        let set = PreferenceSet::classical();
        assert!(set.kem_groups.is_empty());
        assert!(set.includes_curve(X25519.iana_id));
        assert!(!set.includes_kem_group(X25519_KYBER512_R3.iana_id));
    }
}
