//! Runtime availability of catalog entries.
//!
//! A single binary may be linked against crypto providers of varying
//! capability, so whether a hybrid group is usable is probed once at
//! initialization rather than baked in at compile time.

use once_cell::sync::Lazy;

use crate::groups::{curve_by_id, kem_group_by_id, CurveId, EcCurve, KemGroup, ALL_KEM_GROUPS};

/// What the linked crypto provider can do.
///
/// Constructed from the provider at startup, or injected directly in tests to
/// reproduce the behavior of older providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityProbe {
    /// Provider exposes a generic KEM interface at all.
    pub evp_kem: bool,
    /// Provider exposes the x25519 primitive.
    pub x25519: bool,
    /// Provider exposes the final FIPS-203 ML-KEM parameter sets.
    pub mlkem: bool,
}

impl CapabilityProbe {
    /// Probe result for a provider implementing every primitive.
    pub const fn full() -> Self {
        Self {
            evp_kem: true,
            x25519: true,
            mlkem: true,
        }
    }

    /// Probe result with post-quantum exchange disabled entirely.
    pub const fn classical_only() -> Self {
        Self {
            evp_kem: false,
            x25519: true,
            mlkem: false,
        }
    }

    pub const fn without_mlkem(mut self) -> Self {
        self.mlkem = false;
        self
    }

    pub const fn without_x25519(mut self) -> Self {
        self.x25519 = false;
        self
    }
}

impl Default for CapabilityProbe {
    fn default() -> Self {
        Self::full()
    }
}

/// Catalog plus availability, computed once from a [`CapabilityProbe`].
#[derive(Debug, Clone)]
pub struct Registry {
    probe: CapabilityProbe,
    available: [bool; ALL_KEM_GROUPS.len()],
}

impl Registry {
    pub fn new(probe: CapabilityProbe) -> Self {
        let mut available = [false; ALL_KEM_GROUPS.len()];
        for (slot, group) in available.iter_mut().zip(ALL_KEM_GROUPS) {
            *slot = probe.evp_kem
                && (group.curve.id != CurveId::X25519 || probe.x25519)
                && (!group.kem.id.is_mlkem() || probe.mlkem);
        }
        Self { probe, available }
    }

    pub fn probe(&self) -> CapabilityProbe {
        self.probe
    }

    /// Every hybrid group the build knows about, available or not.
    pub fn all_groups(&self) -> &'static [&'static KemGroup] {
        ALL_KEM_GROUPS
    }

    /// Whether the linked provider can run this group.
    pub fn is_available(&self, group: &KemGroup) -> bool {
        ALL_KEM_GROUPS
            .iter()
            .position(|g| g.iana_id == group.iana_id)
            .map(|idx| self.available[idx])
            .unwrap_or(false)
    }

    /// Whether the linked provider can run this curve.
    pub fn curve_is_available(&self, curve: &EcCurve) -> bool {
        curve.id != CurveId::X25519 || self.probe.x25519
    }

    pub fn group_by_id(&self, iana_id: u16) -> Option<&'static KemGroup> {
        kem_group_by_id(iana_id)
    }

    pub fn curve_by_id(&self, iana_id: u16) -> Option<&'static EcCurve> {
        curve_by_id(iana_id)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(CapabilityProbe::full())
    }
}

/// Process-wide registry for the bundled provider, which implements every
/// primitive in the catalog.
pub fn default_registry() -> &'static Registry {
    static REGISTRY: Lazy<Registry> = Lazy::new(Registry::default);
    &REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::{
        SECP256R1_KYBER768_R3, SECP256R1_MLKEM768, SECP384R1_MLKEM1024, X25519_KYBER512_R3,
        X25519_MLKEM768,
    };

    #[test]
    fn full_probe_enables_everything() {
        let registry = Registry::new(CapabilityProbe::full());
        for group in registry.all_groups() {
            assert!(registry.is_available(group), "{}", group.name);
        }
    }

    #[test]
    fn no_evp_kem_disables_everything() {
        let registry = Registry::new(CapabilityProbe::classical_only());
        for group in registry.all_groups() {
            assert!(!registry.is_available(group), "{}", group.name);
        }
    }

    #[test]
    fn mlkem_probe_gates_mlkem_groups_only() {
        let registry = Registry::new(CapabilityProbe::full().without_mlkem());
        assert!(!registry.is_available(&X25519_MLKEM768));
        assert!(!registry.is_available(&SECP256R1_MLKEM768));
        assert!(!registry.is_available(&SECP384R1_MLKEM1024));
        assert!(registry.is_available(&X25519_KYBER512_R3));
        assert!(registry.is_available(&SECP256R1_KYBER768_R3));
    }

    #[test]
    fn x25519_probe_gates_x25519_groups() {
        let registry = Registry::new(CapabilityProbe::full().without_x25519());
        assert!(!registry.is_available(&X25519_KYBER512_R3));
        assert!(!registry.is_available(&X25519_MLKEM768));
        assert!(registry.is_available(&SECP256R1_KYBER768_R3));
        assert!(!registry.curve_is_available(&crate::groups::X25519));
        assert!(registry.curve_is_available(&crate::groups::SECP256R1));
    }
}
