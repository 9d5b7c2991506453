//! Per-connection configuration.

use std::sync::Arc;

use pqtls_core::policy::PreferenceSet;
use pqtls_core::registry::{CapabilityProbe, Registry};
use pqtls_crypto::{probe_provider, CryptoProvider, RustCryptoProvider};

/// Everything a [`crate::Connection`] needs besides its role: the security
/// policy, the availability registry and the crypto provider. The registry
/// is derived from the provider's capability probe once, at construction.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    policy: PreferenceSet,
    registry: Registry,
    provider: Arc<dyn CryptoProvider>,
}

impl ConnectionConfig {
    pub fn new(policy: PreferenceSet) -> Self {
        let provider: Arc<dyn CryptoProvider> = Arc::new(RustCryptoProvider);
        let registry = Registry::new(probe_provider(provider.as_ref()));
        Self {
            policy,
            registry,
            provider,
        }
    }

    /// Swap in a different crypto provider; availability is re-probed.
    pub fn with_provider(mut self, provider: Arc<dyn CryptoProvider>) -> Self {
        self.registry = Registry::new(probe_provider(provider.as_ref()));
        self.provider = provider;
        self
    }

    /// Override the availability probe, e.g. to reproduce an older provider
    /// that lacks ML-KEM or x25519.
    pub fn with_probe(mut self, probe: CapabilityProbe) -> Self {
        self.registry = Registry::new(probe);
        self
    }

    pub fn policy(&self) -> &PreferenceSet {
        &self.policy
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn provider(&self) -> &dyn CryptoProvider {
        self.provider.as_ref()
    }

    /// First policy group the provider can actually run, if any.
    pub(crate) fn first_available_kem_group(
        &self,
    ) -> Option<&'static pqtls_core::groups::KemGroup> {
        self.policy
            .kem_groups
            .iter()
            .copied()
            .find(|g| self.registry.is_available(g))
    }

    pub(crate) fn first_available_curve(&self) -> Option<&'static pqtls_core::groups::EcCurve> {
        self.policy
            .curves
            .iter()
            .copied()
            .find(|c| self.registry.curve_is_available(c))
    }
}
