//! Key-exchange selection.
//!
//! This module is the only place the negotiation rule lives: the production
//! server path and the predictive helpers used by the handshake tests both
//! consume it. The rule, applied first to hybrid groups and then to classical
//! curves:
//!
//! 1. *1-RTT fast path.* If the peer's most preferred mutual entry arrived
//!    with a key share, take it, even when a later entry would rank higher on
//!    our own list. A retry round-trip costs more than the marginal
//!    preference gain.
//! 2. Otherwise walk our own list in order and take the first mutual entry.
//!    If the peer sent no share for it, a HelloRetryRequest is required.
//!
//! A hybrid intersection always beats a classical one; peers offering
//! post-quantum groups opted into the extra cost deliberately.

use thiserror::Error;
use tracing::debug;

use crate::error::ErrorKind;
use crate::groups::{EcCurve, KemGroup};
use crate::policy::PreferenceSet;
use crate::registry::Registry;

/// Wire encoding of a hybrid key share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Each component share carried behind a `u16` length (draft revision 0).
    LengthPrefixed,
    /// Component shares butted together (draft revision 5).
    Concatenated,
}

impl WireFormat {
    pub fn from_draft_revision(revision: u8) -> Self {
        if revision == 0 {
            WireFormat::LengthPrefixed
        } else {
            WireFormat::Concatenated
        }
    }

    pub fn is_length_prefixed(self) -> bool {
        matches!(self, WireFormat::LengthPrefixed)
    }
}

/// Outcome of selection: exactly one variant, never both, once set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selected {
    Hybrid {
        group: &'static KemGroup,
        /// Mirrors the client's observed share encoding. The client is
        /// authoritative; the server adopts whatever it parsed.
        len_prefixed: bool,
    },
    Classical {
        curve: &'static EcCurve,
    },
}

impl Selected {
    pub fn kem_group(&self) -> Option<&'static KemGroup> {
        match self {
            Selected::Hybrid { group, .. } => Some(group),
            Selected::Classical { .. } => None,
        }
    }

    pub fn curve(&self) -> Option<&'static EcCurve> {
        match self {
            Selected::Hybrid { .. } => None,
            Selected::Classical { curve } => Some(curve),
        }
    }

    /// IANA id carried in the ServerHello / HelloRetryRequest.
    pub fn group_id(&self) -> u16 {
        match self {
            Selected::Hybrid { group, .. } => group.iana_id,
            Selected::Classical { curve } => curve.iana_id,
        }
    }
}

/// What the server learned from a ClientHello.
#[derive(Debug, Clone, Default)]
pub struct ClientOffer {
    /// `supported_groups` in client priority order (hybrid ids and curve ids
    /// mixed in one list).
    pub supported_groups: Vec<u16>,
    /// Groups for which the client actually attached a key share.
    pub key_share_groups: Vec<u16>,
    /// Encoding observed while parsing the client's hybrid share, when one
    /// was present.
    pub hybrid_format: Option<WireFormat>,
}

impl ClientOffer {
    pub fn has_key_share(&self, iana_id: u16) -> bool {
        self.key_share_groups.contains(&iana_id)
    }
}

/// Result of running the selection rule against one ClientHello.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub selected: Selected,
    pub requires_hrr: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("no mutually supported key-exchange group")]
    NoMutualGroup,
}

impl SelectionError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::NoMutualGroup
    }
}

/// Server-side selection over a parsed ClientHello.
///
/// Pure: same inputs, same output. Duplicate ids in the peer list resolve to
/// their earliest occurrence; later ones are invisible.
pub fn select(
    registry: &Registry,
    local: &PreferenceSet,
    offer: &ClientOffer,
) -> Result<Selection, SelectionError> {
    if let Some(selection) = select_hybrid(registry, local, offer) {
        debug!(
            group = selection.selected.kem_group().map(|g| g.name),
            hrr = selection.requires_hrr,
            "selected hybrid key exchange"
        );
        return Ok(selection);
    }

    if let Some(selection) = select_classical(registry, local, offer) {
        debug!(
            curve = selection.selected.curve().map(|c| c.name),
            hrr = selection.requires_hrr,
            "selected classical key exchange"
        );
        return Ok(selection);
    }

    Err(SelectionError::NoMutualGroup)
}

fn select_hybrid(
    registry: &Registry,
    local: &PreferenceSet,
    offer: &ClientOffer,
) -> Option<Selection> {
    let peer_groups = offered_kem_groups(registry, offer);
    let local_groups: Vec<&'static KemGroup> = local
        .kem_groups
        .iter()
        .copied()
        .filter(|g| registry.is_available(g))
        .collect();

    let len_prefixed = offer
        .hybrid_format
        .map(WireFormat::is_length_prefixed)
        .unwrap_or(false);

    // 1-RTT fast path: honor the client's top offer when it came with a share.
    if let Some(head) = peer_groups.first().copied() {
        if offer.has_key_share(head.iana_id)
            && local_groups.iter().any(|g| g.iana_id == head.iana_id)
        {
            return Some(Selection {
                selected: Selected::Hybrid {
                    group: head,
                    len_prefixed,
                },
                requires_hrr: false,
            });
        }
    }

    for candidate in local_groups.iter().copied() {
        if peer_groups.iter().any(|g| g.iana_id == candidate.iana_id) {
            return Some(Selection {
                selected: Selected::Hybrid {
                    group: candidate,
                    len_prefixed,
                },
                requires_hrr: !offer.has_key_share(candidate.iana_id),
            });
        }
    }

    None
}

fn select_classical(
    registry: &Registry,
    local: &PreferenceSet,
    offer: &ClientOffer,
) -> Option<Selection> {
    let peer_curves = offered_curves(registry, offer);
    let local_curves: Vec<&'static EcCurve> = local
        .curves
        .iter()
        .copied()
        .filter(|c| registry.curve_is_available(c))
        .collect();

    if let Some(head) = peer_curves.first().copied() {
        if offer.has_key_share(head.iana_id)
            && local_curves.iter().any(|c| c.iana_id == head.iana_id)
        {
            return Some(Selection {
                selected: Selected::Classical { curve: head },
                requires_hrr: false,
            });
        }
    }

    for candidate in local_curves.iter().copied() {
        if peer_curves.iter().any(|c| c.iana_id == candidate.iana_id) {
            return Some(Selection {
                selected: Selected::Classical { curve: candidate },
                requires_hrr: !offer.has_key_share(candidate.iana_id),
            });
        }
    }

    None
}

fn offered_kem_groups(registry: &Registry, offer: &ClientOffer) -> Vec<&'static KemGroup> {
    let mut out: Vec<&'static KemGroup> = Vec::new();
    for id in &offer.supported_groups {
        if let Some(group) = registry.group_by_id(*id) {
            if registry.is_available(group) && !out.iter().any(|g| g.iana_id == group.iana_id) {
                out.push(group);
            }
        }
    }
    out
}

fn offered_curves(registry: &Registry, offer: &ClientOffer) -> Vec<&'static EcCurve> {
    let mut out: Vec<&'static EcCurve> = Vec::new();
    for id in &offer.supported_groups {
        if let Some(curve) = registry.curve_by_id(*id) {
            if registry.curve_is_available(curve) && !out.iter().any(|c| c.iana_id == curve.iana_id)
            {
                out.push(curve);
            }
        }
    }
    out
}

/// Predict which hybrid group two policies negotiate, without running a
/// handshake. Clients offer a share for their most preferred group, so that
/// entry wins whenever it is mutual; otherwise the server's order decides and
/// a retry round is implied. Availability is checked exactly once per
/// candidate.
pub fn predicted_kem_group(
    registry: &Registry,
    client: &PreferenceSet,
    server: &PreferenceSet,
) -> Option<&'static KemGroup> {
    let client_available: Vec<&'static KemGroup> = client
        .kem_groups
        .iter()
        .copied()
        .filter(|g| registry.is_available(g))
        .collect();
    let client_default = client_available.first().copied()?;

    for server_group in &server.kem_groups {
        if registry.is_available(server_group) && server_group.iana_id == client_default.iana_id {
            return Some(client_default);
        }
    }

    for server_group in &server.kem_groups {
        if !registry.is_available(server_group) {
            continue;
        }
        for client_group in client_available[1..].iter().copied() {
            if client_group.iana_id == server_group.iana_id {
                return Some(client_group);
            }
        }
    }

    None
}

/// Classical counterpart of [`predicted_kem_group`].
pub fn predicted_ecdhe_curve(
    registry: &Registry,
    client: &PreferenceSet,
    server: &PreferenceSet,
) -> Option<&'static EcCurve> {
    let client_available: Vec<&'static EcCurve> = client
        .curves
        .iter()
        .copied()
        .filter(|c| registry.curve_is_available(c))
        .collect();
    let client_default = client_available.first().copied()?;

    for server_curve in &server.curves {
        if registry.curve_is_available(server_curve)
            && server_curve.iana_id == client_default.iana_id
        {
            return Some(client_default);
        }
    }

    for server_curve in &server.curves {
        if !registry.curve_is_available(server_curve) {
            continue;
        }
        for client_curve in client_available[1..].iter().copied() {
            if client_curve.iana_id == server_curve.iana_id {
                return Some(client_curve);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::{
        SECP256R1, SECP256R1_KYBER768_R3, SECP384R1_KYBER768_R3, SECP521R1_KYBER1024_R3, X25519,
        X25519_KYBER512_R3, X25519_MLKEM768,
    };
    use crate::registry::CapabilityProbe;

    fn offer_for(policy: &PreferenceSet, with_shares: bool) -> ClientOffer {
        let mut supported_groups: Vec<u16> =
            policy.kem_groups.iter().map(|g| g.iana_id).collect();
        supported_groups.extend(policy.curves.iter().map(|c| c.iana_id));

        let mut key_share_groups = Vec::new();
        if with_shares {
            if let Some(group) = policy.kem_groups.first() {
                key_share_groups.push(group.iana_id);
            }
            if let Some(curve) = policy.curves.first() {
                key_share_groups.push(curve.iana_id);
            }
        }

        ClientOffer {
            supported_groups,
            key_share_groups,
            hybrid_format: if with_shares && !policy.kem_groups.is_empty() {
                Some(WireFormat::from_draft_revision(policy.hybrid_draft_revision))
            } else {
                None
            },
        }
    }

    #[test]
    fn honors_client_head_group_in_one_rtt() {
        let registry = Registry::default();
        let client = PreferenceSet::pq_tls_1_0_2021_05();
        let server = PreferenceSet::pq_tls_1_0_2021_05();
        let selection = select(&registry, &server, &offer_for(&client, true)).expect("select");
        assert_eq!(
            selection.selected.kem_group().map(|g| g.iana_id),
            Some(X25519_KYBER512_R3.iana_id)
        );
        assert!(!selection.requires_hrr);
    }

    #[test]
    fn server_order_decides_when_client_head_not_mutual() {
        let registry = Registry::default();
        // Client leads with Kyber-768 groups; the server only knows Kyber-512.
        let client = PreferenceSet::pq_tls_1_2_2023_10();
        let server = PreferenceSet::pq_tls_1_0_2021_05().with_kem_groups(&[&X25519_KYBER512_R3]);
        let selection = select(&registry, &server, &offer_for(&client, true)).expect("select");
        assert_eq!(
            selection.selected.kem_group().map(|g| g.iana_id),
            Some(X25519_KYBER512_R3.iana_id)
        );
        // The share the client sent was for its head group, so a retry is due.
        assert!(selection.requires_hrr);
    }

    #[test]
    fn pq_wins_over_classical_whenever_mutual() {
        let registry = Registry::default();
        let client = PreferenceSet::pq_tls_1_2_2023_10();
        let server = PreferenceSet::pq_tls_1_2_2023_10();
        let selection = select(&registry, &server, &offer_for(&client, true)).expect("select");
        assert_eq!(
            selection.selected.kem_group().map(|g| g.iana_id),
            Some(SECP256R1_KYBER768_R3.iana_id)
        );
        assert!(!selection.requires_hrr);
    }

    #[test]
    fn falls_back_to_classical_when_server_has_no_pq() {
        let registry = Registry::default();
        let client = PreferenceSet::pq_tls_1_0_2021_05();
        let server = PreferenceSet::classical();
        let selection = select(&registry, &server, &offer_for(&client, true)).expect("select");
        assert_eq!(
            selection.selected.curve().map(|c| c.iana_id),
            Some(X25519.iana_id)
        );
        assert!(!selection.requires_hrr);
    }

    #[test]
    fn missing_share_for_mutual_curve_forces_hrr() {
        let registry = Registry::default();
        let client = PreferenceSet::pq_tls_1_0_2021_05().with_deferred_ec_share();
        let server = PreferenceSet::classical();
        let mut offer = offer_for(&client, true);
        // Deferred classical share: only the hybrid share went out.
        offer.key_share_groups.retain(|id| *id != X25519.iana_id);
        let selection = select(&registry, &server, &offer).expect("select");
        assert_eq!(
            selection.selected.curve().map(|c| c.iana_id),
            Some(X25519.iana_id)
        );
        assert!(selection.requires_hrr);
    }

    #[test]
    fn pq_disabled_probe_skips_hybrid_entirely() {
        let registry = Registry::new(CapabilityProbe::classical_only());
        let client = PreferenceSet::pq_tls_1_0_2021_05();
        let server = PreferenceSet::pq_tls_1_0_2021_05();
        let selection = select(&registry, &server, &offer_for(&client, true)).expect("select");
        assert!(selection.selected.curve().is_some());
    }

    #[test]
    fn no_intersection_is_an_error() {
        let registry = Registry::default();
        let server = PreferenceSet::classical().with_curves(&[&SECP256R1]);
        let offer = ClientOffer {
            supported_groups: vec![X25519.iana_id],
            key_share_groups: vec![X25519.iana_id],
            hybrid_format: None,
        };
        assert_eq!(
            select(&registry, &server, &offer),
            Err(SelectionError::NoMutualGroup)
        );
    }

    #[test]
    fn duplicate_offered_ids_resolve_to_first_occurrence() {
        let registry = Registry::default();
        let server = PreferenceSet::pq_tls_1_0_2021_05();
        let offer = ClientOffer {
            supported_groups: vec![
                X25519_KYBER512_R3.iana_id,
                X25519_KYBER512_R3.iana_id,
                X25519.iana_id,
            ],
            key_share_groups: vec![X25519_KYBER512_R3.iana_id],
            hybrid_format: Some(WireFormat::LengthPrefixed),
        };
        let selection = select(&registry, &server, &offer).expect("select");
        assert_eq!(
            selection.selected,
            Selected::Hybrid {
                group: &X25519_KYBER512_R3,
                len_prefixed: true,
            }
        );
    }

    #[test]
    fn selection_is_deterministic() {
        let registry = Registry::default();
        let client = PreferenceSet::pq_tls_1_2_2023_10();
        let server = PreferenceSet::pq_tls_1_0_2023_01();
        let offer = offer_for(&client, true);
        let first = select(&registry, &server, &offer).expect("select");
        let second = select(&registry, &server, &offer).expect("select");
        assert_eq!(first, second);
    }

    #[test]
    fn predicted_kem_group_matches_fast_path() {
        let registry = Registry::default();
        let client = PreferenceSet::pq_tls_1_0_2021_05();
        let server = PreferenceSet::pq_tls_1_2_2023_10();
        // Client default is on the server list, so it wins despite ranking last.
        assert_eq!(
            predicted_kem_group(&registry, &client, &server).map(|g| g.iana_id),
            Some(X25519_KYBER512_R3.iana_id)
        );
    }

    #[test]
    fn predicted_kem_group_uses_server_order_for_retries() {
        let registry = Registry::default();
        let client = PreferenceSet::default_pq().with_kem_groups(&[
            &SECP521R1_KYBER1024_R3,
            &SECP256R1_KYBER768_R3,
        ]);
        let server = PreferenceSet::pq_tls_1_2_2023_10()
            .with_kem_groups(&[&SECP256R1_KYBER768_R3, &SECP384R1_KYBER768_R3]);
        assert_eq!(
            predicted_kem_group(&registry, &client, &server).map(|g| g.iana_id),
            Some(SECP256R1_KYBER768_R3.iana_id)
        );
    }

    #[test]
    fn predicted_kem_group_respects_availability() {
        let registry = Registry::new(CapabilityProbe::full().without_mlkem());
        let client = PreferenceSet::default_pq().with_kem_groups(&[&X25519_MLKEM768]);
        let server = PreferenceSet::default_pq();
        assert_eq!(predicted_kem_group(&registry, &client, &server), None);
    }

    #[test]
    fn predicted_curve_follows_the_same_rule() {
        let registry = Registry::default();
        let client = PreferenceSet::classical();
        let server = PreferenceSet::classical().with_curves(&[&SECP256R1, &X25519]);
        assert_eq!(
            predicted_ecdhe_curve(&registry, &client, &server).map(|c| c.iana_id),
            Some(X25519.iana_id)
        );
    }
}
