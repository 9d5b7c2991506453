//! Hybrid key-share generation and processing.
//!
//! The exchanger owns the byte-level flow of §(EC)DHE material: generating
//! shares for ClientHello, answering them from ServerHello, and combining
//! the classical and post-quantum secrets in their fixed order (classical
//! first, KEM second) for the key schedule.

use zeroize::Zeroizing;

use pqtls_core::groups::{EcCurve, KemGroup};
use pqtls_core::select::WireFormat;
use pqtls_core::wire::{encode_hybrid_share, parse_hybrid_share_as};
use pqtls_crypto::{CryptoProvider, EcdhKeyPair, KemKeyPair, SecretBytes};

use crate::error::HandshakeError;

/// Client-side state for one generated hybrid share.
#[derive(Debug)]
pub(crate) struct HybridShare {
    pub group: &'static KemGroup,
    pub ec: EcdhKeyPair,
    pub kem: KemKeyPair,
}

/// Client-side state for one generated classical share.
#[derive(Debug)]
pub(crate) struct EcShare {
    pub curve: &'static EcCurve,
    pub ec: EcdhKeyPair,
}

/// Generate a hybrid share for the ClientHello: fresh ECDH and KEM key
/// pairs, payload encoded per the agreed wire format.
pub(crate) fn generate_hybrid_share(
    provider: &dyn CryptoProvider,
    group: &'static KemGroup,
    format: WireFormat,
) -> Result<(HybridShare, Vec<u8>), HandshakeError> {
    let ec = provider.ecdh_keygen(group.curve)?;
    let kem = provider.kem_keygen(group.kem)?;
    let payload = encode_hybrid_share(&ec.public, &kem.public, format);
    Ok((HybridShare { group, ec, kem }, payload))
}

pub(crate) fn generate_ec_share(
    provider: &dyn CryptoProvider,
    curve: &'static EcCurve,
) -> Result<(EcShare, Vec<u8>), HandshakeError> {
    let ec = provider.ecdh_keygen(curve)?;
    let payload = ec.public.clone();
    Ok((EcShare { curve, ec }, payload))
}

/// Server side of a hybrid exchange: parse the client share, run ECDH
/// against its classical component, encapsulate to its KEM public key, and
/// emit the mirrored payload carrying our EC share and the KEM ciphertext.
pub(crate) fn respond_hybrid(
    provider: &dyn CryptoProvider,
    group: &'static KemGroup,
    format: WireFormat,
    client_payload: &[u8],
) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>), HandshakeError> {
    let (client_ec, client_kem_public) = parse_hybrid_share_as(
        client_payload,
        group.curve.share_len,
        group.kem.public_key_len,
        format,
    )?;

    let ec = provider.ecdh_keygen(group.curve)?;
    let ec_shared = provider.ecdh(group.curve, &ec.private, client_ec)?;
    let (ciphertext, kem_shared) = provider.kem_encapsulate(group.kem, client_kem_public)?;

    let payload = encode_hybrid_share(&ec.public, &ciphertext, format);
    Ok((payload, combine(&ec_shared, Some(&kem_shared))))
}

/// Client side of a hybrid exchange: parse the server's mirrored payload,
/// run ECDH against its classical component and decapsulate the ciphertext
/// with our KEM private key.
pub(crate) fn complete_hybrid(
    provider: &dyn CryptoProvider,
    share: &HybridShare,
    format: WireFormat,
    server_payload: &[u8],
) -> Result<Zeroizing<Vec<u8>>, HandshakeError> {
    let (server_ec, ciphertext) = parse_hybrid_share_as(
        server_payload,
        share.group.curve.share_len,
        share.group.kem.ciphertext_len,
        format,
    )?;

    let ec_shared = provider.ecdh(share.group.curve, &share.ec.private, server_ec)?;
    let kem_shared = provider.kem_decapsulate(share.group.kem, &share.kem.private, ciphertext)?;
    Ok(combine(&ec_shared, Some(&kem_shared)))
}

/// Server side of a classical exchange.
pub(crate) fn respond_classical(
    provider: &dyn CryptoProvider,
    curve: &'static EcCurve,
    client_payload: &[u8],
) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>), HandshakeError> {
    if client_payload.len() != curve.share_len {
        return Err(HandshakeError::Wire(
            pqtls_core::wire::WireError::LengthOverflow,
        ));
    }
    let ec = provider.ecdh_keygen(curve)?;
    let shared = provider.ecdh(curve, &ec.private, client_payload)?;
    Ok((ec.public.clone(), combine(&shared, None)))
}

/// Client side of a classical exchange.
pub(crate) fn complete_classical(
    provider: &dyn CryptoProvider,
    share: &EcShare,
    server_payload: &[u8],
) -> Result<Zeroizing<Vec<u8>>, HandshakeError> {
    if server_payload.len() != share.curve.share_len {
        return Err(HandshakeError::Wire(
            pqtls_core::wire::WireError::LengthOverflow,
        ));
    }
    let shared = provider.ecdh(share.curve, &share.ec.private, server_payload)?;
    Ok(combine(&shared, None))
}

/// Fixed ordering: classical secret first, post-quantum second.
fn combine(ec_shared: &SecretBytes, kem_shared: Option<&SecretBytes>) -> Zeroizing<Vec<u8>> {
    let kem_len = kem_shared.map(|s| s.len()).unwrap_or(0);
    let mut out = Zeroizing::new(Vec::with_capacity(ec_shared.len() + kem_len));
    out.extend_from_slice(ec_shared.as_bytes());
    if let Some(kem) = kem_shared {
        out.extend_from_slice(kem.as_bytes());
    }
    out
}
