//! The crypto collaborator the negotiation core talks to.
//!
//! Everything is byte-level: callers hold opaque public and private material
//! and never see provider-internal types. The bundled [`RustCryptoProvider`]
//! backs the catalog with x25519-dalek, the RustCrypto NIST curves and the
//! pqcrypto KEM bindings.

use std::fmt;

use pqcrypto_traits::kem::{
    Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _,
};
use rand::rngs::OsRng;
use thiserror::Error;
use zeroize::Zeroizing;

use pqtls_core::groups::{CurveId, EcCurve, KemAlg, KemId};
use pqtls_core::registry::CapabilityProbe;
use pqtls_core::ErrorKind;

/// Describes failures inside the crypto provider. All of them surface as a
/// single internal-error kind so KEM failures stay indistinguishable on the
/// wire.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("ecdh operation failed: {0}")]
    Ecdh(&'static str),
    #[error("kem operation failed: {0}")]
    Kem(&'static str),
    #[error("key derivation failed: {0}")]
    Derive(&'static str),
}

impl CryptoError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::CryptoFailure
    }
}

/// Private key or derived secret bytes, wiped on drop.
#[derive(Clone)]
pub struct SecretBytes(Zeroizing<Vec<u8>>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes({} bytes)", self.0.len())
    }
}

/// Ephemeral ECDH key pair: wire-encoded public share plus private scalar.
#[derive(Debug, Clone)]
pub struct EcdhKeyPair {
    pub public: Vec<u8>,
    pub private: SecretBytes,
}

/// KEM key pair: wire-encoded public key plus decapsulation key.
#[derive(Debug, Clone)]
pub struct KemKeyPair {
    pub public: Vec<u8>,
    pub private: SecretBytes,
}

/// Abstract crypto provider. Fail-fast: any provider error aborts the
/// handshake.
pub trait CryptoProvider: Send + Sync + fmt::Debug {
    fn ecdh_keygen(&self, curve: &EcCurve) -> Result<EcdhKeyPair, CryptoError>;

    fn ecdh(
        &self,
        curve: &EcCurve,
        private: &SecretBytes,
        peer_public: &[u8],
    ) -> Result<SecretBytes, CryptoError>;

    fn kem_keygen(&self, kem: &KemAlg) -> Result<KemKeyPair, CryptoError>;

    fn kem_encapsulate(
        &self,
        kem: &KemAlg,
        peer_public: &[u8],
    ) -> Result<(Vec<u8>, SecretBytes), CryptoError>;

    fn kem_decapsulate(
        &self,
        kem: &KemAlg,
        private: &SecretBytes,
        ciphertext: &[u8],
    ) -> Result<SecretBytes, CryptoError>;

    fn supports_evp_kem(&self) -> bool;
    fn supports_x25519(&self) -> bool;
    fn supports_mlkem(&self) -> bool;
}

/// Build the registry probe from whatever the provider reports.
pub fn probe_provider(provider: &dyn CryptoProvider) -> CapabilityProbe {
    CapabilityProbe {
        evp_kem: provider.supports_evp_kem(),
        x25519: provider.supports_x25519(),
        mlkem: provider.supports_mlkem(),
    }
}

/// Default provider backed by the RustCrypto curve crates and the pqcrypto
/// KEM bindings. Implements the full catalog.
#[derive(Debug, Default, Clone, Copy)]
pub struct RustCryptoProvider;

impl CryptoProvider for RustCryptoProvider {
    fn ecdh_keygen(&self, curve: &EcCurve) -> Result<EcdhKeyPair, CryptoError> {
        match curve.id {
            CurveId::X25519 => {
                let secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
                let public = x25519_dalek::PublicKey::from(&secret);
                Ok(EcdhKeyPair {
                    public: public.as_bytes().to_vec(),
                    private: SecretBytes::new(secret.to_bytes().to_vec()),
                })
            }
            CurveId::Secp256r1 => {
                use p256::elliptic_curve::sec1::ToEncodedPoint;
                let secret = p256::SecretKey::random(&mut OsRng);
                let public = secret.public_key().to_encoded_point(false);
                Ok(EcdhKeyPair {
                    public: public.as_bytes().to_vec(),
                    private: SecretBytes::new(secret.to_bytes().to_vec()),
                })
            }
            CurveId::Secp384r1 => {
                use p384::elliptic_curve::sec1::ToEncodedPoint;
                let secret = p384::SecretKey::random(&mut OsRng);
                let public = secret.public_key().to_encoded_point(false);
                Ok(EcdhKeyPair {
                    public: public.as_bytes().to_vec(),
                    private: SecretBytes::new(secret.to_bytes().to_vec()),
                })
            }
            CurveId::Secp521r1 => {
                use p521::elliptic_curve::sec1::ToEncodedPoint;
                let secret = p521::SecretKey::random(&mut OsRng);
                let public = secret.public_key().to_encoded_point(false);
                Ok(EcdhKeyPair {
                    public: public.as_bytes().to_vec(),
                    private: SecretBytes::new(secret.to_bytes().to_vec()),
                })
            }
        }
    }

    fn ecdh(
        &self,
        curve: &EcCurve,
        private: &SecretBytes,
        peer_public: &[u8],
    ) -> Result<SecretBytes, CryptoError> {
        match curve.id {
            CurveId::X25519 => {
                let scalar: [u8; 32] = private
                    .as_bytes()
                    .try_into()
                    .map_err(|_| CryptoError::Ecdh("bad x25519 private key length"))?;
                let peer: [u8; 32] = peer_public
                    .try_into()
                    .map_err(|_| CryptoError::Ecdh("bad x25519 public key length"))?;
                let secret = x25519_dalek::StaticSecret::from(scalar);
                let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(peer));
                Ok(SecretBytes::new(shared.as_bytes().to_vec()))
            }
            CurveId::Secp256r1 => {
                let secret = p256::SecretKey::from_slice(private.as_bytes())
                    .map_err(|_| CryptoError::Ecdh("bad p256 private key"))?;
                let peer = p256::PublicKey::from_sec1_bytes(peer_public)
                    .map_err(|_| CryptoError::Ecdh("p256 point not on curve"))?;
                let shared =
                    p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
                Ok(SecretBytes::new(shared.raw_secret_bytes().to_vec()))
            }
            CurveId::Secp384r1 => {
                let secret = p384::SecretKey::from_slice(private.as_bytes())
                    .map_err(|_| CryptoError::Ecdh("bad p384 private key"))?;
                let peer = p384::PublicKey::from_sec1_bytes(peer_public)
                    .map_err(|_| CryptoError::Ecdh("p384 point not on curve"))?;
                let shared =
                    p384::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
                Ok(SecretBytes::new(shared.raw_secret_bytes().to_vec()))
            }
            CurveId::Secp521r1 => {
                let secret = p521::SecretKey::from_slice(private.as_bytes())
                    .map_err(|_| CryptoError::Ecdh("bad p521 private key"))?;
                let peer = p521::PublicKey::from_sec1_bytes(peer_public)
                    .map_err(|_| CryptoError::Ecdh("p521 point not on curve"))?;
                let shared =
                    p521::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
                Ok(SecretBytes::new(shared.raw_secret_bytes().to_vec()))
            }
        }
    }

    fn kem_keygen(&self, kem: &KemAlg) -> Result<KemKeyPair, CryptoError> {
        let (public, private) = match kem.id {
            KemId::Kyber512R3 => {
                let (pk, sk) = pqcrypto_kyber::kyber512::keypair();
                (pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
            }
            KemId::Kyber768R3 => {
                let (pk, sk) = pqcrypto_kyber::kyber768::keypair();
                (pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
            }
            KemId::Kyber1024R3 => {
                let (pk, sk) = pqcrypto_kyber::kyber1024::keypair();
                (pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
            }
            KemId::MlKem768 => {
                let (pk, sk) = pqcrypto_mlkem::mlkem768::keypair();
                (pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
            }
            KemId::MlKem1024 => {
                let (pk, sk) = pqcrypto_mlkem::mlkem1024::keypair();
                (pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
            }
        };
        Ok(KemKeyPair {
            public,
            private: SecretBytes::new(private),
        })
    }

    fn kem_encapsulate(
        &self,
        kem: &KemAlg,
        peer_public: &[u8],
    ) -> Result<(Vec<u8>, SecretBytes), CryptoError> {
        let (ciphertext, shared) = match kem.id {
            KemId::Kyber512R3 => {
                let pk = pqcrypto_kyber::kyber512::PublicKey::from_bytes(peer_public)
                    .map_err(|_| CryptoError::Kem("invalid kyber512 public key"))?;
                let (ss, ct) = pqcrypto_kyber::kyber512::encapsulate(&pk);
                (ct.as_bytes().to_vec(), ss.as_bytes().to_vec())
            }
            KemId::Kyber768R3 => {
                let pk = pqcrypto_kyber::kyber768::PublicKey::from_bytes(peer_public)
                    .map_err(|_| CryptoError::Kem("invalid kyber768 public key"))?;
                let (ss, ct) = pqcrypto_kyber::kyber768::encapsulate(&pk);
                (ct.as_bytes().to_vec(), ss.as_bytes().to_vec())
            }
            KemId::Kyber1024R3 => {
                let pk = pqcrypto_kyber::kyber1024::PublicKey::from_bytes(peer_public)
                    .map_err(|_| CryptoError::Kem("invalid kyber1024 public key"))?;
                let (ss, ct) = pqcrypto_kyber::kyber1024::encapsulate(&pk);
                (ct.as_bytes().to_vec(), ss.as_bytes().to_vec())
            }
            KemId::MlKem768 => {
                let pk = pqcrypto_mlkem::mlkem768::PublicKey::from_bytes(peer_public)
                    .map_err(|_| CryptoError::Kem("invalid mlkem768 public key"))?;
                let (ss, ct) = pqcrypto_mlkem::mlkem768::encapsulate(&pk);
                (ct.as_bytes().to_vec(), ss.as_bytes().to_vec())
            }
            KemId::MlKem1024 => {
                let pk = pqcrypto_mlkem::mlkem1024::PublicKey::from_bytes(peer_public)
                    .map_err(|_| CryptoError::Kem("invalid mlkem1024 public key"))?;
                let (ss, ct) = pqcrypto_mlkem::mlkem1024::encapsulate(&pk);
                (ct.as_bytes().to_vec(), ss.as_bytes().to_vec())
            }
        };
        Ok((ciphertext, SecretBytes::new(shared)))
    }

    fn kem_decapsulate(
        &self,
        kem: &KemAlg,
        private: &SecretBytes,
        ciphertext: &[u8],
    ) -> Result<SecretBytes, CryptoError> {
        let shared = match kem.id {
            KemId::Kyber512R3 => {
                let sk = pqcrypto_kyber::kyber512::SecretKey::from_bytes(private.as_bytes())
                    .map_err(|_| CryptoError::Kem("invalid kyber512 secret key"))?;
                let ct = pqcrypto_kyber::kyber512::Ciphertext::from_bytes(ciphertext)
                    .map_err(|_| CryptoError::Kem("invalid kyber512 ciphertext"))?;
                pqcrypto_kyber::kyber512::decapsulate(&ct, &sk)
                    .as_bytes()
                    .to_vec()
            }
            KemId::Kyber768R3 => {
                let sk = pqcrypto_kyber::kyber768::SecretKey::from_bytes(private.as_bytes())
                    .map_err(|_| CryptoError::Kem("invalid kyber768 secret key"))?;
                let ct = pqcrypto_kyber::kyber768::Ciphertext::from_bytes(ciphertext)
                    .map_err(|_| CryptoError::Kem("invalid kyber768 ciphertext"))?;
                pqcrypto_kyber::kyber768::decapsulate(&ct, &sk)
                    .as_bytes()
                    .to_vec()
            }
            KemId::Kyber1024R3 => {
                let sk = pqcrypto_kyber::kyber1024::SecretKey::from_bytes(private.as_bytes())
                    .map_err(|_| CryptoError::Kem("invalid kyber1024 secret key"))?;
                let ct = pqcrypto_kyber::kyber1024::Ciphertext::from_bytes(ciphertext)
                    .map_err(|_| CryptoError::Kem("invalid kyber1024 ciphertext"))?;
                pqcrypto_kyber::kyber1024::decapsulate(&ct, &sk)
                    .as_bytes()
                    .to_vec()
            }
            KemId::MlKem768 => {
                let sk = pqcrypto_mlkem::mlkem768::SecretKey::from_bytes(private.as_bytes())
                    .map_err(|_| CryptoError::Kem("invalid mlkem768 secret key"))?;
                let ct = pqcrypto_mlkem::mlkem768::Ciphertext::from_bytes(ciphertext)
                    .map_err(|_| CryptoError::Kem("invalid mlkem768 ciphertext"))?;
                pqcrypto_mlkem::mlkem768::decapsulate(&ct, &sk)
                    .as_bytes()
                    .to_vec()
            }
            KemId::MlKem1024 => {
                let sk = pqcrypto_mlkem::mlkem1024::SecretKey::from_bytes(private.as_bytes())
                    .map_err(|_| CryptoError::Kem("invalid mlkem1024 secret key"))?;
                let ct = pqcrypto_mlkem::mlkem1024::Ciphertext::from_bytes(ciphertext)
                    .map_err(|_| CryptoError::Kem("invalid mlkem1024 ciphertext"))?;
                pqcrypto_mlkem::mlkem1024::decapsulate(&ct, &sk)
                    .as_bytes()
                    .to_vec()
            }
        };
        Ok(SecretBytes::new(shared))
    }

    fn supports_evp_kem(&self) -> bool {
        true
    }

    fn supports_x25519(&self) -> bool {
        true
    }

    fn supports_mlkem(&self) -> bool {
        true
    }
}
