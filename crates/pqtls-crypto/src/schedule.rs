//! RFC 8446 key schedule, up to the handshake-traffic secrets.
//!
//! The negotiation core only needs the extract secret and the two
//! handshake-traffic secrets (plus finished keys); application-traffic
//! derivation belongs to the record layer, which lives elsewhere.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha384};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use pqtls_core::policy::CipherSuite;

use crate::provider::CryptoError;

/// A derived secret, wiped on drop and compared in constant time.
#[derive(Clone)]
pub struct Secret(Zeroizing<Vec<u8>>);

impl Secret {
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

    pub fn ct_eq(&self, other: &Secret) -> bool {
        self.0.len() == other.0.len() && bool::from(self.0.ct_eq(&other.0))
    }

    pub fn is_all_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret({} bytes)", self.0.len())
    }
}

/// The three secrets both peers must agree on after ServerHello.
#[derive(Debug, Clone)]
pub struct HandshakeSecrets {
    /// The TLS 1.3 handshake secret, i.e. the extract-stage output fed by
    /// the (EC)DHE input.
    pub extract_secret: Secret,
    pub client_handshake_secret: Secret,
    pub server_handshake_secret: Secret,
}

/// Incremental transcript hash over handshake messages, parameterized by the
/// negotiated suite. `current` peeks without disturbing the running state.
#[derive(Clone)]
pub enum TranscriptHash {
    Sha256(Sha256),
    Sha384(Sha384),
}

impl TranscriptHash {
    pub fn new(suite: CipherSuite) -> Self {
        match suite {
            CipherSuite::Aes128GcmSha256 => TranscriptHash::Sha256(Sha256::new()),
            CipherSuite::Aes256GcmSha384 => TranscriptHash::Sha384(Sha384::new()),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            TranscriptHash::Sha256(hasher) => hasher.update(bytes),
            TranscriptHash::Sha384(hasher) => hasher.update(bytes),
        }
    }

    pub fn current(&self) -> Vec<u8> {
        match self {
            TranscriptHash::Sha256(hasher) => hasher.clone().finalize().to_vec(),
            TranscriptHash::Sha384(hasher) => hasher.clone().finalize().to_vec(),
        }
    }
}

impl std::fmt::Debug for TranscriptHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranscriptHash::Sha256(_) => f.write_str("TranscriptHash(sha256)"),
            TranscriptHash::Sha384(_) => f.write_str("TranscriptHash(sha384)"),
        }
    }
}

/// One-shot hash with the suite's digest.
pub fn hash(suite: CipherSuite, data: &[u8]) -> Vec<u8> {
    match suite {
        CipherSuite::Aes128GcmSha256 => Sha256::digest(data).to_vec(),
        CipherSuite::Aes256GcmSha384 => Sha384::digest(data).to_vec(),
    }
}

/// HKDF-Extract with the suite's hash.
pub fn hkdf_extract(suite: CipherSuite, salt: Option<&[u8]>, ikm: &[u8]) -> Secret {
    match suite {
        CipherSuite::Aes128GcmSha256 => {
            let (prk, _) = Hkdf::<Sha256>::extract(salt, ikm);
            Secret::new(prk.to_vec())
        }
        CipherSuite::Aes256GcmSha384 => {
            let (prk, _) = Hkdf::<Sha384>::extract(salt, ikm);
            Secret::new(prk.to_vec())
        }
    }
}

/// HKDF-Expand-Label per RFC 8446 section 7.1.
pub fn hkdf_expand_label(
    suite: CipherSuite,
    secret: &Secret,
    label: &str,
    context: &[u8],
    out_len: usize,
) -> Result<Secret, CryptoError> {
    let info = build_label_info(label, context, out_len);
    let mut out = vec![0u8; out_len];
    match suite {
        CipherSuite::Aes128GcmSha256 => {
            let hkdf = Hkdf::<Sha256>::from_prk(secret.as_bytes())
                .map_err(|_| CryptoError::Derive("bad prk length"))?;
            hkdf.expand(&info, &mut out)
                .map_err(|_| CryptoError::Derive("hkdf expand"))?;
        }
        CipherSuite::Aes256GcmSha384 => {
            let hkdf = Hkdf::<Sha384>::from_prk(secret.as_bytes())
                .map_err(|_| CryptoError::Derive("bad prk length"))?;
            hkdf.expand(&info, &mut out)
                .map_err(|_| CryptoError::Derive("hkdf expand"))?;
        }
    }
    Ok(Secret::new(out))
}

/// Derive-Secret: Expand-Label with a transcript hash as context and the
/// hash width as length.
pub fn derive_secret(
    suite: CipherSuite,
    secret: &Secret,
    label: &str,
    transcript_hash: &[u8],
) -> Result<Secret, CryptoError> {
    hkdf_expand_label(suite, secret, label, transcript_hash, suite.hash_len())
}

/// Run the schedule from the combined (EC)DHE input to the handshake-traffic
/// secrets. `transcript_hash` must cover ClientHello through ServerHello.
pub fn derive_handshake_secrets(
    suite: CipherSuite,
    shared_secret: &[u8],
    transcript_hash: &[u8],
) -> Result<HandshakeSecrets, CryptoError> {
    let zeros = vec![0u8; suite.hash_len()];
    let early_secret = hkdf_extract(suite, None, &zeros);
    let empty_hash = hash(suite, &[]);
    let derived = derive_secret(suite, &early_secret, "derived", &empty_hash)?;

    let extract_secret = hkdf_extract(suite, Some(derived.as_bytes()), shared_secret);
    let client_handshake_secret =
        derive_secret(suite, &extract_secret, "c hs traffic", transcript_hash)?;
    let server_handshake_secret =
        derive_secret(suite, &extract_secret, "s hs traffic", transcript_hash)?;

    Ok(HandshakeSecrets {
        extract_secret,
        client_handshake_secret,
        server_handshake_secret,
    })
}

/// Finished key for one side's traffic secret.
pub fn finished_key(suite: CipherSuite, traffic_secret: &Secret) -> Result<Secret, CryptoError> {
    hkdf_expand_label(suite, traffic_secret, "finished", &[], suite.hash_len())
}

/// Finished verify-data: HMAC of the transcript under the finished key.
pub fn finished_verify(
    suite: CipherSuite,
    traffic_secret: &Secret,
    transcript_hash: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let key = finished_key(suite, traffic_secret)?;
    match suite {
        CipherSuite::Aes128GcmSha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes())
                .map_err(|_| CryptoError::Derive("bad finished key"))?;
            mac.update(transcript_hash);
            Ok(mac.finalize().into_bytes().to_vec())
        }
        CipherSuite::Aes256GcmSha384 => {
            let mut mac = Hmac::<Sha384>::new_from_slice(key.as_bytes())
                .map_err(|_| CryptoError::Derive("bad finished key"))?;
            mac.update(transcript_hash);
            Ok(mac.finalize().into_bytes().to_vec())
        }
    }
}

/// Constant-time comparison of finished verify-data.
pub fn verify_data_matches(expected: &[u8], seen: &[u8]) -> bool {
    expected.len() == seen.len() && bool::from(expected.ct_eq(seen))
}

fn build_label_info(label: &str, context: &[u8], out_len: usize) -> Vec<u8> {
    let full_label = [b"tls13 ", label.as_bytes()].concat();
    let mut info = Vec::with_capacity(4 + full_label.len() + context.len());
    info.extend_from_slice(&(out_len as u16).to_be_bytes());
    info.push(full_label.len() as u8);
    info.extend_from_slice(&full_label);
    info.push(context.len() as u8);
    info.extend_from_slice(context);
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_match_hash_width() {
        for suite in [CipherSuite::Aes128GcmSha256, CipherSuite::Aes256GcmSha384] {
            let transcript = hash(suite, b"transcript");
            let secrets =
                derive_handshake_secrets(suite, b"shared material", &transcript).expect("derive");
            assert_eq!(secrets.extract_secret.len(), suite.hash_len());
            assert_eq!(secrets.client_handshake_secret.len(), suite.hash_len());
            assert_eq!(secrets.server_handshake_secret.len(), suite.hash_len());
            assert!(!secrets.extract_secret.is_all_zero());
        }
    }

    #[test]
    fn derivation_is_deterministic_and_input_sensitive() {
        let suite = CipherSuite::Aes128GcmSha256;
        let transcript = hash(suite, b"messages");
        let a = derive_handshake_secrets(suite, b"shared", &transcript).expect("a");
        let b = derive_handshake_secrets(suite, b"shared", &transcript).expect("b");
        assert!(a.extract_secret.ct_eq(&b.extract_secret));
        assert!(a
            .client_handshake_secret
            .ct_eq(&b.client_handshake_secret));

        let c = derive_handshake_secrets(suite, b"other shared", &transcript).expect("c");
        assert!(!a.extract_secret.ct_eq(&c.extract_secret));
    }

    #[test]
    fn client_and_server_secrets_differ() {
        let suite = CipherSuite::Aes256GcmSha384;
        let transcript = hash(suite, b"messages");
        let secrets = derive_handshake_secrets(suite, b"shared", &transcript).expect("derive");
        assert!(!secrets
            .client_handshake_secret
            .ct_eq(&secrets.server_handshake_secret));
    }

    #[test]
    fn expand_label_encodes_rfc8446_info() {
        let info = build_label_info("derived", b"ctx", 32);
        assert_eq!(&info[..2], &32u16.to_be_bytes());
        assert_eq!(info[2] as usize, "tls13 derived".len());
        assert_eq!(&info[3..3 + 13], b"tls13 derived");
        assert_eq!(info[16] as usize, 3);
        assert_eq!(&info[17..], b"ctx");
    }

    #[test]
    fn finished_verify_round_trips() {
        let suite = CipherSuite::Aes128GcmSha256;
        let transcript = hash(suite, b"through encrypted extensions");
        let secrets = derive_handshake_secrets(suite, b"shared", &transcript).expect("derive");
        let sent =
            finished_verify(suite, &secrets.server_handshake_secret, &transcript).expect("sent");
        let checked =
            finished_verify(suite, &secrets.server_handshake_secret, &transcript).expect("check");
        assert!(verify_data_matches(&sent, &checked));
        assert!(!verify_data_matches(&sent, &transcript));
    }

    #[test]
    fn transcript_hash_peek_does_not_consume() {
        let mut transcript = TranscriptHash::new(CipherSuite::Aes128GcmSha256);
        transcript.update(b"one");
        let first = transcript.current();
        let again = transcript.current();
        assert_eq!(first, again);
        transcript.update(b"two");
        assert_ne!(transcript.current(), first);
    }
}
