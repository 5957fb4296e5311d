//! DKIM key generation, encoding and rotation

use super::tags::{decode_base64, parse_tag_list};
use super::DkimError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use mailtrust_common::config::DkimConfig;
use mailtrust_common::{normalize_domain, now_utc_seconds, DkimAlgorithm};
use mailtrust_storage::{DkimKeyPair, DkimKeyRepository};
use rsa::pkcs1v15::{Signature as RsaSignature, SigningKey, VerifyingKey};
use rsa::rand_core::{OsRng, RngCore};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Smallest RSA modulus accepted for new keys
pub const MIN_RSA_BITS: usize = 1024;

static LAST_SELECTOR_NANOS: AtomicI64 = AtomicI64::new(0);

/// Selector of the form `s<unix-nanos>`, strictly increasing within the
/// process so two keys generated in the same instant never collide.
pub fn generate_selector() -> String {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let previous = LAST_SELECTOR_NANOS
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or_else(|last| last);
    format!("s{}", now.max(previous + 1))
}

/// Generate a new key pair for `domain`.
///
/// The private key is returned as PKCS#8 PEM and the public key as DER
/// SubjectPublicKeyInfo, for both algorithms.
pub fn generate_key_pair(
    domain: &str,
    algorithm: DkimAlgorithm,
    rsa_bits: usize,
) -> Result<DkimKeyPair, DkimError> {
    let (private_key_pem, public_key_der) = match algorithm {
        DkimAlgorithm::Rsa => generate_rsa(rsa_bits)?,
        DkimAlgorithm::Ed25519 => generate_ed25519()?,
    };

    Ok(DkimKeyPair {
        id: Uuid::now_v7(),
        domain: normalize_domain(domain),
        selector: generate_selector(),
        algorithm,
        private_key_pem,
        public_key_der,
        created_at: now_utc_seconds(),
    })
}

fn generate_rsa(bits: usize) -> Result<(String, Vec<u8>), DkimError> {
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};

    if bits < MIN_RSA_BITS {
        return Err(DkimError::KeyGeneration(format!(
            "RSA keys must be at least {} bits, got {}",
            MIN_RSA_BITS, bits
        )));
    }

    let private_key = RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| DkimError::KeyGeneration(e.to_string()))?;
    let pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| DkimError::KeyEncoding(e.to_string()))?;
    let der = private_key
        .to_public_key()
        .to_public_key_der()
        .map_err(|e| DkimError::KeyEncoding(e.to_string()))?;

    Ok((pem.as_str().to_owned(), der.as_bytes().to_vec()))
}

fn generate_ed25519() -> Result<(String, Vec<u8>), DkimError> {
    use ed25519_dalek::pkcs8::{EncodePrivateKey, EncodePublicKey};
    use rsa::pkcs8::LineEnding;

    let mut secret = [0u8; 32];
    OsRng.fill_bytes(&mut secret);
    let signing_key = ed25519_dalek::SigningKey::from_bytes(&secret);

    let pem = signing_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| DkimError::KeyEncoding(e.to_string()))?;
    let der = signing_key
        .verifying_key()
        .to_public_key_der()
        .map_err(|e| DkimError::KeyEncoding(e.to_string()))?;

    Ok((pem.as_str().to_owned(), der.as_bytes().to_vec()))
}

/// TXT record value publishing the key's public half
///
/// Ed25519 keys are published as SubjectPublicKeyInfo DER, not the bare
/// 32-byte key RFC 8463 specifies, so strict RFC 8463 verifiers reject
/// them. [`parse_dns_record`] accepts both forms.
pub fn encode_dns_record(key: &DkimKeyPair) -> String {
    format!(
        "v=DKIM1; k={}; p={}",
        key.algorithm.as_str(),
        BASE64.encode(&key.public_key_der)
    )
}

/// Decode a published DKIM key record
pub fn parse_dns_record(txt: &str) -> Result<DkimPublicKey, DkimError> {
    let tags = parse_tag_list(txt).map_err(|e| DkimError::InvalidPublicKey(e.to_string()))?;

    if let Some(version) = tags.get("v") {
        if version != "DKIM1" {
            return Err(DkimError::InvalidPublicKey(format!(
                "unsupported record version {}",
                version
            )));
        }
    }

    let algorithm = match tags.get("k") {
        Some(k) => k
            .parse::<DkimAlgorithm>()
            .map_err(|e| DkimError::InvalidPublicKey(e.to_string()))?,
        None => DkimAlgorithm::Rsa,
    };

    let encoded = tags
        .get("p")
        .ok_or_else(|| DkimError::InvalidPublicKey("missing p= tag".to_string()))?;
    let der = decode_base64(encoded)
        .map_err(|e| DkimError::InvalidPublicKey(format!("p= is not base64: {}", e)))?;
    if der.is_empty() {
        return Err(DkimError::KeyRevoked);
    }

    DkimPublicKey::from_der(algorithm, &der)
}

/// Private key ready for signing
pub enum DkimPrivateKey {
    Rsa(RsaPrivateKey),
    Ed25519(ed25519_dalek::SigningKey),
}

impl DkimPrivateKey {
    /// Accepts PKCS#8 PEM for both algorithms and PKCS#1 PEM for RSA
    pub fn from_pem(algorithm: DkimAlgorithm, pem: &str) -> Result<Self, DkimError> {
        match algorithm {
            DkimAlgorithm::Rsa => {
                use rsa::pkcs1::DecodeRsaPrivateKey;
                use rsa::pkcs8::DecodePrivateKey;

                let key = if pem.contains("BEGIN RSA PRIVATE KEY") {
                    RsaPrivateKey::from_pkcs1_pem(pem)
                        .map_err(|e| DkimError::InvalidPrivateKey(e.to_string()))?
                } else {
                    RsaPrivateKey::from_pkcs8_pem(pem)
                        .map_err(|e| DkimError::InvalidPrivateKey(e.to_string()))?
                };
                Ok(DkimPrivateKey::Rsa(key))
            }
            DkimAlgorithm::Ed25519 => {
                use ed25519_dalek::pkcs8::DecodePrivateKey;

                let key = ed25519_dalek::SigningKey::from_pkcs8_pem(pem)
                    .map_err(|e| DkimError::InvalidPrivateKey(e.to_string()))?;
                Ok(DkimPrivateKey::Ed25519(key))
            }
        }
    }

    /// Sign the header hash input.
    ///
    /// Ed25519 signs the SHA-256 digest of the input (RFC 8463), RSA signs
    /// the input with PKCS#1 v1.5 over SHA-256.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        match self {
            DkimPrivateKey::Rsa(key) => SigningKey::<Sha256>::new(key.clone()).sign(data).to_vec(),
            DkimPrivateKey::Ed25519(key) => key.sign(&Sha256::digest(data)).to_bytes().to_vec(),
        }
    }
}

/// Public key recovered from DNS
#[derive(Debug, Clone)]
pub enum DkimPublicKey {
    Rsa(RsaPublicKey),
    Ed25519(ed25519_dalek::VerifyingKey),
}

impl DkimPublicKey {
    /// RSA accepts SubjectPublicKeyInfo or PKCS#1 DER. Ed25519 accepts
    /// SubjectPublicKeyInfo or the bare 32-byte key of RFC 8463.
    pub fn from_der(algorithm: DkimAlgorithm, der: &[u8]) -> Result<Self, DkimError> {
        match algorithm {
            DkimAlgorithm::Rsa => {
                use rsa::pkcs1::DecodeRsaPublicKey;
                use rsa::pkcs8::DecodePublicKey;

                RsaPublicKey::from_public_key_der(der)
                    .or_else(|_| RsaPublicKey::from_pkcs1_der(der))
                    .map(DkimPublicKey::Rsa)
                    .map_err(|e| DkimError::InvalidPublicKey(e.to_string()))
            }
            DkimAlgorithm::Ed25519 => {
                use ed25519_dalek::pkcs8::DecodePublicKey;

                if let Ok(raw) = <[u8; 32]>::try_from(der) {
                    return ed25519_dalek::VerifyingKey::from_bytes(&raw)
                        .map(DkimPublicKey::Ed25519)
                        .map_err(|e| DkimError::InvalidPublicKey(e.to_string()));
                }
                ed25519_dalek::VerifyingKey::from_public_key_der(der)
                    .map(DkimPublicKey::Ed25519)
                    .map_err(|e| DkimError::InvalidPublicKey(e.to_string()))
            }
        }
    }

    pub fn algorithm(&self) -> DkimAlgorithm {
        match self {
            DkimPublicKey::Rsa(_) => DkimAlgorithm::Rsa,
            DkimPublicKey::Ed25519(_) => DkimAlgorithm::Ed25519,
        }
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), DkimError> {
        match self {
            DkimPublicKey::Rsa(key) => {
                let signature = RsaSignature::try_from(signature)
                    .map_err(|_| DkimError::SignatureMismatch)?;
                VerifyingKey::<Sha256>::new(key.clone())
                    .verify(data, &signature)
                    .map_err(|_| DkimError::SignatureMismatch)
            }
            DkimPublicKey::Ed25519(key) => {
                let signature = ed25519_dalek::Signature::from_slice(signature)
                    .map_err(|_| DkimError::SignatureMismatch)?;
                key.verify(&Sha256::digest(data), &signature)
                    .map_err(|_| DkimError::SignatureMismatch)
            }
        }
    }
}

/// Creates and rotates per-domain DKIM keys
pub struct DkimKeyManager {
    keys: Arc<dyn DkimKeyRepository>,
    config: DkimConfig,
}

impl DkimKeyManager {
    pub fn new(keys: Arc<dyn DkimKeyRepository>, config: DkimConfig) -> Self {
        Self { keys, config }
    }

    /// Generate and store a key with the configured algorithm. The new key
    /// becomes the domain's active key; older keys are kept.
    pub async fn rotate(&self, domain: &str) -> Result<DkimKeyPair, DkimError> {
        self.rotate_with(domain, self.config.key_type).await
    }

    pub async fn rotate_with(
        &self,
        domain: &str,
        algorithm: DkimAlgorithm,
    ) -> Result<DkimKeyPair, DkimError> {
        let domain = normalize_domain(domain);
        let bits = self.config.rsa_key_bits;
        let key = tokio::task::spawn_blocking(move || generate_key_pair(&domain, algorithm, bits))
            .await
            .map_err(|e| DkimError::KeyGeneration(e.to_string()))??;

        self.keys.insert(&key).await?;

        info!(
            domain = %key.domain,
            selector = %key.selector,
            algorithm = %key.algorithm,
            "Generated DKIM key"
        );
        Ok(key)
    }

    pub async fn active_key(&self, domain: &str) -> Result<Option<DkimKeyPair>, DkimError> {
        Ok(self.keys.active_for_domain(domain).await?)
    }

    /// (owner name, TXT value) for the domain's active key
    pub async fn dns_record(&self, domain: &str) -> Result<Option<(String, String)>, DkimError> {
        Ok(self
            .active_key(domain)
            .await?
            .map(|key| (key.dns_name(), encode_dns_record(&key))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailtrust_storage::MemoryStore;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_selectors_are_unique() {
        let a = generate_selector();
        let b = generate_selector();
        assert!(a.starts_with('s'));
        assert_ne!(a, b);
    }

    #[test]
    fn test_ed25519_record_round_trip() {
        let key = generate_key_pair("Example.com", DkimAlgorithm::Ed25519, 0).unwrap();
        assert_eq!(key.domain, "example.com");
        assert!(key.private_key_pem.contains("BEGIN PRIVATE KEY"));

        let record = encode_dns_record(&key);
        assert!(record.starts_with("v=DKIM1; k=ed25519; p="));

        let public = parse_dns_record(&record).unwrap();
        assert_eq!(public.algorithm(), DkimAlgorithm::Ed25519);

        let private = DkimPrivateKey::from_pem(key.algorithm, &key.private_key_pem).unwrap();
        let sig = private.sign(b"header hash input");
        public.verify(b"header hash input", &sig).unwrap();
        assert!(public.verify(b"tampered", &sig).is_err());
    }

    #[test]
    fn test_rsa_record_round_trip() {
        let key = generate_key_pair("example.com", DkimAlgorithm::Rsa, 1024).unwrap();
        let record = encode_dns_record(&key);
        assert!(record.starts_with("v=DKIM1; k=rsa; p=MI"));

        let public = parse_dns_record(&record).unwrap();
        let private = DkimPrivateKey::from_pem(DkimAlgorithm::Rsa, &key.private_key_pem).unwrap();
        let sig = private.sign(b"data");
        public.verify(b"data", &sig).unwrap();
    }

    #[test]
    fn test_rsa_pkcs1_pem_accepted() {
        use rsa::pkcs1::EncodeRsaPrivateKey;
        use rsa::pkcs8::LineEnding;

        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let pem = private.to_pkcs1_pem(LineEnding::LF).unwrap();
        assert!(DkimPrivateKey::from_pem(DkimAlgorithm::Rsa, pem.as_str()).is_ok());
    }

    #[test]
    fn test_weak_rsa_rejected() {
        assert!(matches!(
            generate_key_pair("example.com", DkimAlgorithm::Rsa, 512),
            Err(DkimError::KeyGeneration(_))
        ));
    }

    #[test]
    fn test_raw_ed25519_key_accepted() {
        let signing = ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]);
        let record = format!(
            "v=DKIM1; k=ed25519; p={}",
            BASE64.encode(signing.verifying_key().as_bytes())
        );
        assert_eq!(parse_dns_record(&record).unwrap().algorithm(), DkimAlgorithm::Ed25519);
    }

    #[test]
    fn test_revoked_and_invalid_records() {
        assert!(matches!(parse_dns_record("v=DKIM1; p="), Err(DkimError::KeyRevoked)));
        assert!(parse_dns_record("v=DKIM2; p=AAAA").is_err());
        assert!(parse_dns_record("v=DKIM1; k=dsa; p=AAAA").is_err());
        assert!(parse_dns_record("v=DKIM1; k=rsa").is_err());
    }

    #[tokio::test]
    async fn test_rotation_supersedes_active_key() {
        let store = Arc::new(MemoryStore::new());
        let manager = DkimKeyManager::new(
            store.clone(),
            DkimConfig {
                key_type: DkimAlgorithm::Ed25519,
                ..DkimConfig::default()
            },
        );

        let first = manager.rotate("example.com").await.unwrap();
        let second = manager.rotate("example.com").await.unwrap();

        let active = manager.active_key("example.com").await.unwrap().unwrap();
        assert_eq!(active.selector, second.selector);
        assert_eq!(store.list_for_domain("example.com").await.unwrap().len(), 2);
        assert_ne!(first.selector, second.selector);

        let (name, value) = manager.dns_record("example.com").await.unwrap().unwrap();
        assert_eq!(name, format!("{}._domainkey.example.com", second.selector));
        assert!(value.contains("k=ed25519"));
    }
}
