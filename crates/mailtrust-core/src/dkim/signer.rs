//! Outbound DKIM signing

use super::canon::{canonicalize_body, canonicalize_header, parse_message, select_headers};
use super::canon::{Canonicalization, HeaderField};
use super::keys::DkimPrivateKey;
use super::DkimError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use mailtrust_common::config::DkimConfig;
use mailtrust_common::now_utc_seconds;
use mailtrust_storage::{DkimKeyPair, DkimKeyRepository};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

const SIGNATURE_FOLD_WIDTH: usize = 64;

/// Build the `DKIM-Signature` header field (with trailing CRLF) for
/// `message` using `key`.
///
/// Only names in `headers_to_sign` that occur in the message are listed
/// in `h=`. The message must carry a From field.
pub fn sign_message(
    key: &DkimKeyPair,
    headers_to_sign: &[String],
    message: &[u8],
    timestamp: i64,
) -> Result<String, DkimError> {
    let private_key = DkimPrivateKey::from_pem(key.algorithm, &key.private_key_pem)?;
    let parsed = parse_message(message)?;

    if !parsed.has_header("from") {
        return Err(DkimError::Signing("message has no From header".to_string()));
    }

    let body = canonicalize_body(Canonicalization::Relaxed, &parsed.body);
    let body_hash = BASE64.encode(Sha256::digest(&body));

    let signed: Vec<String> = headers_to_sign
        .iter()
        .filter(|name| parsed.has_header(name))
        .cloned()
        .collect();

    let template = format!(
        "v=1; a={}; c=relaxed/relaxed; d={}; s={}; t={}; h={}; bh={}; b=",
        key.algorithm.signature_algorithm(),
        key.domain,
        key.selector,
        timestamp,
        signed.join(":"),
        body_hash
    );

    let mut input = select_headers(Canonicalization::Relaxed, &signed, &parsed.headers);
    let own = canonicalize_header(
        Canonicalization::Relaxed,
        &HeaderField {
            name: "DKIM-Signature".to_string(),
            value: format!(" {}", template),
        },
    );
    input.push_str(own.strip_suffix("\r\n").unwrap_or(&own));

    let signature = BASE64.encode(private_key.sign(input.as_bytes()));

    Ok(format!(
        "DKIM-Signature: {}{}\r\n",
        template,
        fold(&signature)
    ))
}

fn fold(value: &str) -> String {
    value
        .as_bytes()
        .chunks(SIGNATURE_FOLD_WIDTH)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join("\r\n\t")
}

/// DKIM signer for outgoing mail, keyed by sending domain
pub struct DkimSigner {
    keys: Arc<dyn DkimKeyRepository>,
    headers_to_sign: Vec<String>,
}

impl DkimSigner {
    pub fn new(keys: Arc<dyn DkimKeyRepository>, config: &DkimConfig) -> Self {
        Self {
            keys,
            headers_to_sign: config.headers_to_sign.clone(),
        }
    }

    /// Prepend a DKIM-Signature made with the domain's active key.
    ///
    /// A domain without a key (or whose key cannot be loaded) gets the
    /// message back unchanged. A key that fails to parse is an error.
    pub async fn sign(&self, domain: &str, message: &[u8]) -> Result<Vec<u8>, DkimError> {
        let key = match self.keys.active_for_domain(domain).await {
            Ok(Some(key)) => key,
            Ok(None) => {
                debug!(domain, "No DKIM key for domain, sending unsigned");
                return Ok(message.to_vec());
            }
            Err(e) => {
                warn!(domain, error = %e, "DKIM key lookup failed, sending unsigned");
                return Ok(message.to_vec());
            }
        };

        let header = sign_message(
            &key,
            &self.headers_to_sign,
            message,
            now_utc_seconds().timestamp(),
        )?;

        debug!(domain, selector = %key.selector, "Signed message");

        let mut signed = Vec::with_capacity(header.len() + message.len());
        signed.extend_from_slice(header.as_bytes());
        signed.extend_from_slice(message);
        Ok(signed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dkim::keys::generate_key_pair;
    use crate::dkim::tags::DkimSignature;
    use mailtrust_common::DkimAlgorithm;
    use mailtrust_storage::MemoryStore;
    use pretty_assertions::assert_eq;

    const MESSAGE: &[u8] = b"From: alice@example.com\r\n\
To: bob@example.org\r\n\
Subject: Hello\r\n\
Date: Mon, 01 Jan 2024 00:00:00 +0000\r\n\
\r\n\
Hi Bob\r\n";

    #[test]
    fn test_signature_lists_only_present_headers() {
        let key = generate_key_pair("example.com", DkimAlgorithm::Ed25519, 0).unwrap();
        let header = sign_message(&key, &DkimConfig::default().headers_to_sign, MESSAGE, 1_700_000_000)
            .unwrap();

        assert!(header.starts_with("DKIM-Signature: v=1; a=ed25519-sha256; c=relaxed/relaxed; d=example.com;"));
        assert!(header.ends_with("\r\n"));

        let value = header
            .trim_start_matches("DKIM-Signature:")
            .trim_end_matches("\r\n");
        let sig = DkimSignature::parse(value).unwrap();
        assert_eq!(sig.signed_headers, vec!["From", "To", "Subject", "Date"]);
        assert_eq!(sig.selector, key.selector);
        assert_eq!(sig.timestamp, Some(1_700_000_000));
        assert_eq!(sig.signature.len(), 64);
    }

    #[test]
    fn test_message_without_from_is_refused() {
        let key = generate_key_pair("example.com", DkimAlgorithm::Ed25519, 0).unwrap();
        let result = sign_message(
            &key,
            &["From".to_string()],
            b"To: bob@example.org\r\n\r\nHi\r\n",
            0,
        );
        assert!(matches!(result, Err(DkimError::Signing(_))));
    }

    #[tokio::test]
    async fn test_unsigned_when_domain_has_no_key() {
        let signer = DkimSigner::new(Arc::new(MemoryStore::new()), &DkimConfig::default());
        let out = signer.sign("example.com", MESSAGE).await.unwrap();
        assert_eq!(out, MESSAGE.to_vec());
    }

    #[tokio::test]
    async fn test_signed_message_is_prefixed() {
        let store = Arc::new(MemoryStore::new());
        let key = generate_key_pair("example.com", DkimAlgorithm::Ed25519, 0).unwrap();
        store.insert(&key).await.unwrap();

        let signer = DkimSigner::new(store, &DkimConfig::default());
        let out = signer.sign("example.com", MESSAGE).await.unwrap();

        assert!(out.starts_with(b"DKIM-Signature: "));
        assert!(out.ends_with(MESSAGE));
    }

    #[tokio::test]
    async fn test_corrupt_key_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let mut key = generate_key_pair("example.com", DkimAlgorithm::Ed25519, 0).unwrap();
        key.private_key_pem = "not a key".to_string();
        store.insert(&key).await.unwrap();

        let signer = DkimSigner::new(store, &DkimConfig::default());
        assert!(matches!(
            signer.sign("example.com", MESSAGE).await,
            Err(DkimError::InvalidPrivateKey(_))
        ));
    }
}
