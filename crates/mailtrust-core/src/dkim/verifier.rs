//! Inbound DKIM verification

use super::canon::{
    canonicalize_body, canonicalize_header, parse_message, select_headers, HeaderField,
    ParsedMessage,
};
use super::canon::strip_b_tag;
use super::keys::{parse_dns_record, DkimPublicKey};
use super::tags::{parse_tag_list, DkimSignature};
use super::DkimError;
use async_trait::async_trait;
use mailtrust_common::config::DkimConfig;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::TokioAsyncResolver;

/// Source of DKIM key TXT records
#[async_trait]
pub trait DkimKeyLookup: Send + Sync {
    /// TXT strings published at `name`; empty when the name has none
    async fn txt_records(&self, name: &str) -> Result<Vec<String>, DkimError>;
}

/// DNS-backed key lookup
pub struct DnsKeyLookup {
    resolver: TokioAsyncResolver,
}

impl DnsKeyLookup {
    pub fn new(config: &DkimConfig) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = config.dns_timeout();
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), opts),
        }
    }
}

#[async_trait]
impl DkimKeyLookup for DnsKeyLookup {
    async fn txt_records(&self, name: &str) -> Result<Vec<String>, DkimError> {
        match self.resolver.txt_lookup(name).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|record| {
                    record
                        .txt_data()
                        .iter()
                        .map(|d| String::from_utf8_lossy(d))
                        .collect::<String>()
                })
                .collect()),
            Err(e) => {
                if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) {
                    Ok(Vec::new())
                } else {
                    Err(DkimError::KeyLookup(e.to_string()))
                }
            }
        }
    }
}

/// Outcome for one DKIM-Signature header
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    pub valid: bool,
    pub domain: Option<String>,
    pub selector: Option<String>,
    /// First entry of the signature's `h=` list
    pub signed_header_field: Option<String>,
    pub error: Option<String>,
}

impl VerificationResult {
    fn failed(error: impl ToString) -> Self {
        Self {
            valid: false,
            domain: None,
            selector: None,
            signed_header_field: None,
            error: Some(error.to_string()),
        }
    }
}

/// DKIM verifier for incoming mail
pub struct DkimVerifier {
    lookup: Arc<dyn DkimKeyLookup>,
}

impl DkimVerifier {
    pub fn new(lookup: Arc<dyn DkimKeyLookup>) -> Self {
        Self { lookup }
    }

    /// Verify every DKIM-Signature in the message independently.
    ///
    /// An unparsable message yields a single failed result; a message
    /// without signatures yields none.
    pub async fn verify(&self, message: &[u8]) -> Vec<VerificationResult> {
        let parsed = match parse_message(message) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Failed to parse message for DKIM: {}", e);
                return vec![VerificationResult::failed(e)];
            }
        };

        let signatures: Vec<&HeaderField> = parsed
            .headers
            .iter()
            .filter(|h| h.name_is("dkim-signature"))
            .collect();
        if signatures.is_empty() {
            debug!("No DKIM-Signature header found");
        }

        let mut results = Vec::with_capacity(signatures.len());
        for field in signatures {
            results.push(self.verify_field(&parsed, field).await);
        }
        results
    }

    async fn verify_field(&self, parsed: &ParsedMessage, field: &HeaderField) -> VerificationResult {
        let tags = match parse_tag_list(&field.value) {
            Ok(tags) => tags,
            Err(e) => return VerificationResult::failed(e),
        };

        let mut result = VerificationResult {
            valid: false,
            domain: tags.get("d").cloned(),
            selector: tags.get("s").cloned(),
            signed_header_field: tags
                .get("h")
                .and_then(|h| h.split(':').next())
                .map(|h| h.trim().to_string()),
            error: None,
        };

        let outcome = match DkimSignature::from_tags(&tags) {
            Ok(signature) => self.check(parsed, field, &signature).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                debug!(domain = ?result.domain, selector = ?result.selector, "DKIM signature verified");
                result.valid = true;
            }
            Err(e) => {
                debug!(domain = ?result.domain, selector = ?result.selector, error = %e, "DKIM signature failed");
                result.error = Some(e.to_string());
            }
        }
        result
    }

    async fn check(
        &self,
        parsed: &ParsedMessage,
        field: &HeaderField,
        signature: &DkimSignature,
    ) -> Result<(), DkimError> {
        if let Some(expiration) = signature.expiration {
            if expiration < chrono::Utc::now().timestamp() {
                return Err(DkimError::SignatureExpired);
            }
        }

        let body = canonicalize_body(signature.body_canon, &parsed.body);
        let body = match signature.body_length {
            Some(limit) if limit > body.len() => {
                return Err(DkimError::InvalidSignature(
                    "l= exceeds the body length".to_string(),
                ))
            }
            Some(limit) => &body[..limit],
            None => &body[..],
        };
        if Sha256::digest(body).as_slice() != signature.body_hash.as_slice() {
            return Err(DkimError::BodyHashMismatch);
        }

        let key = self.fetch_key(signature).await?;
        if key.algorithm() != signature.algorithm {
            return Err(DkimError::InvalidPublicKey(
                "key type does not match signature algorithm".to_string(),
            ));
        }

        let mut input = select_headers(signature.header_canon, &signature.signed_headers, &parsed.headers);
        let own = canonicalize_header(
            signature.header_canon,
            &HeaderField {
                name: field.name.clone(),
                value: strip_b_tag(&field.value),
            },
        );
        input.push_str(own.strip_suffix("\r\n").unwrap_or(&own));

        key.verify(input.as_bytes(), &signature.signature)
    }

    async fn fetch_key(&self, signature: &DkimSignature) -> Result<DkimPublicKey, DkimError> {
        let name = format!("{}._domainkey.{}", signature.selector, signature.domain);
        let records = self.lookup.txt_records(&name).await?;

        let mut last_error = None;
        for txt in records.iter().filter(|txt| txt.contains("p=")) {
            match parse_dns_record(txt) {
                Ok(key) => return Ok(key),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| DkimError::KeyLookup(format!("no DKIM key at {}", name))))
    }
}
