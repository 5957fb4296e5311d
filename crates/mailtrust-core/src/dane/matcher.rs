//! TLSA record matching against a presented certificate chain

use super::{DaneError, DaneResolver};
use mailtrust_storage::{DaneRecord, TlsaMatchingType, TlsaSelector};
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256, Sha512};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Does `record` match `chain` (leaf first)?
///
/// PKIX-TA and DANE-TA records are checked against the last certificate
/// in the chain, PKIX-EE and DANE-EE against the leaf. Chain validation
/// itself is the TLS layer's job.
pub fn record_matches(record: &DaneRecord, chain: &[CertificateDer<'_>]) -> Result<bool, DaneError> {
    let cert = if record.usage.matches_trust_anchor() {
        chain.last()
    } else {
        chain.first()
    };
    let Some(cert) = cert else {
        return Err(DaneError::NoPeerCertificates);
    };

    let selected = select(record.selector, cert.as_ref())?;
    let digest = match record.matching_type {
        TlsaMatchingType::Full => hex::encode(selected),
        TlsaMatchingType::Sha256 => hex::encode(Sha256::digest(selected)),
        TlsaMatchingType::Sha512 => hex::encode(Sha512::digest(selected)),
    };

    Ok(digest.eq_ignore_ascii_case(&record.certificate_data))
}

fn select(selector: TlsaSelector, der: &[u8]) -> Result<&[u8], DaneError> {
    match selector {
        TlsaSelector::FullCertificate => Ok(der),
        TlsaSelector::SubjectPublicKeyInfo => {
            let (_, cert) = x509_parser::parse_x509_certificate(der)
                .map_err(|e| DaneError::Certificate(e.to_string()))?;
            Ok(cert.tbs_certificate.subject_pki.raw)
        }
    }
}

/// Checks peer certificates against the destination's TLSA records
pub struct DaneMatcher {
    resolver: Arc<DaneResolver>,
    require_dnssec: bool,
}

impl DaneMatcher {
    pub fn new(resolver: Arc<DaneResolver>, require_dnssec: bool) -> Self {
        Self {
            resolver,
            require_dnssec,
        }
    }

    /// Verify the chain presented by `domain:port`.
    ///
    /// `Ok(false)` means the host publishes no TLSA records and DANE does
    /// not apply. `Ok(true)` means at least one usable record matched.
    pub async fn verify_connection(
        &self,
        domain: &str,
        port: u16,
        chain: &[CertificateDer<'_>],
    ) -> Result<bool, DaneError> {
        let records = self.resolver.lookup_tlsa(domain, port).await?;
        if records.is_empty() {
            debug!(domain, port, "No TLSA records, DANE not applicable");
            return Ok(false);
        }
        if chain.is_empty() {
            return Err(DaneError::NoPeerCertificates);
        }

        let usable: Vec<&DaneRecord> = records
            .iter()
            .filter(|r| r.dnssec_verified || !self.require_dnssec)
            .collect();
        if usable.is_empty() {
            warn!(domain, port, "TLSA records are not DNSSEC-authenticated");
            return Err(DaneError::Unauthenticated {
                domain: domain.to_string(),
                port,
            });
        }

        for record in usable {
            match record_matches(record, chain) {
                Ok(true) => {
                    info!(
                        domain,
                        port,
                        usage = u8::from(record.usage),
                        selector = u8::from(record.selector),
                        matching_type = u8::from(record.matching_type),
                        "DANE verification succeeded"
                    );
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) => debug!(domain, port, error = %e, "TLSA record could not be evaluated"),
            }
        }

        warn!(domain, port, "No TLSA record matches the peer certificate");
        Err(DaneError::NoMatch {
            domain: domain.to_string(),
            port,
        })
    }
}
