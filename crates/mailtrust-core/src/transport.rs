//! Per-MX transport security check for outbound delivery
//!
//! Combines the recipient domain's MTA-STS policy with the MX host's
//! DANE records and reports every outcome to the TLS reporting collector.

use crate::dane::{DaneError, DaneMatcher};
use crate::mta_sts::{MtaStsEnforcer, MtaStsError, PolicyDecision};
use crate::tlsrpt::{PolicyType, ResultType, TlsRptCollector};
use rustls::pki_types::CertificateDer;
use std::sync::Arc;
use tracing::{debug, info};

/// Whether delivery to one MX candidate may proceed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportVerdict {
    /// The peer chain matched the host's TLSA records
    Verified,
    /// No policy blocks delivery
    Allowed,
    /// DANE status is unknown; retry later
    Deferred(String),
    /// Do not deliver to this MX
    Rejected(String),
}

impl TransportVerdict {
    pub fn may_deliver(&self) -> bool {
        matches!(self, TransportVerdict::Verified | TransportVerdict::Allowed)
    }
}

pub struct TransportGuard {
    mta_sts: Arc<MtaStsEnforcer>,
    dane: Arc<DaneMatcher>,
    reports: Arc<TlsRptCollector>,
}

impl TransportGuard {
    pub fn new(
        mta_sts: Arc<MtaStsEnforcer>,
        dane: Arc<DaneMatcher>,
        reports: Arc<TlsRptCollector>,
    ) -> Self {
        Self {
            mta_sts,
            dane,
            reports,
        }
    }

    /// Check a TLS session to `mx_host:port`, which serves mail for
    /// `domain` and presented `chain` (leaf first).
    pub async fn check_mx(
        &self,
        domain: &str,
        mx_host: &str,
        port: u16,
        chain: &[CertificateDer<'_>],
    ) -> TransportVerdict {
        let sts_governed = match self.mta_sts.check(domain, mx_host).await {
            Ok(PolicyDecision::Allowed) => true,
            Ok(PolicyDecision::NotEnforced) => false,
            Ok(PolicyDecision::Violation) => {
                self.failure(domain, PolicyType::Sts, ResultType::ValidationFailure, mx_host)
                    .await;
                false
            }
            Ok(PolicyDecision::Rejected) => {
                self.failure(domain, PolicyType::Sts, ResultType::ValidationFailure, mx_host)
                    .await;
                return TransportVerdict::Rejected(format!(
                    "{} is not an MTA-STS permitted MX for {}",
                    mx_host, domain
                ));
            }
            Err(MtaStsError::Parse(e)) => {
                debug!(domain, error = %e, "Ignoring invalid MTA-STS policy");
                self.failure(domain, PolicyType::Sts, ResultType::StsPolicyInvalid, mx_host)
                    .await;
                false
            }
            Err(e) => {
                debug!(domain, error = %e, "No MTA-STS policy");
                false
            }
        };

        let dane_verified = match self.dane.verify_connection(mx_host, port, chain).await {
            Ok(matched) => matched,
            Err(DaneError::Lookup(reason)) => {
                info!(domain, mx_hostname = mx_host, port, reason = %reason, "DANE status unknown, deferring");
                return TransportVerdict::Deferred(reason);
            }
            Err(DaneError::Unauthenticated { .. }) => {
                self.failure(domain, PolicyType::Tlsa, ResultType::DnssecInvalid, mx_host)
                    .await;
                false
            }
            Err(e) => {
                let result_type = match e {
                    DaneError::NoPeerCertificates => ResultType::StarttlsNotSupported,
                    DaneError::Certificate(_) => ResultType::CertificateNotTrusted,
                    _ => ResultType::TlsaInvalid,
                };
                self.failure(domain, PolicyType::Tlsa, result_type, mx_host).await;
                return TransportVerdict::Rejected(e.to_string());
            }
        };

        if dane_verified {
            self.reports
                .record_success(domain, PolicyType::Tlsa, Some(mx_host))
                .await;
        }
        if sts_governed {
            self.reports
                .record_success(domain, PolicyType::Sts, Some(mx_host))
                .await;
        }
        if !dane_verified && !sts_governed {
            self.reports
                .record_success(domain, PolicyType::NoPolicyFound, Some(mx_host))
                .await;
        }

        if dane_verified {
            TransportVerdict::Verified
        } else {
            TransportVerdict::Allowed
        }
    }

    async fn failure(&self, domain: &str, policy_type: PolicyType, result_type: ResultType, mx_host: &str) {
        self.reports
            .record_failure(domain, policy_type, result_type, Some(mx_host))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dane::{DaneResolver, TlsaAnswer, TlsaData, TlsaSource};
    use crate::mta_sts::{MtaStsFetcher, PolicySource};
    use crate::tlsrpt::TlsReportQueue;
    use async_trait::async_trait;
    use chrono::Duration;
    use mailtrust_common::now_utc_seconds;
    use mailtrust_storage::{MemoryStore, TlsaKey, TlsaMatchingType, TlsaSelector, TlsaUsage};
    use pretty_assertions::assert_eq;
    use sha2::{Digest, Sha256};

    struct Policy(Option<&'static str>);

    #[async_trait]
    impl PolicySource for Policy {
        async fn fetch_policy_text(&self, _domain: &str) -> Result<String, MtaStsError> {
            self.0
                .map(str::to_string)
                .ok_or(MtaStsError::Status(404))
        }
    }

    enum Tlsa {
        Records(Vec<TlsaData>, bool),
        Broken,
    }

    #[async_trait]
    impl TlsaSource for Tlsa {
        async fn query_tlsa(&self, _key: &TlsaKey) -> Result<TlsaAnswer, DaneError> {
            match self {
                Tlsa::Records(records, authenticated) => Ok(TlsaAnswer {
                    records: records.clone(),
                    authenticated: *authenticated,
                }),
                Tlsa::Broken => Err(DaneError::Lookup("SERVFAIL".to_string())),
            }
        }
    }

    const LEAF: &[u8] = b"pretend this is a DER certificate";

    fn full_cert_record(data: &[u8]) -> TlsaData {
        TlsaData {
            usage: TlsaUsage::DaneEe,
            selector: TlsaSelector::FullCertificate,
            matching_type: TlsaMatchingType::Sha256,
            certificate_data: Sha256::digest(data).to_vec(),
            ttl: 3600,
        }
    }

    fn guard(policy: Option<&'static str>, tlsa: Tlsa) -> (TransportGuard, Arc<TlsRptCollector>) {
        let store = Arc::new(MemoryStore::new());
        let fetcher = MtaStsFetcher::new(store.clone(), Arc::new(Policy(policy)));
        let resolver = DaneResolver::new(store, Arc::new(tlsa));
        let reports = Arc::new(TlsRptCollector::new());

        let guard = TransportGuard::new(
            Arc::new(MtaStsEnforcer::new(Arc::new(fetcher))),
            Arc::new(DaneMatcher::new(Arc::new(resolver), true)),
            reports.clone(),
        );
        (guard, reports)
    }

    fn chain() -> Vec<CertificateDer<'static>> {
        vec![CertificateDer::from(LEAF.to_vec())]
    }

    const ENFORCE: &str = "version: STSv1\nmode: enforce\nmx: *.example.com\nmax_age: 3600\n";
    const TESTING: &str = "version: STSv1\nmode: testing\nmx: *.example.com\nmax_age: 3600\n";

    async fn report_types(reports: &TlsRptCollector) -> Vec<(PolicyType, u64, u64)> {
        let queue = TlsReportQueue::new(Arc::new(MemoryStore::new()));
        let end = now_utc_seconds();
        let rows = reports
            .flush(&queue, "sender", "", (end - Duration::days(1), end))
            .await;
        rows.iter()
            .flat_map(|row| {
                serde_json::from_str::<crate::tlsrpt::TlsRptReport>(&row.report_payload)
                    .unwrap()
                    .policies
            })
            .map(|p| {
                (
                    p.policy.policy_type,
                    p.summary.total_successful_session_count,
                    p.summary.total_failure_session_count,
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_dane_match_is_verified() {
        let (guard, reports) = guard(Some(ENFORCE), Tlsa::Records(vec![full_cert_record(LEAF)], true));
        let verdict = guard.check_mx("example.com", "mx.example.com", 25, &chain()).await;

        assert_eq!(verdict, TransportVerdict::Verified);
        assert_eq!(
            report_types(&reports).await,
            vec![(PolicyType::Sts, 1, 0), (PolicyType::Tlsa, 1, 0)]
        );
    }

    #[tokio::test]
    async fn test_enforce_policy_rejects_unlisted_mx() {
        let (guard, reports) = guard(Some(ENFORCE), Tlsa::Records(Vec::new(), true));
        let verdict = guard.check_mx("example.com", "mx.attacker.net", 25, &chain()).await;

        assert!(matches!(verdict, TransportVerdict::Rejected(_)));
        assert_eq!(report_types(&reports).await, vec![(PolicyType::Sts, 0, 1)]);
    }

    #[tokio::test]
    async fn test_testing_policy_allows_unlisted_mx() {
        let (guard, reports) = guard(Some(TESTING), Tlsa::Records(Vec::new(), true));
        let verdict = guard.check_mx("example.com", "mx.attacker.net", 25, &chain()).await;

        assert_eq!(verdict, TransportVerdict::Allowed);
        assert_eq!(
            report_types(&reports).await,
            vec![(PolicyType::Sts, 0, 1), (PolicyType::NoPolicyFound, 1, 0)]
        );
    }

    #[tokio::test]
    async fn test_dane_mismatch_is_rejected() {
        let (guard, _) = guard(None, Tlsa::Records(vec![full_cert_record(b"other")], true));
        let verdict = guard.check_mx("example.com", "mx.example.com", 25, &chain()).await;
        assert!(matches!(verdict, TransportVerdict::Rejected(_)));
        assert!(!verdict.may_deliver());
    }

    #[tokio::test]
    async fn test_resolver_failure_defers() {
        let (guard, _) = guard(None, Tlsa::Broken);
        let verdict = guard.check_mx("example.com", "mx.example.com", 25, &chain()).await;
        assert_eq!(verdict, TransportVerdict::Deferred("SERVFAIL".to_string()));
    }

    #[tokio::test]
    async fn test_unauthenticated_tlsa_is_reported_and_allowed() {
        let (guard, reports) = guard(None, Tlsa::Records(vec![full_cert_record(LEAF)], false));
        let verdict = guard.check_mx("example.com", "mx.example.com", 25, &chain()).await;

        assert_eq!(verdict, TransportVerdict::Allowed);
        assert_eq!(
            report_types(&reports).await,
            vec![(PolicyType::Tlsa, 0, 1), (PolicyType::NoPolicyFound, 1, 0)]
        );
    }

    #[tokio::test]
    async fn test_no_policies_at_all() {
        let (guard, reports) = guard(None, Tlsa::Records(Vec::new(), true));
        let verdict = guard.check_mx("example.com", "mx.example.com", 25, &chain()).await;

        assert_eq!(verdict, TransportVerdict::Allowed);
        assert_eq!(report_types(&reports).await, vec![(PolicyType::NoPolicyFound, 1, 0)]);
    }
}
