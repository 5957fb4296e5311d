//! SMTP TLS Reporting (RFC 8460)
//!
//! Delivery attempts record success and failure observations in a
//! [`TlsRptCollector`]. A periodic flush turns the tallies into one
//! aggregate report per policy domain and queues it in the outbox, where
//! an external sender picks up pending rows.

use chrono::{DateTime, Utc};
use mailtrust_common::types::TlsReportId;
use mailtrust_common::{normalize_domain, now_utc_seconds, Error, Result};
use mailtrust_storage::{NewTlsReport, TlsReport, TlsReportRepository};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyType {
    Sts,
    Tlsa,
    NoPolicyFound,
}

/// Failure result types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResultType {
    StarttlsNotSupported,
    CertificateHostMismatch,
    CertificateExpired,
    CertificateNotTrusted,
    ValidationFailure,
    TlsaInvalid,
    DnssecInvalid,
    DaneRequired,
    StsPolicyFetchError,
    StsPolicyInvalid,
    StsWebpkiInvalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DateRange {
    pub start_datetime: DateTime<Utc>,
    pub end_datetime: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PolicyDetails {
    pub policy_type: PolicyType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policy_string: Vec<String>,
    pub policy_domain: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mx_host: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Summary {
    pub total_successful_session_count: u64,
    pub total_failure_session_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FailureDetails {
    pub result_type: ResultType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiving_mx_hostname: Option<String>,
    pub failed_session_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PolicyReport {
    pub policy: PolicyDetails,
    pub summary: Summary,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure_details: Vec<FailureDetails>,
}

/// Aggregate report document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TlsRptReport {
    pub organization_name: String,
    pub date_range: DateRange,
    pub contact_info: String,
    pub report_id: String,
    pub policies: Vec<PolicyReport>,
}

/// Outbox of reports awaiting transmission
pub struct TlsReportQueue {
    repo: Arc<dyn TlsReportRepository>,
}

impl TlsReportQueue {
    pub fn new(repo: Arc<dyn TlsReportRepository>) -> Self {
        Self { repo }
    }

    /// Queue `report` for `domain`
    pub async fn create_report(&self, domain: &str, report: &TlsRptReport) -> Result<TlsReport> {
        let payload = serde_json::to_string(report)
            .map_err(|e| Error::Internal(format!("failed to serialize TLS report: {}", e)))?;

        let contact_info = if report.contact_info.is_empty() {
            None
        } else {
            Some(report.contact_info.clone())
        };

        self.repo
            .create(&NewTlsReport {
                report_id: report.report_id.clone(),
                domain: normalize_domain(domain),
                date_range_start: report.date_range.start_datetime,
                date_range_end: report.date_range.end_datetime,
                contact_info,
                report_payload: payload,
            })
            .await
    }

    /// Reports not yet sent, oldest first
    pub async fn pending_reports(&self) -> Result<Vec<TlsReport>> {
        self.repo.pending().await
    }

    pub async fn mark_sent(&self, id: TlsReportId) -> Result<()> {
        self.repo.mark_sent(id, now_utc_seconds()).await
    }
}

#[derive(Debug, Clone, Default)]
struct Tally {
    successes: u64,
    mx_hosts: BTreeSet<String>,
    failures: BTreeMap<(ResultType, Option<String>), u64>,
}

impl Tally {
    fn merge(&mut self, other: Tally) {
        self.successes += other.successes;
        self.mx_hosts.extend(other.mx_hosts);
        for (key, count) in other.failures {
            *self.failures.entry(key).or_insert(0) += count;
        }
    }
}

/// In-memory success/failure counters per (policy domain, policy type)
#[derive(Default)]
pub struct TlsRptCollector {
    tallies: Mutex<HashMap<(String, PolicyType), Tally>>,
}

impl TlsRptCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_success(&self, domain: &str, policy_type: PolicyType, mx_host: Option<&str>) {
        let mut tallies = self.tallies.lock().await;
        let tally = tallies
            .entry((normalize_domain(domain), policy_type))
            .or_default();
        tally.successes += 1;
        if let Some(mx) = mx_host {
            tally.mx_hosts.insert(normalize_domain(mx));
        }
    }

    pub async fn record_failure(
        &self,
        domain: &str,
        policy_type: PolicyType,
        result_type: ResultType,
        mx_host: Option<&str>,
    ) {
        let mx_host = mx_host.map(normalize_domain);
        let mut tallies = self.tallies.lock().await;
        let tally = tallies
            .entry((normalize_domain(domain), policy_type))
            .or_default();
        if let Some(mx) = &mx_host {
            tally.mx_hosts.insert(mx.clone());
        }
        *tally.failures.entry((result_type, mx_host)).or_insert(0) += 1;
    }

    /// Number of (domain, policy type) pairs with observations
    pub async fn len(&self) -> usize {
        self.tallies.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tallies.lock().await.is_empty()
    }

    /// Turn the collected tallies into one report per domain, queue
    /// them, and reset the counters.
    ///
    /// A domain whose report cannot be queued keeps its counts; they are
    /// merged with anything recorded meanwhile and go out with the next
    /// flush. The other domains are still queued.
    pub async fn flush(
        &self,
        queue: &TlsReportQueue,
        organization: &str,
        contact: &str,
        range: (DateTime<Utc>, DateTime<Utc>),
    ) -> Vec<TlsReport> {
        let tallies = std::mem::take(&mut *self.tallies.lock().await);

        let mut by_domain: BTreeMap<String, Vec<(PolicyType, Tally)>> = BTreeMap::new();
        for ((domain, policy_type), tally) in tallies {
            by_domain.entry(domain).or_default().push((policy_type, tally));
        }

        let mut queued = Vec::new();
        for (domain, mut tallies) in by_domain {
            tallies.sort_by_key(|(policy_type, _)| *policy_type);
            let report = TlsRptReport {
                organization_name: organization.to_string(),
                date_range: DateRange {
                    start_datetime: range.0,
                    end_datetime: range.1,
                },
                contact_info: contact.to_string(),
                report_id: Uuid::new_v4().to_string(),
                policies: tallies
                    .iter()
                    .map(|(policy_type, tally)| policy_report(domain.clone(), *policy_type, tally.clone()))
                    .collect(),
            };

            match queue.create_report(&domain, &report).await {
                Ok(row) => {
                    info!(domain = %domain, report_id = %row.report_id, "Queued TLS report");
                    queued.push(row);
                }
                Err(e) => {
                    error!(domain = %domain, error = %e, "Failed to queue TLS report, keeping counts");
                    self.restore(&domain, tallies).await;
                }
            }
        }

        queued
    }

    async fn restore(&self, domain: &str, tallies: Vec<(PolicyType, Tally)>) {
        let mut current = self.tallies.lock().await;
        for (policy_type, tally) in tallies {
            current
                .entry((domain.to_string(), policy_type))
                .or_default()
                .merge(tally);
        }
    }
}

fn policy_report(domain: String, policy_type: PolicyType, tally: Tally) -> PolicyReport {
    let failure_details: Vec<FailureDetails> = tally
        .failures
        .into_iter()
        .map(|((result_type, mx), count)| FailureDetails {
            result_type,
            receiving_mx_hostname: mx,
            failed_session_count: count,
        })
        .collect();

    PolicyReport {
        policy: PolicyDetails {
            policy_type,
            policy_string: Vec::new(),
            policy_domain: domain,
            mx_host: tally.mx_hosts.into_iter().collect(),
        },
        summary: Summary {
            total_successful_session_count: tally.successes,
            total_failure_session_count: failure_details.iter().map(|f| f.failed_session_count).sum(),
        },
        failure_details,
    }
}
