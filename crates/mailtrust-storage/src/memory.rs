//! In-memory implementations of every repository trait
//!
//! Used by tests and by deployments that do not need the caches or the
//! report outbox to survive a restart.

use crate::models::{DaneRecord, DkimKeyPair, MtaStsPolicy, NewTlsReport, TlsReport, TlsaKey};
use crate::repository::{DkimKeyRepository, TlsReportRepository, TrustRecordStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailtrust_common::types::TlsReportId;
use mailtrust_common::{normalize_domain, now_utc_seconds, Error, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryStore {
    dkim_keys: RwLock<Vec<DkimKeyPair>>,
    dane: RwLock<HashMap<TlsaKey, Vec<DaneRecord>>>,
    mta_sts: RwLock<HashMap<String, MtaStsPolicy>>,
    tls_reports: RwLock<Vec<TlsReport>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DkimKeyRepository for MemoryStore {
    async fn insert(&self, key: &DkimKeyPair) -> Result<()> {
        let mut keys = self.dkim_keys.write().await;
        let domain = normalize_domain(&key.domain);
        if keys
            .iter()
            .any(|k| k.domain == domain && k.selector == key.selector)
        {
            return Err(Error::Database(format!(
                "Duplicate DKIM selector {} for {}",
                key.selector, domain
            )));
        }
        keys.push(DkimKeyPair {
            domain,
            ..key.clone()
        });
        Ok(())
    }

    async fn active_for_domain(&self, domain: &str) -> Result<Option<DkimKeyPair>> {
        Ok(self.list_for_domain(domain).await?.into_iter().next())
    }

    async fn list_for_domain(&self, domain: &str) -> Result<Vec<DkimKeyPair>> {
        let domain = normalize_domain(domain);
        let mut keys: Vec<DkimKeyPair> = self
            .dkim_keys
            .read()
            .await
            .iter()
            .filter(|k| k.domain == domain)
            .cloned()
            .collect();
        keys.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.selector.cmp(&a.selector))
        });
        Ok(keys)
    }
}

#[async_trait]
impl TrustRecordStore<TlsaKey, Vec<DaneRecord>> for MemoryStore {
    async fn load(&self, key: &TlsaKey) -> Result<Option<Vec<DaneRecord>>> {
        Ok(self
            .dane
            .read()
            .await
            .get(key)
            .filter(|records| !records.is_empty())
            .cloned())
    }

    async fn save(&self, key: &TlsaKey, records: &Vec<DaneRecord>) -> Result<()> {
        self.dane.write().await.insert(key.clone(), records.clone());
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut dane = self.dane.write().await;
        let mut deleted = 0u64;
        for records in dane.values_mut() {
            let before = records.len();
            records.retain(|r| r.expires_at() >= now);
            deleted += (before - records.len()) as u64;
        }
        dane.retain(|_, records| !records.is_empty());
        Ok(deleted)
    }
}

#[async_trait]
impl TrustRecordStore<String, MtaStsPolicy> for MemoryStore {
    async fn load(&self, domain: &String) -> Result<Option<MtaStsPolicy>> {
        Ok(self.mta_sts.read().await.get(domain).cloned())
    }

    async fn save(&self, domain: &String, policy: &MtaStsPolicy) -> Result<()> {
        self.mta_sts
            .write()
            .await
            .insert(domain.clone(), policy.clone());
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut policies = self.mta_sts.write().await;
        let before = policies.len();
        policies.retain(|_, p| p.expires_at >= now);
        Ok((before - policies.len()) as u64)
    }
}

#[async_trait]
impl TlsReportRepository for MemoryStore {
    async fn create(&self, input: &NewTlsReport) -> Result<TlsReport> {
        let mut reports = self.tls_reports.write().await;
        let domain = normalize_domain(&input.domain);
        if reports
            .iter()
            .any(|r| r.report_id == input.report_id && r.domain == domain)
        {
            return Err(Error::Database(format!(
                "Duplicate TLS report {} for {}",
                input.report_id, domain
            )));
        }

        let report = TlsReport {
            id: reports.len() as TlsReportId + 1,
            report_id: input.report_id.clone(),
            domain,
            date_range_start: input.date_range_start,
            date_range_end: input.date_range_end,
            contact_info: input.contact_info.clone(),
            report_payload: input.report_payload.clone(),
            created_at: now_utc_seconds(),
            sent_at: None,
        };
        reports.push(report.clone());
        Ok(report)
    }

    async fn pending(&self) -> Result<Vec<TlsReport>> {
        let mut pending: Vec<TlsReport> = self
            .tls_reports
            .read()
            .await
            .iter()
            .filter(|r| r.is_pending())
            .cloned()
            .collect();
        pending.sort_by_key(|r| (r.created_at, r.id));
        Ok(pending)
    }

    async fn mark_sent(&self, id: TlsReportId, sent_at: DateTime<Utc>) -> Result<()> {
        let mut reports = self.tls_reports.write().await;
        match reports.iter_mut().find(|r| r.id == id && r.is_pending()) {
            Some(report) => {
                report.sent_at = Some(sent_at);
                Ok(())
            }
            None => Err(Error::NotFound(format!("Pending TLS report {}", id))),
        }
    }
}
