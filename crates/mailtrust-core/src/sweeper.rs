//! Background eviction of expired trust records

use crate::dane::DaneResolver;
use crate::mta_sts::MtaStsFetcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info};

pub struct CacheSweeper {
    dane: Arc<DaneResolver>,
    mta_sts: Arc<MtaStsFetcher>,
    interval: Duration,
}

impl CacheSweeper {
    pub fn new(dane: Arc<DaneResolver>, mta_sts: Arc<MtaStsFetcher>, interval: Duration) -> Self {
        Self {
            dane,
            mta_sts,
            interval,
        }
    }

    /// Run one eviction pass over both caches, returning the number of
    /// DANE rows and MTA-STS policies removed
    pub async fn sweep_once(&self) -> (u64, u64) {
        let dane = self.dane.clear_cache().await.unwrap_or_else(|e| {
            error!("Error evicting TLSA records: {}", e);
            0
        });
        let mta_sts = self.mta_sts.clear_cache().await.unwrap_or_else(|e| {
            error!("Error evicting MTA-STS policies: {}", e);
            0
        });
        debug!(dane, mta_sts, "Cache sweep finished");
        (dane, mta_sts)
    }

    pub async fn run(&self) {
        let mut ticker = interval(self.interval);

        info!("Cache sweeper started (interval: {}s)", self.interval.as_secs());

        loop {
            ticker.tick().await;
            self.sweep_once().await;
        }
    }
}

/// Run `sweeper` on the tokio runtime until the handle is aborted
pub fn spawn_cache_sweeper(sweeper: CacheSweeper) -> JoinHandle<()> {
    tokio::spawn(async move { sweeper.run().await })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dane::{DaneError, TlsaAnswer, TlsaSource};
    use crate::mta_sts::{parse_policy, MtaStsError, PolicySource};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use mailtrust_common::now_utc_seconds;
    use mailtrust_storage::{
        DaneRecord, MemoryStore, TlsaKey, TlsaMatchingType, TlsaSelector, TlsaUsage,
        TrustRecordStore,
    };
    use pretty_assertions::assert_eq;

    struct Offline;

    #[async_trait]
    impl TlsaSource for Offline {
        async fn query_tlsa(&self, _key: &TlsaKey) -> Result<TlsaAnswer, DaneError> {
            Err(DaneError::Lookup("offline".to_string()))
        }
    }

    #[async_trait]
    impl PolicySource for Offline {
        async fn fetch_policy_text(&self, _domain: &str) -> Result<String, MtaStsError> {
            Err(MtaStsError::Fetch("offline".to_string()))
        }
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let old = now_utc_seconds() - ChronoDuration::days(1);

        let key = TlsaKey::new("mx.example.com", 25);
        let record = DaneRecord {
            domain: key.domain.clone(),
            port: key.port,
            usage: TlsaUsage::DaneEe,
            selector: TlsaSelector::SubjectPublicKeyInfo,
            matching_type: TlsaMatchingType::Sha256,
            certificate_data: "00".repeat(32),
            fetched_at: old,
            ttl: 60,
            dnssec_verified: true,
        };
        store.save(&key, &vec![record]).await.unwrap();

        let policy = parse_policy(
            "example.com",
            "version: STSv1\nmode: none\nmax_age: 60\n",
            old,
        )
        .unwrap();
        store.save(&"example.com".to_string(), &policy).await.unwrap();
        store
    }

    fn sweeper(store: Arc<MemoryStore>) -> CacheSweeper {
        CacheSweeper::new(
            Arc::new(DaneResolver::new(store.clone(), Arc::new(Offline))),
            Arc::new(MtaStsFetcher::new(store, Arc::new(Offline))),
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn test_sweep_once_evicts_both_caches() {
        let sweeper = sweeper(seeded_store().await);
        assert_eq!(sweeper.sweep_once().await, (1, 1));
        assert_eq!(sweeper.sweep_once().await, (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_sweeper_runs_immediately() {
        let store = seeded_store().await;
        let handle = spawn_cache_sweeper(sweeper(store.clone()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.abort();

        assert!(store
            .load(&"example.com".to_string())
            .await
            .unwrap()
            .is_none());
    }
}
