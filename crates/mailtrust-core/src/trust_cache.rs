//! Trust Record Cache
//!
//! Persistent, TTL-bounded cache in front of DNS and HTTPS lookups. Reads
//! return a stored entry while it is fresh; otherwise the caller's fetch
//! runs and its result is written back. Concurrent cold lookups for the
//! same key share one fetch.
//!
//! Storage failures never reach the caller: a failed read is a miss and a
//! failed write only costs the next lookup a refetch.

use chrono::{DateTime, Utc};
use mailtrust_common::now_utc_seconds;
use mailtrust_storage::{DaneRecord, MtaStsPolicy, TrustRecordStore};
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex as SyncMutex};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Entries that know when they stop being trustworthy
pub trait Freshness {
    fn is_fresh_at(&self, now: DateTime<Utc>) -> bool;
}

/// A TLSA answer is fresh while every record in it is
impl Freshness for Vec<DaneRecord> {
    fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_empty() && self.iter().all(|r| r.is_fresh_at(now))
    }
}

impl Freshness for MtaStsPolicy {
    fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        MtaStsPolicy::is_fresh_at(self, now)
    }
}

pub struct TrustRecordCache<K, V> {
    name: &'static str,
    store: Arc<dyn TrustRecordStore<K, V>>,
    in_flight: SyncMutex<HashMap<K, Arc<Mutex<()>>>>,
}

/// A caller's claim on the per-key gate. Dropping it, on completion or
/// when the caller's future is cancelled, forgets the gate once no other
/// caller holds it.
struct InFlight<'a, K: Eq + Hash> {
    map: &'a SyncMutex<HashMap<K, Arc<Mutex<()>>>>,
    key: K,
    gate: Arc<Mutex<()>>,
}

impl<'a, K: Clone + Eq + Hash> InFlight<'a, K> {
    fn enter(map: &'a SyncMutex<HashMap<K, Arc<Mutex<()>>>>, key: &K) -> Self {
        let mut in_flight = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let gate = in_flight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        Self {
            map,
            key: key.clone(),
            gate,
        }
    }
}

impl<K: Eq + Hash> Drop for InFlight<'_, K> {
    fn drop(&mut self) {
        let mut in_flight = self
            .map
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Only the map and this claim remain: nobody else is waiting.
        if Arc::strong_count(&self.gate) <= 2 {
            in_flight.remove(&self.key);
        }
    }
}

impl<K, V> TrustRecordCache<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Freshness + Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, store: Arc<dyn TrustRecordStore<K, V>>) -> Self {
        Self {
            name,
            store,
            in_flight: SyncMutex::new(HashMap::new()),
        }
    }

    /// Return the fresh entry for `key`, or run `fetch` and store its result.
    ///
    /// Fetch errors are returned as-is and nothing is written.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: &K, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.fresh(key).await {
            return Ok(value);
        }

        let claim = InFlight::enter(&self.in_flight, key);
        let _turn = claim.gate.lock().await;

        // Whoever held the gate before us may have filled the entry.
        if let Some(value) = self.fresh(key).await {
            return Ok(value);
        }

        let fetched = fetch().await;
        if let Ok(value) = &fetched {
            self.write(key, value).await;
        }
        fetched
    }

    /// Stored entry regardless of freshness
    pub async fn peek(&self, key: &K) -> Option<V> {
        match self.store.load(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(cache = self.name, ?key, error = %e, "Trust record cache read failed");
                None
            }
        }
    }

    /// Delete entries whose expiry lies before now
    pub async fn evict_expired(&self) -> mailtrust_common::Result<u64> {
        let deleted = self.store.delete_expired(now_utc_seconds()).await?;
        if deleted > 0 {
            info!(cache = self.name, count = deleted, "Evicted expired trust records");
        }
        Ok(deleted)
    }

    async fn fresh(&self, key: &K) -> Option<V> {
        let value = self.peek(key).await?;
        if value.is_fresh_at(Utc::now()) {
            debug!(cache = self.name, ?key, "Trust record cache hit");
            Some(value)
        } else {
            None
        }
    }

    async fn write(&self, key: &K, value: &V) {
        if let Err(e) = self.store.save(key, value).await {
            warn!(cache = self.name, ?key, error = %e, "Trust record cache write failed");
        }
    }

}
