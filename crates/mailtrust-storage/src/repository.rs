//! Repository layer for data access
//!
//! Each capability has its own trait so that callers depend only on what
//! they use, and tests can swap in [`crate::MemoryStore`].

pub mod dane_cache;
pub mod dkim_keys;
pub mod mta_sts_cache;
pub mod tls_reports;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailtrust_common::Result;

/// Persistent backing for one trust record cache.
///
/// `load` returns whatever is stored, fresh or not; freshness is decided
/// by the caller. `delete_expired` only removes entries whose expiry lies
/// strictly before `now`.
#[async_trait]
pub trait TrustRecordStore<K, V>: Send + Sync
where
    K: Send + Sync,
    V: Send + Sync,
{
    async fn load(&self, key: &K) -> Result<Option<V>>;
    async fn save(&self, key: &K, value: &V) -> Result<()>;
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

pub use dane_cache::DbDaneCacheRepository;
pub use dkim_keys::{DbDkimKeyRepository, DkimKeyRepository};
pub use mta_sts_cache::DbMtaStsCacheRepository;
pub use tls_reports::{DbTlsReportRepository, TlsReportRepository};
