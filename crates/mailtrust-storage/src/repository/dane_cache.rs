//! DANE TLSA cache repository

use super::TrustRecordStore;
use crate::db::DatabasePool;
use crate::models::{DaneRecord, TlsaKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailtrust_common::{Error, Result};
use tracing::debug;

/// Database TLSA cache.
///
/// Saving a key replaces every row for that `(domain, port)` inside one
/// transaction, so readers see either the previous answer or the new one.
pub struct DbDaneCacheRepository {
    pool: DatabasePool,
}

impl DbDaneCacheRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TrustRecordStore<TlsaKey, Vec<DaneRecord>> for DbDaneCacheRepository {
    async fn load(&self, key: &TlsaKey) -> Result<Option<Vec<DaneRecord>>> {
        let records = sqlx::query_as::<_, DaneRecord>(
            r#"
            SELECT domain, port, usage, selector, matching_type,
                   certificate_data, fetched_at, ttl, dnssec_verified
            FROM dane_tlsa_cache
            WHERE domain = ? AND port = ?
            ORDER BY id
            "#,
        )
        .bind(&key.domain)
        .bind(key.port)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if records.is_empty() {
            Ok(None)
        } else {
            Ok(Some(records))
        }
    }

    async fn save(&self, key: &TlsaKey, records: &Vec<DaneRecord>) -> Result<()> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        sqlx::query("DELETE FROM dane_tlsa_cache WHERE domain = ? AND port = ?")
            .bind(&key.domain)
            .bind(key.port)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        for record in records {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO dane_tlsa_cache (
                    domain, port, usage, selector, matching_type,
                    certificate_data, fetched_at, ttl, expires_at, dnssec_verified
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&key.domain)
            .bind(key.port)
            .bind(u8::from(record.usage))
            .bind(u8::from(record.selector))
            .bind(u8::from(record.matching_type))
            .bind(&record.certificate_data)
            .bind(record.fetched_at)
            .bind(record.ttl)
            .bind(record.expires_at())
            .bind(record.dnssec_verified)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        debug!(domain = %key.domain, port = key.port, count = records.len(), "Stored TLSA records");
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM dane_tlsa_cache WHERE expires_at < ?")
            .bind(now)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }
}
