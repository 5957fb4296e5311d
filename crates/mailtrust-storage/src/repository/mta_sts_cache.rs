//! MTA-STS policy cache repository

use super::TrustRecordStore;
use crate::db::DatabasePool;
use crate::models::MtaStsPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailtrust_common::{Error, Result};
use sqlx::types::Json;

/// Database MTA-STS policy cache
pub struct DbMtaStsCacheRepository {
    pool: DatabasePool,
}

impl DbMtaStsCacheRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TrustRecordStore<String, MtaStsPolicy> for DbMtaStsCacheRepository {
    async fn load(&self, domain: &String) -> Result<Option<MtaStsPolicy>> {
        sqlx::query_as::<_, MtaStsPolicy>(
            r#"
            SELECT domain, version, mode, max_age, mx_patterns, policy_text,
                   fetched_at, expires_at
            FROM mtasts_policy_cache
            WHERE domain = ?
            "#,
        )
        .bind(domain)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn save(&self, domain: &String, policy: &MtaStsPolicy) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO mtasts_policy_cache (
                domain, version, mode, max_age, mx_patterns, policy_text, fetched_at, expires_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (domain) DO UPDATE SET
                version = excluded.version,
                mode = excluded.mode,
                max_age = excluded.max_age,
                mx_patterns = excluded.mx_patterns,
                policy_text = excluded.policy_text,
                fetched_at = excluded.fetched_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(domain)
        .bind(&policy.version)
        .bind(policy.mode.as_str())
        .bind(policy.max_age)
        .bind(Json(&policy.mx_patterns))
        .bind(&policy.policy_text)
        .bind(policy.fetched_at)
        .bind(policy.expires_at)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM mtasts_policy_cache WHERE expires_at < ?")
            .bind(now)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }
}
