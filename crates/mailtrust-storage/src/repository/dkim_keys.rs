//! DKIM key repository

use crate::db::DatabasePool;
use crate::models::DkimKeyPair;
use async_trait::async_trait;
use mailtrust_common::{normalize_domain, Error, Result};

/// DKIM key repository trait
#[async_trait]
pub trait DkimKeyRepository: Send + Sync {
    async fn insert(&self, key: &DkimKeyPair) -> Result<()>;
    /// Newest key for the domain
    async fn active_for_domain(&self, domain: &str) -> Result<Option<DkimKeyPair>>;
    /// All keys for the domain, newest first
    async fn list_for_domain(&self, domain: &str) -> Result<Vec<DkimKeyPair>>;
}

/// Database DKIM key repository
pub struct DbDkimKeyRepository {
    pool: DatabasePool,
}

impl DbDkimKeyRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

const SELECT_KEYS: &str = r#"
    SELECT id, domain, selector, algorithm, private_key_pem, public_key_der, created_at
    FROM dkim_keys
    WHERE domain = ?
    ORDER BY created_at DESC, selector DESC
"#;

#[async_trait]
impl DkimKeyRepository for DbDkimKeyRepository {
    async fn insert(&self, key: &DkimKeyPair) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dkim_keys (
                id, domain, selector, algorithm, private_key_pem, public_key_der, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(key.id)
        .bind(normalize_domain(&key.domain))
        .bind(&key.selector)
        .bind(key.algorithm.as_str())
        .bind(&key.private_key_pem)
        .bind(&key.public_key_der)
        .bind(key.created_at)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    async fn active_for_domain(&self, domain: &str) -> Result<Option<DkimKeyPair>> {
        sqlx::query_as::<_, DkimKeyPair>(&format!("{} LIMIT 1", SELECT_KEYS))
            .bind(normalize_domain(domain))
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list_for_domain(&self, domain: &str) -> Result<Vec<DkimKeyPair>> {
        sqlx::query_as::<_, DkimKeyPair>(SELECT_KEYS)
            .bind(normalize_domain(domain))
            .fetch_all(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }
}
