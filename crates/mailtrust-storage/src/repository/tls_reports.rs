//! TLS report outbox repository

use crate::db::DatabasePool;
use crate::models::{NewTlsReport, TlsReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailtrust_common::types::TlsReportId;
use mailtrust_common::{normalize_domain, now_utc_seconds, Error, Result};

/// TLS report repository trait
#[async_trait]
pub trait TlsReportRepository: Send + Sync {
    async fn create(&self, input: &NewTlsReport) -> Result<TlsReport>;
    /// Unsent reports, oldest first
    async fn pending(&self) -> Result<Vec<TlsReport>>;
    /// Fails with `NotFound` unless the report exists and is still pending
    async fn mark_sent(&self, id: TlsReportId, sent_at: DateTime<Utc>) -> Result<()>;
}

/// Database TLS report repository
pub struct DbTlsReportRepository {
    pool: DatabasePool,
}

impl DbTlsReportRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TlsReportRepository for DbTlsReportRepository {
    async fn create(&self, input: &NewTlsReport) -> Result<TlsReport> {
        let report = TlsReport {
            id: 0,
            report_id: input.report_id.clone(),
            domain: normalize_domain(&input.domain),
            date_range_start: input.date_range_start,
            date_range_end: input.date_range_end,
            contact_info: input.contact_info.clone(),
            report_payload: input.report_payload.clone(),
            created_at: now_utc_seconds(),
            sent_at: None,
        };

        let result = sqlx::query(
            r#"
            INSERT INTO tls_reports (
                report_id, domain, date_range_start, date_range_end,
                contact_info, report_payload, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&report.report_id)
        .bind(&report.domain)
        .bind(report.date_range_start)
        .bind(report.date_range_end)
        .bind(&report.contact_info)
        .bind(&report.report_payload)
        .bind(report.created_at)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(TlsReport {
            id: result.last_insert_rowid(),
            ..report
        })
    }

    async fn pending(&self) -> Result<Vec<TlsReport>> {
        sqlx::query_as::<_, TlsReport>(
            r#"
            SELECT id, report_id, domain, date_range_start, date_range_end,
                   contact_info, report_payload, created_at, sent_at
            FROM tls_reports
            WHERE sent_at IS NULL
            ORDER BY created_at, id
            "#,
        )
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn mark_sent(&self, id: TlsReportId, sent_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE tls_reports SET sent_at = ? WHERE id = ? AND sent_at IS NULL")
            .bind(sent_at)
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Pending TLS report {}", id)));
        }
        Ok(())
    }
}
