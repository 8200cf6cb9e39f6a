//! Postgres implementation of the OutboxStore port.
//!
//! Expects the following table (owned by the host application's schema
//! management):
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS outbox_entries (
//!     id              UUID PRIMARY KEY,
//!     stream_name     TEXT NOT NULL,
//!     message_data    JSONB NOT NULL,
//!     status          TEXT NOT NULL DEFAULT 'PENDING',
//!     created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     locked_by       TEXT,
//!     locked_at       TIMESTAMPTZ,
//!     attempt_count   INT NOT NULL DEFAULT 0,
//!     last_error      TEXT,
//!     next_attempt_at TIMESTAMPTZ
//! );
//! CREATE INDEX IF NOT EXISTS outbox_entries_claimable
//!     ON outbox_entries (status, next_attempt_at, created_at);
//! ```
//!
//! The claim is a single conditional `UPDATE`; Postgres row locking makes
//! it atomic across workers with no further coordination.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use message_bus::Message;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::{ClaimOutcome, OutboxEntry, OutboxError, OutboxResult, OutboxStatus, OutboxStore};

/// Outbox store over a Postgres pool.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn entry_from_row(row: &PgRow) -> OutboxResult<OutboxEntry> {
    let id: Uuid = row.try_get("id")?;
    let message_data: serde_json::Value = row.try_get("message_data")?;
    let message: Message =
        serde_json::from_value(message_data).map_err(|source| OutboxError::Decode { id, source })?;
    let status: String = row.try_get("status")?;
    let status = OutboxStatus::from_str(&status)
        .ok_or_else(|| OutboxError::Storage(format!("unknown outbox status '{status}'")))?;
    let attempt_count: i32 = row.try_get("attempt_count")?;

    Ok(OutboxEntry {
        id,
        stream_name: row.try_get("stream_name")?,
        message,
        status,
        created_at: row.try_get("created_at")?,
        locked_by: row.try_get("locked_by")?,
        locked_at: row.try_get("locked_at")?,
        attempt_count: attempt_count.max(0) as u32,
        last_error: row.try_get("last_error")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
    })
}

const ALL_COLUMNS: &str = "id, stream_name, message_data, status, created_at, \
                           locked_by, locked_at, attempt_count, last_error, next_attempt_at";

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn enqueue(&self, entry: OutboxEntry) -> OutboxResult<()> {
        let message_data = serde_json::to_value(&entry.message).map_err(|source| {
            OutboxError::Decode {
                id: entry.id,
                source,
            }
        })?;

        sqlx::query(
            r#"
            INSERT INTO outbox_entries
                (id, stream_name, message_data, status, created_at, attempt_count)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.stream_name)
        .bind(message_data)
        .bind(entry.status.as_str())
        .bind(entry.created_at)
        .bind(entry.attempt_count as i32)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn due_entry_ids(
        &self,
        now: DateTime<Utc>,
        lock_timeout: Duration,
        limit: usize,
    ) -> OutboxResult<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM outbox_entries
            WHERE (status IN ('PENDING', 'FAILED')
                   AND (next_attempt_at IS NULL OR next_attempt_at <= $1))
               OR (status = 'PROCESSING'
                   AND locked_at < $1 - make_interval(secs => $2))
            ORDER BY created_at ASC
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(lock_timeout.as_secs_f64())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get("id").map_err(OutboxError::from))
            .collect()
    }

    async fn start_processing(
        &self,
        id: Uuid,
        worker_id: &str,
        lock_timeout: Duration,
    ) -> OutboxResult<ClaimOutcome> {
        let claimed = sqlx::query(&format!(
            r#"
            UPDATE outbox_entries
            SET status = 'PROCESSING', locked_by = $2, locked_at = now()
            WHERE id = $1
              AND ((status IN ('PENDING', 'FAILED')
                    AND (next_attempt_at IS NULL OR next_attempt_at <= now()))
                   OR (status = 'PROCESSING'
                       AND locked_at < now() - make_interval(secs => $3)))
            RETURNING {ALL_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(worker_id)
        .bind(lock_timeout.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = claimed {
            return Ok(ClaimOutcome::Claimed(entry_from_row(&row)?));
        }

        // Lost the race (or the entry moved on); classify for the caller.
        let row = sqlx::query("SELECT status FROM outbox_entries WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(OutboxError::EntryNotFound(id))?;
        let status: String = row.try_get("status")?;
        Ok(match OutboxStatus::from_str(&status) {
            Some(OutboxStatus::Processing) => ClaimOutcome::AlreadyLocked,
            Some(s) if s.is_terminal() => ClaimOutcome::Terminal,
            _ => ClaimOutcome::NotDue,
        })
    }

    async fn mark_published(&self, id: Uuid, worker_id: &str) -> OutboxResult<()> {
        sqlx::query(
            r#"
            UPDATE outbox_entries
            SET status = 'PUBLISHED', locked_by = NULL, locked_at = NULL
            WHERE id = $1 AND locked_by = $2 AND status = 'PROCESSING'
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
        abandon: bool,
    ) -> OutboxResult<()> {
        sqlx::query(
            r#"
            UPDATE outbox_entries
            SET status = CASE WHEN $5 THEN 'ABANDONED' ELSE 'FAILED' END,
                attempt_count = attempt_count + 1,
                last_error = $3,
                next_attempt_at = $4,
                locked_by = NULL,
                locked_at = NULL
            WHERE id = $1 AND locked_by = $2 AND status = 'PROCESSING'
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(error)
        .bind(next_attempt_at)
        .bind(abandon)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release(&self, id: Uuid, worker_id: &str) -> OutboxResult<()> {
        sqlx::query(
            r#"
            UPDATE outbox_entries
            SET status = 'PENDING', locked_by = NULL, locked_at = NULL
            WHERE id = $1 AND locked_by = $2 AND status = 'PROCESSING'
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cleanup(
        &self,
        published_before: DateTime<Utc>,
        abandoned_before: DateTime<Utc>,
    ) -> OutboxResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM outbox_entries
            WHERE (status = 'PUBLISHED' AND created_at < $1)
               OR (status = 'ABANDONED' AND created_at < $2)
            "#,
        )
        .bind(published_before)
        .bind(abandoned_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn counts_by_status(&self) -> OutboxResult<HashMap<OutboxStatus, u64>> {
        let rows =
            sqlx::query("SELECT status, COUNT(*) AS n FROM outbox_entries GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            if let Some(status) = OutboxStatus::from_str(&status) {
                counts.insert(status, n.max(0) as u64);
            }
        }
        Ok(counts)
    }

    async fn get(&self, id: Uuid) -> OutboxResult<Option<OutboxEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {ALL_COLUMNS} FROM outbox_entries WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| entry_from_row(&r)).transpose()
    }
}
