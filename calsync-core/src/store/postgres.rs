//! Postgres-backed store.
//!
//! Calendar locks are `pg_try_advisory_lock` locks taken on a dedicated connection
//! outside the pool, so they are enforced for every process sharing the database.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPoolOptions, PgRow};
use sqlx::{Connection, PgPool, Row};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncFailure, SyncResult};
use crate::lock::{AdvisoryLocks, LockSession};
use crate::normalize::NormalizedEvent;
use crate::store::{
    CalendarKey, CalendarSyncRun, CalendarSyncState, EventStore, RunCompletion, RunStatus,
    StateReset, SyncStateStore, SyncSuccess, UpsertCounts,
};

const SCHEMA: &str = include_str!("schema.sql");

const STATE_COLUMNS: &str = "calendar_id, sync_token, last_success_sync_token, last_synced_at, \
    last_succeeded_at, last_full_sync_at, last_attempted_at, last_error, last_error_code, \
    last_error_details, consecutive_failures, needs_reauth, in_progress, in_progress_started_at, \
    updated_at";

const RUN_COLUMNS: &str = "run_id, calendar_id, started_at, finished_at, status, attempt, \
    sync_token_in, sync_token_out, items_seen, items_upserted, items_cancelled, error_code, \
    error_payload";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[instrument(level = "debug", skip(url))]
    pub async fn connect(url: &str, max_connections: u32) -> SyncResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the sync tables if they do not exist yet.
    #[instrument(level = "info", skip(self))]
    pub async fn migrate(&self) -> SyncResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    fn state_from_row(row: &PgRow) -> SyncResult<CalendarSyncState> {
        Ok(CalendarSyncState {
            calendar_id: CalendarKey::from_raw(row.try_get::<String, _>("calendar_id")?),
            sync_token: row.try_get("sync_token")?,
            last_success_sync_token: row.try_get("last_success_sync_token")?,
            last_synced_at: row.try_get("last_synced_at")?,
            last_succeeded_at: row.try_get("last_succeeded_at")?,
            last_full_sync_at: row.try_get("last_full_sync_at")?,
            last_attempted_at: row.try_get("last_attempted_at")?,
            last_error: row.try_get("last_error")?,
            last_error_code: row.try_get("last_error_code")?,
            last_error_details: row.try_get("last_error_details")?,
            consecutive_failures: row.try_get("consecutive_failures")?,
            needs_reauth: row.try_get("needs_reauth")?,
            in_progress: row.try_get("in_progress")?,
            in_progress_started_at: row.try_get("in_progress_started_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn run_from_row(row: &PgRow) -> SyncResult<CalendarSyncRun> {
        let status: String = row.try_get("status")?;
        Ok(CalendarSyncRun {
            run_id: row.try_get("run_id")?,
            calendar_id: CalendarKey::from_raw(row.try_get::<String, _>("calendar_id")?),
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            status: RunStatus::parse(&status)?,
            attempt: row.try_get("attempt")?,
            sync_token_in: row.try_get("sync_token_in")?,
            sync_token_out: row.try_get("sync_token_out")?,
            items_seen: row.try_get("items_seen")?,
            items_upserted: row.try_get("items_upserted")?,
            items_cancelled: row.try_get("items_cancelled")?,
            error_code: row.try_get("error_code")?,
            error_payload: row.try_get("error_payload")?,
        })
    }

    async fn fetch_state(&self, calendar_id: &CalendarKey) -> SyncResult<Option<CalendarSyncState>> {
        let row = sqlx::query(&format!(
            "SELECT {STATE_COLUMNS} FROM calendar_sync_state WHERE calendar_id = $1"
        ))
        .bind(calendar_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::state_from_row).transpose()
    }

    async fn ensure_state(&self, calendar_id: &CalendarKey) -> SyncResult<()> {
        sqlx::query(
            "INSERT INTO calendar_sync_state (calendar_id) VALUES ($1) \
             ON CONFLICT (calendar_id) DO NOTHING",
        )
        .bind(calendar_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SyncStateStore for PgStore {
    async fn get_state(&self, calendar_id: &CalendarKey) -> SyncResult<Option<CalendarSyncState>> {
        self.fetch_state(calendar_id).await
    }

    async fn get_or_create_state(&self, calendar_id: &CalendarKey) -> SyncResult<CalendarSyncState> {
        self.ensure_state(calendar_id).await?;
        self.fetch_state(calendar_id).await?.ok_or_else(|| {
            SyncError::Storage(format!("sync state for '{calendar_id}' vanished after insert"))
        })
    }

    async fn list_states(&self) -> SyncResult<Vec<CalendarSyncState>> {
        let rows = sqlx::query(&format!(
            "SELECT {STATE_COLUMNS} FROM calendar_sync_state ORDER BY calendar_id"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::state_from_row).collect()
    }

    async fn mark_started(
        &self,
        calendar_id: &CalendarKey,
        at: DateTime<Utc>,
    ) -> SyncResult<CalendarSyncState> {
        let row = sqlx::query(&format!(
            "INSERT INTO calendar_sync_state \
                 (calendar_id, in_progress, in_progress_started_at, last_attempted_at, updated_at) \
             VALUES ($1, TRUE, $2, $2, $2) \
             ON CONFLICT (calendar_id) DO UPDATE SET \
                 in_progress = TRUE, \
                 in_progress_started_at = $2, \
                 last_attempted_at = $2, \
                 last_error = NULL, \
                 last_error_code = NULL, \
                 last_error_details = NULL, \
                 updated_at = $2 \
             RETURNING {STATE_COLUMNS}"
        ))
        .bind(calendar_id.as_str())
        .bind(at)
        .fetch_one(&self.pool)
        .await?;

        Self::state_from_row(&row)
    }

    async fn mark_succeeded(&self, calendar_id: &CalendarKey, success: &SyncSuccess) -> SyncResult<()> {
        sqlx::query(
            "UPDATE calendar_sync_state SET \
                 sync_token = $2, \
                 last_success_sync_token = $2, \
                 last_synced_at = $3, \
                 last_succeeded_at = $3, \
                 last_full_sync_at = CASE WHEN $4 THEN $3 ELSE last_full_sync_at END, \
                 consecutive_failures = 0, \
                 needs_reauth = FALSE, \
                 in_progress = FALSE, \
                 in_progress_started_at = NULL, \
                 last_error = NULL, \
                 last_error_code = NULL, \
                 last_error_details = NULL, \
                 updated_at = $3 \
             WHERE calendar_id = $1",
        )
        .bind(calendar_id.as_str())
        .bind(success.sync_token.as_deref())
        .bind(success.finished_at)
        .bind(success.full_sync)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        calendar_id: &CalendarKey,
        failure: &SyncFailure,
        at: DateTime<Utc>,
    ) -> SyncResult<()> {
        sqlx::query(
            "UPDATE calendar_sync_state SET \
                 last_error = $2, \
                 last_error_code = $3, \
                 last_error_details = $4, \
                 consecutive_failures = consecutive_failures + 1, \
                 needs_reauth = needs_reauth OR $5, \
                 in_progress = FALSE, \
                 in_progress_started_at = NULL, \
                 updated_at = $6 \
             WHERE calendar_id = $1",
        )
        .bind(calendar_id.as_str())
        .bind(&failure.message)
        .bind(failure.code.as_str())
        .bind(&failure.details)
        .bind(failure.needs_reauth())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset(
        &self,
        calendar_id: &CalendarKey,
        reset: &StateReset,
    ) -> SyncResult<Option<CalendarSyncState>> {
        let row = sqlx::query(&format!(
            "UPDATE calendar_sync_state SET \
                 sync_token = CASE WHEN $2 THEN NULL ELSE sync_token END, \
                 needs_reauth = CASE WHEN $3 THEN FALSE ELSE needs_reauth END, \
                 consecutive_failures = CASE WHEN $4 THEN 0 ELSE consecutive_failures END, \
                 last_error = CASE WHEN $4 THEN NULL ELSE last_error END, \
                 last_error_code = CASE WHEN $4 THEN NULL ELSE last_error_code END, \
                 last_error_details = CASE WHEN $4 THEN NULL ELSE last_error_details END, \
                 in_progress = CASE WHEN $5 THEN FALSE ELSE in_progress END, \
                 in_progress_started_at = CASE WHEN $5 THEN NULL ELSE in_progress_started_at END, \
                 updated_at = now() \
             WHERE calendar_id = $1 \
             RETURNING {STATE_COLUMNS}"
        ))
        .bind(calendar_id.as_str())
        .bind(reset.clear_sync_token)
        .bind(reset.clear_needs_reauth)
        .bind(reset.reset_failures)
        .bind(reset.clear_in_progress)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::state_from_row).transpose()
    }

    async fn start_run(&self, run: &CalendarSyncRun) -> SyncResult<()> {
        sqlx::query(
            "INSERT INTO calendar_sync_runs \
                 (run_id, calendar_id, started_at, status, attempt, sync_token_in) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(run.run_id)
        .bind(run.calendar_id.as_str())
        .bind(run.started_at)
        .bind(run.status.as_str())
        .bind(run.attempt)
        .bind(run.sync_token_in.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_run(&self, run_id: Uuid, completion: &RunCompletion) -> SyncResult<()> {
        let result = sqlx::query(
            "UPDATE calendar_sync_runs SET \
                 status = $2, \
                 finished_at = $3, \
                 attempt = $4, \
                 sync_token_out = $5, \
                 items_seen = $6, \
                 items_upserted = $7, \
                 items_cancelled = $8, \
                 error_code = $9, \
                 error_payload = $10 \
             WHERE run_id = $1 AND status = 'IN_PROGRESS'",
        )
        .bind(run_id)
        .bind(completion.status.as_str())
        .bind(completion.finished_at)
        .bind(completion.attempt)
        .bind(completion.sync_token_out.as_deref())
        .bind(completion.items_seen)
        .bind(completion.items_upserted)
        .bind(completion.items_cancelled)
        .bind(completion.error_code.as_deref())
        .bind(&completion.error_payload)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::Storage(format!(
                "sync run {run_id} not found or already completed"
            )));
        }
        Ok(())
    }

    async fn recent_runs(
        &self,
        calendar_id: &CalendarKey,
        limit: usize,
    ) -> SyncResult<Vec<CalendarSyncRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM calendar_sync_runs \
             WHERE calendar_id = $1 ORDER BY started_at DESC LIMIT $2"
        ))
        .bind(calendar_id.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::run_from_row).collect()
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn upsert_events(
        &self,
        calendar_id: &CalendarKey,
        events: &[NormalizedEvent],
    ) -> SyncResult<UpsertCounts> {
        let mut counts = UpsertCounts::default();
        if events.is_empty() {
            return Ok(counts);
        }

        let mut tx = self.pool.begin().await?;

        for event in events {
            let inserted: bool = sqlx::query_scalar(
                "INSERT INTO calendar_events ( \
                     calendar_id, provider_event_id, ical_uid, recurring_event_id, \
                     original_start_time, title, start_at, end_at, all_day, status, \
                     provider_updated_at, etag, time_zone \
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
                 ON CONFLICT (calendar_id, provider_event_id) DO UPDATE SET \
                     ical_uid = EXCLUDED.ical_uid, \
                     recurring_event_id = EXCLUDED.recurring_event_id, \
                     original_start_time = EXCLUDED.original_start_time, \
                     title = EXCLUDED.title, \
                     start_at = EXCLUDED.start_at, \
                     end_at = EXCLUDED.end_at, \
                     all_day = EXCLUDED.all_day, \
                     status = EXCLUDED.status, \
                     provider_updated_at = EXCLUDED.provider_updated_at, \
                     etag = EXCLUDED.etag, \
                     time_zone = EXCLUDED.time_zone, \
                     updated_at = now() \
                 RETURNING (xmax = 0)",
            )
            .bind(calendar_id.as_str())
            .bind(&event.provider_event_id)
            .bind(event.ical_uid.as_deref())
            .bind(event.recurring_event_id.as_deref())
            .bind(event.original_start_time)
            .bind(event.title.as_deref())
            .bind(event.start_at)
            .bind(event.end_at)
            .bind(event.all_day)
            .bind(event.status.as_deref().unwrap_or("confirmed"))
            .bind(event.provider_updated_at)
            .bind(event.etag.as_deref())
            .bind(event.time_zone.as_deref())
            .fetch_one(&mut *tx)
            .await?;

            if inserted {
                counts.inserted += 1;
            } else {
                counts.updated += 1;
            }
        }

        tx.commit().await?;
        Ok(counts)
    }

    async fn mark_cancelled(
        &self,
        calendar_id: &CalendarKey,
        provider_event_ids: &[String],
    ) -> SyncResult<u64> {
        // One statement may not touch the same row twice.
        let ids: Vec<String> = provider_event_ids
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let inserted: Vec<bool> = sqlx::query_scalar(
            "INSERT INTO calendar_events (calendar_id, provider_event_id, status) \
             SELECT $1, id, 'cancelled' FROM unnest($2::text[]) AS id \
             ON CONFLICT (calendar_id, provider_event_id) DO UPDATE SET \
                 status = 'cancelled', \
                 updated_at = now() \
             RETURNING (xmax = 0)",
        )
        .bind(calendar_id.as_str())
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(inserted.iter().filter(|was_insert| !**was_insert).count() as u64)
    }

    async fn count_active(&self, calendar_id: &CalendarKey) -> SyncResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM calendar_events WHERE calendar_id = $1 AND status <> 'cancelled'",
        )
        .bind(calendar_id.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

/// A connection dedicated to holding advisory locks, opened outside the pool.
///
/// State, run and event writes go through the pool, so lock holders and lock waiters
/// never compete with them for pool slots.
struct PgLockSession {
    conn: Option<PgConnection>,
}

impl PgLockSession {
    fn conn(&mut self) -> SyncResult<&mut PgConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| SyncError::Storage("lock session already closed".into()))
    }
}

#[async_trait]
impl LockSession for PgLockSession {
    async fn try_lock(&mut self, key: i64) -> SyncResult<bool> {
        let conn = self.conn()?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(conn)
            .await?;
        Ok(acquired)
    }

    async fn unlock(&mut self, key: i64) -> SyncResult<bool> {
        let conn = self.conn()?;
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .fetch_one(conn)
            .await?;
        Ok(released)
    }

    async fn close(mut self: Box<Self>, healthy: bool) {
        // Dropping without close also ends the session, freeing its locks.
        let Some(conn) = self.conn.take() else {
            return;
        };
        if let Err(e) = conn.close().await {
            warn!(error = %e, healthy, "failed to close lock connection cleanly");
        }
    }
}

#[async_trait]
impl AdvisoryLocks for PgStore {
    async fn open_session(&self) -> SyncResult<Box<dyn LockSession>> {
        let options = self.pool.connect_options();
        let conn = PgConnection::connect_with(&*options).await?;
        Ok(Box::new(PgLockSession { conn: Some(conn) }))
    }
}
