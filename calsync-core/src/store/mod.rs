//! Sync state, run history and the local event mirror.
//!
//! Two implementations share these traits: [`postgres::PgStore`] for production and
//! [`memory::MemoryStore`] for tests and development.

pub mod memory;
pub mod postgres;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FailureCode, SyncError, SyncFailure, SyncResult};
use crate::normalize::NormalizedEvent;

/// Identifies one synced calendar: the owning user plus the provider calendar id.
///
/// Provider aliases such as `primary` are only unique per account, so the user is
/// part of the key. The stored form is `<user>:<calendar id>` with `\` and `:`
/// escaped in the user id, so any user id round-trips.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct CalendarKey {
    key: String,
    user_id: String,
    calendar_id: String,
}

impl CalendarKey {
    pub fn new(user_id: &str, calendar_id: &str) -> Self {
        let escaped = user_id.replace('\\', "\\\\").replace(':', "\\:");
        CalendarKey {
            key: format!("{escaped}:{calendar_id}"),
            user_id: user_id.to_string(),
            calendar_id: calendar_id.to_string(),
        }
    }

    /// Parse a stored key, e.g. one read back from the database.
    pub fn from_raw(key: impl Into<String>) -> Self {
        let key = key.into();
        let mut user_id = String::new();
        let mut chars = key.char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => {
                    if let Some((_, escaped)) = chars.next() {
                        user_id.push(escaped);
                    }
                }
                ':' => {
                    let calendar_id = key[i + 1..].to_string();
                    return CalendarKey {
                        key,
                        user_id,
                        calendar_id,
                    };
                }
                _ => user_id.push(c),
            }
        }

        // No separator: a bare calendar id.
        CalendarKey {
            calendar_id: key.clone(),
            key,
            user_id: String::new(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The provider calendar id part of the key.
    pub fn calendar_id(&self) -> &str {
        &self.calendar_id
    }
}

impl From<String> for CalendarKey {
    fn from(key: String) -> Self {
        CalendarKey::from_raw(key)
    }
}

impl From<CalendarKey> for String {
    fn from(key: CalendarKey) -> Self {
        key.key
    }
}

impl fmt::Display for CalendarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Persisted sync state, one row per calendar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarSyncState {
    pub calendar_id: CalendarKey,
    pub sync_token: Option<String>,
    pub last_success_sync_token: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_succeeded_at: Option<DateTime<Utc>>,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_code: Option<String>,
    pub last_error_details: Option<serde_json::Value>,
    pub consecutive_failures: i32,
    pub needs_reauth: bool,
    pub in_progress: bool,
    pub in_progress_started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl CalendarSyncState {
    pub fn new(calendar_id: CalendarKey, now: DateTime<Utc>) -> Self {
        CalendarSyncState {
            calendar_id,
            sync_token: None,
            last_success_sync_token: None,
            last_synced_at: None,
            last_succeeded_at: None,
            last_full_sync_at: None,
            last_attempted_at: None,
            last_error: None,
            last_error_code: None,
            last_error_details: None,
            consecutive_failures: 0,
            needs_reauth: false,
            in_progress: false,
            in_progress_started_at: None,
            updated_at: now,
        }
    }

    /// Whether a sync within `ttl` of `now` makes another one unnecessary.
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: std::time::Duration) -> bool {
        if self.in_progress {
            return false;
        }
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return false;
        };
        self.last_synced_at
            .is_some_and(|synced| synced <= now && now - synced < ttl)
    }

    fn clear_error(&mut self) {
        self.last_error = None;
        self.last_error_code = None;
        self.last_error_details = None;
    }

    pub(crate) fn apply_started(&mut self, at: DateTime<Utc>) {
        self.in_progress = true;
        self.in_progress_started_at = Some(at);
        self.last_attempted_at = Some(at);
        self.clear_error();
        self.updated_at = at;
    }

    pub(crate) fn apply_succeeded(&mut self, success: &SyncSuccess) {
        let at = success.finished_at;
        self.sync_token = success.sync_token.clone();
        self.last_success_sync_token = success.sync_token.clone();
        self.last_synced_at = Some(at);
        self.last_succeeded_at = Some(at);
        if success.full_sync {
            self.last_full_sync_at = Some(at);
        }
        self.consecutive_failures = 0;
        self.needs_reauth = false;
        self.in_progress = false;
        self.in_progress_started_at = None;
        self.clear_error();
        self.updated_at = at;
    }

    pub(crate) fn apply_failed(&mut self, failure: &SyncFailure, at: DateTime<Utc>) {
        self.last_error = Some(failure.message.clone());
        self.last_error_code = Some(failure.code.as_str().to_string());
        self.last_error_details = Some(failure.details.clone());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.needs_reauth = self.needs_reauth || failure.needs_reauth();
        self.in_progress = false;
        self.in_progress_started_at = None;
        self.updated_at = at;
    }

    pub(crate) fn apply_reset(&mut self, reset: &StateReset, at: DateTime<Utc>) {
        if reset.clear_sync_token {
            self.sync_token = None;
        }
        if reset.clear_needs_reauth {
            self.needs_reauth = false;
        }
        if reset.reset_failures {
            self.consecutive_failures = 0;
            self.clear_error();
        }
        if reset.clear_in_progress {
            self.in_progress = false;
            self.in_progress_started_at = None;
        }
        self.updated_at = at;
    }
}

/// What a successful attempt writes back.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSuccess {
    pub sync_token: Option<String>,
    /// The fetch carried no input token.
    pub full_sync: bool,
    pub finished_at: DateTime<Utc>,
}

/// Fields the repair path may force-clear, bypassing the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateReset {
    pub clear_sync_token: bool,
    pub clear_needs_reauth: bool,
    pub reset_failures: bool,
    pub clear_in_progress: bool,
}

impl StateReset {
    pub fn all() -> Self {
        StateReset {
            clear_sync_token: true,
            clear_needs_reauth: true,
            reset_failures: true,
            clear_in_progress: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == StateReset::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    InProgress,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::InProgress => "IN_PROGRESS",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> SyncResult<Self> {
        match s {
            "IN_PROGRESS" => Ok(RunStatus::InProgress),
            "SUCCESS" => Ok(RunStatus::Success),
            "FAILED" => Ok(RunStatus::Failed),
            other => Err(SyncError::Storage(format!("unknown run status '{other}'"))),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the append-only run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarSyncRun {
    pub run_id: Uuid,
    pub calendar_id: CalendarKey,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub attempt: i32,
    pub sync_token_in: Option<String>,
    pub sync_token_out: Option<String>,
    pub items_seen: i32,
    pub items_upserted: i32,
    pub items_cancelled: i32,
    pub error_code: Option<String>,
    pub error_payload: Option<serde_json::Value>,
}

impl CalendarSyncRun {
    pub fn start(calendar_id: CalendarKey, sync_token_in: Option<String>, at: DateTime<Utc>) -> Self {
        CalendarSyncRun {
            run_id: Uuid::new_v4(),
            calendar_id,
            started_at: at,
            finished_at: None,
            status: RunStatus::InProgress,
            attempt: 1,
            sync_token_in,
            sync_token_out: None,
            items_seen: 0,
            items_upserted: 0,
            items_cancelled: 0,
            error_code: None,
            error_payload: None,
        }
    }

    pub(crate) fn apply_completion(&mut self, completion: &RunCompletion) {
        self.status = completion.status;
        self.finished_at = Some(completion.finished_at);
        self.attempt = completion.attempt;
        self.sync_token_out = completion.sync_token_out.clone();
        self.items_seen = completion.items_seen;
        self.items_upserted = completion.items_upserted;
        self.items_cancelled = completion.items_cancelled;
        self.error_code = completion.error_code.clone();
        self.error_payload = completion.error_payload.clone();
    }
}

/// Terminal outcome written to a run row, exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub finished_at: DateTime<Utc>,
    pub attempt: i32,
    pub sync_token_out: Option<String>,
    pub items_seen: i32,
    pub items_upserted: i32,
    pub items_cancelled: i32,
    pub error_code: Option<String>,
    pub error_payload: Option<serde_json::Value>,
}

impl RunCompletion {
    pub fn success(
        finished_at: DateTime<Utc>,
        attempt: u32,
        sync_token_out: Option<String>,
        items_seen: usize,
        items_upserted: u64,
        items_cancelled: u64,
    ) -> Self {
        RunCompletion {
            status: RunStatus::Success,
            finished_at,
            attempt: clamp_i32(attempt as u64),
            sync_token_out,
            items_seen: clamp_i32(items_seen as u64),
            items_upserted: clamp_i32(items_upserted),
            items_cancelled: clamp_i32(items_cancelled),
            error_code: None,
            error_payload: None,
        }
    }

    pub fn failed(finished_at: DateTime<Utc>, attempt: u32, failure: &SyncFailure) -> Self {
        RunCompletion {
            status: RunStatus::Failed,
            finished_at,
            attempt: clamp_i32(attempt as u64),
            sync_token_out: None,
            items_seen: 0,
            items_upserted: 0,
            items_cancelled: 0,
            error_code: Some(failure.code.as_str().to_string()),
            error_payload: Some(serde_json::json!({
                "message": failure.message,
                "retryable": failure.retryable,
                "details": failure.details,
            })),
        }
    }
}

fn clamp_i32(n: u64) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertCounts {
    pub inserted: u64,
    pub updated: u64,
}

/// Persists per-calendar sync state and per-attempt run history.
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    async fn get_state(&self, calendar_id: &CalendarKey) -> SyncResult<Option<CalendarSyncState>>;

    async fn get_or_create_state(&self, calendar_id: &CalendarKey) -> SyncResult<CalendarSyncState>;

    async fn list_states(&self) -> SyncResult<Vec<CalendarSyncState>>;

    /// Flag the calendar as in progress and clear the previous error.
    async fn mark_started(
        &self,
        calendar_id: &CalendarKey,
        at: DateTime<Utc>,
    ) -> SyncResult<CalendarSyncState>;

    async fn mark_succeeded(&self, calendar_id: &CalendarKey, success: &SyncSuccess) -> SyncResult<()>;

    async fn mark_failed(
        &self,
        calendar_id: &CalendarKey,
        failure: &SyncFailure,
        at: DateTime<Utc>,
    ) -> SyncResult<()>;

    /// Force-clear fields for repair. Returns `None` if the calendar has no state row.
    async fn reset(
        &self,
        calendar_id: &CalendarKey,
        reset: &StateReset,
    ) -> SyncResult<Option<CalendarSyncState>>;

    async fn start_run(&self, run: &CalendarSyncRun) -> SyncResult<()>;

    async fn complete_run(&self, run_id: Uuid, completion: &RunCompletion) -> SyncResult<()>;

    /// Most recent runs first.
    async fn recent_runs(&self, calendar_id: &CalendarKey, limit: usize)
    -> SyncResult<Vec<CalendarSyncRun>>;
}

/// The local mirror of provider events, keyed by (calendar, provider event id).
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn upsert_events(
        &self,
        calendar_id: &CalendarKey,
        events: &[NormalizedEvent],
    ) -> SyncResult<UpsertCounts>;

    /// Set `status = cancelled` in place. Returns how many existing rows matched;
    /// ids without a row are recorded as cancelled tombstones and not counted.
    async fn mark_cancelled(
        &self,
        calendar_id: &CalendarKey,
        provider_event_ids: &[String],
    ) -> SyncResult<u64>;

    /// Number of non-cancelled events stored for the calendar.
    async fn count_active(&self, calendar_id: &CalendarKey) -> SyncResult<u64>;
}

/// Convenience used by the CLI: the code of a persisted error, if recognised.
pub fn last_error_code(state: &CalendarSyncState) -> Option<FailureCode> {
    state.last_error_code.as_deref().and_then(FailureCode::parse)
}
