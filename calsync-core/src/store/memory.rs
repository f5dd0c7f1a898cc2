//! In-memory store for tests and development.
//!
//! Implements state, run history, the event mirror and advisory locks with the same
//! semantics as the Postgres store, but only within one process. Locks behave like
//! session-scoped advisory locks: dropping a session frees whatever it held.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{SyncError, SyncFailure, SyncResult};
use crate::lock::{AdvisoryLocks, LockSession};
use crate::normalize::NormalizedEvent;
use crate::store::{
    CalendarKey, CalendarSyncRun, CalendarSyncState, EventStore, RunCompletion, RunStatus,
    StateReset, SyncStateStore, SyncSuccess, UpsertCounts,
};

const CANCELLED: &str = "cancelled";

/// A mirrored event row. Tombstones for never-seen cancelled ids have no `event`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub provider_event_id: String,
    pub status: String,
    pub event: Option<NormalizedEvent>,
    pub updated_at: DateTime<Utc>,
}

impl StoredEvent {
    pub fn is_cancelled(&self) -> bool {
        self.status == CANCELLED
    }
}

#[derive(Default)]
struct Tables {
    states: HashMap<CalendarKey, CalendarSyncState>,
    runs: Vec<CalendarSyncRun>,
    events: BTreeMap<(CalendarKey, String), StoredEvent>,
}

#[derive(Default)]
struct LockTable {
    /// lock key -> owning session id
    held: HashMap<i64, u64>,
    next_session: u64,
    open_sessions: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    locks: Arc<Mutex<LockTable>>,
    fail_next_unlock: Arc<AtomicBool>,
    fail_next_upsert: AtomicBool,
    fail_next_complete_run: AtomicBool,
    fail_next_session: AtomicBool,
}

fn poison_err<T>(_: PoisonError<T>) -> SyncError {
    SyncError::Storage("memory store lock poisoned".into())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> SyncResult<MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(poison_err)
    }

    /// Seed or overwrite a state row directly.
    pub fn put_state(&self, state: CalendarSyncState) -> SyncResult<()> {
        self.tables()?.states.insert(state.calendar_id.clone(), state);
        Ok(())
    }

    pub fn events_for(&self, calendar_id: &CalendarKey) -> SyncResult<Vec<StoredEvent>> {
        Ok(self
            .tables()?
            .events
            .iter()
            .filter(|((cal, _), _)| cal == calendar_id)
            .map(|(_, event)| event.clone())
            .collect())
    }

    pub fn held_lock_count(&self) -> usize {
        self.locks.lock().map(|t| t.held.len()).unwrap_or(0)
    }

    pub fn open_session_count(&self) -> usize {
        self.locks.lock().map(|t| t.open_sessions).unwrap_or(0)
    }

    /// Make the next unlock report an error, as a dropped connection would.
    pub fn fail_next_unlock(&self) {
        self.fail_next_unlock.store(true, Ordering::SeqCst);
    }

    /// Make the next event upsert fail with a storage error.
    pub fn fail_next_upsert(&self) {
        self.fail_next_upsert.store(true, Ordering::SeqCst);
    }

    /// Make the next run completion fail with a storage error.
    pub fn fail_next_complete_run(&self) {
        self.fail_next_complete_run.store(true, Ordering::SeqCst);
    }

    /// Make the next lock session fail to open, as an exhausted pool would.
    pub fn fail_next_session(&self) {
        self.fail_next_session.store(true, Ordering::SeqCst);
    }

    fn update_state<F>(&self, calendar_id: &CalendarKey, apply: F) -> SyncResult<CalendarSyncState>
    where
        F: FnOnce(&mut CalendarSyncState),
    {
        let mut tables = self.tables()?;
        let state = tables
            .states
            .entry(calendar_id.clone())
            .or_insert_with(|| CalendarSyncState::new(calendar_id.clone(), Utc::now()));
        apply(state);
        Ok(state.clone())
    }
}

#[async_trait]
impl SyncStateStore for MemoryStore {
    async fn get_state(&self, calendar_id: &CalendarKey) -> SyncResult<Option<CalendarSyncState>> {
        Ok(self.tables()?.states.get(calendar_id).cloned())
    }

    async fn get_or_create_state(&self, calendar_id: &CalendarKey) -> SyncResult<CalendarSyncState> {
        self.update_state(calendar_id, |_| {})
    }

    async fn list_states(&self) -> SyncResult<Vec<CalendarSyncState>> {
        let mut states: Vec<_> = self.tables()?.states.values().cloned().collect();
        states.sort_by(|a, b| a.calendar_id.cmp(&b.calendar_id));
        Ok(states)
    }

    async fn mark_started(
        &self,
        calendar_id: &CalendarKey,
        at: DateTime<Utc>,
    ) -> SyncResult<CalendarSyncState> {
        self.update_state(calendar_id, |s| s.apply_started(at))
    }

    async fn mark_succeeded(&self, calendar_id: &CalendarKey, success: &SyncSuccess) -> SyncResult<()> {
        self.update_state(calendar_id, |s| s.apply_succeeded(success))?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        calendar_id: &CalendarKey,
        failure: &SyncFailure,
        at: DateTime<Utc>,
    ) -> SyncResult<()> {
        self.update_state(calendar_id, |s| s.apply_failed(failure, at))?;
        Ok(())
    }

    async fn reset(
        &self,
        calendar_id: &CalendarKey,
        reset: &StateReset,
    ) -> SyncResult<Option<CalendarSyncState>> {
        let mut tables = self.tables()?;
        Ok(tables.states.get_mut(calendar_id).map(|state| {
            state.apply_reset(reset, Utc::now());
            state.clone()
        }))
    }

    async fn start_run(&self, run: &CalendarSyncRun) -> SyncResult<()> {
        self.tables()?.runs.push(run.clone());
        Ok(())
    }

    async fn complete_run(&self, run_id: Uuid, completion: &RunCompletion) -> SyncResult<()> {
        if self.fail_next_complete_run.swap(false, Ordering::SeqCst) {
            return Err(SyncError::Storage("injected run completion failure".into()));
        }
        let mut tables = self.tables()?;
        let run = tables
            .runs
            .iter_mut()
            .find(|r| r.run_id == run_id && r.status == RunStatus::InProgress)
            .ok_or_else(|| {
                SyncError::Storage(format!("sync run {run_id} not found or already completed"))
            })?;
        run.apply_completion(completion);
        Ok(())
    }

    async fn recent_runs(
        &self,
        calendar_id: &CalendarKey,
        limit: usize,
    ) -> SyncResult<Vec<CalendarSyncRun>> {
        Ok(self
            .tables()?
            .runs
            .iter()
            .rev()
            .filter(|r| &r.calendar_id == calendar_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn upsert_events(
        &self,
        calendar_id: &CalendarKey,
        events: &[NormalizedEvent],
    ) -> SyncResult<UpsertCounts> {
        if self.fail_next_upsert.swap(false, Ordering::SeqCst) {
            return Err(SyncError::Storage("injected upsert failure".into()));
        }

        let now = Utc::now();
        let mut tables = self.tables()?;
        let mut counts = UpsertCounts::default();

        for event in events {
            let row = StoredEvent {
                provider_event_id: event.provider_event_id.clone(),
                status: event.status.clone().unwrap_or_else(|| "confirmed".to_string()),
                event: Some(event.clone()),
                updated_at: now,
            };
            let key = (calendar_id.clone(), event.provider_event_id.clone());
            match tables.events.insert(key, row) {
                Some(_) => counts.updated += 1,
                None => counts.inserted += 1,
            }
        }

        Ok(counts)
    }

    async fn mark_cancelled(
        &self,
        calendar_id: &CalendarKey,
        provider_event_ids: &[String],
    ) -> SyncResult<u64> {
        let now = Utc::now();
        let mut tables = self.tables()?;
        let mut matched = 0;

        for id in provider_event_ids {
            let key = (calendar_id.clone(), id.clone());
            match tables.events.get_mut(&key) {
                Some(row) => {
                    row.status = CANCELLED.to_string();
                    row.updated_at = now;
                    matched += 1;
                }
                None => {
                    tables.events.insert(
                        key,
                        StoredEvent {
                            provider_event_id: id.clone(),
                            status: CANCELLED.to_string(),
                            event: None,
                            updated_at: now,
                        },
                    );
                }
            }
        }

        Ok(matched)
    }

    async fn count_active(&self, calendar_id: &CalendarKey) -> SyncResult<u64> {
        Ok(self
            .tables()?
            .events
            .iter()
            .filter(|((cal, _), row)| cal == calendar_id && !row.is_cancelled())
            .count() as u64)
    }
}

struct MemoryLockSession {
    id: u64,
    table: Arc<Mutex<LockTable>>,
    fail_next_unlock: Arc<AtomicBool>,
}

impl Drop for MemoryLockSession {
    fn drop(&mut self) {
        if let Ok(mut table) = self.table.lock() {
            let id = self.id;
            table.held.retain(|_, owner| *owner != id);
            table.open_sessions = table.open_sessions.saturating_sub(1);
        }
    }
}

#[async_trait]
impl LockSession for MemoryLockSession {
    async fn try_lock(&mut self, key: i64) -> SyncResult<bool> {
        let mut table = self.table.lock().map_err(poison_err)?;
        match table.held.get(&key) {
            Some(owner) => Ok(*owner == self.id),
            None => {
                table.held.insert(key, self.id);
                Ok(true)
            }
        }
    }

    async fn unlock(&mut self, key: i64) -> SyncResult<bool> {
        if self.fail_next_unlock.swap(false, Ordering::SeqCst) {
            return Err(SyncError::Storage("injected unlock failure".into()));
        }
        let mut table = self.table.lock().map_err(poison_err)?;
        if table.held.get(&key) == Some(&self.id) {
            table.held.remove(&key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn close(self: Box<Self>, _healthy: bool) {
        drop(self);
    }
}

#[async_trait]
impl AdvisoryLocks for MemoryStore {
    async fn open_session(&self) -> SyncResult<Box<dyn LockSession>> {
        if self.fail_next_session.swap(false, Ordering::SeqCst) {
            return Err(SyncError::Storage("injected session failure".into()));
        }
        let mut table = self.locks.lock().map_err(poison_err)?;
        table.next_session += 1;
        table.open_sessions += 1;

        Ok(Box::new(MemoryLockSession {
            id: table.next_session,
            table: self.locks.clone(),
            fail_next_unlock: self.fail_next_unlock.clone(),
        }))
    }
}
