//! One calendar's sync attempt, from the skip check to the released lock.
//!
//! ```text
//! IDLE -> LOCK_WAIT -> STARTED -> FETCHING -> (TOKEN_RESET -> FETCHING) -> SUCCEEDED | FAILED
//! ```
//!
//! The calendar lock is held from STARTED until the outcome is persisted and is
//! released whatever happens in between.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::classify::{classify, missing_credential};
use crate::config::SyncSettings;
use crate::error::{SyncFailure, SyncResult};
use crate::lock::LockManager;
use crate::normalize::NormalizedBatch;
use crate::remote::{CalendarProvider, Credential, FetchedEvents};
use crate::store::{
    CalendarKey, CalendarSyncRun, EventStore, RunCompletion, SyncStateStore, SyncSuccess,
};

/// Result of syncing one calendar.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarSyncOutcome {
    pub calendar_id: String,
    pub skipped: bool,
    pub inserted: u64,
    pub updated: u64,
    pub cancelled: u64,
    pub invalid_events_skipped: u64,
    pub fetched_items: u64,
    pub full_sync: bool,
    pub sync_token_updated: bool,
    /// Fetch attempts counted against the retry bound.
    pub attempts: u32,
}

impl CalendarSyncOutcome {
    fn skipped(calendar_id: &CalendarKey) -> Self {
        CalendarSyncOutcome {
            calendar_id: calendar_id.calendar_id().to_string(),
            skipped: true,
            ..Default::default()
        }
    }
}

/// A successful fetch and the token it was made with.
struct Fetch {
    events: FetchedEvents,
    token_used: Option<String>,
    attempts: u32,
}

/// Drives sync attempts for single calendars.
#[derive(Clone)]
pub struct Orchestrator {
    provider: Arc<dyn CalendarProvider>,
    states: Arc<dyn SyncStateStore>,
    events: Arc<dyn EventStore>,
    locks: LockManager,
    settings: SyncSettings,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn CalendarProvider>,
        states: Arc<dyn SyncStateStore>,
        events: Arc<dyn EventStore>,
        locks: LockManager,
        settings: SyncSettings,
    ) -> Self {
        Orchestrator {
            provider,
            states,
            events,
            locks,
            settings,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Whether the stored state says the calendar's credential was rejected.
    pub async fn needs_reauth(&self, calendar_id: &CalendarKey) -> SyncResult<bool> {
        let state = self.states.get_state(calendar_id).await?;
        Ok(state.is_some_and(|s| s.needs_reauth))
    }

    /// Sync one calendar. A missing credential is persisted as a reauth failure.
    #[instrument(level = "info", skip(self, calendar_id, credential), fields(calendar_id = %calendar_id))]
    pub async fn sync(
        &self,
        calendar_id: &CalendarKey,
        credential: Option<&Credential>,
        force: bool,
    ) -> SyncResult<CalendarSyncOutcome> {
        if !force
            && let Some(state) = self
                .states
                .get_state(calendar_id)
                .await
                .map_err(|e| e.into_failure("failed to read sync state"))?
            && state.is_fresh(Utc::now(), self.settings.skip_ttl())
        {
            debug!("synced recently, skipping");
            return Ok(CalendarSyncOutcome::skipped(calendar_id));
        }

        let timeout = self.settings.lock_timeout();
        let acquired = self
            .locks
            .acquire(calendar_id, timeout)
            .await
            .map_err(|e| e.into_failure("failed to take calendar lock"))?;
        let Some(lock) = acquired else {
            let waited_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
            warn!(waited_ms, "calendar is locked by another sync");
            return Err(SyncFailure::lock_timeout(calendar_id.as_str(), waited_ms).into());
        };

        let result = self.run_locked(calendar_id, credential).await;
        self.locks.release(lock).await;
        result
    }

    async fn run_locked(
        &self,
        calendar_id: &CalendarKey,
        credential: Option<&Credential>,
    ) -> SyncResult<CalendarSyncOutcome> {
        let started_at = Utc::now();
        let state = self
            .states
            .mark_started(calendar_id, started_at)
            .await
            .map_err(|e| e.into_failure("failed to mark sync started"))?;
        let token_in = state.sync_token;

        let run = CalendarSyncRun::start(calendar_id.clone(), token_in.clone(), started_at);
        if let Err(e) = self.states.start_run(&run).await {
            let failure = SyncFailure::internal(format!("failed to record sync run: {e}"));
            self.record_failure(calendar_id, None, 1, &failure).await;
            return Err(failure.into());
        }

        let credential = match credential.filter(|c| !c.is_blank()) {
            Some(credential) => credential,
            None => {
                let failure = missing_credential();
                self.record_failure(calendar_id, Some(run.run_id), 1, &failure)
                    .await;
                return Err(failure.into());
            }
        };

        let fetch = match self
            .fetch_with_retry(calendar_id, credential, token_in.clone())
            .await
        {
            Ok(fetch) => fetch,
            Err((failure, attempts)) => {
                warn!(attempts, code = %failure.code, "sync failed: {}", failure.message);
                self.record_failure(calendar_id, Some(run.run_id), attempts, &failure)
                    .await;
                return Err(failure.into());
            }
        };

        let attempts = fetch.attempts;
        match self.apply(calendar_id, run.run_id, token_in, fetch).await {
            Ok(outcome) => {
                info!(
                    inserted = outcome.inserted,
                    updated = outcome.updated,
                    cancelled = outcome.cancelled,
                    attempts = outcome.attempts,
                    full_sync = outcome.full_sync,
                    "calendar synced"
                );
                Ok(outcome)
            }
            Err(e) => {
                let failure = e.into_failure("failed to persist sync results");
                error!(code = %failure.code, "sync failed after fetch: {}", failure.message);
                self.record_failure(calendar_id, Some(run.run_id), attempts, &failure)
                    .await;
                Err(failure.into())
            }
        }
    }

    /// Fetch with the one-shot token reset and bounded retry.
    ///
    /// On failure returns the classified failure and the attempts made.
    async fn fetch_with_retry(
        &self,
        calendar_id: &CalendarKey,
        credential: &Credential,
        token_in: Option<String>,
    ) -> Result<Fetch, (SyncFailure, u32)> {
        let policy = self.settings.retry_policy();
        let mut working = token_in;
        let mut token_reset = false;
        let mut attempt: u32 = 1;

        loop {
            let result = self
                .provider
                .fetch_events(credential, calendar_id.calendar_id(), working.as_deref())
                .await;

            let err = match result {
                Ok(events) => {
                    return Ok(Fetch {
                        events,
                        token_used: working,
                        attempts: attempt,
                    });
                }
                Err(err) => err,
            };

            // Does not count against the retry bound.
            if err.is_token_expired() && !token_reset {
                info!(attempt, "sync token rejected, falling back to a full resync");
                working = None;
                token_reset = true;
                continue;
            }

            let failure = classify(&err);
            match policy.next_delay(attempt, &failure) {
                Some(delay) => {
                    warn!(
                        attempt,
                        code = %failure.code,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "fetch failed, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                None => return Err((failure, attempt)),
            }
        }
    }

    /// Normalize, write events and persist the successful outcome.
    async fn apply(
        &self,
        calendar_id: &CalendarKey,
        run_id: Uuid,
        token_in: Option<String>,
        fetch: Fetch,
    ) -> SyncResult<CalendarSyncOutcome> {
        let Fetch {
            events,
            token_used,
            attempts,
        } = fetch;

        let batch = NormalizedBatch::from_items(&events.items, events.time_zone.as_deref());
        let counts = self.events.upsert_events(calendar_id, &batch.events).await?;
        let cancelled = self
            .events
            .mark_cancelled(calendar_id, &batch.cancelled_ids)
            .await?;

        let full_sync = events.is_full_sync || token_used.is_none();
        let token_out = events.next_sync_token.or(token_used);
        let finished_at = Utc::now();

        // State is marked succeeded only once the run row is complete.
        self.states
            .complete_run(
                run_id,
                &RunCompletion::success(
                    finished_at,
                    attempts,
                    token_out.clone(),
                    events.items.len(),
                    counts.inserted + counts.updated,
                    cancelled,
                ),
            )
            .await?;

        self.states
            .mark_succeeded(
                calendar_id,
                &SyncSuccess {
                    sync_token: token_out.clone(),
                    full_sync,
                    finished_at,
                },
            )
            .await?;

        Ok(CalendarSyncOutcome {
            calendar_id: calendar_id.calendar_id().to_string(),
            skipped: false,
            inserted: counts.inserted,
            updated: counts.updated,
            cancelled,
            invalid_events_skipped: batch.invalid as u64,
            fetched_items: events.items.len() as u64,
            full_sync,
            sync_token_updated: token_out.is_some() && token_out != token_in,
            attempts,
        })
    }

    /// Persist a terminal failure. Storage errors here are logged, not raised, so the
    /// caller still sees the original failure.
    async fn record_failure(
        &self,
        calendar_id: &CalendarKey,
        run_id: Option<Uuid>,
        attempts: u32,
        failure: &SyncFailure,
    ) {
        let at = Utc::now();
        if let Err(e) = self.states.mark_failed(calendar_id, failure, at).await {
            error!(error = %e, "failed to persist sync failure");
        }
        if let Some(run_id) = run_id
            && let Err(e) = self
                .states
                .complete_run(run_id, &RunCompletion::failed(at, attempts, failure))
                .await
        {
            error!(error = %e, %run_id, "failed to complete sync run");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::error::{FailureCode, SyncError};
    use crate::remote::ProviderErrorKind;
    use crate::store::memory::MemoryStore;
    use crate::store::{CalendarSyncState, RunStatus};
    use crate::testing::*;

    const CAL: &str = "primary";

    fn key() -> CalendarKey {
        CalendarKey::new("u1", CAL)
    }

    fn orchestrator(provider: &Arc<ScriptedProvider>, store: &Arc<MemoryStore>) -> Orchestrator {
        let settings = fast_settings();
        Orchestrator::new(
            provider.clone(),
            store.clone(),
            store.clone(),
            LockManager::new(store.clone(), settings.lock_poll_interval()),
            settings,
        )
    }

    fn seed_token(store: &MemoryStore, token: &str) {
        let mut state = CalendarSyncState::new(key(), Utc::now());
        state.sync_token = Some(token.to_string());
        store.put_state(state).unwrap();
    }

    fn failure_of(result: SyncResult<CalendarSyncOutcome>) -> SyncFailure {
        match result {
            Err(SyncError::Sync(failure)) => failure,
            other => panic!("expected a classified failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_first_sync_is_full_and_stores_token() {
        let provider = Arc::new(ScriptedProvider::new());
        let store = Arc::new(MemoryStore::new());
        provider.push(CAL, page(vec![timed("a", (10, 0), (11, 0))], "tok-1"));

        let outcome = orchestrator(&provider, &store)
            .sync(&key(), Some(&credential()), false)
            .await
            .unwrap();

        assert!(!outcome.skipped);
        assert_eq!(outcome.calendar_id, CAL);
        assert_eq!(outcome.inserted, 1);
        assert!(outcome.full_sync);
        assert!(outcome.sync_token_updated);
        assert_eq!(outcome.attempts, 1);

        let state = store.get_state(&key()).await.unwrap().unwrap();
        assert_eq!(state.sync_token.as_deref(), Some("tok-1"));
        assert!(state.last_full_sync_at.is_some());
        assert!(!state.in_progress);

        let runs = store.recent_runs(&key(), 5).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[0].sync_token_in, None);
        assert_eq!(runs[0].sync_token_out.as_deref(), Some("tok-1"));
        assert_eq!(store.held_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_token_resets_once_without_using_an_attempt() {
        let provider = Arc::new(ScriptedProvider::new());
        let store = Arc::new(MemoryStore::new());
        seed_token(&store, "stale");
        provider
            .push(CAL, provider_error(ProviderErrorKind::TokenExpired, 410))
            .push(CAL, page(vec![timed("a", (10, 0), (11, 0))], "fresh"));

        let outcome = orchestrator(&provider, &store)
            .sync(&key(), Some(&credential()), true)
            .await
            .unwrap();

        assert_eq!(provider.tokens_for(CAL), vec![Some("stale".to_string()), None]);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.full_sync);

        let state = store.get_state(&key()).await.unwrap().unwrap();
        assert_eq!(state.sync_token.as_deref(), Some("fresh"));
        assert_eq!(state.last_error, None);
    }

    #[tokio::test]
    async fn test_second_token_rejection_is_terminal() {
        let provider = Arc::new(ScriptedProvider::new());
        let store = Arc::new(MemoryStore::new());
        seed_token(&store, "stale");
        provider
            .push(CAL, provider_error(ProviderErrorKind::TokenExpired, 410))
            .push(CAL, provider_error(ProviderErrorKind::TokenExpired, 410));

        let failure = failure_of(
            orchestrator(&provider, &store)
                .sync(&key(), Some(&credential()), true)
                .await,
        );

        assert_eq!(failure.code, FailureCode::SyncTokenExpired);
        assert_eq!(provider.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_retryable_failures_then_success() {
        let provider = Arc::new(ScriptedProvider::new());
        let store = Arc::new(MemoryStore::new());
        provider
            .push(CAL, provider_error(ProviderErrorKind::ServerError, 503))
            .push(CAL, provider_error(ProviderErrorKind::RateLimited, 429))
            .push(CAL, page(Vec::new(), "tok"));

        let outcome = orchestrator(&provider, &store)
            .sync(&key(), Some(&credential()), false)
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 3);
        assert_eq!(provider.calls().len(), 3);

        let state = store.get_state(&key()).await.unwrap().unwrap();
        assert_eq!(state.consecutive_failures, 0);
        let runs = store.recent_runs(&key(), 5).await.unwrap();
        assert_eq!(runs[0].attempt, 3);
        assert_eq!(runs[0].status, RunStatus::Success);
    }

    #[tokio::test]
    async fn test_retries_stop_at_max_attempts() {
        let provider = Arc::new(ScriptedProvider::new());
        let store = Arc::new(MemoryStore::new());
        for _ in 0..6 {
            provider.push(CAL, provider_error(ProviderErrorKind::ServerError, 500));
        }

        let failure = failure_of(
            orchestrator(&provider, &store)
                .sync(&key(), Some(&credential()), false)
                .await,
        );

        assert_eq!(failure.code, FailureCode::GoogleUpstreamError);
        assert!(failure.retryable);
        assert_eq!(provider.calls().len(), 5);

        let runs = store.recent_runs(&key(), 5).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].attempt, 5);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_makes_one_attempt() {
        let provider = Arc::new(ScriptedProvider::new());
        let store = Arc::new(MemoryStore::new());
        provider.push(CAL, provider_error(ProviderErrorKind::ClientError, 400));

        let failure = failure_of(
            orchestrator(&provider, &store)
                .sync(&key(), Some(&credential()), false)
                .await,
        );

        assert_eq!(failure.code, FailureCode::GoogleUpstreamError);
        assert!(!failure.retryable);
        assert_eq!(provider.calls().len(), 1);

        let state = store.get_state(&key()).await.unwrap().unwrap();
        assert!(!state.in_progress);
        assert!(!state.needs_reauth);
        assert_eq!(state.consecutive_failures, 1);
        assert_eq!(state.last_error_code.as_deref(), Some("GOOGLE_UPSTREAM_ERROR"));

        let runs = store.recent_runs(&key(), 5).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].error_code.as_deref(), Some("GOOGLE_UPSTREAM_ERROR"));
        assert_eq!(store.held_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_revoked_credential_sets_needs_reauth_until_success() {
        let provider = Arc::new(ScriptedProvider::new());
        let store = Arc::new(MemoryStore::new());
        provider
            .push(CAL, provider_error(ProviderErrorKind::AuthInvalid, 401))
            .push(CAL, page(Vec::new(), "tok"));
        let sync = orchestrator(&provider, &store);

        let failure = failure_of(sync.sync(&key(), Some(&credential()), false).await);
        assert_eq!(failure.code, FailureCode::GoogleReauthRequired);
        assert!(store.get_state(&key()).await.unwrap().unwrap().needs_reauth);

        sync.sync(&key(), Some(&credential()), false).await.unwrap();
        assert!(!store.get_state(&key()).await.unwrap().unwrap().needs_reauth);
    }

    #[tokio::test]
    async fn test_missing_credential_never_calls_provider() {
        let provider = Arc::new(ScriptedProvider::new());
        let store = Arc::new(MemoryStore::new());

        let failure = failure_of(orchestrator(&provider, &store).sync(&key(), None, false).await);

        assert_eq!(failure.code, FailureCode::GoogleReauthRequired);
        assert!(provider.calls().is_empty());
        let state = store.get_state(&key()).await.unwrap().unwrap();
        assert!(state.needs_reauth);
        assert!(!state.in_progress);
    }

    #[tokio::test]
    async fn test_cancelled_event_bookkeeping_across_syncs() {
        let provider = Arc::new(ScriptedProvider::new());
        let store = Arc::new(MemoryStore::new());
        provider
            .push(
                CAL,
                page(vec![timed("A", (10, 0), (11, 0)), cancelled("B")], "tok-1"),
            )
            .push(
                CAL,
                page(vec![timed("A", (10, 30), (11, 30)), cancelled("B")], "tok-2"),
            );
        let sync = orchestrator(&provider, &store);

        let first = sync.sync(&key(), Some(&credential()), false).await.unwrap();
        assert_eq!((first.inserted, first.updated, first.cancelled), (1, 0, 0));

        let second = sync.sync(&key(), Some(&credential()), true).await.unwrap();
        assert_eq!((second.inserted, second.updated, second.cancelled), (0, 1, 1));
        assert!(!second.full_sync);
        assert_eq!(store.count_active(&key()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_events_are_counted_not_fatal() {
        let provider = Arc::new(ScriptedProvider::new());
        let store = Arc::new(MemoryStore::new());
        let backwards = timed("bad", (11, 0), (10, 0));
        provider.push(CAL, page(vec![timed("ok", (9, 0), (10, 0)), backwards], "tok"));

        let outcome = orchestrator(&provider, &store)
            .sync(&key(), Some(&credential()), false)
            .await
            .unwrap();

        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.invalid_events_skipped, 1);
        assert_eq!(outcome.fetched_items, 2);
    }

    #[tokio::test]
    async fn test_recent_success_skips_without_fetching() {
        let provider = Arc::new(ScriptedProvider::new());
        let store = Arc::new(MemoryStore::new());
        let mut state = CalendarSyncState::new(key(), Utc::now());
        state.last_synced_at = Some(Utc::now() - chrono::Duration::seconds(30));
        store.put_state(state).unwrap();

        let outcome = orchestrator(&provider, &store)
            .sync(&key(), Some(&credential()), false)
            .await
            .unwrap();

        assert!(outcome.skipped);
        assert_eq!(outcome.inserted + outcome.updated + outcome.cancelled, 0);
        assert!(provider.calls().is_empty());
        assert!(store.recent_runs(&key(), 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_sync_on_same_calendar_times_out() {
        let provider = Arc::new(ScriptedProvider::with_delay(Duration::from_millis(200)));
        let store = Arc::new(MemoryStore::new());
        provider
            .push(CAL, page(Vec::new(), "tok"))
            .push(CAL, page(Vec::new(), "tok"));
        let sync = orchestrator(&provider, &store);

        let cal = key();
        let cred = credential();
        let (a, b) = tokio::join!(
            sync.sync(&cal, Some(&cred), true),
            sync.sync(&cal, Some(&cred), true),
        );

        let (ok, busy) = if a.is_ok() { (a, b) } else { (b, a) };
        assert!(ok.is_ok());
        let failure = failure_of(busy);
        assert_eq!(failure.code, FailureCode::SyncLockTimeout);
        assert!(failure.retryable);

        // The loser never started: one run, no recorded failure.
        assert_eq!(provider.calls().len(), 1);
        assert_eq!(store.recent_runs(&key(), 5).await.unwrap().len(), 1);
        let state = store.get_state(&key()).await.unwrap().unwrap();
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.last_error, None);
    }

    #[tokio::test]
    async fn test_storage_failure_after_fetch_releases_lock() {
        let provider = Arc::new(ScriptedProvider::new());
        let store = Arc::new(MemoryStore::new());
        provider.push(CAL, page(vec![timed("a", (10, 0), (11, 0))], "tok"));
        store.fail_next_upsert();

        let failure = failure_of(
            orchestrator(&provider, &store)
                .sync(&key(), Some(&credential()), false)
                .await,
        );

        assert_eq!(failure.code, FailureCode::SyncInternalError);
        assert_eq!(store.held_lock_count(), 0);
        assert_eq!(store.open_session_count(), 0);

        let state = store.get_state(&key()).await.unwrap().unwrap();
        assert!(!state.in_progress);
        assert_eq!(state.sync_token, None);
        let runs = store.recent_runs(&key(), 5).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_run_completion_failure_does_not_mark_success() {
        let provider = Arc::new(ScriptedProvider::new());
        let store = Arc::new(MemoryStore::new());
        provider.push(CAL, page(vec![timed("a", (10, 0), (11, 0))], "tok"));
        store.fail_next_complete_run();

        let failure = failure_of(
            orchestrator(&provider, &store)
                .sync(&key(), Some(&credential()), false)
                .await,
        );
        assert_eq!(failure.code, FailureCode::SyncInternalError);

        let state = store.get_state(&key()).await.unwrap().unwrap();
        assert!(!state.in_progress);
        assert_eq!(state.sync_token, None);
        assert_eq!(state.last_succeeded_at, None);
        assert_eq!(state.consecutive_failures, 1);
        let runs = store.recent_runs(&key(), 5).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(store.held_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_lock_storage_error_is_classified_internal() {
        let provider = Arc::new(ScriptedProvider::new());
        let store = Arc::new(MemoryStore::new());
        store.fail_next_session();

        let failure = failure_of(
            orchestrator(&provider, &store)
                .sync(&key(), Some(&credential()), true)
                .await,
        );

        assert_eq!(failure.code, FailureCode::SyncInternalError);
        assert!(!failure.retryable);
        assert!(failure.message.contains("injected session failure"));
        assert!(provider.calls().is_empty());
        assert_eq!(store.get_state(&key()).await.unwrap(), None);
    }
}
