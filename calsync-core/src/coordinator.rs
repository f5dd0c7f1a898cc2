//! Fans one sync request out over its calendar targets and aggregates the result.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::SyncSettings;
use crate::error::{FailureCode, SyncError, SyncFailure, SyncResult};
use crate::lock::{AdvisoryLocks, LockManager};
use crate::orchestrator::{CalendarSyncOutcome, Orchestrator};
use crate::remote::{CalendarProvider, Credential, PRIMARY_CALENDAR_ID};
use crate::resolve::resolve_targets;
use crate::store::{CalendarKey, EventStore, SyncStateStore};

/// A request to sync one user's calendars.
#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    pub user_id: String,
    pub credential: Option<Credential>,
    /// Defaults to the primary calendar.
    pub calendar_id: Option<String>,
    pub force: bool,
    pub include_all_calendars: bool,
}

/// A target that failed while the others carried on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedCalendar {
    pub calendar_id: String,
    pub code: FailureCode,
    pub message: String,
    pub retryable: bool,
}

/// Aggregate over every target of one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub user_id: String,
    /// True only when every target was skipped.
    pub skipped: bool,
    pub inserted: u64,
    pub updated: u64,
    pub cancelled: u64,
    pub invalid_events_skipped: u64,
    pub fetched_items: u64,
    pub full_sync: bool,
    pub sync_token_updated: bool,
    pub calendars: Vec<CalendarSyncOutcome>,
    pub failed_calendars: Vec<FailedCalendar>,
    pub calendar_target_count: usize,
}

impl SyncSummary {
    fn add(&mut self, outcome: CalendarSyncOutcome) {
        self.inserted += outcome.inserted;
        self.updated += outcome.updated;
        self.cancelled += outcome.cancelled;
        self.invalid_events_skipped += outcome.invalid_events_skipped;
        self.fetched_items += outcome.fetched_items;
        self.full_sync |= outcome.full_sync;
        self.sync_token_updated |= outcome.sync_token_updated;
        self.calendars.push(outcome);
    }

    fn finish(&mut self) {
        self.skipped = self.failed_calendars.is_empty()
            && !self.calendars.is_empty()
            && self.calendars.iter().all(|c| c.skipped);
    }
}

/// One member of a group sync.
#[derive(Debug, Clone)]
pub struct GroupMember {
    pub user_id: String,
    pub credential: Option<Credential>,
    pub calendar_id: Option<String>,
}

fn is_reauth(error: &SyncError) -> bool {
    error.failure().is_some_and(SyncFailure::needs_reauth)
}

pub struct SyncCoordinator {
    provider: Arc<dyn CalendarProvider>,
    orchestrator: Orchestrator,
}

impl SyncCoordinator {
    pub fn new(
        provider: Arc<dyn CalendarProvider>,
        states: Arc<dyn SyncStateStore>,
        events: Arc<dyn EventStore>,
        locks: Arc<dyn AdvisoryLocks>,
        settings: SyncSettings,
    ) -> Self {
        let locks = LockManager::new(locks, settings.lock_poll_interval());
        let orchestrator = Orchestrator::new(provider.clone(), states, events, locks, settings);
        SyncCoordinator {
            provider,
            orchestrator,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Sync every target of the request.
    ///
    /// A reauth failure on any target aborts the call. Other failures are collected
    /// in `failed_calendars` when several calendars were requested; a single-calendar
    /// request returns the failure as is.
    #[instrument(
        level = "info",
        skip(self, request),
        fields(user_id = %request.user_id, all = request.include_all_calendars)
    )]
    pub async fn sync_calendar(&self, request: &SyncRequest) -> SyncResult<SyncSummary> {
        let requested = request.calendar_id.as_deref().unwrap_or(PRIMARY_CALENDAR_ID);
        let credential = request.credential.as_ref();

        let targets = resolve_targets(
            self.provider.as_ref(),
            credential,
            requested,
            request.include_all_calendars,
        )
        .await?;

        let mut summary = SyncSummary {
            user_id: request.user_id.clone(),
            calendar_target_count: targets.len(),
            ..Default::default()
        };
        let mut first_failure: Option<SyncFailure> = None;

        for target in &targets {
            let key = CalendarKey::new(&request.user_id, &target.id);
            match self.orchestrator.sync(&key, credential, request.force).await {
                Ok(outcome) => summary.add(outcome),
                Err(e) if is_reauth(&e) || !request.include_all_calendars => return Err(e),
                Err(e) => {
                    warn!(calendar_id = %target.id, error = %e, "calendar failed, continuing with the rest");
                    let failure = e.into_failure("calendar sync failed");
                    summary.failed_calendars.push(FailedCalendar {
                        calendar_id: target.id.clone(),
                        code: failure.code,
                        message: failure.message.clone(),
                        retryable: failure.retryable,
                    });
                    first_failure.get_or_insert(failure);
                }
            }
        }

        if summary.calendars.is_empty()
            && let Some(first) = first_failure
        {
            return Err(SyncFailure::new(
                FailureCode::GoogleUpstreamError,
                format!("All {} calendars failed to sync: {}", targets.len(), first.message),
                first.retryable,
            )
            .with_details(serde_json::json!({
                "calendarId": summary.failed_calendars[0].calendar_id,
                "code": first.code,
                "details": first.details,
                "failedCalendars": summary.failed_calendars,
            }))
            .into());
        }

        summary.finish();
        info!(
            targets = summary.calendar_target_count,
            failed = summary.failed_calendars.len(),
            skipped = summary.skipped,
            "sync request finished"
        );
        Ok(summary)
    }

    /// Sync each member's calendar in turn.
    ///
    /// Members without a usable credential, or whose stored state already needs
    /// reauth, are reported together before anything runs. A reauth failure during a
    /// member's sync stops the group.
    #[instrument(level = "info", skip(self, members), fields(members = members.len()))]
    pub async fn sync_for_group_members(
        &self,
        members: &[GroupMember],
        force: bool,
    ) -> SyncResult<Vec<SyncSummary>> {
        let mut missing = Vec::new();
        for member in members {
            let calendar_id = member.calendar_id.as_deref().unwrap_or(PRIMARY_CALENDAR_ID);
            let key = CalendarKey::new(&member.user_id, calendar_id);
            if member.credential.as_ref().is_none_or(Credential::is_blank)
                || self.orchestrator.needs_reauth(&key).await?
            {
                missing.push(member.user_id.clone());
            }
        }
        if !missing.is_empty() {
            warn!(?missing, "group members need reauthorization");
            return Err(SyncError::MembersNeedReauth(missing));
        }

        let mut summaries = Vec::with_capacity(members.len());
        for member in members {
            let request = SyncRequest {
                user_id: member.user_id.clone(),
                credential: member.credential.clone(),
                calendar_id: member.calendar_id.clone(),
                force,
                include_all_calendars: false,
            };
            match self.sync_calendar(&request).await {
                Ok(summary) => summaries.push(summary),
                Err(e) if is_reauth(&e) => {
                    return Err(SyncError::MembersNeedReauth(vec![member.user_id.clone()]));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(summaries)
    }
}
