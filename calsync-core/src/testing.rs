//! Scripted provider and fixtures shared by the orchestration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use crate::config::SyncSettings;
use crate::remote::{
    CalendarProvider, Credential, FetchedEvents, ProviderCalendar, ProviderError,
    ProviderErrorKind, ProviderEvent, ProviderEventTime,
};

type FetchResult = Result<FetchedEvents, ProviderError>;

/// Replays queued responses per calendar id and records every fetch it sees.
#[derive(Default)]
pub struct ScriptedProvider {
    fetches: Mutex<HashMap<String, VecDeque<FetchResult>>>,
    calendars: Mutex<Option<Result<Vec<ProviderCalendar>, ProviderError>>>,
    calls: Mutex<Vec<(String, Option<String>)>>,
    delay: Duration,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch sleeps this long before answering.
    pub fn with_delay(delay: Duration) -> Self {
        ScriptedProvider {
            delay,
            ..Self::default()
        }
    }

    pub fn push(&self, calendar_id: &str, result: FetchResult) -> &Self {
        self.fetches
            .lock()
            .unwrap()
            .entry(calendar_id.to_string())
            .or_default()
            .push_back(result);
        self
    }

    pub fn set_calendars(&self, result: Result<Vec<ProviderCalendar>, ProviderError>) {
        *self.calendars.lock().unwrap() = Some(result);
    }

    /// (calendar id, sync token) of every fetch, in order.
    pub fn calls(&self) -> Vec<(String, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn tokens_for(&self, calendar_id: &str) -> Vec<Option<String>> {
        self.calls()
            .into_iter()
            .filter(|(cal, _)| cal == calendar_id)
            .map(|(_, token)| token)
            .collect()
    }
}

#[async_trait]
impl CalendarProvider for ScriptedProvider {
    async fn fetch_events(
        &self,
        _credential: &Credential,
        calendar_id: &str,
        sync_token: Option<&str>,
    ) -> Result<FetchedEvents, ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push((calendar_id.to_string(), sync_token.map(str::to_string)));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = self
            .fetches
            .lock()
            .unwrap()
            .get_mut(calendar_id)
            .and_then(VecDeque::pop_front);
        next.unwrap_or_else(|| {
            Err(ProviderError::new(
                ProviderErrorKind::ClientError,
                format!("no scripted response for {calendar_id}"),
            ))
        })
    }

    async fn list_calendars(
        &self,
        _credential: &Credential,
    ) -> Result<Vec<ProviderCalendar>, ProviderError> {
        self.calendars
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// Millisecond-scale settings with no jitter.
pub fn fast_settings() -> SyncSettings {
    SyncSettings {
        skip_ttl_secs: 300,
        lock_timeout_ms: 50,
        lock_poll_interval_ms: 5,
        max_attempts: 5,
        base_delay_ms: 1,
        max_delay_ms: 4,
        max_jitter_ms: 0,
    }
}

pub fn credential() -> Credential {
    Credential::new("refresh-token")
}

/// A timed event on 2025-03-20 between the given (hour, minute) pairs.
pub fn timed(id: &str, start: (u32, u32), end: (u32, u32)) -> ProviderEvent {
    let at = |(h, m): (u32, u32)| ProviderEventTime {
        date_time: Some(Utc.with_ymd_and_hms(2025, 3, 20, h, m, 0).unwrap()),
        ..Default::default()
    };
    ProviderEvent {
        id: id.to_string(),
        status: Some("confirmed".into()),
        summary: Some(format!("event {id}")),
        start: Some(at(start)),
        end: Some(at(end)),
        ..Default::default()
    }
}

pub fn cancelled(id: &str) -> ProviderEvent {
    ProviderEvent {
        id: id.to_string(),
        status: Some("cancelled".into()),
        ..Default::default()
    }
}

pub fn page(items: Vec<ProviderEvent>, next_token: &str) -> FetchResult {
    Ok(FetchedEvents {
        items,
        next_sync_token: Some(next_token.to_string()),
        is_full_sync: false,
        time_zone: None,
    })
}

pub fn provider_error(kind: ProviderErrorKind, status: u16) -> FetchResult {
    Err(ProviderError::new(kind, "scripted failure").with_status(status))
}
