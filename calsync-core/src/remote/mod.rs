//! The provider side of a sync: what the coordinator asks of an external calendar API.
//!
//! The coordinator never talks HTTP itself. It calls a [`CalendarProvider`], which
//! returns provider-shaped events and a typed [`ProviderError`] on failure, so that
//! classification works on structure rather than on error strings.

pub mod protocol;
pub mod provider;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Google's alias for the account's main calendar.
pub const PRIMARY_CALENDAR_ID: &str = "primary";

/// A stored refresh credential for one account.
///
/// Debug output is redacted so credentials never end up in logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Credential(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// A calendar as listed by the provider for an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCalendar {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub selected: bool,
}

/// Start/end of a provider event: either a timestamp or a whole date.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEventTime {
    #[serde(default)]
    pub date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub time_zone: Option<String>,
}

/// One item of an events listing, in the provider's shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEvent {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub start: Option<ProviderEventTime>,
    #[serde(default)]
    pub end: Option<ProviderEventTime>,
    #[serde(default, rename = "iCalUID")]
    pub ical_uid: Option<String>,
    #[serde(default)]
    pub recurring_event_id: Option<String>,
    #[serde(default)]
    pub original_start_time: Option<ProviderEventTime>,
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub etag: Option<String>,
}

impl ProviderEvent {
    pub fn is_cancelled(&self) -> bool {
        self.status.as_deref() == Some("cancelled")
    }
}

/// Result of one (possibly paginated) events fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchedEvents {
    pub items: Vec<ProviderEvent>,
    #[serde(default)]
    pub next_sync_token: Option<String>,
    #[serde(default)]
    pub is_full_sync: bool,
    /// Calendar-level time zone, used when an event carries none.
    #[serde(default)]
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    AuthInvalid,
    TokenExpired,
    RateLimited,
    ServerError,
    ClientError,
    Network,
}

/// Typed failure returned by a provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    #[serde(default)]
    pub status: Option<u16>,
    pub message: String,
    /// Provider error code, e.g. `invalid_grant`.
    #[serde(default)]
    pub code: Option<String>,
    /// Provider error reason, e.g. `rateLimitExceeded`.
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub raw: Option<serde_json::Value>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        ProviderError {
            kind,
            status: None,
            message: message.into(),
            code: None,
            reason: None,
            raw: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// The provider rejected the incremental sync token (Google answers 410 Gone).
    pub fn is_token_expired(&self) -> bool {
        match self.kind {
            ProviderErrorKind::TokenExpired => true,
            ProviderErrorKind::ClientError => self.status == Some(410),
            _ => false,
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{:?} ({}): {}", self.kind, status, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

/// The external calendar API, as seen by the coordinator.
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    /// Fetch all events after `sync_token`, or the full current set when it is `None`.
    ///
    /// A rejected token must be reported as [`ProviderErrorKind::TokenExpired`].
    async fn fetch_events(
        &self,
        credential: &Credential,
        calendar_id: &str,
        sync_token: Option<&str>,
    ) -> Result<FetchedEvents, ProviderError>;

    async fn list_calendars(
        &self,
        credential: &Credential,
    ) -> Result<Vec<ProviderCalendar>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_debug_is_redacted() {
        let credential = Credential::new("1//refresh-secret");
        assert_eq!(format!("{credential:?}"), "Credential(***)");
        assert_eq!(credential.expose(), "1//refresh-secret");
        assert!(Credential::new("  ").is_blank());
    }

    #[test]
    fn test_provider_event_deserializes_google_shape() {
        let json = serde_json::json!({
            "id": "evt1",
            "status": "confirmed",
            "summary": "Standup",
            "iCalUID": "evt1@google.com",
            "start": {"dateTime": "2025-03-20T10:00:00+01:00", "timeZone": "Europe/Berlin"},
            "end": {"date": "2025-03-21"},
            "etag": "\"3181\""
        });

        let event: ProviderEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event.ical_uid.as_deref(), Some("evt1@google.com"));
        let start = event.start.unwrap();
        assert_eq!(start.date_time.unwrap().to_rfc3339(), "2025-03-20T09:00:00+00:00");
        assert_eq!(start.time_zone.as_deref(), Some("Europe/Berlin"));
        assert_eq!(
            event.end.unwrap().date,
            NaiveDate::from_ymd_opt(2025, 3, 21)
        );
        assert!(!ProviderEvent::default().is_cancelled());
    }

    #[test]
    fn test_provider_error_display() {
        let err = ProviderError::new(ProviderErrorKind::ServerError, "backend error").with_status(503);
        assert_eq!(err.to_string(), "ServerError (503): backend error");
    }
}
