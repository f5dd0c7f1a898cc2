//! Error types for the sync coordinator.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable failure codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    GoogleReauthRequired,
    SyncTokenExpired,
    SyncLockTimeout,
    GoogleUpstreamError,
    SyncInternalError,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::GoogleReauthRequired => "GOOGLE_REAUTH_REQUIRED",
            FailureCode::SyncTokenExpired => "SYNC_TOKEN_EXPIRED",
            FailureCode::SyncLockTimeout => "SYNC_LOCK_TIMEOUT",
            FailureCode::GoogleUpstreamError => "GOOGLE_UPSTREAM_ERROR",
            FailureCode::SyncInternalError => "SYNC_INTERNAL_ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GOOGLE_REAUTH_REQUIRED" => Some(FailureCode::GoogleReauthRequired),
            "SYNC_TOKEN_EXPIRED" => Some(FailureCode::SyncTokenExpired),
            "SYNC_LOCK_TIMEOUT" => Some(FailureCode::SyncLockTimeout),
            "GOOGLE_UPSTREAM_ERROR" => Some(FailureCode::GoogleUpstreamError),
            "SYNC_INTERNAL_ERROR" => Some(FailureCode::SyncInternalError),
            _ => None,
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure: everything a caller needs without looking at raw provider errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub code: FailureCode,
    pub message: String,
    pub retryable: bool,
    pub details: serde_json::Value,
}

impl SyncFailure {
    pub fn new(code: FailureCode, message: impl Into<String>, retryable: bool) -> Self {
        SyncFailure {
            code,
            message: message.into(),
            retryable,
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn lock_timeout(calendar_id: &str, waited_ms: u64) -> Self {
        SyncFailure::new(
            FailureCode::SyncLockTimeout,
            format!("Another sync for calendar '{calendar_id}' is in progress"),
            true,
        )
        .with_details(serde_json::json!({
            "calendarId": calendar_id,
            "waitedMs": waited_ms,
        }))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        SyncFailure::new(FailureCode::SyncInternalError, message, false)
    }

    pub fn needs_reauth(&self) -> bool {
        self.code == FailureCode::GoogleReauthRequired
    }
}

impl fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Errors that can occur in sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Sync failed: {0}")]
    Sync(SyncFailure),

    #[error("Reauthorization required for: {}", .0.join(", "))]
    MembersNeedReauth(Vec<String>),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// The classified failure, if this error carries one.
    pub fn failure(&self) -> Option<&SyncFailure> {
        match self {
            SyncError::Sync(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.failure().is_some_and(|f| f.retryable)
    }

    /// Keep a classified failure; anything else becomes `SYNC_INTERNAL_ERROR`.
    pub fn into_failure(self, context: &str) -> SyncFailure {
        match self {
            SyncError::Sync(failure) => failure,
            other => SyncFailure::internal(format!("{context}: {other}")),
        }
    }
}

impl From<SyncFailure> for SyncError {
    fn from(failure: SyncFailure) -> Self {
        SyncError::Sync(failure)
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
