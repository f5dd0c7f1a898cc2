//! Maps provider failures into the stable failure taxonomy.
//!
//! | Condition                               | Code                     | Retryable |
//! |-----------------------------------------|--------------------------|-----------|
//! | missing or invalid credential           | `GOOGLE_REAUTH_REQUIRED` | no        |
//! | incremental sync token rejected         | `SYNC_TOKEN_EXPIRED`     | no*       |
//! | rate limit, 5xx, transient network      | `GOOGLE_UPSTREAM_ERROR`  | yes       |
//! | any other provider rejection            | `GOOGLE_UPSTREAM_ERROR`  | no        |
//!
//! *A rejected token is normally handled inline by the session (reset and refetch);
//! the classification only surfaces if the provider rejects a full resync too.

use crate::error::{FailureCode, SyncFailure};
use crate::remote::{ProviderError, ProviderErrorKind};

/// Provider error codes that mean the refresh credential is dead.
const REAUTH_CODES: &[&str] = &["invalid_grant", "unauthorized_client", "invalid_client"];

/// Provider reasons Google uses for quota errors served as 403.
const RATE_LIMIT_REASONS: &[&str] = &[
    "rateLimitExceeded",
    "userRateLimitExceeded",
    "quotaExceeded",
    "backendError",
];

/// Resolve the effective kind from the error's structure.
///
/// Providers are expected to tag errors correctly, but a plain `ClientError` that
/// carries a telling status, code or reason is refined here.
fn effective_kind(error: &ProviderError) -> ProviderErrorKind {
    if error.kind != ProviderErrorKind::ClientError {
        return error.kind;
    }

    if error
        .code
        .as_deref()
        .is_some_and(|code| REAUTH_CODES.contains(&code))
    {
        return ProviderErrorKind::AuthInvalid;
    }

    match error.status {
        Some(401) => ProviderErrorKind::AuthInvalid,
        Some(410) => ProviderErrorKind::TokenExpired,
        Some(429) => ProviderErrorKind::RateLimited,
        Some(403)
            if error
                .reason
                .as_deref()
                .is_some_and(|reason| RATE_LIMIT_REASONS.contains(&reason)) =>
        {
            ProviderErrorKind::RateLimited
        }
        Some(status) if status >= 500 => ProviderErrorKind::ServerError,
        _ => ProviderErrorKind::ClientError,
    }
}

fn details(error: &ProviderError, kind: ProviderErrorKind) -> serde_json::Value {
    serde_json::json!({
        "kind": kind,
        "status": error.status,
        "providerCode": error.code,
        "providerDescription": error.message,
        "reason": error.reason,
    })
}

pub fn classify(error: &ProviderError) -> SyncFailure {
    let kind = effective_kind(error);

    let failure = match kind {
        ProviderErrorKind::AuthInvalid => SyncFailure::new(
            FailureCode::GoogleReauthRequired,
            "Google authorization is missing or was revoked; the account must be reconnected",
            false,
        ),
        ProviderErrorKind::TokenExpired => SyncFailure::new(
            FailureCode::SyncTokenExpired,
            "Google rejected the incremental sync token",
            false,
        ),
        ProviderErrorKind::RateLimited => SyncFailure::new(
            FailureCode::GoogleUpstreamError,
            format!("Google rate limit hit: {}", error.message),
            true,
        ),
        ProviderErrorKind::ServerError => SyncFailure::new(
            FailureCode::GoogleUpstreamError,
            format!("Google server error: {}", error.message),
            true,
        ),
        ProviderErrorKind::Network => SyncFailure::new(
            FailureCode::GoogleUpstreamError,
            format!("Network error talking to Google: {}", error.message),
            true,
        ),
        ProviderErrorKind::ClientError => SyncFailure::new(
            FailureCode::GoogleUpstreamError,
            format!("Google rejected the request: {}", error.message),
            false,
        ),
    };

    failure.with_details(details(error, kind))
}

/// Classify a missing or blank credential without calling the provider.
pub fn missing_credential() -> SyncFailure {
    SyncFailure::new(
        FailureCode::GoogleReauthRequired,
        "No Google credential is stored for this account; the account must be connected",
        false,
    )
    .with_details(serde_json::json!({ "kind": ProviderErrorKind::AuthInvalid }))
}
