//! Normalization of [`IdApiError`] by status code and reason.

use cloudtree_common::Error;

use super::api::IdApiError;
use crate::transfer::TransferFailure;

/// Reasons accompanying a 403 that mean "slow down", not "denied".
const RATE_LIMIT_REASONS: &[&str] = &["rateLimitExceeded", "userRateLimitExceeded"];

/// Reason sent when the refresh token or credential was revoked.
const INVALID_GRANT: &str = "invalid_grant";

fn is_rate_limited(error: &IdApiError) -> bool {
    match error.status_code() {
        Some(429) => true,
        Some(403) => error
            .reason()
            .map(|r| RATE_LIMIT_REASONS.contains(&r))
            .unwrap_or(false),
        _ => false,
    }
}

/// Map a native error raised while working on `path`.
pub fn normalize(error: IdApiError, context: &str, path: &str) -> Error {
    if let IdApiError::Transport(message) = &error {
        return Error::NetworkUnavailable(message.clone());
    }
    if error.reason() == Some(INVALID_GRANT) {
        return Error::WrongCredentials(path.to_string());
    }
    match error.status_code() {
        Some(404) => Error::NotFound(path.to_string()),
        Some(401) => Error::Unauthorized(path.to_string()),
        Some(403) if !is_rate_limited(&error) => Error::Forbidden(path.to_string()),
        Some(409) => Error::AlreadyExists(path.to_string()),
        _ => Error::fatal(format!("{} {}", context, path), error),
    }
}

/// Classify a failure inside a chunked transfer.
pub fn transfer_failure(error: IdApiError, context: &str, path: &str) -> TransferFailure {
    match &error {
        IdApiError::Transport(message) => TransferFailure::Transient(message.clone()),
        _ if is_rate_limited(&error) => TransferFailure::Retry,
        IdApiError::Http { status, .. } if *status >= 500 => TransferFailure::Retry,
        _ => TransferFailure::Fatal(normalize(error, context, path)),
    }
}
