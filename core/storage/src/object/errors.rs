//! Normalization of [`ObjectApiError`] by service error code.

use cloudtree_common::Error;

use super::api::ObjectApiError;
use crate::transfer::TransferFailure;

/// Codes a well-behaved client retries with backoff.
const RETRY_CODES: &[&str] = &[
    "SlowDown",
    "RequestTimeout",
    "InternalError",
    "ServiceUnavailable",
];

/// Map a native error raised while working on `path`.
pub fn normalize(error: ObjectApiError, context: &str, path: &str) -> Error {
    let code = match &error {
        ObjectApiError::Transport(message) => return Error::NetworkUnavailable(message.clone()),
        ObjectApiError::Service { code, .. } => code.as_str(),
    };
    match code {
        "NoSuchKey" | "NotFound" | "NoSuchUpload" => Error::NotFound(path.to_string()),
        "NoSuchBucket" => Error::BucketOrContainerMissing(match &error {
            ObjectApiError::Service { message, .. } => message.clone(),
            ObjectApiError::Transport(_) => String::new(),
        }),
        "AccessDenied" | "AllAccessDisabled" => Error::Forbidden(path.to_string()),
        "InvalidAccessKeyId" | "SignatureDoesNotMatch" => Error::WrongCredentials(path.to_string()),
        "ExpiredToken" | "TokenRefreshRequired" => Error::Unauthorized(path.to_string()),
        _ => Error::fatal(format!("{} {}", context, path), error),
    }
}

/// Classify a failure inside a multipart upload.
pub fn transfer_failure(error: ObjectApiError, context: &str, path: &str) -> TransferFailure {
    match &error {
        ObjectApiError::Transport(message) => TransferFailure::Transient(message.clone()),
        ObjectApiError::Service { code, status, .. }
            if RETRY_CODES.contains(&code.as_str()) || *status >= 500 =>
        {
            TransferFailure::Retry
        }
        _ => TransferFailure::Fatal(normalize(error, context, path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        let cases = [
            ("NoSuchKey", 404),
            ("NoSuchBucket", 404),
            ("AccessDenied", 403),
            ("InvalidAccessKeyId", 403),
            ("ExpiredToken", 400),
        ];
        let mapped: Vec<Error> = cases
            .iter()
            .map(|(code, status)| normalize(ObjectApiError::service(*code, *status, "media"), "get", "/a"))
            .collect();

        assert!(matches!(mapped[0], Error::NotFound(_)));
        assert!(matches!(&mapped[1], Error::BucketOrContainerMissing(b) if b == "media"));
        assert!(matches!(mapped[2], Error::Forbidden(_)));
        assert!(matches!(mapped[3], Error::WrongCredentials(_)));
        assert!(matches!(mapped[4], Error::Unauthorized(_)));
    }

    #[test]
    fn test_unknown_code_is_fatal() {
        let e = normalize(ObjectApiError::service("SlowDown", 503, "x"), "list", "/a");
        assert!(matches!(e, Error::Fatal { .. }));
        assert!(matches!(
            normalize(ObjectApiError::Transport("dns".into()), "list", "/a"),
            Error::NetworkUnavailable(_)
        ));
    }

    #[test]
    fn test_transfer_classification() {
        assert!(matches!(
            transfer_failure(ObjectApiError::service("SlowDown", 503, "x"), "upload", "/a"),
            TransferFailure::Retry
        ));
        assert!(matches!(
            transfer_failure(ObjectApiError::service("Weird", 502, "x"), "upload", "/a"),
            TransferFailure::Retry
        ));
        assert!(matches!(
            transfer_failure(ObjectApiError::Transport("reset".into()), "upload", "/a"),
            TransferFailure::Transient(_)
        ));
        assert!(matches!(
            transfer_failure(ObjectApiError::service("NoSuchUpload", 404, "x"), "upload", "/a"),
            TransferFailure::Fatal(Error::NotFound(_))
        ));
    }
}
