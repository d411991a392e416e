//! Normalization of [`PathApiError`] into the shared taxonomy.

use cloudtree_common::Error;

use super::api::PathApiError;
use crate::transfer::TransferFailure;

/// What the adapter was doing when the native call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Lookup,
    List,
    Create,
    Move,
    Write,
    Read,
    Delete,
    Account,
}

impl Op {
    fn name(self) -> &'static str {
        match self {
            Op::Lookup => "get metadata",
            Op::List => "list folder",
            Op::Create => "create folder",
            Op::Move => "move",
            Op::Write => "upload",
            Op::Read => "download",
            Op::Delete => "delete",
            Op::Account => "get current account",
        }
    }
}

/// Map a native error raised while working on `path`.
///
/// Not-found during lookups is handled by the caller before reaching here.
pub fn normalize(error: PathApiError, op: Op, path: &str) -> Error {
    match error {
        PathApiError::NotFound(_) if matches!(op, Op::Write | Op::Create) => {
            Error::ParentMissing(path.to_string())
        }
        PathApiError::NotFound(_) => Error::NotFound(path.to_string()),
        PathApiError::Conflict(_) => Error::AlreadyExists(path.to_string()),
        PathApiError::InvalidAccessToken => Error::WrongCredentials(format!("{}: {}", op.name(), path)),
        PathApiError::ExpiredAccessToken => Error::Unauthorized(format!("{}: {}", op.name(), path)),
        PathApiError::Forbidden(message) => Error::Forbidden(format!("{}: {}", path, message)),
        PathApiError::Network(message) => Error::NetworkUnavailable(message),
        other => Error::fatal(format!("{} {}", op.name(), path), other),
    }
}

/// Classify a failure inside a chunked upload.
pub fn transfer_failure(error: PathApiError, path: &str) -> TransferFailure {
    match error {
        PathApiError::IncorrectOffset { correct_offset } => TransferFailure::IncorrectOffset {
            expected: correct_offset,
        },
        PathApiError::RateLimited => TransferFailure::Retry,
        PathApiError::Http { status, .. } if status >= 500 => TransferFailure::Retry,
        PathApiError::Network(message) => TransferFailure::Transient(message),
        other => TransferFailure::Fatal(normalize(other, Op::Write, path)),
    }
}
