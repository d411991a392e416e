//! Shared error taxonomy for every storage backend.
//!
//! Adapters catch backend-native failures at the point where the native call
//! returns and re-raise exactly one of these variants. Only [`Error::Fatal`]
//! carries the native error verbatim.

use thiserror::Error;

/// Boxed native error kept for diagnostics.
pub type NativeError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Top-level error type for cloud storage operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Target path or identifier does not exist remotely.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Create, move or non-replacing write targets an existing node.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Operation requires a parent that is absent remotely.
    #[error("Parent missing: {0}")]
    ParentMissing(String),

    /// Credential was rejected or has expired.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Credential is valid but lacks permission for this node.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Credential is wrong; the stored credential must be discarded.
    #[error("Wrong credentials: {0}")]
    WrongCredentials(String),

    /// No connectivity or a transport-level failure.
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// Object storage container does not exist.
    #[error("Bucket or container missing: {0}")]
    BucketOrContainerMissing(String),

    /// Caller violated a precondition.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Local I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected backend failure.
    #[error("{context}: {source}")]
    Fatal {
        context: String,
        #[source]
        source: NativeError,
    },
}

impl Error {
    /// Wrap an unexpected native error with diagnostic context.
    pub fn fatal(context: impl Into<String>, source: impl Into<NativeError>) -> Self {
        Error::Fatal {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Fatal error without an underlying native error.
    pub fn fatal_msg(context: impl Into<String>, message: impl Into<String>) -> Self {
        let message: String = message.into();
        Error::Fatal {
            context: context.into(),
            source: message.into(),
        }
    }

    /// Whether this error means the credential no longer works.
    ///
    /// The router evicts the cached adapter for these.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            Error::Unauthorized(_) | Error::WrongCredentials(_)
        )
    }

    /// Whether the stored credential itself must be invalidated.
    pub fn invalidates_credential(&self) -> bool {
        matches!(self, Error::WrongCredentials(_))
    }

    /// Whether this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authentication_classification() {
        assert!(Error::Unauthorized("token expired".into()).is_authentication());
        assert!(Error::WrongCredentials("bad password".into()).is_authentication());
        assert!(!Error::Forbidden("/docs".into()).is_authentication());
        assert!(Error::WrongCredentials("x".into()).invalidates_credential());
        assert!(!Error::Unauthorized("x".into()).invalidates_credential());
    }

    #[test]
    fn test_fatal_keeps_native_message() {
        let native = std::io::Error::new(std::io::ErrorKind::Other, "socket reset");
        let err = Error::fatal("upload /docs/a.txt", native);
        assert_eq!(err.to_string(), "upload /docs/a.txt: socket reset");
        assert!(std::error::Error::source(&err).is_some());
    }
}
