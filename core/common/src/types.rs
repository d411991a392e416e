//! Backend identity types shared by every crate.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Backend family tag used to pick an adapter factory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendKind(String);

impl BackendKind {
    /// Create a new kind tag.
    ///
    /// # Errors
    /// - Returns error if the tag is empty
    pub fn new(kind: impl Into<String>) -> crate::Result<Self> {
        let kind = kind.into();
        if kind.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Backend kind cannot be empty".to_string(),
            ));
        }
        Ok(Self(kind))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one backend account.
///
/// Every node belongs to exactly one identity, and the router keeps one
/// adapter instance per identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CloudId {
    kind: BackendKind,
    account: String,
}

impl CloudId {
    /// Create a new identity.
    ///
    /// # Errors
    /// - Returns error if `kind` or `account` is empty
    pub fn new(kind: impl Into<String>, account: impl Into<String>) -> crate::Result<Self> {
        let account = account.into();
        if account.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Account label cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            kind: BackendKind::new(kind)?,
            account,
        })
    }

    /// Backend family of this identity.
    pub fn kind(&self) -> &BackendKind {
        &self.kind
    }

    /// Account label within the backend family.
    pub fn account(&self) -> &str {
        &self.account
    }
}

impl fmt::Display for CloudId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.account)
    }
}

/// Validate a single path segment.
pub fn validate_name(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(crate::Error::InvalidInput(
            "Node name cannot be empty".to_string(),
        ));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(crate::Error::InvalidInput(format!(
            "Node name cannot contain separators: {}",
            name
        )));
    }
    if name == "." || name == ".." {
        return Err(crate::Error::InvalidInput(format!(
            "Node name cannot be a relative reference: {}",
            name
        )));
    }
    Ok(())
}

/// Logical path of `name` under `parent_path`.
///
/// The root path is `""`, so children of the root start with `/`.
pub fn child_path(parent_path: &str, name: &str) -> String {
    format!("{}/{}", parent_path, name)
}

/// Split a logical path into its parent path and name.
///
/// Returns `None` for the root.
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    path.rfind('/').map(|idx| (&path[..idx], &path[idx + 1..]))
}

/// Whether `path` lies strictly below `ancestor`.
pub fn is_descendant(path: &str, ancestor: &str) -> bool {
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Non-empty segments of a slash-separated path.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloud_id_creation() {
        let id = CloudId::new("id", "alice@example.com").unwrap();
        assert_eq!(id.kind().as_str(), "id");
        assert_eq!(id.account(), "alice@example.com");
        assert_eq!(id.to_string(), "id:alice@example.com");
    }

    #[test]
    fn test_cloud_id_empty_fails() {
        assert!(CloudId::new("", "alice").is_err());
        assert!(CloudId::new("id", "").is_err());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("a.txt").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("..").is_err());
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/docs/a.txt"), Some(("/docs", "a.txt")));
        assert_eq!(split_path("/docs"), Some(("", "docs")));
        assert_eq!(split_path(""), None);
    }

    #[test]
    fn test_is_descendant() {
        assert!(is_descendant("/docs/a.txt", "/docs"));
        assert!(is_descendant("/docs", ""));
        assert!(!is_descendant("/docs2/a.txt", "/docs"));
        assert!(!is_descendant("/docs", "/docs"));
    }

    #[test]
    fn test_segments_skip_empty() {
        let parts: Vec<&str> = segments("//docs///a.txt/").collect();
        assert_eq!(parts, vec!["docs", "a.txt"]);
    }
}
