//! File and folder nodes addressed by logical path.
//!
//! Nodes are lightweight references: constructing one never touches a
//! backend. A folder is either the root of its identity or a child of another
//! folder; the root is an explicit variant rather than a missing parent.

use chrono::{DateTime, Utc};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::types::{child_path, validate_name, CloudId};
use crate::Result;

#[derive(Debug)]
enum Location {
    Root,
    Child { parent: CloudFolder, name: String },
}

#[derive(Debug)]
struct FolderInner {
    cloud: CloudId,
    location: Location,
    path: String,
}

/// A folder reference.
///
/// Cloning is cheap; the parent chain is shared.
#[derive(Debug, Clone)]
pub struct CloudFolder {
    inner: Arc<FolderInner>,
}

impl CloudFolder {
    /// The root folder of `cloud`. Its path is the empty string.
    pub fn root(cloud: CloudId) -> Self {
        Self {
            inner: Arc::new(FolderInner {
                cloud,
                location: Location::Root,
                path: String::new(),
            }),
        }
    }

    /// A child folder reference.
    ///
    /// # Errors
    /// - Returns error if `name` is not a valid path segment
    pub fn child(parent: &CloudFolder, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            inner: Arc::new(FolderInner {
                cloud: parent.cloud().clone(),
                path: child_path(parent.path(), &name),
                location: Location::Child {
                    parent: parent.clone(),
                    name,
                },
            }),
        })
    }

    pub fn is_root(&self) -> bool {
        matches!(self.inner.location, Location::Root)
    }

    /// Folder name; empty for the root.
    pub fn name(&self) -> &str {
        match &self.inner.location {
            Location::Root => "",
            Location::Child { name, .. } => name,
        }
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Parent folder, `None` only for the root.
    pub fn parent(&self) -> Option<&CloudFolder> {
        match &self.inner.location {
            Location::Root => None,
            Location::Child { parent, .. } => Some(parent),
        }
    }

    pub fn cloud(&self) -> &CloudId {
        &self.inner.cloud
    }

    /// The same folder re-exposed under another identity.
    ///
    /// Name and path are preserved; every ancestor is re-parented too.
    pub fn with_cloud(&self, cloud: &CloudId) -> CloudFolder {
        match &self.inner.location {
            Location::Root => CloudFolder::root(cloud.clone()),
            Location::Child { parent, name } => CloudFolder {
                inner: Arc::new(FolderInner {
                    cloud: cloud.clone(),
                    location: Location::Child {
                        parent: parent.with_cloud(cloud),
                        name: name.clone(),
                    },
                    path: self.inner.path.clone(),
                }),
            },
        }
    }

    /// Ancestors from the topmost non-root folder down to the direct parent.
    pub fn ancestors(&self) -> Vec<CloudFolder> {
        let mut chain = Vec::new();
        let mut current = self.parent();
        while let Some(folder) = current {
            if folder.is_root() {
                break;
            }
            chain.push(folder.clone());
            current = folder.parent();
        }
        chain.reverse();
        chain
    }
}

impl PartialEq for CloudFolder {
    fn eq(&self, other: &Self) -> bool {
        self.cloud() == other.cloud() && self.path() == other.path()
    }
}

impl Eq for CloudFolder {}

impl Hash for CloudFolder {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.cloud().hash(state);
        self.path().hash(state);
    }
}

impl fmt::Display for CloudFolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "{}:/", self.cloud())
        } else {
            write!(f, "{}:{}", self.cloud(), self.path())
        }
    }
}

/// A file reference.
#[derive(Debug, Clone)]
pub struct CloudFile {
    parent: CloudFolder,
    name: String,
    path: String,
    size: Option<u64>,
    modified: Option<DateTime<Utc>>,
}

impl CloudFile {
    /// A file reference under `parent`.
    ///
    /// # Errors
    /// - Returns error if `name` is not a valid path segment
    pub fn new(parent: &CloudFolder, name: impl Into<String>, size: Option<u64>) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            path: child_path(parent.path(), &name),
            parent: parent.clone(),
            name,
            size,
            modified: None,
        })
    }

    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.size = size;
        self
    }

    pub fn with_modified(mut self, modified: Option<DateTime<Utc>>) -> Self {
        self.modified = modified;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parent(&self) -> &CloudFolder {
        &self.parent
    }

    pub fn cloud(&self) -> &CloudId {
        self.parent.cloud()
    }

    /// Size in bytes, unknown until the file has been listed or written.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        self.modified
    }

    /// The same file re-exposed under another identity.
    pub fn with_cloud(&self, cloud: &CloudId) -> CloudFile {
        CloudFile {
            parent: self.parent.with_cloud(cloud),
            ..self.clone()
        }
    }
}

impl PartialEq for CloudFile {
    fn eq(&self, other: &Self) -> bool {
        self.cloud() == other.cloud() && self.path == other.path
    }
}

impl Eq for CloudFile {}

impl Hash for CloudFile {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.cloud().hash(state);
        self.path.hash(state);
    }
}

impl fmt::Display for CloudFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cloud(), self.path)
    }
}

/// Either kind of node.
#[derive(Debug, Clone)]
pub enum CloudNode {
    File(CloudFile),
    Folder(CloudFolder),
}

impl CloudNode {
    pub fn name(&self) -> &str {
        match self {
            CloudNode::File(f) => f.name(),
            CloudNode::Folder(f) => f.name(),
        }
    }

    pub fn path(&self) -> &str {
        match self {
            CloudNode::File(f) => f.path(),
            CloudNode::Folder(f) => f.path(),
        }
    }

    pub fn parent(&self) -> Option<&CloudFolder> {
        match self {
            CloudNode::File(f) => Some(f.parent()),
            CloudNode::Folder(f) => f.parent(),
        }
    }

    pub fn cloud(&self) -> &CloudId {
        match self {
            CloudNode::File(f) => f.cloud(),
            CloudNode::Folder(f) => f.cloud(),
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, CloudNode::Folder(_))
    }

    pub fn as_file(&self) -> Option<&CloudFile> {
        match self {
            CloudNode::File(f) => Some(f),
            CloudNode::Folder(_) => None,
        }
    }

    pub fn as_folder(&self) -> Option<&CloudFolder> {
        match self {
            CloudNode::Folder(f) => Some(f),
            CloudNode::File(_) => None,
        }
    }

    pub fn with_cloud(&self, cloud: &CloudId) -> CloudNode {
        match self {
            CloudNode::File(f) => CloudNode::File(f.with_cloud(cloud)),
            CloudNode::Folder(f) => CloudNode::Folder(f.with_cloud(cloud)),
        }
    }
}

impl From<CloudFile> for CloudNode {
    fn from(file: CloudFile) -> Self {
        CloudNode::File(file)
    }
}

impl From<CloudFolder> for CloudNode {
    fn from(folder: CloudFolder) -> Self {
        CloudNode::Folder(folder)
    }
}

impl PartialEq for CloudNode {
    fn eq(&self, other: &Self) -> bool {
        self.cloud() == other.cloud() && self.path() == other.path()
    }
}

impl Eq for CloudNode {}

impl Hash for CloudNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.cloud().hash(state);
        self.path().hash(state);
    }
}

impl fmt::Display for CloudNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudNode::File(file) => file.fmt(f),
            CloudNode::Folder(folder) => folder.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cloud() -> CloudId {
        CloudId::new("memory", "tester").unwrap()
    }

    #[test]
    fn test_root_has_empty_path() {
        let root = CloudFolder::root(cloud());
        assert!(root.is_root());
        assert_eq!(root.path(), "");
        assert_eq!(root.name(), "");
        assert!(root.parent().is_none());
    }

    #[test]
    fn test_child_paths() {
        let root = CloudFolder::root(cloud());
        let docs = CloudFolder::child(&root, "docs").unwrap();
        let file = CloudFile::new(&docs, "a.txt", Some(5)).unwrap();

        assert_eq!(docs.path(), "/docs");
        assert_eq!(file.path(), "/docs/a.txt");
        assert_eq!(file.parent(), &docs);
        assert_eq!(file.size(), Some(5));
    }

    #[test]
    fn test_equality_is_by_path_and_cloud() {
        let root = CloudFolder::root(cloud());
        let a = CloudFolder::child(&root, "docs").unwrap();
        let b = CloudFolder::child(&root, "docs").unwrap();
        assert_eq!(a, b);

        let other = CloudFolder::root(CloudId::new("memory", "someone-else").unwrap());
        let c = CloudFolder::child(&other, "docs").unwrap();
        assert_ne!(a, c);

        let file = CloudFile::new(&root, "docs", None).unwrap();
        assert_eq!(CloudNode::from(file), CloudNode::from(a));
    }

    #[test]
    fn test_with_cloud_preserves_path() {
        let root = CloudFolder::root(cloud());
        let nested = CloudFolder::child(&CloudFolder::child(&root, "a").unwrap(), "b").unwrap();
        let moved_cloud = CloudId::new("scoped", "view").unwrap();

        let reparented = nested.with_cloud(&moved_cloud);
        assert_eq!(reparented.path(), "/a/b");
        assert_eq!(reparented.cloud(), &moved_cloud);
        assert_eq!(reparented.parent().unwrap().cloud(), &moved_cloud);
    }

    #[test]
    fn test_ancestors_top_down() {
        let root = CloudFolder::root(cloud());
        let a = CloudFolder::child(&root, "a").unwrap();
        let b = CloudFolder::child(&a, "b").unwrap();
        let c = CloudFolder::child(&b, "c").unwrap();

        let paths: Vec<String> = c.ancestors().iter().map(|f| f.path().to_string()).collect();
        assert_eq!(paths, vec!["/a", "/a/b"]);
        assert!(a.ancestors().is_empty());
    }

    #[test]
    fn test_invalid_names_rejected() {
        let root = CloudFolder::root(cloud());
        assert!(CloudFolder::child(&root, "a/b").is_err());
        assert!(CloudFile::new(&root, "", None).is_err());
    }

    proptest! {
        #[test]
        fn prop_path_is_parent_path_plus_name(names in proptest::collection::vec("[a-zA-Z0-9_.-]{1,12}", 1..6)) {
            prop_assume!(names.iter().all(|n| n != "." && n != ".."));
            let mut folder = CloudFolder::root(cloud());
            for name in &names {
                let child = CloudFolder::child(&folder, name.clone()).unwrap();
                prop_assert_eq!(child.path(), format!("{}/{}", folder.path(), name));
                folder = child;
            }
            prop_assert_eq!(folder.path(), format!("/{}", names.join("/")));
        }
    }
}
