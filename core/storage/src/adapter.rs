//! Uniform file-tree contract implemented once per backend family.

use async_trait::async_trait;

use cloudtree_common::types::segments;
use cloudtree_common::{CloudFile, CloudFolder, CloudId, CloudNode, Error, Result};

use crate::io::{DataSink, DataSource};
use crate::progress::ProgressSink;

/// File-tree operations against one backend identity.
///
/// Every failure is reported as exactly one [`Error`] variant; native error
/// types never cross this boundary.
#[async_trait]
pub trait CloudAdapter: Send + Sync {
    /// Identity this adapter serves.
    fn cloud(&self) -> &CloudId;

    /// Whether the router must check connectivity before remote calls.
    fn requires_network(&self) -> bool {
        true
    }

    fn root(&self) -> CloudFolder {
        CloudFolder::root(self.cloud().clone())
    }

    /// Folder reference for a slash-separated path.
    ///
    /// Intermediate folders need not exist remotely.
    fn resolve(&self, path: &str) -> Result<CloudFolder> {
        let mut folder = self.root();
        for segment in segments(path) {
            folder = self.folder(&folder, segment)?;
        }
        Ok(folder)
    }

    /// File reference under `parent`. No remote call.
    fn file(&self, parent: &CloudFolder, name: &str, size: Option<u64>) -> Result<CloudFile>;

    /// Folder reference under `parent`. No remote call.
    fn folder(&self, parent: &CloudFolder, name: &str) -> Result<CloudFolder>;

    /// Whether a node of the same kind exists at the node's path.
    ///
    /// # Errors
    /// Not-found is `Ok(false)`; everything else propagates.
    async fn exists(&self, node: &CloudNode) -> Result<bool>;

    /// Direct children of `folder`, across all result pages.
    async fn list(&self, folder: &CloudFolder) -> Result<Vec<CloudNode>>;

    /// Create `folder` and any missing ancestors.
    ///
    /// # Postconditions
    /// - Every ancestor exists; none that already existed was re-created
    ///
    /// # Errors
    /// - `AlreadyExists` if the leaf already exists
    async fn create(&self, folder: &CloudFolder) -> Result<CloudFolder>;

    /// Move or rename `source` to `target`.
    ///
    /// # Errors
    /// - `AlreadyExists` if `target` exists; nothing is moved
    /// - `NotFound` if `source` does not exist
    async fn move_node(&self, source: &CloudNode, target: &CloudNode) -> Result<CloudNode>;

    /// Upload `size` bytes from `data` to `file`.
    ///
    /// # Preconditions
    /// - `data.open()` yields a stream of at least `size` bytes
    ///
    /// # Postconditions
    /// - Progress sink saw `started`, any number of `progress`, `completed`
    ///
    /// # Errors
    /// - `AlreadyExists` if `!replace` and the file exists; no byte is sent
    /// - `ParentMissing` if the parent folder does not exist
    async fn write(
        &self,
        file: &CloudFile,
        data: &dyn DataSource,
        progress: &dyn ProgressSink,
        replace: bool,
        size: u64,
    ) -> Result<CloudFile>;

    /// Download `file` into `dest`.
    async fn read(
        &self,
        file: &CloudFile,
        dest: &mut DataSink,
        progress: &dyn ProgressSink,
    ) -> Result<()>;

    /// Remove `node`; folders lose all descendants.
    async fn delete(&self, node: &CloudNode) -> Result<()>;

    /// One authenticated round-trip. Returns the account label.
    async fn check_authentication(&self) -> Result<String>;

    /// Drop the native client; the next call re-authenticates.
    async fn logout(&self) -> Result<()>;
}

/// Ancestors of `folder` that do not exist yet, top-down.
///
/// Walks upward and stops at the first existing folder, so existing
/// ancestors are probed but never touched.
pub async fn missing_ancestors<A>(adapter: &A, folder: &CloudFolder) -> Result<Vec<CloudFolder>>
where
    A: CloudAdapter + ?Sized,
{
    let mut missing = Vec::new();
    let mut current = folder.parent();
    while let Some(parent) = current {
        if parent.is_root() || adapter.exists(&CloudNode::Folder(parent.clone())).await? {
            break;
        }
        missing.push(parent.clone());
        current = parent.parent();
    }
    missing.reverse();
    Ok(missing)
}

/// Fail with `AlreadyExists` if `node` is present.
pub async fn ensure_absent<A>(adapter: &A, node: &CloudNode) -> Result<()>
where
    A: CloudAdapter + ?Sized,
{
    if adapter.exists(node).await? {
        return Err(Error::AlreadyExists(node.path().to_string()));
    }
    Ok(())
}

/// Fail with `InvalidInput` if `node` belongs to another identity.
pub fn ensure_owned(cloud: &CloudId, node: &CloudNode) -> Result<()> {
    if node.cloud() != cloud {
        return Err(Error::InvalidInput(format!(
            "{} belongs to {}, not {}",
            node.path(),
            node.cloud(),
            cloud
        )));
    }
    Ok(())
}

/// Rebuild `node` under a new parent folder, keeping its kind and name.
pub fn reparent(node: &CloudNode, parent: &CloudFolder, name: &str) -> Result<CloudNode> {
    Ok(match node {
        CloudNode::File(file) => CloudNode::File(
            CloudFile::new(parent, name, file.size())?.with_modified(file.modified()),
        ),
        CloudNode::Folder(_) => CloudNode::Folder(CloudFolder::child(parent, name)?),
    })
}
