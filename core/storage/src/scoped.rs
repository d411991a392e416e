//! Virtual backend exposing a sub-folder of another identity as a root.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use cloudtree_common::types::segments;
use cloudtree_common::{CloudFile, CloudFolder, CloudId, CloudNode, Error, Result};

use crate::adapter::{ensure_owned, CloudAdapter};
use crate::io::{DataSink, DataSource};
use crate::progress::{ProgressSink, TransferState};

/// Factory configuration for a scoped backend.
#[derive(Debug, Clone, Deserialize)]
pub struct ScopedConfig {
    /// Folder of the underlying identity acting as this backend's root.
    pub root: String,
}

/// Layered adapter rooted at a folder of `base`.
///
/// Nodes are translated by path on the way in and out, so callers only ever
/// see nodes carrying this adapter's identity.
pub struct ScopedAdapter {
    cloud: CloudId,
    base: Arc<dyn CloudAdapter>,
    base_root: CloudFolder,
}

impl ScopedAdapter {
    pub fn new(cloud: CloudId, base: Arc<dyn CloudAdapter>, root: &str) -> Result<Self> {
        let base_root = base.resolve(root)?;
        Ok(Self {
            cloud,
            base,
            base_root,
        })
    }

    pub fn base(&self) -> &Arc<dyn CloudAdapter> {
        &self.base
    }

    fn to_base_folder(&self, folder: &CloudFolder) -> Result<CloudFolder> {
        let mut current = self.base_root.clone();
        for segment in segments(folder.path()) {
            current = self.base.folder(&current, segment)?;
        }
        Ok(current)
    }

    fn to_base_file(&self, file: &CloudFile) -> Result<CloudFile> {
        let parent = self.to_base_folder(file.parent())?;
        Ok(self
            .base
            .file(&parent, file.name(), file.size())?
            .with_modified(file.modified()))
    }

    fn to_base(&self, node: &CloudNode) -> Result<CloudNode> {
        ensure_owned(&self.cloud, node)?;
        Ok(match node {
            CloudNode::File(file) => CloudNode::File(self.to_base_file(file)?),
            CloudNode::Folder(folder) => CloudNode::Folder(self.to_base_folder(folder)?),
        })
    }

    /// Path of a base node relative to the scoped root.
    fn relative<'a>(&self, base_path: &'a str) -> Result<&'a str> {
        let root = self.base_root.path();
        if base_path == root {
            return Ok("");
        }
        match base_path.strip_prefix(root) {
            Some(rest) if rest.starts_with('/') => Ok(rest),
            _ => Err(Error::fatal_msg(
                format!("scope {}", self.cloud),
                format!("{} lies outside {}", base_path, root),
            )),
        }
    }

    fn from_base_folder(&self, folder: &CloudFolder) -> Result<CloudFolder> {
        self.resolve(self.relative(folder.path())?)
    }

    fn from_base_file(&self, file: &CloudFile) -> Result<CloudFile> {
        let parent = self.from_base_folder(file.parent())?;
        Ok(CloudFile::new(&parent, file.name(), file.size())?.with_modified(file.modified()))
    }

    fn from_base(&self, node: &CloudNode) -> Result<CloudNode> {
        Ok(match node {
            CloudNode::File(file) => CloudNode::File(self.from_base_file(file)?),
            CloudNode::Folder(folder) => CloudNode::Folder(self.from_base_folder(folder)?),
        })
    }
}

/// Re-labels base progress events with the scoped file.
struct ScopedProgress<'a> {
    inner: &'a dyn ProgressSink,
    file: &'a CloudFile,
}

impl ProgressSink for ScopedProgress<'_> {
    fn on_progress(&self, state: &TransferState) {
        let mut state = state.clone();
        state.file = self.file.clone();
        self.inner.on_progress(&state);
    }
}

#[async_trait]
impl CloudAdapter for ScopedAdapter {
    fn cloud(&self) -> &CloudId {
        &self.cloud
    }

    fn requires_network(&self) -> bool {
        self.base.requires_network()
    }

    fn file(&self, parent: &CloudFolder, name: &str, size: Option<u64>) -> Result<CloudFile> {
        CloudFile::new(parent, name, size)
    }

    fn folder(&self, parent: &CloudFolder, name: &str) -> Result<CloudFolder> {
        CloudFolder::child(parent, name)
    }

    async fn exists(&self, node: &CloudNode) -> Result<bool> {
        self.base.exists(&self.to_base(node)?).await
    }

    async fn list(&self, folder: &CloudFolder) -> Result<Vec<CloudNode>> {
        let base_folder = self.to_base_folder(folder)?;
        self.base
            .list(&base_folder)
            .await?
            .iter()
            .map(|node| self.from_base(node))
            .collect()
    }

    async fn create(&self, folder: &CloudFolder) -> Result<CloudFolder> {
        if folder.is_root() {
            return Err(Error::AlreadyExists(String::new()));
        }
        let created = self.base.create(&self.to_base_folder(folder)?).await?;
        self.from_base_folder(&created)
    }

    async fn move_node(&self, source: &CloudNode, target: &CloudNode) -> Result<CloudNode> {
        if target.parent().is_none() {
            return Err(Error::InvalidInput("cannot move onto the root".to_string()));
        }
        let moved = self
            .base
            .move_node(&self.to_base(source)?, &self.to_base(target)?)
            .await?;
        self.from_base(&moved)
    }

    async fn write(
        &self,
        file: &CloudFile,
        data: &dyn DataSource,
        progress: &dyn ProgressSink,
        replace: bool,
        size: u64,
    ) -> Result<CloudFile> {
        let progress = ScopedProgress { inner: progress, file };
        let written = self
            .base
            .write(&self.to_base_file(file)?, data, &progress, replace, size)
            .await?;
        self.from_base_file(&written)
    }

    async fn read(
        &self,
        file: &CloudFile,
        dest: &mut DataSink,
        progress: &dyn ProgressSink,
    ) -> Result<()> {
        let progress = ScopedProgress { inner: progress, file };
        self.base.read(&self.to_base_file(file)?, dest, &progress).await
    }

    async fn delete(&self, node: &CloudNode) -> Result<()> {
        if node.parent().is_none() {
            return Err(Error::InvalidInput("cannot delete the root".to_string()));
        }
        self.base.delete(&self.to_base(node)?).await
    }

    async fn check_authentication(&self) -> Result<String> {
        self.base.check_authentication().await
    }

    /// Only drops the view; the base keeps its own client.
    async fn logout(&self) -> Result<()> {
        Ok(())
    }
}
