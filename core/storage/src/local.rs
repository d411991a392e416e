//! Local directory backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use cloudtree_common::types::segments;
use cloudtree_common::{CloudFile, CloudFolder, CloudId, CloudNode, Error, Result};

use crate::adapter::{ensure_absent, missing_ancestors, reparent, CloudAdapter};
use crate::config::StorageConfig;
use crate::content_cache::ContentCache;
use crate::io::{open_at, read_chunk, DataSink, DataSource};
use crate::progress::{Direction, ProgressReporter, ProgressSink};
use crate::transfer::{ChunkSink, ReadSink};

/// Configuration accepted by the `local` factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Directory exposed as the root of the tree.
    pub root: PathBuf,
}

/// Exposes a local directory as a cloud tree.
///
/// Writes go to a temporary sibling file renamed into place, so readers never
/// see a partial file.
pub struct LocalAdapter {
    cloud: CloudId,
    root: PathBuf,
    chunk_size: usize,
    content_cache: Option<Arc<ContentCache>>,
}

impl LocalAdapter {
    /// Create an adapter rooted at `root`.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(cloud: CloudId, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self {
            cloud,
            root,
            chunk_size: StorageConfig::default().chunk_size,
            content_cache: None,
        })
    }

    pub fn with_config(mut self, config: &StorageConfig) -> Self {
        self.chunk_size = config.chunk_size.max(1);
        self
    }

    /// Serve repeated reads of unchanged files from `cache`.
    pub fn with_content_cache(mut self, cache: Option<Arc<ContentCache>>) -> Self {
        self.content_cache = cache;
        self
    }

    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    fn to_fs_path(&self, path: &str) -> PathBuf {
        let mut fs_path = self.root.clone();
        for segment in segments(path) {
            fs_path.push(segment);
        }
        fs_path
    }

    fn node_from_metadata(
        parent: &CloudFolder,
        name: &str,
        meta: &std::fs::Metadata,
    ) -> Result<CloudNode> {
        if meta.is_dir() {
            return Ok(CloudNode::Folder(CloudFolder::child(parent, name)?));
        }
        let modified = meta.modified().ok().map(DateTime::<Utc>::from);
        Ok(CloudNode::File(
            CloudFile::new(parent, name, Some(meta.len()))?.with_modified(modified),
        ))
    }

    /// Revision of a file on disk: its modification time and length.
    fn fingerprint(&self, path: &str, meta: &std::fs::Metadata) -> Option<String> {
        let modified = meta.modified().ok().map(DateTime::<Utc>::from)?;
        Some(format!(
            "{}|{}|{}|{}",
            self.cloud,
            path,
            modified.timestamp_nanos_opt()?,
            meta.len()
        ))
    }

    async fn metadata(&self, path: &str) -> Result<Option<std::fs::Metadata>> {
        match fs::metadata(self.to_fs_path(path)).await {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn require_parent_dir(&self, parent: &CloudFolder, child: &str) -> Result<()> {
        match self.metadata(parent.path()).await? {
            Some(meta) if meta.is_dir() => Ok(()),
            _ => Err(Error::ParentMissing(child.to_string())),
        }
    }
}

#[async_trait]
impl CloudAdapter for LocalAdapter {
    fn cloud(&self) -> &CloudId {
        &self.cloud
    }

    fn requires_network(&self) -> bool {
        false
    }

    fn file(&self, parent: &CloudFolder, name: &str, size: Option<u64>) -> Result<CloudFile> {
        CloudFile::new(parent, name, size)
    }

    fn folder(&self, parent: &CloudFolder, name: &str) -> Result<CloudFolder> {
        CloudFolder::child(parent, name)
    }

    async fn exists(&self, node: &CloudNode) -> Result<bool> {
        Ok(match self.metadata(node.path()).await? {
            Some(meta) => meta.is_dir() == node.is_folder(),
            None => false,
        })
    }

    async fn list(&self, folder: &CloudFolder) -> Result<Vec<CloudNode>> {
        let fs_path = self.to_fs_path(folder.path());
        let mut entries = match fs::read_dir(&fs_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(folder.path().to_string()))
            }
            Err(e) => return Err(Error::Io(e)),
        };

        let mut nodes = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                debug!("Skipping non UTF-8 entry in {}", fs_path.display());
                continue;
            };
            if name.ends_with(".tmp") && name.starts_with('.') {
                continue;
            }
            let meta = entry.metadata().await?;
            nodes.push(Self::node_from_metadata(folder, &name, &meta)?);
        }
        nodes.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(nodes)
    }

    async fn create(&self, folder: &CloudFolder) -> Result<CloudFolder> {
        if folder.is_root() {
            return Err(Error::AlreadyExists(String::new()));
        }
        ensure_absent(self, &CloudNode::Folder(folder.clone())).await?;
        if self.metadata(folder.path()).await?.is_some() {
            // A file occupies the name.
            return Err(Error::AlreadyExists(folder.path().to_string()));
        }

        for ancestor in missing_ancestors(self, folder).await? {
            debug!("Creating missing ancestor {}", ancestor.path());
            fs::create_dir(self.to_fs_path(ancestor.path())).await?;
        }
        fs::create_dir(self.to_fs_path(folder.path())).await?;
        Ok(folder.clone())
    }

    async fn move_node(&self, source: &CloudNode, target: &CloudNode) -> Result<CloudNode> {
        ensure_absent(self, target).await?;
        if self.metadata(target.path()).await?.is_some() {
            return Err(Error::AlreadyExists(target.path().to_string()));
        }
        if !self.exists(source).await? {
            return Err(Error::NotFound(source.path().to_string()));
        }
        let target_parent = target
            .parent()
            .ok_or_else(|| Error::InvalidInput("cannot move onto the root".to_string()))?;
        self.require_parent_dir(target_parent, target.path()).await?;

        fs::rename(self.to_fs_path(source.path()), self.to_fs_path(target.path())).await?;
        reparent(source, target_parent, target.name())
    }

    async fn write(
        &self,
        file: &CloudFile,
        data: &dyn DataSource,
        progress: &dyn ProgressSink,
        replace: bool,
        size: u64,
    ) -> Result<CloudFile> {
        let node = CloudNode::File(file.clone());
        if !replace {
            ensure_absent(self, &node).await?;
        }
        match self.metadata(file.path()).await? {
            Some(meta) if meta.is_dir() => {
                return Err(Error::AlreadyExists(file.path().to_string()))
            }
            Some(_) if !replace => return Err(Error::AlreadyExists(file.path().to_string())),
            _ => {}
        }
        self.require_parent_dir(file.parent(), file.path()).await?;

        let reporter = ProgressReporter::new(progress, file, Direction::Upload, Some(size));
        reporter.started();

        let target = self.to_fs_path(file.path());
        let tmp = target.with_file_name(format!(".{}.{}.tmp", file.name(), Uuid::new_v4().simple()));
        let result = async {
            let mut reader = open_at(data, 0, file.path()).await?;
            let mut out = fs::File::create(&tmp).await?;
            let mut written = 0u64;
            while written < size {
                let len = (size - written).min(self.chunk_size as u64) as usize;
                let chunk = read_chunk(&mut reader, len, file.path()).await?;
                out.write_all(&chunk).await?;
                written += len as u64;
                reporter.progress(written);
            }
            out.sync_all().await?;
            drop(out);
            fs::rename(&tmp, &target).await?;
            Ok::<_, Error>(())
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp).await;
            return Err(e);
        }

        reporter.completed(size);
        let modified = self
            .metadata(file.path())
            .await?
            .and_then(|meta| meta.modified().ok())
            .map(DateTime::<Utc>::from);
        Ok(file.clone().with_size(Some(size)).with_modified(modified))
    }

    async fn read(
        &self,
        file: &CloudFile,
        dest: &mut DataSink,
        progress: &dyn ProgressSink,
    ) -> Result<()> {
        let meta = match self.metadata(file.path()).await? {
            Some(meta) if meta.is_file() => meta,
            _ => return Err(Error::NotFound(file.path().to_string())),
        };

        let reporter = ProgressReporter::new(progress, file, Direction::Download, Some(meta.len()));
        let fingerprint = match &self.content_cache {
            Some(_) => self.fingerprint(file.path(), &meta),
            None => None,
        };
        let cached = match (&self.content_cache, &fingerprint) {
            (Some(cache), Some(fp)) => Some((cache.as_ref(), fp.as_str())),
            _ => None,
        };

        let mut sink = ReadSink::begin(cached, dest, reporter).await?;
        if sink.served_from_cache() {
            return Ok(());
        }

        let mut input = fs::File::open(self.to_fs_path(file.path())).await?;
        let mut buf = vec![0u8; self.chunk_size.min(meta.len().max(1) as usize)];
        loop {
            let n = tokio::io::AsyncReadExt::read(&mut input, &mut buf).await?;
            if n == 0 {
                break;
            }
            sink.accept(&buf[..n]).await?;
        }
        sink.finish().await?;
        Ok(())
    }

    async fn delete(&self, node: &CloudNode) -> Result<()> {
        let fs_path = self.to_fs_path(node.path());
        let meta = match self.metadata(node.path()).await? {
            Some(meta) if meta.is_dir() == node.is_folder() => meta,
            _ => return Err(Error::NotFound(node.path().to_string())),
        };
        if meta.is_dir() {
            if node.parent().is_none() {
                return Err(Error::InvalidInput("cannot delete the root".to_string()));
            }
            fs::remove_dir_all(&fs_path).await?;
        } else {
            fs::remove_file(&fs_path).await?;
        }
        Ok(())
    }

    async fn check_authentication(&self) -> Result<String> {
        match fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(self.root.display().to_string()),
            Ok(_) => Err(Error::InvalidInput(format!(
                "Not a directory: {}",
                self.root.display()
            ))),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn logout(&self) -> Result<()> {
        Ok(())
    }
}

/// Factory for the `local` backend kind.
pub fn create_local_adapter(
    cloud: CloudId,
    config: serde_json::Value,
    storage: &StorageConfig,
    content_cache: Option<Arc<ContentCache>>,
) -> Result<LocalAdapter> {
    let config: LocalConfig = serde_json::from_value(config)
        .map_err(|e| Error::InvalidInput(format!("Invalid local config: {}", e)))?;
    Ok(LocalAdapter::new(cloud, config.root)?
        .with_config(storage)
        .with_content_cache(content_cache))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::BytesSource;
    use crate::progress::{NoProgress, Phase, ProgressLog};
    use tempfile::TempDir;

    fn adapter(temp: &TempDir) -> LocalAdapter {
        let cloud = CloudId::new("local", "test").unwrap();
        LocalAdapter::new(cloud, temp.path())
            .unwrap()
            .with_config(&StorageConfig::default().with_chunk_size(4))
    }

    #[tokio::test]
    async fn test_write_read() {
        let temp = TempDir::new().unwrap();
        let local = adapter(&temp);
        let file = local.file(&local.root(), "test.txt", None).unwrap();

        let log = ProgressLog::new();
        let written = local
            .write(&file, &BytesSource::new(&b"Hello, Local!"[..]), &log, false, 13)
            .await
            .unwrap();
        assert_eq!(written.size(), Some(13));
        assert_eq!(
            log.events().iter().map(|e| e.bytes_transferred).collect::<Vec<_>>(),
            vec![0, 4, 8, 12, 13, 13]
        );

        let mut out = Vec::new();
        local.read(&file, &mut out, &NoProgress).await.unwrap();
        assert_eq!(out, b"Hello, Local!");
    }

    #[tokio::test]
    async fn test_no_clobber() {
        let temp = TempDir::new().unwrap();
        let local = adapter(&temp);
        let file = local.file(&local.root(), "a.txt", None).unwrap();

        local
            .write(&file, &BytesSource::new(&b"one"[..]), &NoProgress, false, 3)
            .await
            .unwrap();
        let log = ProgressLog::new();
        let err = local
            .write(&file, &BytesSource::new(&b"two"[..]), &log, false, 3)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::AlreadyExists(_)));
        assert!(log.events().is_empty());
        assert_eq!(std::fs::read(temp.path().join("a.txt")).unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_write_without_parent() {
        let temp = TempDir::new().unwrap();
        let local = adapter(&temp);
        let file = local.resolve("/missing").unwrap();
        let file = local.file(&file, "a.txt", None).unwrap();

        let err = local
            .write(&file, &BytesSource::new(&b"x"[..]), &NoProgress, false, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ParentMissing(_)));
    }

    #[tokio::test]
    async fn test_create_with_ancestors() {
        let temp = TempDir::new().unwrap();
        let local = adapter(&temp);
        let deep = local.resolve("/a/b/c").unwrap();

        local.create(&deep).await.unwrap();
        assert!(temp.path().join("a/b/c").is_dir());

        let err = local.create(&deep).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        let sibling = local.resolve("/a/b/d").unwrap();
        local.create(&sibling).await.unwrap();
        assert!(temp.path().join("a/b/d").is_dir());
    }

    #[tokio::test]
    async fn test_list_and_exists_by_kind() {
        let temp = TempDir::new().unwrap();
        let local = adapter(&temp);
        let dir = local.resolve("/dir").unwrap();
        local.create(&dir).await.unwrap();
        for name in ["file2.txt", "file1.txt"] {
            let file = local.file(&dir, name, None).unwrap();
            local
                .write(&file, &BytesSource::new(&b"1"[..]), &NoProgress, false, 1)
                .await
                .unwrap();
        }

        let children = local.list(&dir).await.unwrap();
        let names: Vec<&str> = children.iter().map(|n| n.name()).collect();
        assert_eq!(names, vec!["file1.txt", "file2.txt"]);
        assert_eq!(children[0].as_file().unwrap().size(), Some(1));

        let as_folder = CloudNode::Folder(local.folder(&dir, "file1.txt").unwrap());
        assert!(!local.exists(&as_folder).await.unwrap());
    }

    #[tokio::test]
    async fn test_move_and_delete() {
        let temp = TempDir::new().unwrap();
        let local = adapter(&temp);
        let root = local.root();
        let a = local.file(&root, "a.txt", None).unwrap();
        let b = local.file(&root, "b.txt", None).unwrap();
        local
            .write(&a, &BytesSource::new(&b"x"[..]), &NoProgress, false, 1)
            .await
            .unwrap();
        local
            .write(&b, &BytesSource::new(&b"y"[..]), &NoProgress, false, 1)
            .await
            .unwrap();

        let err = local
            .move_node(&a.clone().into(), &b.clone().into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        let c = local.file(&root, "c.txt", None).unwrap();
        let moved = local.move_node(&a.clone().into(), &c.clone().into()).await.unwrap();
        assert_eq!(moved.path(), "/c.txt");
        assert!(!local.exists(&a.into()).await.unwrap());

        local.delete(&c.clone().into()).await.unwrap();
        assert!(matches!(
            local.delete(&c.into()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_read_progress_lifecycle() {
        let temp = TempDir::new().unwrap();
        let local = adapter(&temp);
        std::fs::write(temp.path().join("r.bin"), b"0123456789").unwrap();
        let file = local.file(&local.root(), "r.bin", None).unwrap();

        let log = ProgressLog::new();
        let mut out = Vec::new();
        local.read(&file, &mut out, &log).await.unwrap();

        let phases = log.phases();
        assert_eq!(phases.first(), Some(&Phase::Started));
        assert_eq!(phases.last(), Some(&Phase::Completed));
        assert_eq!(log.events().last().unwrap().bytes_transferred, 10);
    }

    #[tokio::test]
    async fn test_read_served_from_content_cache_until_file_changes() {
        let temp = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        let cache = Arc::new(ContentCache::open(cache_dir.path(), 1 << 20).await.unwrap());
        let local = adapter(&temp).with_content_cache(Some(cache.clone()));
        let disk = temp.path().join("c.txt");
        std::fs::write(&disk, b"first").unwrap();
        let file = local.file(&local.root(), "c.txt", None).unwrap();

        let mut out = Vec::new();
        local.read(&file, &mut out, &NoProgress).await.unwrap();
        assert_eq!(out, b"first");
        let meta = std::fs::metadata(&disk).unwrap();
        assert!(cache.contains(&local.fingerprint(file.path(), &meta).unwrap()));

        // Same length and modification time: the cached copy is served.
        let modified = meta.modified().unwrap();
        std::fs::write(&disk, b"other").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&disk)
            .unwrap()
            .set_modified(modified)
            .unwrap();
        let mut out = Vec::new();
        local.read(&file, &mut out, &NoProgress).await.unwrap();
        assert_eq!(out, b"first");

        std::fs::write(&disk, b"changed").unwrap();
        let mut out = Vec::new();
        local.read(&file, &mut out, &NoProgress).await.unwrap();
        assert_eq!(out, b"changed");
    }

    #[test]
    fn test_factory_rejects_bad_config() {
        let cloud = CloudId::new("local", "x").unwrap();
        let result = create_local_adapter(cloud, serde_json::json!({}), &StorageConfig::default(), None);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
