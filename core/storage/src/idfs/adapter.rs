//! Adapter for ID-addressed backends.
//!
//! Logical paths are resolved to opaque IDs by walking names from the root,
//! one level at a time, with every step memoized in a [`ResolutionCache`].

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use tracing::debug;

use cloudtree_common::{CloudFile, CloudFolder, CloudId, CloudNode, Error, Result};

use super::api::{IdApi, IdItem, RangeAck};
use super::errors::{normalize, transfer_failure};
use crate::adapter::{ensure_absent, missing_ancestors, reparent, CloudAdapter};
use crate::client::ClientSlot;
use crate::config::StorageConfig;
use crate::content_cache::ContentCache;
use crate::io::{read_all, DataSink, DataSource};
use crate::progress::{Direction, ProgressReporter, ProgressSink};
use crate::resolution::{ResolutionCache, ResolutionEntry};
use crate::transfer::download::pump_stream;
use crate::transfer::{
    ChunkedDownloader, ChunkedUploader, RangeSource, ReadSink, Sleeper, TransferFailure,
    UploadSession,
};

/// Serves one identity of an ID-addressed backend.
pub struct IdAdapter<C: IdApi> {
    cloud: CloudId,
    slot: ClientSlot<C>,
    config: StorageConfig,
    content_cache: Option<Arc<ContentCache>>,
    cache: ResolutionCache,
    root_id: RwLock<Option<String>>,
    uploader: ChunkedUploader,
    downloader: ChunkedDownloader,
}

impl<C: IdApi + 'static> IdAdapter<C> {
    pub fn new(
        cloud: CloudId,
        client_factory: impl Fn() -> Result<C> + Send + Sync + 'static,
        config: StorageConfig,
        content_cache: Option<Arc<ContentCache>>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            cloud,
            slot: ClientSlot::new(client_factory),
            cache: ResolutionCache::new(config.resolution_cache_capacity),
            root_id: RwLock::new(None),
            uploader: ChunkedUploader::new(&config, sleeper.clone()),
            downloader: ChunkedDownloader::new(&config, sleeper),
            config,
            content_cache,
        }
    }

    /// Resolution cache, exposed for inspection.
    pub fn resolution_cache(&self) -> &ResolutionCache {
        &self.cache
    }

    fn client(&self) -> Result<Arc<C>> {
        self.slot.get()
    }

    async fn root_id(&self, client: &C) -> Result<String> {
        if let Some(id) = self.root_id.read().ok().and_then(|r| r.clone()) {
            return Ok(id);
        }
        let id = client
            .root_id()
            .await
            .map_err(|e| normalize(e, "get root", ""))?;
        if let Ok(mut slot) = self.root_id.write() {
            *slot = Some(id.clone());
        }
        Ok(id)
    }

    /// ID of `folder`, or `None` if some level of its path does not exist.
    async fn folder_id(&self, client: &C, folder: &CloudFolder) -> Result<Option<String>> {
        if folder.is_root() {
            return self.root_id(client).await.map(Some);
        }
        if let Some(entry) = self.cache.get_expecting(folder.path(), true) {
            return Ok(Some(entry.native_id));
        }

        let mut chain = folder.ancestors();
        chain.push(folder.clone());

        let mut current = self.root_id(client).await?;
        for level in chain {
            if let Some(entry) = self.cache.get_expecting(level.path(), true) {
                current = entry.native_id;
                continue;
            }
            let found = client
                .find_child(&current, level.name())
                .await
                .map_err(|e| normalize(e, "find", level.path()))?;
            match found {
                Some(item) if item.is_folder => {
                    self.cache
                        .put(level.path(), ResolutionEntry::folder(&item.id, Some(current)));
                    current = item.id;
                }
                _ => {
                    self.cache.remove(level.path());
                    return Ok(None);
                }
            }
        }
        Ok(Some(current))
    }

    /// Resolve `node` to its cache entry.
    ///
    /// With `fresh` the leaf is always looked up remotely and the cache is
    /// updated or evicted with the answer; otherwise a cached entry of the
    /// right kind is trusted.
    async fn locate(&self, client: &C, node: &CloudNode, fresh: bool) -> Result<Option<ResolutionEntry>> {
        let Some(parent) = node.parent() else {
            let id = self.root_id(client).await?;
            return Ok(node.is_folder().then(|| ResolutionEntry::folder(id, None)));
        };
        if !fresh {
            if let Some(entry) = self.cache.get_expecting(node.path(), node.is_folder()) {
                return Ok(Some(entry));
            }
        }

        let Some(parent_id) = self.folder_id(client, parent).await? else {
            self.cache.remove(node.path());
            return Ok(None);
        };
        let found = client
            .find_child(&parent_id, node.name())
            .await
            .map_err(|e| normalize(e, "find", node.path()))?;
        match found {
            Some(item) if item.is_folder == node.is_folder() => {
                let entry = Self::entry_for(&item, &parent_id);
                self.cache.put(node.path(), entry.clone());
                Ok(Some(entry))
            }
            _ => {
                self.cache.remove(node.path());
                Ok(None)
            }
        }
    }

    fn entry_for(item: &IdItem, parent_id: &str) -> ResolutionEntry {
        if item.is_folder {
            ResolutionEntry::folder(&item.id, Some(parent_id.to_string()))
        } else {
            ResolutionEntry::file(&item.id, Some(parent_id.to_string()), item.etag.clone())
        }
    }

    fn node_for(parent: &CloudFolder, item: &IdItem) -> Result<CloudNode> {
        if item.is_folder {
            return Ok(CloudNode::Folder(CloudFolder::child(parent, &item.name)?));
        }
        Ok(CloudNode::File(
            CloudFile::new(parent, &item.name, item.size)?.with_modified(item.modified_time),
        ))
    }

    /// Forget a node whose cached ID turned out stale.
    fn forget_on_not_found(&self, error: Error, path: &str) -> Error {
        if error.is_not_found() {
            self.cache.remove(path);
        }
        error
    }

    async fn create_one(&self, client: &C, folder: &CloudFolder) -> Result<()> {
        let parent = folder
            .parent()
            .ok_or_else(|| Error::AlreadyExists(String::new()))?;
        let parent_id = self
            .folder_id(client, parent)
            .await?
            .ok_or_else(|| Error::ParentMissing(folder.path().to_string()))?;
        let item = client
            .create_folder(&parent_id, folder.name())
            .await
            .map_err(|e| normalize(e, "create folder", folder.path()))?;
        self.cache
            .put(folder.path(), ResolutionEntry::folder(item.id, Some(parent_id)));
        Ok(())
    }
}

struct IdUploadSession<'a, C> {
    client: &'a C,
    url: String,
    total: u64,
    path: &'a str,
}

impl<C: IdApi> IdUploadSession<'_, C> {
    /// Send `chunk` at `offset`, re-sending the tail the server did not keep.
    ///
    /// A partial acknowledgement is normal for resumable uploads and is not
    /// counted as a failure; an acknowledgement behind `offset` is.
    async fn send(&self, offset: u64, chunk: Bytes) -> std::result::Result<RangeAck, TransferFailure> {
        let expected = offset + chunk.len() as u64;
        let mut confirmed = offset;
        loop {
            let tail = chunk.slice((confirmed - offset) as usize..);
            let ack = self
                .client
                .upload_range(&self.url, confirmed, tail, self.total)
                .await
                .map_err(|e| transfer_failure(e, "upload", self.path))?;
            match ack {
                RangeAck::Incomplete { received } if received == expected => return Ok(ack),
                RangeAck::Incomplete { received } if received > confirmed && received < expected => {
                    debug!("Server kept {} of {} bytes for {}", received, expected, self.path);
                    confirmed = received;
                }
                RangeAck::Incomplete { received } => {
                    return Err(TransferFailure::IncorrectOffset { expected: received })
                }
                complete => return Ok(complete),
            }
        }
    }
}

#[async_trait]
impl<C: IdApi> UploadSession for IdUploadSession<'_, C> {
    type Output = IdItem;

    async fn start(&mut self, first: Bytes) -> std::result::Result<(), TransferFailure> {
        self.send(0, first).await.map(|_| ())
    }

    async fn append(&mut self, offset: u64, chunk: Bytes) -> std::result::Result<(), TransferFailure> {
        self.send(offset, chunk).await.map(|_| ())
    }

    async fn finish(&mut self, offset: u64, last: Bytes) -> std::result::Result<IdItem, TransferFailure> {
        match self.send(offset, last).await? {
            RangeAck::Complete(item) => Ok(item),
            RangeAck::Incomplete { received } => Err(TransferFailure::IncorrectOffset { expected: received }),
        }
    }

    async fn committed_offset(&mut self) -> Option<u64> {
        match self.client.query_upload(&self.url, self.total).await {
            Ok(RangeAck::Incomplete { received }) => Some(received),
            Ok(RangeAck::Complete(_)) => Some(self.total),
            Err(e) => {
                debug!("Upload status query for {} failed: {}", self.path, e);
                None
            }
        }
    }
}

struct IdRangeSource<'a, C> {
    client: &'a C,
    id: &'a str,
    path: &'a str,
}

#[async_trait]
impl<C: IdApi> RangeSource for IdRangeSource<'_, C> {
    async fn fetch(&self, offset: u64, len: u64) -> std::result::Result<Bytes, TransferFailure> {
        self.client
            .download_range(self.id, offset, len)
            .await
            .map_err(|e| transfer_failure(e, "download", self.path))
    }
}

#[async_trait]
impl<C: IdApi + 'static> CloudAdapter for IdAdapter<C> {
    fn cloud(&self) -> &CloudId {
        &self.cloud
    }

    fn file(&self, parent: &CloudFolder, name: &str, size: Option<u64>) -> Result<CloudFile> {
        let file = CloudFile::new(parent, name, size)?;
        // Only drops a cached entry of the other kind.
        let _ = self.cache.get_expecting(file.path(), false);
        Ok(file)
    }

    fn folder(&self, parent: &CloudFolder, name: &str) -> Result<CloudFolder> {
        let folder = CloudFolder::child(parent, name)?;
        // Only drops a cached entry of the other kind.
        let _ = self.cache.get_expecting(folder.path(), true);
        Ok(folder)
    }

    async fn exists(&self, node: &CloudNode) -> Result<bool> {
        let client = self.client()?;
        Ok(self.locate(&client, node, true).await?.is_some())
    }

    async fn list(&self, folder: &CloudFolder) -> Result<Vec<CloudNode>> {
        let client = self.client()?;
        let folder_id = self
            .folder_id(&client, folder)
            .await?
            .ok_or_else(|| Error::NotFound(folder.path().to_string()))?;

        self.cache.remove_children_of(folder.path());
        let mut nodes = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = client
                .list_children(&folder_id, token.as_deref(), self.config.page_size)
                .await
                .map_err(|e| self.forget_on_not_found(normalize(e, "list", folder.path()), folder.path()))?;
            for item in &page.items {
                let node = Self::node_for(folder, item)?;
                self.cache.put(node.path(), Self::entry_for(item, &folder_id));
                nodes.push(node);
            }
            match page.next_page_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(nodes)
    }

    async fn create(&self, folder: &CloudFolder) -> Result<CloudFolder> {
        if folder.is_root() {
            return Err(Error::AlreadyExists(String::new()));
        }
        ensure_absent(self, &CloudNode::Folder(folder.clone())).await?;

        let client = self.client()?;
        for ancestor in missing_ancestors(self, folder).await? {
            debug!("Creating missing ancestor {}", ancestor);
            self.create_one(&client, &ancestor).await?;
        }
        self.create_one(&client, folder).await?;
        Ok(folder.clone())
    }

    async fn move_node(&self, source: &CloudNode, target: &CloudNode) -> Result<CloudNode> {
        ensure_absent(self, target).await?;
        let target_parent = target
            .parent()
            .ok_or_else(|| Error::InvalidInput("cannot move onto the root".to_string()))?;

        let client = self.client()?;
        let entry = self
            .locate(&client, source, false)
            .await?
            .ok_or_else(|| Error::NotFound(source.path().to_string()))?;
        let from_parent = match entry.container_id.clone() {
            Some(id) => id,
            None => return Err(Error::InvalidInput("cannot move the root".to_string())),
        };
        let to_parent = self
            .folder_id(&client, target_parent)
            .await?
            .ok_or_else(|| Error::ParentMissing(target.path().to_string()))?;

        let item = client
            .move_item(&entry.native_id, &from_parent, &to_parent, target.name())
            .await
            .map_err(|e| self.forget_on_not_found(normalize(e, "move", source.path()), source.path()))?;

        self.cache.remove(source.path());
        self.cache.put(target.path(), Self::entry_for(&item, &to_parent));
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
        let client = self.client()?;
        let parent_id = self
            .folder_id(&client, file.parent())
            .await?
            .ok_or_else(|| Error::ParentMissing(file.path().to_string()))?;
        let existing = if replace {
            self.locate(&client, &node, true).await?.map(|e| e.native_id)
        } else {
            None
        };
        let modified: Option<DateTime<Utc>> = data.modified();

        let reporter = ProgressReporter::new(progress, file, Direction::Upload, Some(size));
        reporter.started();

        let item = if size <= self.config.chunk_threshold {
            let content = read_all(data, size, file.path()).await?;
            let item = client
                .upload_simple(&parent_id, file.name(), existing.as_deref(), content, modified)
                .await
                .map_err(|e| normalize(e, "upload", file.path()))?;
            reporter.progress(size);
            item
        } else {
            let url = client
                .start_resumable(&parent_id, file.name(), existing.as_deref(), size, modified)
                .await
                .map_err(|e| normalize(e, "start upload", file.path()))?;
            debug!("Resumable upload of {} ({} bytes) started", file, size);
            let mut session = IdUploadSession {
                client: client.as_ref(),
                url,
                total: size,
                path: file.path(),
            };
            self.uploader
                .upload(&mut session, data, size, &reporter, file.path())
                .await?
        };

        reporter.completed(size);
        self.cache.put(file.path(), Self::entry_for(&item, &parent_id));
        Ok(file
            .clone()
            .with_size(item.size.or(Some(size)))
            .with_modified(item.modified_time))
    }

    async fn read(
        &self,
        file: &CloudFile,
        dest: &mut DataSink,
        progress: &dyn ProgressSink,
    ) -> Result<()> {
        let client = self.client()?;
        let node = CloudNode::File(file.clone());
        let entry = self
            .locate(&client, &node, false)
            .await?
            .ok_or_else(|| Error::NotFound(file.path().to_string()))?;

        // Fresh metadata: the cached etag may predate a remote update.
        let item = client
            .get_item(&entry.native_id)
            .await
            .map_err(|e| self.forget_on_not_found(normalize(e, "get", file.path()), file.path()))?;
        let size = item.size.unwrap_or(0);

        let fingerprint = item.etag.as_ref().map(|etag| format!("{}@{}", item.id, etag));
        let cached = match (&self.content_cache, &fingerprint) {
            (Some(cache), Some(fp)) => Some((cache.as_ref(), fp.as_str())),
            _ => None,
        };

        let reporter = ProgressReporter::new(progress, file, Direction::Download, Some(size));
        let mut sink = ReadSink::begin(cached, dest, reporter).await?;
        if sink.served_from_cache() {
            return Ok(());
        }

        if size > self.config.chunk_threshold {
            let source = IdRangeSource {
                client: client.as_ref(),
                id: &item.id,
                path: file.path(),
            };
            self.downloader
                .download(&source, size, &mut sink, file.path())
                .await?;
        } else {
            let stream = client
                .download(&item.id)
                .await
                .map_err(|e| normalize(e, "download", file.path()))?;
            let path = file.path().to_string();
            pump_stream(stream, &mut sink, move |e| normalize(e, "download", &path)).await?;
        }
        sink.finish().await?;
        Ok(())
    }

    async fn delete(&self, node: &CloudNode) -> Result<()> {
        if node.parent().is_none() {
            return Err(Error::InvalidInput("cannot delete the root".to_string()));
        }
        let client = self.client()?;
        let entry = self
            .locate(&client, node, false)
            .await?
            .ok_or_else(|| Error::NotFound(node.path().to_string()))?;
        let result = client
            .delete_item(&entry.native_id)
            .await
            .map_err(|e| normalize(e, "delete", node.path()));
        self.cache.remove(node.path());
        result
    }

    async fn check_authentication(&self) -> Result<String> {
        self.client()?
            .about()
            .await
            .map_err(|e| normalize(e, "about", ""))
    }

    async fn logout(&self) -> Result<()> {
        self.slot.clear();
        if let Ok(mut root) = self.root_id.write() {
            *root = None;
        }
        self.cache.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idfs::api::IdApiError;
    use crate::idfs::memory::{MemoryIdClient, MemoryIdServer};
    use crate::io::BytesSource;
    use crate::progress::{NoProgress, ProgressLog};
    use crate::transfer::RecordingSleeper;
    use std::time::Duration;
    use tempfile::TempDir;

    fn adapter(server: &Arc<MemoryIdServer>, cache: Option<Arc<ContentCache>>) -> IdAdapter<MemoryIdClient> {
        let cloud = CloudId::new("id", "bob").unwrap();
        let config = StorageConfig::default()
            .with_chunk_threshold(8)
            .with_chunk_size(4)
            .with_backoff_step(Duration::from_millis(1));
        let server = server.clone();
        IdAdapter::new(
            cloud,
            move || Ok(server.client("token")),
            config,
            cache,
            Arc::new(RecordingSleeper::new()),
        )
    }

    async fn put(adapter: &IdAdapter<MemoryIdClient>, path: &str, content: &'static [u8]) -> CloudFile {
        let (dir, name) = path.rsplit_once('/').unwrap();
        let parent = adapter.resolve(dir).unwrap();
        let file = adapter.file(&parent, name, None).unwrap();
        adapter
            .write(&file, &BytesSource::new(content), &NoProgress, false, content.len() as u64)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_folder_walk_is_cached() {
        let server = MemoryIdServer::new("bob", "token");
        let adapter = adapter(&server, None);
        let deep = adapter.resolve("/a/b/c").unwrap();
        adapter.create(&deep).await.unwrap();
        assert!(server.contains("/a/b/c"));

        server.faults().reset_counters();
        put(&adapter, "/a/b/c/f.txt", b"hi").await;
        // Parent chain comes from the cache: only the no-clobber probe hits find_child.
        assert_eq!(server.faults().calls("find_child"), 1);
    }

    #[tokio::test]
    async fn test_write_without_parent_is_parent_missing() {
        let server = MemoryIdServer::new("bob", "token");
        let adapter = adapter(&server, None);
        let parent = adapter.resolve("/missing").unwrap();
        let file = adapter.file(&parent, "f.txt", None).unwrap();

        let err = adapter
            .write(&file, &BytesSource::new(&b"x"[..]), &NoProgress, false, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ParentMissing(_)));
        assert_eq!(server.item_count(), 1);
    }

    #[tokio::test]
    async fn test_move_updates_cache() {
        let server = MemoryIdServer::new("bob", "token");
        let adapter = adapter(&server, None);
        let docs = adapter.resolve("/docs").unwrap();
        adapter.create(&docs).await.unwrap();
        let a = put(&adapter, "/docs/a.txt", b"aaa").await;
        assert!(adapter.exists(&a.clone().into()).await.unwrap());
        let id = adapter.resolution_cache().get("/docs/a.txt").unwrap().native_id;

        let b = adapter.file(&docs, "b.txt", None).unwrap();
        adapter.move_node(&a.clone().into(), &b.clone().into()).await.unwrap();

        assert!(adapter.resolution_cache().get("/docs/a.txt").is_none());
        let moved = adapter.resolution_cache().get("/docs/b.txt").unwrap();
        assert_eq!(moved.native_id, id);
        assert!(!moved.is_folder);
        assert!(!adapter.exists(&a.into()).await.unwrap());
        assert!(adapter.exists(&b.into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_reference_of_other_kind_drops_cached_entry() {
        let server = MemoryIdServer::new("bob", "token");
        let adapter = adapter(&server, None);
        let a = put(&adapter, "/a.txt", b"a").await;
        assert!(adapter.exists(&a.into()).await.unwrap());
        assert!(adapter.resolution_cache().get("/a.txt").is_some());

        adapter.folder(&adapter.root(), "a.txt").unwrap();
        assert!(adapter.resolution_cache().get("/a.txt").is_none());
    }

    #[tokio::test]
    async fn test_delete_evicts_subtree() {
        let server = MemoryIdServer::new("bob", "token");
        let adapter = adapter(&server, None);
        let docs = adapter.resolve("/docs/sub").unwrap();
        adapter.create(&docs).await.unwrap();
        put(&adapter, "/docs/sub/x.txt", b"x").await;

        let top = adapter.resolve("/docs").unwrap();
        adapter.delete(&top.clone().into()).await.unwrap();

        let cache = adapter.resolution_cache();
        assert!(cache.get("/docs").is_none());
        assert!(cache.get("/docs/sub").is_none());
        assert!(cache.get("/docs/sub/x.txt").is_none());
        assert!(!adapter.exists(&top.into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_replaces_cached_children() {
        let server = MemoryIdServer::new("bob", "token");
        let adapter = adapter(&server, None);
        put(&adapter, "/old.txt", b"o").await;
        assert!(adapter.resolution_cache().get("/old.txt").is_some());

        server.rename_behind("/old.txt", "new.txt");
        let names: Vec<String> = adapter
            .list(&adapter.root())
            .await
            .unwrap()
            .iter()
            .map(|n| n.name().to_string())
            .collect();

        assert_eq!(names, vec!["new.txt".to_string()]);
        assert!(adapter.resolution_cache().get("/old.txt").is_none());
        assert!(adapter.resolution_cache().get("/new.txt").is_some());
    }

    #[tokio::test]
    async fn test_resumable_upload_after_partial_ack() {
        let server = MemoryIdServer::new("bob", "token");
        let adapter = adapter(&server, None);
        server.cap_ranges(Some(3));

        let file = put(&adapter, "/big.bin", b"0123456789abcdef").await;
        assert_eq!(file.size(), Some(16));
        assert_eq!(server.file_content("/big.bin").unwrap().as_ref(), b"0123456789abcdef");
    }

    #[tokio::test]
    async fn test_transient_upload_failure_queries_offset() {
        let server = MemoryIdServer::new("bob", "token");
        let adapter = adapter(&server, None);
        server
            .faults()
            .inject_after("upload_range", 1, IdApiError::status(503, "backend error"));

        put(&adapter, "/big.bin", b"0123456789ab").await;
        assert_eq!(server.faults().calls("query_upload"), 1);
        assert_eq!(server.file_content("/big.bin").unwrap().as_ref(), b"0123456789ab");
    }

    #[tokio::test]
    async fn test_ranged_read_with_retry() {
        let server = MemoryIdServer::new("bob", "token");
        let adapter = adapter(&server, None);
        let file = put(&adapter, "/big.bin", b"0123456789ab").await;
        server
            .faults()
            .inject_after("download_range", 1, IdApiError::Transport("reset".into()));

        let log = ProgressLog::new();
        let mut out = Vec::new();
        adapter.read(&file, &mut out, &log).await.unwrap();

        assert_eq!(out, b"0123456789ab");
        assert_eq!(server.faults().calls("download_range"), 4);
        assert_eq!(log.events().last().unwrap().bytes_transferred, 12);
    }

    #[tokio::test]
    async fn test_read_cache_keyed_by_etag() {
        let temp = TempDir::new().unwrap();
        let cache = Arc::new(ContentCache::open(temp.path(), 1 << 20).await.unwrap());
        let server = MemoryIdServer::new("bob", "token");
        let adapter = adapter(&server, Some(cache));
        let root = adapter.root();
        let file = put(&adapter, "/c.txt", b"v1").await;

        let mut out = Vec::new();
        adapter.read(&file, &mut out, &NoProgress).await.unwrap();
        adapter.read(&file, &mut Vec::new(), &NoProgress).await.unwrap();
        assert_eq!(server.faults().calls("download"), 1);

        let file = adapter.file(&root, "c.txt", None).unwrap();
        adapter
            .write(&file, &BytesSource::new(&b"v2"[..]), &NoProgress, true, 2)
            .await
            .unwrap();
        let mut out = Vec::new();
        adapter.read(&file, &mut out, &NoProgress).await.unwrap();
        assert_eq!(out, b"v2");
        assert_eq!(server.faults().calls("download"), 2);
    }

    #[tokio::test]
    async fn test_logout_clears_state() {
        let server = MemoryIdServer::new("bob", "token");
        let adapter = adapter(&server, None);
        put(&adapter, "/a.txt", b"a").await;

        adapter.logout().await.unwrap();
        assert!(adapter.resolution_cache().get("/a.txt").is_none());
        assert_eq!(adapter.check_authentication().await.unwrap(), "bob");
    }
}
