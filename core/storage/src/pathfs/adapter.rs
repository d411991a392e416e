//! Adapter for path-addressed backends.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use cloudtree_common::{CloudFile, CloudFolder, CloudId, CloudNode, Error, Result};

use super::api::{PathApi, PathApiError, PathEntry, WriteMode};
use super::errors::{normalize, transfer_failure, Op};
use crate::adapter::{ensure_absent, missing_ancestors, reparent, CloudAdapter};
use crate::client::ClientSlot;
use crate::config::StorageConfig;
use crate::content_cache::ContentCache;
use crate::io::{read_all, DataSink, DataSource};
use crate::progress::{Direction, ProgressReporter, ProgressSink};
use crate::transfer::download::pump_stream;
use crate::transfer::{ChunkedUploader, ReadSink, Sleeper, TransferFailure, UploadSession};

/// Serves one identity of a path-addressed backend.
///
/// Logical paths map one to one onto remote paths, so no resolution cache is
/// needed.
pub struct PathAdapter<C: PathApi> {
    cloud: CloudId,
    slot: ClientSlot<C>,
    config: StorageConfig,
    content_cache: Option<Arc<ContentCache>>,
    uploader: ChunkedUploader,
}

impl<C: PathApi + 'static> PathAdapter<C> {
    pub fn new(
        cloud: CloudId,
        client_factory: impl Fn() -> Result<C> + Send + Sync + 'static,
        config: StorageConfig,
        content_cache: Option<Arc<ContentCache>>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let uploader = ChunkedUploader::new(&config, sleeper);
        Self {
            cloud,
            slot: ClientSlot::new(client_factory),
            config,
            content_cache,
            uploader,
        }
    }

    fn client(&self) -> Result<Arc<C>> {
        self.slot.get()
    }

    fn node_from_entry(&self, parent: &CloudFolder, entry: &PathEntry) -> Result<CloudNode> {
        let name = entry.name();
        if entry.is_folder {
            return Ok(CloudNode::Folder(CloudFolder::child(parent, name)?));
        }
        Ok(CloudNode::File(
            CloudFile::new(parent, name, Some(entry.size))?.with_modified(entry.modified),
        ))
    }

    fn file_from_entry(file: &CloudFile, entry: &PathEntry) -> CloudFile {
        file.clone()
            .with_size(Some(entry.size))
            .with_modified(entry.modified)
    }

    fn fingerprint(&self, path: &str, rev: &str) -> String {
        format!("{}|{}|{}", self.cloud, path, rev)
    }
}

struct PathUploadSession<'a, C> {
    client: &'a C,
    path: &'a str,
    mode: WriteMode,
    modified: Option<DateTime<Utc>>,
    session: Option<String>,
}

impl<C> PathUploadSession<'_, C> {
    fn session_id(&self) -> std::result::Result<&str, TransferFailure> {
        self.session
            .as_deref()
            .ok_or_else(|| Error::fatal_msg(format!("upload {}", self.path), "session not started").into())
    }
}

#[async_trait]
impl<C: PathApi> UploadSession for PathUploadSession<'_, C> {
    type Output = PathEntry;

    async fn start(&mut self, first: Bytes) -> std::result::Result<(), TransferFailure> {
        let id = self
            .client
            .upload_session_start(first)
            .await
            .map_err(|e| transfer_failure(e, self.path))?;
        self.session = Some(id);
        Ok(())
    }

    async fn append(&mut self, offset: u64, chunk: Bytes) -> std::result::Result<(), TransferFailure> {
        let id = self.session_id()?;
        self.client
            .upload_session_append(id, offset, chunk)
            .await
            .map_err(|e| transfer_failure(e, self.path))
    }

    async fn finish(&mut self, offset: u64, last: Bytes) -> std::result::Result<PathEntry, TransferFailure> {
        let id = self.session_id()?;
        self.client
            .upload_session_finish(id, offset, last, self.path, self.mode, self.modified)
            .await
            .map_err(|e| transfer_failure(e, self.path))
    }
}

#[async_trait]
impl<C: PathApi + 'static> CloudAdapter for PathAdapter<C> {
    fn cloud(&self) -> &CloudId {
        &self.cloud
    }

    fn file(&self, parent: &CloudFolder, name: &str, size: Option<u64>) -> Result<CloudFile> {
        CloudFile::new(parent, name, size)
    }

    fn folder(&self, parent: &CloudFolder, name: &str) -> Result<CloudFolder> {
        CloudFolder::child(parent, name)
    }

    async fn exists(&self, node: &CloudNode) -> Result<bool> {
        if node.parent().is_none() {
            return Ok(node.is_folder());
        }
        match self.client()?.get_metadata(node.path()).await {
            Ok(entry) => Ok(entry.is_folder == node.is_folder()),
            Err(PathApiError::NotFound(_)) => Ok(false),
            Err(e) => Err(normalize(e, Op::Lookup, node.path())),
        }
    }

    async fn list(&self, folder: &CloudFolder) -> Result<Vec<CloudNode>> {
        let client = self.client()?;
        let mut page = client
            .list_folder(folder.path(), self.config.page_size)
            .await
            .map_err(|e| normalize(e, Op::List, folder.path()))?;

        let mut nodes = Vec::new();
        loop {
            for entry in &page.entries {
                nodes.push(self.node_from_entry(folder, entry)?);
            }
            match (page.has_more, page.cursor.take()) {
                (true, Some(cursor)) => {
                    page = client
                        .list_folder_continue(&cursor)
                        .await
                        .map_err(|e| normalize(e, Op::List, folder.path()))?;
                }
                _ => break,
            }
        }
        debug!("Listed {} entries in {}", nodes.len(), folder);
        Ok(nodes)
    }

    async fn create(&self, folder: &CloudFolder) -> Result<CloudFolder> {
        if folder.is_root() {
            return Err(Error::AlreadyExists(String::new()));
        }
        ensure_absent(self, &CloudNode::Folder(folder.clone())).await?;

        let client = self.client()?;
        for ancestor in missing_ancestors(self, folder).await? {
            client
                .create_folder(ancestor.path())
                .await
                .map_err(|e| normalize(e, Op::Create, ancestor.path()))?;
        }
        client
            .create_folder(folder.path())
            .await
            .map_err(|e| normalize(e, Op::Create, folder.path()))?;
        Ok(folder.clone())
    }

    async fn move_node(&self, source: &CloudNode, target: &CloudNode) -> Result<CloudNode> {
        ensure_absent(self, target).await?;
        let target_parent = target
            .parent()
            .ok_or_else(|| Error::InvalidInput("cannot move onto the root".to_string()))?;

        match self.client()?.move_entry(source.path(), target.path()).await {
            Ok(_) => reparent(source, target_parent, target.name()),
            Err(PathApiError::NotFound(missing)) if missing == source.path() => {
                Err(Error::NotFound(source.path().to_string()))
            }
            Err(PathApiError::NotFound(_)) => Err(Error::ParentMissing(target.path().to_string())),
            Err(e) => Err(normalize(e, Op::Move, source.path())),
        }
    }

    async fn write(
        &self,
        file: &CloudFile,
        data: &dyn DataSource,
        progress: &dyn ProgressSink,
        replace: bool,
        size: u64,
    ) -> Result<CloudFile> {
        if !replace {
            ensure_absent(self, &CloudNode::File(file.clone())).await?;
        }
        let client = self.client()?;
        let mode = if replace { WriteMode::Overwrite } else { WriteMode::Add };
        let modified = data.modified();

        let reporter = ProgressReporter::new(progress, file, Direction::Upload, Some(size));
        reporter.started();

        let entry = if size <= self.config.chunk_threshold {
            let content = read_all(data, size, file.path()).await?;
            let entry = client
                .upload(file.path(), content, mode, modified)
                .await
                .map_err(|e| normalize(e, Op::Write, file.path()))?;
            reporter.progress(size);
            entry
        } else {
            debug!("Uploading {} ({} bytes) in a session", file, size);
            let mut session = PathUploadSession {
                client: client.as_ref(),
                path: file.path(),
                mode,
                modified,
                session: None,
            };
            self.uploader
                .upload(&mut session, data, size, &reporter, file.path())
                .await?
        };

        reporter.completed(size);
        Ok(Self::file_from_entry(file, &entry))
    }

    async fn read(
        &self,
        file: &CloudFile,
        dest: &mut DataSink,
        progress: &dyn ProgressSink,
    ) -> Result<()> {
        let client = self.client()?;
        let reporter = ProgressReporter::new(progress, file, Direction::Download, file.size());

        let fingerprint = match &self.content_cache {
            Some(_) => {
                let entry = client
                    .get_metadata(file.path())
                    .await
                    .map_err(|e| normalize(e, Op::Read, file.path()))?;
                if entry.is_folder {
                    return Err(Error::NotFound(file.path().to_string()));
                }
                entry.rev.map(|rev| self.fingerprint(file.path(), &rev))
            }
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

        let (entry, stream) = client
            .download(file.path())
            .await
            .map_err(|e| normalize(e, Op::Read, file.path()))?;
        sink.set_total(Some(entry.size));
        let path = file.path().to_string();
        pump_stream(stream, &mut sink, move |e| normalize(e, Op::Read, &path)).await?;
        sink.finish().await?;
        Ok(())
    }

    async fn delete(&self, node: &CloudNode) -> Result<()> {
        if node.parent().is_none() {
            return Err(Error::InvalidInput("cannot delete the root".to_string()));
        }
        let client = self.client()?;
        let entry = client
            .get_metadata(node.path())
            .await
            .map_err(|e| normalize(e, Op::Delete, node.path()))?;
        if entry.is_folder != node.is_folder() {
            return Err(Error::NotFound(node.path().to_string()));
        }
        client
            .delete(node.path())
            .await
            .map_err(|e| normalize(e, Op::Delete, node.path()))
    }

    async fn check_authentication(&self) -> Result<String> {
        self.client()?
            .current_account()
            .await
            .map_err(|e| normalize(e, Op::Account, ""))
    }

    async fn logout(&self) -> Result<()> {
        self.slot.clear();
        Ok(())
    }
}
