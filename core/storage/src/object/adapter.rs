//! Adapter for bucket/key object stores.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use cloudtree_common::{CloudFile, CloudFolder, CloudId, CloudNode, Error, Result};

use super::api::{CompletedPart, ObjectApi, ObjectApiError, ObjectInfo};
use super::errors::{normalize, transfer_failure};
use crate::adapter::{ensure_absent, missing_ancestors, reparent, CloudAdapter};
use crate::client::ClientSlot;
use crate::config::StorageConfig;
use crate::content_cache::ContentCache;
use crate::io::{read_all, DataSink, DataSource};
use crate::progress::{Direction, ProgressReporter, ProgressSink};
use crate::transfer::download::pump_stream;
use crate::transfer::{ChunkedUploader, ReadSink, Sleeper, TransferFailure, UploadSession};

/// Keys per batch delete request.
pub const DELETE_BATCH: usize = 1000;

/// Object key of a file or folder path. The root has no key.
fn object_key(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// Key prefix shared by everything inside `folder`.
fn folder_prefix(folder: &CloudFolder) -> String {
    if folder.is_root() {
        String::new()
    } else {
        format!("{}/", object_key(folder.path()))
    }
}

fn is_missing(error: &ObjectApiError, code: &str) -> bool {
    error.code() == Some(code)
}

/// Serves one bucket of an object store as a file tree.
///
/// Folders are zero-length marker objects named `<prefix>/`; folders implied
/// only by deeper keys are listed and reported as existing too.
pub struct ObjectAdapter<C: ObjectApi> {
    cloud: CloudId,
    bucket: String,
    slot: ClientSlot<C>,
    config: StorageConfig,
    content_cache: Option<Arc<ContentCache>>,
    uploader: ChunkedUploader,
}

impl<C: ObjectApi + 'static> ObjectAdapter<C> {
    pub fn new(
        cloud: CloudId,
        bucket: impl Into<String>,
        client_factory: impl Fn() -> Result<C> + Send + Sync + 'static,
        config: StorageConfig,
        content_cache: Option<Arc<ContentCache>>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let uploader = ChunkedUploader::new(&config, sleeper);
        Self {
            cloud,
            bucket: bucket.into(),
            slot: ClientSlot::new(client_factory),
            config,
            content_cache,
            uploader,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn client(&self) -> Result<Arc<C>> {
        self.slot.get()
    }

    async fn folder_exists(&self, client: &C, folder: &CloudFolder) -> Result<bool> {
        if folder.is_root() {
            return match client.head_bucket(&self.bucket).await {
                Ok(()) => Ok(true),
                Err(e) if is_missing(&e, "NoSuchBucket") => Ok(false),
                Err(e) => Err(normalize(e, "head bucket", &self.bucket)),
            };
        }
        let listing = client
            .list_objects(&self.bucket, &folder_prefix(folder), None, None, 1)
            .await
            .map_err(|e| normalize(e, "probe", folder.path()))?;
        Ok(!listing.objects.is_empty() || !listing.common_prefixes.is_empty())
    }

    async fn ensure_parent(&self, client: &C, parent: &CloudFolder, path: &str) -> Result<()> {
        if parent.is_root() || self.folder_exists(client, parent).await? {
            return Ok(());
        }
        Err(Error::ParentMissing(path.to_string()))
    }

    async fn put_marker(&self, client: &C, folder: &CloudFolder) -> Result<()> {
        client
            .put_object(&self.bucket, &folder_prefix(folder), Bytes::new(), None)
            .await
            .map_err(|e| normalize(e, "create", folder.path()))?;
        Ok(())
    }

    /// Every key under `prefix`, across all pages, without delimiting.
    async fn keys_under(&self, client: &C, prefix: &str, path: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let listing = client
                .list_objects(&self.bucket, prefix, None, token.as_deref(), self.config.page_size)
                .await
                .map_err(|e| normalize(e, "list", path))?;
            keys.extend(listing.objects.into_iter().map(|o| o.key));
            match listing.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(keys)
    }

    /// Delete `keys` in batches of at most [`DELETE_BATCH`].
    async fn delete_keys(&self, client: &C, keys: &[String], path: &str) -> Result<()> {
        for batch in keys.chunks(DELETE_BATCH) {
            let failed = client
                .delete_objects(&self.bucket, batch)
                .await
                .map_err(|e| normalize(e, "delete", path))?;
            if !failed.is_empty() {
                return Err(Error::fatal_msg(
                    format!("delete {}", path),
                    format!("{} keys could not be deleted, first {}", failed.len(), failed[0]),
                ));
            }
        }
        Ok(())
    }

    /// Copy every descendant key of `source` under `target`, then remove the
    /// sources. A copy failure removes what was copied and leaves the source
    /// untouched.
    async fn move_folder(&self, client: &C, source: &CloudFolder, target: &CloudFolder) -> Result<()> {
        let from = folder_prefix(source);
        let to = folder_prefix(target);
        let keys = self.keys_under(client, &from, source.path()).await?;
        if keys.is_empty() {
            return Err(Error::NotFound(source.path().to_string()));
        }
        debug!("Moving {} keys from {} to {}", keys.len(), from, to);

        let mut copied = Vec::with_capacity(keys.len());
        for key in &keys {
            let dest = format!("{}{}", to, &key[from.len()..]);
            if let Err(e) = client.copy_object(&self.bucket, key, &dest).await {
                warn!("Copy of {} failed, rolling back {} copies: {}", key, copied.len(), e);
                if let Err(cleanup) = self.delete_keys(client, &copied, target.path()).await {
                    warn!("Rollback of {} left copies behind: {}", target, cleanup);
                }
                return Err(Error::fatal(format!("move {} to {}", source, target), e));
            }
            copied.push(dest);
        }
        self.delete_keys(client, &keys, source.path()).await
    }

    fn node_from_info(&self, parent: &CloudFolder, prefix: &str, info: &ObjectInfo) -> Result<CloudNode> {
        let name = &info.key[prefix.len()..];
        Ok(CloudNode::File(
            CloudFile::new(parent, name, Some(info.size))?.with_modified(info.last_modified),
        ))
    }

    fn fingerprint(&self, key: &str, etag: &str) -> String {
        format!("{}/{}@{}", self.bucket, key, etag)
    }
}

struct ObjectUploadSession<'a, C> {
    client: &'a C,
    bucket: &'a str,
    key: &'a str,
    path: &'a str,
    chunk_size: u64,
    modified: Option<DateTime<Utc>>,
    upload_id: Option<String>,
    parts: BTreeMap<u32, String>,
}

impl<C: ObjectApi> ObjectUploadSession<'_, C> {
    fn part_number(&self, offset: u64) -> u32 {
        (offset / self.chunk_size) as u32 + 1
    }

    async fn send_part(&mut self, offset: u64, data: Bytes) -> std::result::Result<(), TransferFailure> {
        let upload_id = self
            .upload_id
            .as_deref()
            .ok_or_else(|| Error::fatal_msg(format!("upload {}", self.path), "multipart upload not started"))?;
        let part_number = self.part_number(offset);
        let etag = self
            .client
            .upload_part(self.bucket, self.key, upload_id, part_number, data)
            .await
            .map_err(|e| transfer_failure(e, "upload", self.path))?;
        self.parts.insert(part_number, etag);
        Ok(())
    }

    async fn abort(&self) {
        if let Some(upload_id) = &self.upload_id {
            if let Err(e) = self.client.abort_multipart(self.bucket, self.key, upload_id).await {
                warn!("Failed to abort multipart upload of {}: {}", self.path, e);
            }
        }
    }
}

#[async_trait]
impl<C: ObjectApi> UploadSession for ObjectUploadSession<'_, C> {
    type Output = ObjectInfo;

    async fn start(&mut self, first: Bytes) -> std::result::Result<(), TransferFailure> {
        if self.upload_id.is_none() {
            let id = self
                .client
                .create_multipart(self.bucket, self.key)
                .await
                .map_err(|e| transfer_failure(e, "upload", self.path))?;
            self.upload_id = Some(id);
        }
        self.send_part(0, first).await
    }

    async fn append(&mut self, offset: u64, chunk: Bytes) -> std::result::Result<(), TransferFailure> {
        self.send_part(offset, chunk).await
    }

    async fn finish(&mut self, offset: u64, last: Bytes) -> std::result::Result<ObjectInfo, TransferFailure> {
        if !last.is_empty() || self.parts.is_empty() {
            self.send_part(offset, last).await?;
        }
        let upload_id = self
            .upload_id
            .as_deref()
            .ok_or_else(|| Error::fatal_msg(format!("upload {}", self.path), "multipart upload not started"))?;
        let parts = self
            .parts
            .iter()
            .map(|(part_number, etag)| CompletedPart {
                part_number: *part_number,
                etag: etag.clone(),
            })
            .collect();
        self.client
            .complete_multipart(self.bucket, self.key, upload_id, parts, self.modified)
            .await
            .map_err(|e| transfer_failure(e, "upload", self.path))
    }
}

#[async_trait]
impl<C: ObjectApi + 'static> CloudAdapter for ObjectAdapter<C> {
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
        let client = self.client()?;
        match node {
            CloudNode::Folder(folder) => self.folder_exists(&client, folder).await,
            CloudNode::File(file) => match client.head_object(&self.bucket, object_key(file.path())).await {
                Ok(_) => Ok(true),
                Err(e) if is_missing(&e, "NoSuchKey") || is_missing(&e, "NotFound") => Ok(false),
                Err(e) => Err(normalize(e, "head", file.path())),
            },
        }
    }

    async fn list(&self, folder: &CloudFolder) -> Result<Vec<CloudNode>> {
        let client = self.client()?;
        let prefix = folder_prefix(folder);
        let mut nodes = Vec::new();
        let mut token: Option<String> = None;
        let mut seen_any = folder.is_root();

        loop {
            let listing = client
                .list_objects(&self.bucket, &prefix, Some("/"), token.as_deref(), self.config.page_size)
                .await
                .map_err(|e| normalize(e, "list", folder.path()))?;
            seen_any |= !listing.objects.is_empty() || !listing.common_prefixes.is_empty();

            for info in listing.objects.iter().filter(|o| o.key != prefix) {
                match self.node_from_info(folder, &prefix, info) {
                    Ok(node) => nodes.push(node),
                    Err(e) => warn!("Skipping key {} in {}: {}", info.key, self.bucket, e),
                }
            }
            for common in &listing.common_prefixes {
                let name = common[prefix.len()..].trim_end_matches('/');
                match CloudFolder::child(folder, name) {
                    Ok(child) => nodes.push(CloudNode::Folder(child)),
                    Err(e) => warn!("Skipping prefix {} in {}: {}", common, self.bucket, e),
                }
            }
            match listing.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        if !seen_any {
            return Err(Error::NotFound(folder.path().to_string()));
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
            self.put_marker(&client, &ancestor).await?;
        }
        self.put_marker(&client, folder).await?;
        Ok(folder.clone())
    }

    async fn move_node(&self, source: &CloudNode, target: &CloudNode) -> Result<CloudNode> {
        ensure_absent(self, target).await?;
        let target_parent = target
            .parent()
            .ok_or_else(|| Error::InvalidInput("cannot move onto the root".to_string()))?;
        let client = self.client()?;

        match (source, target) {
            (CloudNode::File(from), CloudNode::File(to)) => {
                let from_key = object_key(from.path());
                client
                    .head_object(&self.bucket, from_key)
                    .await
                    .map_err(|e| normalize(e, "move", from.path()))?;
                self.ensure_parent(&client, target_parent, to.path()).await?;
                client
                    .copy_object(&self.bucket, from_key, object_key(to.path()))
                    .await
                    .map_err(|e| normalize(e, "move", from.path()))?;
                self.delete_keys(&client, &[from_key.to_string()], from.path()).await?;
            }
            (CloudNode::Folder(from), CloudNode::Folder(to)) => {
                if from.is_root() {
                    return Err(Error::InvalidInput("cannot move the root".to_string()));
                }
                self.ensure_parent(&client, target_parent, to.path()).await?;
                self.move_folder(&client, from, to).await?;
            }
            _ => {
                return Err(Error::InvalidInput(format!(
                    "cannot move {} onto a node of another kind",
                    source.path()
                )))
            }
        }
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
        if !replace {
            ensure_absent(self, &CloudNode::File(file.clone())).await?;
        }
        let client = self.client()?;
        self.ensure_parent(&client, file.parent(), file.path()).await?;
        let key = object_key(file.path());
        let modified = data.modified();

        let reporter = ProgressReporter::new(progress, file, Direction::Upload, Some(size));
        reporter.started();

        let info = if size <= self.config.chunk_threshold {
            let content = read_all(data, size, file.path()).await?;
            let info = client
                .put_object(&self.bucket, key, content, modified)
                .await
                .map_err(|e| normalize(e, "write", file.path()))?;
            reporter.progress(size);
            info
        } else {
            debug!("Uploading {} ({} bytes) in parts", file, size);
            let mut session = ObjectUploadSession {
                client: client.as_ref(),
                bucket: &self.bucket,
                key,
                path: file.path(),
                chunk_size: self.config.chunk_size.max(1) as u64,
                modified,
                upload_id: None,
                parts: BTreeMap::new(),
            };
            match self
                .uploader
                .upload(&mut session, data, size, &reporter, file.path())
                .await
            {
                Ok(info) => info,
                Err(e) => {
                    session.abort().await;
                    return Err(e);
                }
            }
        };

        reporter.completed(size);
        Ok(file
            .clone()
            .with_size(Some(info.size))
            .with_modified(info.last_modified))
    }

    async fn read(
        &self,
        file: &CloudFile,
        dest: &mut DataSink,
        progress: &dyn ProgressSink,
    ) -> Result<()> {
        let client = self.client()?;
        let key = object_key(file.path());
        let reporter = ProgressReporter::new(progress, file, Direction::Download, file.size());

        let fingerprint = match &self.content_cache {
            Some(_) => client
                .head_object(&self.bucket, key)
                .await
                .map_err(|e| normalize(e, "read", file.path()))?
                .etag
                .map(|etag| self.fingerprint(key, &etag)),
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

        let (info, stream) = client
            .get_object(&self.bucket, key)
            .await
            .map_err(|e| normalize(e, "read", file.path()))?;
        sink.set_total(Some(info.size));
        let path = file.path().to_string();
        pump_stream(stream, &mut sink, move |e| normalize(e, "read", &path)).await?;
        sink.finish().await?;
        Ok(())
    }

    async fn delete(&self, node: &CloudNode) -> Result<()> {
        let client = self.client()?;
        match node {
            CloudNode::File(file) => {
                let key = object_key(file.path());
                client
                    .head_object(&self.bucket, key)
                    .await
                    .map_err(|e| normalize(e, "delete", file.path()))?;
                self.delete_keys(&client, &[key.to_string()], file.path()).await
            }
            CloudNode::Folder(folder) => {
                if folder.is_root() {
                    return Err(Error::InvalidInput("cannot delete the root".to_string()));
                }
                let keys = self.keys_under(&client, &folder_prefix(folder), folder.path()).await?;
                if keys.is_empty() {
                    return Err(Error::NotFound(folder.path().to_string()));
                }
                self.delete_keys(&client, &keys, folder.path()).await
            }
        }
    }

    async fn check_authentication(&self) -> Result<String> {
        let client = self.client()?;
        let identity = client
            .caller_identity()
            .await
            .map_err(|e| normalize(e, "identity", ""))?;
        client
            .head_bucket(&self.bucket)
            .await
            .map_err(|e| normalize(e, "head bucket", &self.bucket))?;
        Ok(identity)
    }

    async fn logout(&self) -> Result<()> {
        self.slot.clear();
        Ok(())
    }
}
