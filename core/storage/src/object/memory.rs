//! In-memory object store for tests and local development.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::api::{CompletedPart, ObjectApi, ObjectApiError, ObjectInfo, ObjectListing, ObjectResult};
use crate::faults::FaultPlan;
use crate::io::ByteStream;

const STREAM_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: u64,
    modified: DateTime<Utc>,
}

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, Bytes>,
}

#[derive(Debug, Default)]
struct StoreState {
    buckets: BTreeMap<String, BTreeMap<String, StoredObject>>,
    uploads: HashMap<String, PendingUpload>,
    access_key: String,
    expired: bool,
    next_version: u64,
}

impl StoreState {
    fn bucket(&self, bucket: &str) -> ObjectResult<&BTreeMap<String, StoredObject>> {
        self.buckets
            .get(bucket)
            .ok_or_else(|| ObjectApiError::service("NoSuchBucket", 404, bucket))
    }

    fn bucket_mut(&mut self, bucket: &str) -> ObjectResult<&mut BTreeMap<String, StoredObject>> {
        self.buckets
            .get_mut(bucket)
            .ok_or_else(|| ObjectApiError::service("NoSuchBucket", 404, bucket))
    }

    fn store(
        &mut self,
        bucket: &str,
        key: &str,
        data: Bytes,
        modified: Option<DateTime<Utc>>,
    ) -> ObjectResult<ObjectInfo> {
        self.next_version += 1;
        let stored = StoredObject {
            data,
            version: self.next_version,
            modified: modified.unwrap_or_else(Utc::now),
        };
        let info = info(key, &stored);
        self.bucket_mut(bucket)?.insert(key.to_string(), stored);
        Ok(info)
    }
}

fn info(key: &str, stored: &StoredObject) -> ObjectInfo {
    ObjectInfo {
        key: key.to_string(),
        size: stored.data.len() as u64,
        etag: Some(format!("\"{:x}\"", stored.version)),
        last_modified: Some(stored.modified),
    }
}

fn no_such_key(key: &str) -> ObjectApiError {
    ObjectApiError::service("NoSuchKey", 404, key)
}

/// Simulated object store holding any number of buckets.
#[derive(Debug)]
pub struct MemoryObjectServer {
    account: String,
    state: Mutex<StoreState>,
    faults: FaultPlan<ObjectApiError>,
    bytes_received: AtomicU64,
}

impl MemoryObjectServer {
    pub fn new(account: impl Into<String>, access_key: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            account: account.into(),
            state: Mutex::new(StoreState {
                access_key: access_key.into(),
                ..StoreState::default()
            }),
            faults: FaultPlan::new(),
            bytes_received: AtomicU64::new(0),
        })
    }

    pub fn client(self: &Arc<Self>, access_key: impl Into<String>) -> MemoryObjectClient {
        MemoryObjectClient {
            server: self.clone(),
            access_key: access_key.into(),
        }
    }

    pub fn create_bucket(&self, bucket: &str) {
        self.lock().buckets.entry(bucket.to_string()).or_default();
    }

    pub fn faults(&self) -> &FaultPlan<ObjectApiError> {
        &self.faults
    }

    /// Content bytes accepted by put and part uploads so far.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::SeqCst)
    }

    pub fn set_access_key(&self, access_key: impl Into<String>) {
        let mut state = self.lock();
        state.access_key = access_key.into();
        state.expired = false;
    }

    /// Make the session token behind the current key report as expired.
    pub fn expire_token(&self) {
        self.lock().expired = true;
    }

    /// Store an object directly, bypassing authorization and faults.
    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        let mut state = self.lock();
        state.buckets.entry(bucket.to_string()).or_default();
        let _ = state.store(bucket, key, data.into(), None);
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.lock()
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|o| o.data.clone())
    }

    /// Every key in `bucket`, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Multipart uploads neither completed nor aborted.
    pub fn open_uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn authorize(&self, access_key: &str, op: &'static str) -> ObjectResult<MutexGuard<'_, StoreState>> {
        let state = self.lock();
        if state.access_key != access_key {
            return Err(ObjectApiError::service(
                "InvalidAccessKeyId",
                403,
                "The access key does not exist",
            ));
        }
        if state.expired {
            return Err(ObjectApiError::service("ExpiredToken", 400, "The token has expired"));
        }
        self.faults.check(op)?;
        Ok(state)
    }
}

/// Client bound to one [`MemoryObjectServer`] and access key.
#[derive(Debug, Clone)]
pub struct MemoryObjectClient {
    server: Arc<MemoryObjectServer>,
    access_key: String,
}

impl MemoryObjectClient {
    fn state(&self, op: &'static str) -> ObjectResult<MutexGuard<'_, StoreState>> {
        self.server.authorize(&self.access_key, op)
    }

    fn received(&self, len: usize) {
        self.server
            .bytes_received
            .fetch_add(len as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectApi for MemoryObjectClient {
    async fn caller_identity(&self) -> ObjectResult<String> {
        drop(self.state("caller_identity")?);
        Ok(self.server.account.clone())
    }

    async fn head_bucket(&self, bucket: &str) -> ObjectResult<()> {
        self.state("head_bucket")?.bucket(bucket).map(|_| ())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> ObjectResult<ObjectInfo> {
        let state = self.state("head_object")?;
        state
            .bucket(bucket)?
            .get(key)
            .map(|stored| info(key, stored))
            .ok_or_else(|| no_such_key(key))
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<&str>,
        max_keys: usize,
    ) -> ObjectResult<ObjectListing> {
        let state = self.state("list_objects")?;
        let objects = state.bucket(bucket)?;

        // Keys sharing a rolled-up prefix are contiguous in key order, so
        // comparing against the last emitted prefix is enough.
        let mut items: Vec<(String, Option<ObjectInfo>)> = Vec::new();
        for (key, stored) in objects.range(prefix.to_string()..) {
            let Some(rest) = key.strip_prefix(prefix) else {
                break;
            };
            let rolled = delimiter.and_then(|d| rest.find(d).map(|i| i + d.len()));
            match rolled {
                Some(end) => {
                    let common = format!("{}{}", prefix, &rest[..end]);
                    if items.last().map(|(k, _)| k != &common).unwrap_or(true) {
                        items.push((common, None));
                    }
                }
                None => items.push((key.clone(), Some(info(key, stored)))),
            }
        }

        let mut listing = ObjectListing::default();
        let mut remaining = items
            .into_iter()
            .filter(|(key, _)| continuation.map(|after| key.as_str() > after).unwrap_or(true))
            .peekable();
        let mut last = None;
        for (key, object) in remaining.by_ref().take(max_keys.max(1)) {
            match object {
                Some(object) => listing.objects.push(object),
                None => listing.common_prefixes.push(key.clone()),
            }
            last = Some(key);
        }
        if remaining.peek().is_some() {
            listing.next_token = last;
        }
        Ok(listing)
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        modified: Option<DateTime<Utc>>,
    ) -> ObjectResult<ObjectInfo> {
        let mut state = self.state("put_object")?;
        self.received(data.len());
        state.store(bucket, key, data, modified)
    }

    async fn copy_object(&self, bucket: &str, from: &str, to: &str) -> ObjectResult<ObjectInfo> {
        let mut state = self.state("copy_object")?;
        let source = state
            .bucket(bucket)?
            .get(from)
            .cloned()
            .ok_or_else(|| no_such_key(from))?;
        state.store(bucket, to, source.data, Some(source.modified))
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> ObjectResult<Vec<String>> {
        if keys.len() > 1000 {
            return Err(ObjectApiError::service(
                "MalformedXML",
                400,
                "at most 1000 keys per request",
            ));
        }
        let mut state = self.state("delete_objects")?;
        let objects = state.bucket_mut(bucket)?;
        for key in keys {
            objects.remove(key);
        }
        Ok(Vec::new())
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> ObjectResult<(ObjectInfo, ByteStream<ObjectApiError>)> {
        let state = self.state("get_object")?;
        let stored = state.bucket(bucket)?.get(key).ok_or_else(|| no_such_key(key))?;
        let data = stored.data.clone();

        let chunks: Vec<ObjectResult<Bytes>> = (0..data.len())
            .step_by(STREAM_CHUNK)
            .map(|start| Ok(data.slice(start..(start + STREAM_CHUNK).min(data.len()))))
            .collect();
        Ok((info(key, stored), Box::pin(futures::stream::iter(chunks))))
    }

    async fn create_multipart(&self, bucket: &str, key: &str) -> ObjectResult<String> {
        let mut state = self.state("create_multipart")?;
        state.bucket(bucket)?;
        let upload_id = Uuid::new_v4().to_string();
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> ObjectResult<String> {
        let mut state = self.state("upload_part")?;
        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.bucket == bucket && u.key == key)
            .ok_or_else(|| ObjectApiError::service("NoSuchUpload", 404, upload_id))?;
        self.received(data.len());
        upload.parts.insert(part_number, data);
        Ok(format!("\"part-{}\"", part_number))
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
        modified: Option<DateTime<Utc>>,
    ) -> ObjectResult<ObjectInfo> {
        let mut state = self.state("complete_multipart")?;
        let upload = state
            .uploads
            .remove(upload_id)
            .filter(|u| u.bucket == bucket && u.key == key)
            .ok_or_else(|| ObjectApiError::service("NoSuchUpload", 404, upload_id))?;

        let mut content = Vec::new();
        for part in &parts {
            let data = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| ObjectApiError::service("InvalidPart", 400, part.part_number.to_string()))?;
            content.extend_from_slice(data);
        }
        state.store(bucket, key, Bytes::from(content), modified)
    }

    async fn abort_multipart(&self, _bucket: &str, _key: &str, upload_id: &str) -> ObjectResult<()> {
        self.state("abort_multipart")?
            .uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| ObjectApiError::service("NoSuchUpload", 404, upload_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> Arc<MemoryObjectServer> {
        let server = MemoryObjectServer::new("alice", "AKIA");
        server.create_bucket("media");
        server
    }

    #[tokio::test]
    async fn test_access_key_checks() {
        let server = server();
        let bad = server.client("nope");
        let err = bad.head_bucket("media").await.unwrap_err();
        assert_eq!(err.code(), Some("InvalidAccessKeyId"));

        let good = server.client("AKIA");
        assert!(good.head_bucket("media").await.is_ok());
        assert_eq!(good.head_bucket("other").await.unwrap_err().code(), Some("NoSuchBucket"));

        server.expire_token();
        assert_eq!(good.head_bucket("media").await.unwrap_err().code(), Some("ExpiredToken"));
    }

    #[tokio::test]
    async fn test_delimited_listing_pages() {
        let server = server();
        for key in ["a.txt", "docs/", "docs/x", "docs/y/z", "pics/p.png", "z.txt"] {
            server.insert("media", key, &b"1"[..]);
        }
        let client = server.client("AKIA");

        let first = client.list_objects("media", "", Some("/"), None, 2).await.unwrap();
        assert_eq!(first.objects.len(), 1);
        assert_eq!(first.common_prefixes, vec!["docs/".to_string()]);
        let token = first.next_token.clone().unwrap();

        let rest = client
            .list_objects("media", "", Some("/"), Some(&token), 10)
            .await
            .unwrap();
        assert_eq!(rest.common_prefixes, vec!["pics/".to_string()]);
        assert_eq!(rest.objects[0].key, "z.txt");
        assert!(rest.next_token.is_none());

        let docs = client.list_objects("media", "docs/", Some("/"), None, 10).await.unwrap();
        let keys: Vec<_> = docs.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["docs/", "docs/x"]);
        assert_eq!(docs.common_prefixes, vec!["docs/y/".to_string()]);
    }

    #[tokio::test]
    async fn test_multipart_assembles_parts_in_order() {
        let server = server();
        let client = server.client("AKIA");
        let id = client.create_multipart("media", "big").await.unwrap();
        let e2 = client.upload_part("media", "big", &id, 2, Bytes::from_static(b"world")).await.unwrap();
        let e1 = client.upload_part("media", "big", &id, 1, Bytes::from_static(b"hello ")).await.unwrap();
        let parts = vec![
            CompletedPart { part_number: 1, etag: e1 },
            CompletedPart { part_number: 2, etag: e2 },
        ];
        client.complete_multipart("media", "big", &id, parts, None).await.unwrap();

        assert_eq!(server.object("media", "big").unwrap().as_ref(), b"hello world");
        assert_eq!(server.open_uploads(), 0);
    }
}
