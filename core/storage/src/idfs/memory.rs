//! In-memory ID-addressed server for tests and local development.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::api::{IdApi, IdApiError, IdItem, IdResult, ItemPage, RangeAck};
use crate::faults::FaultPlan;
use crate::io::ByteStream;

const ROOT_ID: &str = "root";
const STREAM_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone)]
struct StoredItem {
    name: String,
    parent: Option<String>,
    is_folder: bool,
    data: Bytes,
    version: u64,
    modified: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct PendingUpload {
    parent: String,
    name: String,
    existing: Option<String>,
    total: u64,
    received: Vec<u8>,
    modified: Option<DateTime<Utc>>,
    done: Option<IdItem>,
}

#[derive(Debug)]
struct ServerState {
    items: HashMap<String, StoredItem>,
    uploads: HashMap<String, PendingUpload>,
    token: String,
    expired: bool,
    next_version: u64,
    /// Cap on bytes accepted per range request, to simulate partial acks.
    range_cap: Option<u64>,
}

impl ServerState {
    fn item(&self, id: &str) -> IdResult<IdItem> {
        let stored = self
            .items
            .get(id)
            .ok_or_else(|| IdApiError::status(404, format!("File not found: {}", id)))?;
        Ok(Self::to_item(id, stored))
    }

    fn to_item(id: &str, stored: &StoredItem) -> IdItem {
        IdItem {
            id: id.to_string(),
            name: stored.name.clone(),
            is_folder: stored.is_folder,
            size: (!stored.is_folder).then(|| stored.data.len() as u64),
            parents: stored.parent.iter().cloned().collect(),
            etag: (!stored.is_folder).then(|| format!("\"{}\"", stored.version)),
            modified_time: stored.modified,
        }
    }

    fn require_folder(&self, id: &str) -> IdResult<()> {
        match self.items.get(id) {
            Some(item) if item.is_folder => Ok(()),
            Some(_) => Err(IdApiError::with_reason(400, "notAFolder", id.to_string())),
            None => Err(IdApiError::status(404, format!("File not found: {}", id))),
        }
    }

    fn child(&self, parent: &str, name: &str) -> Option<(&String, &StoredItem)> {
        self.items
            .iter()
            .filter(|(_, item)| item.parent.as_deref() == Some(parent) && item.name == name)
            .min_by(|a, b| a.0.cmp(b.0))
    }

    fn descendants(&self, id: &str) -> Vec<String> {
        let mut found = vec![id.to_string()];
        let mut i = 0;
        while i < found.len() {
            let current = found[i].clone();
            found.extend(
                self.items
                    .iter()
                    .filter(|(_, item)| item.parent.as_deref() == Some(current.as_str()))
                    .map(|(child, _)| child.clone()),
            );
            i += 1;
        }
        found
    }

    fn write_content(
        &mut self,
        parent: &str,
        name: &str,
        existing: Option<&str>,
        data: Bytes,
        modified: Option<DateTime<Utc>>,
    ) -> IdResult<IdItem> {
        self.require_folder(parent)?;
        self.next_version += 1;
        let version = self.next_version;
        let modified = Some(modified.unwrap_or_else(Utc::now));

        let id = match existing {
            Some(id) => {
                let stored = self
                    .items
                    .get_mut(id)
                    .filter(|s| !s.is_folder)
                    .ok_or_else(|| IdApiError::status(404, format!("File not found: {}", id)))?;
                stored.data = data;
                stored.version = version;
                stored.modified = modified;
                id.to_string()
            }
            None => {
                if self.child(parent, name).is_some() {
                    return Err(IdApiError::with_reason(409, "duplicate", name.to_string()));
                }
                let id = Uuid::new_v4().simple().to_string();
                self.items.insert(
                    id.clone(),
                    StoredItem {
                        name: name.to_string(),
                        parent: Some(parent.to_string()),
                        is_folder: false,
                        data,
                        version,
                        modified,
                    },
                );
                id
            }
        };
        self.item(&id)
    }
}

/// Simulated ID-addressed remote.
#[derive(Debug)]
pub struct MemoryIdServer {
    account: String,
    state: Mutex<ServerState>,
    faults: FaultPlan<IdApiError>,
    bytes_received: AtomicU64,
}

impl MemoryIdServer {
    pub fn new(account: impl Into<String>, token: impl Into<String>) -> Arc<Self> {
        let mut items = HashMap::new();
        items.insert(
            ROOT_ID.to_string(),
            StoredItem {
                name: String::new(),
                parent: None,
                is_folder: true,
                data: Bytes::new(),
                version: 0,
                modified: None,
            },
        );
        Arc::new(Self {
            account: account.into(),
            state: Mutex::new(ServerState {
                items,
                uploads: HashMap::new(),
                token: token.into(),
                expired: false,
                next_version: 0,
                range_cap: None,
            }),
            faults: FaultPlan::new(),
            bytes_received: AtomicU64::new(0),
        })
    }

    pub fn client(self: &Arc<Self>, token: impl Into<String>) -> MemoryIdClient {
        MemoryIdClient {
            server: self.clone(),
            token: token.into(),
        }
    }

    pub fn faults(&self) -> &FaultPlan<IdApiError> {
        &self.faults
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::SeqCst)
    }

    pub fn set_token(&self, token: impl Into<String>) {
        let mut state = self.lock();
        state.token = token.into();
        state.expired = false;
    }

    pub fn expire_token(&self) {
        self.lock().expired = true;
    }

    /// Accept at most `cap` bytes per range request.
    pub fn cap_ranges(&self, cap: Option<u64>) {
        self.lock().range_cap = cap;
    }

    /// Content of the file at `path`, resolved by walking names from the root.
    pub fn file_content(&self, path: &str) -> Option<Bytes> {
        let state = self.lock();
        let id = Self::walk(&state, path)?;
        state.items.get(&id).filter(|i| !i.is_folder).map(|i| i.data.clone())
    }

    /// Whether anything exists at `path`.
    pub fn contains(&self, path: &str) -> bool {
        Self::walk(&self.lock(), path).is_some()
    }

    /// Rename an item behind the adapter's back, by path.
    pub fn rename_behind(&self, path: &str, new_name: &str) -> bool {
        let mut state = self.lock();
        match Self::walk(&state, path) {
            Some(id) => state
                .items
                .get_mut(&id)
                .map(|item| item.name = new_name.to_string())
                .is_some(),
            None => false,
        }
    }

    pub fn item_count(&self) -> usize {
        self.lock().items.len()
    }

    fn walk(state: &ServerState, path: &str) -> Option<String> {
        let mut current = ROOT_ID.to_string();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = state.child(&current, segment)?.0.clone();
        }
        Some(current)
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn authorize(&self, token: &str, op: &'static str) -> IdResult<MutexGuard<'_, ServerState>> {
        let state = self.lock();
        if state.token != token {
            return Err(IdApiError::with_reason(400, "invalid_grant", "Token has been revoked"));
        }
        if state.expired {
            return Err(IdApiError::with_reason(401, "authError", "Invalid Credentials"));
        }
        self.faults.check(op)?;
        Ok(state)
    }
}

/// Client bound to one [`MemoryIdServer`] and token.
#[derive(Debug, Clone)]
pub struct MemoryIdClient {
    server: Arc<MemoryIdServer>,
    token: String,
}

impl MemoryIdClient {
    fn state(&self, op: &'static str) -> IdResult<MutexGuard<'_, ServerState>> {
        self.server.authorize(&self.token, op)
    }

    fn received(&self, len: usize) {
        self.server
            .bytes_received
            .fetch_add(len as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl IdApi for MemoryIdClient {
    async fn about(&self) -> IdResult<String> {
        drop(self.state("about")?);
        Ok(self.server.account.clone())
    }

    async fn root_id(&self) -> IdResult<String> {
        drop(self.state("root_id")?);
        Ok(ROOT_ID.to_string())
    }

    async fn get_item(&self, id: &str) -> IdResult<IdItem> {
        self.state("get_item")?.item(id)
    }

    async fn find_child(&self, parent_id: &str, name: &str) -> IdResult<Option<IdItem>> {
        let state = self.state("find_child")?;
        state.require_folder(parent_id)?;
        Ok(state
            .child(parent_id, name)
            .map(|(id, stored)| ServerState::to_item(id, stored)))
    }

    async fn list_children(
        &self,
        parent_id: &str,
        page_token: Option<&str>,
        page_size: usize,
    ) -> IdResult<ItemPage> {
        let state = self.state("list_children")?;
        state.require_folder(parent_id)?;

        let mut children: Vec<IdItem> = state
            .items
            .iter()
            .filter(|(_, item)| item.parent.as_deref() == Some(parent_id))
            .map(|(id, stored)| ServerState::to_item(id, stored))
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

        let start = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| IdApiError::with_reason(400, "invalidPageToken", token.to_string()))?,
            None => 0,
        };
        let end = (start + page_size.max(1)).min(children.len());
        let items = children.get(start..end).map(<[IdItem]>::to_vec).unwrap_or_default();
        Ok(ItemPage {
            items,
            next_page_token: (end < children.len()).then(|| end.to_string()),
        })
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> IdResult<IdItem> {
        let mut state = self.state("create_folder")?;
        state.require_folder(parent_id)?;
        if state.child(parent_id, name).is_some() {
            return Err(IdApiError::with_reason(409, "duplicate", name.to_string()));
        }
        let id = Uuid::new_v4().simple().to_string();
        state.items.insert(
            id.clone(),
            StoredItem {
                name: name.to_string(),
                parent: Some(parent_id.to_string()),
                is_folder: true,
                data: Bytes::new(),
                version: 0,
                modified: Some(Utc::now()),
            },
        );
        state.item(&id)
    }

    async fn move_item(
        &self,
        id: &str,
        from_parent: &str,
        to_parent: &str,
        new_name: &str,
    ) -> IdResult<IdItem> {
        let mut state = self.state("move_item")?;
        state.require_folder(to_parent)?;
        let current_parent = state.item(id)?.parents.first().cloned();
        if current_parent.as_deref() != Some(from_parent) {
            return Err(IdApiError::with_reason(400, "parentMismatch", id.to_string()));
        }
        if state.descendants(id).iter().any(|d| d == to_parent) {
            return Err(IdApiError::with_reason(403, "cannotMoveIntoDescendant", id.to_string()));
        }
        if let Some((other, _)) = state.child(to_parent, new_name) {
            if other != id {
                return Err(IdApiError::with_reason(409, "duplicate", new_name.to_string()));
            }
        }
        if let Some(item) = state.items.get_mut(id) {
            item.parent = Some(to_parent.to_string());
            item.name = new_name.to_string();
        }
        state.item(id)
    }

    async fn delete_item(&self, id: &str) -> IdResult<()> {
        let mut state = self.state("delete_item")?;
        if id == ROOT_ID {
            return Err(IdApiError::with_reason(403, "cannotDeleteRoot", id.to_string()));
        }
        state.item(id)?;
        for victim in state.descendants(id) {
            state.items.remove(&victim);
        }
        Ok(())
    }

    async fn upload_simple(
        &self,
        parent_id: &str,
        name: &str,
        existing_id: Option<&str>,
        data: Bytes,
        modified: Option<DateTime<Utc>>,
    ) -> IdResult<IdItem> {
        let mut state = self.state("upload_simple")?;
        let len = data.len();
        let item = state.write_content(parent_id, name, existing_id, data, modified)?;
        self.received(len);
        Ok(item)
    }

    async fn start_resumable(
        &self,
        parent_id: &str,
        name: &str,
        existing_id: Option<&str>,
        total: u64,
        modified: Option<DateTime<Utc>>,
    ) -> IdResult<String> {
        let mut state = self.state("start_resumable")?;
        state.require_folder(parent_id)?;
        let url = format!("memory://upload/{}", Uuid::new_v4().simple());
        state.uploads.insert(
            url.clone(),
            PendingUpload {
                parent: parent_id.to_string(),
                name: name.to_string(),
                existing: existing_id.map(str::to_string),
                total,
                received: Vec::new(),
                modified,
                done: None,
            },
        );
        Ok(url)
    }

    async fn upload_range(&self, url: &str, offset: u64, data: Bytes, total: u64) -> IdResult<RangeAck> {
        let mut state = self.state("upload_range")?;
        let cap = state.range_cap;
        let upload = state
            .uploads
            .get_mut(url)
            .ok_or_else(|| IdApiError::status(404, "Upload session expired"))?;
        if let Some(item) = &upload.done {
            return Ok(RangeAck::Complete(item.clone()));
        }
        if total != upload.total {
            return Err(IdApiError::status(400, "Content-Range total mismatch"));
        }
        let held = upload.received.len() as u64;
        if offset != held {
            // Servers answer a misplaced range with how much they hold.
            return Ok(RangeAck::Incomplete { received: held });
        }
        let accepted = cap.map(|c| c.min(data.len() as u64)).unwrap_or(data.len() as u64) as usize;
        upload.received.extend_from_slice(&data[..accepted]);
        self.received(accepted);

        let held = upload.received.len() as u64;
        if held < upload.total {
            return Ok(RangeAck::Incomplete { received: held });
        }

        let parent = upload.parent.clone();
        let name = upload.name.clone();
        let existing = upload.existing.clone();
        let modified = upload.modified;
        let content = Bytes::from(std::mem::take(&mut upload.received));
        let item = state.write_content(&parent, &name, existing.as_deref(), content, modified)?;
        if let Some(upload) = state.uploads.get_mut(url) {
            upload.done = Some(item.clone());
        }
        Ok(RangeAck::Complete(item))
    }

    async fn query_upload(&self, url: &str, _total: u64) -> IdResult<RangeAck> {
        let state = self.state("query_upload")?;
        let upload = state
            .uploads
            .get(url)
            .ok_or_else(|| IdApiError::status(404, "Upload session expired"))?;
        Ok(match &upload.done {
            Some(item) => RangeAck::Complete(item.clone()),
            None => RangeAck::Incomplete {
                received: upload.received.len() as u64,
            },
        })
    }

    async fn download_range(&self, id: &str, offset: u64, len: u64) -> IdResult<Bytes> {
        let state = self.state("download_range")?;
        let stored = state
            .items
            .get(id)
            .filter(|i| !i.is_folder)
            .ok_or_else(|| IdApiError::status(404, format!("File not found: {}", id)))?;
        let size = stored.data.len() as u64;
        if offset > size {
            return Err(IdApiError::status(416, "Requested range not satisfiable"));
        }
        let end = (offset + len).min(size);
        Ok(stored.data.slice(offset as usize..end as usize))
    }

    async fn download(&self, id: &str) -> IdResult<ByteStream<IdApiError>> {
        let state = self.state("download")?;
        let data = state
            .items
            .get(id)
            .filter(|i| !i.is_folder)
            .map(|i| i.data.clone())
            .ok_or_else(|| IdApiError::status(404, format!("File not found: {}", id)))?;
        let chunks: Vec<IdResult<Bytes>> = (0..data.len())
            .step_by(STREAM_CHUNK)
            .map(|start| Ok(data.slice(start..(start + STREAM_CHUNK).min(data.len()))))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resumable_partial_ack() {
        let server = MemoryIdServer::new("bob@example.com", "t");
        let client = server.client("t");
        server.cap_ranges(Some(3));

        let url = client.start_resumable("root", "f.bin", None, 8, None).await.unwrap();
        let ack = client
            .upload_range(&url, 0, Bytes::from_static(b"abcd"), 8)
            .await
            .unwrap();
        assert_eq!(ack, RangeAck::Incomplete { received: 3 });

        server.cap_ranges(None);
        let ack = client
            .upload_range(&url, 3, Bytes::from_static(b"defgh"), 8)
            .await
            .unwrap();
        assert!(matches!(ack, RangeAck::Complete(_)));
        assert_eq!(server.file_content("/f.bin").unwrap().as_ref(), b"abcdefgh");
    }

    #[tokio::test]
    async fn test_revoked_token() {
        let server = MemoryIdServer::new("bob@example.com", "t");
        let client = server.client("t");
        server.set_token("t2");
        let err = client.about().await.unwrap_err();
        assert_eq!(err.reason(), Some("invalid_grant"));
    }

    #[tokio::test]
    async fn test_delete_removes_descendants() {
        let server = MemoryIdServer::new("bob@example.com", "t");
        let client = server.client("t");
        let folder = client.create_folder("root", "d").await.unwrap();
        client
            .upload_simple(&folder.id, "x", None, Bytes::from_static(b"x"), None)
            .await
            .unwrap();
        assert_eq!(server.item_count(), 3);

        client.delete_item(&folder.id).await.unwrap();
        assert_eq!(server.item_count(), 1);
    }

    #[tokio::test]
    async fn test_list_pages() {
        let server = MemoryIdServer::new("bob@example.com", "t");
        let client = server.client("t");
        for name in ["c", "a", "b"] {
            client.create_folder("root", name).await.unwrap();
        }

        let first = client.list_children("root", None, 2).await.unwrap();
        assert_eq!(first.items.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        let second = client
            .list_children("root", first.next_page_token.as_deref(), 2)
            .await
            .unwrap();
        assert_eq!(second.items.len(), 1);
        assert!(second.next_page_token.is_none());
    }
}
