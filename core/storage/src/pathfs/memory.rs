//! In-memory path-addressed server for tests and local development.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use cloudtree_common::types::{is_descendant, split_path};

use super::api::{ListPage, PathApi, PathApiError, PathEntry, PathResult, WriteMode};
use crate::faults::FaultPlan;
use crate::io::ByteStream;

const STREAM_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone)]
struct StoredEntry {
    is_folder: bool,
    data: Bytes,
    rev: u64,
    modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct ServerState {
    entries: BTreeMap<String, StoredEntry>,
    sessions: HashMap<String, Vec<u8>>,
    cursors: HashMap<String, (VecDeque<PathEntry>, usize)>,
    token: String,
    expired: bool,
    next_rev: u64,
}

impl ServerState {
    fn entry(&self, path: &str, stored: &StoredEntry) -> PathEntry {
        PathEntry {
            path: path.to_string(),
            is_folder: stored.is_folder,
            size: stored.data.len() as u64,
            rev: (!stored.is_folder).then(|| format!("{:09x}", stored.rev)),
            modified: stored.modified,
        }
    }

    fn is_folder(&self, path: &str) -> bool {
        path.is_empty() || self.entries.get(path).map(|e| e.is_folder).unwrap_or(false)
    }

    fn require_parent(&self, path: &str) -> PathResult<()> {
        let parent = split_path(path).map(|(parent, _)| parent).unwrap_or("");
        if !self.is_folder(parent) {
            return Err(PathApiError::NotFound(parent.to_string()));
        }
        Ok(())
    }

    fn store_file(
        &mut self,
        path: &str,
        data: Bytes,
        mode: WriteMode,
        modified: Option<DateTime<Utc>>,
    ) -> PathResult<PathEntry> {
        self.require_parent(path)?;
        match self.entries.get(path) {
            Some(existing) if existing.is_folder => return Err(PathApiError::Conflict(path.to_string())),
            Some(_) if mode == WriteMode::Add => return Err(PathApiError::Conflict(path.to_string())),
            _ => {}
        }
        self.next_rev += 1;
        let stored = StoredEntry {
            is_folder: false,
            data,
            rev: self.next_rev,
            modified: Some(modified.unwrap_or_else(Utc::now)),
        };
        let entry = self.entry(path, &stored);
        self.entries.insert(path.to_string(), stored);
        Ok(entry)
    }
}

/// Simulated path-addressed remote.
///
/// Shared between clients through `Arc`; a client is only accepted while its
/// token matches the server's current one.
#[derive(Debug)]
pub struct MemoryPathServer {
    account: String,
    state: Mutex<ServerState>,
    faults: FaultPlan<PathApiError>,
    bytes_received: AtomicU64,
}

impl MemoryPathServer {
    pub fn new(account: impl Into<String>, token: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            account: account.into(),
            state: Mutex::new(ServerState {
                token: token.into(),
                ..ServerState::default()
            }),
            faults: FaultPlan::new(),
            bytes_received: AtomicU64::new(0),
        })
    }

    pub fn client(self: &Arc<Self>, token: impl Into<String>) -> MemoryPathClient {
        MemoryPathClient {
            server: self.clone(),
            token: token.into(),
        }
    }

    pub fn faults(&self) -> &FaultPlan<PathApiError> {
        &self.faults
    }

    /// Content bytes accepted by upload calls so far.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::SeqCst)
    }

    /// Rotate the valid token; existing clients start failing.
    pub fn set_token(&self, token: impl Into<String>) {
        let mut state = self.lock();
        state.token = token.into();
        state.expired = false;
    }

    /// Make the current token report as expired.
    pub fn expire_token(&self) {
        self.lock().expired = true;
    }

    pub fn contains(&self, path: &str) -> bool {
        path.is_empty() || self.lock().entries.contains_key(path)
    }

    pub fn file_content(&self, path: &str) -> Option<Bytes> {
        self.lock()
            .entries
            .get(path)
            .filter(|e| !e.is_folder)
            .map(|e| e.data.clone())
    }

    /// Every stored path, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.lock().entries.keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn authorize(&self, token: &str, op: &'static str) -> PathResult<MutexGuard<'_, ServerState>> {
        let state = self.lock();
        if state.token != token {
            return Err(PathApiError::InvalidAccessToken);
        }
        if state.expired {
            return Err(PathApiError::ExpiredAccessToken);
        }
        self.faults.check(op)?;
        Ok(state)
    }
}

/// Client bound to one [`MemoryPathServer`] and token.
#[derive(Debug, Clone)]
pub struct MemoryPathClient {
    server: Arc<MemoryPathServer>,
    token: String,
}

impl MemoryPathClient {
    fn state(&self, op: &'static str) -> PathResult<MutexGuard<'_, ServerState>> {
        self.server.authorize(&self.token, op)
    }

    fn received(&self, len: usize) {
        self.server
            .bytes_received
            .fetch_add(len as u64, Ordering::SeqCst);
    }

    fn page(state: &mut ServerState, mut pending: VecDeque<PathEntry>, limit: usize) -> ListPage {
        let limit = limit.max(1);
        let take = limit.min(pending.len());
        let entries: Vec<PathEntry> = pending.drain(..take).collect();
        if pending.is_empty() {
            return ListPage {
                entries,
                cursor: None,
                has_more: false,
            };
        }
        let cursor = Uuid::new_v4().to_string();
        state.cursors.insert(cursor.clone(), (pending, limit));
        ListPage {
            entries,
            cursor: Some(cursor),
            has_more: true,
        }
    }
}

#[async_trait]
impl PathApi for MemoryPathClient {
    async fn current_account(&self) -> PathResult<String> {
        drop(self.state("current_account")?);
        Ok(self.server.account.clone())
    }

    async fn get_metadata(&self, path: &str) -> PathResult<PathEntry> {
        let state = self.state("get_metadata")?;
        if path.is_empty() {
            return Ok(PathEntry {
                path: String::new(),
                is_folder: true,
                size: 0,
                rev: None,
                modified: None,
            });
        }
        state
            .entries
            .get(path)
            .map(|stored| state.entry(path, stored))
            .ok_or_else(|| PathApiError::NotFound(path.to_string()))
    }

    async fn list_folder(&self, path: &str, limit: usize) -> PathResult<ListPage> {
        let mut state = self.state("list_folder")?;
        if !state.is_folder(path) {
            return Err(PathApiError::NotFound(path.to_string()));
        }
        let children: VecDeque<PathEntry> = state
            .entries
            .iter()
            .filter(|(key, _)| split_path(key).map(|(parent, _)| parent) == Some(path))
            .map(|(key, stored)| state.entry(key, stored))
            .collect();
        Ok(Self::page(&mut state, children, limit))
    }

    async fn list_folder_continue(&self, cursor: &str) -> PathResult<ListPage> {
        let mut state = self.state("list_folder_continue")?;
        let (pending, limit) = state.cursors.remove(cursor).ok_or_else(|| PathApiError::Http {
            status: 409,
            message: format!("reset cursor {}", cursor),
        })?;
        Ok(Self::page(&mut state, pending, limit))
    }

    async fn create_folder(&self, path: &str) -> PathResult<PathEntry> {
        let mut state = self.state("create_folder")?;
        if path.is_empty() || state.entries.contains_key(path) {
            return Err(PathApiError::Conflict(path.to_string()));
        }
        state.require_parent(path)?;
        let stored = StoredEntry {
            is_folder: true,
            data: Bytes::new(),
            rev: 0,
            modified: None,
        };
        let entry = state.entry(path, &stored);
        state.entries.insert(path.to_string(), stored);
        Ok(entry)
    }

    async fn move_entry(&self, from: &str, to: &str) -> PathResult<PathEntry> {
        let mut state = self.state("move_entry")?;
        if from.is_empty() || !state.entries.contains_key(from) {
            return Err(PathApiError::NotFound(from.to_string()));
        }
        if state.entries.contains_key(to) {
            return Err(PathApiError::Conflict(to.to_string()));
        }
        if is_descendant(to, from) {
            return Err(PathApiError::Forbidden(format!("cannot move {} into itself", from)));
        }
        state.require_parent(to)?;

        let moved: Vec<String> = state
            .entries
            .keys()
            .filter(|key| key.as_str() == from || is_descendant(key, from))
            .cloned()
            .collect();
        for key in moved {
            if let Some(stored) = state.entries.remove(&key) {
                let new_key = format!("{}{}", to, &key[from.len()..]);
                state.entries.insert(new_key, stored);
            }
        }
        let stored = state
            .entries
            .get(to)
            .cloned()
            .ok_or_else(|| PathApiError::NotFound(to.to_string()))?;
        Ok(state.entry(to, &stored))
    }

    async fn delete(&self, path: &str) -> PathResult<()> {
        let mut state = self.state("delete")?;
        if path.is_empty() || state.entries.remove(path).is_none() {
            return Err(PathApiError::NotFound(path.to_string()));
        }
        state.entries.retain(|key, _| !is_descendant(key, path));
        Ok(())
    }

    async fn upload(
        &self,
        path: &str,
        data: Bytes,
        mode: WriteMode,
        modified: Option<DateTime<Utc>>,
    ) -> PathResult<PathEntry> {
        let mut state = self.state("upload")?;
        let len = data.len();
        let entry = state.store_file(path, data, mode, modified)?;
        self.received(len);
        Ok(entry)
    }

    async fn upload_session_start(&self, first: Bytes) -> PathResult<String> {
        let mut state = self.state("upload_session_start")?;
        let id = Uuid::new_v4().to_string();
        self.received(first.len());
        state.sessions.insert(id.clone(), first.to_vec());
        Ok(id)
    }

    async fn upload_session_append(&self, session: &str, offset: u64, data: Bytes) -> PathResult<()> {
        let mut state = self.state("upload_session_append")?;
        let buffer = state
            .sessions
            .get_mut(session)
            .ok_or_else(|| PathApiError::NotFound(session.to_string()))?;
        if buffer.len() as u64 != offset {
            return Err(PathApiError::IncorrectOffset {
                correct_offset: buffer.len() as u64,
            });
        }
        buffer.extend_from_slice(&data);
        self.received(data.len());
        Ok(())
    }

    async fn upload_session_finish(
        &self,
        session: &str,
        offset: u64,
        data: Bytes,
        path: &str,
        mode: WriteMode,
        modified: Option<DateTime<Utc>>,
    ) -> PathResult<PathEntry> {
        let mut state = self.state("upload_session_finish")?;
        let received = state
            .sessions
            .get(session)
            .map(|b| b.len() as u64)
            .ok_or_else(|| PathApiError::NotFound(session.to_string()))?;
        if received != offset {
            return Err(PathApiError::IncorrectOffset {
                correct_offset: received,
            });
        }
        let mut content = state.sessions.remove(session).unwrap_or_default();
        content.extend_from_slice(&data);
        self.received(data.len());
        state.store_file(path, Bytes::from(content), mode, modified)
    }

    async fn download(&self, path: &str) -> PathResult<(PathEntry, ByteStream<PathApiError>)> {
        let state = self.state("download")?;
        let stored = state
            .entries
            .get(path)
            .filter(|e| !e.is_folder)
            .ok_or_else(|| PathApiError::NotFound(path.to_string()))?;
        let entry = state.entry(path, stored);
        let data = stored.data.clone();

        let chunks: Vec<PathResult<Bytes>> = (0..data.len())
            .step_by(STREAM_CHUNK)
            .map(|start| Ok(data.slice(start..(start + STREAM_CHUNK).min(data.len()))))
            .collect();
        Ok((entry, Box::pin(futures::stream::iter(chunks))))
    }
}
