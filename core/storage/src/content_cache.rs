//! LRU disk cache of downloaded content.
//!
//! Entries are keyed by a revision fingerprint supplied by the adapter
//! (native id plus change tag, or a content hash), so a changed remote file
//! simply misses. Each entry file starts with a BLAKE2s digest of the
//! content; a digest mismatch is reported as an unreadable entry.
//!
//! Writes go to a temporary file that is renamed into place on commit, so a
//! reader never observes a partially written entry.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use blake2::{Blake2s256, Digest};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use cloudtree_common::{Error, Result};

const DIGEST_LEN: usize = 32;
const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug)]
struct IndexEntry {
    size: u64,
    last_used: u64,
}

#[derive(Debug, Default)]
struct CacheIndex {
    entries: HashMap<String, IndexEntry>,
    total: u64,
    tick: u64,
}

impl CacheIndex {
    fn touch(&mut self, name: &str) {
        self.tick += 1;
        if let Some(entry) = self.entries.get_mut(name) {
            entry.last_used = self.tick;
        }
    }

    fn insert(&mut self, name: String, size: u64) {
        self.tick += 1;
        if let Some(old) = self.entries.insert(
            name,
            IndexEntry {
                size,
                last_used: self.tick,
            },
        ) {
            self.total -= old.size;
        }
        self.total += size;
    }

    fn remove(&mut self, name: &str) -> Option<IndexEntry> {
        let removed = self.entries.remove(name);
        if let Some(entry) = &removed {
            self.total -= entry.size;
        }
        removed
    }

    /// Pop least-recently-used entries until `total <= capacity`.
    fn evict_to(&mut self, capacity: u64) -> Vec<String> {
        let mut victims = Vec::new();
        while self.total > capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(name, _)| name.clone());
            match oldest {
                Some(name) => {
                    self.remove(&name);
                    victims.push(name);
                }
                None => break,
            }
        }
        victims
    }
}

/// One content cache store.
#[derive(Debug)]
pub struct ContentCache {
    dir: PathBuf,
    capacity: u64,
    index: Mutex<CacheIndex>,
}

impl ContentCache {
    /// Open (or create) a store in `dir` holding at most `capacity` bytes.
    ///
    /// Leftover temporary files from interrupted writes are removed and the
    /// index is rebuilt from the remaining entries, oldest first.
    pub async fn open(dir: impl AsRef<Path>, capacity: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;

        let mut found = Vec::new();
        let mut read_dir = fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            if name.ends_with(TMP_SUFFIX) {
                let _ = fs::remove_file(entry.path()).await;
                continue;
            }
            let modified = meta.modified().ok();
            found.push((modified, name, meta.len().saturating_sub(DIGEST_LEN as u64)));
        }
        found.sort_by_key(|(modified, _, _)| *modified);

        let mut index = CacheIndex::default();
        for (_, name, size) in found {
            index.insert(name, size);
        }
        debug!(
            "Opened content cache {} with {} entries ({} bytes)",
            dir.display(),
            index.entries.len(),
            index.total
        );

        let cache = Self {
            dir,
            capacity,
            index: Mutex::new(index),
        };
        cache.evict().await;
        Ok(cache)
    }

    /// Open the store for one backend kind below `base`.
    pub async fn for_kind(base: impl AsRef<Path>, kind: &str, capacity: u64) -> Result<Self> {
        Self::open(base.as_ref().join(kind), capacity).await
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Total bytes of content currently indexed.
    pub fn total_size(&self) -> u64 {
        self.index.lock().map(|i| i.total).unwrap_or(0)
    }

    pub fn contains(&self, key: &str) -> bool {
        let name = Self::file_name(key);
        self.index
            .lock()
            .map(|i| i.entries.contains_key(&name))
            .unwrap_or(false)
    }

    /// Path of the entry file for `key`, whether or not it exists.
    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(Self::file_name(key))
    }

    fn file_name(key: &str) -> String {
        URL_SAFE_NO_PAD.encode(Blake2s256::digest(key.as_bytes()))
    }

    /// Cached content for `key`.
    ///
    /// `Ok(None)` is a miss. An error means the entry exists but could not be
    /// read or failed its integrity check; the entry is dropped in that case.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let name = Self::file_name(key);
        let indexed = self
            .index
            .lock()
            .map(|i| i.entries.contains_key(&name))
            .unwrap_or(false);
        if !indexed {
            return Ok(None);
        }

        let path = self.dir.join(&name);
        let result = match fs::read(&path).await {
            Ok(raw) => Self::verify(raw),
            Err(e) => Err(Error::Io(e)),
        };

        match result {
            Ok(content) => {
                if let Ok(mut index) = self.index.lock() {
                    index.touch(&name);
                }
                Ok(Some(content))
            }
            Err(e) => {
                if let Ok(mut index) = self.index.lock() {
                    index.remove(&name);
                }
                let _ = fs::remove_file(&path).await;
                Err(e)
            }
        }
    }

    fn verify(mut raw: Vec<u8>) -> Result<Vec<u8>> {
        if raw.len() < DIGEST_LEN {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "cache entry truncated",
            )));
        }
        let content = raw.split_off(DIGEST_LEN);
        if Blake2s256::digest(&content).as_slice() != raw.as_slice() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "cache entry digest mismatch",
            )));
        }
        Ok(content)
    }

    /// Start writing a new entry for `key`.
    pub async fn writer(&self, key: &str) -> Result<CacheWriter> {
        let name = Self::file_name(key);
        let tmp_path = self
            .dir
            .join(format!("{}.{}{}", name, Uuid::new_v4().simple(), TMP_SUFFIX));
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&[0u8; DIGEST_LEN]).await?;
        Ok(CacheWriter {
            file: Some(file),
            tmp_path,
            name,
            hasher: Blake2s256::new(),
            len: 0,
        })
    }

    /// Store `content` under `key` in one go.
    pub async fn put(&self, key: &str, content: &[u8]) -> Result<()> {
        let mut writer = self.writer(key).await?;
        writer.write(content).await?;
        writer.commit(self).await
    }

    /// Drop the entry for `key`, if any.
    pub async fn remove(&self, key: &str) -> Result<()> {
        let name = Self::file_name(key);
        let removed = self.index.lock().ok().and_then(|mut i| i.remove(&name));
        if removed.is_some() {
            match fs::remove_file(self.dir.join(&name)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    async fn evict(&self) {
        let victims = match self.index.lock() {
            Ok(mut index) => index.evict_to(self.capacity),
            Err(_) => return,
        };
        for name in victims {
            debug!("Evicting content cache entry {}", name);
            if let Err(e) = fs::remove_file(self.dir.join(&name)).await {
                warn!("Failed to remove evicted cache entry {}: {}", name, e);
            }
        }
    }
}

/// In-progress cache entry.
///
/// Dropping a writer without committing removes its temporary file.
pub struct CacheWriter {
    file: Option<fs::File>,
    tmp_path: PathBuf,
    name: String,
    hasher: Blake2s256,
    len: u64,
}

impl CacheWriter {
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::InvalidInput("cache writer already closed".to_string()))?;
        file.write_all(data).await?;
        self.hasher.update(data);
        self.len += data.len() as u64;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Seal the entry and make it visible.
    pub async fn commit(mut self, cache: &ContentCache) -> Result<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| Error::InvalidInput("cache writer already closed".to_string()))?;
        let digest = std::mem::take(&mut self.hasher).finalize();

        let sealed = async {
            file.seek(std::io::SeekFrom::Start(0)).await?;
            file.write_all(digest.as_slice()).await?;
            file.sync_all().await?;
            drop(file);

            if self.len > cache.capacity {
                debug!("Skipping cache entry larger than capacity ({} bytes)", self.len);
                fs::remove_file(&self.tmp_path).await?;
                return Ok(false);
            }
            fs::rename(&self.tmp_path, cache.dir.join(&self.name)).await?;
            Ok::<_, Error>(true)
        }
        .await;

        match sealed {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e) => {
                let _ = fs::remove_file(&self.tmp_path).await;
                return Err(e);
            }
        }

        if let Ok(mut index) = cache.index.lock() {
            index.insert(self.name.clone(), self.len);
        }
        cache.evict().await;
        Ok(())
    }

    /// Discard the entry.
    pub async fn abort(mut self) {
        self.file.take();
        let _ = fs::remove_file(&self.tmp_path).await;
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}
