//! Path to native identifier cache for ID-addressed backends.

use moka::policy::EvictionPolicy;
use moka::sync::Cache;

use cloudtree_common::types::is_descendant;

/// What a path resolved to on the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionEntry {
    pub native_id: String,
    /// Identifier of the containing folder, if known.
    pub container_id: Option<String>,
    pub is_folder: bool,
    /// Change tag of the remote item (etag, revision), if known.
    pub revision: Option<String>,
}

impl ResolutionEntry {
    pub fn folder(native_id: impl Into<String>, container_id: Option<String>) -> Self {
        Self {
            native_id: native_id.into(),
            container_id,
            is_folder: true,
            revision: None,
        }
    }

    pub fn file(
        native_id: impl Into<String>,
        container_id: Option<String>,
        revision: Option<String>,
    ) -> Self {
        Self {
            native_id: native_id.into(),
            container_id,
            is_folder: false,
            revision,
        }
    }
}

/// Bounded LRU map from logical path to [`ResolutionEntry`].
///
/// Safe to share between tasks; each adapter owns one.
#[derive(Clone)]
pub struct ResolutionCache {
    entries: Cache<String, ResolutionEntry>,
}

impl ResolutionCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(capacity)
                .eviction_policy(EvictionPolicy::lru())
                .build(),
        }
    }

    pub fn get(&self, path: &str) -> Option<ResolutionEntry> {
        self.entries.get(path)
    }

    /// Entry for `path` if it has the expected kind.
    ///
    /// A kind mismatch means the remote changed under us; the stale entry is
    /// dropped.
    pub fn get_expecting(&self, path: &str, is_folder: bool) -> Option<ResolutionEntry> {
        let entry = self.entries.get(path)?;
        if entry.is_folder != is_folder {
            self.entries.invalidate(path);
            return None;
        }
        Some(entry)
    }

    pub fn put(&self, path: &str, entry: ResolutionEntry) {
        self.entries.insert(path.to_string(), entry);
    }

    /// Drop `path` and everything below it.
    pub fn remove(&self, path: &str) {
        self.entries.invalidate(path);
        self.remove_children_of(path);
    }

    /// Drop everything below `path`, keeping `path` itself.
    pub fn remove_children_of(&self, path: &str) {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(key, _)| is_descendant(key.as_str(), path))
            .map(|(key, _)| key.as_ref().clone())
            .collect();
        for key in stale {
            self.entries.invalidate(&key);
        }
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
    }

    /// Approximate number of entries.
    pub fn len(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
