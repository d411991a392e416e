//! Dispatches operations to the adapter of each node's identity.

use futures::future::{BoxFuture, FutureExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use cloudtree_common::{CloudFile, CloudFolder, CloudId, CloudNode, Error, Result};

use crate::adapter::CloudAdapter;
use crate::client::{AlwaysOnline, Connectivity, CredentialStore};
use crate::config::StorageConfig;
use crate::content_cache::ContentCache;
use crate::io::{DataSink, DataSource};
use crate::progress::ProgressSink;
use crate::registry::{AdapterContext, AdapterRegistry, CloudDescriptor};
use crate::transfer::{Sleeper, TokioSleeper};

fn poisoned(what: &str) -> Error {
    Error::fatal_msg(format!("router {}", what), "lock poisoned")
}

/// Entry point for applications: one adapter per registered identity,
/// created lazily and evicted when its credential stops working.
pub struct CloudRouter {
    registry: AdapterRegistry,
    credentials: Arc<dyn CredentialStore>,
    connectivity: Arc<dyn Connectivity>,
    sleeper: Arc<dyn Sleeper>,
    config: StorageConfig,
    descriptors: RwLock<HashMap<CloudId, CloudDescriptor>>,
    adapters: RwLock<HashMap<CloudId, Arc<dyn CloudAdapter>>>,
    content_caches: tokio::sync::Mutex<HashMap<String, Arc<ContentCache>>>,
}

impl CloudRouter {
    pub fn new(
        registry: AdapterRegistry,
        credentials: Arc<dyn CredentialStore>,
        config: StorageConfig,
    ) -> Self {
        Self {
            registry,
            credentials,
            connectivity: Arc::new(AlwaysOnline),
            sleeper: Arc::new(TokioSleeper),
            config,
            descriptors: RwLock::new(HashMap::new()),
            adapters: RwLock::new(HashMap::new()),
            content_caches: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Make an identity known to the router.
    ///
    /// # Errors
    /// - `InvalidInput` if the kind is not registered, the identity is
    ///   already registered, or a layered identity's base is unknown
    pub fn register_cloud(&self, descriptor: CloudDescriptor) -> Result<()> {
        if !self.registry.has_kind(descriptor.cloud.kind().as_str()) {
            return Err(Error::InvalidInput(format!(
                "Backend kind '{}' is not registered",
                descriptor.cloud.kind()
            )));
        }
        let mut descriptors = self.descriptors.write().map_err(|_| poisoned("descriptors"))?;
        if descriptors.contains_key(&descriptor.cloud) {
            return Err(Error::InvalidInput(format!(
                "{} is already registered",
                descriptor.cloud
            )));
        }
        if let Some(base) = &descriptor.layered_on {
            if !descriptors.contains_key(base) {
                return Err(Error::InvalidInput(format!(
                    "{} is layered on unknown identity {}",
                    descriptor.cloud, base
                )));
            }
        }
        info!("Registered {}", descriptor.cloud);
        descriptors.insert(descriptor.cloud.clone(), descriptor);
        Ok(())
    }

    /// Forget an identity and drop its adapter and the adapters layered on it.
    pub fn forget_cloud(&self, cloud: &CloudId) -> Result<()> {
        self.evict_with_dependents(cloud);
        self.descriptors
            .write()
            .map_err(|_| poisoned("descriptors"))?
            .remove(cloud)
            .map(|_| ())
            .ok_or_else(|| Error::InvalidInput(format!("{} is not registered", cloud)))
    }

    pub fn clouds(&self) -> Vec<CloudId> {
        let mut clouds: Vec<CloudId> = self
            .descriptors
            .read()
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default();
        clouds.sort();
        clouds
    }

    /// The stored credential for `cloud` changed; rebuild on next use.
    ///
    /// Layered identities built on `cloud` are rebuilt too.
    pub fn credential_updated(&self, cloud: &CloudId) {
        debug!("Credential of {} updated", cloud);
        self.evict_with_dependents(cloud);
    }

    /// Whether an adapter instance is currently cached for `cloud`.
    pub fn is_loaded(&self, cloud: &CloudId) -> bool {
        self.adapters
            .read()
            .map(|a| a.contains_key(cloud))
            .unwrap_or(false)
    }

    fn descriptor(&self, cloud: &CloudId) -> Result<CloudDescriptor> {
        self.descriptors
            .read()
            .map_err(|_| poisoned("descriptors"))?
            .get(cloud)
            .cloned()
            .ok_or_else(|| Error::InvalidInput(format!("{} is not registered", cloud)))
    }

    async fn content_cache(&self, kind: &str) -> Option<Arc<ContentCache>> {
        let dir = self.config.content_cache_dir.as_ref()?;
        let mut caches = self.content_caches.lock().await;
        if let Some(cache) = caches.get(kind) {
            return Some(cache.clone());
        }
        match ContentCache::for_kind(dir, kind, self.config.content_cache_capacity).await {
            Ok(cache) => {
                let cache = Arc::new(cache);
                caches.insert(kind.to_string(), cache.clone());
                Some(cache)
            }
            Err(e) => {
                warn!("Content cache for {} unavailable, reading from network: {}", kind, e);
                None
            }
        }
    }

    /// Adapter for `cloud`, built on first use.
    ///
    /// Layered identities build their base first.
    pub fn adapter<'a>(&'a self, cloud: &'a CloudId) -> BoxFuture<'a, Result<Arc<dyn CloudAdapter>>> {
        async move {
            let cached = self
                .adapters
                .read()
                .map_err(|_| poisoned("adapters"))?
                .get(cloud)
                .cloned();
            if let Some(adapter) = cached {
                return Ok(adapter);
            }

            let descriptor = self.descriptor(cloud)?;
            let underlying = match &descriptor.layered_on {
                Some(base) => Some(self.adapter(base).await?),
                None => None,
            };
            let context = AdapterContext {
                descriptor: &descriptor,
                credential: self.credentials.credential(cloud)?,
                config: &self.config,
                content_cache: self.content_cache(cloud.kind().as_str()).await,
                sleeper: self.sleeper.clone(),
                underlying,
            };
            let created = self.registry.create(context)?;
            debug!("Created adapter for {}", cloud);

            let mut adapters = self.adapters.write().map_err(|_| poisoned("adapters"))?;
            Ok(adapters.entry(cloud.clone()).or_insert(created).clone())
        }
        .boxed()
    }

    /// Adapter for `cloud` after the connectivity precheck.
    async fn online_adapter(&self, cloud: &CloudId) -> Result<Arc<dyn CloudAdapter>> {
        let adapter = self.adapter(cloud).await?;
        if adapter.requires_network() && !self.connectivity.is_online() {
            return Err(Error::NetworkUnavailable(cloud.to_string()));
        }
        Ok(adapter)
    }

    /// Identities layered, directly or not, on `cloud`.
    fn dependents(&self, cloud: &CloudId) -> Vec<CloudId> {
        let Ok(descriptors) = self.descriptors.read() else {
            return Vec::new();
        };
        let mut found: HashSet<CloudId> = HashSet::new();
        let mut frontier = vec![cloud.clone()];
        while let Some(current) = frontier.pop() {
            for descriptor in descriptors.values() {
                if descriptor.layered_on.as_ref() == Some(&current) && found.insert(descriptor.cloud.clone()) {
                    frontier.push(descriptor.cloud.clone());
                }
            }
        }
        found.into_iter().collect()
    }

    /// Identities `cloud` is layered on, nearest first.
    fn bases(&self, cloud: &CloudId) -> Vec<CloudId> {
        let Ok(descriptors) = self.descriptors.read() else {
            return Vec::new();
        };
        let mut bases = Vec::new();
        let mut current = descriptors.get(cloud).and_then(|d| d.layered_on.clone());
        while let Some(base) = current {
            if base == *cloud || bases.contains(&base) {
                break;
            }
            current = descriptors.get(&base).and_then(|d| d.layered_on.clone());
            bases.push(base);
        }
        bases
    }

    fn evict(&self, clouds: &[CloudId]) {
        if let Ok(mut adapters) = self.adapters.write() {
            for cloud in clouds {
                if adapters.remove(cloud).is_some() {
                    debug!("Evicted adapter for {}", cloud);
                }
            }
        }
    }

    fn evict_with_dependents(&self, cloud: &CloudId) {
        let mut clouds = self.dependents(cloud);
        clouds.push(cloud.clone());
        self.evict(&clouds);
    }

    /// Evict on authentication failure, then hand the result back.
    fn guard<T>(&self, cloud: &CloudId, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_authentication() {
                warn!("Authentication failed for {}: {}", cloud, e);
                let bases = self.bases(cloud);
                let mut clouds = self.dependents(cloud);
                clouds.push(cloud.clone());
                for base in &bases {
                    clouds.extend(self.dependents(base));
                }
                clouds.extend(bases.iter().cloned());
                self.evict(&clouds);

                if e.invalidates_credential() {
                    self.credentials.invalidate(cloud);
                    for base in &bases {
                        self.credentials.invalidate(base);
                    }
                }
            }
        }
        result
    }

    pub async fn root(&self, cloud: &CloudId) -> Result<CloudFolder> {
        Ok(self.adapter(cloud).await?.root())
    }

    pub async fn resolve(&self, cloud: &CloudId, path: &str) -> Result<CloudFolder> {
        self.adapter(cloud).await?.resolve(path)
    }

    pub async fn file(&self, parent: &CloudFolder, name: &str, size: Option<u64>) -> Result<CloudFile> {
        self.adapter(parent.cloud()).await?.file(parent, name, size)
    }

    pub async fn folder(&self, parent: &CloudFolder, name: &str) -> Result<CloudFolder> {
        self.adapter(parent.cloud()).await?.folder(parent, name)
    }

    pub async fn exists(&self, node: &CloudNode) -> Result<bool> {
        let adapter = self.online_adapter(node.cloud()).await?;
        self.guard(node.cloud(), adapter.exists(node).await)
    }

    pub async fn list(&self, folder: &CloudFolder) -> Result<Vec<CloudNode>> {
        let adapter = self.online_adapter(folder.cloud()).await?;
        self.guard(folder.cloud(), adapter.list(folder).await)
    }

    pub async fn create(&self, folder: &CloudFolder) -> Result<CloudFolder> {
        let adapter = self.online_adapter(folder.cloud()).await?;
        self.guard(folder.cloud(), adapter.create(folder).await)
    }

    /// Move or rename within one identity.
    ///
    /// # Errors
    /// - `InvalidInput` if `source` and `target` belong to different identities
    pub async fn move_node(&self, source: &CloudNode, target: &CloudNode) -> Result<CloudNode> {
        if source.cloud() != target.cloud() {
            return Err(Error::InvalidInput(format!(
                "cannot move {} from {} to {}",
                source.path(),
                source.cloud(),
                target.cloud()
            )));
        }
        let adapter = self.online_adapter(source.cloud()).await?;
        self.guard(source.cloud(), adapter.move_node(source, target).await)
    }

    pub async fn write(
        &self,
        file: &CloudFile,
        data: &dyn DataSource,
        progress: &dyn ProgressSink,
        replace: bool,
        size: u64,
    ) -> Result<CloudFile> {
        let adapter = self.online_adapter(file.cloud()).await?;
        self.guard(
            file.cloud(),
            adapter.write(file, data, progress, replace, size).await,
        )
    }

    pub async fn read(
        &self,
        file: &CloudFile,
        dest: &mut DataSink,
        progress: &dyn ProgressSink,
    ) -> Result<()> {
        let adapter = self.online_adapter(file.cloud()).await?;
        self.guard(file.cloud(), adapter.read(file, dest, progress).await)
    }

    pub async fn delete(&self, node: &CloudNode) -> Result<()> {
        let adapter = self.online_adapter(node.cloud()).await?;
        self.guard(node.cloud(), adapter.delete(node).await)
    }

    pub async fn check_authentication(&self, cloud: &CloudId) -> Result<String> {
        let adapter = self.online_adapter(cloud).await?;
        self.guard(cloud, adapter.check_authentication().await)
    }

    /// Drop the identity's native client and every adapter layered on it.
    pub async fn logout(&self, cloud: &CloudId) -> Result<()> {
        let adapter = self.adapter(cloud).await?;
        adapter.logout().await?;
        self.evict(&self.dependents(cloud));
        info!("Logged out of {}", cloud);
        Ok(())
    }
}
