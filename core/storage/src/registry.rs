//! Adapter registry for dynamic backend resolution.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cloudtree_common::{CloudId, Error, Result};

use crate::adapter::CloudAdapter;
use crate::client::Credential;
use crate::config::StorageConfig;
use crate::content_cache::ContentCache;
use crate::idfs::{IdAdapter, MemoryIdServer};
use crate::local::create_local_adapter;
use crate::object::{MemoryObjectServer, ObjectAdapter};
use crate::pathfs::{MemoryPathServer, PathAdapter};
use crate::scoped::{ScopedAdapter, ScopedConfig};
use crate::transfer::Sleeper;

/// Identity plus backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudDescriptor {
    pub cloud: CloudId,
    #[serde(default)]
    pub config: Value,
    /// Identity a virtual backend is layered on.
    #[serde(default)]
    pub layered_on: Option<CloudId>,
}

impl CloudDescriptor {
    pub fn new(cloud: CloudId, config: Value) -> Self {
        Self {
            cloud,
            config,
            layered_on: None,
        }
    }

    pub fn layered(cloud: CloudId, config: Value, base: CloudId) -> Self {
        Self {
            cloud,
            config,
            layered_on: Some(base),
        }
    }
}

/// Everything a factory may need to build an adapter.
pub struct AdapterContext<'a> {
    pub descriptor: &'a CloudDescriptor,
    pub credential: Option<Credential>,
    pub config: &'a StorageConfig,
    pub content_cache: Option<Arc<ContentCache>>,
    pub sleeper: Arc<dyn Sleeper>,
    /// Adapter of `descriptor.layered_on`, already built.
    pub underlying: Option<Arc<dyn CloudAdapter>>,
}

impl AdapterContext<'_> {
    pub fn cloud(&self) -> &CloudId {
        &self.descriptor.cloud
    }

    /// Credential for the identity, or `WrongCredentials` if none is stored.
    pub fn require_credential(&self) -> Result<Credential> {
        self.credential
            .clone()
            .ok_or_else(|| Error::WrongCredentials(format!("no credential for {}", self.cloud())))
    }

    pub fn require_underlying(&self) -> Result<Arc<dyn CloudAdapter>> {
        self.underlying.clone().ok_or_else(|| {
            Error::InvalidInput(format!("{} must be layered on another identity", self.cloud()))
        })
    }

    /// Parse the descriptor configuration into a typed config.
    pub fn parse_config<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.descriptor.config.clone()).map_err(|e| {
            Error::InvalidInput(format!(
                "Invalid {} config: {}",
                self.cloud().kind(),
                e
            ))
        })
    }
}

/// Factory function type for creating adapters.
pub type AdapterFactory =
    Box<dyn Fn(AdapterContext<'_>) -> Result<Arc<dyn CloudAdapter>> + Send + Sync>;

/// Registry of adapter factories keyed by backend kind.
pub struct AdapterRegistry {
    factories: HashMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory for a backend kind.
    ///
    /// # Preconditions
    /// - `kind` must be unique within the registry
    ///
    /// # Errors
    /// - Returns error if the kind is already registered
    pub fn register(&mut self, kind: impl Into<String>, factory: AdapterFactory) -> Result<()> {
        let kind = kind.into();
        if self.factories.contains_key(&kind) {
            return Err(Error::InvalidInput(format!(
                "Backend kind '{}' is already registered",
                kind
            )));
        }
        self.factories.insert(kind, factory);
        Ok(())
    }

    /// Build the adapter for `context.descriptor`.
    ///
    /// # Errors
    /// - Kind not registered
    /// - Configuration invalid or credential missing
    pub fn create(&self, context: AdapterContext<'_>) -> Result<Arc<dyn CloudAdapter>> {
        let kind = context.cloud().kind().as_str();
        let factory = self.factories.get(kind).ok_or_else(|| {
            Error::InvalidInput(format!("Backend kind '{}' is not registered", kind))
        })?;
        factory(context)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn has_kind(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration of the simulated object store.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectConfig {
    pub bucket: String,
    /// Create the bucket when the simulated account is first seen.
    #[serde(default = "default_true")]
    pub create_bucket: bool,
}

fn default_true() -> bool {
    true
}

/// Simulated remote accounts backing the `path`, `id` and `object` kinds.
///
/// Each account's server is created on first use with the credential
/// presented at that moment as its valid token, and outlives adapter
/// eviction.
#[derive(Debug, Default)]
pub struct Simulators {
    path: Mutex<HashMap<String, Arc<MemoryPathServer>>>,
    id: Mutex<HashMap<String, Arc<MemoryIdServer>>>,
    object: Mutex<HashMap<String, Arc<MemoryObjectServer>>>,
}

fn server_for<S>(
    servers: &Mutex<HashMap<String, Arc<S>>>,
    account: &str,
    create: impl FnOnce() -> Arc<S>,
) -> Arc<S> {
    let mut servers = servers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    servers
        .entry(account.to_string())
        .or_insert_with(create)
        .clone()
}

fn existing<S>(servers: &Mutex<HashMap<String, Arc<S>>>, account: &str) -> Option<Arc<S>> {
    servers
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .get(account)
        .cloned()
}

impl Simulators {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn path_server(&self, account: &str) -> Option<Arc<MemoryPathServer>> {
        existing(&self.path, account)
    }

    pub fn id_server(&self, account: &str) -> Option<Arc<MemoryIdServer>> {
        existing(&self.id, account)
    }

    pub fn object_server(&self, account: &str) -> Option<Arc<MemoryObjectServer>> {
        existing(&self.object, account)
    }

    fn path_adapter(&self, context: AdapterContext<'_>) -> Result<Arc<dyn CloudAdapter>> {
        let token = context.require_credential()?;
        let account = context.cloud().account();
        let server = server_for(&self.path, account, || {
            MemoryPathServer::new(account, token.as_str())
        });
        Ok(Arc::new(PathAdapter::new(
            context.cloud().clone(),
            move || Ok(server.client(token.as_str())),
            context.config.clone(),
            context.content_cache,
            context.sleeper,
        )))
    }

    fn id_adapter(&self, context: AdapterContext<'_>) -> Result<Arc<dyn CloudAdapter>> {
        let token = context.require_credential()?;
        let account = context.cloud().account();
        let server = server_for(&self.id, account, || {
            MemoryIdServer::new(account, token.as_str())
        });
        Ok(Arc::new(IdAdapter::new(
            context.cloud().clone(),
            move || Ok(server.client(token.as_str())),
            context.config.clone(),
            context.content_cache,
            context.sleeper,
        )))
    }

    fn object_adapter(&self, context: AdapterContext<'_>) -> Result<Arc<dyn CloudAdapter>> {
        let config: ObjectConfig = context.parse_config()?;
        let key = context.require_credential()?;
        let account = context.cloud().account();
        let server = server_for(&self.object, account, || {
            let server = MemoryObjectServer::new(account, key.as_str());
            if config.create_bucket {
                server.create_bucket(&config.bucket);
            }
            server
        });
        Ok(Arc::new(ObjectAdapter::new(
            context.cloud().clone(),
            config.bucket,
            move || Ok(server.client(key.as_str())),
            context.config.clone(),
            context.content_cache,
            context.sleeper,
        )))
    }
}

/// Registry with the `local` and `scoped` kinds plus simulators for `path`,
/// `id` and `object` backed by `simulators`.
pub fn create_registry_with(simulators: Arc<Simulators>) -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();

    registry
        .register(
            "local",
            Box::new(|context| {
                let adapter = create_local_adapter(
                    context.cloud().clone(),
                    context.descriptor.config.clone(),
                    context.config,
                    context.content_cache,
                )?;
                Ok(Arc::new(adapter))
            }),
        )
        .expect("Failed to register local adapter");

    registry
        .register(
            "scoped",
            Box::new(|context| {
                let config: ScopedConfig = context.parse_config()?;
                let base = context.require_underlying()?;
                Ok(Arc::new(ScopedAdapter::new(
                    context.cloud().clone(),
                    base,
                    &config.root,
                )?))
            }),
        )
        .expect("Failed to register scoped adapter");

    let sims = simulators.clone();
    registry
        .register("path", Box::new(move |context| sims.path_adapter(context)))
        .expect("Failed to register path simulator");

    let sims = simulators.clone();
    registry
        .register("id", Box::new(move |context| sims.id_adapter(context)))
        .expect("Failed to register id simulator");

    registry
        .register("object", Box::new(move |context| simulators.object_adapter(context)))
        .expect("Failed to register object simulator");

    registry
}

/// Registry with default backends and a fresh set of simulated accounts.
pub fn create_default_registry() -> AdapterRegistry {
    create_registry_with(Simulators::new())
}
