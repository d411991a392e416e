//! Native client lifecycle, credentials and connectivity.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use zeroize::Zeroizing;

use cloudtree_common::{CloudId, Error, Result};

/// Secret used to authenticate against a backend.
pub type Credential = Zeroizing<String>;

/// Lazily built native client, discarded on logout.
///
/// The slot is per adapter instance, so two identities never share a client.
pub struct ClientSlot<C> {
    factory: Box<dyn Fn() -> Result<C> + Send + Sync>,
    client: RwLock<Option<Arc<C>>>,
}

impl<C> ClientSlot<C> {
    pub fn new(factory: impl Fn() -> Result<C> + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            client: RwLock::new(None),
        }
    }

    /// Current client, building one if the slot is empty.
    pub fn get(&self) -> Result<Arc<C>> {
        if let Some(client) = self.read()?.as_ref() {
            return Ok(client.clone());
        }

        let mut slot = self
            .client
            .write()
            .map_err(|_| Error::fatal_msg("client slot", "lock poisoned"))?;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        let client = Arc::new((self.factory)()?);
        *slot = Some(client.clone());
        Ok(client)
    }

    /// Drop the current client; the next [`get`](Self::get) builds a new one.
    pub fn clear(&self) {
        if let Ok(mut slot) = self.client.write() {
            *slot = None;
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.read().map(|slot| slot.is_some()).unwrap_or(false)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Option<Arc<C>>>> {
        self.client
            .read()
            .map_err(|_| Error::fatal_msg("client slot", "lock poisoned"))
    }
}

/// Source of the current credential per identity.
///
/// Implementations decrypt on demand; the core never persists the value.
pub trait CredentialStore: Send + Sync {
    fn credential(&self, cloud: &CloudId) -> Result<Option<Credential>>;

    /// Forget the credential after the backend rejected it.
    fn invalidate(&self, cloud: &CloudId);
}

/// Credentials held in process memory.
#[derive(Default)]
pub struct MemoryCredentialStore {
    secrets: RwLock<HashMap<CloudId, Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, cloud: &CloudId, secret: impl Into<String>) {
        if let Ok(mut secrets) = self.secrets.write() {
            secrets.insert(cloud.clone(), Zeroizing::new(secret.into()));
        }
    }

    pub fn contains(&self, cloud: &CloudId) -> bool {
        self.secrets
            .read()
            .map(|s| s.contains_key(cloud))
            .unwrap_or(false)
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn credential(&self, cloud: &CloudId) -> Result<Option<Credential>> {
        let secrets = self
            .secrets
            .read()
            .map_err(|_| Error::fatal_msg("credential store", "lock poisoned"))?;
        Ok(secrets.get(cloud).cloned())
    }

    fn invalidate(&self, cloud: &CloudId) {
        if let Ok(mut secrets) = self.secrets.write() {
            secrets.remove(cloud);
        }
    }
}

/// "Is the network reachable" query run before remote operations.
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// Connectivity flag that can be flipped at runtime.
#[derive(Debug)]
pub struct ConnectivityFlag {
    online: std::sync::atomic::AtomicBool,
}

impl ConnectivityFlag {
    pub fn new(online: bool) -> Self {
        Self {
            online: std::sync::atomic::AtomicBool::new(online),
        }
    }

    pub fn set(&self, online: bool) {
        self.online.store(online, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Connectivity for ConnectivityFlag {
    fn is_online(&self) -> bool {
        self.online.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_slot_builds_once_until_cleared() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();
        let slot = ClientSlot::new(move || Ok(counter.fetch_add(1, Ordering::SeqCst)));

        assert!(!slot.is_loaded());
        assert_eq!(*slot.get().unwrap(), 0);
        assert_eq!(*slot.get().unwrap(), 0);
        assert_eq!(built.load(Ordering::SeqCst), 1);

        slot.clear();
        assert_eq!(*slot.get().unwrap(), 1);
    }

    #[test]
    fn test_slot_factory_error_leaves_slot_empty() {
        let slot: ClientSlot<u8> = ClientSlot::new(|| Err(Error::WrongCredentials("no token".into())));
        assert!(matches!(slot.get(), Err(Error::WrongCredentials(_))));
        assert!(!slot.is_loaded());
    }

    #[test]
    fn test_memory_credentials() {
        let store = MemoryCredentialStore::new();
        let cloud = CloudId::new("path", "alice").unwrap();
        assert!(store.credential(&cloud).unwrap().is_none());

        store.set(&cloud, "secret");
        assert_eq!(store.credential(&cloud).unwrap().unwrap().as_str(), "secret");

        store.invalidate(&cloud);
        assert!(!store.contains(&cloud));
    }

    #[test]
    fn test_connectivity_flag() {
        let flag = ConnectivityFlag::new(true);
        assert!(flag.is_online());
        flag.set(false);
        assert!(!flag.is_online());
    }
}
