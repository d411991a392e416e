//! End-to-end scenarios through the router, run against every backend kind.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use cloudtree_common::{CloudFile, CloudFolder, CloudId, CloudNode, Error, Result};

use crate::client::MemoryCredentialStore;
use crate::config::StorageConfig;
use crate::io::BytesSource;
use crate::pathfs::PathApiError;
use crate::progress::{NoProgress, Phase, ProgressLog};
use crate::registry::{create_registry_with, CloudDescriptor, Simulators};
use crate::router::CloudRouter;
use crate::transfer::RecordingSleeper;

struct Fixture {
    router: CloudRouter,
    simulators: Arc<Simulators>,
    sleeper: Arc<RecordingSleeper>,
    temp: TempDir,
    local: CloudId,
    path: CloudId,
    id: CloudId,
    object: CloudId,
}

impl Fixture {
    fn new(content_cache: bool) -> Self {
        let temp = TempDir::new().unwrap();
        let mut config = StorageConfig::default()
            .with_chunk_threshold(8)
            .with_chunk_size(4)
            .with_page_size(3)
            .with_backoff_step(Duration::from_millis(1));
        if content_cache {
            config = config.with_content_cache(temp.path().join("cache"), 1 << 20);
        }

        let simulators = Simulators::new();
        let sleeper = Arc::new(RecordingSleeper::new());
        let credentials = Arc::new(MemoryCredentialStore::new());
        let router = CloudRouter::new(create_registry_with(simulators.clone()), credentials.clone(), config)
            .with_sleeper(sleeper.clone());

        let local = CloudId::new("local", "disk").unwrap();
        let path = CloudId::new("path", "alice").unwrap();
        let id = CloudId::new("id", "bob").unwrap();
        let object = CloudId::new("object", "carol").unwrap();
        credentials.set(&path, "path-token");
        credentials.set(&id, "id-token");
        credentials.set(&object, "AKIA");

        router
            .register_cloud(CloudDescriptor::new(
                local.clone(),
                json!({ "root": temp.path().join("disk") }),
            ))
            .unwrap();
        router.register_cloud(CloudDescriptor::new(path.clone(), json!({}))).unwrap();
        router.register_cloud(CloudDescriptor::new(id.clone(), json!({}))).unwrap();
        router
            .register_cloud(CloudDescriptor::new(object.clone(), json!({ "bucket": "media" })))
            .unwrap();

        Self {
            router,
            simulators,
            sleeper,
            temp,
            local,
            path,
            id,
            object,
        }
    }

    fn all(&self) -> Vec<CloudId> {
        vec![
            self.local.clone(),
            self.path.clone(),
            self.id.clone(),
            self.object.clone(),
        ]
    }

    fn remotes(&self) -> Vec<CloudId> {
        vec![self.path.clone(), self.id.clone(), self.object.clone()]
    }

    /// Content bytes the simulated remote of `cloud` has accepted.
    fn bytes_received(&self, cloud: &CloudId) -> u64 {
        let account = cloud.account();
        match cloud.kind().as_str() {
            "path" => self.simulators.path_server(account).map(|s| s.bytes_received()),
            "id" => self.simulators.id_server(account).map(|s| s.bytes_received()),
            "object" => self.simulators.object_server(account).map(|s| s.bytes_received()),
            _ => None,
        }
        .unwrap_or(0)
    }

    /// Native folder creations issued against the simulated remote.
    fn folder_creations(&self, cloud: &CloudId) -> usize {
        let account = cloud.account();
        match cloud.kind().as_str() {
            "path" => self.simulators.path_server(account).map(|s| s.faults().calls("create_folder")),
            "id" => self.simulators.id_server(account).map(|s| s.faults().calls("create_folder")),
            "object" => self.simulators.object_server(account).map(|s| s.faults().calls("put_object")),
            _ => None,
        }
        .unwrap_or(0)
    }

    async fn folder(&self, cloud: &CloudId, path: &str) -> CloudFolder {
        self.router.resolve(cloud, path).await.unwrap()
    }

    async fn file(&self, parent: &CloudFolder, name: &str) -> CloudFile {
        self.router.file(parent, name, None).await.unwrap()
    }

    async fn put(&self, file: &CloudFile, data: &'static [u8], replace: bool) -> Result<CloudFile> {
        self.router
            .write(file, &BytesSource::new(data), &NoProgress, replace, data.len() as u64)
            .await
    }

    async fn get(&self, file: &CloudFile) -> Vec<u8> {
        let mut out = Vec::new();
        self.router.read(file, &mut out, &NoProgress).await.unwrap();
        out
    }
}

#[tokio::test]
async fn test_round_trip_below_and_above_threshold() {
    let fx = Fixture::new(false);
    let big: &'static [u8] = b"the quick brown fox jumps";

    for cloud in fx.all() {
        let root = fx.router.root(&cloud).await.unwrap();

        let small = fx.file(&root, "small.txt").await;
        fx.put(&small, b"tiny", false).await.unwrap();
        assert_eq!(fx.get(&small).await, b"tiny", "{}", cloud);

        let large = fx.file(&root, "large.bin").await;
        let written = fx.put(&large, big, false).await.unwrap();
        assert_eq!(written.size(), Some(big.len() as u64), "{}", cloud);
        assert_eq!(fx.get(&large).await, big, "{}", cloud);
    }
}

#[tokio::test]
async fn test_no_clobber_sends_no_bytes() {
    let fx = Fixture::new(false);
    for cloud in fx.remotes() {
        let root = fx.router.root(&cloud).await.unwrap();
        let small = fx.file(&root, "a.txt").await;
        let large = fx.file(&root, "b.bin").await;
        fx.put(&small, b"first", false).await.unwrap();
        fx.put(&large, b"0123456789abcdef", false).await.unwrap();

        let before = fx.bytes_received(&cloud);
        assert!(matches!(
            fx.put(&small, b"second", false).await,
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            fx.put(&large, b"fedcba9876543210", false).await,
            Err(Error::AlreadyExists(_))
        ));
        assert_eq!(fx.bytes_received(&cloud), before, "{}", cloud);
        assert_eq!(fx.get(&small).await, b"first");
    }
}

#[tokio::test]
async fn test_write_reports_progress_lifecycle() {
    let fx = Fixture::new(false);
    for cloud in fx.all() {
        let root = fx.router.root(&cloud).await.unwrap();
        let file = fx.file(&root, "p.bin").await;
        let log = ProgressLog::new();
        fx.router
            .write(&file, &BytesSource::new(&b"0123456789"[..]), &log, false, 10)
            .await
            .unwrap();

        let phases = log.phases();
        assert_eq!(phases.first(), Some(&Phase::Started), "{}", cloud);
        assert_eq!(phases.last(), Some(&Phase::Completed), "{}", cloud);
        let transferred: Vec<u64> = log.events().iter().map(|e| e.bytes_transferred).collect();
        assert!(transferred.windows(2).all(|w| w[0] <= w[1]), "{}", cloud);
        assert_eq!(transferred.last(), Some(&10));
    }
}

#[tokio::test]
async fn test_idempotent_ancestor_creation() {
    let fx = Fixture::new(false);
    for cloud in fx.all() {
        let deep = fx.folder(&cloud, "/a/b/c").await;
        fx.router.create(&deep).await.unwrap();
        assert!(fx.router.exists(&fx.folder(&cloud, "/a").await.into()).await.unwrap());
        assert!(fx.router.exists(&fx.folder(&cloud, "/a/b").await.into()).await.unwrap());

        let before = fx.folder_creations(&cloud);
        let sibling = fx.folder(&cloud, "/a/b/d").await;
        fx.router.create(&sibling).await.unwrap();
        if cloud != fx.local {
            assert_eq!(fx.folder_creations(&cloud), before + 1, "{}", cloud);
        }

        let again = fx.router.create(&deep).await.unwrap_err();
        assert!(matches!(again, Error::AlreadyExists(_)), "{}", cloud);
    }
}

#[tokio::test]
async fn test_resolution_cache_coherent_after_move_and_delete() {
    let fx = Fixture::new(false);
    let cloud = fx.id.clone();
    let docs = fx.folder(&cloud, "/docs").await;
    fx.router.create(&docs).await.unwrap();
    let a = fx.file(&docs, "a.txt").await;
    fx.put(&a, b"old", false).await.unwrap();

    let archive = fx.folder(&cloud, "/archive").await;
    fx.router
        .move_node(&docs.clone().into(), &archive.clone().into())
        .await
        .unwrap();
    let archived = fx.file(&archive, "a.txt").await;
    assert!(!fx.router.exists(&a.clone().into()).await.unwrap());
    assert!(fx.router.exists(&archived.clone().into()).await.unwrap());

    fx.router.create(&docs).await.unwrap();
    fx.put(&a, b"new", false).await.unwrap();
    assert_eq!(fx.get(&a).await, b"new");
    assert_eq!(fx.get(&archived).await, b"old");

    fx.router.delete(&archive.clone().into()).await.unwrap();
    assert!(!fx.router.exists(&archived.clone().into()).await.unwrap());
    assert!(!fx.router.exists(&archive.into()).await.unwrap());

    let server = fx.simulators.id_server("bob").unwrap();
    server.rename_behind("/docs/a.txt", "z.txt");
    assert!(!fx.router.exists(&a.into()).await.unwrap());
}

#[tokio::test]
async fn test_resume_prefers_server_offset() {
    let fx = Fixture::new(false);
    let cloud = fx.path.clone();
    let root = fx.router.root(&cloud).await.unwrap();
    let file = fx.file(&root, "big.bin").await;

    let server = fx.simulators.path_server("alice").unwrap();
    server.faults().inject(
        "upload_session_append",
        PathApiError::IncorrectOffset { correct_offset: 2 },
    );
    fx.put(&file, b"abcdefghijkl", false).await.unwrap();

    assert_eq!(server.file_content("/big.bin").unwrap().as_ref(), b"abcdefghijkl");
    assert_eq!(server.faults().calls("upload_session_start"), 1);
    assert_eq!(fx.sleeper.delays().len(), 2);
}

#[tokio::test]
async fn test_exhausted_retries_are_fatal() {
    let fx = Fixture::new(false);
    let cloud = fx.path.clone();
    let root = fx.router.root(&cloud).await.unwrap();
    let server = fx.simulators.path_server("alice").unwrap();
    server
        .faults()
        .inject_times("upload_session_append", 10, PathApiError::Network("reset".into()));

    let file = fx.file(&root, "big.bin").await;
    let err = fx.put(&file, b"abcdefghijkl", false).await.unwrap_err();
    assert!(matches!(err, Error::Fatal { .. }));
    assert!(!server.contains("/big.bin"));
}

#[tokio::test]
async fn test_content_cache_falls_back_on_corruption() {
    let fx = Fixture::new(true);
    let cloud = fx.path.clone();
    let root = fx.router.root(&cloud).await.unwrap();
    let file = fx.file(&root, "c.txt").await;
    fx.put(&file, b"cached content", false).await.unwrap();
    let server = fx.simulators.path_server("alice").unwrap();

    assert_eq!(fx.get(&file).await, b"cached content");
    assert_eq!(server.faults().calls("download"), 1);

    let store = fx.temp.path().join("cache").join("path");
    for entry in std::fs::read_dir(&store).unwrap() {
        std::fs::write(entry.unwrap().path(), b"garbage").unwrap();
    }

    assert_eq!(fx.get(&file).await, b"cached content");
    assert_eq!(server.faults().calls("download"), 2);

    assert_eq!(fx.get(&file).await, b"cached content");
    assert_eq!(server.faults().calls("download"), 2);
}

#[tokio::test]
async fn test_document_scenario_on_every_backend() {
    let fx = Fixture::new(false);
    for cloud in fx.all() {
        let docs = fx.folder(&cloud, "/docs").await;
        fx.router.create(&docs).await.unwrap();

        let a = fx.file(&docs, "a.txt").await;
        fx.put(&a, b"hello", false).await.unwrap();
        assert!(matches!(
            fx.put(&a, b"again", false).await,
            Err(Error::AlreadyExists(_))
        ));
        fx.put(&a, b"hello world", true).await.unwrap();
        assert_eq!(fx.get(&a).await, b"hello world", "{}", cloud);

        let b = fx.file(&docs, "b.txt").await;
        let moved = fx
            .router
            .move_node(&a.clone().into(), &b.clone().into())
            .await
            .unwrap();
        assert_eq!(moved.path(), "/docs/b.txt");

        assert!(!fx.router.exists(&a.into()).await.unwrap(), "{}", cloud);
        assert!(fx.router.exists(&b.clone().into()).await.unwrap(), "{}", cloud);
        assert!(fx.router.exists(&docs.clone().into()).await.unwrap());
        let root = fx.router.root(&cloud).await.unwrap();
        let docs_as_file = fx.file(&root, "docs").await;
        assert!(!fx.router.exists(&docs_as_file.into()).await.unwrap(), "{}", cloud);

        let listed: Vec<CloudNode> = fx.router.list(&docs).await.unwrap();
        let names: Vec<&str> = listed.iter().map(|n| n.name()).collect();
        assert_eq!(names, vec!["b.txt"], "{}", cloud);
        assert_eq!(fx.get(&b).await, b"hello world");
    }
}

#[tokio::test]
async fn test_delete_with_wrong_kind_is_not_found() {
    let fx = Fixture::new(false);
    for cloud in fx.all() {
        let docs = fx.folder(&cloud, "/docs").await;
        fx.router.create(&docs).await.unwrap();
        let keep = fx.file(&docs, "keep.txt").await;
        fx.put(&keep, b"keep", false).await.unwrap();

        let root = fx.router.root(&cloud).await.unwrap();
        let docs_as_file = fx.file(&root, "docs").await;
        let err = fx.router.delete(&docs_as_file.into()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "{}: {}", cloud, err);
        assert!(fx.router.exists(&keep.clone().into()).await.unwrap(), "{}", cloud);

        let keep_as_folder = fx.folder(&cloud, "/docs/keep.txt").await;
        let err = fx.router.delete(&keep_as_folder.into()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "{}: {}", cloud, err);
        assert_eq!(fx.get(&keep).await, b"keep", "{}", cloud);
    }
}
