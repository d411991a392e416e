//! Cloudtree CLI - command line access to a cloud tree.
//!
//! Exposes a local directory through the storage router, so every command
//! goes through the same adapter contract remote backends implement.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use cloudtree_common::types::split_path;
use cloudtree_common::{CloudFile, CloudFolder, CloudId, CloudNode};
use cloudtree_storage::{
    create_default_registry, CloudDescriptor, CloudRouter, DataSource, FileSource,
    MemoryCredentialStore, StorageConfig, TransferState,
};

#[derive(Parser)]
#[command(name = "cloudtree")]
#[command(about = "Cloudtree - uniform file-tree operations")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Local directory exposed as the tree root.
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    /// Cache downloaded content under the user cache directory.
    #[arg(long)]
    cache: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List a folder.
    Ls {
        /// Folder path (default: root).
        #[arg(default_value = "/")]
        path: String,
    },

    /// Create a folder and any missing ancestors.
    Mkdir {
        path: String,
    },

    /// Upload a local file.
    Put {
        /// Local file to upload.
        source: PathBuf,

        /// Destination path in the tree.
        dest: String,

        /// Overwrite an existing file.
        #[arg(long)]
        replace: bool,
    },

    /// Download a file.
    Get {
        /// File path in the tree.
        source: String,

        /// Local destination file.
        dest: PathBuf,
    },

    /// Move or rename a file or folder.
    Mv {
        from: String,
        to: String,
    },

    /// Delete a file or folder.
    Rm {
        path: String,
    },

    /// Show what lives at a path.
    Stat {
        path: String,
    },

    /// Check the backend and print the account label.
    Whoami,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let session = Session::open(&cli.root, cli.cache)?;

    match cli.command {
        Commands::Ls { path } => cmd_ls(&session, &path).await,
        Commands::Mkdir { path } => cmd_mkdir(&session, &path).await,
        Commands::Put {
            source,
            dest,
            replace,
        } => cmd_put(&session, &source, &dest, replace).await,
        Commands::Get { source, dest } => cmd_get(&session, &source, &dest).await,
        Commands::Mv { from, to } => cmd_mv(&session, &from, &to).await,
        Commands::Rm { path } => cmd_rm(&session, &path).await,
        Commands::Stat { path } => cmd_stat(&session, &path).await,
        Commands::Whoami => cmd_whoami(&session).await,
    }
}

/// Normalize a user path to `/a/b` form; the root is the empty string.
fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| format!("/{}", s))
        .collect()
}

/// Router bound to the one local identity the CLI works on.
struct Session {
    router: CloudRouter,
    cloud: CloudId,
}

impl Session {
    fn open(root: &Path, cache: bool) -> Result<Self> {
        let mut config = StorageConfig::default();
        if cache {
            let dir = dirs::cache_dir()
                .context("No user cache directory on this platform")?
                .join("cloudtree");
            debug!("Content cache at {}", dir.display());
            let capacity = config.content_cache_capacity;
            config = config.with_content_cache(dir, capacity);
        }

        let router = CloudRouter::new(
            create_default_registry(),
            Arc::new(MemoryCredentialStore::new()),
            config,
        );
        let cloud = CloudId::new("local", "cli")?;
        router.register_cloud(CloudDescriptor::new(
            cloud.clone(),
            serde_json::json!({ "root": root }),
        ))?;
        Ok(Self { router, cloud })
    }

    async fn folder(&self, path: &str) -> Result<CloudFolder> {
        Ok(self.router.resolve(&self.cloud, &normalize(path)).await?)
    }

    async fn file(&self, path: &str) -> Result<CloudFile> {
        let path = normalize(path);
        let (parent, name) = split_path(&path)
            .filter(|(_, name)| !name.is_empty())
            .context("The root is not a file")?;
        let parent = self.router.resolve(&self.cloud, parent).await?;
        Ok(self.router.file(&parent, name, None).await?)
    }

    /// Existing node at `path`, file first.
    async fn node(&self, path: &str) -> Result<CloudNode> {
        if !normalize(path).is_empty() {
            let file = CloudNode::File(self.file(path).await?);
            if self.router.exists(&file).await? {
                return Ok(file);
            }
        }
        let folder = CloudNode::Folder(self.folder(path).await?);
        if self.router.exists(&folder).await? {
            return Ok(folder);
        }
        anyhow::bail!("No such file or folder: {}", path)
    }

    /// Node of the same kind as `like`, placed at `path`.
    async fn target(&self, like: &CloudNode, path: &str) -> Result<CloudNode> {
        Ok(match like {
            CloudNode::File(_) => CloudNode::File(self.file(path).await?),
            CloudNode::Folder(_) => CloudNode::Folder(self.folder(path).await?),
        })
    }
}

fn log_progress(state: &TransferState) {
    match state.bytes_total {
        Some(total) => debug!("{}: {}/{} bytes", state.file, state.bytes_transferred, total),
        None => debug!("{}: {} bytes", state.file, state.bytes_transferred),
    }
}

fn describe(node: &CloudNode) -> String {
    match node {
        CloudNode::Folder(folder) => format!("{}/", folder.name()),
        CloudNode::File(file) => {
            let modified = file
                .modified()
                .map(|m| m.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            format!(
                "{:<40} {:>12} {}",
                file.name(),
                file.size().map(|s| s.to_string()).unwrap_or_default(),
                modified
            )
        }
    }
}

async fn cmd_ls(session: &Session, path: &str) -> Result<()> {
    let folder = session.folder(path).await?;
    let nodes = session
        .router
        .list(&folder)
        .await
        .with_context(|| format!("Failed to list {}", path))?;

    for node in &nodes {
        println!("{}", describe(node));
    }
    Ok(())
}

async fn cmd_mkdir(session: &Session, path: &str) -> Result<()> {
    let folder = session.folder(path).await?;
    session
        .router
        .create(&folder)
        .await
        .with_context(|| format!("Failed to create {}", path))?;
    info!("Created {}", folder);
    Ok(())
}

async fn cmd_put(session: &Session, source: &Path, dest: &str, replace: bool) -> Result<()> {
    let data = FileSource::new(source)
        .await
        .with_context(|| format!("Failed to open {}", source.display()))?;
    let size = data.size().unwrap_or(0);
    let file = session.file(dest).await?;

    let written = session
        .router
        .write(&file, &data, &log_progress, replace, size)
        .await
        .with_context(|| format!("Failed to upload {}", dest))?;
    println!("Uploaded {} ({} bytes)", written, size);
    Ok(())
}

async fn cmd_get(session: &Session, source: &str, dest: &Path) -> Result<()> {
    let file = session.file(source).await?;
    let mut out = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("Failed to create {}", dest.display()))?;

    session
        .router
        .read(&file, &mut out, &log_progress)
        .await
        .with_context(|| format!("Failed to download {}", source))?;
    out.flush().await?;
    println!("Downloaded {} to {}", file, dest.display());
    Ok(())
}

async fn cmd_mv(session: &Session, from: &str, to: &str) -> Result<()> {
    let source = session.node(from).await?;
    let target = session.target(&source, to).await?;
    let moved = session
        .router
        .move_node(&source, &target)
        .await
        .with_context(|| format!("Failed to move {} to {}", from, to))?;
    println!("Moved to {}", moved.path());
    Ok(())
}

async fn cmd_rm(session: &Session, path: &str) -> Result<()> {
    let node = session.node(path).await?;
    session
        .router
        .delete(&node)
        .await
        .with_context(|| format!("Failed to delete {}", path))?;
    println!("Deleted {}", path);
    Ok(())
}

async fn cmd_stat(session: &Session, path: &str) -> Result<()> {
    let node = session.node(path).await?;
    let kind = if node.is_folder() { "folder" } else { "file" };
    println!("Path: {}", if node.path().is_empty() { "/" } else { node.path() });
    println!("Kind: {}", kind);

    if let Some(parent) = node.parent() {
        let listed = session.router.list(parent).await?;
        if let Some(CloudNode::File(file)) = listed.iter().find(|n| n.name() == node.name()) {
            if let Some(size) = file.size() {
                println!("Size: {} bytes", size);
            }
            if let Some(modified) = file.modified() {
                println!("Modified: {}", modified);
            }
        }
    }
    Ok(())
}

async fn cmd_whoami(session: &Session) -> Result<()> {
    let account = session
        .router
        .check_authentication(&session.cloud)
        .await
        .context("Authentication check failed")?;
    println!("{} ({})", account, session.cloud);
    Ok(())
}
