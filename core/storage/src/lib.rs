//! Uniform file-tree access over heterogeneous cloud backends.
//!
//! Every backend family implements [`CloudAdapter`]; the [`CloudRouter`]
//! picks the adapter for a node's identity, creating it through the
//! [`AdapterRegistry`] on first use and evicting it when its credential stops
//! working.
//!
//! # Design Principles
//! - Backend isolation: native error types never leave an adapter
//! - Async operations: all I/O is awaited inline on the caller's task
//! - Resumable transfers: large files move in chunks through a retry machine
//! - Unified error semantics: one taxonomy across every backend

pub mod adapter;
pub mod client;
pub mod config;
pub mod content_cache;
pub mod faults;
pub mod idfs;
pub mod io;
pub mod local;
pub mod object;
pub mod pathfs;
pub mod progress;
pub mod registry;
pub mod resolution;
pub mod router;
pub mod scoped;
pub mod transfer;

#[cfg(test)]
mod tests;

pub use adapter::CloudAdapter;
pub use client::{
    AlwaysOnline, Connectivity, ConnectivityFlag, Credential, CredentialStore, MemoryCredentialStore,
};
pub use config::StorageConfig;
pub use content_cache::ContentCache;
pub use idfs::IdAdapter;
pub use io::{BytesSource, DataSink, DataSource, FileSource};
pub use local::LocalAdapter;
pub use object::ObjectAdapter;
pub use pathfs::PathAdapter;
pub use progress::{Direction, NoProgress, Phase, ProgressLog, ProgressSink, TransferState};
pub use registry::{
    create_default_registry, create_registry_with, AdapterContext, AdapterFactory, AdapterRegistry,
    CloudDescriptor, Simulators,
};
pub use resolution::ResolutionCache;
pub use router::CloudRouter;
pub use scoped::ScopedAdapter;
pub use transfer::{RecordingSleeper, Sleeper, TokioSleeper};
