//! Path-addressed backends.
//!
//! Remote entries are addressed by their full slash-separated path, the
//! same shape as logical paths.

pub mod adapter;
pub mod api;
pub mod errors;
pub mod memory;

pub use adapter::PathAdapter;
pub use api::{ListPage, PathApi, PathApiError, PathEntry, WriteMode};
pub use memory::{MemoryPathClient, MemoryPathServer};
