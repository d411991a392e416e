//! Object-store backend family: buckets of keys with `/` delimiters.

pub mod adapter;
pub mod api;
pub mod errors;
pub mod memory;

pub use adapter::{ObjectAdapter, DELETE_BATCH};
pub use api::{CompletedPart, ObjectApi, ObjectApiError, ObjectInfo, ObjectListing, ObjectResult};
pub use memory::{MemoryObjectClient, MemoryObjectServer};
