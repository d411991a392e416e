//! ID-addressed backends.
//!
//! Every item has an opaque ID and one parent ID; names are resolved level by
//! level from the root.

pub mod adapter;
pub mod api;
pub mod errors;
pub mod memory;

pub use adapter::IdAdapter;
pub use api::{IdApi, IdApiError, IdItem, ItemPage, RangeAck};
pub use memory::{MemoryIdClient, MemoryIdServer};
