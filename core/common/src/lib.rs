//! Common types shared across cloudtree crates.
//!
//! This crate holds the node model and the error taxonomy every backend
//! adapter normalizes its native failures into.

pub mod error;
pub mod node;
pub mod types;

pub use error::{Error, NativeError, Result};
pub use node::{CloudFile, CloudFolder, CloudNode};
pub use types::{BackendKind, CloudId};
