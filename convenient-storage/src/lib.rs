//! Persistent key/value storage for incremental sync state
//!
//! This crate provides the storage layer the sync engine keeps its state in:
//! binary codecs, 128-bit fingerprints, and typed stores over named regions
//! that are persisted under one workspace directory.
//!
//! # Features
//!
//! - Composable, versioned binary codecs over a seekable buffer
//! - `KvStore` with atomic `compute` and lazy iteration
//! - `KvMultiSetMap` (key to set of values) built on `compute`
//! - `FlatStorage` for a single value with a default creator
//! - In-memory and paged regions with atomic file replacement
//! - Corrupted regions are discarded and reported, never half-loaded
//!
//! # Example
//!
//! ```
//! use convenient_storage::codec::{StringCodec, U64Codec};
//! use convenient_storage::{StorageContext, StorageHint};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = StorageContext::ephemeral();
//! let sizes = ctx.kv_store("sizes", Some(StorageHint::Paged), StringCodec, U64Codec)?;
//!
//! sizes.put(&"BUILD".to_string(), &120)?;
//! let total = sizes.compute(&"BUILD".to_string(), |_, v| v.map(|n| n + 1))?;
//! assert_eq!(total, Some(121));
//!
//! ctx.save()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(unused_results)]

pub mod codec;
pub mod region;

mod context;
mod error;
mod flat;
mod hash;
mod kv;
mod multimap;

pub use context::{StorageConfig, StorageContext, StorageHint};
pub use error::{StorageError, StorageResult};
pub use flat::FlatStorage;
pub use hash::{Hash128, Hash128Builder, ParseHashError};
pub use kv::{KvStore, StoreIter};
pub use multimap::KvMultiSetMap;
