//! relata-storage: Storage abstraction for authorization data
//!
//! This crate provides:
//! - The [`DataStore`] trait: stores, immutable authorization models,
//!   relationship tuples (with a reverse index), and a change log
//! - An in-memory backend for tests and single-process deployments
//! - A caching decorator that memoizes immutable models and collapses
//!   concurrent latest-model lookups

pub mod cached;
pub mod error;
pub mod memory;
pub mod singleflight;
pub mod traits;

pub use cached::CachedDataStore;
pub use error::{StorageError, StorageResult};
pub use memory::MemoryDataStore;
pub use traits::{
    DataStore, PaginatedResult, PaginationOptions, Store, StoredAuthorizationModel, StoredTuple,
    TupleChange, TupleFilter, TupleOperation,
};
