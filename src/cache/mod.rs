//! Caching primitives shared by models and collections.
//!
//! - `key`: canonical cache keys and attribute hashes
//! - `queue`: per-entity operation serialization
//! - `store`: the arena of entity and group state behind every resource

pub mod key;
pub mod queue;
pub(crate) mod store;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use key::{attribute_hash, cache_key, identity_string};
pub use queue::{Operation, OperationQueue};
pub use store::DEFAULT_ENDPOINT;

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
