//! Key/value storage backends for OIDC authorization state
//!
//! Defines the `TokenStorage` trait that decouples the relying-party core from
//! where nonces, state bundles and tombstones live. Three backends ship:
//! - `SessionStorage`: values live as long as the caller's session
//! - `CacheStorage`: shared cache with an optional per-instance TTL
//! - `NullStorage`: every operation is a no-op (fully stateless deployments)
//!
//! Every backend namespaces keys with a configurable prefix so concurrent
//! attempts and unrelated applications sharing a store never collide.

pub mod cache;
pub mod null;
pub mod session;

pub use cache::{Cache, CacheStorage};
pub use null::NullStorage;
pub use session::{Session, SessionStorage};

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Default key prefix applied by every backend.
pub const DEFAULT_KEY_PREFIX: &str = "openid_connect_";

/// Errors from storage operations (session persistence, serialization).
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(String),

    #[error("storage serialization error: {0}")]
    Serialization(String),
}

/// Result alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Boxed future returned by `TokenStorage` methods.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Backend selector, chosen once from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageDriver {
    #[default]
    Session,
    Cache,
    Null,
}

/// Abstraction over the key/value store holding authorization state.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn TokenStorage>`). Implementations must be safe for concurrent use;
/// the core never holds a lock across calls.
pub trait TokenStorage: Send + Sync {
    /// Identifier for logging (e.g. "session", "cache", "null")
    fn id(&self) -> &str;

    /// Store `value` under `key` (prefix applied by the backend).
    fn put<'a>(&'a self, key: &'a str, value: &'a str) -> StorageFuture<'a, ()>;

    /// Read the value under `key`, `None` when absent or expired.
    fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Option<String>>;

    /// Remove `key`. Removing an absent key is not an error.
    fn forget<'a>(&'a self, key: &'a str) -> StorageFuture<'a, ()>;

    /// Flush pending writes. Backends without a persistence step return Ok.
    fn commit(&self) -> StorageFuture<'_, ()>;
}
