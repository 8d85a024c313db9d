//! Durable response persistence
//!
//! Responses survive restarts through one or more [`StableCache`] backends.
//! Keys are an entry's primary lookup key in hex, or the response file name
//! configured for it; values are the raw DER response.
//!
//! - **DiskCache**: one file per key under a folder
//! - **MemoryCache**: process-local map for tests and `dont_cache` deployments
//!
//! [`StableCaches`] fans writes out to every backend. Backend failures are
//! logged and never stop a refresh.

pub mod disk;
pub mod memory;

pub use disk::DiskCache;
pub use memory::MemoryCache;

use crate::error::StableCacheError;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Pluggable key/bytes store; last write wins
#[async_trait]
pub trait StableCache: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Returns `Ok(None)` if the key is not stored
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StableCacheError>;

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StableCacheError>;

    /// Every stored key
    async fn list(&self) -> Result<Vec<String>, StableCacheError>;
}

/// Ordered set of backends
#[derive(Clone, Default)]
pub struct StableCaches {
    backends: Vec<Arc<dyn StableCache>>,
}

impl StableCaches {
    pub fn new(backends: Vec<Arc<dyn StableCache>>) -> Self {
        Self { backends }
    }

    /// No persistence at all
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Bytes from the first backend holding `key`
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        for backend in &self.backends {
            match backend.get(key).await {
                Ok(Some(bytes)) => {
                    debug!(backend = backend.name(), key = %key, "Stable cache hit");
                    return Some(bytes);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(backend = backend.name(), key = %key, error = %e, "Stable cache read failed");
                }
            }
        }
        None
    }

    /// Keys stored in any backend, or `None` if a backend could not be listed
    pub async fn list(&self) -> Option<BTreeSet<String>> {
        let mut keys = BTreeSet::new();
        for backend in &self.backends {
            match backend.list().await {
                Ok(listed) => keys.extend(listed),
                Err(e) => {
                    warn!(backend = backend.name(), error = %e, "Stable cache listing failed");
                    return None;
                }
            }
        }
        Some(keys)
    }

    /// Write to every backend; returns how many succeeded
    pub async fn put(&self, key: &str, value: &[u8]) -> usize {
        let mut written = 0;
        for backend in &self.backends {
            match backend.put(key, value).await {
                Ok(()) => written += 1,
                Err(e) => {
                    warn!(backend = backend.name(), key = %key, error = %e, "Stable cache write failed");
                }
            }
        }
        written
    }
}
