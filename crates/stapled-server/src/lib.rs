//! OCSP stapling cache daemon
//!
//! Keeps a fresh, signed OCSP response for every configured certificate and
//! serves it over HTTP to TLS terminators, built on the `stapled-proto`
//! codec.
//!
//! # Features
//!
//! - Proactive refresh ahead of nextUpdate with retry and backoff
//! - Durable response cache that survives restarts
//! - Issuer resolution from files, an issuer folder or AIA
//! - On-demand fills for unconfigured certificates with coalesced fetches
//! - Prometheus stats on an optional second listener
//! - JSON configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use stapled_server::{Config, Stapled};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("config.json")?;
//!     let daemon = Arc::new(Stapled::new(config).await?);
//!     daemon.run().await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cancel;
pub mod config;
pub mod definition;
pub mod entry;
pub mod error;
pub mod fetcher;
pub mod issuer_cache;
pub mod key;
pub mod responder;
pub mod stable_cache;
pub mod stapled;
pub mod stats;
pub mod watcher;

pub use cache::{Cache, CacheOptions, OnDemand};
pub use cancel::{CancelHandle, CancelToken};
pub use config::{CertDefinition, Config, ConfigError};
pub use definition::{DefinitionLoader, HttpTransports, TransportFactory};
pub use entry::{CachedResponse, Entry, EntryParams, EntryState, RefreshOutcome, RefreshPolicy};
pub use error::{
    CacheError, FetchError, IssuerResolutionError, SeedError, StableCacheError, StapledError,
};
pub use fetcher::{
    FetchOutcome, FetchRequest, FetchedResponse, Fetcher, HttpReply, HttpTransport, RandomPicker,
    ResponderPicker, Transport,
};
pub use issuer_cache::{HttpIssuerSource, IssuerCache, IssuerSource};
pub use key::LookupKey;
pub use responder::{create_responder, start_responder, ResponseSource};
pub use stable_cache::{DiskCache, MemoryCache, StableCache, StableCaches};
pub use stapled::{Collaborators, Stapled};
pub use stats::{create_stats_server, start_stats_server};
pub use watcher::DirWatcher;
