//! Error taxonomy for the daemon
//!
//! Fetch and persistence errors are transient: they are logged and retried or
//! skipped. Issuer resolution and configuration errors are fatal at startup.

use crate::config::ConfigError;
use stapled_proto::{OcspError, VerificationError};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Boxed transport failure, so stub transports need not construct `reqwest` errors
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// One failed attempt (or the whole call) to obtain an OCSP response
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: BoxError,
    },

    #[error("{url} answered HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("failed to read response body from {url}: {reason}")]
    Body { url: String, reason: String },

    #[error("invalid OCSP response from {url}: {source}")]
    Protocol {
        url: String,
        #[source]
        source: OcspError,
    },

    #[error("unacceptable OCSP response from {url}: {source}")]
    Verification {
        url: String,
        #[source]
        source: VerificationError,
    },

    #[error("no OCSP responders configured")]
    NoResponders,

    #[error("fetch cancelled")]
    Cancelled,

    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
}

/// A persisted response could not be installed
#[derive(Debug, Error)]
pub enum SeedError {
    #[error("invalid persisted response: {0}")]
    Protocol(#[from] OcspError),

    #[error("unacceptable persisted response: {0}")]
    Verification(#[from] VerificationError),

    #[error("persisted response has no nextUpdate")]
    NoNextUpdate,
}

/// Durable persistence failure
#[derive(Debug, Error)]
pub enum StableCacheError {
    #[error("stable cache I/O error for '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid stable cache key '{0}'")]
    InvalidKey(String),
}

/// No issuer could be found for a certificate definition
#[derive(Debug, Error)]
pub enum IssuerResolutionError {
    #[error("failed to load issuer '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: OcspError,
    },

    #[error("{name}: issuer can only be omitted if the certificate contains AIA information about its issuer")]
    NoIssuerSource { name: String },

    #[error("{name}: unable to retrieve issuer from {attempts} AIA location(s)")]
    Exhausted { name: String, attempts: usize },
}

/// On-demand fill failure; surfaces to clients as "not found"
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("issuer is not known")]
    UnknownIssuer,

    #[error("no upstream responders configured")]
    NoResponders,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("gave up waiting for an in-flight fetch after {0:?}")]
    WaitExpired(Duration),

    #[error("in-flight fetch failed")]
    LeaderFailed,

    #[error("in-flight fetch was abandoned")]
    LeaderGone,
}

/// Top-level daemon error
#[derive(Debug, Error)]
pub enum StapledError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Issuer(#[from] IssuerResolutionError),

    #[error("certificate '{path}': {source}")]
    Certificate {
        path: PathBuf,
        #[source]
        source: OcspError,
    },

    #[error("HTTP client setup failed: {0}")]
    Http(#[from] FetchError),

    #[error(transparent)]
    StableCache(#[from] StableCacheError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
