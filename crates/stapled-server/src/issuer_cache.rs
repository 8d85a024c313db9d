//! Issuer resolution and caching
//!
//! Issuers are keyed by SHA-256(subject DER || subject key identifier) and
//! indexed a second time by their CertID hashes, which is all an incoming
//! OCSP request tells us about its issuer.

use crate::error::{FetchError, IssuerResolutionError};
use async_trait::async_trait;
use stapled_proto::{CertificateInfo, HashAlgorithm, Issuer};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fetches issuer certificates from AIA caIssuers locations
#[async_trait]
pub trait IssuerSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// [`IssuerSource`] over plain HTTP
pub struct HttpIssuerSource {
    client: reqwest::Client,
}

impl HttpIssuerSource {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transport {
                url: String::new(),
                source: Box::new(e),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl IssuerSource for HttpIssuerSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport {
                url: url.to_string(),
                source: Box::new(e),
            })?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| FetchError::Body {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(body.to_vec())
    }
}

#[derive(Default)]
struct IssuerMaps {
    by_identity: HashMap<[u8; 32], Arc<Issuer>>,
    by_hashes: HashMap<(HashAlgorithm, Vec<u8>, Vec<u8>), Arc<Issuer>>,
}

/// Read-mostly issuer store; entries are never evicted
#[derive(Default)]
pub struct IssuerCache {
    inner: RwLock<IssuerMaps>,
}

impl IssuerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, subject: &[u8], key_id: &[u8]) -> Option<Arc<Issuer>> {
        let key = Issuer::cache_key_for(subject, key_id);
        let maps = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        maps.by_identity.get(&key).cloned()
    }

    /// Resolve the issuer named by a CertID
    pub fn get_by_hashes(
        &self,
        alg: HashAlgorithm,
        name_hash: &[u8],
        key_hash: &[u8],
    ) -> Option<Arc<Issuer>> {
        let maps = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        maps.by_hashes
            .get(&(alg, name_hash.to_vec(), key_hash.to_vec()))
            .cloned()
    }

    /// Insert `issuer`, returning the cached instance if one already exists
    pub fn add(&self, issuer: Issuer) -> Arc<Issuer> {
        let key = issuer.cache_key();
        let mut maps = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = maps.by_identity.get(&key) {
            return existing.clone();
        }

        let issuer = Arc::new(issuer);
        for alg in HashAlgorithm::ALL {
            maps.by_hashes.insert(
                (alg, issuer.name_hash(alg), issuer.key_hash(alg)),
                issuer.clone(),
            );
        }
        maps.by_identity.insert(key, issuer.clone());
        issuer
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_identity
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load every parsable certificate in `folder`; returns how many were added
    pub fn load_folder(&self, folder: &Path) -> std::io::Result<usize> {
        let mut loaded = 0;
        for dir_entry in std::fs::read_dir(folder)? {
            let path = dir_entry?.path();
            if !path.is_file() {
                continue;
            }
            match Issuer::from_file(&path) {
                Ok(issuer) => {
                    debug!(path = %path.display(), issuer = %issuer.display_name(), "Loaded issuer");
                    self.add(issuer);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable issuer file");
                }
            }
        }
        info!(folder = %folder.display(), count = loaded, "Loaded issuer folder");
        Ok(loaded)
    }

    /// Find the issuer for a certificate definition
    ///
    /// Order: explicit issuer file, this cache (by issuer DN and authority
    /// key identifier), then the certificate's AIA caIssuers URLs.
    pub async fn resolve(
        &self,
        name: &str,
        explicit: Option<&Path>,
        cert: Option<&CertificateInfo>,
        source: &dyn IssuerSource,
    ) -> Result<Arc<Issuer>, IssuerResolutionError> {
        if let Some(path) = explicit {
            let issuer = Issuer::from_file(path).map_err(|source| IssuerResolutionError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            return Ok(self.add(issuer));
        }

        let Some(cert) = cert else {
            return Err(IssuerResolutionError::NoIssuerSource {
                name: name.to_string(),
            });
        };

        if let Some(key_id) = &cert.authority_key_id {
            if let Some(issuer) = self.get(&cert.issuer_der, key_id) {
                return Ok(issuer);
            }
        }

        if cert.issuer_urls.is_empty() {
            return Err(IssuerResolutionError::NoIssuerSource {
                name: name.to_string(),
            });
        }

        for url in &cert.issuer_urls {
            let body = match source.fetch(url).await {
                Ok(body) => body,
                Err(e) => {
                    warn!(entry = %name, url = %url, error = %e, "Failed to retrieve issuer");
                    continue;
                }
            };
            let issuer = match Issuer::from_bytes(&body) {
                Ok(issuer) => issuer,
                Err(e) => {
                    warn!(entry = %name, url = %url, error = %e, "Failed to parse issuer");
                    continue;
                }
            };
            if issuer.subject() != cert.issuer_der.as_slice() {
                warn!(entry = %name, url = %url, "Issuer from AIA does not match certificate issuer");
                continue;
            }
            info!(entry = %name, url = %url, issuer = %issuer.display_name(), "Retrieved issuer via AIA");
            return Ok(self.add(issuer));
        }

        Err(IssuerResolutionError::Exhausted {
            name: name.to_string(),
            attempts: cert.issuer_urls.len(),
        })
    }
}
