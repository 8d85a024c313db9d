//! Turning certificate definitions into entries
//!
//! A definition names a certificate either by file or by hex serial. The
//! issuer comes from an explicit file, the issuer cache or AIA, and the
//! responder list and proxy are merged with the global fetcher settings.

use crate::config::{CertDefinition, Config, ConfigError};
use crate::entry::{EntryParams, RefreshPolicy};
use crate::error::{FetchError, StapledError};
use crate::fetcher::{Fetcher, HttpTransport, Transport};
use crate::issuer_cache::{IssuerCache, IssuerSource};
use crate::stable_cache::StableCaches;
use stapled_proto::CertificateInfo;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Hands out transports per proxy setting
pub trait TransportFactory: Send + Sync {
    fn transport(&self, proxy: Option<&str>) -> Result<Arc<dyn Transport>, FetchError>;
}

/// One pooled [`HttpTransport`] per distinct proxy
pub struct HttpTransports {
    timeout: Duration,
    clients: Mutex<HashMap<Option<String>, Arc<dyn Transport>>>,
}

impl HttpTransports {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }
}

impl TransportFactory for HttpTransports {
    fn transport(&self, proxy: Option<&str>) -> Result<Arc<dyn Transport>, FetchError> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        let key = proxy.map(str::to_string);
        if let Some(transport) = clients.get(&key) {
            return Ok(transport.clone());
        }
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(proxy, self.timeout)?);
        clients.insert(key, transport.clone());
        Ok(transport)
    }
}

/// Responders for a definition
///
/// Later sources replace earlier ones when non-empty: the certificate's AIA
/// OCSP URLs, the definition's list, then the global upstream list unless the
/// definition opts out.
pub fn select_responders(
    definition: &CertDefinition,
    aia_urls: &[String],
    upstream: &[String],
) -> Vec<String> {
    let mut responders = aia_urls.to_vec();
    if !definition.responders.is_empty() {
        responders = definition.responders.clone();
    }
    if !upstream.is_empty() && !definition.override_global_upstream {
        responders = upstream.to_vec();
    }
    responders
}

/// Global proxy unless the definition overrides it
pub fn select_proxy<'a>(definition: &'a CertDefinition, global: Option<&'a str>) -> Option<&'a str> {
    if definition.override_global_proxy {
        definition.proxy.as_deref()
    } else {
        global.or(definition.proxy.as_deref())
    }
}

/// Shared collaborators for building entries from definitions
pub struct DefinitionLoader<'a> {
    pub config: &'a Config,
    pub issuers: &'a IssuerCache,
    pub issuer_source: &'a dyn IssuerSource,
    pub transports: &'a dyn TransportFactory,
    pub fetcher: Fetcher,
    pub stable: Arc<StableCaches>,
}

impl DefinitionLoader<'_> {
    /// Resolve everything an entry needs; any failure is fatal for the definition
    pub async fn entry_params(&self, definition: &CertDefinition) -> Result<EntryParams, StapledError> {
        let name = definition.display_name();

        let certificate = match definition.certificate.as_deref() {
            Some(path) => {
                let path = Path::new(path);
                let info = CertificateInfo::from_file(path).map_err(|source| {
                    StapledError::Certificate {
                        path: path.to_path_buf(),
                        source,
                    }
                })?;
                Some(info)
            }
            None => None,
        };

        let serial = match (&certificate, definition.parse_serial()?) {
            (Some(cert), _) => cert.serial.clone(),
            (None, Some(serial)) => serial,
            (None, None) => {
                return Err(ConfigError::Invalid(format!(
                    "{}: either 'certificate' or 'serial' is required",
                    name
                ))
                .into())
            }
        };

        let issuer = self
            .issuers
            .resolve(
                &name,
                definition.issuer.as_deref().map(Path::new),
                certificate.as_ref(),
                self.issuer_source,
            )
            .await?;

        let aia_urls = certificate
            .as_ref()
            .map(|c| c.ocsp_urls.as_slice())
            .unwrap_or_default();
        let responders =
            select_responders(definition, aia_urls, &self.config.fetcher.upstream_responders);
        if responders.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "{}: no responders provided by the certificate, the definition or the global upstream list",
                name
            ))
            .into());
        }

        let proxy = select_proxy(definition, self.config.fetcher.proxy.as_deref());
        let transport = self.transports.transport(proxy)?;

        debug!(
            entry = %name,
            serial = %serial,
            issuer = %issuer.display_name(),
            responders = ?responders,
            proxy = ?proxy,
            "Resolved certificate definition"
        );

        Ok(EntryParams {
            name,
            serial,
            issuer,
            responders,
            response_name: definition.response_name.clone(),
            transport,
            fetcher: self.fetcher.clone(),
            policy: RefreshPolicy::from_config(self.config),
            stable: self.stable.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IssuerResolutionError;
    use crate::fetcher::HttpReply;
    use crate::key::LookupKey;
    use async_trait::async_trait;
    use num_bigint::BigUint;
    use stapled_proto::test_support::{CertificateBuilder, TestAuthority};

    struct NoTransport;

    #[async_trait]
    impl Transport for NoTransport {
        async fn get(&self, url: &str, _etag: Option<&str>) -> Result<HttpReply, FetchError> {
            Err(FetchError::Status {
                url: url.to_string(),
                status: 503,
            })
        }
    }

    /// Records the proxy each transport was requested for
    #[derive(Default)]
    struct RecordingFactory {
        proxies: Mutex<Vec<Option<String>>>,
    }

    impl TransportFactory for RecordingFactory {
        fn transport(&self, proxy: Option<&str>) -> Result<Arc<dyn Transport>, FetchError> {
            self.proxies.lock().unwrap().push(proxy.map(str::to_string));
            Ok(Arc::new(NoTransport))
        }
    }

    struct NoSource;

    #[async_trait]
    impl IssuerSource for NoSource {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            Err(FetchError::Status {
                url: url.to_string(),
                status: 404,
            })
        }
    }

    fn definition(responders: &[&str]) -> CertDefinition {
        CertDefinition {
            responders: responders.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_responder_precedence() {
        let aia = vec!["http://aia.example.com".to_string()];
        let upstream = vec!["http://upstream.example.com".to_string()];

        assert_eq!(select_responders(&definition(&[]), &aia, &[]), aia);
        assert_eq!(
            select_responders(&definition(&["http://def.example.com"]), &aia, &[]),
            vec!["http://def.example.com"]
        );
        assert_eq!(
            select_responders(&definition(&["http://def.example.com"]), &aia, &upstream),
            upstream
        );

        let mut opted_out = definition(&["http://def.example.com"]);
        opted_out.override_global_upstream = true;
        assert_eq!(
            select_responders(&opted_out, &aia, &upstream),
            vec!["http://def.example.com"]
        );
        assert!(select_responders(&definition(&[]), &[], &[]).is_empty());
    }

    #[test]
    fn test_proxy_precedence() {
        let mut def = CertDefinition {
            proxy: Some("http://def-proxy:3128".to_string()),
            ..Default::default()
        };
        assert_eq!(select_proxy(&def, Some("http://global:3128")), Some("http://global:3128"));
        assert_eq!(select_proxy(&def, None), Some("http://def-proxy:3128"));

        def.override_global_proxy = true;
        assert_eq!(select_proxy(&def, Some("http://global:3128")), Some("http://def-proxy:3128"));

        def.proxy = None;
        assert_eq!(select_proxy(&def, Some("http://global:3128")), None);
    }

    #[tokio::test]
    async fn test_serial_definition() {
        let dir = tempfile::tempdir().unwrap();
        let ca = TestAuthority::new("Serial CA");
        let issuer_path = dir.path().join("ca.der");
        std::fs::write(&issuer_path, CertificateBuilder::new(&ca).sign(&ca)).unwrap();

        let config = Config::default();
        let issuers = IssuerCache::new();
        let factory = RecordingFactory::default();
        let loader = DefinitionLoader {
            config: &config,
            issuers: &issuers,
            issuer_source: &NoSource,
            transports: &factory,
            fetcher: Fetcher::default(),
            stable: Arc::new(StableCaches::none()),
        };

        let def = CertDefinition {
            name: Some("api".to_string()),
            serial: Some("0102".to_string()),
            issuer: Some(issuer_path.display().to_string()),
            responders: vec!["http://ocsp.example.com".to_string()],
            proxy: Some("http://proxy:3128".to_string()),
            ..Default::default()
        };
        let params = loader.entry_params(&def).await.unwrap();

        assert_eq!(params.name, "api");
        assert_eq!(params.serial, BigUint::from(258u32));
        assert_eq!(params.responders, vec!["http://ocsp.example.com"]);
        assert_eq!(
            LookupKey::primary(&params.issuer, &params.serial),
            LookupKey::primary(ca.issuer(), &BigUint::from(258u32))
        );
        assert_eq!(
            *factory.proxies.lock().unwrap(),
            vec![Some("http://proxy:3128".to_string())]
        );
        assert_eq!(issuers.len(), 1);
    }

    #[tokio::test]
    async fn test_certificate_definition_uses_aia_and_issuer_cache() {
        let dir = tempfile::tempdir().unwrap();
        let ca = TestAuthority::new("AIA CA");
        let leaf = TestAuthority::new("www.example.com");
        let cert_path = dir.path().join("www.pem");
        let cert = CertificateBuilder::new(&leaf)
            .serial(BigUint::from(77u32))
            .ocsp_url("http://ocsp.aia.example.com")
            .sign(&ca);
        std::fs::write(&cert_path, cert).unwrap();

        let config = Config::default();
        let issuers = IssuerCache::new();
        issuers.add(ca.issuer().clone());
        let factory = RecordingFactory::default();
        let loader = DefinitionLoader {
            config: &config,
            issuers: &issuers,
            issuer_source: &NoSource,
            transports: &factory,
            fetcher: Fetcher::default(),
            stable: Arc::new(StableCaches::none()),
        };

        let def = CertDefinition {
            certificate: Some(cert_path.display().to_string()),
            ..Default::default()
        };
        let params = loader.entry_params(&def).await.unwrap();
        assert_eq!(params.name, "www.pem");
        assert_eq!(params.serial, BigUint::from(77u32));
        assert_eq!(params.responders, vec!["http://ocsp.aia.example.com"]);
        assert_eq!(params.issuer.as_ref(), ca.issuer());
    }

    #[tokio::test]
    async fn test_definition_failures() {
        let dir = tempfile::tempdir().unwrap();
        let ca = TestAuthority::new("Lonely CA");
        let leaf = TestAuthority::new("lonely.example.com");
        let cert_path = dir.path().join("lonely.pem");
        std::fs::write(&cert_path, CertificateBuilder::new(&leaf).sign(&ca)).unwrap();
        let issuer_path = dir.path().join("ca.der");
        std::fs::write(&issuer_path, CertificateBuilder::new(&ca).sign(&ca)).unwrap();

        let config = Config::default();
        let issuers = IssuerCache::new();
        let factory = RecordingFactory::default();
        let loader = DefinitionLoader {
            config: &config,
            issuers: &issuers,
            issuer_source: &NoSource,
            transports: &factory,
            fetcher: Fetcher::default(),
            stable: Arc::new(StableCaches::none()),
        };

        // No issuer path, nothing cached and no AIA
        let def = CertDefinition {
            certificate: Some(cert_path.display().to_string()),
            responders: vec!["http://ocsp.example.com".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            loader.entry_params(&def).await,
            Err(StapledError::Issuer(IssuerResolutionError::NoIssuerSource { .. }))
        ));

        // Issuer found but no responders anywhere
        let def = CertDefinition {
            certificate: Some(cert_path.display().to_string()),
            issuer: Some(issuer_path.display().to_string()),
            ..Default::default()
        };
        assert!(matches!(
            loader.entry_params(&def).await,
            Err(StapledError::Config(ConfigError::Invalid(_)))
        ));

        let def = CertDefinition {
            certificate: Some(dir.path().join("missing.pem").display().to_string()),
            ..Default::default()
        };
        assert!(matches!(
            loader.entry_params(&def).await,
            Err(StapledError::Certificate { .. })
        ));
    }
}
