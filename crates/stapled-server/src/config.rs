use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// One certificate to keep a stapled response for
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertDefinition {
    /// Path to the certificate (PEM or DER)
    #[serde(default)]
    pub certificate: Option<String>,
    /// Entry name; required when `serial` is used
    #[serde(default)]
    pub name: Option<String>,
    /// Hex serial number, used instead of reading a certificate
    #[serde(default)]
    pub serial: Option<String>,
    /// Path to the issuer certificate
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub responders: Vec<String>,
    #[serde(default)]
    pub proxy: Option<String>,
    /// File name for the persisted response instead of the lookup key
    #[serde(default)]
    pub response_name: Option<String>,
    #[serde(default)]
    pub override_global_upstream: bool,
    #[serde(default)]
    pub override_global_proxy: bool,
}

impl CertDefinition {
    /// Serial number given in hex, if any
    pub fn parse_serial(&self) -> Result<Option<BigUint>, ConfigError> {
        let Some(serial) = self.serial.as_deref() else {
            return Ok(None);
        };
        let bytes = hex::decode(serial.trim()).map_err(|e| {
            ConfigError::Invalid(format!("failed to decode serial '{}': {}", serial, e))
        })?;
        Ok(Some(BigUint::from_bytes_be(&bytes)))
    }

    /// Name used for logs: explicit name, else the certificate file name
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        self.certificate
            .as_deref()
            .map(|path| {
                Path::new(path)
                    .file_name()
                    .map(|f| f.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.to_string())
            })
            .unwrap_or_else(|| "(unnamed)".to_string())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.certificate.is_none() && (self.serial.is_none() || self.name.is_none()) {
            return Err(ConfigError::Invalid(
                "either 'certificate' or 'name' and 'serial' are required".to_string(),
            ));
        }
        if self.parse_serial()?.is_some() && self.issuer.is_none() {
            return Err(ConfigError::Invalid(format!(
                "{}: 'issuer' is required when 'serial' is used",
                self.display_name()
            )));
        }
        if let Some(proxy) = &self.proxy {
            validate_url(proxy, "proxy")?;
        }
        for responder in &self.responders {
            validate_url(responder, "responder")?;
        }
        Ok(())
    }
}

fn validate_url(url: &str, what: &str) -> Result<(), ConfigError> {
    reqwest::Url::parse(url)
        .map(|_| ())
        .map_err(|e| ConfigError::Invalid(format!("Invalid {} URL '{}': {}", what, url, e)))
}

/// HTTP responder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_addr")]
    pub addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> String {
    "127.0.0.1:8080".to_string()
}

/// On-disk response cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskConfig {
    #[serde(default)]
    pub cache_folder: Option<String>,
}

/// Upstream fetch behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    /// Deadline for one refresh, including retries
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_base_backoff_secs")]
    pub base_backoff_secs: u64,
    #[serde(default)]
    pub proxy: Option<String>,
    /// Responders that replace every definition's own list
    #[serde(default)]
    pub upstream_responders: Vec<String>,
    /// How long a request waits for another request's in-flight fetch
    #[serde(default = "default_fill_wait_secs")]
    pub fill_wait_secs: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            base_backoff_secs: default_base_backoff_secs(),
            proxy: None,
            upstream_responders: Vec::new(),
            fill_wait_secs: default_fill_wait_secs(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_base_backoff_secs() -> u64 {
    10
}

fn default_fill_wait_secs() -> u64 {
    10
}

/// Refresh scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Refresh this long before nextUpdate
    #[serde(default = "default_safety_margin_secs")]
    pub safety_margin_secs: u64,
    /// Upper bound between refreshes
    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            safety_margin_secs: default_safety_margin_secs(),
            max_interval_secs: default_max_interval_secs(),
        }
    }
}

fn default_safety_margin_secs() -> u64 {
    3600
}

fn default_max_interval_secs() -> u64 {
    43200
}

/// Where certificate definitions come from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefinitionsConfig {
    /// Folder watched for removed certificates
    #[serde(default)]
    pub folder: Option<String>,
    /// Issuer certificates loaded at startup
    #[serde(default)]
    pub issuer_folder: Option<String>,
    #[serde(default)]
    pub certificates: Vec<CertDefinition>,
}

/// Daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Keep serving responses past nextUpdate instead of dropping them
    #[serde(default)]
    pub dont_die_on_stale_response: bool,
    #[serde(default)]
    pub dont_seed_cache_from_disk: bool,
    /// Disable the disk backend entirely
    #[serde(default)]
    pub dont_cache: bool,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub http: HttpConfig,
    /// Prometheus `/metrics` listener; off when unset
    #[serde(default)]
    pub stats_addr: Option<String>,
    #[serde(default)]
    pub disk: DiskConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub definitions: DefinitionsConfig,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get socket address for the HTTP responder
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.http
            .addr
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("Invalid HTTP address: {}", self.http.addr)))
    }

    /// Socket address for the stats listener, if one is configured
    pub fn stats_socket_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        let Some(addr) = self.stats_addr.as_deref() else {
            return Ok(None);
        };
        addr.parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("Invalid stats address: {}", addr)))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetcher.timeout_secs)
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_secs(self.fetcher.base_backoff_secs)
    }

    pub fn fill_wait(&self) -> Duration {
        Duration::from_secs(self.fetcher.fill_wait_secs)
    }

    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.refresh.safety_margin_secs)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.refresh.max_interval_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.socket_addr()?;
        self.stats_socket_addr()?;

        if self.fetcher.timeout_secs == 0 {
            return Err(ConfigError::Invalid("fetcher timeout cannot be 0".to_string()));
        }
        if self.fetcher.base_backoff_secs == 0 {
            return Err(ConfigError::Invalid("fetcher base backoff cannot be 0".to_string()));
        }
        if self.refresh.max_interval_secs == 0 {
            return Err(ConfigError::Invalid("refresh max interval cannot be 0".to_string()));
        }

        if let Some(proxy) = &self.fetcher.proxy {
            validate_url(proxy, "proxy")?;
        }
        for responder in &self.fetcher.upstream_responders {
            validate_url(responder, "upstream responder")?;
        }

        for definition in &self.definitions.certificates {
            definition.validate()?;
        }

        Ok(())
    }

    /// Create an example configuration file
    pub fn example() -> Self {
        Config {
            dont_die_on_stale_response: false,
            dont_seed_cache_from_disk: false,
            dont_cache: false,
            log_level: Some("info".to_string()),
            http: HttpConfig {
                addr: "127.0.0.1:8080".to_string(),
            },
            stats_addr: Some("127.0.0.1:9090".to_string()),
            disk: DiskConfig {
                cache_folder: Some("/var/cache/stapled".to_string()),
            },
            fetcher: FetcherConfig::default(),
            refresh: RefreshConfig::default(),
            definitions: DefinitionsConfig {
                folder: Some("/etc/stapled/certs".to_string()),
                issuer_folder: Some("/etc/stapled/issuers".to_string()),
                certificates: vec![
                    CertDefinition {
                        certificate: Some("/etc/stapled/certs/www.example.com.pem".to_string()),
                        issuer: Some("/etc/stapled/issuers/example-ca.pem".to_string()),
                        ..Default::default()
                    },
                    CertDefinition {
                        name: Some("api.example.com".to_string()),
                        serial: Some("0102".to_string()),
                        issuer: Some("/etc/stapled/issuers/example-ca.pem".to_string()),
                        responders: vec!["http://ocsp.example.com".to_string()],
                        response_name: Some("api.example.com.ocsp".to_string()),
                        ..Default::default()
                    },
                ],
            },
        }
    }
}
