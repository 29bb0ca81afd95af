//! Gateway configuration.
//!
//! Configuration is read from a TOML file. Every section and field has a
//! default, so an empty file is a valid replay-only configuration:
//!
//! ```toml
//! [listen]
//! host = "127.0.0.1"
//! port = 8080
//!
//! [proxy]
//! coll = "pywb"
//! recording = false
//! use_banner = true
//! use_head_insert = true
//! use_wombat = false
//! use_preserve_worker = false
//! ca_name = "pywb HTTPS Proxy CA"
//! ca_file_cache = "proxy-certs/pywb-ca.pem"
//!
//! [archive]
//! collections_dir = "collections"
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::route::{validate_collection_name, RouteSpec};

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8080;

/// Default collection served by the proxy.
pub const DEFAULT_COLLECTION: &str = "pywb";

/// Reserved pseudo-host for the helper endpoints.
pub const DEFAULT_MAGIC_HOST: &str = "pywb.proxy";

/// Default root CA profile name.
pub const DEFAULT_CA_NAME: &str = "pywb HTTPS Proxy CA";

/// Per-route proxy options.
///
/// Resolved once and treated as read-only by the router built from it;
/// changing any option means building a new router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyOptions {
    /// Collection bound at startup.
    #[serde(rename = "coll", alias = "collection")]
    pub collection: String,
    /// Whether live recording is enabled.
    pub recording: bool,
    /// Insert the visible banner.
    pub use_banner: bool,
    /// Insert the head marker fragment.
    pub use_head_insert: bool,
    /// Include the full client-side rewriting shim.
    pub use_wombat: bool,
    /// Include the preservation worker shim.
    pub use_preserve_worker: bool,
    /// Explicit route prefix, overriding the default route.
    pub proxy_prefix: Option<String>,
    /// Reserved pseudo-host serving the helper endpoints.
    pub magic_host: String,
    /// Root CA profile name.
    pub ca_name: String,
    /// File holding the root CA certificate and key.
    pub ca_file_cache: PathBuf,
    /// Directory for issued host certificates.
    ///
    /// Defaults to a `certs` directory next to the root CA file.
    pub cert_cache_dir: Option<PathBuf>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            collection: DEFAULT_COLLECTION.to_string(),
            recording: false,
            use_banner: true,
            use_head_insert: true,
            use_wombat: false,
            use_preserve_worker: false,
            proxy_prefix: None,
            magic_host: DEFAULT_MAGIC_HOST.to_string(),
            ca_name: DEFAULT_CA_NAME.to_string(),
            ca_file_cache: PathBuf::from("proxy-certs").join("pywb-ca.pem"),
            cert_cache_dir: None,
        }
    }
}

impl ProxyOptions {
    /// Creates options for a collection with defaults for everything else.
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ..Self::default()
        }
    }

    /// Enables or disables live recording.
    pub fn with_recording(mut self, recording: bool) -> Self {
        self.recording = recording;
        self
    }

    /// Enables or disables the banner.
    pub fn with_banner(mut self, use_banner: bool) -> Self {
        self.use_banner = use_banner;
        self
    }

    /// Enables or disables the head insert.
    pub fn with_head_insert(mut self, use_head_insert: bool) -> Self {
        self.use_head_insert = use_head_insert;
        self
    }

    /// Enables or disables the full rewriting shim.
    pub fn with_wombat(mut self, use_wombat: bool) -> Self {
        self.use_wombat = use_wombat;
        self
    }

    /// Enables or disables the preservation worker.
    pub fn with_preserve_worker(mut self, use_preserve_worker: bool) -> Self {
        self.use_preserve_worker = use_preserve_worker;
        self
    }

    /// Sets an explicit route prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.proxy_prefix = Some(prefix.into());
        self
    }

    /// Sets the root CA profile name and file.
    pub fn with_ca(mut self, ca_name: impl Into<String>, ca_file_cache: impl Into<PathBuf>) -> Self {
        self.ca_name = ca_name.into();
        self.ca_file_cache = ca_file_cache.into();
        self
    }

    /// Directory holding issued host certificates.
    pub fn cert_cache_dir(&self) -> PathBuf {
        self.cert_cache_dir.clone().unwrap_or_else(|| {
            self.ca_file_cache
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("certs")
        })
    }

    /// Resolves the route this configuration serves.
    ///
    /// An explicit prefix wins; otherwise the default collection is recorded
    /// into when recording is on and replayed otherwise.
    pub fn route(&self) -> Result<RouteSpec> {
        let route = match &self.proxy_prefix {
            Some(prefix) => RouteSpec::parse_prefix(prefix)?,
            None if self.recording => RouteSpec::recording(&self.collection),
            None => RouteSpec::replay(&self.collection),
        };

        if route.record && !self.recording {
            return Err(ConfigError::RecordingDisabled(route.prefix()));
        }

        Ok(route)
    }

    /// Validates the options.
    pub fn validate(&self) -> Result<()> {
        validate_collection_name(&self.collection)?;

        if self.ca_name.trim().is_empty() {
            return Err(ConfigError::Invalid("ca_name must not be empty".into()));
        }

        if self.magic_host.trim().is_empty() || self.magic_host.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "invalid magic_host: {:?}",
                self.magic_host
            )));
        }

        self.route().map(|_| ())
    }
}

/// Listen address section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Host to bind to.
    pub host: IpAddr,
    /// Port to bind to.
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PROXY_PORT,
        }
    }
}

impl ListenConfig {
    /// Socket address to bind.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Archive storage section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Root directory holding one subdirectory per collection.
    pub collections_dir: PathBuf,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            collections_dir: PathBuf::from("collections"),
        }
    }
}

/// Upstream fetch section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Whole-request timeout in seconds.
    pub timeout_secs: u64,
    /// User agent sent when the client supplied none.
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: concat!("wayproxy/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl UpstreamConfig {
    /// Request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Logging section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace).
    pub level: String,
    /// Directory for rotated log files; console only when unset.
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listen address.
    pub listen: ListenConfig,
    /// Proxy options.
    pub proxy: ProxyOptions,
    /// Archive storage.
    pub archive: ArchiveConfig,
    /// Upstream fetching.
    pub upstream: UpstreamConfig,
    /// Logging.
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// Loads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml(&content)?;
        tracing::debug!("Loaded configuration from {:?}", path.as_ref());
        Ok(config)
    }

    /// Parses and validates configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<()> {
        self.proxy.validate()?;

        if self.upstream.timeout_secs == 0 {
            return Err(ConfigError::Invalid("upstream.timeout_secs must be > 0".into()));
        }

        Ok(())
    }
}
