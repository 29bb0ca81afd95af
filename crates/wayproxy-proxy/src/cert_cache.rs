//! Per-host certificate cache.
//!
//! Host certificates are issued on the first CONNECT to a host and reused
//! from then on. Concurrent first requests for the same host share a single
//! in-flight issuance. Issued certificates are also written to disk, under a
//! directory named after the root fingerprint, so a restart with the same
//! root serves the same certificates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use http::uri::Authority;
use hudsucker::certificate_authority::CertificateAuthority;
use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use hudsucker::rustls::server::{ClientHello, ResolvesServerCert};
use hudsucker::rustls::sign::CertifiedKey;
use hudsucker::rustls::ServerConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::ca::{write_private, CaManagerError, RootIdentity};

/// An issued host certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateEntry {
    /// Host the certificate is for.
    pub hostname: String,
    /// Certificate, PEM encoded.
    pub cert_pem: String,
    /// Private key, PEM encoded.
    pub key_pem: String,
    /// When the certificate was issued.
    pub issued_at: DateTime<Utc>,
}

impl CertificateEntry {
    /// Builds a TLS server configuration presenting this certificate.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, CaManagerError> {
        let fail = |reason: String| CaManagerError::Issue {
            host: self.hostname.clone(),
            reason,
        };

        let cert = pem::parse(&self.cert_pem).map_err(|e| fail(e.to_string()))?;
        let key = pem::parse(&self.key_pem).map_err(|e| fail(e.to_string()))?;

        let cert_der = CertificateDer::from(cert.contents().to_vec());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.contents().to_vec()));

        let mut config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| fail(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .map_err(|e| fail(e.to_string()))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }
}

struct Issued {
    entry: CertificateEntry,
    config: Arc<ServerConfig>,
}

/// Single-flight cache of host certificates signed by one root.
///
/// Cheap to clone; clones share the same entries.
#[derive(Clone)]
pub struct CertificateCache {
    inner: Arc<CacheState>,
}

struct CacheState {
    root: Arc<RootIdentity>,
    dir: PathBuf,
    entries: Mutex<HashMap<String, Arc<OnceCell<Arc<Issued>>>>>,
    issued: AtomicUsize,
    fallback: Arc<ServerConfig>,
}

impl std::fmt::Debug for CertificateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateCache")
            .field("root", &self.inner.root)
            .field("dir", &self.inner.dir)
            .field("hosts", &self.inner.entries.lock().len())
            .field("issued", &self.issued_count())
            .finish()
    }
}

impl CertificateCache {
    /// Creates a cache persisting certificates under `cache_dir`.
    pub fn new(root: Arc<RootIdentity>, cache_dir: impl AsRef<Path>) -> Result<Self, CaManagerError> {
        let dir = cache_dir.as_ref().join(root.short_fingerprint());

        // presented when issuance fails: the handshake is refused
        let fallback = ServerConfig::builder_with_provider(Arc::new(default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| CaManagerError::Generation(e.to_string()))?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(NoCertificate));

        Ok(Self {
            inner: Arc::new(CacheState {
                root,
                dir,
                entries: Mutex::new(HashMap::new()),
                issued: AtomicUsize::new(0),
                fallback: Arc::new(fallback),
            }),
        })
    }

    /// The root signing every certificate in this cache.
    pub fn root(&self) -> &RootIdentity {
        &self.inner.root
    }

    /// Directory holding persisted certificates.
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Number of certificates issued (not loaded from disk) by this cache.
    pub fn issued_count(&self) -> usize {
        self.inner.issued.load(Ordering::SeqCst)
    }

    /// Returns the certificate for `hostname`, issuing it on first use.
    pub async fn get_certificate(&self, hostname: &str) -> Result<CertificateEntry, CaManagerError> {
        Ok(self.get_or_issue(hostname).await?.entry.clone())
    }

    /// Returns the TLS server configuration for `hostname`.
    pub async fn server_config(&self, hostname: &str) -> Result<Arc<ServerConfig>, CaManagerError> {
        Ok(self.get_or_issue(hostname).await?.config.clone())
    }

    async fn get_or_issue(&self, hostname: &str) -> Result<Arc<Issued>, CaManagerError> {
        let host = normalize_host(hostname);

        let cell = {
            let mut entries = self.inner.entries.lock();
            entries
                .entry(host.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        // a failed init leaves the cell empty, so the next request retries
        let issued = cell.get_or_try_init(|| self.load_or_issue(&host)).await?;
        Ok(issued.clone())
    }

    async fn load_or_issue(&self, host: &str) -> Result<Arc<Issued>, CaManagerError> {
        let path = self.entry_path(host);

        if let Some(entry) = self.load(&path, host).await {
            match entry.server_config() {
                Ok(config) => {
                    debug!("Loaded certificate for {} from {:?}", host, path);
                    return Ok(Arc::new(Issued { entry, config }));
                }
                Err(e) => warn!("Ignoring cached certificate for {}: {}", host, e),
            }
        }

        let (cert_pem, key_pem) = self.inner.root.issue(host)?;
        let entry = CertificateEntry {
            hostname: host.to_string(),
            cert_pem,
            key_pem,
            issued_at: Utc::now(),
        };
        let config = entry.server_config()?;
        self.inner.issued.fetch_add(1, Ordering::SeqCst);
        info!("Issued certificate for {}", host);

        if let Err(e) = self.persist(&path, &entry).await {
            warn!("Failed to persist certificate for {}: {}", host, e);
        }

        Ok(Arc::new(Issued { entry, config }))
    }

    async fn load(&self, path: &Path, host: &str) -> Option<CertificateEntry> {
        let content = tokio::fs::read_to_string(path).await.ok()?;
        match serde_json::from_str::<CertificateEntry>(&content) {
            Ok(entry) if entry.hostname == host => Some(entry),
            Ok(entry) => {
                warn!("Cached certificate {:?} is for {}, not {}", path, entry.hostname, host);
                None
            }
            Err(e) => {
                warn!("Unreadable cached certificate {:?}: {}", path, e);
                None
            }
        }
    }

    async fn persist(&self, path: &Path, entry: &CertificateEntry) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.inner.dir).await?;

        let json = serde_json::to_vec_pretty(entry).map_err(std::io::Error::other)?;
        let tmp = path.with_extension(format!("tmp-{:08x}", rand::random::<u32>()));
        // the entry holds the leaf private key
        let target = tmp.clone();
        tokio::task::spawn_blocking(move || write_private(&target, &json))
            .await
            .map_err(std::io::Error::other)??;
        tokio::fs::rename(&tmp, path).await
    }

    fn entry_path(&self, host: &str) -> PathBuf {
        let name: String = host
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.inner.dir.join(format!("{}.json", name))
    }
}

impl CertificateAuthority for CertificateCache {
    async fn gen_server_config(&self, authority: &Authority) -> Arc<ServerConfig> {
        match self.server_config(authority.host()).await {
            Ok(config) => config,
            Err(e) => {
                error!("Certificate issuance failed for {}: {}", authority.host(), e);
                self.inner.fallback.clone()
            }
        }
    }
}

#[derive(Debug)]
struct NoCertificate;

impl ResolvesServerCert for NoCertificate {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        None
    }
}

fn normalize_host(hostname: &str) -> String {
    hostname
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}
