//! Root certificate authority for the MITM proxy.
//!
//! The root certificate and its key live together in one PEM file. The file
//! is generated on first run and reused afterwards, so clients only have to
//! trust the root once.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Datelike, Utc};
use hudsucker::rcgen::{
    date_time_ymd, BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SerialNumber,
};
use sha2::{Digest, Sha256};

use wayproxy_core::ProxyOptions;

pub use crate::error::CaManagerError;

const CERTIFICATE_TAG: &str = "CERTIFICATE";
const PRIVATE_KEY_TAG: &str = "PRIVATE KEY";

/// Years a root certificate stays valid.
const ROOT_VALIDITY_YEARS: i32 = 10;

/// Years an issued host certificate stays valid.
const LEAF_VALIDITY_YEARS: i32 = 2;

/// Manages the root CA file.
#[derive(Debug, Clone)]
pub struct CaManager {
    /// Common name of the root.
    ca_name: String,
    /// PEM file holding the root certificate and key.
    ca_file: PathBuf,
}

impl CaManager {
    /// Creates a manager for the given profile name and file.
    pub fn new(ca_name: impl Into<String>, ca_file: impl AsRef<Path>) -> Self {
        Self {
            ca_name: ca_name.into(),
            ca_file: ca_file.as_ref().to_path_buf(),
        }
    }

    /// Creates a manager from the proxy options.
    pub fn from_options(options: &ProxyOptions) -> Self {
        Self::new(&options.ca_name, &options.ca_file_cache)
    }

    /// Returns the path to the root PEM file.
    pub fn ca_file(&self) -> &Path {
        &self.ca_file
    }

    /// Returns the root profile name.
    pub fn ca_name(&self) -> &str {
        &self.ca_name
    }

    /// Checks if the root file exists.
    pub fn ca_exists(&self) -> bool {
        self.ca_file.exists()
    }

    /// Loads the root, generating it first if necessary.
    pub fn ensure_root(&self) -> Result<RootIdentity, CaManagerError> {
        if !self.ca_exists() {
            self.generate_ca()?;
        }
        self.load_root()
    }

    /// Generates a new root certificate and key and writes them out.
    pub fn generate_ca(&self) -> Result<(), CaManagerError> {
        if let Some(parent) = self.ca_file.parent() {
            fs::create_dir_all(parent)?;
        }

        let key_pair =
            KeyPair::generate().map_err(|e| CaManagerError::Generation(e.to_string()))?;

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, self.ca_name.as_str());
        params
            .distinguished_name
            .push(DnType::OrganizationName, self.ca_name.as_str());
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(SerialNumber::from(rand::random::<u64>()));

        let today = Utc::now().date_naive();
        params.not_before = date_time_ymd(today.year() - 1, 1, 1);
        params.not_after = date_time_ymd(today.year() + ROOT_VALIDITY_YEARS, 1, 1);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;

        // certificate first, key second, one file
        let pem = format!("{}{}", cert.pem(), key_pair.serialize_pem());
        write_private(&self.ca_file, pem.as_bytes())
            .map_err(|e| CaManagerError::Write(e.to_string()))?;

        tracing::info!("Generated new root CA {:?} at {:?}", self.ca_name, self.ca_file);

        Ok(())
    }

    /// Loads the root from its PEM file.
    pub fn load_root(&self) -> Result<RootIdentity, CaManagerError> {
        let content = fs::read_to_string(&self.ca_file)?;
        let blocks = pem::parse_many(content.as_bytes())
            .map_err(|e| CaManagerError::Parse(e.to_string()))?;

        let cert = blocks
            .iter()
            .find(|p| p.tag() == CERTIFICATE_TAG)
            .ok_or_else(|| CaManagerError::Parse("no certificate in root file".into()))?;
        let key = blocks
            .iter()
            .find(|p| p.tag().ends_with(PRIVATE_KEY_TAG))
            .ok_or_else(|| CaManagerError::Parse("no private key in root file".into()))?;

        let root = RootIdentity {
            name: self.ca_name.clone(),
            cert_pem: pem::encode(cert),
            key_pem: pem::encode(key),
            fingerprint: hex_digest(cert.contents()),
        };

        // fail at startup, not on the first handshake
        root.issuer()?;

        tracing::info!(
            "Loaded root CA {:?} from {:?} (fingerprint {})",
            self.ca_name,
            self.ca_file,
            root.short_fingerprint()
        );

        Ok(root)
    }
}

/// The loaded root identity.
///
/// Loaded once at startup and shared by reference; never changes afterwards.
#[derive(Clone)]
pub struct RootIdentity {
    name: String,
    cert_pem: String,
    key_pem: String,
    fingerprint: String,
}

impl std::fmt::Debug for RootIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootIdentity")
            .field("name", &self.name)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl RootIdentity {
    /// Root profile name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Root certificate, PEM encoded.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// SHA-256 of the root certificate DER, hex encoded.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// First 16 hex digits of the fingerprint.
    pub fn short_fingerprint(&self) -> &str {
        &self.fingerprint[..16.min(self.fingerprint.len())]
    }

    fn issuer(&self) -> Result<Issuer<'_, KeyPair>, CaManagerError> {
        let key_pair =
            KeyPair::from_pem(&self.key_pem).map_err(|e| CaManagerError::Parse(e.to_string()))?;
        Issuer::from_ca_cert_pem(&self.cert_pem, key_pair)
            .map_err(|e| CaManagerError::Parse(e.to_string()))
    }

    /// Signs a fresh certificate for `host`.
    ///
    /// Returns the certificate and key, both PEM encoded.
    pub fn issue(&self, host: &str) -> Result<(String, String), CaManagerError> {
        let fail = |e: &dyn std::fmt::Display| CaManagerError::Issue {
            host: host.to_string(),
            reason: e.to_string(),
        };

        let mut params = CertificateParams::new(vec![host.to_string()]).map_err(|e| fail(&e))?;
        params.distinguished_name.push(DnType::CommonName, host);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(SerialNumber::from(rand::random::<u64>()));

        let today = Utc::now().date_naive();
        params.not_before = date_time_ymd(today.year() - 1, today.month() as u8, 1);
        params.not_after = date_time_ymd(
            today.year() + LEAF_VALIDITY_YEARS,
            today.month() as u8,
            1,
        );

        let key_pair = KeyPair::generate().map_err(|e| fail(&e))?;
        let issuer = self.issuer()?;
        let cert = params.signed_by(&key_pair, &issuer).map_err(|e| fail(&e))?;

        Ok((cert.pem(), key_pair.serialize_pem()))
    }
}

/// SHA-256 of `data`, lowercase hex.
pub(crate) fn hex_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Writes `data` readable by the owner only.
#[cfg(unix)]
pub(crate) fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)
}

#[cfg(not(unix))]
pub(crate) fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    fs::write(path, data)
}
