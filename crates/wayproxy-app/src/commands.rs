//! Collection management and configuration commands.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};

use wayproxy_core::GatewayConfig;
use wayproxy_proxy::CaManager;
use wayproxy_storage::{ArchiveStore, FsArchiveStore, ReindexSummary};

/// Configuration file picked up from the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "wayproxy.toml";

/// Command-line overrides for `serve`.
#[derive(Debug, Clone, Default)]
pub struct ServeOverrides {
    /// Listen port.
    pub port: Option<u16>,
    /// Collection to serve.
    pub collection: Option<String>,
    /// Record instead of replay.
    pub record: bool,
}

/// Loads the configuration.
///
/// An explicit path must exist. Without one, `wayproxy.toml` in the working
/// directory is used when present, defaults otherwise.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<GatewayConfig> {
    match path {
        Some(path) => GatewayConfig::load(path)
            .with_context(|| format!("Failed to load config {:?}", path)),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => GatewayConfig::load(DEFAULT_CONFIG_FILE)
            .with_context(|| format!("Failed to load config {}", DEFAULT_CONFIG_FILE)),
        None => Ok(GatewayConfig::default()),
    }
}

/// Applies `serve` overrides and revalidates.
pub fn apply_overrides(
    mut config: GatewayConfig,
    overrides: &ServeOverrides,
) -> anyhow::Result<GatewayConfig> {
    if let Some(port) = overrides.port {
        config.listen.port = port;
    }
    if let Some(collection) = &overrides.collection {
        config.proxy.collection = collection.clone();
    }
    if overrides.record {
        config.proxy.recording = true;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Opens the archive store the configuration points at.
pub fn open_store(config: &GatewayConfig) -> FsArchiveStore {
    FsArchiveStore::new(&config.archive.collections_dir)
}

/// Creates an empty collection.
pub async fn init(store: &FsArchiveStore, collection: &str) -> anyhow::Result<()> {
    store
        .init_collection(collection)
        .await
        .with_context(|| format!("Failed to create collection {}", collection))
}

/// Rebuilds a collection index from its archive files.
pub async fn reindex(store: &FsArchiveStore, collection: &str) -> anyhow::Result<ReindexSummary> {
    store
        .reindex(collection)
        .await
        .with_context(|| format!("Failed to reindex {}", collection))
}

/// Lists collection names.
pub async fn list(store: &FsArchiveStore) -> anyhow::Result<Vec<String>> {
    Ok(store.list_collections().await?)
}

/// Copies WARC files into a collection and reindexes it.
pub async fn add(
    store: &FsArchiveStore,
    collection: &str,
    files: &[PathBuf],
) -> anyhow::Result<ReindexSummary> {
    if files.is_empty() {
        bail!("No archive files given");
    }

    for file in files {
        store
            .add_archive(collection, file)
            .await
            .with_context(|| format!("Failed to add {:?} to {}", file, collection))?;
    }

    reindex(store, collection).await
}

/// Returns the root certificate PEM, generating the root if needed.
///
/// With `out`, the PEM is also written there.
pub fn export_ca(config: &GatewayConfig, out: Option<&Path>) -> anyhow::Result<String> {
    let root = CaManager::from_options(&config.proxy)
        .ensure_root()
        .context("Failed to load root CA")?;
    let pem = root.cert_pem().to_string();

    if let Some(out) = out {
        if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(out, &pem).with_context(|| format!("Failed to write {:?}", out))?;
        tracing::info!("Wrote root certificate to {:?}", out);
    }

    Ok(pem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.archive.collections_dir = dir.path().join("collections");
        config.proxy.ca_file_cache = dir.path().join("ca").join("ca.pem");
        config
    }

    #[test]
    fn load_explicit_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "[listen]\nport = 9191\n[proxy]\ncoll = \"web\"\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.listen.port, 9191);
        assert_eq!(config.proxy.collection, "web");
    }

    #[test]
    fn load_missing_explicit_config_fails() {
        let dir = TempDir::new().unwrap();
        assert!(load_config(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn overrides_apply() {
        let overrides = ServeOverrides {
            port: Some(9000),
            collection: Some("test".into()),
            record: true,
        };
        let config = apply_overrides(GatewayConfig::default(), &overrides).unwrap();
        assert_eq!(config.listen.port, 9000);
        assert_eq!(config.proxy.collection, "test");
        assert!(config.proxy.recording);
    }

    #[test]
    fn overrides_are_validated() {
        let overrides = ServeOverrides {
            collection: Some("../bad".into()),
            ..ServeOverrides::default()
        };
        assert!(apply_overrides(GatewayConfig::default(), &overrides).is_err());
    }

    #[tokio::test]
    async fn init_list_reindex() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&config_in(&dir));

        init(&store, "alpha").await.unwrap();
        init(&store, "beta").await.unwrap();
        assert!(init(&store, "alpha").await.is_err());

        assert_eq!(list(&store).await.unwrap(), vec!["alpha", "beta"]);

        let summary = reindex(&store, "alpha").await.unwrap();
        assert_eq!(summary, ReindexSummary::default());
    }

    #[tokio::test]
    async fn add_requires_files() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&config_in(&dir));
        init(&store, "alpha").await.unwrap();

        assert!(add(&store, "alpha", &[]).await.is_err());
        assert!(add(&store, "alpha", &[dir.path().join("missing.warc.gz")])
            .await
            .is_err());
    }

    #[test]
    fn export_ca_writes_pem() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let out = dir.path().join("export").join("root.pem");

        let pem = export_ca(&config, Some(&out)).unwrap();
        assert!(pem.contains("BEGIN CERTIFICATE"));
        assert!(!pem.contains("PRIVATE KEY"));
        assert_eq!(std::fs::read_to_string(&out).unwrap(), pem);

        // same root on the second call
        assert_eq!(export_ca(&config, None).unwrap(), pem);
    }
}
