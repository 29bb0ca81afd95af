//! Wayproxy - web archive replay/record proxy.
//!
//! Runs the proxy (`serve`) and manages collections (`init`, `reindex`,
//! `list`, `add`) and the root CA (`export-ca`).

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wayproxy_app::commands::{self, ServeOverrides};
use wayproxy_core::GatewayConfig;
use wayproxy_proxy::ProxyServer;
use wayproxy_storage::ArchiveStore;

/// Wayproxy - web archive replay/record proxy
#[derive(Parser, Debug)]
#[command(name = "wayproxy", version, about)]
struct Cli {
    /// Configuration file (defaults to ./wayproxy.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the proxy until Ctrl-C
    Serve {
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// Collection to replay from or record into
        #[arg(long)]
        coll: Option<String>,

        /// Record live traffic instead of replaying
        #[arg(long)]
        record: bool,
    },

    /// Create an empty collection
    Init {
        /// Collection name
        coll: String,
    },

    /// Rebuild a collection index from its archive files
    Reindex {
        /// Collection name
        coll: String,
    },

    /// List collections
    List,

    /// Add WARC files to a collection and reindex it
    Add {
        /// Collection name
        coll: String,

        /// `.warc.gz` files to add
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Print or write the root CA certificate
    ExportCa {
        /// Write the PEM here instead of printing it
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

/// Get the logs directory path.
fn logs_dir(config: &GatewayConfig) -> Option<PathBuf> {
    config.logging.dir.clone().or_else(|| {
        ProjectDirs::from("", "wayproxy", "Wayproxy").map(|dirs| dirs.data_dir().join("logs"))
    })
}

/// Initialize logging, with daily-rotated files when `log_dir` is usable.
fn init_logging(
    log_level: &str,
    log_dir: Option<PathBuf>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("wayproxy={},warn", log_level)));

    if let Some(log_dir) = log_dir {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("wayproxy")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
        tracing::warn!("File logging unavailable, using console only");
        return None;
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
    None
}

async fn serve(config: GatewayConfig, overrides: ServeOverrides) -> anyhow::Result<()> {
    let config = commands::apply_overrides(config, &overrides)?;
    let store = Arc::new(commands::open_store(&config));

    let route = config.proxy.route()?;
    if !store.has_collection(&route.collection).await? {
        if route.record {
            commands::init(&store, &route.collection).await?;
        } else {
            tracing::warn!(
                "Collection {} does not exist; every replay will be a 404",
                route.collection
            );
        }
    }

    let server = ProxyServer::new(&config, store)?;
    tracing::info!("CA certificate: {:?}", config.proxy.ca_file_cache);

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await?;

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;

    let log_level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let log_dir = match cli.command {
        Command::Serve { .. } => logs_dir(&config),
        _ => None,
    };
    let _guard = init_logging(&log_level, log_dir);

    tracing::debug!("Wayproxy v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Serve { port, coll, record } => {
            serve(
                config,
                ServeOverrides {
                    port,
                    collection: coll,
                    record,
                },
            )
            .await?;
        }
        Command::Init { coll } => {
            let store = commands::open_store(&config);
            commands::init(&store, &coll).await?;
            println!("Created collection {}", coll);
        }
        Command::Reindex { coll } => {
            let store = commands::open_store(&config);
            let summary = commands::reindex(&store, &coll).await?;
            println!(
                "Reindexed {}: {} records from {} files ({} skipped)",
                coll, summary.records, summary.files, summary.skipped
            );
        }
        Command::List => {
            let store = commands::open_store(&config);
            for name in commands::list(&store).await? {
                println!("{}", name);
            }
        }
        Command::Add { coll, files } => {
            let store = commands::open_store(&config);
            let summary = commands::add(&store, &coll, &files).await?;
            println!(
                "Added {} files to {}; index now holds {} records",
                files.len(),
                coll,
                summary.records
            );
        }
        Command::ExportCa { out } => {
            let pem = commands::export_ca(&config, out.as_deref())?;
            if out.is_none() {
                print!("{}", pem);
            }
        }
    }

    Ok(())
}
