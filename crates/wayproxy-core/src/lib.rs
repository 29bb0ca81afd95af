//! Wayproxy Core - capture model, configuration, and URL/time helpers.
//!
//! This crate holds the types shared by the archive store and the proxy:
//!
//! - [`CaptureRecord`] and [`MementoDescriptor`], the archived response and
//!   its temporal identity
//! - [`ProxyOptions`] and [`GatewayConfig`], loaded from TOML
//! - [`RouteSpec`], the `/<coll>/[record/]<mod>/` route prefix
//! - URL canonicalization ([`urlkey`]) and datetime formats ([`timestamp`])

pub mod capture;
pub mod config;
pub mod error;
pub mod route;
pub mod timestamp;
pub mod urlkey;

pub use capture::{mime_essence, CaptureRecord, CapturedRequest, MementoDescriptor};
pub use config::{
    ArchiveConfig, GatewayConfig, ListenConfig, LoggingConfig, ProxyOptions, UpstreamConfig,
    DEFAULT_CA_NAME, DEFAULT_COLLECTION, DEFAULT_MAGIC_HOST, DEFAULT_PROXY_PORT,
};
pub use error::{ConfigError, Result, TimestampError};
pub use route::{validate_collection_name, RouteSpec, DEFAULT_MODIFIER};
pub use urlkey::{canonical_key, target_url};
