//! Error types for the core crate.

use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// Configuration errors are fatal at router construction time.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Collection name is empty or contains path-unsafe characters.
    #[error("invalid collection name: {0:?}")]
    InvalidCollection(String),

    /// Proxy prefix could not be parsed into a route.
    #[error("invalid proxy prefix: {0:?}")]
    InvalidPrefix(String),

    /// A record route was requested while recording is disabled.
    #[error("route {0:?} records but recording is disabled")]
    RecordingDisabled(String),

    /// Any other invalid option.
    #[error("invalid option: {0}")]
    Invalid(String),
}

/// Errors raised while converting between datetime formats.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimestampError {
    /// Not an RFC 1123 / RFC 2822 HTTP date.
    #[error("invalid HTTP date: {0:?}")]
    InvalidHttpDate(String),

    /// Not a 14-digit archive timestamp.
    #[error("invalid timestamp: {0:?}")]
    InvalidTimestamp(String),

    /// Not a WARC-Date value.
    #[error("invalid WARC date: {0:?}")]
    InvalidWarcDate(String),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
