//! Proxy route prefixes.
//!
//! A proxy route binds every request the gateway sees to one collection and
//! one mode. It is written as a path prefix:
//!
//! ```text
//! /<coll>/bn_/          replay from <coll>, banner-only modifier
//! /<coll>/record/bn_/   record into <coll>, banner-only modifier
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Modifier used when a route does not name one.
pub const DEFAULT_MODIFIER: &str = "bn_";

const RECORD_SEGMENT: &str = "record";

/// A parsed proxy route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    /// Collection the route reads from or records into.
    pub collection: String,
    /// Whether the route records live traffic.
    pub record: bool,
    /// Replay modifier (`bn_`, `id_`, ...).
    pub modifier: String,
}

impl RouteSpec {
    /// Creates a replay route for a collection.
    pub fn replay(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            record: false,
            modifier: DEFAULT_MODIFIER.to_string(),
        }
    }

    /// Creates a record route for a collection.
    pub fn recording(collection: impl Into<String>) -> Self {
        Self {
            record: true,
            ..Self::replay(collection)
        }
    }

    /// Parses a route prefix such as `/test/record/bn_/`.
    pub fn parse_prefix(prefix: &str) -> Result<Self> {
        let segments: Vec<&str> = prefix.split('/').filter(|s| !s.is_empty()).collect();

        let (collection, rest) = segments
            .split_first()
            .ok_or_else(|| ConfigError::InvalidPrefix(prefix.to_string()))?;
        validate_collection_name(collection)?;

        let (record, rest) = match rest.split_first() {
            Some((&RECORD_SEGMENT, tail)) => (true, tail),
            _ => (false, rest),
        };

        let modifier = match rest {
            [] => DEFAULT_MODIFIER.to_string(),
            [modifier] if is_modifier(modifier) => modifier.to_string(),
            _ => return Err(ConfigError::InvalidPrefix(prefix.to_string())),
        };

        Ok(Self {
            collection: collection.to_string(),
            record,
            modifier,
        })
    }

    /// Renders the route back into prefix form.
    pub fn prefix(&self) -> String {
        if self.record {
            format!("/{}/{}/{}/", self.collection, RECORD_SEGMENT, self.modifier)
        } else {
            format!("/{}/{}/", self.collection, self.modifier)
        }
    }
}

impl std::fmt::Display for RouteSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.prefix())
    }
}

/// Checks that a collection name is non-empty and filesystem safe.
pub fn validate_collection_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != RECORD_SEGMENT
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');

    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidCollection(name.to_string()))
    }
}

fn is_modifier(segment: &str) -> bool {
    segment.len() > 1
        && segment.ends_with('_')
        && segment[..segment.len() - 1]
            .bytes()
            .all(|b| b.is_ascii_lowercase())
}
