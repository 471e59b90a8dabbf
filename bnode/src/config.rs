//! Tree configuration.
//!
//! Settings are plain values with defaults and can be overridden from
//! environment variables.
//!
//! # Environment Variables
//!
//! - `BNODE_NODE_SIZE`: node block size in bytes (default: `4096`)
//! - `BNODE_MAX_NODES`: node ids a tree may use (default: all the head can track)
//! - `BNODE_CACHE_ACTIVE`: active LRU bound (default: `64`)
//! - `BNODE_CACHE_PASSIVE`: passive LRU bound (default: `256`)
//! - `BNODE_CACHE_MAX_RESIDENT`: resident node bound (default: `1024`)
//! - `BNODE_MERGE_DIVISOR`: merge when free space exceeds `capacity / divisor` (default: `3`)
//! - `BNODE_CHECKSUMS`: `true`/`false`, CRC32 per block (default: `true`)
//!
//! # Invariants
//!
//! After `validate()` succeeds:
//! - `node_size` is a power of two in `128..=65536`
//! - every record the tree accepts fits three times into one node, so a
//!   split always produces two valid halves

use crate::storage::cache::CacheLimits;
use crate::storage::head::bitmap_capacity_bits;
use crate::storage::node::{CHILD_ID_SIZE, NodeId, OFFSET_SIZE, capacity_for, record_len};

/// Configuration of one tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeConfig {
    /// Node block size in bytes.
    pub node_size: usize,
    /// Upper bound on node ids, head included. `None` uses every id the head
    /// block's bitmap can describe.
    pub max_nodes: Option<u32>,
    pub active_capacity: usize,
    pub passive_capacity: usize,
    pub max_resident: usize,
    /// A non-root node tries to merge once its free space exceeds
    /// `capacity / merge_divisor`.
    pub merge_divisor: usize,
    /// Store a CRC32 in the last four bytes of every block.
    pub checksums: bool,
}

/// Error returned when loading or validating configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A setting has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn invalid(name: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        message: message.into(),
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            node_size: Self::DEFAULT_NODE_SIZE,
            max_nodes: None,
            active_capacity: Self::DEFAULT_ACTIVE_CAPACITY,
            passive_capacity: Self::DEFAULT_PASSIVE_CAPACITY,
            max_resident: Self::DEFAULT_MAX_RESIDENT,
            merge_divisor: Self::DEFAULT_MERGE_DIVISOR,
            checksums: true,
        }
    }
}

impl TreeConfig {
    pub const DEFAULT_NODE_SIZE: usize = 4096;
    pub const MIN_NODE_SIZE: usize = 128;
    pub const MAX_NODE_SIZE: usize = 65536;
    pub const DEFAULT_ACTIVE_CAPACITY: usize = 64;
    pub const DEFAULT_PASSIVE_CAPACITY: usize = 256;
    pub const DEFAULT_MAX_RESIDENT: usize = 1024;
    /// Split, sibling and head nodes must be resident together.
    pub const MIN_RESIDENT: usize = 4;
    pub const DEFAULT_MERGE_DIVISOR: usize = 3;

    /// Default configuration with a different node size.
    #[must_use]
    pub fn with_node_size(node_size: usize) -> Self {
        Self {
            node_size,
            ..Self::default()
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults for
    /// unset names.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let config = Self {
            node_size: load_number(&lookup, "BNODE_NODE_SIZE")?.unwrap_or(Self::DEFAULT_NODE_SIZE),
            max_nodes: load_number(&lookup, "BNODE_MAX_NODES")?,
            active_capacity: load_number(&lookup, "BNODE_CACHE_ACTIVE")?
                .unwrap_or(Self::DEFAULT_ACTIVE_CAPACITY),
            passive_capacity: load_number(&lookup, "BNODE_CACHE_PASSIVE")?
                .unwrap_or(Self::DEFAULT_PASSIVE_CAPACITY),
            max_resident: load_number(&lookup, "BNODE_CACHE_MAX_RESIDENT")?
                .unwrap_or(Self::DEFAULT_MAX_RESIDENT),
            merge_divisor: load_number(&lookup, "BNODE_MERGE_DIVISOR")?
                .unwrap_or(Self::DEFAULT_MERGE_DIVISOR),
            checksums: load_bool(&lookup, "BNODE_CHECKSUMS")?.unwrap_or(true),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.node_size.is_power_of_two()
            || !(Self::MIN_NODE_SIZE..=Self::MAX_NODE_SIZE).contains(&self.node_size)
        {
            return Err(invalid(
                "node_size",
                format!(
                    "{} is not a power of two in {}..={}",
                    self.node_size,
                    Self::MIN_NODE_SIZE,
                    Self::MAX_NODE_SIZE
                ),
            ));
        }
        if let Some(max) = self.max_nodes {
            if max < 2 {
                return Err(invalid("max_nodes", "must allow the head and a root node"));
            }
        }
        if self.active_capacity == 0 {
            return Err(invalid("active_capacity", "must be positive"));
        }
        if self.max_resident < Self::MIN_RESIDENT {
            return Err(invalid(
                "max_resident",
                format!("must be at least {}", Self::MIN_RESIDENT),
            ));
        }
        if self.merge_divisor < 2 {
            return Err(invalid("merge_divisor", "must be at least 2"));
        }
        Ok(())
    }

    /// Bytes available for records in one node.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        capacity_for(self.node_size)
    }

    /// Largest encoded record the tree accepts.
    #[must_use]
    pub const fn max_record_len(&self) -> usize {
        self.capacity() / 3 - OFFSET_SIZE
    }

    /// Whether a key/value pair is small enough to store. The key must
    /// also fit into an index record.
    #[must_use]
    pub const fn accepts(&self, key_len: usize, value_len: usize) -> bool {
        let value = if value_len > CHILD_ID_SIZE {
            value_len
        } else {
            CHILD_ID_SIZE
        };
        key_len > 0 && record_len(key_len, value) <= self.max_record_len()
    }

    /// Number of node ids in use, capped by what the head bitmap can track.
    #[must_use]
    pub fn node_limit(&self) -> u32 {
        let trackable = NodeId::try_from(bitmap_capacity_bits(self.node_size)).unwrap_or(NodeId::MAX);
        self.max_nodes.map_or(trackable, |max| max.min(trackable))
    }

    /// Free space above which a non-root node tries to merge.
    #[must_use]
    pub const fn merge_threshold(&self) -> usize {
        self.capacity() / self.merge_divisor
    }

    #[must_use]
    pub const fn cache_limits(&self) -> CacheLimits {
        CacheLimits {
            active_capacity: self.active_capacity,
            passive_capacity: self.passive_capacity,
            max_resident: self.max_resident,
        }
    }
}

/// Load an optional numeric setting.
fn load_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| invalid(name, format!("'{value}' is not a valid number"))),
        None => Ok(None),
    }
}

/// Load an optional boolean setting.
fn load_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<bool>, ConfigError> {
    match lookup(name).as_deref().map(str::trim) {
        Some("1" | "true" | "on") => Ok(Some(true)),
        Some("0" | "false" | "off") => Ok(Some(false)),
        Some(other) => Err(invalid(name, format!("'{other}' is not a boolean"))),
        None => Ok(None),
    }
}
