//! Tree errors and their errno classification.

use crate::config::ConfigError;
use crate::storage::bitmap::BitmapError;
use crate::storage::cache::CacheError;
use crate::storage::node::{NodeError, NodeId};
use crate::storage::store::{StoreError, TreeId};

/// Standard error codes a filesystem driver surfaces for tree failures.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    ENOMEM,
    ENOSPC,
    EEXIST,
    ENOENT,
    EINVAL,
    EFAULT,
    EIO,
}

impl Errno {
    /// Linux value of the code.
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::ENOMEM => 12,
            Self::ENOSPC => 28,
            Self::EEXIST => 17,
            Self::ENOENT => 2,
            Self::EINVAL => 22,
            Self::EFAULT => 14,
            Self::EIO => 5,
        }
    }
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Errors that can occur during tree operations.
#[derive(Debug)]
pub enum BtreeError {
    /// Invalid configuration.
    Config(ConfigError),
    /// Node cache or backing store failure.
    Cache(CacheError),
    /// Record codec failure.
    Node(NodeError),
    /// Free-node bitmap failure.
    Bitmap(BitmapError),
    /// Insert of a key that is already present.
    KeyExists,
    /// Key absent on delete or find.
    KeyNotFound,
    /// Node id is not allocated in the bitmap.
    NodeNotFound(NodeId),
    /// Key or value too large for this node size.
    RecordTooLarge { len: usize, max: usize },
    /// `create` called for a tree whose head already exists.
    TreeExists(TreeId),
    /// Structural invariant violated.
    Inconsistent(String),
}

impl BtreeError {
    /// Error code for the driver.
    #[must_use]
    pub const fn errno(&self) -> Errno {
        match self {
            Self::Config(_) | Self::RecordTooLarge { .. } => Errno::EINVAL,
            Self::Cache(CacheError::OutOfMemory { .. }) => Errno::ENOMEM,
            Self::Cache(CacheError::Store(StoreError::Missing { .. })) | Self::KeyNotFound | Self::NodeNotFound(_) => {
                Errno::ENOENT
            }
            Self::Cache(CacheError::Store(_)) => Errno::EIO,
            Self::Cache(CacheError::Node(e)) | Self::Node(e) => node_errno(e),
            Self::Bitmap(BitmapError::NoSpace) => Errno::ENOSPC,
            Self::Bitmap(_) => Errno::EINVAL,
            Self::KeyExists | Self::TreeExists(_) => Errno::EEXIST,
            Self::Inconsistent(_) => Errno::EFAULT,
        }
    }

    /// Whether the error means on-disk or in-memory structure is damaged.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        match self {
            Self::Cache(CacheError::Node(e)) | Self::Node(e) => e.is_corruption(),
            Self::Bitmap(e) => !matches!(e, BitmapError::NoSpace),
            Self::Inconsistent(_) => true,
            _ => false,
        }
    }
}

const fn node_errno(e: &NodeError) -> Errno {
    match e {
        NodeError::NoSpace { .. } => Errno::ENOSPC,
        NodeError::ChecksumMismatch { .. } => Errno::EFAULT,
        _ => Errno::EINVAL,
    }
}

impl std::fmt::Display for BtreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(e) => write!(f, "configuration error: {e}"),
            Self::Cache(e) => write!(f, "cache error: {e}"),
            Self::Node(e) => write!(f, "node error: {e}"),
            Self::Bitmap(e) => write!(f, "bitmap error: {e}"),
            Self::KeyExists => write!(f, "key already exists"),
            Self::KeyNotFound => write!(f, "key not found"),
            Self::NodeNotFound(id) => write!(f, "node {id} is not allocated"),
            Self::RecordTooLarge { len, max } => {
                write!(f, "record of {len} bytes exceeds the {max} byte limit")
            }
            Self::TreeExists(id) => write!(f, "tree {id} already exists"),
            Self::Inconsistent(msg) => write!(f, "tree inconsistent: {msg}"),
        }
    }
}

impl std::error::Error for BtreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Cache(e) => Some(e),
            Self::Node(e) => Some(e),
            Self::Bitmap(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for BtreeError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<CacheError> for BtreeError {
    fn from(e: CacheError) -> Self {
        Self::Cache(e)
    }
}

impl From<NodeError> for BtreeError {
    fn from(e: NodeError) -> Self {
        Self::Node(e)
    }
}

impl From<BitmapError> for BtreeError {
    fn from(e: BitmapError) -> Self {
        Self::Bitmap(e)
    }
}

impl From<StoreError> for BtreeError {
    fn from(e: StoreError) -> Self {
        Self::Cache(CacheError::Store(e))
    }
}
