//! Layered snapshot stores.
//!
//! A [`Store`] caches built module archives keyed by `<module>@<version>`.
//! The proxy stacks stores in an ordered list (memory first, disk behind it)
//! and reads through the tiers in order, filling them back slowest-first
//! after an upstream fetch.

mod disk;
mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::vcs::Version;

pub use disk::DiskStore;
pub use memory::MemoryStore;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The snapshot is not in this store.
    #[error("not found")]
    NotFound,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

// =============================================================================
// Snapshot
// =============================================================================

/// A source snapshot of a module version: the built archive plus the commit
/// timestamp it was taken at. Immutable once created.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub module: String,
    pub version: Version,
    pub timestamp: DateTime<Utc>,
    pub data: Bytes,
}

impl Snapshot {
    /// The cache key identifying this snapshot.
    pub fn key(&self) -> String {
        snapshot_key(&self.module, &self.version)
    }
}

/// The cache key for a module coordinate.
pub fn snapshot_key(module: &str, version: &Version) -> String {
    format!("{}@{}", module, version)
}

// =============================================================================
// Store Trait
// =============================================================================

/// A snapshot cache tier.
#[async_trait]
pub trait Store: Send + Sync {
    /// Store a snapshot. Implementations may treat a duplicate key as a
    /// successful no-op.
    async fn put(&self, snapshot: Snapshot) -> Result<()>;

    /// Retrieve the snapshot for a module coordinate, or `NotFound`.
    async fn get(&self, module: &str, version: &Version) -> Result<Snapshot>;

    /// Remove the snapshot for a module coordinate.
    async fn del(&self, module: &str, version: &Version) -> Result<()>;

    /// Release any resources held by the store.
    async fn close(&self) -> Result<()>;
}
