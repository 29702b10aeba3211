//! The fetch-cache-materialize pipeline.
//!
//! [`Proxy`] owns the ordered snapshot stores, the VCS path mappings and the
//! admission gate bounding concurrent VCS work. A content request reads
//! through the store tiers in order; on a full miss it fetches from the
//! module's VCS backend, builds the snapshot and fills the tiers back
//! slowest-first.

pub mod api;

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::store::{DiskStore, MemoryStore, Snapshot, Store, StoreError};
use crate::vcs::{Auth, CommandVcs, GitVcs, RepoLocks, Vcs, VcsError, Version};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur while serving module content.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// VCS error.
    #[error(transparent)]
    Vcs(#[from] VcsError),

    /// Store error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A custom error message.
    #[error("{0}")]
    Other(String),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

// =============================================================================
// VCS dispatch
// =============================================================================

/// Creates a VCS client for a module path.
pub type VcsFactory = Arc<dyn Fn(&str) -> Arc<dyn Vcs> + Send + Sync>;

struct VcsMapping {
    prefix: String,
    factory: VcsFactory,
}

// =============================================================================
// ProxyBuilder
// =============================================================================

enum MappingKind {
    Git(Auth),
    Command(String),
    Custom(VcsFactory),
}

/// Configures and builds a [`Proxy`].
pub struct ProxyBuilder {
    git_dir: Option<PathBuf>,
    workers: usize,
    stores: Vec<Arc<dyn Store>>,
    mappings: Vec<(String, MappingKind)>,
    metrics: Option<Arc<Metrics>>,
}

impl ProxyBuilder {
    fn new() -> Self {
        ProxyBuilder {
            git_dir: None,
            workers: 1,
            stores: Vec::new(),
            mappings: Vec::new(),
            metrics: None,
        }
    }

    /// Keep bare git repositories under this directory instead of ephemeral
    /// storage.
    pub fn git_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.git_dir = Some(dir.into());
        self
    }

    /// Allow at most `n` parallel VCS fetches. Restricting the workers bounds
    /// the memory footprint of simultaneous clones.
    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n.max(1);
        self
    }

    /// Append an in-memory cache tier with the given byte limit (negative
    /// disables eviction).
    pub fn memory(mut self, limit: i64) -> Self {
        self.stores.push(Arc::new(MemoryStore::new(limit)));
        self
    }

    /// Append a disk cache tier rooted at the given directory.
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.stores.push(Arc::new(DiskStore::new(dir.into())));
        self
    }

    /// Append an arbitrary cache tier. Tiers are consulted in the order they
    /// were added and filled back in the reverse order.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.stores.push(store);
        self
    }

    /// Serve modules under `prefix` from git with the given authentication.
    pub fn git(mut self, prefix: impl Into<String>, auth: Auth) -> Self {
        self.mappings.push((prefix.into(), MappingKind::Git(auth)));
        self
    }

    /// Serve modules under `prefix` through an external command.
    pub fn custom_vcs(mut self, prefix: impl Into<String>, cmd: impl Into<String>) -> Self {
        self.mappings
            .push((prefix.into(), MappingKind::Command(cmd.into())));
        self
    }

    /// Serve modules under `prefix` from clients produced by `factory`.
    pub fn vcs(mut self, prefix: impl Into<String>, factory: VcsFactory) -> Self {
        self.mappings
            .push((prefix.into(), MappingKind::Custom(factory)));
        self
    }

    /// Use a shared metrics registry.
    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Proxy {
        let client = reqwest::Client::new();
        let locks = RepoLocks::new();
        let git_dir = self.git_dir;

        let vcs_paths = self
            .mappings
            .into_iter()
            .map(|(prefix, kind)| {
                let factory = match kind {
                    MappingKind::Git(auth) => {
                        let git_dir = git_dir.clone();
                        let client = client.clone();
                        let locks = locks.clone();
                        Arc::new(move |module: &str| {
                            Arc::new(GitVcs::new(
                                git_dir.clone(),
                                module,
                                auth.clone(),
                                client.clone(),
                                locks.clone(),
                            )) as Arc<dyn Vcs>
                        }) as VcsFactory
                    }
                    MappingKind::Command(cmd) => Arc::new(move |module: &str| {
                        Arc::new(CommandVcs::new(cmd.clone(), module)) as Arc<dyn Vcs>
                    })
                        as VcsFactory,
                    MappingKind::Custom(factory) => factory,
                };
                VcsMapping { prefix, factory }
            })
            .collect();

        Proxy {
            stores: self.stores,
            vcs_paths,
            workers: Arc::new(Semaphore::new(self.workers)),
            git_dir,
            client,
            locks,
            metrics: self.metrics.unwrap_or_default(),
        }
    }
}

// =============================================================================
// Proxy
// =============================================================================

/// The caching module proxy core.
pub struct Proxy {
    stores: Vec<Arc<dyn Store>>,
    vcs_paths: Vec<VcsMapping>,
    workers: Arc<Semaphore>,
    git_dir: Option<PathBuf>,
    client: reqwest::Client,
    locks: RepoLocks,
    metrics: Arc<Metrics>,
}

impl Proxy {
    pub fn builder() -> ProxyBuilder {
        ProxyBuilder::new()
    }

    /// The VCS client for a module, picked by the longest-standing matching
    /// path mapping; plain anonymous git when nothing matches.
    fn vcs(&self, module: &str) -> Arc<dyn Vcs> {
        for mapping in &self.vcs_paths {
            if module.starts_with(&mapping.prefix) {
                return (mapping.factory)(module);
            }
        }
        Arc::new(GitVcs::new(
            self.git_dir.clone(),
            module,
            Auth::none(),
            self.client.clone(),
            self.locks.clone(),
        ))
    }

    /// List the versions a module publishes.
    pub async fn list(&self, module: &str) -> Result<Vec<Version>> {
        Ok(self.vcs(module).list().await?)
    }

    /// The archive bytes and commit timestamp for a module version.
    ///
    /// Reads through the cache tiers in order; on a full miss, takes an
    /// admission token, fetches from the VCS, and fills every tier back in
    /// reverse order. Fill-back failures are logged and swallowed.
    pub async fn module(
        &self,
        module: &str,
        version: &Version,
    ) -> Result<(Bytes, DateTime<Utc>)> {
        for store in &self.stores {
            if let Ok(snapshot) = store.get(module, version).await {
                self.metrics.cache_hits.add(module, 1);
                return Ok((snapshot.data, snapshot.timestamp));
            }
        }
        self.metrics.cache_misses.add(module, 1);

        // The permit is dropped on every return path below, success or not.
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|e| ProxyError::Other(format!("admission gate closed: {}", e)))?;

        let vcs = self.vcs(module);
        let timestamp = vcs.timestamp(version).await?;
        let data = vcs.zip(version).await?;
        debug!(module, version = %version, bytes = data.len(), "proxy.fetched");

        let snapshot = Snapshot {
            module: module.to_string(),
            version: version.clone(),
            timestamp,
            data: data.clone(),
        };
        for store in self.stores.iter().rev() {
            if let Err(err) = store.put(snapshot.clone()).await {
                warn!(module, version = %version, error = %err, "proxy.fill-back failed");
            }
        }

        Ok((data, timestamp))
    }

    /// Remove a module version from every cache tier.
    pub async fn delete(&self, module: &str, version: &Version) -> Result<()> {
        for store in &self.stores {
            store.del(module, version).await?;
        }
        Ok(())
    }

    /// Close every cache tier.
    pub async fn close(&self) -> Result<()> {
        for store in &self.stores {
            store.close().await?;
        }
        Ok(())
    }
}
