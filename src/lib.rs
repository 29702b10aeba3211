//! modproxy - A caching proxy for the Go module download protocol.
//!
//! The proxy answers version listings, commit metadata, module manifests and
//! source archives from a layered snapshot cache, and fills the cache on a
//! miss by fetching from a version-control backend and building a
//! deterministic archive.

pub mod cli;
pub mod metrics;
pub mod proxy;
pub mod store;
pub mod vcs;

pub use metrics::Metrics;
pub use proxy::Proxy;
pub use store::{DiskStore, MemoryStore, Snapshot, Store};
pub use vcs::{Auth, Vcs, Version};
