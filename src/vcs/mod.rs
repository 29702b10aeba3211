//! Version-control backends.
//!
//! A [`Vcs`] client can list the versions a module publishes, resolve a
//! version to its commit timestamp, and produce a source archive for it.
//! [`GitVcs`] talks to a git remote; [`CommandVcs`] delegates every operation
//! to a user-provided shell command.

mod archive;
mod command;
mod git;
mod meta;

use std::fmt;
use std::sync::OnceLock;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;

pub use archive::{write_zip, TreeFile};
pub use command::CommandVcs;
pub use git::{GitVcs, RepoLocks};
pub use meta::{meta_imports, repo_root};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during VCS operations.
#[derive(Debug, Error)]
pub enum VcsError {
    /// The module path is too short to locate a repository.
    #[error("bad module name: {0}")]
    BadModuleName(String),

    /// No qualifying go-import meta tag in the discovery document.
    #[error("go-import meta tag not found")]
    MetaNotFound,

    /// The advertised import prefix does not match the module path.
    #[error("prefix does not match the module")]
    PrefixMismatch,

    /// The remote has neither version tags nor a master branch.
    #[error("no tags and no master branch found")]
    NoVersions,

    /// No commit matches the requested version.
    #[error("commit not found for {0}")]
    CommitNotFound(Version),

    /// The external command produced a timestamp in no recognized format.
    #[error("unknown time format")]
    UnknownTimeFormat,

    /// Git error.
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// HTTP error during meta discovery.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Archive construction error.
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// A custom error message.
    #[error("{0}")]
    Other(String),
}

/// Result type for VCS operations.
pub type Result<T> = std::result::Result<T, VcsError>;

// =============================================================================
// Version
// =============================================================================

/// A module version string.
///
/// Two shapes are recognized: semantic versions (`v1.2.3`) and pseudo-versions
/// (`v0.0.0-20180910181607-0e37d006457b`). Anything else is carried opaquely.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version(String);

fn sem_ver_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^v\d+\.\d+\.\d+$").unwrap())
}

impl Version {
    /// Create a version from a raw string.
    pub fn new(v: impl Into<String>) -> Self {
        Version(v.into())
    }

    /// The raw version string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is an exact semantic version of the form `vX.Y.Z`.
    pub fn is_sem_ver(&self) -> bool {
        sem_ver_re().is_match(&self.0)
    }

    /// The commit hash of a pseudo-version of the form `v0.0.0-timestamp-hash`.
    ///
    /// Returns the empty string unless the version has exactly three
    /// dash-separated fields.
    pub fn hash(&self) -> &str {
        let fields: Vec<&str> = self.0.split('-').collect();
        if fields.len() != 3 {
            return "";
        }
        fields[2]
    }

    /// The version with any trailing `+incompatible` marker removed.
    pub fn strip_incompatible(&self) -> Version {
        Version(
            self.0
                .strip_suffix("+incompatible")
                .unwrap_or(&self.0)
                .to_string(),
        )
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Version {
    fn from(v: &str) -> Self {
        Version(v.to_string())
    }
}

impl From<String> for Version {
    fn from(v: String) -> Self {
        Version(v)
    }
}

// =============================================================================
// Auth
// =============================================================================

/// A VCS authentication mechanism: none, username/password, or an SSH key.
#[derive(Debug, Clone, Default)]
pub struct Auth {
    pub username: String,
    pub password: String,
    pub key: String,
}

impl Auth {
    /// No authentication at all.
    pub fn none() -> Auth {
        Auth::default()
    }

    /// Username/password authentication.
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Auth {
        Auth {
            username: username.into(),
            password: password.into(),
            key: String::new(),
        }
    }

    /// Key file authentication.
    pub fn key(path: impl Into<String>) -> Auth {
        Auth {
            username: String::new(),
            password: String::new(),
            key: path.into(),
        }
    }
}

// =============================================================================
// Vcs Trait
// =============================================================================

/// A version control system client for a single module.
///
/// It can list available versions from the remote, as well as fetch module
/// data such as the commit timestamp or the zip snapshot.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// List the versions the remote publishes for this module.
    async fn list(&self) -> Result<Vec<Version>>;

    /// The committer timestamp of the commit a version resolves to.
    async fn timestamp(&self, version: &Version) -> Result<DateTime<Utc>>;

    /// The module source archive for a version, fully drained.
    async fn zip(&self, version: &Version) -> Result<Bytes>;
}
