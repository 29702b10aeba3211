//! Git-backed VCS client.
//!
//! Refs and objects live either in a bare repository under a configured git
//! directory (keyed by repository root, reused across requests) or in
//! ephemeral storage torn down after the operation. All libgit2 work runs on
//! the blocking pool; fetches for the same repository root are serialized
//! through [`RepoLocks`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use git2::{
    AutotagOption, Cred, Direction, FetchOptions, ObjectType, RemoteCallbacks, Repository,
    TreeWalkMode, TreeWalkResult,
};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio::task;
use tracing::debug;

use super::{archive, meta, Auth, Result, TreeFile, Vcs, VcsError, Version};

const REMOTE_NAME: &str = "origin";

/// Length of the commit hash prefix carried in a pseudo-version.
const SHORT_HASH_LEN: usize = 12;

// =============================================================================
// RepoLocks
// =============================================================================

/// Per-repository-root serialization of git storage access.
///
/// The on-disk git cache is shared by every module that maps to the same
/// repository root; concurrent fetches into one root must not interleave.
#[derive(Clone, Default)]
pub struct RepoLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl RepoLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_for(&self, root: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(root.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

// =============================================================================
// GitVcs
// =============================================================================

/// A git VCS client for a single module.
pub struct GitVcs {
    git_dir: Option<PathBuf>,
    module: String,
    auth: Auth,
    client: reqwest::Client,
    locks: RepoLocks,
}

/// Where a repository's refs and objects are kept for one operation.
enum Storage {
    /// Persistent bare repository under the configured git directory.
    Dir(PathBuf),
    /// Ephemeral storage, dropped when the operation finishes.
    Temp(TempDir),
}

impl Storage {
    fn path(&self) -> &Path {
        match self {
            Storage::Dir(dir) => dir,
            Storage::Temp(tmp) => tmp.path(),
        }
    }
}

impl GitVcs {
    /// Create a git client for `module`, keeping bare repositories under
    /// `git_dir` (ephemeral storage when `None`).
    pub fn new(
        git_dir: Option<PathBuf>,
        module: impl Into<String>,
        auth: Auth,
        client: reqwest::Client,
        locks: RepoLocks,
    ) -> Self {
        GitVcs {
            git_dir,
            module: module.into(),
            auth,
            client,
            locks,
        }
    }

    async fn resolve(&self) -> Result<(String, String)> {
        meta::repo_root(&self.client, &self.module).await
    }

    fn storage(&self, root: &str) -> Result<Storage> {
        match &self.git_dir {
            Some(dir) => Ok(Storage::Dir(dir.join(root))),
            None => Ok(Storage::Temp(tempfile::tempdir()?)),
        }
    }
}

#[async_trait]
impl Vcs for GitVcs {
    async fn list(&self) -> Result<Vec<Version>> {
        debug!(module = %self.module, "git.list");
        let (root, sub_path) = self.resolve().await?;
        let url = remote_url(&self.auth, &root);

        let refs = {
            let lock = self.locks.lock_for(&root).await;
            let _guard = lock.lock().await;
            let storage = self.storage(&root)?;
            let auth = self.auth.clone();
            task::spawn_blocking(move || list_refs(&storage, &url, &auth))
                .await
                .map_err(join_err)??
        };

        let (list, master) = select_versions(&refs, &sub_path);
        if !list.is_empty() {
            debug!(module = %self.module, count = list.len(), "git.list versions");
            return Ok(list);
        }

        // No version tags: synthesize a pseudo-version from the tip of
        // master. The probe timestamp below carries a placeholder stamp; only
        // its hash field matters for commit resolution.
        let master = master.ok_or(VcsError::NoVersions)?;
        let short = &master[..SHORT_HASH_LEN];
        let probe = Version::new(format!("v0.0.0-20060102150405-{}", short));
        let t = self.timestamp(&probe).await?;
        Ok(vec![pseudo_version(short, t)])
    }

    async fn timestamp(&self, version: &Version) -> Result<DateTime<Utc>> {
        debug!(module = %self.module, version = %version, "git.timestamp");
        let (root, _) = self.resolve().await?;
        let url = remote_url(&self.auth, &root);

        let lock = self.locks.lock_for(&root).await;
        let _guard = lock.lock().await;
        let storage = self.storage(&root)?;
        let auth = self.auth.clone();
        let version = version.clone();
        let seconds = task::spawn_blocking(move || -> Result<i64> {
            let repo = open_repo(&storage, &url)?;
            fetch_all(&repo, &auth)?;
            let oid = resolve_commit(&repo, &version)?;
            let seconds = repo.find_commit(oid)?.time().seconds();
            Ok(seconds)
        })
        .await
        .map_err(join_err)??;

        Utc.timestamp_opt(seconds, 0)
            .single()
            .ok_or_else(|| VcsError::Other(format!("commit time out of range: {}", seconds)))
    }

    async fn zip(&self, version: &Version) -> Result<Bytes> {
        debug!(module = %self.module, version = %version, "git.zip");
        let (root, sub_path) = self.resolve().await?;
        let url = remote_url(&self.auth, &root);
        let prefix = if sub_path.is_empty() {
            String::new()
        } else {
            format!("{}/", sub_path)
        };

        let lock = self.locks.lock_for(&root).await;
        let _guard = lock.lock().await;
        let storage = self.storage(&root)?;
        let auth = self.auth.clone();
        let module = self.module.clone();
        let version = version.clone();
        let data = task::spawn_blocking(move || -> Result<Vec<u8>> {
            let repo = open_repo(&storage, &url)?;
            fetch_all(&repo, &auth)?;
            let oid = resolve_commit(&repo, &version)?;
            let files = commit_files(&repo, oid)?;
            archive::write_zip(&module, &version, &prefix, &files)
        })
        .await
        .map_err(join_err)??;

        Ok(Bytes::from(data))
    }
}

// =============================================================================
// Blocking git plumbing
// =============================================================================

fn join_err(e: task::JoinError) -> VcsError {
    VcsError::Other(format!("blocking git task failed: {}", e))
}

fn remote_url(auth: &Auth, root: &str) -> String {
    let scheme = if auth.key.is_empty() { "https" } else { "ssh" };
    format!("{}://{}.git", scheme, root)
}

fn callbacks(auth: &Auth) -> RemoteCallbacks<'static> {
    let auth = auth.clone();
    let mut cbs = RemoteCallbacks::new();
    cbs.credentials(move |_url, username_from_url, _allowed| {
        if !auth.key.is_empty() {
            Cred::ssh_key(
                username_from_url.unwrap_or("git"),
                None,
                Path::new(&auth.key),
                None,
            )
        } else if !auth.username.is_empty() {
            Cred::userpass_plaintext(&auth.username, &auth.password)
        } else {
            Cred::default()
        }
    });
    cbs
}

/// Open the bare repository at `storage`, initializing it and creating the
/// `origin` remote on first use.
fn open_repo(storage: &Storage, url: &str) -> Result<Repository> {
    let dir = storage.path();
    let repo = match Repository::open_bare(dir) {
        Ok(repo) => repo,
        Err(_) => {
            std::fs::create_dir_all(dir)?;
            Repository::init_bare(dir)?
        }
    };
    if repo.find_remote(REMOTE_NAME).is_err() {
        repo.remote(REMOTE_NAME, url)?;
    }
    Ok(repo)
}

/// List the remote's ref advertisement as `(name, hash)` pairs.
fn list_refs(storage: &Storage, url: &str, auth: &Auth) -> Result<Vec<(String, String)>> {
    let repo = open_repo(storage, url)?;
    let mut remote = repo.find_remote(REMOTE_NAME)?;
    let conn = remote.connect_auth(Direction::Fetch, Some(callbacks(auth)), None)?;
    let refs = conn
        .list()?
        .iter()
        .map(|head| (head.name().to_string(), head.oid().to_string()))
        .collect();
    Ok(refs)
}

/// Fetch all branches and tags into local storage. Idempotent when the
/// storage is already up to date.
fn fetch_all(repo: &Repository, auth: &Auth) -> Result<()> {
    let mut remote = repo.find_remote(REMOTE_NAME)?;
    let mut opts = FetchOptions::new();
    opts.remote_callbacks(callbacks(auth));
    opts.download_tags(AutotagOption::All);
    remote.fetch(
        &["+refs/heads/*:refs/heads/*", "+refs/tags/*:refs/tags/*"],
        Some(&mut opts),
        None,
    )?;
    Ok(())
}

/// Resolve a version to a commit id.
///
/// Semantic versions match their tag by exact name, peeling annotated tags to
/// the target commit. Pseudo-versions are matched by scanning commit objects
/// for a hash with the version's prefix.
fn resolve_commit(repo: &Repository, version: &Version) -> Result<git2::Oid> {
    let version = version.strip_incompatible();

    if version.is_sem_ver() {
        let refname = format!("refs/tags/{}", version);
        let commit = repo
            .find_reference(&refname)
            .and_then(|r| r.peel_to_commit())
            .map_err(|_| VcsError::CommitNotFound(version.clone()))?;
        return Ok(commit.id());
    }

    let prefix = version.hash().to_string();
    if prefix.is_empty() {
        return Err(VcsError::CommitNotFound(version));
    }
    let odb = repo.odb()?;
    let mut found = None;
    odb.foreach(|oid| {
        if found.is_none()
            && oid.to_string().starts_with(&prefix)
            && repo.find_commit(*oid).is_ok()
        {
            found = Some(*oid);
        }
        true
    })?;
    found.ok_or(VcsError::CommitNotFound(version))
}

/// Collect the files of a commit's tree in walk order.
fn commit_files(repo: &Repository, oid: git2::Oid) -> Result<Vec<TreeFile>> {
    let tree = repo.find_commit(oid)?.tree()?;
    let mut entries = Vec::new();
    tree.walk(TreeWalkMode::PreOrder, |dir, entry| {
        if entry.kind() == Some(ObjectType::Blob) {
            let path = format!("{}{}", dir, entry.name().unwrap_or_default());
            entries.push((path, entry.filemode() as u32, entry.id()));
        }
        TreeWalkResult::Ok
    })?;

    let mut files = Vec::with_capacity(entries.len());
    for (path, mode, id) in entries {
        let data = repo.find_blob(id)?.content().to_vec();
        files.push(TreeFile { path, mode, data });
    }
    Ok(files)
}

/// Partition a ref advertisement into scoped version tags and the hash of
/// master, if present.
///
/// When the module lives under a sub-path, only tags carrying that sub-path
/// prefix count, and the prefix is stripped from the returned versions.
fn select_versions(refs: &[(String, String)], sub_path: &str) -> (Vec<Version>, Option<String>) {
    let tag_prefix = if sub_path.is_empty() {
        "refs/tags/".to_string()
    } else {
        format!("refs/tags/{}/", sub_path)
    };
    let mut list = Vec::new();
    let mut master = None;
    for (name, hash) in refs {
        if name == "refs/heads/master" {
            master = Some(hash.clone());
        } else if let Some(tag) = name.strip_prefix(&tag_prefix) {
            if tag.starts_with('v') {
                list.push(Version::new(tag));
            }
        }
    }
    (list, master)
}

/// Format a pseudo-version from a short commit hash and its commit time.
fn pseudo_version(short: &str, t: DateTime<Utc>) -> Version {
    Version::new(format!("v0.0.0-{}-{}", t.format("%Y%m%d%H%M%S"), short))
}
