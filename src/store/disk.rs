//! On-disk snapshot cache.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::fs;

use super::{snapshot_key, Result, Snapshot, Store, StoreError};
use crate::vcs::Version;

/// A snapshot store keeping each entry as a pair of sibling files under a
/// base directory: `<key>.time` holding the commit timestamp as RFC 3339
/// text and `<key>.zip` holding the archive bytes.
///
/// Writes are not transactional; a torn pair simply reads back as a miss.
pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    /// Create a disk store rooted at the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DiskStore { dir: dir.into() }
    }

    fn entry_path(&self, module: &str, version: &Version, ext: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", snapshot_key(module, version), ext))
    }
}

#[async_trait]
impl Store for DiskStore {
    async fn put(&self, snapshot: Snapshot) -> Result<()> {
        let time_file = self.entry_path(&snapshot.module, &snapshot.version, "time");
        let zip_file = self.entry_path(&snapshot.module, &snapshot.version, "zip");

        // Module paths contain slashes, so entries nest below the base dir.
        if let Some(parent) = time_file.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(&time_file, snapshot.timestamp.to_rfc3339()).await?;
        fs::write(&zip_file, &snapshot.data).await?;
        Ok(())
    }

    async fn get(&self, module: &str, version: &Version) -> Result<Snapshot> {
        let time_file = self.entry_path(module, version, "time");
        let zip_file = self.entry_path(module, version, "zip");

        // A missing or unreadable half of the pair is a plain miss.
        let text = fs::read_to_string(&time_file)
            .await
            .map_err(|_| StoreError::NotFound)?;
        let timestamp = DateTime::parse_from_rfc3339(text.trim())
            .map_err(|_| StoreError::NotFound)?
            .with_timezone(&Utc);
        let data = fs::read(&zip_file).await.map_err(|_| StoreError::NotFound)?;

        Ok(Snapshot {
            module: module.to_string(),
            version: version.clone(),
            timestamp,
            data: Bytes::from(data),
        })
    }

    async fn del(&self, module: &str, version: &Version) -> Result<()> {
        fs::remove_file(self.entry_path(module, version, "time")).await?;
        fs::remove_file(self.entry_path(module, version, "zip")).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    use super::*;

    fn snapshot() -> Snapshot {
        Snapshot {
            module: "example.com/foo".to_string(),
            version: Version::from("v1.0.0"),
            timestamp: Utc.with_ymd_and_hms(2018, 9, 10, 18, 16, 7).unwrap(),
            data: Bytes::from_static(b"zip bytes"),
        }
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::new(dir.path());

        store.put(snapshot()).await.unwrap();

        let s = store
            .get("example.com/foo", &Version::from("v1.0.0"))
            .await
            .unwrap();
        assert_eq!(s.module, "example.com/foo");
        assert_eq!(s.timestamp, snapshot().timestamp);
        assert_eq!(s.data, snapshot().data);
    }

    #[tokio::test]
    async fn test_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::new(dir.path());

        let err = store
            .get("example.com/foo", &Version::from("v1.0.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn test_torn_pair_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::new(dir.path());
        store.put(snapshot()).await.unwrap();

        // Drop the zip half of the pair; the read degrades to a miss.
        fs::remove_file(dir.path().join("example.com/foo@v1.0.0.zip"))
            .await
            .unwrap();
        let err = store
            .get("example.com/foo", &Version::from("v1.0.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn test_del() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::new(dir.path());
        store.put(snapshot()).await.unwrap();

        store
            .del("example.com/foo", &Version::from("v1.0.0"))
            .await
            .unwrap();
        assert!(store
            .get("example.com/foo", &Version::from("v1.0.0"))
            .await
            .is_err());

        // Deleting an absent entry is an error.
        assert!(store
            .del("example.com/foo", &Version::from("v1.0.0"))
            .await
            .is_err());
    }
}
