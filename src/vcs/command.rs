//! External-command VCS client.
//!
//! Every operation launches a user-provided shell command with the request
//! described in environment variables and reads the result from stdout. This
//! allows plugging arbitrary version-control tooling behind the proxy without
//! touching the core.

use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::{Result, Vcs, VcsError, Version};

/// A VCS client that shells out to a configured command.
///
/// The command runs under `sh -c` with `MODULE`, `ACTION` (one of `list`,
/// `timestamp`, `zip`), `VERSION` and `FILEPATH` set; stdout is the result.
pub struct CommandVcs {
    cmd: String,
    module: String,
}

/// The JSON timestamp payload an external command may emit.
#[derive(Deserialize)]
struct VersionInfo {
    #[serde(rename = "Time")]
    time: DateTime<Utc>,
}

impl CommandVcs {
    pub fn new(cmd: impl Into<String>, module: impl Into<String>) -> Self {
        CommandVcs {
            cmd: cmd.into(),
            module: module.into(),
        }
    }

    async fn exec(&self, action: &str, version: &str, filepath: &str) -> Result<Vec<u8>> {
        debug!(module = %self.module, action, version, "command.exec");
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.cmd)
            .env("MODULE", &self.module)
            .env("ACTION", action)
            .env("VERSION", version)
            .env("FILEPATH", filepath)
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(VcsError::Other(format!(
                "command exited with {}",
                output.status
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl Vcs for CommandVcs {
    async fn list(&self) -> Result<Vec<Version>> {
        let out = self
            .exec("list", "latest", &format!("{}/@v/list", self.module))
            .await?;
        let versions = String::from_utf8_lossy(&out)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(Version::from)
            .collect();
        Ok(versions)
    }

    async fn timestamp(&self, version: &Version) -> Result<DateTime<Utc>> {
        let out = self
            .exec(
                "timestamp",
                version.as_str(),
                &format!("{}/@v/{}.info", self.module, version),
            )
            .await?;
        parse_timestamp(&out)
    }

    async fn zip(&self, version: &Version) -> Result<Bytes> {
        let out = self
            .exec(
                "zip",
                version.as_str(),
                &format!("{}/@v/{}.zip", self.module, version),
            )
            .await?;
        Ok(Bytes::from(out))
    }
}

/// Parse a timestamp in one of three accepted formats, in priority order:
/// a JSON `{Version, Time}` object, an RFC 3339 string, or epoch seconds.
fn parse_timestamp(out: &[u8]) -> Result<DateTime<Utc>> {
    if let Ok(info) = serde_json::from_slice::<VersionInfo>(out) {
        return Ok(info.time);
    }
    let text = String::from_utf8_lossy(out);
    let text = text.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(seconds) = text.parse::<i64>() {
        return Utc
            .timestamp_opt(seconds, 0)
            .single()
            .ok_or(VcsError::UnknownTimeFormat);
    }
    Err(VcsError::UnknownTimeFormat)
}
