//! Command-line interface for modproxy.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::metrics::Metrics;
use crate::proxy::api::Api;
use crate::proxy::Proxy;
use crate::vcs::Auth;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during CLI execution.
#[derive(Debug, Error)]
pub enum CliError {
    /// A flag value could not be parsed.
    #[error("invalid {flag} value '{value}': expected {expected}")]
    InvalidFlag {
        flag: &'static str,
        value: String,
        expected: &'static str,
    },

    /// Server error.
    #[error("server error: {0}")]
    Server(#[from] hyper::Error),
}

/// Result type for CLI operations.
pub type Result<T> = std::result::Result<T, CliError>;

// =============================================================================
// CLI Definition
// =============================================================================

/// modproxy - a caching proxy for the Go module download protocol.
#[derive(Parser, Debug)]
#[command(name = "modproxy", version, about, long_about = None)]
pub struct Cli {
    /// HTTP server address.
    #[arg(long, default_value = "0.0.0.0:0")]
    addr: SocketAddr,

    /// Verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// JSON structured logging.
    #[arg(long)]
    json: bool,

    /// Serve Prometheus metrics on /metrics.
    #[arg(long)]
    prometheus: bool,

    /// Modules cache directory.
    #[arg(long, default_value_os_t = default_dir("cache"))]
    dir: PathBuf,

    /// Git cache directory.
    #[arg(long, default_value_os_t = default_dir("git"))]
    gitdir: PathBuf,

    /// In-memory cache size in MB (negative disables eviction).
    #[arg(long = "mem", default_value_t = 256)]
    mem: i64,

    /// Number of parallel VCS workers.
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Git path mapping in the form prefix:auth, where auth is either
    /// user:password or a path to an SSH key. Repeatable.
    #[arg(long = "git", value_name = "PREFIX:AUTH")]
    git: Vec<String>,

    /// Custom VCS mapping in the form prefix:command. Repeatable.
    #[arg(long = "vcs", value_name = "PREFIX:COMMAND")]
    vcs: Vec<String>,
}

fn default_dir(sub: &str) -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".modproxy").join(sub)
}

/// Parse an auth string: `user:password` for basic auth, anything else is a
/// path to an SSH key.
fn parse_auth(auth: &str) -> Auth {
    match auth.split_once(':') {
        Some((username, password)) => Auth::password(username, password),
        None => Auth::key(auth),
    }
}

// =============================================================================
// Entry Point
// =============================================================================

/// Parse arguments, build the proxy and serve until interrupted.
pub async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let metrics = Arc::new(Metrics::new());
    let mut builder = Proxy::builder()
        .git_dir(&cli.gitdir)
        .workers(cli.workers)
        .metrics(metrics.clone());

    for mapping in &cli.git {
        let (prefix, auth) = mapping.split_once(':').ok_or(CliError::InvalidFlag {
            flag: "--git",
            value: mapping.clone(),
            expected: "prefix:auth",
        })?;
        builder = builder.git(prefix, parse_auth(auth));
    }
    for mapping in &cli.vcs {
        let (prefix, cmd) = mapping.split_once(':').ok_or(CliError::InvalidFlag {
            flag: "--vcs",
            value: mapping.clone(),
            expected: "prefix:command",
        })?;
        builder = builder.custom_vcs(prefix, cmd);
    }

    let proxy = Arc::new(
        builder
            .memory(cli.mem.saturating_mul(1024 * 1024))
            .cache_dir(&cli.dir)
            .build(),
    );
    let api = Arc::new(Api::new(proxy.clone(), metrics, cli.prometheus));

    let make_svc = make_service_fn(move |_conn| {
        let api = api.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let api = api.clone();
                async move { Ok::<_, Infallible>(api.handle(req).await) }
            }))
        }
    });

    let server = Server::try_bind(&cli.addr)?.serve(make_svc);
    info!(addr = %server.local_addr(), "listening");
    println!("Listening on {}", server.local_addr());

    server
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    proxy.close().await.ok();
    Ok(())
}

fn init_tracing(cli: &Cli) {
    let filter = if cli.verbose {
        EnvFilter::new("modproxy=debug")
    } else {
        EnvFilter::new("modproxy=info")
    };
    let fmt = tracing_subscriber::fmt().with_env_filter(filter);
    if cli.json {
        fmt.json().init();
    } else {
        fmt.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_auth() {
        let auth = parse_auth("user:secret");
        assert_eq!(auth.username, "user");
        assert_eq!(auth.password, "secret");
        assert!(auth.key.is_empty());

        let auth = parse_auth("/home/user/.ssh/id_rsa");
        assert!(auth.username.is_empty());
        assert_eq!(auth.key, "/home/user/.ssh/id_rsa");
    }

    #[test]
    fn test_cli_parses_mappings() {
        let cli = Cli::parse_from([
            "modproxy",
            "--git",
            "github.com/corp/:ci:hunter2",
            "--vcs",
            "internal.corp/:/usr/local/bin/corp-vcs",
            "--workers",
            "4",
        ]);
        assert_eq!(cli.git, vec!["github.com/corp/:ci:hunter2"]);
        assert_eq!(cli.vcs, vec!["internal.corp/:/usr/local/bin/corp-vcs"]);
        assert_eq!(cli.workers, 4);

        // prefix:auth splits on the first colon only, so the auth part may
        // itself be user:password.
        let (prefix, auth) = cli.git[0].split_once(':').unwrap();
        assert_eq!(prefix, "github.com/corp/");
        let auth = parse_auth(auth);
        assert_eq!(auth.username, "ci");
        assert_eq!(auth.password, "hunter2");
    }
}
