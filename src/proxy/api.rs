//! HTTP surface implementing the module download protocol.
//!
//! Routes follow the upstream proxy convention: `/{module}/@v/list`,
//! `/{module}/@v/{version}.info`, `.mod` and `.zip`, plus `DELETE` on a
//! versioned route to purge a cached snapshot. Module paths arrive with
//! uppercase letters case-encoded as `!x` and are decoded before dispatch.

use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::Instant;

use hyper::{Body, Method, Request, Response, StatusCode};
use regex::Regex;
use serde_json::json;
use tracing::{debug, warn};
use zip::ZipArchive;

use super::Proxy;
use crate::metrics::Metrics;
use crate::vcs::Version;

struct Routes {
    list: Regex,
    info: Regex,
    module: Regex,
    zip: Regex,
}

impl Routes {
    fn new() -> Self {
        Routes {
            list: Regex::new(r"^/(?P<module>.*)/@v/list$").unwrap(),
            info: Regex::new(r"^/(?P<module>.*)/@v/(?P<version>.*)\.info$").unwrap(),
            module: Regex::new(r"^/(?P<module>.*)/@v/(?P<version>.*)\.mod$").unwrap(),
            zip: Regex::new(r"^/(?P<module>.*)/@v/(?P<version>.*)\.zip$").unwrap(),
        }
    }
}

/// The protocol handler. One instance serves every connection.
pub struct Api {
    proxy: Arc<Proxy>,
    metrics: Arc<Metrics>,
    routes: Routes,
    prometheus: bool,
}

impl Api {
    pub fn new(proxy: Arc<Proxy>, metrics: Arc<Metrics>, prometheus: bool) -> Self {
        Api {
            proxy,
            metrics,
            routes: Routes::new(),
            prometheus,
        }
    }

    /// Dispatch one request.
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let start = Instant::now();
        let path = req.uri().path().to_string();
        debug!(method = %req.method(), path = %path, "api.request");

        if self.prometheus && path == "/metrics" {
            return respond(StatusCode::OK, self.metrics.render_prometheus());
        }

        let routes = [
            ("list", &self.routes.list),
            ("info", &self.routes.info),
            ("mod", &self.routes.module),
            ("zip", &self.routes.zip),
        ];
        for (id, re) in routes {
            let caps = match re.captures(&path) {
                Some(caps) => caps,
                None => continue,
            };
            let module = decode_bangs(caps.name("module").map_or("", |m| m.as_str()));
            let version = caps.name("version").map_or("", |m| m.as_str());

            if req.method() == Method::DELETE && !version.is_empty() {
                return self.delete(&module, &Version::from(version)).await;
            }

            self.metrics.http_requests.add(id, 1);
            let response = match id {
                "list" => self.list(&module).await,
                "info" => self.info(&module, &Version::from(version)).await,
                "mod" => self.mod_file(&module, &Version::from(version)).await,
                _ => self.zip(&module, &Version::from(version)).await,
            };
            self.metrics
                .http_request_durations
                .set(id, start.elapsed().as_secs_f64());
            return response;
        }

        self.metrics.http_requests.add("not_found", 1);
        respond(StatusCode::NOT_FOUND, "404 page not found\n")
    }

    async fn list(&self, module: &str) -> Response<Body> {
        debug!(module, "api.list");
        match self.proxy.list(module).await {
            Ok(versions) => {
                let mut body = String::new();
                for v in versions {
                    body.push_str(v.as_str());
                    body.push('\n');
                }
                respond(StatusCode::OK, body)
            }
            Err(err) => self.error(module, err),
        }
    }

    async fn info(&self, module: &str, version: &Version) -> Response<Body> {
        debug!(module, version = %version, "api.info");
        match self.proxy.module(module, version).await {
            Ok((_, timestamp)) => {
                let info = json!({ "Version": version.as_str(), "Time": timestamp });
                respond(StatusCode::OK, info.to_string())
            }
            Err(err) => self.error(module, err),
        }
    }

    async fn mod_file(&self, module: &str, version: &Version) -> Response<Body> {
        debug!(module, version = %version, "api.mod");
        if let Ok((data, _)) = self.proxy.module(module, version).await {
            if let Some(body) = extract_go_mod(&data, module, version) {
                return respond(StatusCode::OK, body);
            }
        }
        // No manifest in the archive (or no archive at all): synthesize the
        // minimal stanza the client accepts.
        respond(StatusCode::OK, format!("module {}\n", module))
    }

    async fn zip(&self, module: &str, version: &Version) -> Response<Body> {
        debug!(module, version = %version, "api.zip");
        match self.proxy.module(module, version).await {
            Ok((data, _)) => {
                let mut response = Response::new(Body::from(data));
                response.headers_mut().insert(
                    hyper::header::CONTENT_TYPE,
                    hyper::header::HeaderValue::from_static("application/zip"),
                );
                response
            }
            Err(err) => self.error(module, err),
        }
    }

    async fn delete(&self, module: &str, version: &Version) -> Response<Body> {
        debug!(module, version = %version, "api.delete");
        match self.proxy.delete(module, version).await {
            Ok(()) => respond(StatusCode::OK, ""),
            Err(err) => respond(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        }
    }

    fn error(&self, module: &str, err: super::ProxyError) -> Response<Body> {
        warn!(module, error = %err, "api.error");
        self.metrics.http_errors.add(module, 1);
        respond(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

fn respond(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}

/// Read `<module>@<version>/go.mod` out of an archive, if present.
fn extract_go_mod(data: &[u8], module: &str, version: &Version) -> Option<String> {
    let mut archive = ZipArchive::new(Cursor::new(data)).ok()?;
    let name = format!("{}@{}/go.mod", module, version);
    let mut file = archive.by_name(&name).ok()?;
    let mut body = String::new();
    file.read_to_string(&mut body).ok()?;
    Some(body)
}

/// Decode `!x` case-encoding back into uppercase letters.
fn decode_bangs(s: &str) -> String {
    let mut buf = String::with_capacity(s.len());
    let mut bang = false;
    for r in s.chars() {
        if bang {
            bang = false;
            buf.extend(r.to_uppercase());
            continue;
        }
        if r == '!' {
            bang = true;
            continue;
        }
        buf.push(r);
    }
    buf
}
