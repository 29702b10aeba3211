//! Module-path to repository-root resolution.
//!
//! Well-known hosting sites map structurally: the first three path segments
//! locate the repository. Everything else is resolved through the
//! `?go-get=1` discovery protocol, where the host advertises its repository
//! location in a `<meta name="go-import">` tag. Real-world discovery
//! documents are rarely valid XML, so the tag is extracted with a tolerant
//! scanner rather than a strict parser.

use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use super::{Result, VcsError};

/// Hosts whose repository root is always the first three path segments.
const WELL_KNOWN_HOSTS: &[&str] = &["github.com/", "bitbucket.org/"];

/// A parsed `<meta name="go-import">` tag: `prefix vcs repo-url`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MetaImport {
    prefix: String,
    vcs: String,
    url: String,
}

/// Resolve a module path to a clone-able repository root and the in-repo
/// sub-path under which the module lives (empty when the module is the
/// repository root).
pub async fn repo_root(client: &reqwest::Client, module: &str) -> Result<(String, String)> {
    resolve_root(client, "https", module).await
}

/// Resolve a module path to its repository URL using the `go-import` meta
/// tag, requiring the advertised prefix to match the module exactly.
///
/// This is the legacy single-value form of [`repo_root`]; prefer the
/// structured variant for sub-module support.
pub async fn meta_imports(client: &reqwest::Client, module: &str) -> Result<String> {
    if is_well_known(module) {
        return Ok(module.to_string());
    }
    for meta in discover(client, "https", module).await? {
        if meta.prefix != module {
            return Err(VcsError::PrefixMismatch);
        }
        return Ok(strip_scheme(&meta.url).to_string());
    }
    Err(VcsError::MetaNotFound)
}

fn is_well_known(module: &str) -> bool {
    WELL_KNOWN_HOSTS.iter().any(|h| module.starts_with(h))
}

async fn resolve_root(
    client: &reqwest::Client,
    scheme: &str,
    module: &str,
) -> Result<(String, String)> {
    if is_well_known(module) {
        let fields: Vec<&str> = module.split('/').collect();
        if fields.len() < 3 {
            return Err(VcsError::BadModuleName(module.to_string()));
        }
        let root = fields[..3].join("/");
        let sub_path = fields[3..].join("/");
        return Ok((root, sub_path));
    }

    for meta in discover(client, scheme, module).await? {
        let root = strip_scheme(&meta.url).to_string();
        let sub_path = module
            .strip_prefix(&meta.prefix)
            .unwrap_or("")
            .trim_start_matches('/')
            .to_string();
        debug!(module, root = %root, sub_path = %sub_path, "meta.repo_root");
        return Ok((root, sub_path));
    }
    Err(VcsError::MetaNotFound)
}

/// Fetch the discovery document and return every well-formed go-import tag.
async fn discover(client: &reqwest::Client, scheme: &str, module: &str) -> Result<Vec<MetaImport>> {
    let url = format!("{}://{}?go-get=1", scheme, module);
    debug!(url = %url, "meta.discover");
    let body = client.get(&url).send().await?.text().await?;
    Ok(parse_meta_imports(&body))
}

fn strip_scheme(url: &str) -> &str {
    match url.find("://") {
        Some(i) => &url[i + 3..],
        None => url,
    }
}

// =============================================================================
// Tolerant HTML scanning
// =============================================================================

fn meta_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<meta\s([^>]*?)/?>").unwrap())
}

fn attr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)([a-z][a-z0-9-]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#).unwrap()
    })
}

/// Extract all 3-field `go-import` declarations from an HTML-ish document.
///
/// Tolerates unquoted and single-quoted attributes, self-closed tags, case
/// variance and entity references; skips tags whose content does not have
/// exactly three whitespace-separated fields.
fn parse_meta_imports(html: &str) -> Vec<MetaImport> {
    let mut imports = Vec::new();
    for tag in meta_tag_re().captures_iter(html) {
        let mut name = None;
        let mut content = None;
        for attr in attr_re().captures_iter(&tag[1]) {
            let value = attr
                .get(2)
                .or_else(|| attr.get(3))
                .or_else(|| attr.get(4))
                .map_or("", |m| m.as_str());
            match attr[1].to_ascii_lowercase().as_str() {
                "name" => name = Some(value.to_string()),
                "content" => content = Some(decode_entities(value)),
                _ => {}
            }
        }
        if name.as_deref() != Some("go-import") {
            continue;
        }
        if let Some(content) = content {
            let fields: Vec<&str> = content.split_whitespace().collect();
            if fields.len() == 3 {
                imports.push(MetaImport {
                    prefix: fields[0].to_string(),
                    vcs: fields[1].to_string(),
                    url: fields[2].to_string(),
                });
            }
        }
    }
    imports
}

fn decode_entities(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
}
