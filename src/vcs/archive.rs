//! Deterministic module archive construction.
//!
//! Turns the file tree of a resolved commit into the zip layout module
//! consumers expect: every entry lives under a `<module>@<version>/` prefix,
//! vendored packages and nested modules are stripped, and the output is
//! byte-for-byte reproducible for a fixed commit so downstream checksum
//! verification keeps working.

use std::collections::HashSet;
use std::io::{Cursor, Write};

use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::{Result, Version};

/// A single file taken from a commit's tree, in walk order.
#[derive(Debug, Clone)]
pub struct TreeFile {
    /// Slash-separated path relative to the repository root.
    pub path: String,
    /// Git file mode (e.g. `0o100644`).
    pub mode: u32,
    /// File contents.
    pub data: Vec<u8>,
}

impl TreeFile {
    /// Whether the mode denotes a regular (possibly executable) file.
    pub fn is_regular(&self) -> bool {
        self.mode == 0o100644 || self.mode == 0o100755
    }
}

/// Whether a path belongs to a vendored package: a `vendor` segment with at
/// least one further path segment beneath it.
fn is_vendored_package(name: &str) -> bool {
    let rest = if let Some(rest) = name.strip_prefix("vendor/") {
        rest
    } else if let Some(i) = name.find("/vendor/") {
        &name[i + "/vendor/".len()..]
    } else {
        return false;
    };
    rest.contains('/')
}

/// The directory of a slash-separated path, including the trailing slash
/// (empty for top-level names).
fn dir_of(name: &str) -> &str {
    match name.rfind('/') {
        Some(i) => &name[..i + 1],
        None => "",
    }
}

/// Build the archive for `module@version` from a commit's files.
///
/// `prefix` is the in-repo directory the module root maps to, with a trailing
/// slash when non-empty. Files outside the prefix, non-regular files,
/// vendored packages and files of nested modules (directories below the
/// prefix that carry their own `go.mod`) are excluded. Entry order follows
/// input order.
pub fn write_zip(
    module: &str,
    version: &Version,
    prefix: &str,
    files: &[TreeFile],
) -> Result<Vec<u8>> {
    let mut modules: HashSet<String> = HashSet::new();
    for f in files {
        if f.path == "go.mod" || f.path.ends_with("/go.mod") {
            modules.insert(dir_of(&f.path).to_string());
        }
    }

    // A file belongs to a nested module when some ancestor directory strictly
    // below the prefix carries its own go.mod.
    let submodule = |name: &str| -> bool {
        let mut name = name.to_string();
        loop {
            let dir = dir_of(&name).to_string();
            if dir.len() <= prefix.len() {
                return false;
            }
            if modules.contains(&dir) {
                return true;
            }
            name = dir[..dir.len() - 1].to_string();
        }
    };

    // Fixed timestamp and compression keep the output reproducible.
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());

    let mut zw = ZipWriter::new(Cursor::new(Vec::new()));
    for f in files {
        if is_vendored_package(&f.path) {
            continue;
        }
        if submodule(&f.path) {
            continue;
        }
        if !f.is_regular() {
            continue;
        }
        let name = match f.path.strip_prefix(prefix) {
            Some(name) => name,
            None => continue,
        };
        zw.start_file(format!("{}@{}/{}", module, version, name), options)?;
        zw.write_all(&f.data)?;
    }
    Ok(zw.finish()?.into_inner())
}
