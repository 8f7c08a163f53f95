//! Resolution of `@import("relativePath")` targets.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

/// A named chunk of HSON text.
#[derive(Clone, Debug)]
pub struct HsonSource {
    pub name: String,
    pub text: String,
}

impl HsonSource {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        HsonSource {
            name: name.into(),
            text: text.into(),
        }
    }
}

/// Loads the source named by an import directive.
///
/// `importer` is the name of the source containing the directive; relative paths are
/// resolved against its directory.
pub trait ImportResolver: Send + Sync {
    fn resolve(&self, importer: &str, relative: &str) -> std::io::Result<HsonSource>;
}

/// Join `relative` onto the importer's directory, folding `.` and `..` lexically so the
/// same file always gets the same name.
fn join_relative(importer: &str, relative: &str) -> PathBuf {
    let joined = Path::new(importer)
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join(relative);
    let mut out = PathBuf::new();
    for part in joined.components() {
        match part {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Reads imports from the local filesystem.
#[derive(Clone, Debug, Default)]
pub struct FileResolver;

impl ImportResolver for FileResolver {
    fn resolve(&self, importer: &str, relative: &str) -> std::io::Result<HsonSource> {
        let path = join_relative(importer, relative);
        let text = std::fs::read_to_string(&path)?;
        Ok(HsonSource::new(path.to_string_lossy(), strip_bom(text)))
    }
}

/// Rejects every import; used for sources without a directory (e.g. HTTP).
#[derive(Clone, Debug, Default)]
pub struct NoImports;

impl ImportResolver for NoImports {
    fn resolve(&self, importer: &str, relative: &str) -> std::io::Result<HsonSource> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("'{}' cannot import '{}'", importer, relative),
        ))
    }
}

/// In-memory sources keyed by path, resolved the same way as files.
#[derive(Clone, Debug, Default)]
pub struct MemoryResolver {
    files: HashMap<PathBuf, String>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        self.files.insert(path.into(), text.into());
        self
    }
}

impl ImportResolver for MemoryResolver {
    fn resolve(&self, importer: &str, relative: &str) -> std::io::Result<HsonSource> {
        let path = join_relative(importer, relative);
        self.files
            .get(&path)
            .map(|text| HsonSource::new(path.to_string_lossy(), text.clone()))
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, format!("{} not found", path.display())))
    }
}

pub(crate) fn strip_bom(text: String) -> String {
    match text.strip_prefix('\u{feff}') {
        Some(rest) => rest.to_string(),
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_resolver_joins_against_importer_directory() {
        let resolver = MemoryResolver::new().with_file("conf/parts/a.hson", "{}");
        let src = resolver.resolve("conf/main.hson", "parts/a.hson").unwrap();
        assert_eq!(src.text, "{}");
        assert!(src.name.ends_with("a.hson"));
    }

    #[test]
    fn parent_components_are_folded() {
        let resolver = MemoryResolver::new().with_file("conf/main.hson", "[]");
        let src = resolver.resolve("conf/sub/b.hson", "../main.hson").unwrap();
        assert_eq!(src.name, "conf/main.hson");
        let src = resolver.resolve("conf/sub/b.hson", "./.././main.hson").unwrap();
        assert_eq!(src.name, "conf/main.hson");
    }

    #[test]
    fn no_imports_always_fails() {
        assert!(NoImports.resolve("http://cfg/x", "y.hson").is_err());
    }
}
