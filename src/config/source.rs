//! Fetch the configuration document over HTTP or from a file, and turn it into a snapshot.

use crate::config::loader::resolve;
use crate::config::types::ServiceCollection;
use crate::error::LoadError;
use crate::hson::{read_document, read_json_text, FileResolver, HashedDocument, HsonSource, WhitespaceHandling};
use std::path::PathBuf;
use std::sync::Arc;

/// Hash reported by the placeholder snapshot.
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One resolved configuration, identified by the hash of the document that produced it.
#[derive(Debug)]
pub struct Snapshot {
    pub hash: String,
    pub services: ServiceCollection,
}

impl Snapshot {
    /// Errors-only snapshot used when the first load fails.
    pub fn placeholder(errors: Vec<String>) -> Self {
        Snapshot {
            hash: ZERO_HASH.to_string(),
            services: ServiceCollection::failed(errors),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.hash == ZERO_HASH
    }
}

/// Where configuration comes from. The URL is tried first; the file is the fallback.
#[derive(Clone, Debug, Default)]
pub struct ConfigSource {
    pub url: Option<String>,
    pub path: Option<PathBuf>,
    pub whitespace: WhitespaceHandling,
}

impl ConfigSource {
    /// Read and parse the configuration document.
    pub async fn fetch(&self, client: &reqwest::Client) -> Result<HashedDocument, LoadError> {
        if let Some(url) = &self.url {
            match self.fetch_url(client, url).await {
                Ok(doc) => return Ok(doc),
                Err(e) if self.path.is_some() => {
                    tracing::warn!(url = %url, error = %e, "config fetch failed; falling back to file");
                }
                Err(e) => return Err(e),
            }
        }
        match &self.path {
            Some(path) => self.fetch_file(path.clone()).await,
            None => Err(LoadError::Settings("either config.Url or config.Path must be set".into())),
        }
    }

    async fn fetch_url(&self, client: &reqwest::Client, url: &str) -> Result<HashedDocument, LoadError> {
        let http_error = |e: reqwest::Error| LoadError::Http {
            url: url.to_string(),
            message: e.to_string(),
        };
        let text = client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(http_error)?
            .text()
            .await
            .map_err(http_error)?;
        read_json_text(url, text, self.whitespace)
    }

    async fn fetch_file(&self, path: PathBuf) -> Result<HashedDocument, LoadError> {
        let whitespace = self.whitespace;
        let display = path.display().to_string();
        tokio::task::spawn_blocking(move || {
            let io_error = |source: std::io::Error| LoadError::Io {
                path: path.display().to_string(),
                source,
            };
            let path = std::fs::canonicalize(&path).map_err(io_error)?;
            let text = std::fs::read_to_string(&path).map_err(io_error)?;
            let source = HsonSource::new(path.to_string_lossy(), crate::hson::import::strip_bom(text));
            read_document(source, whitespace, Arc::new(FileResolver))
        })
        .await
        .map_err(|e| LoadError::Io {
            path: display,
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })?
    }

    /// Fetch and resolve. A document that resolves with a fatal error still yields a
    /// snapshot; its document errors say why.
    pub async fn load(&self, client: &reqwest::Client) -> Result<Snapshot, LoadError> {
        let doc = self.fetch(client).await?;
        let resolution = resolve(&doc.value);
        if resolution.fatal {
            tracing::warn!(hash = %doc.hash, errors = ?resolution.services.errors, "configuration has fatal errors");
        }
        Ok(Snapshot {
            hash: doc.hash,
            services: resolution.services,
        })
    }
}
