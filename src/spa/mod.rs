//! Static hosting for the built dashboard.
//!
//! Files under the static directory are served at their literal paths. Any
//! other path gets the entry document (`index.html`) so the client-side
//! router can take over.

use std::path::{Path, PathBuf};

use tracing::{debug, error, info};

use crate::context::Context;
use crate::{Method, Response, StatusCode};

const ENTRY_DOCUMENT: &str = "index.html";
const ENTRY_MISSING: &str = "Internal server error: index.html not found.";

/// Serves a single-page application from a directory.
#[derive(Debug, Clone)]
pub struct SpaHost {
    root: PathBuf,
}

impl SpaHost {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Answers a GET or HEAD request. HEAD gets the same headers and no body.
    pub async fn serve(&self, ctx: Context) -> Response {
        let path = ctx.request().path();
        let response = match self.resolve(path).await {
            Some(file) => match tokio::fs::read(&file).await {
                Ok(bytes) => {
                    debug!(path, file = %file.display(), "serving static file");
                    file_response(&file, bytes)
                }
                Err(e) => {
                    debug!(path, error = %e, "static file unreadable, falling back");
                    self.entry_document(path).await
                }
            },
            None => self.entry_document(path).await,
        };

        if *ctx.request().method() == Method::Head {
            response.without_body()
        } else {
            response
        }
    }

    /// Maps a request path to a regular file under the root.
    ///
    /// Paths with `..`, `.`, backslashes or NUL are refused without touching
    /// the filesystem. A directory resolves to its own `index.html`. Symlinks
    /// are followed only while their target stays inside the root.
    async fn resolve(&self, path: &str) -> Option<PathBuf> {
        let mut file = self.root.clone();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if segment == ".." || segment == "." || segment.contains(['\\', '\0']) {
                return None;
            }
            file.push(segment);
        }

        let root = tokio::fs::canonicalize(&self.root).await.ok()?;
        let mut file = tokio::fs::canonicalize(&file).await.ok()?;
        if !file.starts_with(&root) {
            debug!(path, target = %file.display(), "static path escapes root");
            return None;
        }

        let meta = tokio::fs::metadata(&file).await.ok()?;
        if meta.is_file() {
            return Some(file);
        }
        if meta.is_dir() {
            file.push(ENTRY_DOCUMENT);
            let index = tokio::fs::canonicalize(&file).await.ok()?;
            return (index.starts_with(&root) && is_file(&index).await).then_some(index);
        }
        None
    }

    async fn entry_document(&self, path: &str) -> Response {
        let entry = self.root.join(ENTRY_DOCUMENT);
        match tokio::fs::read(&entry).await {
            Ok(bytes) => {
                info!(path, "serving index.html for client-side route");
                Response::new(StatusCode::OK)
                    .header("Content-Type", "text/html; charset=utf-8")
                    .body_bytes(bytes)
            }
            Err(e) => {
                error!(path, file = %entry.display(), error = %e, "could not read entry document");
                Response::new(StatusCode::INTERNAL_SERVER_ERROR).body(ENTRY_MISSING)
            }
        }
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

fn file_response(file: &Path, bytes: Vec<u8>) -> Response {
    let mime = mime_guess::from_path(file).first_or_octet_stream();
    let textual = mime.type_() == mime_guess::mime::TEXT
        || mime.subtype() == mime_guess::mime::JAVASCRIPT;
    let content_type = if textual && mime.get_param("charset").is_none() {
        format!("{mime}; charset=utf-8")
    } else {
        mime.to_string()
    };
    Response::new(StatusCode::OK)
        .header("Content-Type", content_type)
        .body_bytes(bytes)
}
