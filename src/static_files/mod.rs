//! Static file handler: root-relative path resolution with a path-traversal
//! guard, `Content-Type` inference by extension, and development/production
//! caching presets.

use std::path::{Path, PathBuf};

use crate::context::Context;
use crate::{Response, StatusCode};

/// Caching behaviour applied to served files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// `Cache-Control: no-cache` — always revalidate (development).
    Development,
    /// `Cache-Control: public, max-age=31536000, immutable`, keyed by a
    /// content hash appended to the URL by the caller (production).
    Production,
}

pub struct StaticFileHandler {
    root: PathBuf,
    cache_policy: CachePolicy,
}

#[derive(Debug, thiserror::Error)]
pub enum StaticFileError {
    #[error("path escapes the configured root")]
    PathTraversal,
    #[error("file not found")]
    NotFound,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StaticFileHandler {
    pub fn new(root: impl Into<PathBuf>, cache_policy: CachePolicy) -> Self {
        Self { root: root.into(), cache_policy }
    }

    /// Resolves `url_path` against the configured root, rejecting any
    /// resolved path that escapes it.
    fn resolve(&self, url_path: &str) -> Result<PathBuf, StaticFileError> {
        let trimmed = url_path.trim_start_matches('/');
        let root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
        let candidate = root.join(trimmed);

        let resolved = if candidate.exists() {
            candidate.canonicalize()?
        } else {
            // `canonicalize` requires the path to exist; reject `..`
            // components lexically when the file itself doesn't exist so a
            // traversal attempt against a non-existent file is still caught.
            if contains_parent_component(Path::new(trimmed)) {
                return Err(StaticFileError::PathTraversal);
            }
            return Err(StaticFileError::NotFound);
        };

        if !resolved.starts_with(&root) {
            return Err(StaticFileError::PathTraversal);
        }

        Ok(resolved)
    }

    /// Reads and serves the file at `url_path` relative to the configured root.
    pub async fn serve(&self, url_path: &str) -> Result<Response, StaticFileError> {
        let path = self.resolve(url_path)?;
        if path.is_dir() {
            return Err(StaticFileError::NotFound);
        }

        let bytes = tokio::fs::read(&path).await?;
        let content_type = mime_guess::from_path(&path).first_or_octet_stream();

        let mut response = Response::new(StatusCode::Ok)
            .header("Content-Type", content_type.essence_str().to_string());

        response = match self.cache_policy {
            CachePolicy::Development => response.header("Cache-Control", "no-cache"),
            CachePolicy::Production => {
                response.header("Cache-Control", "public, max-age=31536000, immutable")
            }
        };

        Ok(response.body_bytes(bytes))
    }

    /// Route-handler-shaped entry point: serves the request path relative to
    /// the configured root, mapping [`StaticFileError`] to the appropriate
    /// HTTP status.
    pub async fn handle(&self, ctx: Context) -> Response {
        match self.serve(ctx.request().path()).await {
            Ok(resp) => resp,
            Err(StaticFileError::NotFound) => Response::new(StatusCode::NotFound).body("Not Found"),
            Err(StaticFileError::PathTraversal) => Response::new(StatusCode::Forbidden).body("Forbidden"),
            Err(StaticFileError::Io(_)) => {
                Response::new(StatusCode::InternalServerError).body("Internal Server Error")
            }
        }
    }
}

fn contains_parent_component(path: &Path) -> bool {
    path.components().any(|c| matches!(c, std::path::Component::ParentDir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_root() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("genesis-kernel-static-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn serves_existing_file_with_inferred_content_type() {
        let root = temp_root();
        let file_path = root.join("index.html");
        std::fs::File::create(&file_path).unwrap().write_all(b"<html></html>").unwrap();

        let handler = StaticFileHandler::new(&root, CachePolicy::Development);
        let resp = handler.serve("/index.html").await.unwrap();
        let bytes = resp.into_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("Content-Type: text/html"));
        assert!(text.contains("Cache-Control: no-cache"));
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let root = temp_root();
        let handler = StaticFileHandler::new(&root, CachePolicy::Development);
        let err = handler.serve("/../../etc/passwd").await.unwrap_err();
        assert!(matches!(err, StaticFileError::PathTraversal));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let root = temp_root();
        let handler = StaticFileHandler::new(&root, CachePolicy::Development);
        let err = handler.serve("/does-not-exist.txt").await.unwrap_err();
        assert!(matches!(err, StaticFileError::NotFound));
    }

    #[tokio::test]
    async fn production_policy_sets_immutable_caching() {
        let root = temp_root();
        std::fs::File::create(root.join("app.js")).unwrap().write_all(b"console.log(1)").unwrap();
        let handler = StaticFileHandler::new(&root, CachePolicy::Production);
        let resp = handler.serve("/app.js").await.unwrap();
        let text = String::from_utf8(resp.into_bytes().to_vec()).unwrap();
        assert!(text.contains("immutable"));
    }
}
