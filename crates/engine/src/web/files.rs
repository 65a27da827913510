//! Static file serving
//!
//! GET `/` serves the agent UI index; `/dynamic/<path>` comes from the
//! configurable dynamic root; everything else is looked up under
//! `www/agent/` first and `www/contrib/` second. Paths that resolve to
//! nothing fall through to the agent-connection API.

use std::path::{Path, PathBuf};

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;

use crate::config::EngineConfig;

/// Resolve a request path to a file on disk, if any.
pub async fn resolve(config: &EngineConfig, path: &str) -> Option<PathBuf> {
    let relative = sanitize(path)?;

    if relative.as_os_str().is_empty() {
        let index = config.general.www_root.join("agent").join("index.html");
        return exists(index).await;
    }

    if let Ok(dynamic) = relative.strip_prefix("dynamic") {
        return exists(config.general.dynamic_root.join(dynamic)).await;
    }

    let agent = config.general.www_root.join("agent").join(&relative);
    if let Some(found) = exists(agent).await {
        return Some(found);
    }
    exists(config.general.www_root.join("contrib").join(&relative)).await
}

/// Read a resolved file into a response.
pub async fn serve(path: &Path) -> Response {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let mut response = Response::new(Body::from(bytes));
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, content_type(path));
            response
        }
        Err(_) => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("not found"))
            .expect("static response"),
    }
}

/// Strip the leading slash and refuse traversal segments.
fn sanitize(path: &str) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for segment in path.trim_start_matches('/').split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            other if other.contains('\\') => return None,
            other => clean.push(other),
        }
    }
    Some(clean)
}

async fn exists(path: PathBuf) -> Option<PathBuf> {
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => Some(path),
        _ => None,
    }
}

fn content_type(path: &Path) -> HeaderValue {
    let mime = match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "application/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    };
    HeaderValue::from_static(mime)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_root(root: &Path) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.general.www_root = root.to_path_buf();
        config.general.dynamic_root = root.join("dyn");
        config
    }

    #[tokio::test]
    async fn root_serves_agent_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("agent")).unwrap();
        std::fs::write(dir.path().join("agent/index.html"), "<html>agent</html>").unwrap();

        let config = config_with_root(dir.path());
        let resolved = resolve(&config, "/").await.expect("index resolves");
        assert!(resolved.ends_with("agent/index.html"));
    }

    #[tokio::test]
    async fn agent_then_contrib_fallback() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("agent")).unwrap();
        std::fs::create_dir_all(dir.path().join("contrib")).unwrap();
        std::fs::write(dir.path().join("contrib/lib.js"), "// contrib").unwrap();

        let config = config_with_root(dir.path());
        let resolved = resolve(&config, "/lib.js").await.expect("contrib fallback");
        assert!(resolved.ends_with("contrib/lib.js"));

        std::fs::write(dir.path().join("agent/lib.js"), "// agent").unwrap();
        let resolved = resolve(&config, "/lib.js").await.expect("agent wins");
        assert!(resolved.ends_with("agent/lib.js"));
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_root(dir.path());
        assert!(resolve(&config, "/../etc/passwd").await.is_none());
    }

    #[tokio::test]
    async fn dynamic_uses_its_own_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("dyn")).unwrap();
        std::fs::write(dir.path().join("dyn/report.json"), "{}").unwrap();

        let config = config_with_root(dir.path());
        let resolved = resolve(&config, "/dynamic/report.json").await.expect("dynamic resolves");
        assert!(resolved.ends_with("dyn/report.json"));
    }
}
