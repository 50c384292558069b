//! Loading source bytes.
//!
//! A source locator is either a URL (`http://`, `https://`) or a path
//! relative to the configured assets directory.  [`HttpFetcher`] handles
//! both; tests swap in `MockFetcher`.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use super::error::AudioError;
use crate::config::AssetsConfig;

// ---------------------------------------------------------------------------
// SourceFetcher trait
// ---------------------------------------------------------------------------

/// Async loader for raw (still encoded) audio bytes.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, src: &str) -> Result<Vec<u8>, AudioError>;
}

// ---------------------------------------------------------------------------
// HttpFetcher
// ---------------------------------------------------------------------------

/// Fetches `http(s)://` sources with `reqwest` and everything else from the
/// assets directory.
///
/// Relative locators are first tried under `assets.root_dir`; when a
/// `base_url` is configured and the file is not on disk, the locator is
/// joined onto it and fetched over HTTP.
pub struct HttpFetcher {
    client: reqwest::Client,
    root_dir: PathBuf,
    base_url: Option<String>,
}

impl HttpFetcher {
    pub fn from_config(config: &AssetsConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            root_dir: config.root_dir.clone(),
            base_url: config
                .base_url
                .as_deref()
                .map(|u| u.trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty()),
        }
    }

    async fn fetch_url(&self, src: &str, url: &str) -> Result<Vec<u8>, AudioError> {
        let err = |reason: String| AudioError::Fetch {
            src: src.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| err(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(err(format!("HTTP {status}")));
        }

        let bytes = response.bytes().await.map_err(|e| err(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, src: &str) -> Result<Vec<u8>, AudioError> {
        if is_remote(src) {
            return self.fetch_url(src, src).await;
        }

        let path = asset_path(&self.root_dir, src).ok_or_else(|| AudioError::Fetch {
            src: src.to_string(),
            reason: "path escapes the assets directory".into(),
        })?;

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) => match &self.base_url {
                Some(base) => {
                    log::debug!("fetch: {} not on disk, trying {base}", path.display());
                    let url = format!("{base}/{}", src.trim_start_matches('/'));
                    self.fetch_url(src, &url).await
                }
                None => Err(AudioError::Fetch {
                    src: src.to_string(),
                    reason: format!("{}: {e}", path.display()),
                }),
            },
        }
    }
}

fn is_remote(src: &str) -> bool {
    src.starts_with("http://") || src.starts_with("https://")
}

/// Resolve `src` under `root`, refusing `..` and absolute components.
fn asset_path(root: &Path, src: &str) -> Option<PathBuf> {
    let relative = Path::new(src.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return None;
    }
    Some(root.join(relative))
}

// ---------------------------------------------------------------------------
// MockFetcher (test only)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub use mock::MockFetcher;


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
