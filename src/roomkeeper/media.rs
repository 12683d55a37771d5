//! Content repository downloads with an on-disk cache.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tokio::fs;

const CONTENT_URI_SCHEME: &str = "mxc://";
const DOWNLOAD_PATH: &str = "/_matrix/media/v1/download";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Invalid content URI: {0}")]
    InvalidUri(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Cache error: {0}")]
    Cache(String),
}

/// Split `mxc://server/id` into its server name and media id.
pub fn parse_content_uri(uri: &str) -> Result<(&str, &str), MediaError> {
    let rest = uri
        .strip_prefix(CONTENT_URI_SCHEME)
        .ok_or_else(|| MediaError::InvalidUri(uri.to_string()))?;
    let (server, media_id) = rest
        .split_once('/')
        .ok_or_else(|| MediaError::InvalidUri(uri.to_string()))?;

    // Both parts become path segments of the cache.
    let is_plain_segment = |segment: &str| {
        !segment.is_empty()
            && !segment.contains(['/', '\\'])
            && matches!(
                Path::new(segment).components().next(),
                Some(Component::Normal(_))
            )
    };
    if !is_plain_segment(server) || !is_plain_segment(media_id) {
        return Err(MediaError::InvalidUri(uri.to_string()));
    }

    Ok((server, media_id))
}

#[derive(Debug, Clone)]
pub struct MediaCache {
    client: reqwest::Client,
    homeserver_url: String,
    cache_dir: PathBuf,
}

impl MediaCache {
    pub fn new(homeserver_url: &str, cache_dir: PathBuf) -> Self {
        Self {
            client: reqwest::Client::new(),
            homeserver_url: homeserver_url.trim_end_matches('/').to_string(),
            cache_dir,
        }
    }

    pub fn cache_path(&self, uri: &str) -> Result<PathBuf, MediaError> {
        let (server, media_id) = parse_content_uri(uri)?;
        Ok(self.cache_dir.join(server).join(media_id))
    }

    pub fn download_url(&self, uri: &str) -> Result<String, MediaError> {
        let (server, media_id) = parse_content_uri(uri)?;
        Ok(format!(
            "{}{}/{}/{}",
            self.homeserver_url, DOWNLOAD_PATH, server, media_id
        ))
    }

    /// Return the cached file for `uri`, downloading it first if needed.
    pub async fn download(&self, uri: &str) -> Result<PathBuf, MediaError> {
        let path = self.cache_path(uri)?;
        if fs::try_exists(&path).await.unwrap_or(false) {
            tracing::debug!(target: "roomkeeper::media::download", "Cache hit for {}", uri);
            return Ok(path);
        }

        let url = self.download_url(uri)?;
        let data = attempt_download_once(&self.client, &url).await?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| MediaError::Cache(e.to_string()))?;
        }
        fs::write(&path, &data)
            .await
            .map_err(|e| MediaError::Cache(e.to_string()))?;

        tracing::debug!(
            target: "roomkeeper::media::download",
            "Cached {} ({} bytes) at {}",
            uri,
            data.len(),
            path.display()
        );
        Ok(path)
    }
}

async fn attempt_download_once(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, MediaError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| MediaError::Download(format!("Failed to initiate download: {}", e)))?;

    if !response.status().is_success() {
        return Err(MediaError::Download(format!(
            "Download failed with status: {}",
            response.status()
        )));
    }

    response
        .bytes()
        .await
        .map(|bytes| bytes.to_vec())
        .map_err(|e| MediaError::Download(format!("Failed to read downloaded bytes: {}", e)))
}
