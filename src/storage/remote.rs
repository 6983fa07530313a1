//! Read-only object store over an archive fetched from a URL.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::archive::ArchiveFormat;
use crate::error::{StoreError, StoreResult};
use crate::paths::{TEMP_PREFIX, validate_key};

use super::{ArchiveObjectStore, Listing, ObjectReader, ObjectStorage, Tags};

/// Default limit on the whole download request
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

const BACKEND: &str = "remote archive";

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Where and how to fetch a remote archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Explicit format; detected from the URL or the content when absent
    #[serde(default)]
    pub format: Option<ArchiveFormat>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Directory for the downloaded copy; the system temp dir when absent
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

impl RemoteConfig {
    pub fn new(url: impl Into<String>) -> Self {
        RemoteConfig {
            url: url.into(),
            headers: HashMap::new(),
            format: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            temp_dir: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_format(mut self, format: ArchiveFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Whole seconds, rounded up so a sub-second timeout never becomes 0
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> StoreResult<()> {
        let url = reqwest::Url::parse(&self.url)
            .map_err(|e| StoreError::Config(format!("invalid url {}: {e}", self.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(StoreError::Config(format!(
                "unsupported url scheme: {}",
                url.scheme()
            )));
        }
        if self.timeout_secs == 0 {
            return Err(StoreError::Config("timeout_secs must be positive".to_string()));
        }
        Ok(())
    }
}

/// A downloaded archive and the local store reading it.
///
/// The temp file is removed when the last holder drops, so `close` never
/// pulls the file out from under an in-flight read.
struct Downloaded {
    store: ArchiveObjectStore,
    file: TempPath,
}

enum State {
    Uninitialized,
    Ready(Arc<Downloaded>),
    Closed,
}

/// Read-only store over an archive at an HTTP(S) URL.
///
/// The archive is downloaded once, on the first operation, into a local temp
/// file; reads then go to an [`ArchiveObjectStore`] over that file. Every
/// mutation fails with `ReadOnly`. After `close` the next operation starts a
/// fresh download.
pub struct RemoteArchiveObjectStore {
    config: RemoteConfig,
    client: reqwest::Client,
    state: Mutex<State>,
}

impl RemoteArchiveObjectStore {
    pub fn new(config: RemoteConfig) -> StoreResult<Self> {
        config.validate()?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| StoreError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(RemoteArchiveObjectStore {
            config,
            client,
            state: Mutex::new(State::Uninitialized),
        })
    }

    pub fn from_url(url: impl Into<String>) -> StoreResult<Self> {
        Self::new(RemoteConfig::new(url))
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Format of the downloaded archive, if it has been fetched
    pub async fn format(&self) -> Option<ArchiveFormat> {
        match &*self.state.lock().await {
            State::Ready(downloaded) => Some(downloaded.store.format()),
            _ => None,
        }
    }

    /// Return the local delegate, downloading the archive if needed.
    ///
    /// Concurrent first callers queue on the state mutex; only the first one
    /// fetches.
    async fn delegate(&self) -> StoreResult<Arc<Downloaded>> {
        let mut state = self.state.lock().await;
        if let State::Ready(downloaded) = &*state {
            return Ok(Arc::clone(downloaded));
        }

        if matches!(*state, State::Closed) {
            tracing::debug!(url = %self.config.url, "Re-opening closed remote archive");
        }

        let downloaded = Arc::new(self.fetch().await?);
        *state = State::Ready(Arc::clone(&downloaded));
        Ok(downloaded)
    }

    async fn fetch(&self) -> StoreResult<Downloaded> {
        let url = &self.config.url;
        let http_error = |message: String| StoreError::Http {
            url: url.clone(),
            message,
        };

        let mut request = self.client.get(url);
        for (name, value) in &self.config.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| http_error(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(http_error(format!("unexpected status {status}")));
        }

        let url_format = reqwest::Url::parse(url)
            .ok()
            .and_then(|parsed| ArchiveFormat::from_path(parsed.path()));
        let suffix = self
            .config
            .format
            .or(url_format)
            .map(|format| format.extension())
            .unwrap_or(".archive");

        let (temp_path, received) =
            stream_to_temp(response, url, suffix, self.config.temp_dir.as_deref()).await?;

        let format = match self.config.format.or(url_format) {
            Some(format) => format,
            None => sniff_format(&temp_path).await?,
        };

        let store = ArchiveObjectStore::new(&temp_path, format)?;

        tracing::info!(
            url = %url,
            bytes = received,
            format = %format,
            "Downloaded remote archive"
        );

        Ok(Downloaded {
            store,
            file: temp_path,
        })
    }
}

/// Stream a response body into a new temp file in `dir`, or the system temp
/// directory.
///
/// The file is removed if anything fails, including the caller dropping the
/// returned future.
pub(crate) async fn stream_to_temp(
    response: reqwest::Response,
    url: &str,
    suffix: &str,
    dir: Option<&Path>,
) -> StoreResult<(TempPath, u64)> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(TEMP_PREFIX).suffix(suffix);
    let temp = match dir {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile(),
    }
    .map_err(|e| StoreError::io("create temp file for download", e))?;
    let (file, temp_path) = temp.into_parts();
    let mut file = tokio::fs::File::from_std(file);

    let mut body = response.bytes_stream();
    let mut received: u64 = 0;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| StoreError::Http {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        received += chunk.len() as u64;
        file.write_all(&chunk)
            .await
            .map_err(|e| StoreError::io_at("write", &temp_path, e))?;
    }
    file.flush()
        .await
        .map_err(|e| StoreError::io_at("flush", &temp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| StoreError::io_at("sync", &temp_path, e))?;

    Ok((temp_path, received))
}

/// Detect the format from the file's leading bytes, defaulting to ZIP
async fn sniff_format(path: &Path) -> StoreResult<ArchiveFormat> {
    let path = path.to_path_buf();
    let detected = tokio::task::spawn_blocking(move || ArchiveFormat::detect_file(&path)).await??;
    Ok(detected.unwrap_or(ArchiveFormat::Zip))
}

#[async_trait]
impl ObjectStorage for RemoteArchiveObjectStore {
    async fn upload(&self, key: &str, _data: Bytes, _tags: Tags) -> StoreResult<()> {
        validate_key(key)?;
        Err(StoreError::ReadOnly(BACKEND))
    }

    #[instrument(skip(self), fields(backend = "remote", url = %self.config.url))]
    async fn download(&self, key: &str) -> StoreResult<ObjectReader> {
        validate_key(key)?;
        self.delegate().await?.store.download(key).await
    }

    #[instrument(skip(self), fields(backend = "remote", url = %self.config.url))]
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        validate_key(key)?;
        self.delegate().await?.store.exists(key).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        validate_key(key)?;
        Err(StoreError::ReadOnly(BACKEND))
    }

    #[instrument(skip(self), fields(backend = "remote", url = %self.config.url))]
    async fn list(&self, prefix: &str) -> StoreResult<Listing> {
        self.delegate().await?.store.list(prefix).await
    }

    async fn update_metadata(&self, key: &str, _tags: Tags) -> StoreResult<()> {
        validate_key(key)?;
        Err(StoreError::ReadOnly(BACKEND))
    }

    async fn close(&self) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if !matches!(*state, State::Ready(_)) {
            return Ok(());
        }

        if let State::Ready(downloaded) = std::mem::replace(&mut *state, State::Closed) {
            tracing::debug!(url = %self.config.url, "Closing remote archive");
            // In-flight reads hold their own reference and remove the file when done
            if let Ok(downloaded) = Arc::try_unwrap(downloaded) {
                if let Err(e) = downloaded.file.close() {
                    tracing::warn!(
                        url = %self.config.url,
                        error = %e,
                        "Failed to remove downloaded archive"
                    );
                }
            }
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "remote"
    }
}
