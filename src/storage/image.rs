//! Read-only object store over the merged filesystem of a container image.
//!
//! The image manifest is fetched from a registry speaking the Docker Registry
//! HTTP API v2, every layer blob is downloaded to a temp file and indexed, and
//! lookups walk the layers from the top down applying overlay whiteouts.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempPath;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::archive::{ArchiveCodec, ArchiveEntry, TarCodec, TarCompression};
use crate::error::{StoreError, StoreResult};
use crate::paths::validate_key;

use super::remote::stream_to_temp;
use super::{Listing, ListingBuilder, ObjectReader, ObjectStorage, Tags, bytes_reader};

pub const DOCKER_HUB_REGISTRY: &str = "https://registry-1.docker.io";
pub const DOCKER_HUB_AUTH_URL: &str = "https://auth.docker.io/token";
pub const DOCKER_HUB_SERVICE: &str = "registry.docker.io";
pub const DEFAULT_PLATFORM: &str = "linux/amd64";

const BACKEND: &str = "container image";

/// Manifest media types accepted from the registry
const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.oci.image.index.v1+json";

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

fn default_registry() -> String {
    DOCKER_HUB_REGISTRY.to_string()
}

fn default_auth_url() -> Option<String> {
    Some(DOCKER_HUB_AUTH_URL.to_string())
}

fn default_service() -> String {
    DOCKER_HUB_SERVICE.to_string()
}

fn default_reference() -> String {
    "latest".to_string()
}

fn default_platform() -> String {
    DEFAULT_PLATFORM.to_string()
}

fn default_timeout_secs() -> u64 {
    super::remote::DEFAULT_TIMEOUT_SECS
}

/// Basic credentials exchanged for a registry token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Which image to read and how to reach its registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry")]
    pub registry: String,
    /// Token endpoint; `None` sends requests without a bearer token
    #[serde(default = "default_auth_url")]
    pub auth_url: Option<String>,
    #[serde(default = "default_service")]
    pub service: String,
    pub repository: String,
    /// Tag or digest
    #[serde(default = "default_reference")]
    pub reference: String,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// `os/architecture[/variant]` picked out of multi-platform indexes
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl RegistryConfig {
    /// Docker Hub image; single-segment names get the `library/` namespace
    pub fn new(repository: impl Into<String>) -> Self {
        let repository = repository.into();
        let repository = if repository.contains('/') {
            repository
        } else {
            format!("library/{repository}")
        };

        RegistryConfig {
            registry: default_registry(),
            auth_url: default_auth_url(),
            service: default_service(),
            repository,
            reference: default_reference(),
            credentials: None,
            platform: default_platform(),
            timeout_secs: default_timeout_secs(),
        }
    }

    /// Point at another registry; the token endpoint is cleared and can be
    /// set again with [`with_auth`](Self::with_auth)
    pub fn with_registry(mut self, registry: impl Into<String>) -> Self {
        self.registry = registry.into();
        self.auth_url = None;
        self
    }

    pub fn with_auth(mut self, auth_url: impl Into<String>, service: impl Into<String>) -> Self {
        self.auth_url = Some(auth_url.into());
        self.service = service.into();
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = reference.into();
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.repository.is_empty() {
            return Err(StoreError::Config("repository must not be empty".to_string()));
        }
        if self.reference.is_empty() {
            return Err(StoreError::Config("reference must not be empty".to_string()));
        }
        reqwest::Url::parse(&self.registry)
            .map_err(|e| {
                StoreError::Config(format!("invalid registry url {}: {e}", self.registry))
            })?;
        if let Some(auth_url) = &self.auth_url {
            reqwest::Url::parse(auth_url)
                .map_err(|e| StoreError::Config(format!("invalid auth url {auth_url}: {e}")))?;
        }
        if self.platform.split('/').count() < 2 {
            return Err(StoreError::Config(format!(
                "platform must be os/architecture: {}",
                self.platform
            )));
        }
        Ok(())
    }

    fn registry_base(&self) -> &str {
        self.registry.trim_end_matches('/')
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    layers: Vec<Descriptor>,
    /// Present on manifest lists and OCI indexes
    #[serde(default)]
    manifests: Vec<IndexEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    media_type: String,
    digest: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexEntry {
    digest: String,
    #[serde(default)]
    platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
struct Platform {
    os: String,
    architecture: String,
    #[serde(default)]
    variant: Option<String>,
}

impl Platform {
    fn matches(&self, wanted: &str) -> bool {
        let mut parts = wanted.split('/');
        let os = parts.next().unwrap_or_default();
        let arch = parts.next().unwrap_or_default();
        let variant = parts.next();

        self.os == os
            && self.architecture == arch
            && match (variant, &self.variant) {
                (Some(want), Some(have)) => want == have,
                (Some(_), None) => false,
                (None, _) => true,
            }
    }
}

/// Strip the `./` or `/` that layer tarballs commonly put in front of names
fn normalize(name: &str) -> &str {
    name.trim_start_matches("./").trim_start_matches('/')
}

/// A located entry inside one layer
#[derive(Debug, Clone)]
struct LayerEntry {
    /// Name as recorded in the tarball, used to read it back
    raw_name: String,
    size: u64,
    is_dir: bool,
    mod_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// One downloaded layer blob and its index
struct Layer {
    digest: String,
    file: TempPath,
    codec: Arc<TarCodec>,
    entries: HashMap<String, LayerEntry>,
    /// Paths hidden by `.wh.<name>` markers, without trailing slash
    whiteouts: HashSet<String>,
    /// Directories made opaque by `.wh..wh..opq`, with trailing slash
    /// (empty string for the root)
    opaque: HashSet<String>,
}

impl Layer {
    fn index(
        digest: String,
        file: TempPath,
        codec: Arc<TarCodec>,
        headers: Vec<ArchiveEntry>,
    ) -> Self {
        let mut entries = HashMap::new();
        let mut whiteouts = HashSet::new();
        let mut opaque = HashSet::new();

        for header in headers {
            let mut name = normalize(&header.name).to_string();
            if name.is_empty() {
                continue;
            }
            if header.is_dir && !name.ends_with('/') {
                name.push('/');
            }

            let trimmed = name.trim_end_matches('/');
            let (parent, base) = match trimmed.rfind('/') {
                Some(pos) => (&trimmed[..=pos], &trimmed[pos + 1..]),
                None => ("", trimmed),
            };

            if base == OPAQUE_WHITEOUT {
                opaque.insert(parent.to_string());
                continue;
            }
            if let Some(hidden) = base.strip_prefix(WHITEOUT_PREFIX) {
                whiteouts.insert(format!("{parent}{hidden}"));
                continue;
            }

            entries.insert(
                name,
                LayerEntry {
                    raw_name: header.name,
                    size: header.size,
                    is_dir: header.is_dir,
                    mod_time: header.mod_time,
                },
            );
        }

        Layer {
            digest,
            file,
            codec,
            entries,
            whiteouts,
            opaque,
        }
    }

    /// Whether this layer hides `key` in the layers below it
    fn hides(&self, key: &str) -> bool {
        let trimmed = key.trim_end_matches('/');
        if self.whiteouts.contains(trimmed) {
            return true;
        }

        if self.opaque.contains("") {
            return true;
        }
        // A file in this layer replaces a lower directory of the same name and
        // the other way round
        let other_kind = if key.ends_with('/') {
            trimmed.to_string()
        } else {
            format!("{trimmed}/")
        };
        if self.entries.contains_key(&other_kind) {
            return true;
        }
        for (pos, _) in trimmed.match_indices('/') {
            let ancestor = &trimmed[..pos];
            if self.whiteouts.contains(ancestor) || self.opaque.contains(&trimmed[..=pos]) {
                return true;
            }
            if self.entries.get(ancestor).is_some_and(|entry| !entry.is_dir) {
                return true;
            }
        }
        false
    }
}

/// All layers of the image, bottom first
struct Image {
    layers: Vec<Layer>,
}

impl Image {
    /// Find the visible copy of `key`, topmost layer first
    fn resolve(&self, key: &str) -> Option<(&Layer, &LayerEntry)> {
        for layer in self.layers.iter().rev() {
            if let Some(entry) = layer.entries.get(key) {
                return Some((layer, entry));
            }
            if layer.hides(key) {
                return None;
            }
        }
        None
    }

    /// Every visible entry of the merged filesystem
    fn merged(&self) -> BTreeMap<&str, &LayerEntry> {
        let mut merged = BTreeMap::new();
        let mut above: Vec<&Layer> = Vec::new();

        for layer in self.layers.iter().rev() {
            for (name, entry) in &layer.entries {
                if merged.contains_key(name.as_str()) {
                    continue;
                }
                if above.iter().any(|upper| upper.hides(name)) {
                    continue;
                }
                merged.insert(name.as_str(), entry);
            }
            above.push(layer);
        }

        merged
    }
}

enum State {
    Uninitialized,
    Ready(Arc<Image>),
    Closed,
}

/// Read-only store exposing the files of a container image.
///
/// Nothing is fetched until the first operation. All layers are then
/// downloaded and indexed; downloads read the winning layer's tarball. Every
/// mutation fails with `ReadOnly`.
pub struct ContainerImageObjectStore {
    config: RegistryConfig,
    client: reqwest::Client,
    state: Mutex<State>,
}

impl ContainerImageObjectStore {
    pub fn new(config: RegistryConfig) -> StoreResult<Self> {
        config.validate()?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| StoreError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(ContainerImageObjectStore {
            config,
            client,
            state: Mutex::new(State::Uninitialized),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Layer digests, bottom first. Pulls the image if needed.
    pub async fn layer_digests(&self) -> StoreResult<Vec<String>> {
        let image = self.image().await?;
        Ok(image.layers.iter().map(|layer| layer.digest.clone()).collect())
    }

    async fn image(&self) -> StoreResult<Arc<Image>> {
        let mut state = self.state.lock().await;
        if let State::Ready(image) = &*state {
            return Ok(Arc::clone(image));
        }

        let image = Arc::new(self.pull().await?);
        *state = State::Ready(Arc::clone(&image));
        Ok(image)
    }

    async fn pull(&self) -> StoreResult<Image> {
        let config = &self.config;
        tracing::info!(
            registry = %config.registry,
            repository = %config.repository,
            reference = %config.reference,
            "Pulling image"
        );

        let token = self.token().await?;
        let manifest = self.resolve_manifest(token.as_deref()).await?;

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for descriptor in &manifest.layers {
            layers.push(self.fetch_layer(token.as_deref(), descriptor).await?);
        }

        tracing::info!(
            repository = %config.repository,
            reference = %config.reference,
            layers = layers.len(),
            "Image ready"
        );

        Ok(Image { layers })
    }

    async fn token(&self) -> StoreResult<Option<String>> {
        let Some(auth_url) = &self.config.auth_url else {
            return Ok(None);
        };

        let scope = format!("repository:{}:pull", self.config.repository);
        let mut request = self
            .client
            .get(auth_url)
            .query(&[("service", self.config.service.as_str()), ("scope", scope.as_str())]);
        if let Some(credentials) = &self.config.credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response = request.send().await.map_err(|e| StoreError::Http {
            url: auth_url.clone(),
            message: e.to_string(),
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::AuthFailure(format!(
                "token endpoint {auth_url} returned {status}"
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| StoreError::AuthFailure(format!("unreadable token response: {e}")))?;

        body.token
            .or(body.access_token)
            .filter(|token| !token.is_empty())
            .map(Some)
            .ok_or_else(|| StoreError::AuthFailure("token response carried no token".to_string()))
    }

    async fn get(
        &self,
        url: &str,
        token: Option<&str>,
        accept: Option<&str>,
    ) -> StoreResult<reqwest::Response> {
        let mut request = self.client.get(url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(accept) = accept {
            request = request.header(reqwest::header::ACCEPT, accept);
        }

        request.send().await.map_err(|e| StoreError::Http {
            url: url.to_string(),
            message: e.to_string(),
        })
    }

    async fn fetch_manifest(&self, token: Option<&str>, reference: &str) -> StoreResult<Manifest> {
        let config = &self.config;
        let url = format!(
            "{}/v2/{}/manifests/{reference}",
            config.registry_base(),
            config.repository
        );

        let response = self.get(&url, token, Some(MANIFEST_ACCEPT)).await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(format!(
                "manifest {}:{reference}",
                config.repository
            )));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(StoreError::AuthFailure(format!(
                "registry rejected manifest request for {}",
                config.repository
            )));
        }
        if !status.is_success() {
            return Err(StoreError::Http {
                url,
                message: format!("unexpected status {status}"),
            });
        }

        response.json().await.map_err(|e| StoreError::Http {
            url,
            message: format!("invalid manifest: {e}"),
        })
    }

    /// Fetch the manifest, stepping through a multi-platform index if needed
    async fn resolve_manifest(&self, token: Option<&str>) -> StoreResult<Manifest> {
        let manifest = self.fetch_manifest(token, &self.config.reference).await?;
        if manifest.manifests.is_empty() {
            return Ok(manifest);
        }

        let platform = &self.config.platform;
        let entry = manifest
            .manifests
            .iter()
            .find(|entry| entry.platform.as_ref().is_some_and(|p| p.matches(platform)))
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "manifest {}:{} for platform {platform}",
                    self.config.repository, self.config.reference
                ))
            })?;

        tracing::debug!(
            media_type = ?manifest.media_type,
            digest = %entry.digest,
            platform = %platform,
            "Resolved manifest list entry"
        );

        let resolved = self.fetch_manifest(token, &entry.digest).await?;
        if !resolved.manifests.is_empty() {
            return Err(StoreError::Http {
                url: format!(
                    "{}/v2/{}/manifests/{}",
                    self.config.registry_base(),
                    self.config.repository,
                    entry.digest
                ),
                message: "nested manifest index".to_string(),
            });
        }
        Ok(resolved)
    }

    async fn fetch_layer(
        &self,
        token: Option<&str>,
        descriptor: &Descriptor,
    ) -> StoreResult<Layer> {
        let compression =
            layer_compression(&descriptor.media_type).ok_or_else(|| StoreError::BadFormat {
                path: descriptor.digest.clone(),
                reason: format!("unsupported layer media type {}", descriptor.media_type),
            })?;

        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.config.registry_base(),
            self.config.repository,
            descriptor.digest
        );
        let response = self.get(&url, token, None).await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(format!("layer {}", descriptor.digest)));
        }
        if !status.is_success() {
            return Err(StoreError::Http {
                url,
                message: format!("unexpected status {status}"),
            });
        }

        let suffix = match compression {
            TarCompression::Gzip => ".tar.gz",
            _ => ".tar",
        };
        let (file, received) = stream_to_temp(response, &url, suffix, None).await?;

        let codec = Arc::new(TarCodec::new(compression));
        let headers = {
            let codec = Arc::clone(&codec);
            let path = file.to_path_buf();
            tokio::task::spawn_blocking(move || codec.read_index(&path)).await??
        };

        tracing::debug!(
            digest = %descriptor.digest,
            bytes = received,
            entries = headers.len(),
            "Indexed layer"
        );

        Ok(Layer::index(descriptor.digest.clone(), file, codec, headers))
    }
}

/// Tar compression for a layer media type; `None` when unsupported
fn layer_compression(media_type: &str) -> Option<TarCompression> {
    if media_type.ends_with("gzip") {
        Some(TarCompression::Gzip)
    } else if media_type.ends_with(".tar") {
        Some(TarCompression::None)
    } else {
        None
    }
}

#[async_trait]
impl ObjectStorage for ContainerImageObjectStore {
    async fn upload(&self, key: &str, _data: Bytes, _tags: Tags) -> StoreResult<()> {
        validate_key(key)?;
        Err(StoreError::ReadOnly(BACKEND))
    }

    #[instrument(skip(self), fields(backend = "image", repository = %self.config.repository))]
    async fn download(&self, key: &str) -> StoreResult<ObjectReader> {
        validate_key(key)?;
        let image = self.image().await?;

        let (codec, path, raw_name) = {
            let (layer, entry) = image
                .resolve(key)
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            if entry.is_dir {
                return Ok(bytes_reader(Bytes::new()));
            }
            (Arc::clone(&layer.codec), layer.file.to_path_buf(), entry.raw_name.clone())
        };

        // `image` keeps the layer file alive until the read completes
        let entry = tokio::task::spawn_blocking(move || codec.read_entry(&path, &raw_name)).await??;
        drop(image);

        let entry = entry.ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Ok(bytes_reader(entry.bytes()))
    }

    #[instrument(skip(self), fields(backend = "image", repository = %self.config.repository))]
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        validate_key(key)?;
        Ok(self.image().await?.resolve(key).is_some())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        validate_key(key)?;
        Err(StoreError::ReadOnly(BACKEND))
    }

    #[instrument(skip(self), fields(backend = "image", repository = %self.config.repository))]
    async fn list(&self, prefix: &str) -> StoreResult<Listing> {
        let image = self.image().await?;
        let mut builder = ListingBuilder::new(prefix);
        for (name, entry) in image.merged() {
            builder.add(name, entry.size, entry.is_dir, entry.mod_time);
        }
        Ok(builder.build())
    }

    async fn update_metadata(&self, key: &str, _tags: Tags) -> StoreResult<()> {
        validate_key(key)?;
        Err(StoreError::ReadOnly(BACKEND))
    }

    async fn close(&self) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if let State::Ready(_) = &*state {
            tracing::debug!(repository = %self.config.repository, "Releasing image layers");
            *state = State::Closed;
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "image"
    }
}
