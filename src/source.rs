//! Collaborators that supply segment timelines and bytes.
//!
//! The engine never manages HTTP retry or DRM itself: a [`StreamSource`]
//! hands it catalogs and bytes, and an optional [`Decryptor`] turns protected
//! segment bytes into clear ones before parsing.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use filmstrip_media::{ByteRange, InitDescriptor, SegmentCatalog, SegmentDescriptor};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{EngineError, Result};

/// Identifier of one quality/bitrate variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenditionId(pub String);

impl RenditionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RenditionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RenditionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Key material for one encrypted rendition.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub key_id: Vec<u8>,
    pub key: Vec<u8>,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key_id", &hex::encode(&self.key_id))
            .field("key", &"<redacted>")
            .finish()
    }
}

/// The streaming layer as seen by the engine.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn segment_catalog(&self, rendition: &RenditionId) -> Result<SegmentCatalog>;

    /// Where the init segment of an already fetched `catalog` lives.
    async fn init_segment_url(
        &self,
        _rendition: &RenditionId,
        catalog: &SegmentCatalog,
    ) -> Result<String> {
        Ok(catalog.init.url.clone())
    }

    async fn fetch_bytes(&self, url: &str, range: Option<ByteRange>) -> Result<Bytes>;

    /// Key material when the rendition is encrypted.
    async fn encryption(&self, _rendition: &RenditionId) -> Option<KeyMaterial> {
        None
    }
}

/// Removes content protection from fetched segment bytes.
pub trait Decryptor: Send + Sync {
    fn decrypt(&self, bytes: Bytes, key: &KeyMaterial) -> Result<Bytes>;
}

/// JSON manifest listing every rendition's init segment and timeline.
///
/// ```json
/// {
///   "renditions": [{
///     "id": "720p",
///     "init": { "url": "720p/init.mp4" },
///     "segments": [{ "url": "720p/0.m4s", "start_time": 0.0, "end_time": 2.0 }]
///   }]
/// }
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Manifest {
    pub renditions: Vec<RenditionEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RenditionEntry {
    pub id: RenditionId,
    pub init: InitDescriptor,
    pub segments: Vec<SegmentDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<KeyEntry>,
}

/// Hex-encoded key material.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KeyEntry {
    pub key_id: String,
    pub key: String,
}

#[derive(Debug, Clone)]
enum Base {
    Dir(PathBuf),
    Url(String),
}

/// [`StreamSource`] backed by a JSON manifest, fetching `http(s)` urls with
/// reqwest and everything else from the local filesystem.
pub struct ManifestSource {
    manifest: Manifest,
    base: Base,
    client: reqwest::Client,
}

fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

impl ManifestSource {
    /// Parse a manifest whose relative urls resolve against `base_dir`.
    pub fn from_json(json: &str, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let manifest: Manifest = serde_json::from_str(json)
            .map_err(|e| EngineError::Catalog(format!("invalid manifest: {}", e)))?;
        Ok(Self {
            manifest,
            base: Base::Dir(base_dir.into()),
            client: reqwest::Client::new(),
        })
    }

    /// Load a manifest from a local path or an `http(s)` url.
    pub async fn open(location: &str) -> Result<Self> {
        if is_remote(location) {
            let client = reqwest::Client::new();
            let manifest: Manifest = client
                .get(location)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| EngineError::fetch_failed(location, e))?
                .json()
                .await
                .map_err(|e| EngineError::Catalog(format!("invalid manifest: {}", e)))?;
            let base = location
                .rsplit_once('/')
                .map(|(dir, _)| dir.to_string())
                .unwrap_or_else(|| location.to_string());
            tracing::info!(url = location, renditions = manifest.renditions.len(), "loaded manifest");
            return Ok(Self {
                manifest,
                base: Base::Url(base),
                client,
            });
        }

        let path = Path::new(location);
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| EngineError::fetch_failed(location, e))?;
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let source = Self::from_json(&json, base)?;
        tracing::info!(
            path = location,
            renditions = source.manifest.renditions.len(),
            "loaded manifest"
        );
        Ok(source)
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn renditions(&self) -> impl Iterator<Item = &RenditionId> {
        self.manifest.renditions.iter().map(|r| &r.id)
    }

    fn rendition(&self, id: &RenditionId) -> Result<&RenditionEntry> {
        self.manifest
            .renditions
            .iter()
            .find(|r| &r.id == id)
            .ok_or_else(|| EngineError::Catalog(format!("unknown rendition '{}'", id)))
    }

    /// Resolve a manifest url against the manifest location.
    pub fn resolve(&self, url: &str) -> String {
        if is_remote(url) || Path::new(url).is_absolute() {
            return url.to_string();
        }
        match &self.base {
            Base::Dir(dir) => dir.join(url).to_string_lossy().into_owned(),
            Base::Url(base) => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                url.trim_start_matches('/')
            ),
        }
    }

    async fn fetch_remote(&self, url: &str, range: Option<ByteRange>) -> Result<Bytes> {
        let mut request = self.client.get(url);
        if let Some(range) = range {
            request = request.header(reqwest::header::RANGE, range.header_value());
        }
        let response = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| EngineError::fetch_failed(url, e))?;
        response
            .bytes()
            .await
            .map_err(|e| EngineError::fetch_failed(url, e))
    }
}

async fn read_local(path: &str, range: Option<ByteRange>) -> std::io::Result<Bytes> {
    let Some(range) = range else {
        return tokio::fs::read(path).await.map(Bytes::from);
    };
    let mut file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();
    if range.end >= size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("bytes {}-{} past end of {} byte file", range.start, range.end, size),
        ));
    }
    file.seek(std::io::SeekFrom::Start(range.start)).await?;
    let mut data = Vec::with_capacity(range.len() as usize);
    file.take(range.len()).read_to_end(&mut data).await?;
    Ok(Bytes::from(data))
}

#[async_trait]
impl StreamSource for ManifestSource {
    async fn segment_catalog(&self, rendition: &RenditionId) -> Result<SegmentCatalog> {
        let entry = self.rendition(rendition)?;
        let mut init = entry.init.clone();
        init.url = self.resolve(&init.url);
        let segments = entry
            .segments
            .iter()
            .map(|s| SegmentDescriptor {
                url: self.resolve(&s.url),
                ..s.clone()
            })
            .collect();
        Ok(SegmentCatalog::new(init, segments)?)
    }

    async fn fetch_bytes(&self, url: &str, range: Option<ByteRange>) -> Result<Bytes> {
        if is_remote(url) {
            self.fetch_remote(url, range).await
        } else {
            read_local(url, range)
                .await
                .map_err(|e| EngineError::fetch_failed(url, e))
        }
    }

    async fn encryption(&self, rendition: &RenditionId) -> Option<KeyMaterial> {
        let key = self.rendition(rendition).ok()?.key.as_ref()?;
        match (hex::decode(&key.key_id), hex::decode(&key.key)) {
            (Ok(key_id), Ok(key)) => Some(KeyMaterial { key_id, key }),
            _ => {
                tracing::warn!(rendition = %rendition, "manifest key is not valid hex");
                None
            }
        }
    }
}
