//! Shared test harness for integration tests.
//!
//! Provides [`MemorySource`], an in-memory stream source fed with synthetic
//! fMP4 renditions, [`MockDecoder`], a scripted decoder whose bitmaps are
//! tracked through `Weak` references, and [`TestHarness`], which attaches a
//! [`FilmstripEngine`] to both.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use filmstrip::config::EngineConfig;
use filmstrip::{
    ByteRange, CacheSnapshot, CodedFrame, DecodedBitmap, DecodedFrame, DecoderConfig,
    DecoderFactory, Decryptor, EngineError, FilmstripEngine, InitDescriptor, KeyMaterial,
    RenditionId, Result, SegmentCatalog, SegmentDescriptor, StreamSource, VideoDecoder,
};
use filmstrip_media::fmp4::{FragmentBuilder, FragmentSample, InitSegmentBuilder};
use parking_lot::Mutex;

/// Track timescale of every fixture.
pub const TIMESCALE: u32 = 1000;
/// Frame duration in ticks (100ms).
pub const FRAME_TICKS: u32 = 100;
/// Frames per two-second segment.
pub const FRAMES_PER_SEGMENT: usize = 20;
pub const SEGMENT_SECS: f64 = 2.0;

/// XOR key the fixture "encrypts" segments with.
pub const XOR_KEY: u8 = 0x5a;

/// avcC record for High profile level 3.1.
pub fn avcc() -> Vec<u8> {
    vec![0x01, 0x64, 0x00, 0x1f, 0xff, 0xe0, 0x00]
}

/// Shape of a synthetic rendition.
#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub segments: usize,
    pub width: u32,
    pub height: u32,
    /// Use an `I P B B P B B ...` decode order instead of `I P P P ...`.
    pub reorder: bool,
    pub encrypted: bool,
}

impl Default for StreamSpec {
    fn default() -> Self {
        Self {
            segments: 10,
            width: 320,
            height: 180,
            reorder: false,
            encrypted: false,
        }
    }
}

/// Display slot of each decode-order position for the reordered pattern.
fn display_slots(reorder: bool) -> Vec<usize> {
    if !reorder {
        return (0..FRAMES_PER_SEGMENT).collect();
    }
    let mut slots = vec![0];
    let mut next = 1;
    while next + 2 < FRAMES_PER_SEGMENT {
        slots.extend([next + 2, next, next + 1]);
        next += 3;
    }
    slots.extend(next..FRAMES_PER_SEGMENT);
    slots
}

/// One media fragment of a fixture rendition.
pub fn segment_bytes(index: usize, reorder: bool) -> Vec<u8> {
    let samples: Vec<FragmentSample> = display_slots(reorder)
        .into_iter()
        .enumerate()
        .map(|(decode, slot)| {
            let cts = (slot as i32 - decode as i32) * FRAME_TICKS as i32;
            let mut payload = b"FRM".to_vec();
            payload.extend_from_slice(&(index as u32).to_be_bytes());
            payload.push(decode as u8);
            FragmentSample::new(payload, FRAME_TICKS, cts, decode == 0)
        })
        .collect();
    let base = (index * FRAMES_PER_SEGMENT) as u64 * FRAME_TICKS as u64;
    FragmentBuilder::new(index as u32 + 1, 1)
        .base_media_decode_time(base)
        .build(&samples)
}

pub fn init_bytes(spec: &StreamSpec) -> Vec<u8> {
    InitSegmentBuilder::new()
        .timescale(TIMESCALE)
        .dimensions(spec.width, spec.height)
        .video_codec(avcc())
        .encrypted(spec.encrypted)
        .build()
        .data
}

fn xor(bytes: &[u8]) -> Bytes {
    bytes.iter().map(|b| b ^ XOR_KEY).collect::<Vec<u8>>().into()
}

#[derive(Default)]
struct SourceState {
    files: HashMap<String, Bytes>,
    catalogs: HashMap<RenditionId, SegmentCatalog>,
    keys: HashMap<RenditionId, KeyMaterial>,
    failing: HashSet<String>,
    fetched: Vec<String>,
    catalog_requests: usize,
}

/// In-memory [`StreamSource`].
#[derive(Default)]
pub struct MemorySource {
    state: Mutex<SourceState>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synthetic rendition under `mem://<id>/`.
    pub fn add_rendition(&self, id: &str, spec: &StreamSpec) {
        let rendition = RenditionId::from(id);
        let mut state = self.state.lock();

        let init_url = format!("mem://{}/init.mp4", id);
        state.files.insert(init_url.clone(), Bytes::from(init_bytes(spec)));

        let mut segments = Vec::with_capacity(spec.segments);
        for i in 0..spec.segments {
            let url = format!("mem://{}/{}.m4s", id, i);
            let bytes = segment_bytes(i, spec.reorder);
            let bytes = if spec.encrypted {
                xor(&bytes)
            } else {
                Bytes::from(bytes)
            };
            state.files.insert(url.clone(), bytes);
            let start = i as f64 * SEGMENT_SECS;
            segments.push(SegmentDescriptor::new(url, start, start + SEGMENT_SECS));
        }

        let catalog = SegmentCatalog::new(InitDescriptor::new(init_url), segments)
            .expect("fixture catalog is valid");
        state.catalogs.insert(rendition.clone(), catalog);
        if spec.encrypted {
            state.keys.insert(
                rendition,
                KeyMaterial {
                    key_id: vec![0x01],
                    key: vec![XOR_KEY],
                },
            );
        }
    }

    pub fn fail_url(&self, url: &str) {
        self.state.lock().failing.insert(url.to_string());
    }

    pub fn fetched(&self) -> Vec<String> {
        self.state.lock().fetched.clone()
    }

    pub fn catalog_requests(&self) -> usize {
        self.state.lock().catalog_requests
    }
}

#[async_trait]
impl StreamSource for MemorySource {
    async fn segment_catalog(&self, rendition: &RenditionId) -> Result<SegmentCatalog> {
        let mut state = self.state.lock();
        state.catalog_requests += 1;
        state
            .catalogs
            .get(rendition)
            .cloned()
            .ok_or_else(|| EngineError::Catalog(format!("unknown rendition {}", rendition)))
    }

    async fn fetch_bytes(&self, url: &str, range: Option<ByteRange>) -> Result<Bytes> {
        let mut state = self.state.lock();
        state.fetched.push(url.to_string());
        if state.failing.contains(url) {
            return Err(EngineError::fetch_failed(url, "404 Not Found"));
        }
        let bytes = state
            .files
            .get(url)
            .cloned()
            .ok_or_else(|| EngineError::fetch_failed(url, "no such file"))?;
        Ok(match range {
            Some(r) => bytes.slice(r.start as usize..=r.end as usize),
            None => bytes,
        })
    }

    async fn encryption(&self, rendition: &RenditionId) -> Option<KeyMaterial> {
        self.state.lock().keys.get(rendition).cloned()
    }
}

/// Undoes the fixture's XOR "encryption".
pub struct XorDecryptor;

impl Decryptor for XorDecryptor {
    fn decrypt(&self, bytes: Bytes, key: &KeyMaterial) -> Result<Bytes> {
        let k = *key
            .key
            .first()
            .ok_or_else(|| EngineError::KeyUnavailable("empty key".into()))?;
        Ok(bytes.iter().map(|b| b ^ k).collect::<Vec<u8>>().into())
    }
}

#[derive(Default)]
struct LogState {
    configured: Vec<(String, u32, u32)>,
    submitted: Vec<f64>,
    flushes: usize,
    resets: usize,
    bitmaps: Vec<Weak<[u8]>>,
}

/// Everything the mock decoders saw, shared across decoder instances.
#[derive(Clone, Default)]
pub struct DecoderLog {
    state: Arc<Mutex<LogState>>,
}

impl DecoderLog {
    pub fn configured(&self) -> Vec<(String, u32, u32)> {
        self.state.lock().configured.clone()
    }

    /// Display timestamps of every submitted frame, in submission order.
    pub fn submitted(&self) -> Vec<f64> {
        self.state.lock().submitted.clone()
    }

    pub fn take_submitted(&self) -> Vec<f64> {
        std::mem::take(&mut self.state.lock().submitted)
    }

    pub fn flushes(&self) -> usize {
        self.state.lock().flushes
    }

    pub fn bitmaps_created(&self) -> usize {
        self.state.lock().bitmaps.len()
    }

    /// Bitmaps whose pixel buffer is still referenced somewhere.
    pub fn live_bitmaps(&self) -> usize {
        self.state
            .lock()
            .bitmaps
            .iter()
            .filter(|w| w.upgrade().is_some())
            .count()
    }
}

/// Scripted decoder: one 2x2 bitmap per submitted frame, returned in
/// submission order on flush.
pub struct MockDecoder {
    log: DecoderLog,
    reject: bool,
    flush_delay: Option<Duration>,
    pending: Vec<f64>,
    size: (u32, u32),
}

#[async_trait]
impl VideoDecoder for MockDecoder {
    async fn configure(&mut self, config: &DecoderConfig) -> Result<()> {
        if self.reject {
            return Err(EngineError::DecoderUnsupported(format!(
                "{} is not supported",
                config.codec
            )));
        }
        self.size = (config.width, config.height);
        self.log
            .state
            .lock()
            .configured
            .push((config.codec.clone(), config.width, config.height));
        Ok(())
    }

    fn submit(&mut self, frame: &CodedFrame) -> Result<()> {
        if !frame.data.starts_with(b"FRM") {
            return Err(EngineError::Decode("undecodable payload".into()));
        }
        self.pending.push(frame.display_timestamp);
        self.log.state.lock().submitted.push(frame.display_timestamp);
        Ok(())
    }

    async fn flush(&mut self) -> Result<Vec<DecodedFrame>> {
        if let Some(delay) = self.flush_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.log.state.lock();
        state.flushes += 1;
        Ok(self
            .pending
            .drain(..)
            .map(|timestamp| {
                let pixels: Arc<[u8]> = Arc::from(vec![0x80u8; 16]);
                state.bitmaps.push(Arc::downgrade(&pixels));
                DecodedFrame {
                    timestamp,
                    bitmap: DecodedBitmap::new(2, 2, pixels),
                }
            })
            .collect())
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.log.state.lock().resets += 1;
    }
}

/// Factory settings for [`MockDecoder`]s.
#[derive(Clone, Default)]
pub struct MockOptions {
    pub reject: bool,
    pub flush_delay: Option<Duration>,
}

pub fn mock_factory(log: &DecoderLog, options: MockOptions) -> DecoderFactory {
    let log = log.clone();
    Arc::new(move || {
        Box::new(MockDecoder {
            log: log.clone(),
            reject: options.reject,
            flush_delay: options.flush_delay,
            pending: Vec::new(),
            size: (0, 0),
        })
    })
}

/// An attached engine plus the fakes behind it.
pub struct TestHarness {
    pub engine: Arc<FilmstripEngine>,
    pub source: Arc<MemorySource>,
    pub log: DecoderLog,
}

pub struct HarnessBuilder {
    source: MemorySource,
    rendition: String,
    config: EngineConfig,
    mock: MockOptions,
    decryptor: bool,
}

impl HarnessBuilder {
    pub fn rendition(mut self, id: &str, spec: StreamSpec) -> Self {
        self.source.add_rendition(id, &spec);
        self
    }

    pub fn attach_to(mut self, id: &str) -> Self {
        self.rendition = id.to_string();
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn mock(mut self, mock: MockOptions) -> Self {
        self.mock = mock;
        self
    }

    pub fn with_decryptor(mut self) -> Self {
        self.decryptor = true;
        self
    }

    pub async fn attach(self) -> TestHarness {
        let source = Arc::new(self.source);
        let log = DecoderLog::default();
        let mut builder = FilmstripEngine::builder(source.clone(), mock_factory(&log, self.mock))
            .config(self.config);
        if self.decryptor {
            builder = builder.decryptor(Arc::new(XorDecryptor));
        }
        let engine = builder
            .attach(RenditionId::from(self.rendition.as_str()))
            .await
            .expect("engine attaches");

        TestHarness {
            engine: Arc::new(engine),
            source,
            log,
        }
    }
}

impl TestHarness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            source: MemorySource::new(),
            rendition: "main".to_string(),
            config: fast_config(),
            mock: MockOptions::default(),
            decryptor: false,
        }
    }

    /// Ten plain two-second segments under rendition `main`.
    pub async fn new() -> Self {
        Self::builder()
            .rendition("main", StreamSpec::default())
            .attach()
            .await
    }

    /// Wait for a published snapshot matching `predicate`.
    pub async fn wait_for_snapshot(
        &self,
        predicate: impl FnMut(&Arc<CacheSnapshot>) -> bool,
    ) -> Arc<CacheSnapshot> {
        let mut rx = self.engine.subscribe();
        let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(predicate))
            .await
            .expect("snapshot condition within 5s")
            .expect("engine still running");
        Arc::clone(&snapshot)
    }
}

/// Default config with a short throttle to keep tests quick.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.coordinator.throttle_ms = 20;
    config.decode.one_shot_timeout_secs = 5;
    config
}

/// Float comparison at microsecond resolution.
pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}
