//! The decode worker.
//!
//! One task per engine owns the decoder, the frame cache and the GOP cache.
//! It services range and intra batches one segment at a time and slips
//! one-shot requests in between segments, so the decoder never holds two
//! decode intents at once. Everything it produces leaves through watch
//! channels as immutable snapshots.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use filmstrip_media::{
    is_whole_file, parse_init, parse_media_segment, CodedFrame, DecoderConfig, GopStructure,
    SegmentCatalog,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheKey, CacheSnapshot, FrameCache, VisibleRange};
use crate::config::EngineConfig;
use crate::coordinator::IntraSegment;
use crate::decode::{nearest, DecodeEngine, DecodeMode, DecodedFrame, DecoderFactory};
use crate::engine::{BoundaryPreview, EngineStatus};
use crate::error::{EngineError, Result};
use crate::frames::{self, TIMESTAMP_EPSILON};
use crate::source::{Decryptor, KeyMaterial, RenditionId, StreamSource};

/// Messages from the engine handle and the coordinator.
#[derive(Debug)]
pub(crate) enum Command {
    /// Replace the queued packed work.
    DecodeRange {
        segments: Vec<usize>,
        visible: VisibleRange,
    },
    /// The viewport moved without new packed work; trim the cache to it.
    Viewport { visible: VisibleRange },
    /// Replace the queued dense work.
    IntraBatch { segments: Vec<IntraSegment> },
    GopStructure {
        segment: usize,
        reply: oneshot::Sender<Result<Arc<GopStructure>>>,
    },
    SaveFrameAt {
        time: f64,
        reply: oneshot::Sender<Option<DecodedFrame>>,
    },
    SaveFrameAtPosition {
        segment: usize,
        position: f64,
        reply: oneshot::Sender<Option<DecodedFrame>>,
    },
    BoundaryPreview {
        time: f64,
        frame_number: u64,
        reply: oneshot::Sender<Option<BoundaryPreview>>,
    },
    SegmentFrames {
        segment: usize,
        cancel: CancellationToken,
        reply: oneshot::Sender<Option<Vec<DecodedFrame>>>,
    },
    SwitchRendition {
        rendition: RenditionId,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
struct DecodeTask {
    segment: usize,
    mode: DecodeMode,
}

/// Everything fetched for one rendition before its decoder is configured.
pub(crate) struct Session {
    rendition: RenditionId,
    catalog: Arc<SegmentCatalog>,
    config: DecoderConfig,
    key: Option<KeyMaterial>,
}

/// Fetch the catalog and init segment of `rendition`.
pub(crate) async fn open_session(
    source: &dyn StreamSource,
    rendition: &RenditionId,
) -> Result<Session> {
    let catalog = source.segment_catalog(rendition).await?;
    let init_url = source.init_segment_url(rendition, &catalog).await?;
    let init = source
        .fetch_bytes(&init_url, catalog.init.byte_range())
        .await?;
    let config = parse_init(&init)?;
    let key = if config.encrypted {
        source.encryption(rendition).await
    } else {
        None
    };

    debug!(
        rendition = %rendition,
        segments = catalog.len(),
        codec = %config.codec,
        encrypted = config.encrypted,
        "session opened"
    );
    Ok(Session {
        rendition: rendition.clone(),
        catalog: Arc::new(catalog),
        config,
        key,
    })
}

/// Senders the worker publishes through.
pub(crate) struct WorkerOutputs {
    pub snapshot: watch::Sender<Arc<CacheSnapshot>>,
    pub catalog: watch::Sender<Option<Arc<SegmentCatalog>>>,
    pub status: watch::Sender<EngineStatus>,
}

pub(crate) struct DecodeWorker {
    source: Arc<dyn StreamSource>,
    factory: DecoderFactory,
    decryptor: Option<Arc<dyn Decryptor>>,
    settings: EngineConfig,
    outputs: WorkerOutputs,
    engine: DecodeEngine,
    cache: FrameCache,
    gops: HashMap<usize, Arc<GopStructure>>,
    parsed: Option<(usize, Arc<Vec<CodedFrame>>)>,
    tasks: VecDeque<DecodeTask>,
    visible: Option<VisibleRange>,
    session: Option<Session>,
    generation: u64,
    unsupported: bool,
}

impl DecodeWorker {
    pub fn new(
        source: Arc<dyn StreamSource>,
        factory: DecoderFactory,
        decryptor: Option<Arc<dyn Decryptor>>,
        settings: EngineConfig,
        outputs: WorkerOutputs,
    ) -> Self {
        let engine = DecodeEngine::new(factory());
        Self {
            source,
            factory,
            decryptor,
            settings,
            outputs,
            engine,
            cache: FrameCache::new(),
            gops: HashMap::new(),
            parsed: None,
            tasks: VecDeque::new(),
            visible: None,
            session: None,
            generation: 0,
            unsupported: false,
        }
    }

    /// Configure the decoder for the first session.
    pub async fn attach(&mut self, session: Session) {
        let result = self.engine.configure(&session.config).await;
        self.activate(session, result);
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!(generation = self.generation, "decode worker started");
        loop {
            let command = if self.tasks.is_empty() {
                match commands.recv().await {
                    Some(command) => command,
                    None => break,
                }
            } else {
                match commands.try_recv() {
                    Ok(command) => command,
                    Err(mpsc::error::TryRecvError::Empty) => {
                        if let Some(task) = self.tasks.pop_front() {
                            self.run_task(task).await;
                        }
                        continue;
                    }
                    Err(mpsc::error::TryRecvError::Disconnected) => break,
                }
            };

            if matches!(command, Command::Shutdown) {
                break;
            }
            self.handle(command).await;
        }
        self.teardown();
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::DecodeRange { segments, visible } => {
                self.set_visible(visible);
                if self.unsupported {
                    return;
                }
                self.tasks.retain(|t| t.mode != DecodeMode::Packed);
                for &segment in segments.iter().rev() {
                    self.tasks.push_front(DecodeTask {
                        segment,
                        mode: DecodeMode::Packed,
                    });
                }
                debug!(queued = self.tasks.len(), "range batch queued");
            }
            Command::Viewport { visible } => self.set_visible(visible),
            Command::IntraBatch { segments } => {
                if self.unsupported {
                    return;
                }
                self.tasks.retain(|t| t.mode == DecodeMode::Packed);
                self.tasks.extend(segments.iter().map(|s| DecodeTask {
                    segment: s.segment_index,
                    mode: DecodeMode::Dense {
                        count: s.frame_count,
                    },
                }));
                debug!(queued = self.tasks.len(), "intra batch queued");
            }
            Command::GopStructure { segment, reply } => {
                let _ = reply.send(self.gop_structure(segment).await);
            }
            Command::SaveFrameAt { time, reply } => {
                let result = if self.accepts_one_shots() {
                    let ceiling = self.settings.one_shot_timeout();
                    let outcome = tokio::time::timeout(ceiling, self.save_frame_at(time)).await;
                    self.settle(outcome, ceiling)
                } else {
                    None
                };
                let _ = reply.send(result);
            }
            Command::SaveFrameAtPosition {
                segment,
                position,
                reply,
            } => {
                let result = if self.accepts_one_shots() {
                    let ceiling = self.settings.one_shot_timeout();
                    let outcome = tokio::time::timeout(
                        ceiling,
                        self.save_frame_at_position(segment, position),
                    )
                    .await;
                    self.settle(outcome, ceiling)
                } else {
                    None
                };
                let _ = reply.send(result);
            }
            Command::BoundaryPreview {
                time,
                frame_number,
                reply,
            } => {
                let result = if self.accepts_one_shots() {
                    let ceiling = self.settings.one_shot_timeout();
                    let outcome =
                        tokio::time::timeout(ceiling, self.boundary_preview(time, frame_number))
                            .await;
                    self.settle(outcome, ceiling)
                } else {
                    None
                };
                let _ = reply.send(result);
            }
            Command::SegmentFrames {
                segment,
                cancel,
                reply,
            } => {
                let result = if self.accepts_one_shots() {
                    let ceiling = self.settings.one_shot_timeout();
                    let outcome =
                        tokio::time::timeout(ceiling, self.segment_frames(segment, cancel)).await;
                    self.settle(outcome, ceiling).flatten()
                } else {
                    None
                };
                let _ = reply.send(result);
            }
            Command::SwitchRendition { rendition, reply } => {
                let _ = reply.send(self.switch_rendition(rendition).await);
            }
            Command::Shutdown => {}
        }
    }

    /// Record the viewport and release whatever fell out of its window.
    fn set_visible(&mut self, visible: VisibleRange) {
        if self.visible == Some(visible) {
            return;
        }
        self.visible = Some(visible);
        if self
            .cache
            .evict(&visible, self.settings.cache.span_multiplier)
            > 0
        {
            self.publish();
        }
    }

    fn accepts_one_shots(&self) -> bool {
        !self.unsupported && self.session.is_some()
    }

    /// Resolve a one-shot outcome. Failures and timeouts come back as `None`
    /// with the decoder abandoned.
    fn settle<T>(
        &mut self,
        outcome: std::result::Result<Result<T>, tokio::time::error::Elapsed>,
        ceiling: Duration,
    ) -> Option<T> {
        match outcome {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                self.engine.abandon();
                if e.is_fatal() {
                    self.disable(&e);
                } else {
                    warn!(error = %e, "one-shot request failed");
                }
                None
            }
            Err(_) => {
                self.engine.abandon();
                warn!(error = %EngineError::DecodeTimeout(ceiling), "one-shot request abandoned");
                None
            }
        }
    }

    fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or(EngineError::EngineClosed)
    }

    /// Fetch, decrypt and parse one segment. The last parsed segment is
    /// memoised so consecutive requests into it skip the fetch.
    async fn load_segment(&mut self, index: usize) -> Result<Arc<Vec<CodedFrame>>> {
        if let Some((parsed, frames)) = &self.parsed {
            if *parsed == index {
                return Ok(Arc::clone(frames));
            }
        }

        let session = self.session()?;
        let descriptor = session
            .catalog
            .get(index)
            .cloned()
            .ok_or_else(|| EngineError::Catalog(format!("segment {} is out of range", index)))?;

        let bytes = self
            .source
            .fetch_bytes(&descriptor.url, descriptor.byte_range())
            .await?;
        let bytes = if session.config.encrypted {
            let key = session.key.as_ref().ok_or_else(|| {
                EngineError::KeyUnavailable(format!("no key material for {}", session.rendition))
            })?;
            let decryptor = self.decryptor.as_ref().ok_or_else(|| {
                EngineError::KeyUnavailable("no decryptor installed".to_string())
            })?;
            decryptor.decrypt(bytes, key)?
        } else {
            bytes
        };

        let mut frames = parse_media_segment(&bytes, &session.config)?;
        if is_whole_file(&bytes) {
            frames = frames
                .into_iter()
                .map(|f| f.rebase(descriptor.start_time))
                .collect();
        }

        let frames = Arc::new(frames);
        self.parsed = Some((index, Arc::clone(&frames)));
        Ok(frames)
    }

    async fn run_task(&mut self, task: DecodeTask) {
        if self.unsupported || self.cache.is_unavailable(task.segment) {
            return;
        }
        let Some(start_time) = self
            .session
            .as_ref()
            .and_then(|s| s.catalog.get(task.segment))
            .map(|s| s.start_time)
        else {
            return;
        };
        if task.mode == DecodeMode::Packed && self.cache.contains(&CacheKey::new(task.segment, start_time))
        {
            return;
        }

        let frames = match self.load_segment(task.segment).await {
            Ok(frames) => frames,
            Err(e) => {
                self.segment_unavailable(task.segment, &e);
                return;
            }
        };

        match self.engine.decode_segment(&frames, task.mode).await {
            Ok(outputs) => {
                let decoded = outputs.len();
                for output in outputs {
                    let timestamp = match task.mode {
                        DecodeMode::Packed => start_time,
                        DecodeMode::Dense { .. } => output.timestamp,
                    };
                    self.cache.put(CacheKey::new(task.segment, timestamp), output.bitmap);
                }
                if let Some(visible) = self.visible {
                    self.cache
                        .evict(&visible, self.settings.cache.span_multiplier);
                }
                debug!(segment = task.segment, mode = ?task.mode, decoded, "segment decoded");
                self.publish();
            }
            Err(e) if e.is_fatal() => self.disable(&e),
            Err(e) => self.segment_unavailable(task.segment, &e),
        }
    }

    fn segment_unavailable(&mut self, segment: usize, e: &EngineError) {
        warn!(segment, error = %e, "segment unavailable");
        self.cache.mark_unavailable(segment);
        self.publish();
    }

    async fn gop_structure(&mut self, segment: usize) -> Result<Arc<GopStructure>> {
        if let Some(gop) = self.gops.get(&segment) {
            return Ok(Arc::clone(gop));
        }
        let frames = self.load_segment(segment).await?;
        let gop = Arc::new(GopStructure::new(segment, &frames));
        debug!(segment, pattern = %gop.pattern(), "gop structure computed");
        self.gops.insert(segment, Arc::clone(&gop));
        Ok(gop)
    }

    /// Decode the run ending at `target` and return its output.
    async fn decode_target(&mut self, frames: &[CodedFrame], target: usize) -> Result<DecodedFrame> {
        let run = frames::run_for(frames, &[target]);
        let outputs = self.engine.decode_batch(&frames[run]).await?;
        nearest(&outputs, frames[target].display_timestamp)
            .cloned()
            .ok_or_else(|| EngineError::Decode("decoder produced no output".to_string()))
    }

    async fn save_frame_at(&mut self, time: f64) -> Result<DecodedFrame> {
        let segment = self
            .session()?
            .catalog
            .find_segment_at_time(time)
            .ok_or_else(|| EngineError::Catalog(format!("no segment at {:.3}s", time)))?;
        let frames = self.load_segment(segment).await?;
        let target = frames::frame_at_time(&frames, time)
            .ok_or_else(|| EngineError::MalformedSegment("segment has no frames".to_string()))?;
        self.decode_target(&frames, target).await
    }

    async fn save_frame_at_position(&mut self, segment: usize, position: f64) -> Result<DecodedFrame> {
        let frames = self.load_segment(segment).await?;
        let target = frames::frame_at_position(&frames, position)
            .ok_or_else(|| EngineError::MalformedSegment("segment has no frames".to_string()))?;
        self.decode_target(&frames, target).await
    }

    /// The first frame shown at or after `time` and the frame shown just
    /// before it, which may live in the previous segment. `frame_number` is
    /// only echoed back; `time` alone selects the cut.
    async fn boundary_preview(&mut self, time: f64, frame_number: u64) -> Result<BoundaryPreview> {
        let catalog = Arc::clone(&self.session()?.catalog);
        let mut segment = catalog
            .find_segment_at_time(time)
            .ok_or_else(|| EngineError::Catalog(format!("no segment at {:.3}s", time)))?;

        let mut frames = self.load_segment(segment).await?;
        let mut order = frames::display_order(&frames);
        let mut slot = order
            .iter()
            .position(|&i| frames[i].display_timestamp >= time - TIMESTAMP_EPSILON);
        if slot.is_none() && segment + 1 < catalog.len() {
            segment += 1;
            frames = self.load_segment(segment).await?;
            order = frames::display_order(&frames);
            slot = (!order.is_empty()).then_some(0);
        }
        let slot = slot.ok_or_else(|| {
            EngineError::Catalog(format!("no frame at or after {:.3}s", time))
        })?;
        let after_target = order[slot];

        let (before_frames, before_target) = if slot > 0 {
            (Arc::clone(&frames), order[slot - 1])
        } else {
            let previous = segment.checked_sub(1).ok_or_else(|| {
                EngineError::Catalog(format!("no frame before {:.3}s", time))
            })?;
            let previous_frames = self.load_segment(previous).await?;
            let last = frames::display_order(&previous_frames)
                .last()
                .copied()
                .ok_or_else(|| EngineError::MalformedSegment("segment has no frames".to_string()))?;
            (previous_frames, last)
        };

        let before = self.decode_target(&before_frames, before_target).await?;
        let after = self.decode_target(&frames, after_target).await?;
        Ok(BoundaryPreview {
            frame_number,
            before,
            after,
        })
    }

    /// Every frame of one segment in display order, or `None` once `cancel`
    /// fires.
    async fn segment_frames(
        &mut self,
        segment: usize,
        cancel: CancellationToken,
    ) -> Result<Option<Vec<DecodedFrame>>> {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let frames = self.load_segment(segment).await?;
        let start = frames::first_sync(&frames)
            .ok_or_else(|| EngineError::MalformedSegment("segment has no sync frame".to_string()))?;
        let outputs = self.engine.decode_cancellable(&frames[start..], &cancel).await?;
        if outputs.is_none() {
            debug!(segment, "segment frame batch cancelled");
        }
        Ok(outputs)
    }

    async fn switch_rendition(&mut self, rendition: RenditionId) -> Result<()> {
        let session = open_session(self.source.as_ref(), &rendition).await?;

        self.tasks.clear();
        let released = self.cache.clear();
        self.gops.clear();
        self.parsed = None;
        self.generation += 1;
        self.outputs.status.send_replace(EngineStatus::Attaching);
        info!(
            rendition = %rendition,
            generation = self.generation,
            released,
            "switching rendition"
        );

        let decoder = (self.factory)();
        let result = self.engine.reconfigure(decoder, &session.config).await;
        self.activate(session, result);
        Ok(())
    }

    fn activate(&mut self, session: Session, configured: Result<()>) {
        self.outputs
            .catalog
            .send_replace(Some(Arc::clone(&session.catalog)));
        let rendition = session.rendition.clone();
        self.session = Some(session);
        self.unsupported = false;
        self.publish();

        match configured {
            Ok(()) => {
                info!(rendition = %rendition, "rendition ready");
                self.outputs.status.send_replace(EngineStatus::Ready);
            }
            Err(e) => self.disable(&e),
        }
    }

    /// Disable decoding for the rendition. Reported once.
    fn disable(&mut self, e: &EngineError) {
        self.tasks.clear();
        if self.unsupported {
            return;
        }
        self.unsupported = true;
        error!(error = %e, "decoder unsupported; thumbnails disabled for this rendition");
        self.outputs.status.send_replace(EngineStatus::Unsupported {
            reason: e.to_string(),
        });
    }

    fn publish(&self) {
        self.outputs
            .snapshot
            .send_replace(Arc::new(self.cache.snapshot(self.generation)));
    }

    fn teardown(&mut self) {
        self.tasks.clear();
        self.engine.abandon();
        let released = self.cache.clear();
        self.gops.clear();
        self.parsed = None;
        self.session = None;
        self.publish();
        self.outputs.status.send_replace(EngineStatus::Closed);
        info!(released, "decode worker stopped");
    }
}
