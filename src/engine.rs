//! Engine façade.
//!
//! [`FilmstripEngine`] is the consumer's handle. It owns no decode state:
//! viewport requests go to the coordinator through latest-wins watch
//! channels, one-shot requests go to the decode worker as messages with a
//! reply channel, and results come back as immutable [`CacheSnapshot`]s.
//!
//! ```rust,ignore
//! let engine = FilmstripEngine::builder(source, factory)
//!     .config(config)
//!     .attach("720p".into())
//!     .await?;
//!
//! // Every paint tick:
//! engine.request_range(view_start, view_end, playhead);
//! let snapshot = engine.snapshot();
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use filmstrip_media::{GopStructure, SegmentCatalog};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::CacheSnapshot;
use crate::config::EngineConfig;
use crate::coordinator::{Coordinator, CoordinatorInputs, IntraRequest, IntraSegment, RangeRequest};
use crate::decode::{DecodedFrame, DecoderFactory};
use crate::error::{EngineError, Result};
use crate::source::{Decryptor, RenditionId, StreamSource};
use crate::worker::{open_session, Command, DecodeWorker, WorkerOutputs};

/// Lifecycle of the thumbnail feature for the active rendition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    Attaching,
    Ready,
    /// The decoder rejected the rendition; nothing will be decoded until a
    /// rendition switch succeeds.
    Unsupported { reason: String },
    Closed,
}

impl EngineStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Frames on either side of a cut.
#[derive(Debug, Clone)]
pub struct BoundaryPreview {
    pub frame_number: u64,
    pub before: DecodedFrame,
    pub after: DecodedFrame,
}

pub struct EngineBuilder {
    source: Arc<dyn StreamSource>,
    factory: DecoderFactory,
    decryptor: Option<Arc<dyn Decryptor>>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn decryptor(mut self, decryptor: Arc<dyn Decryptor>) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Fetch the rendition's catalog and init segment, configure a decoder
    /// and start the worker and coordinator tasks.
    ///
    /// Catalog, fetch and init errors fail the attach. A decoder that rejects
    /// the configuration does not: the engine comes up with
    /// [`EngineStatus::Unsupported`].
    pub async fn attach(self, rendition: RenditionId) -> Result<FilmstripEngine> {
        let session = open_session(self.source.as_ref(), &rendition).await?;

        let (status_tx, status_rx) = watch::channel(EngineStatus::Attaching);
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(CacheSnapshot::default()));
        let (catalog_tx, catalog_rx) = watch::channel(None);
        let (range_tx, range_rx) = watch::channel(None);
        let (intra_tx, intra_rx) = watch::channel(None);
        let (command_tx, command_rx) = mpsc::channel(self.config.decode.command_capacity.max(1));

        let mut worker = DecodeWorker::new(
            self.source,
            self.factory,
            self.decryptor,
            self.config.clone(),
            WorkerOutputs {
                snapshot: snapshot_tx,
                catalog: catalog_tx,
                status: status_tx,
            },
        );
        worker.attach(session).await;

        let shutdown = CancellationToken::new();
        let coordinator = Coordinator::new(
            CoordinatorInputs {
                range: range_rx,
                intra: intra_rx,
                snapshot: snapshot_rx.clone(),
                catalog: catalog_rx.clone(),
                status: status_rx.clone(),
            },
            command_tx.clone(),
            self.config.throttle(),
            shutdown.clone(),
        );

        let tasks = vec![
            tokio::spawn(worker.run(command_rx)),
            tokio::spawn(coordinator.run()),
        ];
        let status = status_rx.borrow().clone();
        info!(rendition = %rendition, status = ?status, "engine attached");

        Ok(FilmstripEngine {
            commands: command_tx,
            range: range_tx,
            intra: intra_tx,
            snapshot: snapshot_rx,
            catalog: catalog_rx,
            status: status_rx,
            batches: Mutex::new(HashMap::new()),
            next_batch: AtomicU64::new(0),
            config: self.config,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }
}

pub struct FilmstripEngine {
    commands: mpsc::Sender<Command>,
    range: watch::Sender<Option<RangeRequest>>,
    intra: watch::Sender<Option<IntraRequest>>,
    snapshot: watch::Receiver<Arc<CacheSnapshot>>,
    catalog: watch::Receiver<Option<Arc<SegmentCatalog>>>,
    status: watch::Receiver<EngineStatus>,
    /// In-flight segment-frame batches by segment.
    batches: Mutex<HashMap<usize, (u64, CancellationToken)>>,
    next_batch: AtomicU64,
    config: EngineConfig,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FilmstripEngine {
    pub fn builder(source: Arc<dyn StreamSource>, factory: DecoderFactory) -> EngineBuilder {
        EngineBuilder {
            source,
            factory,
            decryptor: None,
            config: EngineConfig::default(),
        }
    }

    /// Post the visible range. Cheap enough to call every paint tick;
    /// repeated identical state dispatches at most once.
    pub fn request_range(&self, start: f64, end: f64, anchor: f64) {
        let request = RangeRequest { start, end, anchor };
        self.range.send_if_modified(|current| {
            if *current == Some(request) {
                return false;
            }
            *current = Some(request);
            true
        });
    }

    /// Post the dense-mode segments for the current zoom.
    pub fn request_intra_batch(&self, segments: Vec<IntraSegment>, anchor: f64) {
        let request = IntraRequest { segments, anchor };
        self.intra.send_if_modified(|current| {
            if current.as_ref() == Some(&request) {
                return false;
            }
            *current = Some(request);
            true
        });
    }

    /// Classified frames of one segment, computed without decoding and
    /// cached until the rendition changes.
    pub async fn gop_structure(&self, segment: usize) -> Result<Arc<GopStructure>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GopStructure { segment, reply }).await?;
        rx.await.map_err(|_| EngineError::EngineClosed)?
    }

    /// Decode the frame shown at `time`.
    pub async fn save_frame_at(&self, time: f64) -> Option<DecodedFrame> {
        let (reply, rx) = oneshot::channel();
        self.one_shot("save_frame_at", Command::SaveFrameAt { time, reply }, rx)
            .await
    }

    /// Decode the frame at a fractional position of one segment's display
    /// order.
    pub async fn save_frame_at_position(
        &self,
        segment: usize,
        position: f64,
    ) -> Option<DecodedFrame> {
        let (reply, rx) = oneshot::channel();
        self.one_shot(
            "save_frame_at_position",
            Command::SaveFrameAtPosition {
                segment,
                position,
                reply,
            },
            rx,
        )
        .await
    }

    /// Decode the frames on both sides of the cut at `time`.
    ///
    /// `time` alone selects the cut. `frame_number` is the caller's label for
    /// it and comes back unchanged in [`BoundaryPreview::frame_number`].
    pub async fn boundary_preview(&self, time: f64, frame_number: u64) -> Option<BoundaryPreview> {
        let (reply, rx) = oneshot::channel();
        self.one_shot(
            "boundary_preview",
            Command::BoundaryPreview {
                time,
                frame_number,
                reply,
            },
            rx,
        )
        .await
    }

    /// Decode every frame of one segment. A later call for the same segment,
    /// or [`cancel_segment_frames`](Self::cancel_segment_frames), makes this
    /// one return `None`.
    pub async fn segment_frames(&self, segment: usize) -> Option<Vec<DecodedFrame>> {
        let id = self.next_batch.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        if let Some((_, previous)) = self.batches.lock().insert(segment, (id, cancel.clone())) {
            debug!(segment, "superseding segment frame batch");
            previous.cancel();
        }

        let (reply, rx) = oneshot::channel();
        let result = self
            .one_shot(
                "segment_frames",
                Command::SegmentFrames {
                    segment,
                    cancel: cancel.clone(),
                    reply,
                },
                rx,
            )
            .await;

        let mut batches = self.batches.lock();
        if batches.get(&segment).is_some_and(|(current, _)| *current == id) {
            batches.remove(&segment);
        }
        if cancel.is_cancelled() {
            return None;
        }
        result
    }

    /// Stop an in-flight [`segment_frames`](Self::segment_frames) call.
    pub fn cancel_segment_frames(&self, segment: usize) -> bool {
        match self.batches.lock().remove(&segment) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop all decode state and attach to another rendition.
    pub async fn switch_rendition(&self, rendition: RenditionId) -> Result<()> {
        for (_, (_, token)) in self.batches.lock().drain() {
            token.cancel();
        }
        let (reply, rx) = oneshot::channel();
        self.send(Command::SwitchRendition { rendition, reply })
            .await?;
        rx.await.map_err(|_| EngineError::EngineClosed)?
    }

    /// Current cache contents. Hold the snapshot only for the paint that
    /// reads it.
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        Arc::clone(&self.snapshot.borrow())
    }

    /// Receiver notified on every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<CacheSnapshot>> {
        self.snapshot.clone()
    }

    pub fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    /// Wait until the active rendition is past [`EngineStatus::Attaching`].
    pub async fn wait_ready(&self) -> EngineStatus {
        let mut status = self.status.clone();
        let settled = match status
            .wait_for(|s| !matches!(s, EngineStatus::Attaching))
            .await
        {
            Ok(status) => status.clone(),
            Err(_) => EngineStatus::Closed,
        };
        settled
    }

    /// Catalog of the active rendition.
    pub fn catalog(&self) -> Option<Arc<SegmentCatalog>> {
        self.catalog.borrow().clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stop both tasks and release every cached bitmap.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for (_, (_, token)) in self.batches.lock().drain() {
            token.cancel();
        }
        let _ = self.commands.send(Command::Shutdown).await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "engine task ended abnormally");
            }
        }
        info!("engine shut down");
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::EngineClosed)
    }

    async fn one_shot<T>(
        &self,
        operation: &'static str,
        command: Command,
        reply: oneshot::Receiver<Option<T>>,
    ) -> Option<T> {
        if self.send(command).await.is_err() {
            warn!(operation, "engine closed");
            return None;
        }
        let ceiling = self.config.one_shot_timeout();
        match tokio::time::timeout(ceiling, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => None,
            Err(_) => {
                warn!(operation, error = %EngineError::DecodeTimeout(ceiling), "no result");
                None
            }
        }
    }
}

impl Drop for FilmstripEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for (_, (_, token)) in self.batches.lock().drain() {
            token.cancel();
        }
    }
}
