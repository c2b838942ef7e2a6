//! Producer-side request coordinator.
//!
//! The consumer posts its latest viewport on every paint tick. The
//! coordinator plans which segments still need decoding, orders them by
//! distance from the priority anchor, drops plans the worker is already
//! servicing, and throttles what is left to one dispatch per interval with a
//! trailing edge so the final viewport state always gets through.
//!
//! Each dispatch replaces the worker's queue for its lane instead of
//! appending to it.

use std::sync::Arc;
use std::time::Duration;

use filmstrip_media::SegmentCatalog;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{CacheKey, CacheSnapshot, VisibleRange};
use crate::engine::EngineStatus;
use crate::worker::Command;

/// Viewport posted by the consumer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeRequest {
    pub start: f64,
    pub end: f64,
    /// Viewport center while idle, playhead while scrubbing.
    pub anchor: f64,
}

impl RangeRequest {
    pub fn visible(&self) -> VisibleRange {
        VisibleRange::new(self.start, self.end)
    }
}

/// Dense decode of one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntraSegment {
    pub segment_index: usize,
    pub frame_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntraRequest {
    pub segments: Vec<IntraSegment>,
    pub anchor: f64,
}

/// Stable key over an ordered request list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestFingerprint(String);

impl RequestFingerprint {
    pub fn new<T: Fingerprinted>(items: &[T]) -> Self {
        let mut hasher = Sha256::new();
        for item in items {
            item.feed(&mut hasher);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Items that contribute to a [`RequestFingerprint`].
pub trait Fingerprinted {
    fn feed(&self, hasher: &mut Sha256);
}

impl Fingerprinted for usize {
    fn feed(&self, hasher: &mut Sha256) {
        hasher.update((*self as u64).to_le_bytes());
    }
}

impl Fingerprinted for IntraSegment {
    fn feed(&self, hasher: &mut Sha256) {
        hasher.update((self.segment_index as u64).to_le_bytes());
        hasher.update((self.frame_count as u64).to_le_bytes());
    }
}

/// Order segment indices by distance of their midpoint from `anchor`,
/// nearest first; ties keep timeline order.
pub fn prioritize(catalog: &SegmentCatalog, indices: &mut [usize], anchor: f64) {
    let distance = |i: usize| {
        catalog
            .get(i)
            .map(|s| (s.midpoint() - anchor).abs())
            .unwrap_or(f64::INFINITY)
    };
    indices.sort_by(|&a, &b| distance(a).total_cmp(&distance(b)).then(a.cmp(&b)));
}

/// Segments overlapping the request that have neither a packed thumbnail
/// nor a recorded failure, nearest to the anchor first.
pub fn plan_range(
    catalog: &SegmentCatalog,
    snapshot: &CacheSnapshot,
    request: &RangeRequest,
) -> Vec<usize> {
    let visible = request.visible();
    let mut indices: Vec<usize> = catalog
        .overlapping(visible.start, visible.end)
        .filter(|&i| {
            let Some(segment) = catalog.get(i) else {
                return false;
            };
            !snapshot.is_unavailable(i) && !snapshot.contains(&CacheKey::new(i, segment.start_time))
        })
        .collect();
    prioritize(catalog, &mut indices, request.anchor);
    indices
}

/// Dense segments still short of their requested frame count, nearest to the
/// anchor first. Unknown and repeated segment indices are dropped.
pub fn plan_intra(
    catalog: &SegmentCatalog,
    snapshot: &CacheSnapshot,
    request: &IntraRequest,
) -> Vec<IntraSegment> {
    let mut indices = Vec::new();
    for wanted in &request.segments {
        let i = wanted.segment_index;
        if i >= catalog.len()
            || wanted.frame_count == 0
            || snapshot.is_unavailable(i)
            || snapshot.segment_len(i) >= wanted.frame_count
            || indices.contains(&i)
        {
            continue;
        }
        indices.push(i);
    }
    prioritize(catalog, &mut indices, request.anchor);
    indices
        .into_iter()
        .filter_map(|i| request.segments.iter().find(|s| s.segment_index == i).copied())
        .collect()
}

/// Minimum spacing between dispatches.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// `None` when a dispatch may go out at `now`, otherwise the earliest
    /// instant it may.
    pub fn next_slot(&self, now: Instant) -> Option<Instant> {
        let next = self.last? + self.interval;
        (next > now).then_some(next)
    }

    pub fn record(&mut self, now: Instant) {
        self.last = Some(now);
    }
}

/// Dedup and throttle state for one kind of request.
#[derive(Debug)]
struct Lane<T> {
    name: &'static str,
    last: Vec<T>,
    fingerprint: Option<RequestFingerprint>,
    throttle: Throttle,
    trailing: Option<Instant>,
    dirty: bool,
}

impl<T: Fingerprinted + PartialEq + Clone> Lane<T> {
    fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            last: Vec::new(),
            fingerprint: None,
            throttle: Throttle::new(interval),
            trailing: None,
            dirty: false,
        }
    }

    fn reset(&mut self) {
        self.last.clear();
        self.fingerprint = None;
        self.dirty = true;
    }

    /// Whether the lane should be planned now. A throttled lane arms its
    /// trailing deadline instead.
    fn due(&mut self, now: Instant) -> bool {
        if !self.dirty {
            return false;
        }
        match self.throttle.next_slot(now) {
            None => {
                self.trailing = None;
                true
            }
            Some(slot) => {
                self.trailing = Some(slot);
                false
            }
        }
    }

    /// Returns the plan when it has to be dispatched.
    fn offer(&mut self, plan: Vec<T>, now: Instant) -> Option<Vec<T>> {
        self.dirty = false;
        self.trailing = None;

        if plan.is_empty() {
            self.last.clear();
            self.fingerprint = Some(RequestFingerprint::new(&plan));
            return None;
        }

        let fingerprint = RequestFingerprint::new(&plan);
        if self.fingerprint.as_ref() == Some(&fingerprint) {
            debug!(lane = self.name, "request unchanged; suppressed");
            return None;
        }
        if is_subsequence(&plan, &self.last) {
            // What is left of the previous dispatch, still queued in the worker.
            debug!(lane = self.name, remaining = plan.len(), "request in flight; suppressed");
            self.fingerprint = Some(fingerprint);
            return None;
        }

        self.last = plan.clone();
        self.fingerprint = Some(fingerprint);
        self.throttle.record(now);
        Some(plan)
    }
}

/// Whether `needle` appears in `haystack` in the same relative order.
fn is_subsequence<T: PartialEq>(needle: &[T], haystack: &[T]) -> bool {
    let mut rest = haystack.iter();
    needle.iter().all(|n| rest.any(|h| h == n))
}

/// Receivers the coordinator observes.
pub(crate) struct CoordinatorInputs {
    pub range: watch::Receiver<Option<RangeRequest>>,
    pub intra: watch::Receiver<Option<IntraRequest>>,
    pub snapshot: watch::Receiver<Arc<CacheSnapshot>>,
    pub catalog: watch::Receiver<Option<Arc<SegmentCatalog>>>,
    pub status: watch::Receiver<EngineStatus>,
}

pub(crate) struct Coordinator {
    inputs: CoordinatorInputs,
    commands: mpsc::Sender<Command>,
    packed: Lane<usize>,
    dense: Lane<IntraSegment>,
    /// Viewport last handed to the worker.
    visible: Option<VisibleRange>,
    generation: u64,
    shutdown: CancellationToken,
}

impl Coordinator {
    pub fn new(
        inputs: CoordinatorInputs,
        commands: mpsc::Sender<Command>,
        throttle: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let generation = inputs.snapshot.borrow().generation;
        Self {
            inputs,
            commands,
            packed: Lane::new("range", throttle),
            dense: Lane::new("intra", throttle),
            visible: None,
            generation,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        debug!("request coordinator started");
        loop {
            let deadline = match (self.packed.trailing, self.dense.trailing) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                changed = self.inputs.range.changed() => {
                    if changed.is_err() { break; }
                    self.packed.dirty = true;
                }
                changed = self.inputs.intra.changed() => {
                    if changed.is_err() { break; }
                    self.dense.dirty = true;
                }
                changed = self.inputs.snapshot.changed() => {
                    if changed.is_err() { break; }
                    self.mark_all_dirty();
                }
                changed = self.inputs.catalog.changed() => {
                    if changed.is_err() { break; }
                    self.mark_all_dirty();
                }
                changed = self.inputs.status.changed() => {
                    if changed.is_err() { break; }
                    self.mark_all_dirty();
                }
                _ = sleep_until(deadline) => {}
            }

            if self.service().await.is_err() {
                break;
            }
        }
        debug!("request coordinator stopped");
    }

    fn mark_all_dirty(&mut self) {
        self.packed.dirty = true;
        self.dense.dirty = true;
    }

    /// Plan and dispatch whatever is due. Errors only when the worker is gone.
    async fn service(&mut self) -> Result<(), mpsc::error::SendError<Command>> {
        if !self.inputs.status.borrow().is_ready() {
            // Status changes mark both lanes dirty again.
            self.packed.trailing = None;
            self.dense.trailing = None;
            return Ok(());
        }
        let snapshot = self.inputs.snapshot.borrow().clone();
        if snapshot.generation != self.generation {
            debug!(generation = snapshot.generation, "rendition changed; lanes reset");
            self.generation = snapshot.generation;
            self.packed.reset();
            self.dense.reset();
        }
        let Some(catalog) = self.inputs.catalog.borrow().clone() else {
            self.packed.trailing = None;
            self.dense.trailing = None;
            return Ok(());
        };

        let now = Instant::now();
        if self.packed.due(now) {
            let request = *self.inputs.range.borrow();
            match request {
                Some(request) => {
                    let visible = request.visible();
                    let plan = plan_range(&catalog, &snapshot, &request);
                    if let Some(segments) = self.packed.offer(plan, now) {
                        debug!(segments = ?segments, "dispatching range batch");
                        self.commands
                            .send(Command::DecodeRange { segments, visible })
                            .await?;
                        self.visible = Some(visible);
                    } else if self.visible != Some(visible) {
                        // Nothing to decode; the retained window still follows the viewport.
                        debug!(start = visible.start, end = visible.end, "viewport moved");
                        self.commands.send(Command::Viewport { visible }).await?;
                        self.visible = Some(visible);
                    }
                }
                None => self.packed.dirty = false,
            }
        }

        if self.dense.due(now) {
            let request = self.inputs.intra.borrow().clone();
            match request {
                Some(request) => {
                    let plan = plan_intra(&catalog, &snapshot, &request);
                    if let Some(segments) = self.dense.offer(plan, now) {
                        debug!(segments = segments.len(), "dispatching intra batch");
                        self.commands.send(Command::IntraBatch { segments }).await?;
                    }
                }
                None => self.dense.dirty = false,
            }
        }
        Ok(())
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
