//! Decode engine around a stateful video decoder.
//!
//! Frames are submitted synchronously in decode order and become visible
//! only after an awaited flush; outputs are then revealed in display order.
//!
//! State machine:
//!
//! ```text
//! Unconfigured -> Configuring -> Configured
//!                      |              |
//!                      +--> Failed <--+ (fatal decoder error)
//! ```
//!
//! Reconfiguration from `Configured` or `Failed` goes back through
//! `Configuring` and discards whatever the old configuration had in flight.

use std::sync::Arc;

use async_trait::async_trait;
use filmstrip_media::{CodedFrame, DecoderConfig};
use tokio_util::sync::CancellationToken;

use crate::bitmap::DecodedBitmap;
use crate::error::{EngineError, Result};
use crate::frames::{self, TIMESTAMP_EPSILON};

/// One decoder output.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// Display timestamp in seconds.
    pub timestamp: f64,
    pub bitmap: DecodedBitmap,
}

/// A stateful video decoder.
///
/// `configure` failures must be reported as
/// [`EngineError::DecoderUnsupported`]; any error of that kind from `submit`
/// or `flush` is also treated as fatal for the rendition.
#[async_trait]
pub trait VideoDecoder: Send {
    async fn configure(&mut self, config: &DecoderConfig) -> Result<()>;

    /// Queue one frame. Outputs appear only after [`flush`](Self::flush).
    fn submit(&mut self, frame: &CodedFrame) -> Result<()>;

    /// Drain every pending output. Order is unspecified.
    async fn flush(&mut self) -> Result<Vec<DecodedFrame>>;

    /// Drop pending input and output; the configuration is kept.
    fn reset(&mut self);
}

/// Creates one decoder per rendition.
pub type DecoderFactory = Arc<dyn Fn() -> Box<dyn VideoDecoder> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Unconfigured,
    Configuring,
    Configured,
    Failed,
}

/// Which frames of a segment a batch produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    /// The segment's first sync frame only.
    Packed,
    /// `count` frames spread evenly over the segment's display order.
    Dense { count: usize },
}

pub struct DecodeEngine {
    decoder: Box<dyn VideoDecoder>,
    state: DecoderState,
    config: Option<DecoderConfig>,
}

impl DecodeEngine {
    pub fn new(decoder: Box<dyn VideoDecoder>) -> Self {
        Self {
            decoder,
            state: DecoderState::Unconfigured,
            config: None,
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn config(&self) -> Option<&DecoderConfig> {
        self.config.as_ref()
    }

    /// Configure (or reconfigure) the decoder.
    pub async fn configure(&mut self, config: &DecoderConfig) -> Result<()> {
        self.state = DecoderState::Configuring;
        self.decoder.reset();
        self.config = None;

        match self.decoder.configure(config).await {
            Ok(()) => {
                self.state = DecoderState::Configured;
                self.config = Some(config.clone());
                tracing::debug!(codec = %config.codec, "decoder configured");
                Ok(())
            }
            Err(e) => {
                self.state = DecoderState::Failed;
                Err(match e {
                    EngineError::DecoderUnsupported(_) => e,
                    other => EngineError::DecoderUnsupported(other.to_string()),
                })
            }
        }
    }

    /// Tear down the current decoder and configure a fresh one.
    pub async fn reconfigure(
        &mut self,
        decoder: Box<dyn VideoDecoder>,
        config: &DecoderConfig,
    ) -> Result<()> {
        self.decoder.reset();
        self.decoder = decoder;
        self.configure(config).await
    }

    /// Abandon the in-flight decode intent.
    pub fn abandon(&mut self) {
        self.decoder.reset();
    }

    /// Decode `frames` (decode order) and return outputs sorted by display
    /// timestamp, one per timestamp.
    pub async fn decode_batch(&mut self, frames: &[CodedFrame]) -> Result<Vec<DecodedFrame>> {
        self.run(frames, None)
            .await
            .map(|outputs| outputs.unwrap_or_default())
    }

    /// Like [`decode_batch`](Self::decode_batch), stopping between frames and
    /// during flush once `cancel` fires. Returns `None` when cancelled.
    pub async fn decode_cancellable(
        &mut self,
        frames: &[CodedFrame],
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<DecodedFrame>>> {
        self.run(frames, Some(cancel)).await
    }

    /// Decode what `mode` asks for from one parsed segment.
    pub async fn decode_segment(
        &mut self,
        frames: &[CodedFrame],
        mode: DecodeMode,
    ) -> Result<Vec<DecodedFrame>> {
        let targets = match mode {
            DecodeMode::Packed => frames::first_sync(frames).into_iter().collect(),
            DecodeMode::Dense { count } => frames::evenly_spaced(frames, count),
        };
        if targets.is_empty() {
            return Err(EngineError::MalformedSegment(
                "segment has no decodable frame".into(),
            ));
        }

        let run = frames::run_for(frames, &targets);
        let outputs = self.decode_batch(&frames[run]).await?;
        Ok(pick_targets(frames, &targets, outputs))
    }

    async fn run(
        &mut self,
        frames: &[CodedFrame],
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Vec<DecodedFrame>>> {
        if self.state != DecoderState::Configured {
            return Err(EngineError::DecoderUnsupported(format!(
                "decoder is {:?}",
                self.state
            )));
        }

        let cancelled = || cancel.is_some_and(|c| c.is_cancelled());

        for frame in frames {
            if cancelled() {
                self.abandon();
                return Ok(None);
            }
            if let Err(e) = self.decoder.submit(frame) {
                return Err(self.fail_batch(e));
            }
        }

        let flushed = match cancel {
            Some(token) => {
                let outcome = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    result = self.decoder.flush() => Some(result),
                };
                match outcome {
                    Some(result) => result,
                    None => {
                        self.abandon();
                        return Ok(None);
                    }
                }
            }
            None => self.decoder.flush().await,
        };

        let mut outputs = flushed.map_err(|e| self.fail_batch(e))?;
        outputs.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        outputs.dedup_by(|later, earlier| {
            if (later.timestamp - earlier.timestamp).abs() < TIMESTAMP_EPSILON {
                // Keep the later output for a repeated timestamp.
                std::mem::swap(later, earlier);
                true
            } else {
                false
            }
        });

        tracing::trace!(submitted = frames.len(), outputs = outputs.len(), "batch decoded");
        Ok(Some(outputs))
    }

    fn fail_batch(&mut self, e: EngineError) -> EngineError {
        self.abandon();
        if e.is_fatal() {
            self.state = DecoderState::Failed;
        }
        e
    }
}

/// Keep the output nearest to each target's display timestamp.
fn pick_targets(
    frames: &[CodedFrame],
    targets: &[usize],
    outputs: Vec<DecodedFrame>,
) -> Vec<DecodedFrame> {
    let mut picked: Vec<DecodedFrame> = targets
        .iter()
        .filter_map(|&t| nearest(&outputs, frames[t].display_timestamp))
        .cloned()
        .collect();
    picked.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
    picked.dedup_by(|a, b| (a.timestamp - b.timestamp).abs() < TIMESTAMP_EPSILON);
    picked
}

/// Output closest to `timestamp`.
pub fn nearest(outputs: &[DecodedFrame], timestamp: f64) -> Option<&DecodedFrame> {
    outputs.iter().min_by(|a, b| {
        (a.timestamp - timestamp)
            .abs()
            .total_cmp(&(b.timestamp - timestamp).abs())
    })
}
