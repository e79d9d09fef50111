//! # Track Executor
//!
//! The decode loop of one track, run on a blocking worker of the
//! [`ExecutorContext`].
//!
//! ```text
//! Initializing ──► Playing ◄──► Paused
//!                    │  ▲
//!                    ▼  │
//!                  Seeking
//!                    │
//!                    ▼
//!          Finished | Failed
//! ```
//!
//! Commands are checked before every packet is read and interrupt blocking
//! pushes and reads through the mailbox token. While paused the producer
//! parks instead of reading ahead. The stream, demuxer and
//! decoder live on the worker's stack and are dropped when the loop exits.

use crate::buffer::{FrameBuffer, PushError};
use crate::codec::{DecodedChunk, Decoder, RecoveryBoundary};
use crate::config::PlaybackConfig;
use crate::container::{DemuxOptions, Demuxer, ResyncPolicy};
use crate::error::{PlaybackError, Result};
use crate::probe::Prober;
use crate::registry::FormatRegistry;
use crate::source::{OpenedTrack, TrackSource};
use crate::track::{Command, TrackFailure, TrackShared};
use crate::types::{CodecParameters, Frame, Packet, TrackState};
use core_async::runtime::{try_current, Handle};
use core_async::time::sleep_cancellable;
use core_runtime::events::{CoreEvent, EndReason, StreamEvent, TrackEvent};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Where track workers run. Wraps a Tokio runtime handle; blocking decode
/// loops go to its blocking pool.
#[derive(Debug, Clone)]
pub struct ExecutorContext {
    handle: Handle,
}

impl ExecutorContext {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Context for the runtime the caller is running on.
    pub fn current() -> Result<Self> {
        try_current().map(Self::new).ok_or_else(|| {
            PlaybackError::InvalidState("no Tokio runtime is running on this thread".to_string())
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub(crate) fn spawn_blocking<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn_blocking(task);
    }
}

// ============================================================================
// Timestamps
// ============================================================================

/// Where a decoded chunk sits on the presentation timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Leading samples per channel to drop (encoder delay).
    pub skip: usize,
    /// Presentation time of the first kept sample.
    pub timestamp: Duration,
}

/// Assigns frame timestamps in samples at the output rate.
///
/// A chunk starts at `max(packet start, end of previous chunk)`, so coarse
/// container timestamps never move time backwards. The first
/// `delay` samples of the raw timeline are trimmed and presentation time is
/// raw time minus the delay.
#[derive(Debug, Clone)]
pub struct TimestampTracker {
    sample_rate: u32,
    delay: u64,
    cursor: Option<u64>,
}

impl TimestampTracker {
    pub fn new(sample_rate: u32, delay_samples: u64) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            delay: delay_samples,
            cursor: None,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Places a chunk of `frames` samples per channel. `packet_start` is the
    /// raw sample position of the packet, given for its first chunk only.
    pub fn place(&mut self, packet_start: Option<u64>, frames: u64) -> Placement {
        let start = match (packet_start, self.cursor) {
            (Some(packet), Some(cursor)) => packet.max(cursor),
            (Some(packet), None) => packet,
            (None, Some(cursor)) => cursor,
            (None, None) => 0,
        };
        self.cursor = Some(start + frames);

        let skip = self.delay.saturating_sub(start).min(frames);
        let presented = start + skip - self.delay.min(start + skip);
        Placement {
            skip: skip as usize,
            timestamp: samples_to_duration(presented, self.sample_rate),
        }
    }

    /// Restarts the timeline at raw sample position `position`.
    pub fn reset(&mut self, position: u64) {
        self.cursor = Some(position);
    }
}

fn samples_to_duration(samples: u64, rate: u32) -> Duration {
    crate::types::ticks_to_duration(samples, rate)
}

/// `value` in units of `1/from` converted to units of `1/to`.
fn rescale(value: u64, from: u32, to: u32) -> u64 {
    if from == to {
        return value;
    }
    (value as u128 * to as u128 / from.max(1) as u128).min(u64::MAX as u128) as u64
}

/// Duration to samples, rounded to the nearest sample.
fn duration_to_samples(duration: Duration, rate: u32) -> u64 {
    let scaled = duration.as_nanos() * rate as u128 + 500_000_000;
    (scaled / 1_000_000_000).min(u64::MAX as u128) as u64
}

// ============================================================================
// Executor
// ============================================================================

/// Stage that reported a recoverable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Demux,
    Decode,
}

/// Everything the decode loop owns.
struct Pipeline {
    demuxer: Box<dyn Demuxer>,
    decoder: Box<dyn Decoder>,
    params: CodecParameters,
    tracker: Option<TimestampTracker>,
    /// Raw landed position of a seek made before the first chunk.
    pending_landed: Option<Duration>,
    /// Rate and channel count of the first decoded chunk.
    reference: Option<(u32, u16)>,
    eof: bool,
    consecutive_errors: u32,
}

pub(crate) struct TrackExecutor {
    shared: Arc<TrackShared>,
    buffer: FrameBuffer,
    registry: Arc<FormatRegistry>,
    source: Arc<dyn TrackSource>,
    config: PlaybackConfig,
}

impl TrackExecutor {
    pub fn new(
        shared: Arc<TrackShared>,
        buffer: FrameBuffer,
        registry: Arc<FormatRegistry>,
        source: Arc<dyn TrackSource>,
        config: PlaybackConfig,
    ) -> Self {
        Self {
            shared,
            buffer,
            registry,
            source,
            config,
        }
    }

    /// Runs the track to completion. Blocks the calling thread.
    #[instrument(skip(self), fields(track_id = %self.shared.id, source = %self.shared.identifier))]
    pub fn run(self) {
        let mut pipeline = match self.open() {
            Ok(pipeline) => pipeline,
            Err(PlaybackError::Cancelled) => {
                debug!("Track cancelled while opening");
                self.finish(EndReason::Stopped);
                return;
            }
            Err(err) => {
                self.fail(err);
                return;
            }
        };

        self.shared.resume_state();

        match self.drive(&mut pipeline) {
            Ok(reason) => self.finish(reason),
            Err(err) => self.fail(err),
        }
        drop(pipeline);
        debug!("Track worker exiting");
    }

    /// Opens the source, retrying transient failures under the same budget
    /// as later reads.
    fn open_source(&self) -> Result<OpenedTrack> {
        let policy = self.config.retry_policy();
        let mut failures = 0u32;
        loop {
            if self.shared.cancel.is_cancelled() {
                return Err(PlaybackError::Cancelled);
            }
            let err = match self.source.open(&self.shared.identifier) {
                Ok(opened) => return Ok(opened),
                Err(err) if err.is_transient() => err,
                Err(err) => return Err(err),
            };

            failures += 1;
            if !policy.allows_retry(failures) {
                warn!(attempts = failures, error = %err, "Opening the source kept failing");
                return Err(err.into_exhausted());
            }

            let delay = policy.delay_for_attempt(failures);
            warn!(
                attempt = failures,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure opening source, retrying"
            );
            let _ = self
                .shared
                .events
                .emit(CoreEvent::Stream(StreamEvent::RetryScheduled {
                    track_id: Some(self.shared.id.clone()),
                    attempt: failures,
                    max_attempts: policy.max_attempts,
                    delay_ms: delay.as_millis() as u64,
                    reason: err.to_string(),
                }));
            if !sleep_cancellable(delay, &self.shared.cancel) {
                return Err(PlaybackError::Cancelled);
            }
        }
    }

    fn open(&self) -> Result<Pipeline> {
        let config = &self.config;
        let opened = self.open_source()?;
        let mut stream = opened
            .stream
            .with_read_ahead(config.read_ahead_bytes)
            .with_retry(config.retry_policy())
            .with_cancel_token(self.shared.cancel.child_token())
            .with_events(self.shared.events.clone(), self.shared.id.clone());

        let descriptor = Prober::new(config.probe_bytes).probe(&mut stream, &self.registry)?;
        let options = DemuxOptions {
            max_allocation_bytes: config.max_allocation_bytes,
        };
        let demuxer = (descriptor.factory)(stream, &options)?;
        let params = demuxer.codec_parameters().clone();
        let decoder = self.registry.decoder_for(&params)?;

        let mut metadata = opened.metadata;
        metadata.complete(demuxer.metadata(), params.duration());
        *self.shared.metadata.write() = metadata.clone();
        *self.shared.seekable.lock() = Some(demuxer.can_seek());

        info!(
            container = %descriptor.kind,
            codec = %params.codec,
            sample_rate = params.sample_rate,
            channels = params.channels,
            duration = ?metadata.duration,
            seekable = demuxer.can_seek(),
            "Track opened"
        );
        self.shared.emit(TrackEvent::Started {
            track_id: self.shared.id.clone(),
            title: metadata.title.clone(),
            container: descriptor.kind.to_string(),
            codec: params.codec.to_string(),
            duration_ms: metadata.duration.map(|d| d.as_millis() as u64),
        });

        Ok(Pipeline {
            demuxer,
            decoder,
            params,
            tracker: None,
            pending_landed: None,
            reference: None,
            eof: false,
            consecutive_errors: 0,
        })
    }

    fn drive(&self, pipeline: &mut Pipeline) -> Result<EndReason> {
        loop {
            match self.shared.take_command() {
                Some(Command::Stop) => {
                    self.stop(pipeline);
                    return Ok(EndReason::Stopped);
                }
                Some(Command::Seek(target)) => {
                    match self.seek(pipeline, target) {
                        Err(PlaybackError::Cancelled) => {
                            debug!("Seek interrupted by a newer command")
                        }
                        other => other?,
                    }
                    continue;
                }
                _ => {}
            }

            // Paused: neither read nor decode until play, seek or stop.
            if self.shared.wait_while_paused(self.config.poll_slice()) {
                continue;
            }

            if pipeline.eof {
                if self.buffer.wait_drained(self.config.poll_slice()) && !self.shared.has_pending()
                {
                    info!("Track finished");
                    return Ok(EndReason::Finished);
                }
                continue;
            }

            let token = self.shared.renew_interrupt();
            pipeline.demuxer.stream_mut().set_cancel_token(token.clone());
            self.step(pipeline, &token)?;
        }
    }

    /// Reads, decodes and buffers one packet.
    fn step(&self, pipeline: &mut Pipeline, token: &core_async::CancellationToken) -> Result<()> {
        let packet = match pipeline.demuxer.next_packet() {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                debug!("End of stream reached, draining buffer");
                pipeline.eof = true;
                self.buffer.close();
                return Ok(());
            }
            Err(PlaybackError::Cancelled) => return Ok(()),
            Err(err) if err.is_recoverable() => return self.recover(pipeline, Stage::Demux, err),
            Err(err) => return Err(err),
        };

        let started = Instant::now();
        let chunks = match pipeline.decoder.decode(&packet) {
            Ok(chunks) => chunks,
            Err(err) if err.is_recoverable() => return self.recover(pipeline, Stage::Decode, err),
            Err(err) => return Err(err),
        };
        pipeline.consecutive_errors = 0;
        self.record_decode(started.elapsed(), &chunks);

        let mut first = true;
        for chunk in chunks {
            if chunk.is_empty() {
                continue;
            }
            let packet_ref = if first { Some(&packet) } else { None };
            first = false;
            let Some(frame) = self.to_frame(pipeline, chunk, packet_ref)? else {
                continue;
            };
            match self.buffer.push(frame, token) {
                Ok(()) => self.shared.stats.lock().frames_produced += 1,
                Err(PushError::Interrupted) | Err(PushError::Closed) => return Ok(()),
                Err(PushError::OutOfOrder { last, got }) => {
                    return Err(PlaybackError::Internal(format!(
                        "frame at {:?} produced after {:?}",
                        got, last
                    )))
                }
            }
        }
        Ok(())
    }

    /// Trims, timestamps and validates one decoded chunk.
    fn to_frame(
        &self,
        pipeline: &mut Pipeline,
        chunk: DecodedChunk,
        packet: Option<&Packet>,
    ) -> Result<Option<Frame>> {
        match pipeline.reference {
            None => pipeline.reference = Some((chunk.sample_rate, chunk.channels)),
            Some((rate, channels)) if rate != chunk.sample_rate || channels != chunk.channels => {
                return Err(PlaybackError::ParameterChange(format!(
                    "{} Hz / {} ch changed to {} Hz / {} ch",
                    rate, channels, chunk.sample_rate, chunk.channels
                )));
            }
            Some(_) => {}
        }

        let params = &pipeline.params;
        let rate = chunk.sample_rate;
        let tracker = pipeline.tracker.get_or_insert_with(|| {
            let delay = rescale(params.encoder_delay as u64, params.sample_rate, rate);
            TimestampTracker::new(rate, delay)
        });
        if let Some(landed) = pipeline.pending_landed.take() {
            tracker.reset(duration_to_samples(landed, rate));
        }

        let packet_start = packet.map(|p| rescale(p.timestamp, params.time_base, rate));
        let frames = chunk.frames();
        let placement = tracker.place(packet_start, frames as u64);
        if placement.skip >= frames {
            return Ok(None);
        }

        let channels = chunk.channels as usize;
        let mut samples = chunk.samples;
        if placement.skip > 0 {
            samples.drain(..placement.skip * channels);
        }
        samples.truncate((samples.len() / channels) * channels);

        Ok(Some(Frame {
            timestamp: placement.timestamp,
            sample_rate: rate,
            channels: chunk.channels,
            samples: samples.into(),
        }))
    }

    fn seek(&self, pipeline: &mut Pipeline, target: Duration) -> Result<()> {
        if !pipeline.demuxer.can_seek() {
            warn!("Dropping seek queued before the track turned out non-seekable");
            return Ok(());
        }

        debug!(target_ms = target.as_millis() as u64, "Seeking");
        self.shared.set_state(TrackState::Seeking);
        pipeline.decoder.reset();
        self.buffer.clear();

        let token = self.shared.renew_interrupt();
        pipeline.demuxer.stream_mut().set_cancel_token(token);

        let delay = pipeline.params.delay_duration();
        let landed_raw = pipeline.demuxer.seek(target + delay)?;

        match pipeline.tracker.as_mut() {
            Some(tracker) => {
                let rate = tracker.sample_rate();
                tracker.reset(duration_to_samples(landed_raw, rate));
            }
            None => pipeline.pending_landed = Some(landed_raw),
        }
        pipeline.eof = false;
        pipeline.consecutive_errors = 0;

        let landed = landed_raw.saturating_sub(delay);
        *self.shared.position.lock() = landed;
        self.shared.stats.lock().seeks += 1;

        info!(
            requested_ms = target.as_millis() as u64,
            landed_ms = landed.as_millis() as u64,
            "Seek completed"
        );
        self.shared.emit(TrackEvent::Seeked {
            track_id: self.shared.id.clone(),
            requested_ms: target.as_millis() as u64,
            landed_ms: landed.as_millis() as u64,
        });
        self.shared.resume_state();
        Ok(())
    }

    fn recover(&self, pipeline: &mut Pipeline, stage: Stage, err: PlaybackError) -> Result<()> {
        if stage == Stage::Demux && pipeline.demuxer.resync_policy() == ResyncPolicy::Fatal {
            return Err(PlaybackError::malformed(format!(
                "{} data cannot be resynchronized: {}",
                pipeline.demuxer.kind(),
                err
            )));
        }

        pipeline.consecutive_errors += 1;
        self.shared.stats.lock().recovered_errors += 1;

        // Data was lost; a decoder carrying state across packets starts over.
        if pipeline.decoder.recovery_boundary() == RecoveryBoundary::SyncPoint {
            debug!(stage = ?stage, "Resetting decoder after corrupt data");
            pipeline.decoder.reset();
        }

        if pipeline.consecutive_errors > self.config.max_consecutive_packet_errors {
            return Err(PlaybackError::malformed(format!(
                "{} consecutive corrupt packets, last: {}",
                pipeline.consecutive_errors, err
            )));
        }

        warn!(
            consecutive = pipeline.consecutive_errors,
            error = %err,
            "Skipped corrupt data"
        );
        self.shared.emit(TrackEvent::Recovered {
            track_id: self.shared.id.clone(),
            kind: err.kind(),
            message: err.to_string(),
        });
        Ok(())
    }

    fn record_decode(&self, elapsed: Duration, chunks: &[DecodedChunk]) {
        let mut stats = self.shared.stats.lock();
        stats.packets_read += 1;
        stats.samples_decoded += chunks.iter().map(|c| c.frames() as u64).sum::<u64>();
        let n = stats.packets_read as f64;
        let ms = elapsed.as_secs_f64() * 1000.0;
        stats.avg_decode_time_ms += (ms - stats.avg_decode_time_ms) / n;
    }

    fn stop(&self, pipeline: &mut Pipeline) {
        info!("Track stopped");
        pipeline.decoder.reset();
        self.buffer.clear();
        self.buffer.close();
    }

    fn finish(&self, reason: EndReason) {
        if reason == EndReason::Stopped {
            self.buffer.clear();
            self.buffer.close();
        }
        self.shared.set_state(TrackState::Finished);
        self.shared.emit(TrackEvent::Ended {
            track_id: self.shared.id.clone(),
            reason,
        });
    }

    fn fail(&self, err: PlaybackError) {
        let failure = TrackFailure::from_error(&err);
        error!(
            kind = %failure.kind,
            retryable = failure.retryable,
            causes = ?failure.causes,
            "Track failed: {}",
            err
        );
        *self.shared.failure.lock() = Some(failure.clone());
        self.buffer.clear();
        self.buffer.close();
        self.shared.set_state(TrackState::Failed);
        self.shared.emit(TrackEvent::Failed {
            track_id: self.shared.id.clone(),
            kind: failure.kind,
            message: failure.message,
            causes: failure.causes,
            retryable: failure.retryable,
        });
        self.shared.emit(TrackEvent::Ended {
            track_id: self.shared.id.clone(),
            reason: EndReason::Failed,
        });
    }
}
