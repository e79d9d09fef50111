//! # Playback Engine
//!
//! Entry point for hosts. The engine owns the format registry, the track
//! source and the event bus, and turns identifiers into running
//! [`TrackHandle`]s.
//!
//! ## Usage
//!
//! ```ignore
//! let engine = PlaybackEngine::new(ExecutorContext::current()?, Arc::new(source));
//! let track = engine.load("https://example.com/song.flac")?;
//! loop {
//!     match track.poll_frame(Duration::from_millis(20)) {
//!         PollResult::Frame(frame) => output.write(&frame),
//!         PollResult::NoFrameYet => continue,
//!         PollResult::TrackEnded => break,
//!     }
//! }
//! ```

use crate::buffer::FrameBuffer;
use crate::config::PlaybackConfig;
use crate::error::{PlaybackError, Result};
use crate::executor::{ExecutorContext, TrackExecutor};
use crate::registry::FormatRegistry;
use crate::source::{DefaultTrackSource, TrackSource};
use crate::track::{TrackHandle, TrackShared};
use core_async::CancellationToken;
use core_runtime::config::CoreConfig;
use core_runtime::events::{CoreEvent, EventBus};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Default event bus capacity when the engine creates its own bus.
const DEFAULT_EVENT_BUFFER: usize = 256;

pub struct PlaybackEngine {
    context: ExecutorContext,
    registry: Arc<FormatRegistry>,
    source: Arc<dyn TrackSource>,
    events: EventBus,
    config: PlaybackConfig,
    next_id: AtomicU64,
}

impl PlaybackEngine {
    /// Engine with the default registry, configuration and its own event bus.
    pub fn new(context: ExecutorContext, source: Arc<dyn TrackSource>) -> Self {
        Self {
            context,
            registry: Arc::new(FormatRegistry::with_defaults()),
            source,
            events: EventBus::new(DEFAULT_EVENT_BUFFER),
            config: PlaybackConfig::default(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Engine wired from the host's core configuration: the HTTP bridge and
    /// feature flags feed a [`DefaultTrackSource`] and events go to a bus
    /// sized by `event_buffer_size`.
    pub fn from_core_config(context: ExecutorContext, core: &CoreConfig) -> Self {
        let config = PlaybackConfig::default();
        let source = DefaultTrackSource::from_core_config(
            core,
            context.handle().clone(),
            config.read_timeout(),
        );
        let mut engine = Self::new(context, Arc::new(source));
        engine.events = core.create_event_bus();
        engine
    }

    pub fn with_registry(mut self, registry: FormatRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Publishes track events on a shared bus instead of the engine's own.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Replaces the configuration for tracks loaded from now on.
    pub fn with_config(mut self, config: PlaybackConfig) -> Result<Self> {
        config.validate().map_err(PlaybackError::InvalidState)?;
        self.config = config;
        Ok(self)
    }

    /// Starts loading `identifier` on a blocking worker and returns its
    /// handle immediately, in `Initializing`.
    ///
    /// Opening the source, probing and building the decoder all happen on
    /// the worker; failures there surface as a `Failed` track.
    pub fn load(&self, identifier: &str) -> Result<TrackHandle> {
        if identifier.trim().is_empty() {
            return Err(PlaybackError::InvalidCommand(
                "track identifier is empty".to_string(),
            ));
        }

        let id = format!("track-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let shared = Arc::new(TrackShared::new(
            id.clone(),
            identifier.to_string(),
            self.events.clone(),
            CancellationToken::new(),
        ));
        let buffer = FrameBuffer::new(self.config.buffer_duration(), self.config.poll_slice());

        let executor = TrackExecutor::new(
            shared.clone(),
            buffer.clone(),
            self.registry.clone(),
            self.source.clone(),
            self.config.clone(),
        );
        self.context.spawn_blocking(move || executor.run());

        info!(track_id = %id, identifier, "Track loading");
        Ok(TrackHandle::new(shared, buffer))
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        debug!("New playback event subscriber");
        self.events.subscribe()
    }

    pub fn registry(&self) -> &FormatRegistry {
        &self.registry
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    pub fn context(&self) -> &ExecutorContext {
        &self.context
    }
}

impl std::fmt::Debug for PlaybackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackEngine")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryTrackSource;
    use crate::track::PollResult;
    use crate::types::TrackState;
    use std::time::Duration;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    fn wav(samples: &[i16], rate: u32) -> Vec<u8> {
        let data_len = (samples.len() * 2) as u32;
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVEfmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&rate.to_le_bytes());
        out.extend_from_slice(&(rate * 2).to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    #[test]
    fn test_invalid_config_rejected() {
        let rt = runtime();
        let engine = PlaybackEngine::new(
            ExecutorContext::new(rt.handle().clone()),
            Arc::new(MemoryTrackSource::new()),
        );
        let config = PlaybackConfig {
            buffer_duration_ms: 0,
            ..PlaybackConfig::default()
        };
        assert!(matches!(
            engine.with_config(config),
            Err(PlaybackError::InvalidState(_))
        ));
    }

    #[test]
    fn test_empty_identifier_rejected() {
        let rt = runtime();
        let engine = PlaybackEngine::new(
            ExecutorContext::new(rt.handle().clone()),
            Arc::new(MemoryTrackSource::new()),
        );
        assert!(engine.load("  ").is_err());
    }

    #[test]
    fn test_load_and_drain() {
        let rt = runtime();
        let source = MemoryTrackSource::new();
        let samples: Vec<i16> = (0..8_000).map(|i| (i % 100) as i16).collect();
        source.insert("tone.wav", wav(&samples, 8_000));

        let engine = PlaybackEngine::new(ExecutorContext::new(rt.handle().clone()), Arc::new(source));
        let track = engine.load("tone.wav").unwrap();
        assert_eq!(track.id(), "track-1");

        let mut total = 0usize;
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            match track.poll_frame(Duration::from_millis(20)) {
                PollResult::Frame(frame) => total += frame.frames(),
                PollResult::NoFrameYet => {
                    assert!(std::time::Instant::now() < deadline, "track stalled");
                }
                PollResult::TrackEnded => break,
            }
        }
        assert_eq!(total, samples.len());
        assert_eq!(
            track.wait_for_state(|s| s == TrackState::Finished, Duration::from_secs(5)),
            TrackState::Finished
        );
    }

    #[test]
    fn test_unknown_identifier_fails_track() {
        let rt = runtime();
        let engine = PlaybackEngine::new(
            ExecutorContext::new(rt.handle().clone()),
            Arc::new(MemoryTrackSource::new()),
        );
        let track = engine.load("missing").unwrap();
        assert_eq!(
            track.wait_for_state(|s| s == TrackState::Failed, Duration::from_secs(5)),
            TrackState::Failed
        );
        let failure = track.failure().unwrap();
        assert!(failure.retryable);
        assert_eq!(
            track.poll_frame(Duration::from_millis(10)),
            PollResult::TrackEnded
        );
    }

    #[test]
    fn test_ids_are_unique() {
        let rt = runtime();
        let source = MemoryTrackSource::new();
        source.insert("a", wav(&[0; 16], 8_000));
        let engine = PlaybackEngine::new(ExecutorContext::new(rt.handle().clone()), Arc::new(source));
        let first = engine.load("a").unwrap();
        let second = engine.load("a").unwrap();
        assert_ne!(first.id(), second.id());
    }
}
