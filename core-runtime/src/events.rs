//! # Event Bus System
//!
//! Structured events published by the playback engine through a
//! `tokio::sync::broadcast` channel.
//!
//! ## Overview
//!
//! - **Event Types**: [`TrackEvent`] for track lifecycle, [`StreamEvent`] for
//!   transport-level notices, wrapped in [`CoreEvent`]
//! - **EventBus**: broadcast channel; cloning shares the channel
//! - **EventStream**: receiver wrapper with optional filtering
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   emit    ┌───────────┐   subscribe   ┌────────────┐
//! │ Track executor ├──────────>│           ├──────────────>│ Host / bot │
//! └────────────────┘           │ EventBus  │               └────────────┘
//! ┌────────────────┐   emit    │           │   subscribe   ┌────────────┐
//! │ Seekable stream├──────────>│           ├──────────────>│ Telemetry  │
//! └────────────────┘           └───────────┘               └────────────┘
//! ```
//!
//! Emitting never blocks; the decode loop calls [`EventBus::emit`] from its
//! blocking worker and ignores the "no subscribers" error.
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, TrackEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(16);
//! let mut rx = bus.subscribe();
//!
//! bus.emit(CoreEvent::Track(TrackEvent::Started {
//!     track_id: "t-1".to_string(),
//!     title: Some("Intro".to_string()),
//!     container: "ogg".to_string(),
//!     codec: "opus".to_string(),
//!     duration_ms: Some(180_000),
//! }))
//! .ok();
//!
//! let event = rx.recv().await.unwrap();
//! assert_eq!(event.track_id(), Some("t-1"));
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, SendError};

pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
///
/// Subscribers that fall further behind receive `RecvError::Lagged`.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Track lifecycle events
    Track(TrackEvent),
    /// Transport events from the seekable stream
    Stream(StreamEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Track(e) => e.description(),
            CoreEvent::Stream(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Track(TrackEvent::Failed { .. }) => EventSeverity::Error,
            CoreEvent::Track(TrackEvent::Recovered { .. }) => EventSeverity::Warning,
            CoreEvent::Stream(StreamEvent::RetryScheduled { .. }) => EventSeverity::Warning,
            CoreEvent::Track(TrackEvent::Started { .. })
            | CoreEvent::Track(TrackEvent::Ended { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }

    /// Track the event refers to, if any.
    pub fn track_id(&self) -> Option<&str> {
        match self {
            CoreEvent::Track(e) => Some(e.track_id()),
            CoreEvent::Stream(StreamEvent::RetryScheduled { track_id, .. }) => track_id.as_deref(),
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Error taxonomy shared by failure events and the playback error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network timeout, reset or partial read. Fatal only once the retry
    /// budget is exhausted.
    TransientTransport,
    /// No container matched, or the codec/feature is not implemented.
    UnsupportedFormat,
    /// Structurally invalid data inside a recognised stream.
    MalformedData,
    /// The caller asked for something the track cannot do in its state.
    Precondition,
    /// Local I/O or an internal invariant broke.
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TransientTransport => "transient_transport",
            FailureKind::UnsupportedFormat => "unsupported_format",
            FailureKind::MalformedData => "malformed_data",
            FailureKind::Precondition => "precondition",
            FailureKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a track stopped producing frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// End of stream reached and every frame was consumed.
    Finished,
    /// Stopped by an explicit command.
    Stopped,
    /// Ended by an unrecoverable error (a `Failed` event precedes this one).
    Failed,
}

// ============================================================================
// Track Events
// ============================================================================

/// Events related to one loaded track.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum TrackEvent {
    /// Probe and decoder setup succeeded; frames are being produced.
    Started {
        track_id: String,
        title: Option<String>,
        container: String,
        codec: String,
        duration_ms: Option<u64>,
    },
    Paused {
        track_id: String,
        position_ms: u64,
    },
    Resumed {
        track_id: String,
        position_ms: u64,
    },
    /// A seek completed; `landed_ms` is where decoding resumed.
    Seeked {
        track_id: String,
        requested_ms: u64,
        landed_ms: u64,
    },
    /// A corrupt region was skipped and decoding continued.
    Recovered {
        track_id: String,
        kind: FailureKind,
        message: String,
    },
    Ended {
        track_id: String,
        reason: EndReason,
    },
    /// The track failed; emitted exactly once per failed track.
    Failed {
        track_id: String,
        kind: FailureKind,
        message: String,
        /// Error sources, outermost first.
        causes: Vec<String>,
        /// Whether the caller may succeed by retrying or trying another source.
        retryable: bool,
    },
}

impl TrackEvent {
    fn description(&self) -> &str {
        match self {
            TrackEvent::Started { .. } => "Track started",
            TrackEvent::Paused { .. } => "Track paused",
            TrackEvent::Resumed { .. } => "Track resumed",
            TrackEvent::Seeked { .. } => "Track seeked",
            TrackEvent::Recovered { .. } => "Recovered from corrupt data",
            TrackEvent::Ended { .. } => "Track ended",
            TrackEvent::Failed { .. } => "Track failed",
        }
    }

    pub fn track_id(&self) -> &str {
        match self {
            TrackEvent::Started { track_id, .. }
            | TrackEvent::Paused { track_id, .. }
            | TrackEvent::Resumed { track_id, .. }
            | TrackEvent::Seeked { track_id, .. }
            | TrackEvent::Recovered { track_id, .. }
            | TrackEvent::Ended { track_id, .. }
            | TrackEvent::Failed { track_id, .. } => track_id,
        }
    }
}

// ============================================================================
// Stream Events
// ============================================================================

/// Transport-level notices from the seekable stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum StreamEvent {
    /// A transient read failure will be retried after `delay_ms`.
    RetryScheduled {
        track_id: Option<String>,
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        reason: String,
    },
}

impl StreamEvent {
    fn description(&self) -> &str {
        match self {
            StreamEvent::RetryScheduled { .. } => "Stream read retry scheduled",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to events.
///
/// Uses `tokio::sync::broadcast` internally, which provides:
/// - Multiple producers (clone the `EventBus`)
/// - Multiple consumers (each `subscribe()` creates a new receiver)
/// - Non-blocking sends, usable from blocking threads
/// - Lagging detection (slow subscribers get `RecvError::Lagged`)
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified per-subscriber buffer size.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an
    /// error if there are no active subscribers.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber receiving all future events.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with optional filtering.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventStream};
///
/// let bus = EventBus::new(16);
/// let failures = EventStream::new(bus.subscribe())
///     .filter(|event| matches!(event, CoreEvent::Track(_)));
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` are returned by `recv`/`try_recv`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map(|f| f(event)).unwrap_or(true)
    }

    /// Receives the next event that passes the filter.
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without blocking.
    ///
    /// Returns `None` if no matching events are currently available.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }

    /// Drains every currently queued matching event.
    pub fn drain(&mut self) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        while let Some(result) = self.try_recv() {
            match result {
                Ok(event) => events.push(event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
        events
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn started(track_id: &str) -> CoreEvent {
        CoreEvent::Track(TrackEvent::Started {
            track_id: track_id.to_string(),
            title: Some("Test Song".to_string()),
            container: "wav".to_string(),
            codec: "pcm".to_string(),
            duration_ms: Some(1_000),
        })
    }

    fn failed(track_id: &str) -> CoreEvent {
        CoreEvent::Track(TrackEvent::Failed {
            track_id: track_id.to_string(),
            kind: FailureKind::TransientTransport,
            message: "read retries exhausted".to_string(),
            causes: vec!["connection reset".to_string()],
            retryable: true,
        })
    }

    #[tokio::test]
    async fn test_event_bus_creation() {
        let bus = EventBus::new(10);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_event_bus_subscription() {
        let bus = EventBus::new(10);
        let _sub1 = bus.subscribe();
        let _sub2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_event_emission_no_subscribers() {
        let bus = EventBus::new(10);
        assert!(bus.emit(started("t-1")).is_err());
    }

    #[tokio::test]
    async fn test_event_emission_with_subscribers() {
        let bus = EventBus::new(10);
        let mut sub = bus.subscribe();

        let event = started("t-1");
        let result = bus.emit(event.clone());
        assert_eq!(result.unwrap(), 1);

        let received = sub.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_receive_same_event() {
        let bus = EventBus::new(10);
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();

        let event = failed("t-2");
        bus.emit(event.clone()).ok();

        assert_eq!(sub1.recv().await.unwrap(), event);
        assert_eq!(sub2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_event_stream_with_filter() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe())
            .filter(|event| event.severity() == EventSeverity::Error);

        bus.emit(started("t-1")).ok();
        let failure = failed("t-1");
        bus.emit(failure.clone()).ok();

        assert_eq!(stream.recv().await.unwrap(), failure);
    }

    #[tokio::test]
    async fn test_lagged_subscriber() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();

        for i in 0..5 {
            bus.emit(CoreEvent::Track(TrackEvent::Paused {
                track_id: "t-1".to_string(),
                position_ms: i,
            }))
            .ok();
        }

        let result = sub.recv().await;
        assert!(matches!(result, Err(RecvError::Lagged(_))));
    }

    #[test]
    fn test_event_severity() {
        assert_eq!(failed("t").severity(), EventSeverity::Error);
        assert_eq!(started("t").severity(), EventSeverity::Info);

        let retry = CoreEvent::Stream(StreamEvent::RetryScheduled {
            track_id: None,
            attempt: 1,
            max_attempts: 3,
            delay_ms: 250,
            reason: "timeout".to_string(),
        });
        assert_eq!(retry.severity(), EventSeverity::Warning);
        assert_eq!(retry.track_id(), None);

        let seeked = CoreEvent::Track(TrackEvent::Seeked {
            track_id: "t".to_string(),
            requested_ms: 1000,
            landed_ms: 1020,
        });
        assert_eq!(seeked.severity(), EventSeverity::Debug);
    }

    #[test]
    fn test_event_description() {
        assert_eq!(started("t").description(), "Track started");
        assert_eq!(failed("t").description(), "Track failed");
    }

    #[tokio::test]
    async fn test_concurrent_publishers() {
        let bus = EventBus::new(100);
        let mut sub = bus.subscribe();

        let bus1 = bus.clone();
        let bus2 = bus.clone();

        let handle1 = std::thread::spawn(move || {
            for i in 0..10 {
                bus1.emit(started(&format!("a-{i}"))).ok();
            }
        });
        let handle2 = std::thread::spawn(move || {
            for i in 0..10 {
                bus2.emit(failed(&format!("b-{i}"))).ok();
            }
        });

        handle1.join().unwrap();
        handle2.join().unwrap();

        let mut count = 0;
        while sub.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 20);
    }

    #[test]
    fn test_event_serialization() {
        let event = failed("t-9");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"Track\""));
        assert!(json.contains("\"kind\":\"transient_transport\""));

        let deserialized: CoreEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, event);
    }

    #[test]
    fn test_stream_drain() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe());
        assert!(stream.try_recv().is_none());

        bus.emit(started("t-1")).ok();
        bus.emit(failed("t-1")).ok();

        let events = stream.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].track_id(), Some("t-1"));
    }
}
