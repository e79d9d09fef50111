//! # Track Handle
//!
//! The playback consumer's view of one loaded track. The handle pulls
//! frames out of the [`FrameBuffer`] and posts commands to the track's
//! executor; it never touches the stream, demuxer or decoder.
//!
//! Dropping the handle cancels the track and lets its worker exit.

use crate::buffer::{BufferStats, FrameBuffer};
use crate::config::TrackStats;
use crate::error::{PlaybackError, Result};
use crate::types::{Frame, TrackMetadata, TrackState};
use core_async::CancellationToken;
use core_runtime::events::{CoreEvent, EventBus, FailureKind, TrackEvent};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Control commands accepted by a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Play,
    Pause,
    Seek(Duration),
    Stop,
}

/// Outcome of [`TrackHandle::poll_frame`].
#[derive(Debug, Clone, PartialEq)]
pub enum PollResult {
    Frame(Frame),
    /// Nothing buffered yet, or the track is paused or seeking.
    NoFrameYet,
    /// No further frames will arrive.
    TrackEnded,
}

/// Why a track failed, as reported to the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Error sources, outermost first.
    pub causes: Vec<String>,
    /// Whether reloading or trying another source may succeed.
    pub retryable: bool,
}

impl TrackFailure {
    pub fn from_error(err: &PlaybackError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            causes: crate::error::error_causes(err),
            retryable: err.is_retryable_by_caller(),
        }
    }
}

pub(crate) struct Status {
    pub state: TrackState,
    /// Consumer-requested pause; survives seeks.
    pub paused: bool,
}

/// Pending executor work. Seeks collapse to the newest target.
pub(crate) struct Mailbox {
    pub stop: bool,
    pub seek: Option<Duration>,
    /// Token for the executor's current unit of work; cancelled by a new
    /// seek or a stop so blocking reads and pushes return promptly.
    pub interrupt: CancellationToken,
}

/// State shared by a [`TrackHandle`] and its executor.
pub(crate) struct TrackShared {
    pub id: String,
    pub identifier: String,
    pub cancel: CancellationToken,
    pub events: EventBus,
    pub status: Mutex<Status>,
    pub status_changed: Condvar,
    pub mailbox: Mutex<Mailbox>,
    pub position: Mutex<Duration>,
    pub metadata: RwLock<TrackMetadata>,
    pub failure: Mutex<Option<TrackFailure>>,
    pub stats: Mutex<TrackStats>,
    /// Known once the demuxer is open.
    pub seekable: Mutex<Option<bool>>,
}

impl TrackShared {
    pub fn new(id: String, identifier: String, events: EventBus, cancel: CancellationToken) -> Self {
        let interrupt = cancel.child_token();
        Self {
            metadata: RwLock::new(TrackMetadata::new(identifier.clone())),
            id,
            identifier,
            cancel,
            events,
            status: Mutex::new(Status {
                state: TrackState::Initializing,
                paused: false,
            }),
            status_changed: Condvar::new(),
            mailbox: Mutex::new(Mailbox {
                stop: false,
                seek: None,
                interrupt,
            }),
            position: Mutex::new(Duration::ZERO),
            failure: Mutex::new(None),
            stats: Mutex::new(TrackStats::default()),
            seekable: Mutex::new(None),
        }
    }

    pub fn state(&self) -> TrackState {
        self.status.lock().state
    }

    pub fn set_state(&self, state: TrackState) {
        let mut status = self.status.lock();
        if status.state != state {
            debug!(track_id = %self.id, from = ?status.state, to = ?state, "Track state change");
            status.state = state;
            self.status_changed.notify_all();
        }
    }

    /// Leaves `Initializing`/`Seeking` for `Playing` or `Paused`, whichever
    /// the consumer last asked for.
    pub fn resume_state(&self) -> TrackState {
        let mut status = self.status.lock();
        let state = if status.paused {
            TrackState::Paused
        } else {
            TrackState::Playing
        };
        if !status.state.is_terminal() && status.state != state {
            status.state = state;
            self.status_changed.notify_all();
        }
        status.state
    }

    pub fn emit(&self, event: TrackEvent) {
        let _ = self.events.emit(CoreEvent::Track(event));
    }

    pub fn position_ms(&self) -> u64 {
        self.position.lock().as_millis() as u64
    }

    /// Fresh interrupt token for the next unit of work.
    pub fn renew_interrupt(&self) -> CancellationToken {
        let mut mailbox = self.mailbox.lock();
        if mailbox.interrupt.is_cancelled() {
            mailbox.interrupt = self.cancel.child_token();
        }
        mailbox.interrupt.clone()
    }

    /// Takes the pending stop or seek, stop first.
    pub fn take_command(&self) -> Option<Command> {
        let mut mailbox = self.mailbox.lock();
        if mailbox.stop || self.cancel.is_cancelled() {
            mailbox.stop = false;
            mailbox.seek = None;
            return Some(Command::Stop);
        }
        mailbox.seek.take().map(Command::Seek)
    }

    /// Parks the producer for up to `slice` while the consumer has paused.
    ///
    /// Returns `false` without waiting when playing, terminal, or a stop or
    /// seek is pending.
    pub fn wait_while_paused(&self, slice: Duration) -> bool {
        let mut status = self.status.lock();
        if !status.paused || status.state.is_terminal() || self.has_pending() {
            return false;
        }
        self.status_changed.wait_for(&mut status, slice);
        true
    }

    pub fn has_pending(&self) -> bool {
        let mailbox = self.mailbox.lock();
        mailbox.stop || mailbox.seek.is_some() || self.cancel.is_cancelled()
    }
}

/// Consumer-side handle for one loaded track.
pub struct TrackHandle {
    shared: Arc<TrackShared>,
    buffer: FrameBuffer,
}

impl TrackHandle {
    pub(crate) fn new(shared: Arc<TrackShared>, buffer: FrameBuffer) -> Self {
        Self { shared, buffer }
    }

    /// Engine-assigned track id, used in events.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Identifier the track was loaded from.
    pub fn identifier(&self) -> &str {
        &self.shared.identifier
    }

    /// Next frame, waiting up to `timeout`.
    pub fn poll_frame(&self, timeout: Duration) -> PollResult {
        let state = {
            let status = self.shared.status.lock();
            if status.paused && !status.state.is_terminal() {
                return PollResult::NoFrameYet;
            }
            status.state
        };
        match state {
            TrackState::Failed => return PollResult::TrackEnded,
            TrackState::Seeking | TrackState::Initializing => {
                // Nothing valid is buffered until the executor is ready.
                std::thread::sleep(timeout.min(Duration::from_millis(10)));
                return PollResult::NoFrameYet;
            }
            _ => {}
        }

        match self.buffer.pop(timeout) {
            Some(frame) => {
                *self.shared.position.lock() = frame.timestamp;
                PollResult::Frame(frame)
            }
            None if self.buffer.is_drained() => PollResult::TrackEnded,
            None if self.shared.state().is_terminal() => PollResult::TrackEnded,
            None => PollResult::NoFrameYet,
        }
    }

    /// Posts a command to the track.
    ///
    /// Commands on a finished or failed track are rejected with
    /// `InvalidCommand`; seeks on a non-seekable track with
    /// `SeekNotSupported`.
    pub fn submit_command(&self, command: Command) -> Result<()> {
        let shared = &self.shared;
        let mut status = shared.status.lock();
        if status.state.is_terminal() {
            return Err(PlaybackError::InvalidCommand(format!(
                "{:?} on a {:?} track",
                command, status.state
            )));
        }

        match command {
            Command::Play | Command::Pause => {
                let pause = command == Command::Pause;
                if status.paused == pause {
                    return Ok(());
                }
                status.paused = pause;
                if matches!(status.state, TrackState::Playing | TrackState::Paused) {
                    status.state = if pause {
                        TrackState::Paused
                    } else {
                        TrackState::Playing
                    };
                    shared.status_changed.notify_all();
                    drop(status);
                    let position_ms = shared.position_ms();
                    let track_id = shared.id.clone();
                    shared.emit(if pause {
                        TrackEvent::Paused {
                            track_id,
                            position_ms,
                        }
                    } else {
                        TrackEvent::Resumed {
                            track_id,
                            position_ms,
                        }
                    });
                }
                Ok(())
            }
            Command::Seek(target) => {
                drop(status);
                if *shared.seekable.lock() == Some(false) {
                    return Err(PlaybackError::SeekNotSupported);
                }
                let mut mailbox = shared.mailbox.lock();
                mailbox.seek = Some(target);
                mailbox.interrupt.cancel();
                drop(mailbox);
                shared.status_changed.notify_all();
                debug!(track_id = %shared.id, target_ms = target.as_millis() as u64, "Seek queued");
                Ok(())
            }
            Command::Stop => {
                drop(status);
                let mut mailbox = shared.mailbox.lock();
                mailbox.stop = true;
                mailbox.interrupt.cancel();
                drop(mailbox);
                shared.status_changed.notify_all();
                Ok(())
            }
        }
    }

    pub fn current_state(&self) -> TrackState {
        self.shared.state()
    }

    /// Timestamp of the last frame handed to the consumer, or the landed
    /// position of the last seek.
    pub fn current_position(&self) -> Duration {
        *self.shared.position.lock()
    }

    pub fn metadata(&self) -> TrackMetadata {
        self.shared.metadata.read().clone()
    }

    pub fn failure(&self) -> Option<TrackFailure> {
        self.shared.failure.lock().clone()
    }

    pub fn stats(&self) -> TrackStats {
        self.shared.stats.lock().clone()
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    /// Blocks until `predicate` holds for the state or `timeout` passes.
    /// Returns the last observed state.
    pub fn wait_for_state<F>(&self, predicate: F, timeout: Duration) -> TrackState
    where
        F: Fn(TrackState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut status = self.shared.status.lock();
        while !predicate(status.state) {
            if self
                .shared
                .status_changed
                .wait_until(&mut status, deadline)
                .timed_out()
            {
                break;
            }
        }
        status.state
    }
}

impl Drop for TrackHandle {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl std::fmt::Debug for TrackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackHandle")
            .field("id", &self.shared.id)
            .field("identifier", &self.shared.identifier)
            .field("state", &self.current_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> TrackHandle {
        let shared = Arc::new(TrackShared::new(
            "track-1".into(),
            "memory://x".into(),
            EventBus::new(16),
            CancellationToken::new(),
        ));
        TrackHandle::new(
            shared,
            FrameBuffer::new(Duration::from_secs(1), Duration::from_millis(5)),
        )
    }

    #[test]
    fn test_commands_rejected_on_terminal_track() {
        let handle = handle();
        handle.shared.set_state(TrackState::Finished);
        assert!(matches!(
            handle.submit_command(Command::Play),
            Err(PlaybackError::InvalidCommand(_))
        ));
        assert!(matches!(
            handle.submit_command(Command::Seek(Duration::ZERO)),
            Err(PlaybackError::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_seek_rejected_when_not_seekable() {
        let handle = handle();
        handle.shared.set_state(TrackState::Playing);
        *handle.shared.seekable.lock() = Some(false);
        assert!(matches!(
            handle.submit_command(Command::Seek(Duration::from_secs(1))),
            Err(PlaybackError::SeekNotSupported)
        ));
    }

    #[test]
    fn test_seeks_collapse_to_latest() {
        let handle = handle();
        handle.shared.set_state(TrackState::Playing);
        let first = handle.shared.renew_interrupt();
        handle.submit_command(Command::Seek(Duration::from_secs(1))).unwrap();
        handle.submit_command(Command::Seek(Duration::from_secs(5))).unwrap();
        assert!(first.is_cancelled());
        assert_eq!(
            handle.shared.take_command(),
            Some(Command::Seek(Duration::from_secs(5)))
        );
        assert_eq!(handle.shared.take_command(), None);
        assert!(!handle.shared.renew_interrupt().is_cancelled());
    }

    #[test]
    fn test_stop_wins_over_seek() {
        let handle = handle();
        handle.submit_command(Command::Seek(Duration::from_secs(1))).unwrap();
        handle.submit_command(Command::Stop).unwrap();
        assert_eq!(handle.shared.take_command(), Some(Command::Stop));
        assert_eq!(handle.shared.take_command(), None);
    }

    #[test]
    fn test_pause_halts_consumer() {
        let handle = handle();
        handle.shared.set_state(TrackState::Playing);
        handle
            .buffer
            .push(
                Frame {
                    timestamp: Duration::ZERO,
                    sample_rate: 8_000,
                    channels: 1,
                    samples: vec![0.0f32; 80].into(),
                },
                &CancellationToken::new(),
            )
            .unwrap();

        handle.submit_command(Command::Pause).unwrap();
        assert_eq!(handle.current_state(), TrackState::Paused);
        assert_eq!(handle.poll_frame(Duration::ZERO), PollResult::NoFrameYet);

        handle.submit_command(Command::Play).unwrap();
        assert_eq!(handle.current_state(), TrackState::Playing);
        assert!(matches!(
            handle.poll_frame(Duration::ZERO),
            PollResult::Frame(_)
        ));
    }

    #[test]
    fn test_pause_while_seeking_applies_after() {
        let handle = handle();
        handle.shared.set_state(TrackState::Seeking);
        handle.submit_command(Command::Pause).unwrap();
        assert_eq!(handle.current_state(), TrackState::Seeking);
        assert_eq!(handle.shared.resume_state(), TrackState::Paused);
    }

    #[test]
    fn test_drop_cancels_track() {
        let handle = handle();
        let token = handle.shared.cancel.clone();
        drop(handle);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_command_serde() {
        let json = serde_json::to_string(&Command::Seek(Duration::from_secs(2))).unwrap();
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Command::Seek(Duration::from_secs(2)));
    }
}
