//! # Frame Buffer
//!
//! Bounded queue of decoded [`Frame`]s between the track executor (producer)
//! and the playback consumer.
//!
//! ## Design
//!
//! - **Capacity**: measured in audio time, not bytes or frame count. A single
//!   frame longer than the whole capacity is admitted into an empty buffer.
//! - **Backpressure**: `push` blocks while full, in bounded slices, checking
//!   its cancellation token between slices.
//! - **Generations**: `clear` bumps a generation counter; a push that was
//!   waiting across a clear returns [`PushError::Interrupted`] instead of
//!   inserting a stale frame.
//! - **Ordering**: timestamps pushed within one generation never decrease.

use crate::types::Frame;
use core_async::CancellationToken;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a push did not insert its frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    /// Cancelled, or the buffer was cleared while waiting.
    #[error("push interrupted")]
    Interrupted,
    /// Production already ended for this generation.
    #[error("buffer closed")]
    Closed,
    /// The frame starts before the previously pushed one.
    #[error("frame at {got:?} pushed after frame at {last:?}")]
    OutOfOrder { last: Duration, got: Duration },
}

/// Snapshot of the buffer fill.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferStats {
    pub buffered: Duration,
    pub frames: usize,
    pub capacity: Duration,
    /// `buffered / capacity`, may exceed 1.0 for a single oversized frame.
    pub fill_level: f32,
    pub generation: u64,
}

struct State {
    frames: VecDeque<Frame>,
    buffered: Duration,
    generation: u64,
    last_timestamp: Option<Duration>,
    closed: bool,
}

struct Shared {
    state: Mutex<State>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: Duration,
    wait_slice: Duration,
}

#[derive(Clone)]
pub struct FrameBuffer {
    inner: Arc<Shared>,
}

impl FrameBuffer {
    /// Buffer holding up to `capacity` of audio. Blocking waits re-check
    /// their token every `wait_slice`.
    pub fn new(capacity: Duration, wait_slice: Duration) -> Self {
        Self {
            inner: Arc::new(Shared {
                state: Mutex::new(State {
                    frames: VecDeque::new(),
                    buffered: Duration::ZERO,
                    generation: 0,
                    last_timestamp: None,
                    closed: false,
                }),
                not_full: Condvar::new(),
                not_empty: Condvar::new(),
                capacity,
                wait_slice: wait_slice.max(Duration::from_millis(1)),
            }),
        }
    }

    pub fn capacity(&self) -> Duration {
        self.inner.capacity
    }

    /// Inserts `frame`, blocking while the buffer is full.
    pub fn push(&self, frame: Frame, token: &CancellationToken) -> Result<(), PushError> {
        let length = frame.duration();
        let mut state = self.inner.state.lock();
        let generation = state.generation;

        loop {
            if token.is_cancelled() || state.generation != generation {
                return Err(PushError::Interrupted);
            }
            if state.closed {
                return Err(PushError::Closed);
            }
            if state.frames.is_empty() || state.buffered + length <= self.inner.capacity {
                break;
            }
            self.inner
                .not_full
                .wait_for(&mut state, self.inner.wait_slice);
        }

        if let Some(last) = state.last_timestamp {
            if frame.timestamp < last {
                return Err(PushError::OutOfOrder {
                    last,
                    got: frame.timestamp,
                });
            }
        }

        state.last_timestamp = Some(frame.timestamp);
        state.buffered += length;
        state.frames.push_back(frame);
        self.inner.not_empty.notify_one();
        Ok(())
    }

    /// Takes the oldest frame, waiting up to `timeout` for one to arrive.
    pub fn pop(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(frame) = state.frames.pop_front() {
                state.buffered = state.buffered.saturating_sub(frame.duration());
                self.inner.not_full.notify_all();
                return Some(frame);
            }
            if state.closed {
                return None;
            }
            if self
                .inner
                .not_empty
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.frames.pop_front().map(|frame| {
                    state.buffered = state.buffered.saturating_sub(frame.duration());
                    self.inner.not_full.notify_all();
                    frame
                });
            }
        }
    }

    /// Drops every buffered frame and starts a new generation.
    ///
    /// Also reopens a closed buffer and forgets the last pushed timestamp.
    pub fn clear(&self) -> u64 {
        let mut state = self.inner.state.lock();
        state.frames.clear();
        state.buffered = Duration::ZERO;
        state.generation += 1;
        state.last_timestamp = None;
        state.closed = false;
        self.inner.not_full.notify_all();
        self.inner.not_empty.notify_all();
        state.generation
    }

    /// Marks the end of production; consumers drain what is left.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        self.inner.not_empty.notify_all();
        self.inner.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Closed and empty.
    pub fn is_drained(&self) -> bool {
        let state = self.inner.state.lock();
        state.closed && state.frames.is_empty()
    }

    /// Waits up to `timeout` for the buffer to become drained.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if state.closed && state.frames.is_empty() {
                return true;
            }
            if self
                .inner
                .not_full
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.closed && state.frames.is_empty();
            }
        }
    }

    pub fn stats(&self) -> BufferStats {
        let state = self.inner.state.lock();
        let capacity = self.inner.capacity;
        BufferStats {
            buffered: state.buffered,
            frames: state.frames.len(),
            capacity,
            fill_level: if capacity.is_zero() {
                0.0
            } else {
                state.buffered.as_secs_f32() / capacity.as_secs_f32()
            },
            generation: state.generation,
        }
    }

    /// Timestamp of the frame the consumer will see next.
    pub fn front_timestamp(&self) -> Option<Duration> {
        self.inner.state.lock().frames.front().map(|f| f.timestamp)
    }
}
