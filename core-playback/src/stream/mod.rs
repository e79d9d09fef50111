//! # Seekable Stream
//!
//! [`ByteSource`] is the raw transport (file, memory, HTTP). [`StreamHandle`]
//! wraps one and adds what every demuxer relies on:
//!
//! - a read-ahead buffer so small header reads do not hit the transport
//! - a rewind window so the prober can inspect a non-seekable stream and hand
//!   it back at offset zero
//! - bounded retries with exponential backoff for transient failures,
//!   resuming at the exact byte offset
//! - cooperative cancellation checked before every transport read
//!
//! Buffered bytes are addressed by absolute stream offset, so seeks that land
//! inside the buffer never touch the transport and also work on
//! non-seekable sources.

mod file;
mod http;
mod memory;

pub use file::FileSource;
pub use http::HttpSource;
pub use memory::MemorySource;

use crate::error::{PlaybackError, Result};
use bridge_traits::http::RetryPolicy;
use core_async::sync::CancellationToken;
use core_async::time::sleep_cancellable;
use core_runtime::events::{CoreEvent, EventBus, StreamEvent};
use std::fmt;
use tracing::{debug, warn};

/// Default read-ahead buffer size.
pub const DEFAULT_READ_AHEAD: usize = 64 * 1024;

/// Raw byte transport.
///
/// Implementations report transient failures as
/// [`PlaybackError::Transport`] with `exhausted: false` or
/// [`PlaybackError::Timeout`]; retrying is the [`StreamHandle`]'s job.
pub trait ByteSource: Send {
    /// Reads up to `buf.len()` bytes. `Ok(0)` means end of stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Moves to the absolute byte `position`.
    fn seek(&mut self, position: u64) -> Result<u64>;

    fn is_seekable(&self) -> bool;

    /// Total length in bytes, when known.
    fn length(&self) -> Option<u64>;

    fn position(&self) -> u64;

    /// Re-establishes the transport so the next read starts at `position`.
    ///
    /// Called between retry attempts.
    fn reconnect(&mut self, position: u64) -> Result<()> {
        if self.position() != position {
            self.seek(position)?;
        }
        Ok(())
    }
}

/// Buffered, retrying, cancellable view over a [`ByteSource`].
pub struct StreamHandle {
    source: Box<dyn ByteSource>,
    /// Bytes fetched from the source; `buf[0]` sits at `buf_start`.
    buf: Vec<u8>,
    buf_start: u64,
    buf_pos: usize,
    read_ahead: usize,
    /// While set, consumed bytes stay buffered so `rewind` can replay them.
    retain_limit: Option<usize>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    events: Option<EventBus>,
    track_id: Option<String>,
}

impl StreamHandle {
    pub fn new(source: Box<dyn ByteSource>) -> Self {
        let buf_start = source.position();
        Self {
            source,
            buf: Vec::new(),
            buf_start,
            buf_pos: 0,
            read_ahead: DEFAULT_READ_AHEAD,
            retain_limit: None,
            retry: RetryPolicy::none(),
            cancel: CancellationToken::new(),
            events: None,
            track_id: None,
        }
    }

    pub fn with_read_ahead(mut self, bytes: usize) -> Self {
        self.read_ahead = bytes.max(1);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Publishes `StreamEvent::RetryScheduled` for every scheduled retry.
    pub fn with_events(mut self, events: EventBus, track_id: impl Into<String>) -> Self {
        self.events = Some(events);
        self.track_id = Some(track_id.into());
        self
    }

    pub fn set_cancel_token(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    // ========================================================================
    // Position & Length
    // ========================================================================

    /// Logical read position.
    pub fn position(&self) -> u64 {
        self.buf_start + self.buf_pos as u64
    }

    pub fn length(&self) -> Option<u64> {
        self.source.length()
    }

    /// Bytes left before the end, when the length is known.
    pub fn remaining(&self) -> Option<u64> {
        self.length().map(|len| len.saturating_sub(self.position()))
    }

    pub fn is_seekable(&self) -> bool {
        self.source.is_seekable()
    }

    // ========================================================================
    // Probe Window
    // ========================================================================

    /// Starts retaining consumed bytes (up to `limit`) so that
    /// [`rewind`](Self::rewind) works on non-seekable sources.
    pub fn begin_lookahead(&mut self, limit: usize) {
        if self.buf_pos > 0 {
            self.compact();
        }
        self.retain_limit = Some(limit);
    }

    /// Returns to offset zero, from the retained window when possible.
    pub fn rewind(&mut self) -> Result<()> {
        self.seek(0).map(|_| ())
    }

    /// Stops retaining bytes; the look-ahead window is released as it is
    /// consumed.
    pub fn commit(&mut self) {
        self.retain_limit = None;
    }

    /// Returns up to `len` bytes from the current position without
    /// consuming them.
    pub fn peek(&mut self, len: usize) -> Result<&[u8]> {
        while self.buf.len() - self.buf_pos < len {
            if self.fill()? == 0 {
                break;
            }
        }
        let end = (self.buf_pos + len).min(self.buf.len());
        Ok(&self.buf[self.buf_pos..end])
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Reads up to `out.len()` bytes; `Ok(0)` means end of stream.
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.buf_pos >= self.buf.len() && self.fill()? == 0 {
            return Ok(0);
        }
        let available = &self.buf[self.buf_pos..];
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.buf_pos += n;
        Ok(n)
    }

    /// Reads until `out` is full or the stream ends; returns the byte count.
    pub fn read_full(&mut self, out: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < out.len() {
            let n = self.read(&mut out[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Reads exactly `out.len()` bytes; a short stream is malformed data.
    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        let n = self.read_full(out)?;
        if n < out.len() {
            return Err(PlaybackError::malformed(format!(
                "unexpected end of stream at byte {} (wanted {} more)",
                self.position(),
                out.len() - n
            )));
        }
        Ok(())
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        self.read_exact(&mut out)?;
        Ok(out)
    }

    /// Reads `len` bytes into a new vector after checking `len` against
    /// `limit` and the remaining stream length.
    pub fn read_vec(&mut self, len: u64, limit: u64) -> Result<Vec<u8>> {
        self.check_size(len, limit)?;
        let mut out = vec![0u8; len as usize];
        self.read_exact(&mut out)?;
        Ok(out)
    }

    /// Validates a size field before anything is allocated for it.
    pub fn check_size(&self, len: u64, limit: u64) -> Result<()> {
        if let Some(remaining) = self.remaining() {
            if len > remaining {
                return Err(PlaybackError::malformed(format!(
                    "size field {} exceeds remaining stream length {}",
                    len, remaining
                )));
            }
        }
        if len > limit {
            return Err(PlaybackError::AllocationLimit {
                requested: len,
                limit,
            });
        }
        Ok(())
    }

    /// Advances `len` bytes, reading through them when the source cannot seek.
    ///
    /// Returns the number of bytes actually skipped (short at end of stream).
    pub fn skip(&mut self, len: u64) -> Result<u64> {
        let buffered = (self.buf.len() - self.buf_pos) as u64;
        if len <= buffered {
            self.buf_pos += len as usize;
            return Ok(len);
        }
        if self.is_seekable() && self.retain_limit.is_none() {
            let target = self.position() + len;
            let target = match self.length() {
                Some(total) => target.min(total),
                None => target,
            };
            let start = self.position();
            self.seek(target)?;
            return Ok(target - start);
        }
        let mut skipped = 0u64;
        let mut scratch = vec![0u8; self.read_ahead.min(len as usize).max(1)];
        while skipped < len {
            let want = ((len - skipped) as usize).min(scratch.len());
            let n = self.read(&mut scratch[..want])?;
            if n == 0 {
                break;
            }
            skipped += n as u64;
        }
        Ok(skipped)
    }

    /// Moves to the absolute byte `position`.
    ///
    /// Targets inside the buffer are served without touching the source.
    /// Anything else requires a seekable source, except forward targets,
    /// which are reached by reading through.
    pub fn seek(&mut self, position: u64) -> Result<u64> {
        let buf_end = self.buf_start + self.buf.len() as u64;
        if position >= self.buf_start && position <= buf_end {
            self.buf_pos = (position - self.buf_start) as usize;
            return Ok(position);
        }
        if !self.source.is_seekable() {
            let current = self.position();
            if position > current {
                let skipped = self.skip(position - current)?;
                return Ok(current + skipped);
            }
            return Err(PlaybackError::SeekNotSupported);
        }
        if self.cancel.is_cancelled() {
            return Err(PlaybackError::Cancelled);
        }
        let landed = self.retrying(position, |source| source.seek(position))?;
        debug!(target_offset = position, landed, "Stream seek");
        self.buf.clear();
        self.buf_pos = 0;
        self.buf_start = landed;
        self.retain_limit = None;
        Ok(landed)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Drops consumed bytes from the front of the buffer.
    fn compact(&mut self) {
        self.buf.drain(..self.buf_pos);
        self.buf_start += self.buf_pos as u64;
        self.buf_pos = 0;
    }

    /// Appends one transport read to the buffer; returns the byte count.
    fn fill(&mut self) -> Result<usize> {
        match self.retain_limit {
            Some(limit) if self.buf.len() >= limit => {
                debug!(limit, "Look-ahead window full, releasing it");
                self.retain_limit = None;
                if self.buf_pos >= self.buf.len() {
                    self.compact();
                }
            }
            Some(_) => {}
            None => {
                if self.buf_pos > 0 {
                    self.compact();
                }
            }
        }

        let old_len = self.buf.len();
        self.buf.resize(old_len + self.read_ahead, 0);
        let resume_at = self.buf_start + old_len as u64;
        let result = {
            let (source, buf) = (&mut self.source, &mut self.buf[old_len..]);
            Self::retry_loop(
                &self.retry,
                &self.cancel,
                self.events.as_ref(),
                self.track_id.as_deref(),
                source.as_mut(),
                resume_at,
                |source| source.read(&mut buf[..]),
            )
        };
        match result {
            Ok(n) => {
                self.buf.truncate(old_len + n);
                Ok(n)
            }
            Err(err) => {
                self.buf.truncate(old_len);
                Err(err)
            }
        }
    }

    fn retrying<T>(
        &mut self,
        resume_at: u64,
        op: impl FnMut(&mut dyn ByteSource) -> Result<T>,
    ) -> Result<T> {
        Self::retry_loop(
            &self.retry,
            &self.cancel,
            self.events.as_ref(),
            self.track_id.as_deref(),
            self.source.as_mut(),
            resume_at,
            op,
        )
    }

    fn retry_loop<T>(
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        events: Option<&EventBus>,
        track_id: Option<&str>,
        source: &mut dyn ByteSource,
        resume_at: u64,
        mut op: impl FnMut(&mut dyn ByteSource) -> Result<T>,
    ) -> Result<T> {
        let mut failures = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(PlaybackError::Cancelled);
            }
            let err = match op(&mut *source) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => err,
                Err(err) => return Err(err),
            };

            failures += 1;
            if !policy.allows_retry(failures) {
                warn!(
                    attempts = failures,
                    offset = resume_at,
                    error = %err,
                    "Transient read failures exhausted the retry budget"
                );
                return Err(err.into_exhausted());
            }

            let delay = policy.delay_for_attempt(failures);
            warn!(
                attempt = failures,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                offset = resume_at,
                error = %err,
                "Transient read failure, retrying"
            );
            if let Some(bus) = events {
                let _ = bus.emit(CoreEvent::Stream(StreamEvent::RetryScheduled {
                    track_id: track_id.map(str::to_string),
                    attempt: failures,
                    max_attempts: policy.max_attempts,
                    delay_ms: delay.as_millis() as u64,
                    reason: err.to_string(),
                }));
            }
            if !sleep_cancellable(delay, cancel) {
                return Err(PlaybackError::Cancelled);
            }
            if let Err(err) = source.reconnect(resume_at) {
                if !err.is_transient() {
                    return Err(err);
                }
                debug!(error = %err, "Reconnect failed, counting as a failed attempt");
            }
        }
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("position", &self.position())
            .field("length", &self.length())
            .field("seekable", &self.is_seekable())
            .field("buffered", &(self.buf.len() - self.buf_pos))
            .finish_non_exhaustive()
    }
}
