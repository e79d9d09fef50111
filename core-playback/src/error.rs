//! # Playback Error Types
//!
//! Every failure in the pipeline is a [`PlaybackError`]. Each variant maps to
//! exactly one [`FailureKind`], which is what consumers and the event bus see.

use bridge_traits::error::BridgeError;
use core_runtime::events::FailureKind;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while opening, demuxing or decoding a track.
#[derive(Error, Debug)]
pub enum PlaybackError {
    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Reading from the byte source failed.
    ///
    /// `exhausted` is set once the retry budget has been spent; the error is
    /// then fatal for the track.
    #[error("Transport error: {message}")]
    Transport { message: String, exhausted: bool },

    /// A single read exceeded the configured read timeout.
    #[error("Read timed out after {0:?}")]
    Timeout(Duration),

    // ========================================================================
    // Format/Codec Errors
    // ========================================================================
    /// No registered container matched the stream.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The container holds a codec with no registered decoder.
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// Structurally invalid data.
    ///
    /// When `recoverable` is set the demuxer or decoder has already skipped
    /// past the damaged region and the next call continues with valid data.
    #[error("Malformed data: {message}")]
    MalformedData { message: String, recoverable: bool },

    /// Sample rate or channel count changed after decoding started.
    #[error("Stream parameters changed: {0}")]
    ParameterChange(String),

    /// A size field asked for more memory than the configured limit.
    #[error("Allocation of {requested} bytes exceeds limit of {limit} bytes")]
    AllocationLimit { requested: u64, limit: u64 },

    // ========================================================================
    // Playback Control Errors
    // ========================================================================
    /// Seeking is not supported for this stream or container.
    #[error("Seeking not supported")]
    SeekNotSupported,

    /// Command rejected in the track's current state.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Operation attempted in an impossible state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    // ========================================================================
    // Generic Errors
    // ========================================================================
    /// I/O error from a local source.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The track source could not resolve or open the identifier.
    #[error("Source error: {0}")]
    Source(String),

    /// The operation observed a cancellation request.
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal error (should not occur in normal operation).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PlaybackError {
    /// Fatal malformed data.
    pub fn malformed(message: impl Into<String>) -> Self {
        PlaybackError::MalformedData {
            message: message.into(),
            recoverable: false,
        }
    }

    /// Malformed data the caller may skip.
    pub fn recoverable(message: impl Into<String>) -> Self {
        PlaybackError::MalformedData {
            message: message.into(),
            recoverable: true,
        }
    }

    /// Failure category reported to consumers.
    pub fn kind(&self) -> FailureKind {
        match self {
            PlaybackError::Transport { .. } | PlaybackError::Timeout(_) => {
                FailureKind::TransientTransport
            }
            PlaybackError::UnsupportedFormat(_) | PlaybackError::UnsupportedCodec(_) => {
                FailureKind::UnsupportedFormat
            }
            PlaybackError::MalformedData { .. }
            | PlaybackError::ParameterChange(_)
            | PlaybackError::AllocationLimit { .. } => FailureKind::MalformedData,
            PlaybackError::SeekNotSupported
            | PlaybackError::InvalidCommand(_)
            | PlaybackError::InvalidState(_) => FailureKind::Precondition,
            PlaybackError::Io(_)
            | PlaybackError::Source(_)
            | PlaybackError::Cancelled
            | PlaybackError::Internal(_) => FailureKind::Internal,
        }
    }

    /// Returns `true` if retrying the same read may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PlaybackError::Transport {
                exhausted: false,
                ..
            } | PlaybackError::Timeout(_)
        )
    }

    /// Returns `true` if the pipeline can continue past this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PlaybackError::MalformedData {
                recoverable: true,
                ..
            }
        )
    }

    /// Returns `true` if this error must terminate the track.
    pub fn is_fatal(&self) -> bool {
        !(self.is_transient() || self.is_recoverable() || matches!(self, PlaybackError::Cancelled))
    }

    /// Returns `true` if the caller may succeed by reloading or trying
    /// another source for the same track.
    pub fn is_retryable_by_caller(&self) -> bool {
        matches!(
            self,
            PlaybackError::Transport { .. } | PlaybackError::Timeout(_) | PlaybackError::Source(_)
        )
    }

    /// Returns `true` if this error is related to audio format/codec issues.
    pub fn is_format_error(&self) -> bool {
        matches!(
            self.kind(),
            FailureKind::UnsupportedFormat | FailureKind::MalformedData
        )
    }

    /// Marks a transient transport error as final after retries ran out.
    pub fn into_exhausted(self) -> Self {
        match self {
            PlaybackError::Transport { message, .. } => PlaybackError::Transport {
                message,
                exhausted: true,
            },
            PlaybackError::Timeout(after) => PlaybackError::Transport {
                message: format!("read timed out after {:?}", after),
                exhausted: true,
            },
            other => other,
        }
    }
}

impl From<BridgeError> for PlaybackError {
    fn from(err: BridgeError) -> Self {
        if err.is_transient() {
            return PlaybackError::Transport {
                message: err.to_string(),
                exhausted: false,
            };
        }
        match err {
            BridgeError::Io(io) => PlaybackError::Io(io),
            other => PlaybackError::Source(other.to_string()),
        }
    }
}

/// Collects the `source()` chain of an error, outermost first.
pub fn error_causes(err: &(dyn std::error::Error + 'static)) -> Vec<String> {
    let mut causes = Vec::new();
    let mut current = err.source();
    while let Some(cause) = current {
        causes.push(cause.to_string());
        current = cause.source();
    }
    causes
}

/// Result type for playback operations.
pub type Result<T> = std::result::Result<T, PlaybackError>;
