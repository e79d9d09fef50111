//! Workspace facade crate.
//!
//! Re-exports the playback engine and the runtime configuration so hosts can
//! depend on `apc-workspace` alone and pick codecs through its features
//! (`decoder-all`, `decoder-mp3`, `decoder-flac`, `decoder-vorbis`,
//! `decoder-aac`, `decoder-opus`). `desktop-shims` supplies a default HTTP
//! client when the host does not inject one.

pub use core_playback as playback;
pub use core_runtime as runtime;

pub use core_playback::{
    Command, ExecutorContext, Frame, PlaybackConfig, PlaybackEngine, PlaybackError, PollResult,
    TrackHandle, TrackSource, TrackState,
};
pub use core_runtime::config::CoreConfig;
pub use core_runtime::events::{CoreEvent, TrackEvent};
