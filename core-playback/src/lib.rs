//! # Audio Playback Core
//!
//! Format-agnostic playback pipeline: identifiers go in, timestamped PCM
//! frames come out.
//!
//! ## Overview
//!
//! ```text
//! TrackSource ─► StreamHandle ─► Prober ─► Demuxer ─► Decoder ─► FrameBuffer ─► TrackHandle
//!                (retry, rewind)  (registry)  (packets)  (f32 PCM)   (bounded)     (poll/commands)
//! ```
//!
//! - [`stream`]: seekable, retrying, cancellable byte streams over files,
//!   memory and the HTTP bridge
//! - [`probe`] and [`registry`]: container identification and the
//!   container/codec tables
//! - [`container`]: WAV, FLAC, MP3, ADTS, Ogg and Matroska/WebM demuxers
//! - [`codec`]: PCM/G.711 decoding plus Symphonia and libopus adapters
//!   behind cargo features
//! - [`executor`] and [`track`]: one blocking worker per track and the
//!   consumer-side handle
//! - [`engine`]: the host entry point
//!
//! ## Feature Flags
//!
//! - `decoder-mp3`, `decoder-flac`, `decoder-vorbis`, `decoder-aac`: Symphonia
//!   codecs (all on by default through `decoder-all`)
//! - `decoder-opus`: libopus through `audiopus`

pub mod buffer;
pub mod codec;
pub mod config;
pub mod container;
pub mod engine;
pub mod error;
pub mod executor;
pub mod probe;
pub mod registry;
pub mod source;
pub mod stream;
pub mod track;
pub mod types;

pub use buffer::{BufferStats, FrameBuffer, PushError};
pub use codec::{DecodedChunk, Decoder, DecoderFactory, RecoveryBoundary};
pub use config::{PlaybackConfig, RetrySettings, TrackStats};
pub use container::{DemuxOptions, Demuxer, DemuxerFactory, ResyncPolicy};
pub use engine::PlaybackEngine;
pub use error::{PlaybackError, Result};
pub use executor::{ExecutorContext, TimestampTracker};
pub use probe::{Prober, DISAMBIGUATION_THRESHOLD};
pub use registry::{ContainerDescriptor, FormatRegistry};
pub use source::{DefaultTrackSource, MemoryTrackSource, OpenedTrack, TrackSource};
pub use stream::{ByteSource, StreamHandle};
pub use track::{Command, PollResult, TrackFailure, TrackHandle};
pub use types::{
    ByteOrder, CodecId, CodecParameters, ContainerKind, ContainerMetadata, Frame, Packet,
    ReplayGain, SampleFormat, TrackMetadata, TrackState,
};
