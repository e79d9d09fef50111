//! # Core Playback Types
//!
//! Data model shared by every stage of the pipeline.
//!
//! ```text
//! StreamHandle ──► Demuxer ──Packet──► Decoder ──DecodedChunk──► Executor ──Frame──► FrameBuffer
//! ```
//!
//! Packets carry timestamps in the container's own time base; frames carry
//! wall-clock [`Duration`]s and interleaved `f32` samples.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Format Identifiers
// ============================================================================

/// Container formats known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    Wav,
    Ogg,
    Flac,
    Mp3,
    Adts,
    Matroska,
    /// Container registered by the host.
    Other(String),
}

impl ContainerKind {
    pub fn as_str(&self) -> &str {
        match self {
            ContainerKind::Wav => "wav",
            ContainerKind::Ogg => "ogg",
            ContainerKind::Flac => "flac",
            ContainerKind::Mp3 => "mp3",
            ContainerKind::Adts => "adts",
            ContainerKind::Matroska => "matroska",
            ContainerKind::Other(name) => name,
        }
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audio codecs known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecId {
    /// Linear PCM; see [`SampleFormat`] and [`ByteOrder`].
    Pcm,
    /// G.711 A-law.
    ALaw,
    /// G.711 µ-law.
    MuLaw,
    Flac,
    Mp3,
    Aac,
    Vorbis,
    Opus,
    /// Codec registered by the host.
    Other(String),
}

impl CodecId {
    pub fn as_str(&self) -> &str {
        match self {
            CodecId::Pcm => "pcm",
            CodecId::ALaw => "alaw",
            CodecId::MuLaw => "mulaw",
            CodecId::Flac => "flac",
            CodecId::Mp3 => "mp3",
            CodecId::Aac => "aac",
            CodecId::Vorbis => "vorbis",
            CodecId::Opus => "opus",
            CodecId::Other(name) => name,
        }
    }

    /// Returns `true` if this is a lossless codec.
    pub fn is_lossless(&self) -> bool {
        matches!(self, CodecId::Pcm | CodecId::Flac)
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoded PCM sample representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    U8,
    S16,
    S24,
    S32,
    F32,
    F64,
}

impl SampleFormat {
    /// Bytes occupied by one sample of one channel.
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::S24 => 3,
            SampleFormat::S32 | SampleFormat::F32 => 4,
            SampleFormat::F64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

// ============================================================================
// Codec Parameters
// ============================================================================

/// Everything a decoder needs to initialise, as reported by the demuxer.
#[derive(Debug, Clone, PartialEq)]
pub struct CodecParameters {
    pub codec: CodecId,
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: Option<u16>,
    /// Meaningful for PCM codecs only.
    pub sample_format: Option<SampleFormat>,
    pub byte_order: ByteOrder,
    /// Bytes per interleaved sample frame (PCM).
    pub block_align: Option<u32>,
    /// Ticks per second of packet timestamps.
    pub time_base: u32,
    /// Track length in ticks, when the container knows it.
    pub total_ticks: Option<u64>,
    /// Leading samples (at `sample_rate`) to discard after decoding.
    pub encoder_delay: u32,
    /// Codec initialisation data (STREAMINFO, AudioSpecificConfig, Vorbis
    /// identification + setup headers, OpusHead).
    pub extra_data: Option<Bytes>,
}

impl CodecParameters {
    /// Parameters with a time base equal to the sample rate.
    pub fn new(codec: CodecId, sample_rate: u32, channels: u16) -> Self {
        Self {
            codec,
            sample_rate,
            channels,
            bits_per_sample: None,
            sample_format: None,
            byte_order: ByteOrder::Little,
            block_align: None,
            time_base: sample_rate.max(1),
            total_ticks: None,
            encoder_delay: 0,
            extra_data: None,
        }
    }

    pub fn with_time_base(mut self, time_base: u32) -> Self {
        self.time_base = time_base.max(1);
        self
    }

    pub fn with_total_ticks(mut self, ticks: Option<u64>) -> Self {
        self.total_ticks = ticks;
        self
    }

    pub fn with_extra_data(mut self, data: impl Into<Bytes>) -> Self {
        self.extra_data = Some(data.into());
        self
    }

    pub fn with_pcm(mut self, format: SampleFormat, order: ByteOrder) -> Self {
        self.sample_format = Some(format);
        self.byte_order = order;
        self.bits_per_sample = Some(format.bytes_per_sample() as u16 * 8);
        self.block_align = Some(format.bytes_per_sample() as u32 * self.channels as u32);
        self
    }

    pub fn ticks_to_duration(&self, ticks: u64) -> Duration {
        ticks_to_duration(ticks, self.time_base)
    }

    pub fn duration_to_ticks(&self, duration: Duration) -> u64 {
        duration_to_ticks(duration, self.time_base)
    }

    /// Length of the encoder delay that decoding trims from the start.
    pub fn delay_duration(&self) -> Duration {
        ticks_to_duration(self.encoder_delay as u64, self.sample_rate)
    }

    /// Playable track length (total ticks minus the encoder delay).
    pub fn duration(&self) -> Option<Duration> {
        self.total_ticks
            .map(|t| self.ticks_to_duration(t).saturating_sub(self.delay_duration()))
    }
}

pub fn ticks_to_duration(ticks: u64, time_base: u32) -> Duration {
    let base = time_base.max(1) as u128;
    let nanos = ticks as u128 * 1_000_000_000 / base;
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

pub fn duration_to_ticks(duration: Duration, time_base: u32) -> u64 {
    let ticks = duration.as_nanos() * time_base as u128 / 1_000_000_000;
    ticks.min(u64::MAX as u128) as u64
}

// ============================================================================
// Packets and Frames
// ============================================================================

/// One unit of compressed data produced by a demuxer.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Presentation timestamp in codec time-base ticks.
    pub timestamp: u64,
    /// Duration in ticks, when the container states it.
    pub duration: Option<u64>,
    pub data: Bytes,
}

impl Packet {
    pub fn new(timestamp: u64, data: impl Into<Bytes>) -> Self {
        Self {
            timestamp,
            duration: None,
            data: data.into(),
        }
    }

    pub fn with_duration(mut self, duration: u64) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// Decoded, timestamped PCM handed to the playback consumer.
///
/// Samples are interleaved `f32` in `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub timestamp: Duration,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Arc<[f32]>,
}

impl Frame {
    /// Samples per channel.
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    pub fn duration(&self) -> Duration {
        ticks_to_duration(self.frames() as u64, self.sample_rate)
    }

    /// Timestamp of the first sample after this frame.
    pub fn end(&self) -> Duration {
        self.timestamp + self.duration()
    }
}

// ============================================================================
// Metadata
// ============================================================================

/// Track gain found in tags.
///
/// Reported only; samples are never scaled by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReplayGain {
    pub track_gain_db: f32,
}

impl ReplayGain {
    /// Linear amplitude factor for the gain.
    pub fn multiplier(&self) -> f32 {
        10f32.powf(self.track_gain_db / 20.0)
    }

    /// Combines two gains (e.g. Opus header gain and a comment tag).
    pub fn combine(self, other: ReplayGain) -> ReplayGain {
        ReplayGain {
            track_gain_db: self.track_gain_db + other.track_gain_db,
        }
    }
}

/// Descriptive tags extracted by a demuxer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub isrc: Option<String>,
    pub replay_gain: Option<ReplayGain>,
}

impl ContainerMetadata {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.artist.is_none()
            && self.isrc.is_none()
            && self.replay_gain.is_none()
    }

    /// Fills fields that are still empty from `other`.
    pub fn merge(&mut self, other: ContainerMetadata) {
        if self.title.is_none() {
            self.title = other.title;
        }
        if self.artist.is_none() {
            self.artist = other.artist;
        }
        if self.isrc.is_none() {
            self.isrc = other.isrc;
        }
        if self.replay_gain.is_none() {
            self.replay_gain = other.replay_gain;
        }
    }
}

/// What the consumer knows about a loaded track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub source_identifier: String,
    pub duration: Option<Duration>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub isrc: Option<String>,
    pub replay_gain: Option<ReplayGain>,
}

impl TrackMetadata {
    pub fn new(source_identifier: impl Into<String>) -> Self {
        Self {
            source_identifier: source_identifier.into(),
            duration: None,
            title: None,
            artist: None,
            isrc: None,
            replay_gain: None,
        }
    }

    /// Completes source-provided metadata with container tags and the
    /// codec-derived duration. Source values win.
    pub fn complete(&mut self, tags: &ContainerMetadata, duration: Option<Duration>) {
        if self.duration.is_none() {
            self.duration = duration;
        }
        if self.title.is_none() {
            self.title = tags.title.clone();
        }
        if self.artist.is_none() {
            self.artist = tags.artist.clone();
        }
        if self.isrc.is_none() {
            self.isrc = tags.isrc.clone();
        }
        if self.replay_gain.is_none() {
            self.replay_gain = tags.replay_gain;
        }
    }
}

// ============================================================================
// Track State
// ============================================================================

/// Lifecycle of a loaded track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    /// Opening the source, probing and configuring the decoder.
    Initializing,
    Playing,
    Paused,
    /// Repositioning; no frames are delivered.
    Seeking,
    /// End of stream reached and every frame consumed.
    Finished,
    /// Stopped by an unrecoverable error.
    Failed,
}

impl TrackState {
    /// Returns `true` while the track may still deliver frames.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Initializing | Self::Playing | Self::Paused | Self::Seeking
        )
    }

    /// Returns `true` once the track can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}
