//! # Decoders
//!
//! A decoder turns the [`Packet`]s of one track into interleaved `f32`
//! samples. Decoders are built from [`CodecParameters`] by a
//! [`DecoderFactory`] registered in the [`FormatRegistry`](crate::FormatRegistry).
//!
//! - [`pcm`]: linear PCM and G.711, native
//! - [`symphonia`]: FLAC, MP3, AAC-LC and Vorbis through Symphonia's codecs
//! - [`opus`]: Opus through libopus (feature `decoder-opus`)

pub mod pcm;

#[cfg(feature = "core-decoder")]
pub mod sample_converter;
#[cfg(feature = "core-decoder")]
pub mod symphonia;

#[cfg(feature = "decoder-opus")]
pub mod opus;

use crate::error::Result;
use crate::types::{CodecParameters, Packet};
use std::sync::Arc;

/// Where a decoder can pick up again after a corrupt packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryBoundary {
    /// The next packet decodes independently.
    Packet,
    /// Output resumes at the next codec sync point; packets in between may
    /// decode to nothing.
    SyncPoint,
}

/// A run of interleaved samples produced from one packet.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedChunk {
    /// Interleaved `f32` in `[-1.0, 1.0]`.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedChunk {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Samples per channel.
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Stateful packet decoder for a single track.
pub trait Decoder: Send {
    /// Decodes one packet. Returning no chunks is valid (priming packets,
    /// header packets, decoder latency).
    ///
    /// Corrupt packets yield a recoverable
    /// [`MalformedData`](crate::PlaybackError::MalformedData) error and leave
    /// the decoder usable.
    fn decode(&mut self, packet: &Packet) -> Result<Vec<DecodedChunk>>;

    /// Drops predictor and overlap state. Called on seek and stop.
    fn reset(&mut self);

    fn recovery_boundary(&self) -> RecoveryBoundary;
}

/// Builds a decoder for the given parameters.
pub type DecoderFactory =
    Arc<dyn Fn(&CodecParameters) -> Result<Box<dyn Decoder>> + Send + Sync>;
