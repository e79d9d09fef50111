//! Opus decoding through libopus.
//!
//! Output is always 48 kHz. Mono and stereo streams only (channel mapping
//! family 0); pre-skip trimming happens in the executor.

use super::{DecodedChunk, Decoder, RecoveryBoundary};
use crate::error::{PlaybackError, Result};
use crate::types::{CodecId, CodecParameters, Packet};
use audiopus::{coder::Decoder as OpusDecoder, Channels, SampleRate};
use tracing::{info, warn};

pub const OPUS_SAMPLE_RATE: u32 = 48_000;

/// Longest Opus packet: 120 ms at 48 kHz.
const MAX_FRAME_SAMPLES: usize = 5_760;

pub struct LibOpusDecoder {
    inner: OpusDecoder,
    channels: u16,
    layout: Channels,
    pcm: Vec<i16>,
}

impl LibOpusDecoder {
    pub fn new(params: &CodecParameters) -> Result<Self> {
        if params.codec != CodecId::Opus {
            return Err(PlaybackError::UnsupportedCodec(params.codec.to_string()));
        }
        let layout = match params.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            n => {
                return Err(PlaybackError::UnsupportedCodec(format!(
                    "opus with {} channels",
                    n
                )))
            }
        };
        let inner = Self::build(layout)?;

        info!(channels = params.channels, "Opus decoder initialized");

        Ok(Self {
            inner,
            channels: params.channels,
            layout,
            pcm: vec![0i16; MAX_FRAME_SAMPLES * params.channels as usize],
        })
    }

    fn build(layout: Channels) -> Result<OpusDecoder> {
        OpusDecoder::new(SampleRate::Hz48000, layout)
            .map_err(|e| PlaybackError::Internal(format!("failed to create opus decoder: {:?}", e)))
    }
}

impl Decoder for LibOpusDecoder {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<DecodedChunk>> {
        if packet.data.is_empty() {
            return Ok(Vec::new());
        }
        let per_channel = self
            .inner
            .decode(Some(&packet.data[..]), &mut self.pcm, false)
            .map_err(|e| {
                warn!("Skipping undecodable opus packet: {:?}", e);
                PlaybackError::recoverable(format!("opus decode error: {:?}", e))
            })?;

        let count = per_channel * self.channels as usize;
        let samples = self.pcm[..count]
            .iter()
            .map(|&s| s as f32 / 32_768.0)
            .collect();
        Ok(vec![DecodedChunk::new(
            samples,
            OPUS_SAMPLE_RATE,
            self.channels,
        )])
    }

    fn reset(&mut self) {
        match Self::build(self.layout) {
            Ok(fresh) => self.inner = fresh,
            Err(e) => warn!("Opus decoder reset failed, keeping old state: {}", e),
        }
    }

    fn recovery_boundary(&self) -> RecoveryBoundary {
        RecoveryBoundary::Packet
    }
}
