//! # Symphonia Decoder Adapter
//!
//! Drives Symphonia's codec implementations (FLAC, MP3, AAC-LC, Vorbis) with
//! packets from our own demuxers. Symphonia's format readers are not used.
//!
//! Initialisation data is passed through unchanged as Symphonia expects it:
//!
//! | Codec | `extra_data` |
//! |-------|--------------|
//! | FLAC | 34-byte STREAMINFO |
//! | AAC | AudioSpecificConfig |
//! | Vorbis | identification header followed by setup header |
//! | MP3 | none |

use super::sample_converter::SampleConverter;
use super::{DecodedChunk, Decoder, RecoveryBoundary};
use crate::error::{PlaybackError, Result};
use crate::types::{CodecId, CodecParameters, Packet};
use symphonia::core::audio::Channels;
use symphonia::core::codecs::{
    CodecParameters as SymphoniaParameters, CodecType, Decoder as SymphoniaCodec, DecoderOptions,
    CODEC_TYPE_AAC, CODEC_TYPE_FLAC, CODEC_TYPE_MP3, CODEC_TYPE_VORBIS,
};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet as SymphoniaPacket;
use tracing::{debug, info, warn};

const TRACK_ID: u32 = 0;

/// Symphonia codec type for one of our codec ids.
pub fn codec_type(codec: &CodecId) -> Option<CodecType> {
    match codec {
        CodecId::Flac => Some(CODEC_TYPE_FLAC),
        CodecId::Mp3 => Some(CODEC_TYPE_MP3),
        CodecId::Aac => Some(CODEC_TYPE_AAC),
        CodecId::Vorbis => Some(CODEC_TYPE_VORBIS),
        _ => None,
    }
}

/// Channel mask with the first `count` positions set.
fn channel_mask(count: u16) -> Option<Channels> {
    if count == 0 || count > 32 {
        return None;
    }
    let bits = if count == 32 {
        u32::MAX
    } else {
        (1u32 << count) - 1
    };
    Some(Channels::from_bits_truncate(bits))
}

pub struct SymphoniaDecoder {
    codec: CodecId,
    inner: Box<dyn SymphoniaCodec>,
}

impl SymphoniaDecoder {
    pub fn new(params: &CodecParameters) -> Result<Self> {
        let codec_type = codec_type(&params.codec)
            .ok_or_else(|| PlaybackError::UnsupportedCodec(params.codec.to_string()))?;

        let mut symphonia_params = SymphoniaParameters::new();
        symphonia_params
            .for_codec(codec_type)
            .with_sample_rate(params.sample_rate);
        if let Some(channels) = channel_mask(params.channels) {
            symphonia_params.with_channels(channels);
        }
        if let Some(bits) = params.bits_per_sample {
            symphonia_params.with_bits_per_sample(bits as u32);
        }
        if let Some(extra) = &params.extra_data {
            symphonia_params.with_extra_data(extra.to_vec().into_boxed_slice());
        }

        let inner = symphonia::default::get_codecs()
            .make(&symphonia_params, &DecoderOptions::default())
            .map_err(|e| match e {
                SymphoniaError::Unsupported(what) => {
                    PlaybackError::UnsupportedCodec(format!("{}: {}", params.codec, what))
                }
                other => PlaybackError::malformed(format!(
                    "{} decoder rejected stream parameters: {}",
                    params.codec, other
                )),
            })?;

        info!(
            codec = %params.codec,
            sample_rate = params.sample_rate,
            channels = params.channels,
            "Symphonia decoder initialized"
        );

        Ok(Self {
            codec: params.codec.clone(),
            inner,
        })
    }
}

impl Decoder for SymphoniaDecoder {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<DecodedChunk>> {
        let symphonia_packet = SymphoniaPacket::new_from_slice(
            TRACK_ID,
            packet.timestamp,
            packet.duration.unwrap_or(0),
            &packet.data,
        );

        match self.inner.decode(&symphonia_packet) {
            Ok(decoded) => {
                if decoded.frames() == 0 {
                    return Ok(Vec::new());
                }
                Ok(vec![SampleConverter::to_chunk(&decoded)])
            }
            Err(SymphoniaError::DecodeError(err)) => {
                warn!(codec = %self.codec, "Skipping packet with decode error: {}", err);
                Err(PlaybackError::recoverable(format!(
                    "{} decode error: {}",
                    self.codec, err
                )))
            }
            Err(SymphoniaError::IoError(err)) => {
                // Inside a single packet an I/O error means it was truncated.
                warn!(codec = %self.codec, "Skipping truncated packet: {}", err);
                Err(PlaybackError::recoverable(format!(
                    "{} truncated packet: {}",
                    self.codec, err
                )))
            }
            Err(SymphoniaError::ResetRequired) => {
                debug!(codec = %self.codec, "Decoder requested reset");
                self.inner.reset();
                Ok(Vec::new())
            }
            Err(SymphoniaError::Unsupported(what)) => Err(PlaybackError::UnsupportedCodec(
                format!("{}: {}", self.codec, what),
            )),
            Err(other) => Err(PlaybackError::malformed(format!(
                "{} decoder failure: {}",
                self.codec, other
            ))),
        }
    }

    fn reset(&mut self) {
        self.inner.reset();
    }

    /// Vorbis overlaps each block with the previous one, so a lost packet
    /// leaves stale window state behind.
    fn recovery_boundary(&self) -> RecoveryBoundary {
        match self.codec {
            CodecId::Vorbis => RecoveryBoundary::SyncPoint,
            _ => RecoveryBoundary::Packet,
        }
    }
}
