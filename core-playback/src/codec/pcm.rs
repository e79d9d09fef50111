//! Linear PCM and G.711 decoding.
//!
//! Every sample format is normalised to `f32` in `[-1.0, 1.0]`: signed
//! integers divide by `2^(bits-1)`, `U8` is offset by 128, floats pass
//! through clamped.

use super::{DecodedChunk, Decoder, RecoveryBoundary};
use crate::error::{PlaybackError, Result};
use crate::types::{ByteOrder, CodecId, CodecParameters, Packet, SampleFormat};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Linear(SampleFormat),
    ALaw,
    MuLaw,
}

impl Encoding {
    fn sample_bytes(&self) -> usize {
        match self {
            Encoding::Linear(format) => format.bytes_per_sample(),
            Encoding::ALaw | Encoding::MuLaw => 1,
        }
    }
}

pub struct PcmDecoder {
    encoding: Encoding,
    order: ByteOrder,
    sample_rate: u32,
    channels: u16,
    /// Bytes carried over from a packet that ended mid-frame.
    carry: Vec<u8>,
}

impl PcmDecoder {
    pub fn new(params: &CodecParameters) -> Result<Self> {
        let encoding = match params.codec {
            CodecId::Pcm => Encoding::Linear(params.sample_format.ok_or_else(|| {
                PlaybackError::UnsupportedCodec("pcm without sample format".to_string())
            })?),
            CodecId::ALaw => Encoding::ALaw,
            CodecId::MuLaw => Encoding::MuLaw,
            ref other => return Err(PlaybackError::UnsupportedCodec(other.to_string())),
        };
        if params.channels == 0 || params.sample_rate == 0 {
            return Err(PlaybackError::malformed(format!(
                "invalid pcm layout: {} Hz, {} channels",
                params.sample_rate, params.channels
            )));
        }

        Ok(Self {
            encoding,
            order: params.byte_order,
            sample_rate: params.sample_rate,
            channels: params.channels,
            carry: Vec::new(),
        })
    }

    fn frame_bytes(&self) -> usize {
        self.encoding.sample_bytes() * self.channels as usize
    }

    fn convert(&self, data: &[u8], out: &mut Vec<f32>) {
        let width = self.encoding.sample_bytes();
        out.reserve(data.len() / width);
        for raw in data.chunks_exact(width) {
            out.push(self.sample(raw));
        }
    }

    fn sample(&self, raw: &[u8]) -> f32 {
        let big = self.order == ByteOrder::Big;
        match self.encoding {
            Encoding::ALaw => alaw_to_linear(raw[0]) as f32 / 32_768.0,
            Encoding::MuLaw => mulaw_to_linear(raw[0]) as f32 / 32_768.0,
            Encoding::Linear(SampleFormat::U8) => (raw[0] as f32 - 128.0) / 128.0,
            Encoding::Linear(SampleFormat::S16) => {
                let bytes = [raw[0], raw[1]];
                let value = if big {
                    i16::from_be_bytes(bytes)
                } else {
                    i16::from_le_bytes(bytes)
                };
                value as f32 / 32_768.0
            }
            Encoding::Linear(SampleFormat::S24) => {
                let (hi, mid, lo) = if big {
                    (raw[0], raw[1], raw[2])
                } else {
                    (raw[2], raw[1], raw[0])
                };
                // Sign-extend through the top byte of an i32.
                let value = i32::from_be_bytes([hi, mid, lo, 0]) >> 8;
                value as f32 / 8_388_608.0
            }
            Encoding::Linear(SampleFormat::S32) => {
                let bytes = [raw[0], raw[1], raw[2], raw[3]];
                let value = if big {
                    i32::from_be_bytes(bytes)
                } else {
                    i32::from_le_bytes(bytes)
                };
                (value as f64 / 2_147_483_648.0) as f32
            }
            Encoding::Linear(SampleFormat::F32) => {
                let bytes = [raw[0], raw[1], raw[2], raw[3]];
                let value = if big {
                    f32::from_be_bytes(bytes)
                } else {
                    f32::from_le_bytes(bytes)
                };
                clamp_float(value)
            }
            Encoding::Linear(SampleFormat::F64) => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&raw[..8]);
                let value = if big {
                    f64::from_be_bytes(bytes)
                } else {
                    f64::from_le_bytes(bytes)
                };
                clamp_float(value as f32)
            }
        }
    }
}

fn clamp_float(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(-1.0, 1.0)
    }
}

/// G.711 A-law expansion to 16-bit linear.
pub fn alaw_to_linear(code: u8) -> i16 {
    let a = code ^ 0x55;
    let exponent = (a >> 4) & 0x07;
    let mantissa = (a & 0x0F) as i16;
    let magnitude = match exponent {
        0 => (mantissa << 4) + 8,
        _ => ((mantissa << 4) + 0x108) << (exponent - 1),
    };
    if a & 0x80 != 0 {
        magnitude
    } else {
        -magnitude
    }
}

/// G.711 µ-law expansion to 16-bit linear.
pub fn mulaw_to_linear(code: u8) -> i16 {
    const BIAS: i16 = 0x84;
    let u = !code;
    let exponent = (u >> 4) & 0x07;
    let mantissa = (u & 0x0F) as i16;
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if u & 0x80 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

impl Decoder for PcmDecoder {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<DecodedChunk>> {
        let frame_bytes = self.frame_bytes();
        let mut samples = Vec::new();

        let mut data: &[u8] = &packet.data;
        if !self.carry.is_empty() {
            let need = frame_bytes - self.carry.len();
            let take = need.min(data.len());
            self.carry.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.carry.len() < frame_bytes {
                return Ok(Vec::new());
            }
            let carried = std::mem::take(&mut self.carry);
            self.convert(&carried, &mut samples);
        }

        let whole = data.len() - data.len() % frame_bytes;
        self.convert(&data[..whole], &mut samples);
        if whole < data.len() {
            warn!(
                left = data.len() - whole,
                "PCM packet ends mid-frame, carrying bytes over"
            );
            self.carry.extend_from_slice(&data[whole..]);
        }

        if samples.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![DecodedChunk::new(
            samples,
            self.sample_rate,
            self.channels,
        )])
    }

    fn reset(&mut self) {
        self.carry.clear();
    }

    fn recovery_boundary(&self) -> RecoveryBoundary {
        RecoveryBoundary::Packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder(format: SampleFormat, order: ByteOrder, channels: u16) -> PcmDecoder {
        let params = CodecParameters::new(CodecId::Pcm, 8_000, channels).with_pcm(format, order);
        PcmDecoder::new(&params).unwrap()
    }

    fn decode_all(decoder: &mut PcmDecoder, data: &[u8]) -> Vec<f32> {
        decoder
            .decode(&Packet::new(0, data.to_vec()))
            .unwrap()
            .into_iter()
            .flat_map(|c| c.samples)
            .collect()
    }

    #[test]
    fn test_s16_both_orders() {
        let mut le = decoder(SampleFormat::S16, ByteOrder::Little, 1);
        assert_eq!(decode_all(&mut le, &[0x00, 0x40, 0x00, 0x80]), vec![0.5, -1.0]);

        let mut be = decoder(SampleFormat::S16, ByteOrder::Big, 1);
        assert_eq!(decode_all(&mut be, &[0x40, 0x00, 0x80, 0x00]), vec![0.5, -1.0]);
    }

    #[test]
    fn test_u8_and_s24() {
        let mut u8_dec = decoder(SampleFormat::U8, ByteOrder::Little, 1);
        assert_eq!(decode_all(&mut u8_dec, &[128, 0, 192]), vec![0.0, -1.0, 0.5]);

        let mut s24 = decoder(SampleFormat::S24, ByteOrder::Little, 1);
        let samples = decode_all(&mut s24, &[0x00, 0x00, 0xC0, 0x00, 0x00, 0x40]);
        assert_eq!(samples, vec![-0.5, 0.5]);

        let mut s24_be = decoder(SampleFormat::S24, ByteOrder::Big, 1);
        assert_eq!(decode_all(&mut s24_be, &[0xC0, 0x00, 0x00]), vec![-0.5]);
    }

    #[test]
    fn test_float_formats_clamped() {
        let mut f32_dec = decoder(SampleFormat::F32, ByteOrder::Little, 1);
        let mut data = Vec::new();
        data.extend_from_slice(&0.25f32.to_le_bytes());
        data.extend_from_slice(&1.5f32.to_le_bytes());
        assert_eq!(decode_all(&mut f32_dec, &data), vec![0.25, 1.0]);

        let mut f64_dec = decoder(SampleFormat::F64, ByteOrder::Big, 1);
        assert_eq!(decode_all(&mut f64_dec, &(-0.75f64).to_be_bytes()), vec![-0.75]);
    }

    #[test]
    fn test_s32() {
        let mut dec = decoder(SampleFormat::S32, ByteOrder::Little, 1);
        let samples = decode_all(&mut dec, &(i32::MIN / 2).to_le_bytes());
        assert_eq!(samples, vec![-0.5]);
    }

    #[test]
    fn test_partial_frame_carried_over() {
        let mut dec = decoder(SampleFormat::S16, ByteOrder::Little, 2);
        let first = dec.decode(&Packet::new(0, vec![0x00, 0x40, 0x00])).unwrap();
        assert!(first.is_empty());
        let second = dec.decode(&Packet::new(1, vec![0xC0])).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].samples, vec![0.5, -0.5]);
        assert_eq!(second[0].frames(), 1);
    }

    #[test]
    fn test_reset_drops_carry() {
        let mut dec = decoder(SampleFormat::S16, ByteOrder::Little, 1);
        dec.decode(&Packet::new(0, vec![0x00])).unwrap();
        dec.reset();
        assert_eq!(decode_all(&mut dec, &[0x00, 0x40]), vec![0.5]);
    }

    #[test]
    fn test_g711_expansion() {
        assert_eq!(mulaw_to_linear(0xFF), 0);
        assert_eq!(mulaw_to_linear(0x7F), 0);
        assert_eq!(mulaw_to_linear(0x80), 32_124);
        assert_eq!(mulaw_to_linear(0x00), -32_124);
        assert_eq!(alaw_to_linear(0xD5), 8);
        assert_eq!(alaw_to_linear(0x55), -8);
        assert_eq!(alaw_to_linear(0xAA), 32_256);
        assert_eq!(alaw_to_linear(0x2A), -32_256);
    }

    #[test]
    fn test_alaw_decoder() {
        let mut params = CodecParameters::new(CodecId::ALaw, 8_000, 1);
        params.sample_format = Some(SampleFormat::U8);
        let mut dec = PcmDecoder::new(&params).unwrap();
        let samples = decode_all(&mut dec, &[0xAA, 0x2A]);
        assert!((samples[0] - 0.984).abs() < 0.001);
        assert!((samples[1] + 0.984).abs() < 0.001);
    }

    #[test]
    fn test_rejects_other_codecs() {
        let params = CodecParameters::new(CodecId::Mp3, 44_100, 2);
        assert!(matches!(
            PcmDecoder::new(&params),
            Err(PlaybackError::UnsupportedCodec(_))
        ));
    }
}
