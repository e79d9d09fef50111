//! # Sample Format Converter
//!
//! Normalises Symphonia's planar buffers of any sample type to interleaved
//! `f32` in `[-1.0, 1.0]`.

use super::DecodedChunk;
use symphonia::core::audio::{AudioBuffer, AudioBufferRef, Signal};
use symphonia::core::conv::IntoSample;
use symphonia::core::sample::Sample;

pub struct SampleConverter;

impl SampleConverter {
    /// Converts a decoded buffer to interleaved f32 (LRLR... for stereo).
    pub fn to_interleaved_f32(buffer: &AudioBufferRef<'_>) -> Vec<f32> {
        let mut samples = match buffer {
            AudioBufferRef::F32(buf) => Self::interleave(&**buf),
            AudioBufferRef::F64(buf) => Self::interleave(&**buf),
            AudioBufferRef::S32(buf) => Self::interleave(&**buf),
            AudioBufferRef::S24(buf) => Self::interleave(&**buf),
            AudioBufferRef::S16(buf) => Self::interleave(&**buf),
            AudioBufferRef::S8(buf) => Self::interleave(&**buf),
            AudioBufferRef::U32(buf) => Self::interleave(&**buf),
            AudioBufferRef::U24(buf) => Self::interleave(&**buf),
            AudioBufferRef::U16(buf) => Self::interleave(&**buf),
            AudioBufferRef::U8(buf) => Self::interleave(&**buf),
        };
        // Lossy decoders overshoot slightly on loud material.
        Self::clamp_samples(&mut samples);
        samples
    }

    /// Builds a chunk carrying the buffer's own rate and channel count.
    pub fn to_chunk(buffer: &AudioBufferRef<'_>) -> DecodedChunk {
        let spec = buffer.spec();
        DecodedChunk::new(
            Self::to_interleaved_f32(buffer),
            spec.rate,
            spec.channels.count() as u16,
        )
    }

    fn interleave<S>(buf: &AudioBuffer<S>) -> Vec<f32>
    where
        S: Sample + IntoSample<f32>,
    {
        let num_channels = buf.spec().channels.count();
        let num_frames = buf.frames();
        let mut interleaved = Vec::with_capacity(num_frames * num_channels);

        for frame_idx in 0..num_frames {
            for chan_idx in 0..num_channels {
                interleaved.push(buf.chan(chan_idx)[frame_idx].into_sample());
            }
        }

        interleaved
    }

    /// Clamps samples to `[-1.0, 1.0]`; NaN becomes silence.
    pub fn clamp_samples(samples: &mut [f32]) {
        for sample in samples.iter_mut() {
            *sample = if sample.is_nan() {
                0.0
            } else {
                sample.clamp(-1.0, 1.0)
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use symphonia::core::audio::{Channels, SignalSpec};

    #[test]
    fn test_clamp_samples() {
        let mut samples = vec![0.0, 1.5, -1.5, 0.5, f32::NAN];
        SampleConverter::clamp_samples(&mut samples);
        assert_eq!(samples, vec![0.0, 1.0, -1.0, 0.5, 0.0]);
    }

    #[test]
    fn test_interleave_planar_s16() {
        let spec = SignalSpec::new(44_100, Channels::FRONT_LEFT | Channels::FRONT_RIGHT);
        let mut buf = AudioBuffer::<i16>::new(4, spec);
        buf.render_reserved(Some(2));
        buf.chan_mut(0).copy_from_slice(&[16_384, 0]);
        buf.chan_mut(1).copy_from_slice(&[-16_384, -32_768]);

        let chunk = SampleConverter::to_chunk(&AudioBufferRef::S16(Cow::Borrowed(&buf)));
        assert_eq!(chunk.channels, 2);
        assert_eq!(chunk.sample_rate, 44_100);
        assert_eq!(chunk.samples, vec![0.5, -0.5, 0.0, -1.0]);
    }
}
