//! RIFF/WAVE demuxer.
//!
//! Supports integer PCM, IEEE float, A-law and µ-law, including
//! `WAVE_FORMAT_EXTENSIBLE`. Chunks before `data` are walked in order;
//! `LIST/INFO` supplies title and artist. Any structural error is fatal.

use super::bytes::{le_u16, le_u32};
use super::{DemuxOptions, Demuxer, ResyncPolicy};
use crate::error::{PlaybackError, Result};
use crate::stream::StreamHandle;
use crate::types::{
    ByteOrder, CodecId, CodecParameters, ContainerKind, ContainerMetadata, Packet, SampleFormat,
};
use std::time::Duration;
use tracing::{debug, info};

const FORMAT_PCM: u16 = 0x0001;
const FORMAT_IEEE_FLOAT: u16 = 0x0003;
const FORMAT_ALAW: u16 = 0x0006;
const FORMAT_MULAW: u16 = 0x0007;
const FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// Sample frames per packet.
const FRAMES_PER_PACKET: u64 = 4096;

/// Confidence for `RIFF....WAVE`, raised when a sane `fmt ` chunk follows.
pub fn probe(data: &[u8]) -> Option<u8> {
    if data.len() < 12 || &data[..4] != b"RIFF" || &data[8..12] != b"WAVE" {
        return None;
    }
    if data.len() >= 36 && &data[12..16] == b"fmt " {
        let channels = le_u16(data, 22)?;
        let rate = le_u32(data, 24)?;
        if channels > 0 && rate > 0 {
            return Some(100);
        }
    }
    Some(60)
}

pub fn open(stream: StreamHandle, options: &DemuxOptions) -> Result<Box<dyn Demuxer>> {
    Ok(Box::new(WavDemuxer::new(stream, options)?))
}

struct FmtChunk {
    format_tag: u16,
    channels: u16,
    sample_rate: u32,
    block_align: u16,
    bits_per_sample: u16,
}

pub struct WavDemuxer {
    stream: StreamHandle,
    params: CodecParameters,
    metadata: ContainerMetadata,
    data_start: u64,
    /// `None` when the header gives no usable size (streamed WAV).
    data_len: Option<u64>,
    block_align: u64,
    next_frame: u64,
}

impl WavDemuxer {
    pub fn new(mut stream: StreamHandle, options: &DemuxOptions) -> Result<Self> {
        let riff = stream.read_array::<12>()?;
        if &riff[..4] != b"RIFF" || &riff[8..] != b"WAVE" {
            return Err(PlaybackError::malformed("missing RIFF/WAVE header"));
        }

        let mut fmt: Option<FmtChunk> = None;
        let mut metadata = ContainerMetadata::default();

        let (data_start, declared_len) = loop {
            let header = stream.read_array::<8>()?;
            let id = [header[0], header[1], header[2], header[3]];
            let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as u64;
            debug!(chunk = %String::from_utf8_lossy(&id), size, "WAV chunk");

            match &id {
                b"fmt " => {
                    if !(16..=1024).contains(&size) {
                        return Err(PlaybackError::malformed(format!(
                            "fmt chunk has invalid size {}",
                            size
                        )));
                    }
                    let body = stream.read_vec(size, options.max_allocation_bytes)?;
                    fmt = Some(parse_fmt(&body)?);
                }
                b"LIST" if size <= super::tags::MAX_TAG_BYTES => {
                    let body = stream.read_vec(size, options.max_allocation_bytes)?;
                    metadata.merge(parse_info_list(&body));
                }
                b"data" => break (stream.position(), size),
                _ => {
                    stream.check_size(size, u64::MAX)?;
                    if stream.skip(size)? < size {
                        return Err(PlaybackError::malformed("chunk extends past end of stream"));
                    }
                }
            }
            if size % 2 == 1 {
                stream.skip(1)?;
            }
        };
        stream.commit();

        let fmt = fmt.ok_or_else(|| PlaybackError::malformed("data chunk before fmt chunk"))?;
        let (codec, sample_format) = codec_for(&fmt)?;

        let block_align = fmt.block_align as u64;
        let expected_align = sample_format.bytes_per_sample() as u64 * fmt.channels as u64;
        if block_align != expected_align {
            return Err(PlaybackError::malformed(format!(
                "block align {} does not match {} channels of {:?}",
                block_align, fmt.channels, sample_format
            )));
        }

        let data_len = match (declared_len, stream.remaining()) {
            (0xFFFF_FFFF, remaining) | (0, remaining) => remaining,
            (declared, Some(remaining)) => Some(declared.min(remaining)),
            (declared, None) => Some(declared),
        };

        let mut params = CodecParameters::new(codec, fmt.sample_rate, fmt.channels)
            .with_pcm(sample_format, ByteOrder::Little)
            .with_total_ticks(data_len.map(|len| len / block_align));
        params.bits_per_sample = Some(fmt.bits_per_sample);

        info!(
            codec = %params.codec,
            sample_rate = fmt.sample_rate,
            channels = fmt.channels,
            format = ?sample_format,
            "Opened WAV stream"
        );

        Ok(Self {
            stream,
            params,
            metadata,
            data_start,
            data_len,
            block_align,
            next_frame: 0,
        })
    }

    fn total_frames(&self) -> Option<u64> {
        self.data_len.map(|len| len / self.block_align)
    }
}

fn parse_fmt(body: &[u8]) -> Result<FmtChunk> {
    let short = || PlaybackError::malformed("truncated fmt chunk");
    let mut format_tag = le_u16(body, 0).ok_or_else(short)?;
    let channels = le_u16(body, 2).ok_or_else(short)?;
    let sample_rate = le_u32(body, 4).ok_or_else(short)?;
    let block_align = le_u16(body, 12).ok_or_else(short)?;
    let bits_per_sample = le_u16(body, 14).ok_or_else(short)?;

    if format_tag == FORMAT_EXTENSIBLE {
        // cbSize(2) validBits(2) channelMask(4) then the SubFormat GUID whose
        // first two bytes are the real format tag.
        format_tag = le_u16(body, 24).ok_or_else(short)?;
    }
    if channels == 0 || sample_rate == 0 || block_align == 0 {
        return Err(PlaybackError::malformed("fmt chunk with zero channels, rate or block align"));
    }
    Ok(FmtChunk {
        format_tag,
        channels,
        sample_rate,
        block_align,
        bits_per_sample,
    })
}

fn codec_for(fmt: &FmtChunk) -> Result<(CodecId, SampleFormat)> {
    let unsupported = || {
        PlaybackError::UnsupportedCodec(format!(
            "WAV format tag {:#06x} with {} bits",
            fmt.format_tag, fmt.bits_per_sample
        ))
    };
    // Container bits may exceed valid bits (e.g. 20-in-24); the container
    // width decides the layout.
    let container_bits = fmt.block_align as u32 * 8 / fmt.channels as u32;
    match (fmt.format_tag, container_bits) {
        (FORMAT_PCM, 8) => Ok((CodecId::Pcm, SampleFormat::U8)),
        (FORMAT_PCM, 16) => Ok((CodecId::Pcm, SampleFormat::S16)),
        (FORMAT_PCM, 24) => Ok((CodecId::Pcm, SampleFormat::S24)),
        (FORMAT_PCM, 32) => Ok((CodecId::Pcm, SampleFormat::S32)),
        (FORMAT_IEEE_FLOAT, 32) => Ok((CodecId::Pcm, SampleFormat::F32)),
        (FORMAT_IEEE_FLOAT, 64) => Ok((CodecId::Pcm, SampleFormat::F64)),
        (FORMAT_ALAW, 8) => Ok((CodecId::ALaw, SampleFormat::U8)),
        (FORMAT_MULAW, 8) => Ok((CodecId::MuLaw, SampleFormat::U8)),
        _ => Err(unsupported()),
    }
}

/// Reads `INAM` and `IART` from a `LIST` chunk of type `INFO`.
fn parse_info_list(body: &[u8]) -> ContainerMetadata {
    let mut meta = ContainerMetadata::default();
    if body.len() < 4 || &body[..4] != b"INFO" {
        return meta;
    }
    let mut pos = 4usize;
    while pos + 8 <= body.len() {
        let id = &body[pos..pos + 4];
        let Some(size) = le_u32(body, pos + 4).map(|s| s as usize) else {
            break;
        };
        let start = pos + 8;
        let Some(value) = start.checked_add(size).and_then(|end| body.get(start..end)) else {
            break;
        };
        let text = String::from_utf8_lossy(value)
            .trim_end_matches('\0')
            .trim()
            .to_string();
        if !text.is_empty() {
            match id {
                b"INAM" => meta.title = Some(text),
                b"IART" => meta.artist = Some(text),
                _ => {}
            }
        }
        pos = start + size + (size % 2);
    }
    meta
}

impl Demuxer for WavDemuxer {
    fn kind(&self) -> ContainerKind {
        ContainerKind::Wav
    }

    fn codec_parameters(&self) -> &CodecParameters {
        &self.params
    }

    fn metadata(&self) -> &ContainerMetadata {
        &self.metadata
    }

    fn next_packet(&mut self) -> Result<Option<Packet>> {
        let frames = match self.total_frames() {
            Some(total) if self.next_frame >= total => return Ok(None),
            Some(total) => (total - self.next_frame).min(FRAMES_PER_PACKET),
            None => FRAMES_PER_PACKET,
        };
        let mut data = vec![0u8; (frames * self.block_align) as usize];
        let read = self.stream.read_full(&mut data)?;
        // A trailing partial sample frame is dropped.
        let whole = read - read % self.block_align as usize;
        if whole == 0 {
            return Ok(None);
        }
        data.truncate(whole);

        let timestamp = self.next_frame;
        let frames = whole as u64 / self.block_align;
        self.next_frame += frames;
        Ok(Some(Packet::new(timestamp, data).with_duration(frames)))
    }

    fn seek(&mut self, target: Duration) -> Result<Duration> {
        let mut frame = self.params.duration_to_ticks(target);
        if let Some(total) = self.total_frames() {
            frame = frame.min(total);
        }
        self.stream
            .seek(self.data_start + frame * self.block_align)?;
        self.next_frame = frame;
        Ok(self.params.ticks_to_duration(frame))
    }

    fn can_seek(&self) -> bool {
        self.stream.is_seekable()
    }

    fn resync_policy(&self) -> ResyncPolicy {
        ResyncPolicy::Fatal
    }

    fn stream_mut(&mut self) -> &mut StreamHandle {
        &mut self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemorySource;

    fn wav_bytes(format_tag: u16, channels: u16, bits: u16, frames: usize) -> Vec<u8> {
        let block_align = channels * bits / 8;
        let data_len = frames * block_align as usize;
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&((36 + data_len) as u32).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&format_tag.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&8000u32.to_le_bytes());
        out.extend_from_slice(&(8000 * block_align as u32).to_le_bytes());
        out.extend_from_slice(&block_align.to_le_bytes());
        out.extend_from_slice(&bits.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(data_len as u32).to_le_bytes());
        out.extend(std::iter::repeat(0u8).take(data_len));
        out
    }

    #[test]
    fn test_probe_confidence() {
        let bytes = wav_bytes(1, 2, 16, 10);
        assert_eq!(probe(&bytes), Some(100));
        assert_eq!(probe(&bytes[..12]), Some(60));
        assert_eq!(probe(b"RIFX....WAVE"), None);
    }

    #[test]
    fn test_packets_cover_all_frames() {
        let bytes = wav_bytes(1, 2, 16, 10_000);
        let stream = StreamHandle::new(Box::new(MemorySource::new(bytes)));
        let mut demuxer = WavDemuxer::new(stream, &DemuxOptions::default()).unwrap();
        assert_eq!(demuxer.codec_parameters().total_ticks, Some(10_000));

        let mut total = 0;
        let mut last_ts = None;
        while let Some(packet) = demuxer.next_packet().unwrap() {
            assert!(last_ts.map_or(true, |ts| packet.timestamp > ts));
            last_ts = Some(packet.timestamp);
            total += packet.data.len() / 4;
        }
        assert_eq!(total, 10_000);
    }

    #[test]
    fn test_exact_seek() {
        let bytes = wav_bytes(1, 1, 16, 16_000);
        let stream = StreamHandle::new(Box::new(MemorySource::new(bytes)));
        let mut demuxer = WavDemuxer::new(stream, &DemuxOptions::default()).unwrap();
        let landed = demuxer.seek(Duration::from_millis(1250)).unwrap();
        assert_eq!(landed, Duration::from_millis(1250));
        assert_eq!(demuxer.next_packet().unwrap().unwrap().timestamp, 10_000);
    }

    #[test]
    fn test_unsupported_format_tag() {
        let bytes = wav_bytes(0x0055, 2, 16, 4);
        let stream = StreamHandle::new(Box::new(MemorySource::new(bytes)));
        assert!(matches!(
            WavDemuxer::new(stream, &DemuxOptions::default()),
            Err(PlaybackError::UnsupportedCodec(_))
        ));
    }

    #[test]
    fn test_truncated_header_is_fatal() {
        let bytes = wav_bytes(1, 2, 16, 4);
        let stream = StreamHandle::new(Box::new(MemorySource::new(bytes[..30].to_vec())));
        let err = WavDemuxer::new(stream, &DemuxOptions::default()).err().unwrap();
        assert!(matches!(
            err,
            PlaybackError::MalformedData {
                recoverable: false,
                ..
            }
        ));
    }
}
