//! Native FLAC demuxer.
//!
//! FLAC frames carry no length field, so a frame ends where the next valid
//! frame header begins. A header is valid when its sync code, reserved bits
//! and CRC-8 check out; a frame is accepted when its CRC-16 footer matches.
//! Timestamps come straight from the frame headers.

use super::bytes::{be_u16, be_uint, crc16, crc8, BitReader};
use super::tags::{parse_id3v2, parse_vorbis_comment, Id3Header, MAX_TAG_BYTES};
use super::{discard_until, DemuxOptions, Demuxer, ResyncPolicy};
use crate::error::{PlaybackError, Result};
use crate::stream::StreamHandle;
use crate::types::{CodecId, CodecParameters, ContainerKind, ContainerMetadata, Packet};
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info, warn};

const BLOCK_STREAMINFO: u8 = 0;
const BLOCK_SEEKTABLE: u8 = 3;
const BLOCK_VORBIS_COMMENT: u8 = 4;

/// Longest possible frame header including CRC-8.
const MAX_HEADER_LEN: usize = 16;
const SCAN_WINDOW: usize = 16 * 1024;

pub fn probe(data: &[u8]) -> Option<u8> {
    let mut start = 0usize;
    if let Some(id3) = Id3Header::parse(data) {
        start = id3.total_len() as usize;
        if start + 4 > data.len() {
            return None;
        }
    }
    let rest = &data[start..];
    if rest.len() < 4 || &rest[..4] != b"fLaC" {
        return None;
    }
    // The first metadata block must be a 34-byte STREAMINFO.
    if rest.len() >= 8 {
        let block_type = rest[4] & 0x7F;
        let len = be_uint(rest, 5, 3)?;
        if block_type == BLOCK_STREAMINFO && len == 34 {
            return Some(100);
        }
        return Some(40);
    }
    Some(70)
}

pub fn open(stream: StreamHandle, options: &DemuxOptions) -> Result<Box<dyn Demuxer>> {
    Ok(Box::new(FlacDemuxer::new(stream, options)?))
}

// ============================================================================
// STREAMINFO & frame headers
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StreamInfo {
    pub min_block_size: u16,
    pub max_block_size: u16,
    pub max_frame_size: u32,
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
    pub total_samples: u64,
}

impl StreamInfo {
    pub(crate) fn parse(block: &[u8]) -> Result<Self> {
        if block.len() < 34 {
            return Err(PlaybackError::malformed("STREAMINFO shorter than 34 bytes"));
        }
        let short = || PlaybackError::malformed("truncated STREAMINFO");
        let mut bits = BitReader::new(&block[10..18]);
        let sample_rate = bits.read(20).ok_or_else(short)?;
        let channels = bits.read(3).ok_or_else(short)? as u8 + 1;
        let bits_per_sample = bits.read(5).ok_or_else(short)? as u8 + 1;
        let total_samples = bits.read_u64(36).ok_or_else(short)?;
        let info = Self {
            min_block_size: be_u16(block, 0).ok_or_else(short)?,
            max_block_size: be_u16(block, 2).ok_or_else(short)?,
            max_frame_size: be_uint(block, 7, 3).ok_or_else(short)? as u32,
            sample_rate,
            channels,
            bits_per_sample,
            total_samples,
        };
        if info.sample_rate == 0 || info.max_block_size < 16 {
            return Err(PlaybackError::malformed("STREAMINFO with invalid rate or block size"));
        }
        Ok(info)
    }

    pub(crate) fn to_params(&self, streaminfo: &[u8]) -> CodecParameters {
        let mut params = CodecParameters::new(CodecId::Flac, self.sample_rate, self.channels as u16)
            .with_total_ticks((self.total_samples > 0).then_some(self.total_samples))
            .with_extra_data(Bytes::copy_from_slice(&streaminfo[..34]));
        params.bits_per_sample = Some(self.bits_per_sample as u16);
        params
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub variable_block: bool,
    pub block_size: u32,
    /// Frame number (fixed blocking) or first sample number (variable).
    pub number: u64,
    pub len: usize,
}

impl FrameHeader {
    /// First sample of the frame.
    pub(crate) fn sample(&self, fixed_block_size: u32) -> u64 {
        if self.variable_block {
            self.number
        } else {
            self.number * fixed_block_size as u64
        }
    }
}

/// Parses and CRC-checks a frame header at the start of `data`.
pub(crate) fn parse_frame_header(data: &[u8]) -> Option<FrameHeader> {
    if data.len() < 6 || data[0] != 0xFF || data[1] & 0xFE != 0xF8 {
        return None;
    }
    let variable_block = data[1] & 0x01 == 1;
    let block_code = data[2] >> 4;
    let rate_code = data[2] & 0x0F;
    let channel_code = data[3] >> 4;
    let size_code = (data[3] >> 1) & 0x07;
    if block_code == 0 || rate_code == 0x0F || channel_code > 10 || size_code == 3 || data[3] & 1 != 0
    {
        return None;
    }

    // UTF-8 style coded number.
    let first = data[4];
    let extra = match first {
        0x00..=0x7F => 0,
        0xC0..=0xDF => 1,
        0xE0..=0xEF => 2,
        0xF0..=0xF7 => 3,
        0xF8..=0xFB => 4,
        0xFC..=0xFD => 5,
        0xFE => 6,
        _ => return None,
    };
    let mut number = match extra {
        0 => first as u64,
        6 => 0,
        n => (first & (0x7F >> (n + 1))) as u64,
    };
    let mut pos = 5usize;
    for _ in 0..extra {
        let byte = *data.get(pos)?;
        if byte & 0xC0 != 0x80 {
            return None;
        }
        number = (number << 6) | (byte & 0x3F) as u64;
        pos += 1;
    }

    let block_size = match block_code {
        1 => 192,
        2..=5 => 576 << (block_code - 2),
        6 => {
            pos += 1;
            *data.get(pos - 1)? as u32 + 1
        }
        7 => {
            pos += 2;
            be_u16(data, pos - 2)? as u32 + 1
        }
        _ => 256 << (block_code - 8),
    };
    pos += match rate_code {
        12 => 1,
        13 | 14 => 2,
        _ => 0,
    };

    let crc = *data.get(pos)?;
    if crc8(&data[..pos]) != crc {
        return None;
    }
    Some(FrameHeader {
        variable_block,
        block_size,
        number,
        len: pos + 1,
    })
}

#[derive(Debug, Clone, Copy)]
struct SeekPoint {
    sample: u64,
    offset: u64,
}

// ============================================================================
// Demuxer
// ============================================================================

pub struct FlacDemuxer {
    stream: StreamHandle,
    info: StreamInfo,
    params: CodecParameters,
    metadata: ContainerMetadata,
    seek_table: Vec<SeekPoint>,
    first_frame: u64,
    max_frame_len: usize,
    pending: Option<Packet>,
}

impl FlacDemuxer {
    pub fn new(mut stream: StreamHandle, options: &DemuxOptions) -> Result<Self> {
        let mut metadata = ContainerMetadata::default();

        let mut magic = stream.read_array::<4>()?;
        if &magic[..3] == b"ID3" {
            let mut header = [0u8; 10];
            header[..4].copy_from_slice(&magic);
            stream.read_exact(&mut header[4..])?;
            let id3 = Id3Header::parse(&header)
                .ok_or_else(|| PlaybackError::malformed("invalid ID3v2 header"))?;
            let body_len = id3.total_len() - 10;
            if body_len <= MAX_TAG_BYTES {
                let body = stream.read_vec(body_len, options.max_allocation_bytes)?;
                metadata.merge(parse_id3v2(&id3, &body));
            } else {
                stream.skip(body_len)?;
            }
            magic = stream.read_array::<4>()?;
        }
        if &magic != b"fLaC" {
            return Err(PlaybackError::malformed("missing fLaC marker"));
        }

        let mut info = None;
        let mut streaminfo_raw = Vec::new();
        let mut seek_table = Vec::new();
        loop {
            let header = stream.read_array::<4>()?;
            let last = header[0] & 0x80 != 0;
            let block_type = header[0] & 0x7F;
            let len = be_uint(&header, 1, 3).unwrap_or(0);
            match block_type {
                BLOCK_STREAMINFO => {
                    let block = stream.read_vec(len, options.max_allocation_bytes)?;
                    info = Some(StreamInfo::parse(&block)?);
                    streaminfo_raw = block;
                }
                BLOCK_SEEKTABLE => {
                    let block = stream.read_vec(len, options.max_allocation_bytes)?;
                    seek_table = parse_seek_table(&block);
                }
                BLOCK_VORBIS_COMMENT if len <= MAX_TAG_BYTES => {
                    let block = stream.read_vec(len, options.max_allocation_bytes)?;
                    metadata.merge(parse_vorbis_comment(&block));
                }
                127 => return Err(PlaybackError::malformed("invalid metadata block type 127")),
                _ => {
                    stream.check_size(len, u64::MAX)?;
                    stream.skip(len)?;
                }
            }
            if last {
                break;
            }
        }
        stream.commit();

        let info = info.ok_or_else(|| PlaybackError::malformed("missing STREAMINFO block"))?;
        let params = info.to_params(&streaminfo_raw);
        let first_frame = stream.position();
        let max_frame_len = if info.max_frame_size > 0 {
            info.max_frame_size as usize + MAX_HEADER_LEN
        } else {
            // Worst case for uncompressed subframes.
            (info.max_block_size as usize * info.channels as usize * (info.bits_per_sample as usize + 1))
                / 8
                + 64
        }
        .min(options.max_allocation_bytes as usize);

        info!(
            sample_rate = info.sample_rate,
            channels = info.channels,
            bits = info.bits_per_sample,
            block_sizes = ?(info.min_block_size, info.max_block_size),
            seek_points = seek_table.len(),
            "Opened FLAC stream"
        );

        Ok(Self {
            stream,
            info,
            params,
            metadata,
            seek_table,
            first_frame,
            max_frame_len,
            pending: None,
        })
    }

    /// Scans forward from `from` for the next valid frame header.
    ///
    /// Returns the offset relative to the current position, or the size of
    /// the searched window when nothing was found.
    fn find_header(&mut self, from: usize, limit: usize) -> Result<std::result::Result<usize, usize>> {
        let mut window = SCAN_WINDOW.min(limit).max(from + MAX_HEADER_LEN);
        loop {
            let data = self.stream.peek(window)?;
            let eof = data.len() < window;
            let mut i = from;
            while i + 1 < data.len() {
                if data[i] == 0xFF && data[i + 1] & 0xFE == 0xF8 {
                    let end = (i + MAX_HEADER_LEN).min(data.len());
                    if parse_frame_header(&data[i..end]).is_some() {
                        return Ok(Ok(i));
                    }
                }
                i += 1;
            }
            if eof || window >= limit {
                return Ok(Err(data.len()));
            }
            window = (window * 2).min(limit);
        }
    }

    fn read_frame(&mut self) -> Result<Option<Packet>> {
        let head = self.stream.peek(MAX_HEADER_LEN)?;
        if head.is_empty() {
            return Ok(None);
        }
        let Some(header) = parse_frame_header(head) else {
            return self.resync();
        };

        let limit = self.max_frame_len * 2;
        let mut search_from = header.len + 1;
        loop {
            match self.find_header(search_from, limit)? {
                Ok(next) => {
                    let data = self.stream.peek(next + MAX_HEADER_LEN)?;
                    if frame_crc_ok(&data[..next]) {
                        return self.emit(header, next);
                    }
                    let successor = parse_frame_header(&data[next..])
                        .is_some_and(|candidate| follows(&header, &candidate));
                    if successor {
                        self.stream.skip(next as u64)?;
                        warn!(frame = header.number, "FLAC frame CRC mismatch, frame dropped");
                        return Err(PlaybackError::recoverable("FLAC frame CRC mismatch"));
                    }
                    // The candidate may be a false sync inside this frame.
                    search_from = next + 1;
                }
                Err(searched) if searched < limit => {
                    // End of stream: the frame runs to the end.
                    let data = self.stream.peek(searched)?;
                    if frame_crc_ok(data) {
                        return self.emit(header, searched);
                    }
                    self.stream.skip(searched as u64)?;
                    return Err(PlaybackError::recoverable(
                        "FLAC frame CRC mismatch at end of stream",
                    ));
                }
                Err(_) => {
                    // No frame boundary within the longest legal frame.
                    self.stream.skip(1)?;
                    return Err(PlaybackError::recoverable("FLAC frame exceeds maximum size"));
                }
            }
        }
    }

    fn emit(&mut self, header: FrameHeader, len: usize) -> Result<Option<Packet>> {
        let data = Bytes::copy_from_slice(self.stream.peek(len)?);
        self.stream.skip(len as u64)?;
        let timestamp = header.sample(self.info.max_block_size as u32);
        Ok(Some(
            Packet::new(timestamp, data).with_duration(header.block_size as u64),
        ))
    }

    fn resync(&mut self) -> Result<Option<Packet>> {
        let start = self.stream.position();
        let limit = self.max_frame_len.max(SCAN_WINDOW) * 4;
        loop {
            match self.find_header(1, limit)? {
                Ok(offset) => {
                    self.stream.skip(offset as u64)?;
                    break;
                }
                Err(searched) if searched < limit => {
                    self.stream.skip(searched as u64)?;
                    break;
                }
                Err(searched) => {
                    self.stream.skip(searched.saturating_sub(MAX_HEADER_LEN) as u64)?;
                }
            }
        }
        let skipped = self.stream.position() - start;
        warn!(offset = start, skipped, "Lost FLAC frame sync, resynchronized");
        Err(PlaybackError::recoverable(format!(
            "skipped {} bytes of invalid FLAC data at offset {}",
            skipped, start
        )))
    }
}

fn follows(current: &FrameHeader, next: &FrameHeader) -> bool {
    if current.variable_block != next.variable_block {
        return false;
    }
    if current.variable_block {
        next.number == current.number + current.block_size as u64
    } else {
        next.number == current.number + 1
    }
}

fn frame_crc_ok(frame: &[u8]) -> bool {
    if frame.len() < 2 {
        return false;
    }
    let (body, footer) = frame.split_at(frame.len() - 2);
    crc16(body) == u16::from_be_bytes([footer[0], footer[1]])
}

fn parse_seek_table(block: &[u8]) -> Vec<SeekPoint> {
    let mut points: Vec<SeekPoint> = block
        .chunks_exact(18)
        .filter_map(|p| {
            let sample = be_uint(p, 0, 8)?;
            let offset = be_uint(p, 8, 8)?;
            (sample != u64::MAX).then_some(SeekPoint { sample, offset })
        })
        .collect();
    points.sort_by_key(|p| p.sample);
    points
}

impl Demuxer for FlacDemuxer {
    fn kind(&self) -> ContainerKind {
        ContainerKind::Flac
    }

    fn codec_parameters(&self) -> &CodecParameters {
        &self.params
    }

    fn metadata(&self) -> &ContainerMetadata {
        &self.metadata
    }

    fn next_packet(&mut self) -> Result<Option<Packet>> {
        if let Some(packet) = self.pending.take() {
            return Ok(Some(packet));
        }
        self.read_frame()
    }

    fn seek(&mut self, target: Duration) -> Result<Duration> {
        let target_sample = self.params.duration_to_ticks(target);
        self.pending = None;

        let index = self
            .seek_table
            .partition_point(|p| p.sample <= target_sample)
            .checked_sub(1)
            .map(|i| self.seek_table[i]);
        let offset = match index {
            Some(point) => {
                debug!(sample = point.sample, offset = point.offset, "FLAC seek point");
                self.first_frame + point.offset
            }
            None => self.first_frame,
        };
        self.stream.seek(offset)?;

        let landed = discard_until(target_sample, || self.read_frame())?;
        let landed_ts = match &landed {
            Some(packet) => packet.timestamp,
            None => self.params.total_ticks.unwrap_or(target_sample),
        };
        self.pending = landed;
        Ok(self.params.ticks_to_duration(landed_ts))
    }

    fn can_seek(&self) -> bool {
        self.stream.is_seekable()
    }

    fn resync_policy(&self) -> ResyncPolicy {
        ResyncPolicy::Resync
    }

    fn stream_mut(&mut self) -> &mut StreamHandle {
        &mut self.stream
    }
}
