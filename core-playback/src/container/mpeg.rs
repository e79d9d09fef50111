//! MPEG audio (Layer III) elementary stream demuxer.
//!
//! Leading ID3v2 tags are parsed for metadata and skipped. A frame header is
//! accepted only when the header that follows it is also valid (or the
//! stream ends exactly after the frame). A Xing/Info frame supplies the
//! frame count, a seek TOC and the LAME encoder delay.

use super::bytes::{be_u32, be_uint};
use super::tags::{parse_id3v2, Id3Header, MAX_TAG_BYTES};
use super::{discard_until, DemuxOptions, Demuxer, ResyncPolicy};
use crate::error::{PlaybackError, Result};
use crate::stream::StreamHandle;
use crate::types::{CodecId, CodecParameters, ContainerKind, ContainerMetadata, Packet};
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Decoder delay of a Layer III decoder, added to the LAME encoder delay.
const DECODER_DELAY: u32 = 529;
const SCAN_WINDOW: usize = 8 * 1024;
const ID3V1_LEN: usize = 128;

const BITRATES_V1: [u32; 15] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
const BITRATES_V2: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];
const SAMPLE_RATES_V1: [u32; 3] = [44_100, 48_000, 32_000];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MpegVersion {
    V1,
    V2,
    V25,
}

/// Decoded 4-byte Layer III frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub version: MpegVersion,
    pub bitrate_kbps: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_len: usize,
}

impl FrameHeader {
    pub(crate) fn parse(data: &[u8]) -> Option<Self> {
        let b = data.get(..4)?;
        if b[0] != 0xFF || b[1] & 0xE0 != 0xE0 {
            return None;
        }
        let version = match (b[1] >> 3) & 0x03 {
            0 => MpegVersion::V25,
            2 => MpegVersion::V2,
            3 => MpegVersion::V1,
            _ => return None,
        };
        // Layer III only.
        if (b[1] >> 1) & 0x03 != 0x01 {
            return None;
        }
        let bitrate_index = (b[2] >> 4) as usize;
        let rate_index = ((b[2] >> 2) & 0x03) as usize;
        if bitrate_index == 0 || bitrate_index == 15 || rate_index == 3 {
            return None;
        }
        let padding = ((b[2] >> 1) & 0x01) as usize;
        let channels = if b[3] >> 6 == 3 { 1 } else { 2 };

        let (bitrate_kbps, sample_rate) = match version {
            MpegVersion::V1 => (BITRATES_V1[bitrate_index], SAMPLE_RATES_V1[rate_index]),
            MpegVersion::V2 => (BITRATES_V2[bitrate_index], SAMPLE_RATES_V1[rate_index] / 2),
            MpegVersion::V25 => (BITRATES_V2[bitrate_index], SAMPLE_RATES_V1[rate_index] / 4),
        };
        let coefficient = if version == MpegVersion::V1 { 144 } else { 72 };
        let frame_len = (coefficient * bitrate_kbps * 1000 / sample_rate) as usize + padding;

        Some(Self {
            version,
            bitrate_kbps,
            sample_rate,
            channels,
            frame_len,
        })
    }

    pub(crate) fn samples_per_frame(&self) -> u64 {
        match self.version {
            MpegVersion::V1 => 1152,
            _ => 576,
        }
    }

    fn side_info_len(&self) -> usize {
        match (self.version, self.channels) {
            (MpegVersion::V1, 1) => 17,
            (MpegVersion::V1, _) => 32,
            (_, 1) => 9,
            _ => 17,
        }
    }

    /// Same stream parameters; bitrate and padding may differ.
    fn compatible(&self, other: &FrameHeader) -> bool {
        self.version == other.version
            && self.sample_rate == other.sample_rate
            && self.channels == other.channels
    }
}

/// Finds the first header at or after `from` that is confirmed by the next one.
fn find_confirmed(data: &[u8], from: usize, at_eof: bool) -> Option<(usize, FrameHeader)> {
    let mut i = from;
    while i + 4 <= data.len() {
        if let Some(header) = FrameHeader::parse(&data[i..]) {
            let next = i + header.frame_len;
            match data.get(next..next + 4) {
                Some(bytes) => {
                    if FrameHeader::parse(bytes).is_some_and(|n| header.compatible(&n)) {
                        return Some((i, header));
                    }
                }
                None if at_eof && next == data.len() => return Some((i, header)),
                None => {}
            }
        }
        i += 1;
    }
    None
}

pub fn probe(data: &[u8]) -> Option<u8> {
    let start = match Id3Header::parse(data) {
        // A large tag (cover art) can hide the first frame from the window.
        Some(id3) if id3.total_len() as usize >= data.len() => return Some(50),
        Some(id3) => id3.total_len() as usize,
        None => 0,
    };
    let has_id3 = start > 0;
    let body = &data[start..];
    let header = FrameHeader::parse(body)?;
    match body.get(header.frame_len..header.frame_len + 4) {
        Some(next) if FrameHeader::parse(next).is_some_and(|n| header.compatible(&n)) => {
            Some(if has_id3 { 95 } else { 90 })
        }
        Some(_) => None,
        // The window ends before the second header.
        None if has_id3 => Some(60),
        None => Some(40),
    }
}

pub fn open(stream: StreamHandle, options: &DemuxOptions) -> Result<Box<dyn Demuxer>> {
    Ok(Box::new(Mp3Demuxer::new(stream, options)?))
}

// ============================================================================
// Xing / LAME
// ============================================================================

#[derive(Debug, Clone, Default)]
struct XingInfo {
    frames: Option<u32>,
    bytes: Option<u32>,
    toc: Option<[u8; 100]>,
    encoder_delay: Option<u32>,
}

fn parse_xing(frame: &[u8], header: &FrameHeader) -> Option<XingInfo> {
    let offset = 4 + header.side_info_len();
    let tag = frame.get(offset..offset + 4)?;
    if tag != b"Xing" && tag != b"Info" {
        return None;
    }
    let flags = be_u32(frame, offset + 4)?;
    let mut pos = offset + 8;
    let mut info = XingInfo::default();
    if flags & 0x1 != 0 {
        info.frames = be_u32(frame, pos);
        pos += 4;
    }
    if flags & 0x2 != 0 {
        info.bytes = be_u32(frame, pos);
        pos += 4;
    }
    if flags & 0x4 != 0 {
        info.toc = frame.get(pos..pos + 100).and_then(|t| t.try_into().ok());
        pos += 100;
    }
    if flags & 0x8 != 0 {
        pos += 4;
    }
    // LAME extension: delay and padding packed as 12 + 12 bits at +21.
    if frame.get(pos..pos + 4) == Some(b"LAME".as_slice()) {
        info.encoder_delay = be_uint(frame, pos + 21, 3).map(|v| (v >> 12) as u32);
    }
    Some(info)
}

// ============================================================================
// Demuxer
// ============================================================================

pub struct Mp3Demuxer {
    stream: StreamHandle,
    params: CodecParameters,
    metadata: ContainerMetadata,
    /// Byte offset of the first audio frame.
    audio_start: u64,
    /// Bytes of audio, when the stream length is known.
    audio_len: Option<u64>,
    xing: Option<XingInfo>,
    first_header: FrameHeader,
    spf: u64,
    next_ts: u64,
    pending: Option<Packet>,
}

impl Mp3Demuxer {
    pub fn new(mut stream: StreamHandle, options: &DemuxOptions) -> Result<Self> {
        let mut metadata = ContainerMetadata::default();

        // ID3v2 tags may be stacked.
        loop {
            let head = stream.peek(10)?;
            let Some(id3) = Id3Header::parse(head) else {
                break;
            };
            stream.skip(10)?;
            let body_len = id3.total_len() - 10;
            if body_len <= MAX_TAG_BYTES {
                let body = stream.read_vec(body_len, options.max_allocation_bytes)?;
                metadata.merge(parse_id3v2(&id3, &body));
            } else {
                stream.check_size(body_len, u64::MAX)?;
                stream.skip(body_len)?;
            }
        }

        // Locate the first confirmed frame.
        let mut window = SCAN_WINDOW;
        let (offset, header) = loop {
            let data = stream.peek(window)?;
            let at_eof = data.len() < window;
            if let Some(found) = find_confirmed(data, 0, at_eof) {
                break found;
            }
            if at_eof || window >= 4 * SCAN_WINDOW {
                return Err(PlaybackError::malformed("no MPEG audio frame found"));
            }
            window *= 2;
        };
        stream.skip(offset as u64)?;
        stream.commit();

        let spf = header.samples_per_frame();
        let first = stream.peek(header.frame_len)?;
        let xing = parse_xing(first, &header);
        if xing.is_some() {
            stream.skip(header.frame_len as u64)?;
        }

        let audio_start = stream.position();
        let audio_len = stream.remaining();
        let total_ticks = match &xing {
            Some(XingInfo {
                frames: Some(frames),
                ..
            }) => Some(*frames as u64 * spf),
            _ => audio_len.map(|len| {
                len * 8 * header.sample_rate as u64 / (header.bitrate_kbps as u64 * 1000)
            }),
        };

        let mut params = CodecParameters::new(CodecId::Mp3, header.sample_rate, header.channels)
            .with_total_ticks(total_ticks);
        params.encoder_delay = xing
            .as_ref()
            .and_then(|x| x.encoder_delay)
            .map(|delay| delay + DECODER_DELAY)
            .unwrap_or(0);

        info!(
            sample_rate = header.sample_rate,
            channels = header.channels,
            bitrate_kbps = header.bitrate_kbps,
            xing = xing.is_some(),
            encoder_delay = params.encoder_delay,
            "Opened MP3 stream"
        );

        Ok(Self {
            stream,
            params,
            metadata,
            audio_start,
            audio_len,
            xing,
            first_header: header,
            spf,
            next_ts: 0,
            pending: None,
        })
    }

    fn read_frame(&mut self) -> Result<Option<Packet>> {
        let trailing_tag = self.stream.remaining() == Some(ID3V1_LEN as u64);
        let head = self.stream.peek(4)?;
        if head.is_empty() {
            return Ok(None);
        }
        if trailing_tag && head.starts_with(b"TAG") {
            self.stream.skip(ID3V1_LEN as u64)?;
            return Ok(None);
        }

        match FrameHeader::parse(head).filter(|h| h.compatible(&self.first_header)) {
            Some(header) => {
                let data = self.stream.peek(header.frame_len)?;
                if data.len() < header.frame_len {
                    let len = data.len();
                    self.stream.skip(len as u64)?;
                    return Err(PlaybackError::recoverable("truncated MPEG frame at end of stream"));
                }
                let data = Bytes::copy_from_slice(data);
                self.stream.skip(header.frame_len as u64)?;
                let packet = Packet::new(self.next_ts, data).with_duration(self.spf);
                self.next_ts += self.spf;
                Ok(Some(packet))
            }
            None => self.resync(),
        }
    }

    fn resync(&mut self) -> Result<Option<Packet>> {
        let start = self.stream.position();
        let mut window = SCAN_WINDOW;
        loop {
            let data = self.stream.peek(window)?;
            let at_eof = data.len() < window;
            let found = find_confirmed(data, 1, at_eof)
                .filter(|(_, h)| h.compatible(&self.first_header))
                .map(|(offset, _)| offset);
            match found {
                Some(offset) => {
                    self.stream.skip(offset as u64)?;
                    break;
                }
                None if at_eof => {
                    let len = data.len();
                    self.stream.skip(len as u64)?;
                    break;
                }
                None => {
                    // Keep the tail: a header may straddle the window edge.
                    self.stream.skip((window - SCAN_WINDOW / 2) as u64)?;
                    window = SCAN_WINDOW;
                }
            }
        }
        let skipped = self.stream.position() - start;
        warn!(offset = start, skipped, "Lost MPEG frame sync, resynchronized");
        Err(PlaybackError::recoverable(format!(
            "skipped {} bytes of invalid MPEG data at offset {}",
            skipped, start
        )))
    }

    /// Byte offset and tick estimate for `target` from the Xing TOC.
    fn toc_offset(&self, target: u64) -> Option<(u64, u64)> {
        let total = self.params.total_ticks.filter(|&t| t > 0)?;
        let XingInfo {
            toc: Some(toc),
            bytes,
            ..
        } = self.xing.as_ref()?
        else {
            return None;
        };
        let audio_bytes = bytes.map(|b| b as u64).or(self.audio_len)?;
        let percent = ((target as u128 * 100 / total as u128) as usize).min(99);
        let offset = toc[percent] as u64 * audio_bytes / 256;
        let ticks = percent as u64 * total / 100;
        Some((self.audio_start + offset, ticks))
    }

    /// Exact average frame size as `numerator / denominator` bytes.
    ///
    /// Padding slots make CBR frames one byte longer now and then, so frame
    /// `n` starts within a byte of `n * numerator / denominator`.
    fn cbr_frame_size(&self) -> (u128, u128) {
        let header = &self.first_header;
        (
            header.bitrate_kbps as u128 * 1000 * self.spf as u128,
            8 * header.sample_rate as u128,
        )
    }

    /// Byte offset of CBR frame `frame`, backed off so the scan that
    /// follows cannot start past the frame header.
    fn cbr_offset(&self, frame: u64) -> u64 {
        let (num, den) = self.cbr_frame_size();
        let offset = (frame as u128 * num / den) as u64;
        self.audio_start + offset.saturating_sub(2)
    }

    /// Index of the CBR frame starting at byte `position`.
    fn cbr_frame_index(&self, position: u64) -> u64 {
        let (num, den) = self.cbr_frame_size();
        let relative = position.saturating_sub(self.audio_start) as u128;
        ((relative * den * 2 + num) / (num * 2)) as u64
    }

    /// Moves onto the next frame header at or after the current position.
    fn align_to_frame(&mut self) -> Result<()> {
        let aligned = self
            .stream
            .peek(4)?
            .get(..4)
            .and_then(FrameHeader::parse)
            .is_some_and(|h| h.compatible(&self.first_header));
        if aligned {
            return Ok(());
        }
        match self.resync() {
            Err(err) if err.is_recoverable() => Ok(()),
            Err(err) => Err(err),
            Ok(_) => Ok(()),
        }
    }
}

impl Demuxer for Mp3Demuxer {
    fn kind(&self) -> ContainerKind {
        ContainerKind::Mp3
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
        let target_ticks = self.params.duration_to_ticks(target);
        self.pending = None;

        if let Some((offset, ticks)) = self.toc_offset(target_ticks) {
            debug!(offset, ticks, "MP3 seek from Xing TOC");
            self.stream.seek(offset)?;
            self.align_to_frame()?;
            self.next_ts = ticks;
        } else if self.xing.as_ref().and_then(|x| x.frames).is_none() {
            // Constant bitrate: the frame index follows from the byte offset.
            let offset = self.cbr_offset(target_ticks / self.spf);
            self.stream.seek(offset)?;
            self.align_to_frame()?;
            let frame = self.cbr_frame_index(self.stream.position());
            debug!(offset = self.stream.position(), frame, "MP3 constant bitrate seek");
            self.next_ts = frame * self.spf;
        } else {
            self.stream.seek(self.audio_start)?;
            self.next_ts = 0;
        }

        let landed = discard_until(target_ticks, || self.read_frame())?;
        let landed_ts = landed.as_ref().map(|p| p.timestamp).unwrap_or(self.next_ts);
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
