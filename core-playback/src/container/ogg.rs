//! Ogg demuxer for the Opus, Vorbis and FLAC mappings.
//!
//! Pages are CRC-checked; packets are reassembled across pages for the
//! first logical stream carrying a supported codec. Other logical streams
//! are ignored.
//!
//! Packet timestamps are derived from page granule positions:
//!
//! - Opus: per-packet durations from the TOC byte, counted from the
//!   previous page's granule.
//! - Vorbis: every packet on a page is stamped with the previous page's
//!   granule; the executor's timestamp tracker spreads them out.
//! - FLAC: the sample number in each frame header.

use super::bytes::{crc32_ogg_update, le_u16, le_u32, le_u64};
use super::flac::{parse_frame_header, StreamInfo};
use super::tags::{parse_vorbis_comment, q78_to_db};
use super::{discard_until, DemuxOptions, Demuxer, ResyncPolicy};
use crate::error::{PlaybackError, Result};
use crate::stream::StreamHandle;
use crate::types::{
    CodecId, CodecParameters, ContainerKind, ContainerMetadata, Packet, ReplayGain,
};
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

const CAPTURE: &[u8; 4] = b"OggS";
const PAGE_HEADER_LEN: usize = 27;
const MAX_PAGE_HEADER_LEN: usize = PAGE_HEADER_LEN + 255;
const SCAN_WINDOW: usize = 16 * 1024;
/// Byte range at which bisection stops and linear discarding takes over.
const BISECT_MIN: u64 = 64 * 1024;
/// Tail scanned for the final granule position.
const TAIL_SCAN: u64 = 128 * 1024;
const OPUS_RATE: u32 = 48_000;

const FLAG_CONTINUED: u8 = 0x01;
const FLAG_BOS: u8 = 0x02;
const FLAG_EOS: u8 = 0x04;

// ============================================================================
// Pages
// ============================================================================

#[derive(Debug, Clone)]
struct Page {
    flags: u8,
    /// `None` when no packet ends on this page.
    granule: Option<u64>,
    serial: u32,
    lacing: Vec<u8>,
    body: Bytes,
}

impl Page {
    fn is_continued(&self) -> bool {
        self.flags & FLAG_CONTINUED != 0
    }

    fn is_bos(&self) -> bool {
        self.flags & FLAG_BOS != 0
    }

    fn is_eos(&self) -> bool {
        self.flags & FLAG_EOS != 0
    }

    /// First packet of the page, when it is complete on this page.
    fn first_packet(&self) -> Option<&[u8]> {
        let mut len = 0usize;
        for &lace in &self.lacing {
            len += lace as usize;
            if lace < 255 {
                return self.body.get(..len);
            }
        }
        None
    }
}

/// Header and body length of the page at the start of `data`.
fn page_lengths(data: &[u8]) -> Option<(usize, usize)> {
    if data.len() < PAGE_HEADER_LEN || &data[..4] != CAPTURE || data[4] != 0 {
        return None;
    }
    let segments = data[26] as usize;
    let lacing = data.get(PAGE_HEADER_LEN..PAGE_HEADER_LEN + segments)?;
    let body: usize = lacing.iter().map(|&l| l as usize).sum();
    Some((PAGE_HEADER_LEN + segments, body))
}

fn page_crc_ok(page: &[u8]) -> bool {
    let Some(stored) = le_u32(page, 22) else {
        return false;
    };
    let crc = crc32_ogg_update(0, &page[..22]);
    let crc = crc32_ogg_update(crc, &[0; 4]);
    let crc = crc32_ogg_update(crc, &page[26..]);
    crc == stored
}

fn parse_page(data: &[u8], header_len: usize) -> Option<Page> {
    let granule = le_u64(data, 6)?;
    Some(Page {
        flags: data[5],
        granule: (granule != u64::MAX).then_some(granule),
        serial: le_u32(data, 14)?,
        lacing: data[PAGE_HEADER_LEN..header_len].to_vec(),
        body: Bytes::copy_from_slice(&data[header_len..]),
    })
}

/// Pulls CRC-checked pages from the stream and reassembles packets.
struct PageReader {
    stream: StreamHandle,
    partial: Vec<u8>,
    max_packet: u64,
}

impl PageReader {
    /// Validates the page at the cursor; returns its total length.
    fn page_at_cursor(&mut self) -> Result<Option<(usize, usize)>> {
        let head = self.stream.peek(MAX_PAGE_HEADER_LEN)?;
        let Some((header_len, body_len)) = page_lengths(head) else {
            return Ok(None);
        };
        let total = header_len + body_len;
        let page = self.stream.peek(total)?;
        if page.len() < total || !page_crc_ok(page) {
            return Ok(None);
        }
        Ok(Some((header_len, total)))
    }

    fn read_page(&mut self) -> Result<Option<Page>> {
        if self.stream.peek(1)?.is_empty() {
            return Ok(None);
        }
        match self.page_at_cursor()? {
            Some((header_len, total)) => {
                let data = self.stream.peek(total)?;
                let page = parse_page(data, header_len)
                    .ok_or_else(|| PlaybackError::malformed("truncated Ogg page"))?;
                self.stream.skip(total as u64)?;
                Ok(Some(page))
            }
            None => {
                let start = self.stream.position();
                self.stream.skip(1)?;
                self.sync()?;
                self.partial.clear();
                let skipped = self.stream.position() - start;
                warn!(offset = start, skipped, "Lost Ogg page sync, resynchronized");
                Err(PlaybackError::recoverable(format!(
                    "skipped {} bytes of invalid Ogg data at offset {}",
                    skipped, start
                )))
            }
        }
    }

    /// Moves to the next valid page; returns false at end of stream.
    fn sync(&mut self) -> Result<bool> {
        loop {
            let data = self.stream.peek(SCAN_WINDOW)?;
            let at_eof = data.len() < SCAN_WINDOW;
            let found = data.windows(4).position(|w| w == CAPTURE);
            match found {
                Some(offset) => {
                    self.stream.skip(offset as u64)?;
                    if self.page_at_cursor()?.is_some() {
                        return Ok(true);
                    }
                    self.stream.skip(1)?;
                }
                None if at_eof => {
                    let len = data.len();
                    self.stream.skip(len as u64)?;
                    return Ok(false);
                }
                None => {
                    let advance = data.len() - 3;
                    self.stream.skip(advance as u64)?;
                }
            }
        }
    }

    /// Completed packets of `page`. A continued packet whose start was not
    /// seen is dropped.
    fn assemble(&mut self, page: &Page) -> Result<Vec<Bytes>> {
        let drop_first = page.is_continued() && self.partial.is_empty();
        if !page.is_continued() {
            self.partial.clear();
        }
        let mut packets = Vec::new();
        let mut offset = 0usize;
        let mut in_first = true;
        for &lace in &page.lacing {
            let segment = &page.body[offset..offset + lace as usize];
            offset += lace as usize;
            let keep = !(drop_first && in_first);
            if keep {
                self.partial.extend_from_slice(segment);
                if self.partial.len() as u64 > self.max_packet {
                    self.partial.clear();
                    return Err(PlaybackError::AllocationLimit {
                        requested: self.max_packet + 1,
                        limit: self.max_packet,
                    });
                }
            }
            if lace < 255 {
                if keep {
                    packets.push(Bytes::from(std::mem::take(&mut self.partial)));
                }
                in_first = false;
            }
        }
        Ok(packets)
    }
}

// ============================================================================
// Codec mappings
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mapping {
    Opus,
    Vorbis,
    /// Number of metadata header packets after the first, 0 if unknown.
    Flac { header_packets: u16 },
}

impl Mapping {
    fn identify(packet: &[u8]) -> Option<Self> {
        if packet.starts_with(b"OpusHead") && packet.len() >= 19 {
            Some(Mapping::Opus)
        } else if packet.starts_with(b"\x01vorbis") && packet.len() >= 30 {
            Some(Mapping::Vorbis)
        } else if packet.starts_with(b"\x7FFLAC") && packet.len() >= 51 {
            Some(Mapping::Flac {
                header_packets: u16::from_be_bytes([packet[7], packet[8]]),
            })
        } else {
            None
        }
    }

    /// Whether `packet`, the `index`-th packet of the stream, is a header.
    fn is_header(&self, index: usize, packet: &[u8]) -> bool {
        match self {
            Mapping::Opus => index < 2,
            Mapping::Vorbis => index < 3,
            Mapping::Flac { header_packets: 0 } => index == 0 || packet.first() != Some(&0xFF),
            Mapping::Flac { header_packets } => index <= *header_packets as usize,
        }
    }
}

/// Samples (at 48 kHz) in an Opus packet, from its TOC byte.
pub(crate) fn opus_packet_samples(packet: &[u8]) -> Option<u64> {
    let toc = *packet.first()?;
    let config = toc >> 3;
    let frame = match config {
        0..=11 => [480, 960, 1920, 2880][(config % 4) as usize],
        12..=15 => [480, 960][(config % 2) as usize],
        _ => [120, 240, 480, 960][(config % 4) as usize],
    };
    let frames = match toc & 0x03 {
        0 => 1,
        1 | 2 => 2,
        _ => (*packet.get(1)? & 0x3F) as u64,
    };
    Some(frame * frames)
}

pub fn probe(data: &[u8]) -> Option<u8> {
    if !data.starts_with(CAPTURE) {
        return None;
    }
    let known_codec = page_lengths(data)
        .and_then(|(header_len, _)| parse_page(data, header_len))
        .filter(|page| page.is_bos())
        .and_then(|page| page.first_packet().and_then(Mapping::identify))
        .is_some();
    Some(if known_codec { 100 } else { 60 })
}

pub fn open(stream: StreamHandle, options: &DemuxOptions) -> Result<Box<dyn Demuxer>> {
    Ok(Box::new(OggDemuxer::new(stream, options)?))
}

// ============================================================================
// Demuxer
// ============================================================================

pub struct OggDemuxer {
    reader: PageReader,
    mapping: Mapping,
    serial: u32,
    params: CodecParameters,
    metadata: ContainerMetadata,
    /// Fixed FLAC block size used to turn frame numbers into samples.
    flac_block_size: u32,
    data_start: u64,
    queue: VecDeque<Packet>,
    prev_granule: Option<u64>,
    ended: bool,
}

impl OggDemuxer {
    pub fn new(stream: StreamHandle, options: &DemuxOptions) -> Result<Self> {
        let mut reader = PageReader {
            stream,
            partial: Vec::new(),
            max_packet: options.max_allocation_bytes,
        };

        // Beginning-of-stream pages come first, one per logical stream.
        let mut selected: Option<(u32, Mapping, Page)> = None;
        let mut held = VecDeque::new();
        while let Some(page) = reader.read_page()? {
            if !page.is_bos() {
                held.push_back(page);
                break;
            }
            if selected.is_none() {
                if let Some(mapping) = page.first_packet().and_then(Mapping::identify) {
                    selected = Some((page.serial, mapping, page));
                    continue;
                }
            }
            debug!(serial = page.serial, "Ignoring Ogg logical stream");
        }
        let (serial, mapping, bos) = selected.ok_or_else(|| {
            PlaybackError::UnsupportedCodec("Ogg stream without Opus, Vorbis or FLAC".into())
        })?;
        held.push_front(bos);

        let mut headers: Vec<Bytes> = Vec::new();
        let mut leftover: Vec<Bytes> = Vec::new();
        let mut leftover_granule = None;
        let needed = match mapping {
            Mapping::Opus => Some(2),
            Mapping::Vorbis => Some(3),
            Mapping::Flac { header_packets: 0 } => None,
            Mapping::Flac { header_packets } => Some(header_packets as usize + 1),
        };
        loop {
            let done = match needed {
                Some(count) => headers.len() >= count,
                None => !leftover.is_empty(),
            };
            if done {
                break;
            }
            let page = match held.pop_front() {
                Some(page) => page,
                None => match reader.read_page()? {
                    Some(page) => page,
                    None => break,
                },
            };
            if page.serial != serial {
                continue;
            }
            for packet in reader.assemble(&page)? {
                if leftover.is_empty() && mapping.is_header(headers.len(), &packet) {
                    headers.push(packet);
                } else {
                    leftover.push(packet);
                }
            }
            if !leftover.is_empty() {
                leftover_granule = page.granule;
            }
        }
        reader.stream.commit();
        let data_start = reader.stream.position();

        let (params, metadata, flac_block_size) = Self::parse_headers(mapping, &headers)?;

        let mut demuxer = Self {
            reader,
            mapping,
            serial,
            params,
            metadata,
            flac_block_size,
            data_start,
            queue: VecDeque::new(),
            prev_granule: Some(0),
            ended: false,
        };

        if demuxer.params.total_ticks.is_none() && demuxer.reader.stream.is_seekable() {
            demuxer.params.total_ticks = demuxer.last_granule()?;
            demuxer.reader.stream.seek(data_start)?;
            demuxer.reader.partial.clear();
        }
        if !leftover.is_empty() {
            demuxer.stamp(leftover, leftover_granule);
        }

        info!(
            codec = %demuxer.params.codec,
            serial,
            sample_rate = demuxer.params.sample_rate,
            channels = demuxer.params.channels,
            "Opened Ogg stream"
        );
        Ok(demuxer)
    }

    fn parse_headers(
        mapping: Mapping,
        headers: &[Bytes],
    ) -> Result<(CodecParameters, ContainerMetadata, u32)> {
        let missing = || PlaybackError::malformed("missing Ogg codec header packets");
        let first = headers.first().ok_or_else(missing)?;
        let mut metadata = ContainerMetadata::default();

        match mapping {
            Mapping::Opus => {
                let channels = first[9] as u16;
                let pre_skip = le_u16(first, 10).ok_or_else(missing)?;
                let gain = le_u16(first, 16).ok_or_else(missing)? as i16;
                if channels == 0 {
                    return Err(PlaybackError::malformed("OpusHead with zero channels"));
                }
                if let Some(tags) = headers.get(1).filter(|p| p.starts_with(b"OpusTags")) {
                    metadata = parse_vorbis_comment(&tags[8..]);
                }
                if gain != 0 {
                    let header_gain = ReplayGain {
                        track_gain_db: q78_to_db(gain),
                    };
                    metadata.replay_gain = Some(match metadata.replay_gain {
                        Some(tag) => tag.combine(header_gain),
                        None => header_gain,
                    });
                }
                let mut params = CodecParameters::new(CodecId::Opus, OPUS_RATE, channels)
                    .with_extra_data(first.clone());
                params.encoder_delay = pre_skip as u32;
                Ok((params, metadata, 0))
            }
            Mapping::Vorbis => {
                let channels = first[11] as u16;
                let rate = le_u32(first, 12).ok_or_else(missing)?;
                if channels == 0 || rate == 0 {
                    return Err(PlaybackError::malformed("invalid Vorbis identification header"));
                }
                if let Some(comment) = headers.get(1).filter(|p| p.starts_with(b"\x03vorbis")) {
                    metadata = parse_vorbis_comment(&comment[7..]);
                }
                let setup = headers
                    .get(2)
                    .filter(|p| p.starts_with(b"\x05vorbis"))
                    .ok_or_else(|| PlaybackError::malformed("missing Vorbis setup header"))?;
                let mut extra = Vec::with_capacity(first.len() + setup.len());
                extra.extend_from_slice(first);
                extra.extend_from_slice(setup);
                let params =
                    CodecParameters::new(CodecId::Vorbis, rate, channels).with_extra_data(extra);
                Ok((params, metadata, 0))
            }
            Mapping::Flac { .. } => {
                let info = StreamInfo::parse(&first[17..])?;
                for block in &headers[1..] {
                    if block.first().map(|b| b & 0x7F) == Some(4) && block.len() > 4 {
                        metadata = parse_vorbis_comment(&block[4..]);
                    }
                }
                let params = info.to_params(&first[17..]);
                Ok((params, metadata, info.max_block_size as u32))
            }
        }
    }

    /// Granule of the last page of the selected stream.
    fn last_granule(&mut self) -> Result<Option<u64>> {
        let Some(length) = self.reader.stream.length() else {
            return Ok(None);
        };
        let start = length.saturating_sub(TAIL_SCAN).max(self.data_start);
        self.reader.stream.seek(start)?;
        let mut last = None;
        while self.reader.sync()? {
            match self.reader.read_page() {
                Ok(Some(page)) => {
                    if page.serial == self.serial && page.granule.is_some() {
                        last = page.granule;
                    }
                }
                Ok(None) => break,
                Err(err) if err.is_recoverable() => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(last)
    }

    /// Converts the packets completed on one page into timestamped packets.
    fn stamp(&mut self, packets: Vec<Bytes>, granule: Option<u64>) {
        match self.mapping {
            Mapping::Opus => {
                let durations: Vec<u64> = packets
                    .iter()
                    .map(|p| opus_packet_samples(p).unwrap_or(0))
                    .collect();
                let total: u64 = durations.iter().sum();
                let mut ts = match (self.prev_granule, granule) {
                    (Some(prev), _) => prev,
                    (None, Some(end)) => end.saturating_sub(total),
                    (None, None) => 0,
                };
                for (data, duration) in packets.into_iter().zip(durations) {
                    self.queue
                        .push_back(Packet::new(ts, data).with_duration(duration));
                    ts += duration;
                }
            }
            Mapping::Vorbis => {
                let ts = self.prev_granule.or(granule).unwrap_or(0);
                for data in packets {
                    self.queue.push_back(Packet::new(ts, data));
                }
            }
            Mapping::Flac { .. } => {
                let mut fallback = self.prev_granule.unwrap_or(0);
                for data in packets {
                    let packet = match parse_frame_header(&data) {
                        Some(header) => {
                            let ts = header.sample(self.flac_block_size);
                            fallback = ts + header.block_size as u64;
                            Packet::new(ts, data).with_duration(header.block_size as u64)
                        }
                        None => Packet::new(fallback, data),
                    };
                    self.queue.push_back(packet);
                }
            }
        }
        if granule.is_some() {
            self.prev_granule = granule;
        }
    }

    /// Reads pages until at least one packet is queued or the stream ends.
    fn fill_queue(&mut self) -> Result<()> {
        while self.queue.is_empty() && !self.ended {
            let Some(page) = self.reader.read_page()? else {
                self.ended = true;
                break;
            };
            if page.serial != self.serial {
                continue;
            }
            let packets = self.reader.assemble(&page)?;
            self.stamp(packets, page.granule);
            if page.is_eos() {
                self.ended = true;
            }
        }
        Ok(())
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        self.fill_queue()?;
        Ok(self.queue.pop_front())
    }

    /// Granule and start offset of the first page of the selected stream at
    /// or after `offset`.
    fn granule_after(&mut self, offset: u64) -> Result<Option<(u64, u64)>> {
        self.reader.stream.seek(offset)?;
        while self.reader.sync()? {
            let page_start = self.reader.stream.position();
            if page_start > offset + TAIL_SCAN {
                return Ok(None);
            }
            match self.reader.read_page() {
                Ok(Some(page)) if page.serial == self.serial => {
                    if let Some(granule) = page.granule {
                        return Ok(Some((page_start, granule)));
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => return Ok(None),
                Err(err) if err.is_recoverable() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }
}

impl Demuxer for OggDemuxer {
    fn kind(&self) -> ContainerKind {
        ContainerKind::Ogg
    }

    fn codec_parameters(&self) -> &CodecParameters {
        &self.params
    }

    fn metadata(&self) -> &ContainerMetadata {
        &self.metadata
    }

    fn next_packet(&mut self) -> Result<Option<Packet>> {
        self.read_packet()
    }

    fn seek(&mut self, target: Duration) -> Result<Duration> {
        let target_ticks = self.params.duration_to_ticks(target);
        self.queue.clear();
        self.ended = false;
        self.reader.partial.clear();

        let mut lo = self.data_start;
        if let Some(mut hi) = self.reader.stream.length() {
            while hi.saturating_sub(lo) > BISECT_MIN {
                let mid = lo + (hi - lo) / 2;
                match self.granule_after(mid)? {
                    Some((page_start, granule)) if granule < target_ticks => lo = page_start,
                    _ => hi = mid,
                }
            }
        }
        debug!(offset = lo, target = target_ticks, "Ogg bisection finished");

        self.reader.stream.seek(lo)?;
        self.reader.partial.clear();
        if lo == self.data_start {
            self.prev_granule = Some(0);
        } else {
            // Packets on the page at `lo` end before the target; use the
            // page only to re-establish the granule position.
            self.prev_granule = None;
            while self.prev_granule.is_none() {
                match self.reader.read_page() {
                    Ok(Some(page)) if page.serial == self.serial => {
                        self.reader.assemble(&page)?;
                        self.prev_granule = page.granule;
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(err) if err.is_recoverable() => {}
                    Err(err) => return Err(err),
                }
            }
        }

        let landed = discard_until(target_ticks, || self.read_packet())?;
        let landed_ts = match &landed {
            Some(packet) => packet.timestamp,
            None => self.prev_granule.unwrap_or(target_ticks),
        };
        if let Some(packet) = landed {
            self.queue.push_front(packet);
        }
        Ok(self.params.ticks_to_duration(landed_ts))
    }

    fn can_seek(&self) -> bool {
        self.reader.stream.is_seekable()
    }

    fn resync_policy(&self) -> ResyncPolicy {
        ResyncPolicy::Resync
    }

    fn stream_mut(&mut self) -> &mut StreamHandle {
        &mut self.reader.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::bytes::crc32_ogg;
    use crate::stream::MemorySource;

    fn raw_page(serial: u32, seq: u32, flags: u8, granule: u64, lacing: &[u8], body: &[u8]) -> Vec<u8> {
        let mut data = b"OggS".to_vec();
        data.push(0);
        data.push(flags);
        data.extend_from_slice(&granule.to_le_bytes());
        data.extend_from_slice(&serial.to_le_bytes());
        data.extend_from_slice(&seq.to_le_bytes());
        data.extend_from_slice(&[0; 4]);
        data.push(lacing.len() as u8);
        data.extend_from_slice(lacing);
        data.extend_from_slice(body);
        let crc = crc32_ogg(&data);
        data[22..26].copy_from_slice(&crc.to_le_bytes());
        data
    }

    fn page(serial: u32, seq: u32, flags: u8, granule: u64, packets: &[&[u8]]) -> Vec<u8> {
        let mut lacing = Vec::new();
        let mut body = Vec::new();
        for packet in packets {
            let mut len = packet.len();
            while len >= 255 {
                lacing.push(255u8);
                len -= 255;
            }
            lacing.push(len as u8);
            body.extend_from_slice(packet);
        }
        raw_page(serial, seq, flags, granule, &lacing, &body)
    }

    fn opus_head(pre_skip: u16) -> Vec<u8> {
        let mut head = b"OpusHead".to_vec();
        head.push(1);
        head.push(2);
        head.extend_from_slice(&pre_skip.to_le_bytes());
        head.extend_from_slice(&48_000u32.to_le_bytes());
        head.extend_from_slice(&0i16.to_le_bytes());
        head.push(0);
        head
    }

    fn opus_tags() -> Vec<u8> {
        let mut tags = b"OpusTags".to_vec();
        tags.extend_from_slice(&4u32.to_le_bytes());
        tags.extend_from_slice(b"test");
        tags.extend_from_slice(&1u32.to_le_bytes());
        let title = b"TITLE=Ogg Song";
        tags.extend_from_slice(&(title.len() as u32).to_le_bytes());
        tags.extend_from_slice(title);
        tags
    }

    /// 20 ms CELT packet (config 31, one frame).
    fn opus_packet() -> Vec<u8> {
        let mut packet = vec![0xF8];
        packet.resize(200, 0xAA);
        packet
    }

    fn header_pages(serial: u32, pre_skip: u16) -> Vec<u8> {
        let mut data = page(serial, 0, FLAG_BOS, 0, &[&opus_head(pre_skip)]);
        data.extend(page(serial, 1, 0, 0, &[&opus_tags()]));
        data
    }

    fn audio_page(index: usize, last: bool) -> Vec<u8> {
        let packet = opus_packet();
        let flags = if last { FLAG_EOS } else { 0 };
        let granule = (index as u64 + 1) * 5 * 960;
        page(7, 2 + index as u32, flags, granule, &[packet.as_slice(); 5])
    }

    fn opus_file(pages: usize) -> Vec<u8> {
        let mut data = header_pages(7, 312);
        for i in 0..pages {
            data.extend(audio_page(i, i + 1 == pages));
        }
        data
    }

    fn demuxer(data: Vec<u8>) -> OggDemuxer {
        let stream = StreamHandle::new(Box::new(MemorySource::new(data)));
        OggDemuxer::new(stream, &DemuxOptions::default()).unwrap()
    }

    #[test]
    fn test_opus_packet_samples() {
        assert_eq!(opus_packet_samples(&[0xF8]), Some(960));
        assert_eq!(opus_packet_samples(&[0x08]), Some(960));
        assert_eq!(opus_packet_samples(&[0xF9]), Some(1920));
        assert_eq!(opus_packet_samples(&[0xFB, 0x03]), Some(2880));
        assert_eq!(opus_packet_samples(&[]), None);
    }

    #[test]
    fn test_probe() {
        let data = page(7, 0, FLAG_BOS, 0, &[&opus_head(312)]);
        assert_eq!(probe(&data), Some(100));
        assert_eq!(probe(&page(7, 0, FLAG_BOS, 0, &[b"unknown codec"])), Some(60));
        assert_eq!(probe(b"RIFF"), None);
    }

    #[test]
    fn test_unknown_codec_rejected() {
        let data = page(7, 0, FLAG_BOS, 0, &[b"\x80theora-ish"]);
        let stream = StreamHandle::new(Box::new(MemorySource::new(data)));
        let err = OggDemuxer::new(stream, &DemuxOptions::default()).err().unwrap();
        assert!(matches!(err, PlaybackError::UnsupportedCodec(_)));
    }

    #[test]
    fn test_opus_headers_and_timestamps() {
        let mut demuxer = demuxer(opus_file(3));
        let params = demuxer.codec_parameters().clone();
        assert_eq!(params.codec, CodecId::Opus);
        assert_eq!(params.sample_rate, 48_000);
        assert_eq!(params.channels, 2);
        assert_eq!(params.encoder_delay, 312);
        assert_eq!(params.total_ticks, Some(15 * 960));
        assert_eq!(demuxer.metadata().title.as_deref(), Some("Ogg Song"));

        let mut stamps = Vec::new();
        while let Some(packet) = demuxer.next_packet().unwrap() {
            assert_eq!(packet.duration, Some(960));
            stamps.push(packet.timestamp);
        }
        let expected: Vec<u64> = (0..15).map(|i| i * 960).collect();
        assert_eq!(stamps, expected);
    }

    #[test]
    fn test_packet_spanning_pages() {
        let big = vec![0xF8u8; 600];
        let mut data = header_pages(3, 0);
        data.extend(raw_page(3, 2, 0, u64::MAX, &[255, 255], &big[..510]));
        data.extend(page(3, 3, FLAG_CONTINUED | FLAG_EOS, 960, &[&big[510..]]));

        let mut demuxer = demuxer(data);
        let packet = demuxer.next_packet().unwrap().unwrap();
        assert_eq!(packet.data.len(), 600);
        assert!(demuxer.next_packet().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_page_reported_once() {
        let mut data = opus_file(3);
        let offset = header_pages(7, 312).len() + audio_page(0, false).len() + 100;
        data[offset] ^= 0xFF;

        let mut demuxer = demuxer(data);
        let mut packets = 0;
        let mut errors = 0;
        loop {
            match demuxer.next_packet() {
                Ok(Some(_)) => packets += 1,
                Ok(None) => break,
                Err(err) => {
                    assert!(err.is_recoverable());
                    errors += 1;
                }
            }
        }
        assert_eq!(errors, 1);
        assert_eq!(packets, 10);
    }

    #[test]
    fn test_bisection_seek() {
        let mut demuxer = demuxer(opus_file(400));
        let target = Duration::from_millis(30_010);
        let landed = demuxer.seek(target).unwrap();
        let packet = demuxer.next_packet().unwrap().unwrap();
        assert_eq!(demuxer.codec_parameters().ticks_to_duration(packet.timestamp), landed);
        assert!(landed >= target);
        assert!(landed - target <= Duration::from_millis(20));
    }
}
