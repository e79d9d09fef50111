//! Matroska / WebM demuxer.
//!
//! Segment-level metadata (Info, Tracks, Tags, SeekHead) is read up to the
//! first Cluster. Clusters are then walked as a flat element stream: Cluster
//! and BlockGroup are entered, blocks of the selected audio track become
//! packets and everything else is skipped by size. Cues are loaded lazily on
//! the first seek.

use super::bytes::be_uint;
use super::ogg::opus_packet_samples;
use super::tags::{parse_gain_db, parse_vorbis_comment, MAX_TAG_BYTES};
use super::{discard_until, DemuxOptions, Demuxer, ResyncPolicy};
use crate::error::{PlaybackError, Result};
use crate::stream::StreamHandle;
use crate::types::{
    ByteOrder, CodecId, CodecParameters, ContainerKind, ContainerMetadata, Packet, ReplayGain,
    SampleFormat,
};
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// Element IDs
// ============================================================================

const EBML_HEADER: u32 = 0x1A45_DFA3;
const DOC_TYPE: u32 = 0x4282;
const SEGMENT: u32 = 0x1853_8067;
const SEEK_HEAD: u32 = 0x114D_9B74;
const SEEK: u32 = 0x4DBB;
const SEEK_ID: u32 = 0x53AB;
const SEEK_POSITION: u32 = 0x53AC;
const INFO: u32 = 0x1549_A966;
const TIMECODE_SCALE: u32 = 0x2A_D7B1;
const DURATION: u32 = 0x4489;
const TITLE: u32 = 0x7BA9;
const TRACKS: u32 = 0x1654_AE6B;
const TRACK_ENTRY: u32 = 0xAE;
const TRACK_NUMBER: u32 = 0xD7;
const TRACK_TYPE: u32 = 0x83;
const CODEC_ID: u32 = 0x86;
const CODEC_PRIVATE: u32 = 0x63A2;
const CODEC_DELAY: u32 = 0x56AA;
const DEFAULT_DURATION: u32 = 0x23_E383;
const AUDIO: u32 = 0xE1;
const SAMPLING_FREQUENCY: u32 = 0xB5;
const CHANNELS: u32 = 0x9F;
const BIT_DEPTH: u32 = 0x6264;
const TAGS: u32 = 0x1254_C367;
const TAG: u32 = 0x7373;
const SIMPLE_TAG: u32 = 0x67C8;
const TAG_NAME: u32 = 0x45A3;
const TAG_STRING: u32 = 0x4487;
const CUES: u32 = 0x1C53_BB6B;
const CUE_POINT: u32 = 0xBB;
const CUE_TIME: u32 = 0xB3;
const CUE_TRACK_POSITIONS: u32 = 0xB7;
const CUE_TRACK: u32 = 0xF7;
const CUE_CLUSTER_POSITION: u32 = 0xF1;
const CLUSTER: u32 = 0x1F43_B675;
const CLUSTER_TIMECODE: u32 = 0xE7;
const BLOCK_GROUP: u32 = 0xA0;
const BLOCK: u32 = 0xA1;
const SIMPLE_BLOCK: u32 = 0xA3;

const TRACK_TYPE_AUDIO: u64 = 2;
const DEFAULT_TIMECODE_SCALE: u64 = 1_000_000;
const CLUSTER_ID_BYTES: [u8; 4] = [0x1F, 0x43, 0xB6, 0x75];
const SCAN_WINDOW: usize = 16 * 1024;

// ============================================================================
// EBML primitives
// ============================================================================

/// Variable-length integer at the start of `data`.
///
/// IDs keep their length marker; sizes drop it. Returns the value and the
/// encoded length.
fn vint(data: &[u8], keep_marker: bool) -> Option<(u64, usize)> {
    let first = *data.first()?;
    if first == 0 {
        return None;
    }
    let len = first.leading_zeros() as usize + 1;
    let bytes = data.get(..len)?;
    let head = if keep_marker {
        first as u64
    } else {
        first as u64 & (0xFF >> len)
    };
    let value = bytes[1..].iter().fold(head, |acc, &b| (acc << 8) | b as u64);
    Some((value, len))
}

fn element_id(data: &[u8]) -> Option<(u32, usize)> {
    let (id, len) = vint(data, true)?;
    (len <= 4).then_some((id as u32, len))
}

/// Element size; `None` inside the result means "unknown size".
fn element_size(data: &[u8]) -> Option<(Option<u64>, usize)> {
    let (size, len) = vint(data, false)?;
    let unknown = (1u64 << (7 * len)) - 1;
    Some(((size != unknown).then_some(size), len))
}

/// Signed lacing delta.
fn signed_vint(data: &[u8]) -> Option<(i64, usize)> {
    let (value, len) = vint(data, false)?;
    let bias = (1i64 << (7 * len - 1)) - 1;
    Some((value as i64 - bias, len))
}

fn read_float(data: &[u8]) -> Option<f64> {
    match data.len() {
        4 => Some(f32::from_bits(be_uint(data, 0, 4)? as u32) as f64),
        8 => Some(f64::from_bits(be_uint(data, 0, 8)?)),
        _ => None,
    }
}

fn read_uint(data: &[u8]) -> Option<u64> {
    if data.len() > 8 {
        return None;
    }
    be_uint(data, 0, data.len())
}

fn read_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).trim().to_string()
}

/// Iterates the child elements of an in-memory master element body.
struct Children<'a> {
    data: &'a [u8],
    pos: usize,
}

fn children(data: &[u8]) -> Children<'_> {
    Children { data, pos: 0 }
}

impl<'a> Iterator for Children<'a> {
    type Item = (u32, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.data.get(self.pos..)?;
        let (id, id_len) = element_id(rest)?;
        let (size, size_len) = element_size(&rest[id_len..])?;
        let start = id_len + size_len;
        let end = match size {
            Some(size) => start.checked_add(size as usize)?.min(rest.len()),
            None => rest.len(),
        };
        self.pos += end;
        Some((id, &rest[start..end]))
    }
}

#[derive(Debug, Clone, Copy)]
struct ElementHeader {
    id: u32,
    size: Option<u64>,
    len: usize,
}

fn parse_element_header(data: &[u8]) -> Option<ElementHeader> {
    let (id, id_len) = element_id(data)?;
    let (size, size_len) = element_size(&data[id_len..])?;
    Some(ElementHeader {
        id,
        size,
        len: id_len + size_len,
    })
}

/// Frame ranges inside a block payload for the given lacing mode.
fn split_lacing(data: &[u8], lacing: u8) -> Option<Vec<(usize, usize)>> {
    if lacing == 0 {
        return Some(vec![(0, data.len())]);
    }
    let count = *data.first()? as usize + 1;
    let mut pos = 1usize;
    let mut sizes = Vec::with_capacity(count);
    match lacing {
        1 => {
            for _ in 0..count - 1 {
                let mut size = 0usize;
                loop {
                    let byte = *data.get(pos)?;
                    pos += 1;
                    size += byte as usize;
                    if byte < 255 {
                        break;
                    }
                }
                sizes.push(size);
            }
        }
        2 => {
            let total = data.len() - pos;
            if total % count != 0 {
                return None;
            }
            sizes = vec![total / count; count - 1];
        }
        _ => {
            let (first, len) = vint(&data[pos..], false)?;
            pos += len;
            let mut size = first as i64;
            sizes.push(first as usize);
            for _ in 1..count - 1 {
                let (delta, len) = signed_vint(&data[pos..])?;
                pos += len;
                size += delta;
                if size < 0 {
                    return None;
                }
                sizes.push(size as usize);
            }
        }
    }
    let used: usize = sizes.iter().sum();
    let last = data.len().checked_sub(pos + used)?;
    sizes.push(last);

    let mut ranges = Vec::with_capacity(count);
    for size in sizes {
        ranges.push((pos, pos + size));
        pos += size;
    }
    Some(ranges)
}

pub fn probe(data: &[u8]) -> Option<u8> {
    let header = parse_element_header(data)?;
    if header.id != EBML_HEADER {
        return None;
    }
    let body_end = header
        .size
        .map(|size| (header.len + size as usize).min(data.len()))
        .unwrap_or(data.len());
    let doc_type = children(&data[header.len..body_end])
        .find(|(id, _)| *id == DOC_TYPE)
        .map(|(_, body)| read_string(body));
    match doc_type.as_deref() {
        Some("matroska") | Some("webm") => Some(100),
        Some(_) => None,
        None => Some(60),
    }
}

pub fn open(stream: StreamHandle, options: &DemuxOptions) -> Result<Box<dyn Demuxer>> {
    Ok(Box::new(MatroskaDemuxer::new(stream, options)?))
}

// ============================================================================
// Tracks
// ============================================================================

#[derive(Debug, Clone, Default)]
struct TrackEntry {
    number: u64,
    track_type: u64,
    codec_id: String,
    codec_private: Option<Vec<u8>>,
    codec_delay_ns: u64,
    default_duration_ns: Option<u64>,
    sample_rate: f64,
    channels: u16,
    bit_depth: Option<u16>,
}

fn parse_track_entry(body: &[u8]) -> TrackEntry {
    let mut track = TrackEntry {
        sample_rate: 8000.0,
        channels: 1,
        ..Default::default()
    };
    for (id, data) in children(body) {
        match id {
            TRACK_NUMBER => track.number = read_uint(data).unwrap_or(0),
            TRACK_TYPE => track.track_type = read_uint(data).unwrap_or(0),
            CODEC_ID => track.codec_id = read_string(data),
            CODEC_PRIVATE => track.codec_private = Some(data.to_vec()),
            CODEC_DELAY => track.codec_delay_ns = read_uint(data).unwrap_or(0),
            DEFAULT_DURATION => track.default_duration_ns = read_uint(data),
            AUDIO => {
                for (id, data) in children(data) {
                    match id {
                        SAMPLING_FREQUENCY => {
                            track.sample_rate = read_float(data).unwrap_or(track.sample_rate)
                        }
                        CHANNELS => {
                            track.channels = read_uint(data).unwrap_or(1) as u16;
                        }
                        BIT_DEPTH => track.bit_depth = read_uint(data).map(|b| b as u16),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    track
}

/// Splits Xiph-laced Vorbis CodecPrivate into its three header packets.
fn split_xiph_headers(private: &[u8]) -> Option<Vec<&[u8]>> {
    let ranges = split_lacing(private, 1)?;
    Some(ranges.into_iter().map(|(start, end)| &private[start..end]).collect())
}

/// Codec parameters and codec-level tags for a track.
fn track_parameters(
    track: &TrackEntry,
    time_base: u32,
) -> Result<(CodecParameters, ContainerMetadata)> {
    let rate = track.sample_rate.round() as u32;
    let channels = track.channels.max(1);
    let private = track.codec_private.as_deref();
    let mut metadata = ContainerMetadata::default();
    let missing = |what: &str| PlaybackError::malformed(format!("{} without CodecPrivate", what));

    let params = match track.codec_id.as_str() {
        "A_OPUS" => {
            let head = private.ok_or_else(|| missing("A_OPUS"))?;
            let channels = head.get(9).map(|&c| c as u16).unwrap_or(channels);
            let mut params = CodecParameters::new(CodecId::Opus, 48_000, channels)
                .with_extra_data(Bytes::copy_from_slice(head));
            let pre_skip = head
                .get(10..12)
                .map(|b| u16::from_le_bytes([b[0], b[1]]) as u32)
                .unwrap_or(0);
            params.encoder_delay = if track.codec_delay_ns > 0 {
                (track.codec_delay_ns * 48_000 / 1_000_000_000) as u32
            } else {
                pre_skip
            };
            params
        }
        "A_VORBIS" => {
            let private = private.ok_or_else(|| missing("A_VORBIS"))?;
            let headers = split_xiph_headers(private)
                .filter(|h| h.len() == 3)
                .ok_or_else(|| PlaybackError::malformed("invalid Vorbis CodecPrivate lacing"))?;
            if headers[1].starts_with(b"\x03vorbis") {
                metadata = parse_vorbis_comment(&headers[1][7..]);
            }
            let mut extra = headers[0].to_vec();
            extra.extend_from_slice(headers[2]);
            CodecParameters::new(CodecId::Vorbis, rate, channels).with_extra_data(extra)
        }
        id if id.starts_with("A_AAC") => {
            let params = CodecParameters::new(CodecId::Aac, rate, channels);
            match private {
                Some(config) => params.with_extra_data(Bytes::copy_from_slice(config)),
                None => {
                    // AAC-LC AudioSpecificConfig from the track settings.
                    const RATES: [u32; 13] = [
                        96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000,
                        12_000, 11_025, 8_000, 7_350,
                    ];
                    let index = RATES.iter().position(|&r| r == rate).unwrap_or(4) as u16;
                    let config = (2u16 << 11) | (index << 7) | ((channels.min(7)) << 3);
                    params.with_extra_data(config.to_be_bytes().to_vec())
                }
            }
        }
        "A_MPEG/L3" => CodecParameters::new(CodecId::Mp3, rate, channels),
        "A_FLAC" => {
            let private = private.ok_or_else(|| missing("A_FLAC"))?;
            if !private.starts_with(b"fLaC") || private.len() < 42 {
                return Err(PlaybackError::malformed("invalid FLAC CodecPrivate"));
            }
            let blocks = &private[4..];
            for (block_type, body) in flac_metadata_blocks(blocks) {
                if block_type == 4 {
                    metadata = parse_vorbis_comment(body);
                }
            }
            let mut params = CodecParameters::new(CodecId::Flac, rate, channels)
                .with_extra_data(Bytes::copy_from_slice(&blocks[4..38]));
            params.bits_per_sample = track.bit_depth;
            params
        }
        "A_PCM/INT/LIT" | "A_PCM/INT/BIG" | "A_PCM/FLOAT/IEEE" => {
            let bits = track.bit_depth.unwrap_or(16);
            let format = match (track.codec_id.as_str(), bits) {
                ("A_PCM/FLOAT/IEEE", 64) => SampleFormat::F64,
                ("A_PCM/FLOAT/IEEE", _) => SampleFormat::F32,
                (_, 8) => SampleFormat::U8,
                (_, 16) => SampleFormat::S16,
                (_, 24) => SampleFormat::S24,
                (_, 32) => SampleFormat::S32,
                _ => {
                    return Err(PlaybackError::UnsupportedCodec(format!(
                        "{} with {} bits",
                        track.codec_id, bits
                    )))
                }
            };
            let order = if track.codec_id == "A_PCM/INT/BIG" {
                ByteOrder::Big
            } else {
                ByteOrder::Little
            };
            CodecParameters::new(CodecId::Pcm, rate, channels).with_pcm(format, order)
        }
        other => return Err(PlaybackError::UnsupportedCodec(other.to_string())),
    };
    Ok((params.with_time_base(time_base), metadata))
}

fn flac_metadata_blocks(data: &[u8]) -> Vec<(u8, &[u8])> {
    let mut blocks = Vec::new();
    let mut pos = 0usize;
    while let Some(len) = be_uint(data, pos + 1, 3) {
        let block_type = data[pos] & 0x7F;
        let last = data[pos] & 0x80 != 0;
        let start = pos + 4;
        let Some(body) = data.get(start..start + len as usize) else {
            break;
        };
        blocks.push((block_type, body));
        pos = start + len as usize;
        if last {
            break;
        }
    }
    blocks
}

fn parse_tags(body: &[u8]) -> ContainerMetadata {
    let mut meta = ContainerMetadata::default();
    for (id, tag) in children(body) {
        if id != TAG {
            continue;
        }
        for (id, simple) in children(tag) {
            if id != SIMPLE_TAG {
                continue;
            }
            let mut name = None;
            let mut value = None;
            for (id, data) in children(simple) {
                match id {
                    TAG_NAME => name = Some(read_string(data).to_ascii_uppercase()),
                    TAG_STRING => value = Some(read_string(data)),
                    _ => {}
                }
            }
            let (Some(name), Some(value)) = (name, value) else {
                continue;
            };
            match name.as_str() {
                "TITLE" if meta.title.is_none() => meta.title = Some(value),
                "ARTIST" if meta.artist.is_none() => meta.artist = Some(value),
                "ISRC" if meta.isrc.is_none() => meta.isrc = Some(value),
                "REPLAYGAIN_GAIN" | "REPLAYGAIN_TRACK_GAIN" => {
                    meta.replay_gain =
                        parse_gain_db(&value).map(|db| ReplayGain { track_gain_db: db });
                }
                _ => {}
            }
        }
    }
    meta
}

#[derive(Debug, Clone, Copy)]
struct CuePoint {
    time: u64,
    cluster_position: u64,
}

fn parse_cues(body: &[u8], track: u64) -> Vec<CuePoint> {
    let mut points = Vec::new();
    for (id, point) in children(body) {
        if id != CUE_POINT {
            continue;
        }
        let mut time = None;
        let mut position = None;
        for (id, data) in children(point) {
            match id {
                CUE_TIME => time = read_uint(data),
                CUE_TRACK_POSITIONS if position.is_none() => {
                    let mut cue_track = None;
                    let mut cluster = None;
                    for (id, data) in children(data) {
                        match id {
                            CUE_TRACK => cue_track = read_uint(data),
                            CUE_CLUSTER_POSITION => cluster = read_uint(data),
                            _ => {}
                        }
                    }
                    if cue_track.map_or(true, |t| t == track) {
                        position = cluster;
                    }
                }
                _ => {}
            }
        }
        if let (Some(time), Some(cluster_position)) = (time, position) {
            points.push(CuePoint {
                time,
                cluster_position,
            });
        }
    }
    points.sort_by_key(|p| p.time);
    points
}

// ============================================================================
// Demuxer
// ============================================================================

pub struct MatroskaDemuxer {
    stream: StreamHandle,
    options: DemuxOptions,
    params: CodecParameters,
    metadata: ContainerMetadata,
    track_number: u64,
    /// Ticks per laced frame, when the track declares a default duration.
    default_duration: Option<u64>,
    timecode_scale: u64,
    /// Offset of the Segment payload; Cues and SeekHead positions are
    /// relative to it.
    segment_start: u64,
    first_cluster: u64,
    cues_position: Option<u64>,
    cues: Option<Vec<CuePoint>>,
    cluster_time: u64,
    queue: VecDeque<Packet>,
}

impl MatroskaDemuxer {
    pub fn new(mut stream: StreamHandle, options: &DemuxOptions) -> Result<Self> {
        let limit = options.max_allocation_bytes;

        let header = Self::read_header(&mut stream)?
            .filter(|h| h.id == EBML_HEADER)
            .ok_or_else(|| PlaybackError::malformed("missing EBML header"))?;
        let header_size = header
            .size
            .ok_or_else(|| PlaybackError::malformed("EBML header with unknown size"))?;
        stream.skip(header.len as u64)?;
        let body = stream.read_vec(header_size, limit)?;
        let doc_type = children(&body)
            .find(|(id, _)| *id == DOC_TYPE)
            .map(|(_, data)| read_string(data))
            .unwrap_or_else(|| "matroska".to_string());
        if doc_type != "matroska" && doc_type != "webm" {
            return Err(PlaybackError::UnsupportedFormat(format!("EBML doctype {}", doc_type)));
        }

        let segment = Self::read_header(&mut stream)?
            .filter(|h| h.id == SEGMENT)
            .ok_or_else(|| PlaybackError::malformed("missing Segment element"))?;
        stream.skip(segment.len as u64)?;
        let segment_start = stream.position();

        let mut timecode_scale = DEFAULT_TIMECODE_SCALE;
        let mut duration = None;
        let mut metadata = ContainerMetadata::default();
        let mut tracks = Vec::new();
        let mut cues_position = None;

        loop {
            let Some(element) = Self::read_header(&mut stream)? else {
                return Err(PlaybackError::malformed("no Cluster before end of stream"));
            };
            if element.id == CLUSTER {
                break;
            }
            let size = element.size.ok_or_else(|| {
                PlaybackError::malformed(format!("element {:#x} with unknown size", element.id))
            })?;
            stream.skip(element.len as u64)?;
            match element.id {
                INFO => {
                    let body = stream.read_vec(size, limit)?;
                    for (id, data) in children(&body) {
                        match id {
                            TIMECODE_SCALE => {
                                timecode_scale = read_uint(data)
                                    .filter(|&s| s > 0)
                                    .unwrap_or(DEFAULT_TIMECODE_SCALE)
                            }
                            DURATION => duration = read_float(data),
                            TITLE => metadata.title = Some(read_string(data)),
                            _ => {}
                        }
                    }
                }
                TRACKS => {
                    let body = stream.read_vec(size, limit)?;
                    tracks = children(&body)
                        .filter(|(id, _)| *id == TRACK_ENTRY)
                        .map(|(_, data)| parse_track_entry(data))
                        .collect();
                }
                TAGS if size <= MAX_TAG_BYTES => {
                    let body = stream.read_vec(size, limit)?;
                    metadata.merge(parse_tags(&body));
                }
                SEEK_HEAD => {
                    let body = stream.read_vec(size, limit)?;
                    cues_position = cues_position.or_else(|| find_cues_position(&body));
                }
                _ => {
                    stream.check_size(size, u64::MAX)?;
                    stream.skip(size)?;
                }
            }
        }
        stream.commit();
        let first_cluster = stream.position();

        let time_base = (1_000_000_000 / timecode_scale).max(1) as u32;
        let mut selected = None;
        let mut last_error = None;
        for track in tracks.iter().filter(|t| t.track_type == TRACK_TYPE_AUDIO) {
            match track_parameters(track, time_base) {
                Ok(found) => {
                    selected = Some((track, found));
                    break;
                }
                Err(err) => last_error = Some(err),
            }
        }
        let (track, (mut params, codec_tags)) = match selected {
            Some(found) => found,
            None => {
                return Err(last_error.unwrap_or_else(|| {
                    PlaybackError::UnsupportedCodec("Matroska file without audio track".into())
                }))
            }
        };
        metadata.merge(codec_tags);

        let delay_ticks =
            params.encoder_delay as u64 * time_base as u64 / params.sample_rate.max(1) as u64;
        params.total_ticks = duration
            .filter(|d| d.is_finite() && *d > 0.0)
            .map(|d| d.round() as u64 + delay_ticks);
        let default_duration = track.default_duration_ns.map(|ns| ns / timecode_scale);

        info!(
            codec = %params.codec,
            track = track.number,
            sample_rate = params.sample_rate,
            channels = params.channels,
            timecode_scale,
            has_cues = cues_position.is_some(),
            "Opened Matroska stream"
        );

        Ok(Self {
            stream,
            options: options.clone(),
            params,
            metadata,
            track_number: track.number,
            default_duration,
            timecode_scale,
            segment_start,
            first_cluster,
            cues_position,
            cues: None,
            cluster_time: 0,
            queue: VecDeque::new(),
        })
    }

    fn read_header(stream: &mut StreamHandle) -> Result<Option<ElementHeader>> {
        let data = stream.peek(12)?;
        if data.is_empty() {
            return Ok(None);
        }
        parse_element_header(data)
            .map(Some)
            .ok_or_else(|| PlaybackError::malformed("invalid EBML element header"))
    }

    /// Advances the flat element walk until packets are queued or the
    /// stream ends.
    fn fill_queue(&mut self) -> Result<()> {
        while self.queue.is_empty() {
            let data = self.stream.peek(12)?;
            if data.is_empty() {
                return Ok(());
            }
            let Some(element) = parse_element_header(data) else {
                return self.resync();
            };
            if matches!(element.id, SEGMENT | CLUSTER | BLOCK_GROUP) {
                self.stream.skip(element.len as u64)?;
                continue;
            }
            let remaining = self.stream.remaining().map(|r| r.saturating_sub(element.len as u64));
            if let (Some(size), Some(remaining)) = (element.size, remaining) {
                if size > remaining {
                    return self.resync();
                }
            }

            match (element.id, element.size) {
                (CLUSTER_TIMECODE, Some(size)) if size <= 8 => {
                    self.stream.skip(element.len as u64)?;
                    let body = self.stream.read_vec(size, 8)?;
                    self.cluster_time = read_uint(&body).unwrap_or(0);
                }
                (SIMPLE_BLOCK | BLOCK, Some(size)) => {
                    self.stream.skip(element.len as u64)?;
                    let body = self.stream.read_vec(size, self.options.max_allocation_bytes)?;
                    self.queue_block(&body)?;
                }
                (_, Some(size)) => {
                    self.stream.skip(element.len as u64 + size)?;
                }
                (_, None) => return self.resync(),
            }
        }
        Ok(())
    }

    fn queue_block(&mut self, body: &[u8]) -> Result<()> {
        let Some((track, track_len)) = vint(body, false) else {
            return Err(PlaybackError::recoverable("invalid block track number"));
        };
        if track != self.track_number {
            return Ok(());
        }
        let header = body
            .get(track_len..track_len + 3)
            .ok_or_else(|| PlaybackError::recoverable("truncated block header"))?;
        let relative = i16::from_be_bytes([header[0], header[1]]) as i64;
        let lacing = (header[2] >> 1) & 0x03;
        let payload = &body[track_len + 3..];
        let ranges = split_lacing(payload, lacing)
            .ok_or_else(|| PlaybackError::recoverable("invalid block lacing"))?;

        let mut ts = (self.cluster_time as i64 + relative).max(0) as u64;
        for (start, end) in ranges {
            let frame = Bytes::copy_from_slice(&payload[start..end]);
            let duration = self.frame_ticks(&frame);
            let mut packet = Packet::new(ts, frame);
            if let Some(duration) = duration {
                packet = packet.with_duration(duration);
                ts += duration;
            }
            self.queue.push_back(packet);
        }
        Ok(())
    }

    fn frame_ticks(&self, frame: &[u8]) -> Option<u64> {
        if self.params.codec == CodecId::Opus {
            let samples = opus_packet_samples(frame)?;
            return Some(samples * 1_000_000_000 / 48_000 / self.timecode_scale);
        }
        self.default_duration
    }

    fn resync(&mut self) -> Result<()> {
        let start = self.stream.position();
        self.stream.skip(1)?;
        loop {
            let data = self.stream.peek(SCAN_WINDOW)?;
            let at_eof = data.len() < SCAN_WINDOW;
            match data.windows(4).position(|w| w == CLUSTER_ID_BYTES) {
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
                    let advance = data.len() - 3;
                    self.stream.skip(advance as u64)?;
                }
            }
        }
        let skipped = self.stream.position() - start;
        warn!(offset = start, skipped, "Invalid Matroska element, resynchronized on Cluster");
        Err(PlaybackError::recoverable(format!(
            "skipped {} bytes of invalid Matroska data at offset {}",
            skipped, start
        )))
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        self.fill_queue()?;
        Ok(self.queue.pop_front())
    }

    fn load_cues(&mut self) -> Result<()> {
        if self.cues.is_some() {
            return Ok(());
        }
        let mut points = Vec::new();
        if let Some(relative) = self.cues_position {
            self.stream.seek(self.segment_start + relative)?;
            match Self::read_header(&mut self.stream)? {
                Some(ElementHeader {
                    id: CUES,
                    size: Some(size),
                    len,
                }) => {
                    self.stream.skip(len as u64)?;
                    let body = self.stream.read_vec(size, self.options.max_allocation_bytes)?;
                    points = parse_cues(&body, self.track_number);
                }
                _ => warn!("SeekHead points to a non-Cues element"),
            }
        }
        debug!(cue_points = points.len(), "Loaded Matroska cues");
        self.cues = Some(points);
        Ok(())
    }
}

fn find_cues_position(seek_head: &[u8]) -> Option<u64> {
    children(seek_head)
        .filter(|(id, _)| *id == SEEK)
        .find_map(|(_, seek)| {
            let mut target = None;
            let mut position = None;
            for (id, data) in children(seek) {
                match id {
                    SEEK_ID => target = read_uint(data),
                    SEEK_POSITION => position = read_uint(data),
                    _ => {}
                }
            }
            (target == Some(CUES as u64)).then_some(position).flatten()
        })
}

impl Demuxer for MatroskaDemuxer {
    fn kind(&self) -> ContainerKind {
        ContainerKind::Matroska
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
        self.load_cues()?;

        let cue = self.cues.as_ref().and_then(|cues| {
            cues.partition_point(|p| p.time <= target_ticks)
                .checked_sub(1)
                .map(|i| cues[i])
        });
        let offset = match cue {
            Some(point) => {
                debug!(time = point.time, position = point.cluster_position, "Matroska cue");
                self.segment_start + point.cluster_position
            }
            None => self.first_cluster,
        };
        self.stream.seek(offset)?;
        self.cluster_time = cue.map(|c| c.time).unwrap_or(0);

        let landed = discard_until(target_ticks, || self.read_packet())?;
        let landed_ts = match &landed {
            Some(packet) => packet.timestamp,
            None => self.params.total_ticks.unwrap_or(target_ticks),
        };
        if let Some(packet) = landed {
            self.queue.push_front(packet);
        }
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
