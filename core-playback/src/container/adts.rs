//! ADTS (raw AAC with per-frame headers) demuxer.
//!
//! Headers are stripped; packets carry raw AAC access units and the codec
//! parameters carry an AudioSpecificConfig synthesised from the first header.
//!
//! ADTS has no index and frame sizes vary, so byte offsets cannot be derived
//! from time. Seeks restart from the nearest frame start already read (at
//! least one per second of audio is remembered) and discard forward.

use super::tags::{parse_id3v2, Id3Header, MAX_TAG_BYTES};
use super::{discard_until, DemuxOptions, Demuxer, ResyncPolicy};
use crate::error::{PlaybackError, Result};
use crate::stream::StreamHandle;
use crate::types::{CodecId, CodecParameters, ContainerKind, ContainerMetadata, Packet};
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info, warn};

const SAMPLES_PER_BLOCK: u64 = 1024;
const SCAN_WINDOW: usize = 8 * 1024;

const SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AdtsHeader {
    /// MPEG-4 audio object type (profile + 1).
    pub object_type: u8,
    pub rate_index: u8,
    pub channel_config: u8,
    pub header_len: usize,
    pub frame_len: usize,
    pub raw_blocks: u8,
}

impl AdtsHeader {
    pub(crate) fn parse(data: &[u8]) -> Option<Self> {
        let b = data.get(..7)?;
        if b[0] != 0xFF || b[1] & 0xF6 != 0xF0 {
            return None;
        }
        let protection_absent = b[1] & 0x01 == 1;
        let object_type = (b[2] >> 6) + 1;
        let rate_index = (b[2] >> 2) & 0x0F;
        let channel_config = ((b[2] & 0x01) << 2) | (b[3] >> 6);
        let frame_len = (((b[3] & 0x03) as usize) << 11) | ((b[4] as usize) << 3) | (b[5] >> 5) as usize;
        let header_len = if protection_absent { 7 } else { 9 };
        if rate_index as usize >= SAMPLE_RATES.len() || channel_config == 0 || frame_len <= header_len {
            return None;
        }
        Some(Self {
            object_type,
            rate_index,
            channel_config,
            header_len,
            frame_len,
            raw_blocks: (b[6] & 0x03) + 1,
        })
    }

    pub(crate) fn sample_rate(&self) -> u32 {
        SAMPLE_RATES[self.rate_index as usize]
    }

    pub(crate) fn channels(&self) -> u16 {
        if self.channel_config == 7 {
            8
        } else {
            self.channel_config as u16
        }
    }

    /// Two-byte AudioSpecificConfig equivalent to this header.
    pub(crate) fn audio_specific_config(&self) -> [u8; 2] {
        let config = ((self.object_type as u16) << 11)
            | ((self.rate_index as u16) << 7)
            | ((self.channel_config as u16) << 3);
        config.to_be_bytes()
    }

    fn compatible(&self, other: &AdtsHeader) -> bool {
        self.object_type == other.object_type
            && self.rate_index == other.rate_index
            && self.channel_config == other.channel_config
    }
}

fn find_confirmed(data: &[u8], from: usize, at_eof: bool) -> Option<(usize, AdtsHeader)> {
    let mut i = from;
    while i + 7 <= data.len() {
        if let Some(header) = AdtsHeader::parse(&data[i..]) {
            let next = i + header.frame_len;
            match data.get(next..next + 7) {
                Some(bytes) => {
                    if AdtsHeader::parse(bytes).is_some_and(|n| header.compatible(&n)) {
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
        Some(id3) if id3.total_len() as usize >= data.len() => return None,
        Some(id3) => id3.total_len() as usize,
        None => 0,
    };
    let body = &data[start..];
    let header = AdtsHeader::parse(body)?;
    match body.get(header.frame_len..header.frame_len + 7) {
        Some(next) if AdtsHeader::parse(next).is_some_and(|n| header.compatible(&n)) => Some(85),
        Some(_) => None,
        None => Some(30),
    }
}

pub fn open(stream: StreamHandle, options: &DemuxOptions) -> Result<Box<dyn Demuxer>> {
    Ok(Box::new(AdtsDemuxer::new(stream, options)?))
}

pub struct AdtsDemuxer {
    stream: StreamHandle,
    params: CodecParameters,
    metadata: ContainerMetadata,
    first_header: AdtsHeader,
    audio_start: u64,
    next_ts: u64,
    /// `(timestamp, offset)` of frame starts seen so far, ascending.
    seek_points: Vec<(u64, u64)>,
    pending: Option<Packet>,
}

impl AdtsDemuxer {
    pub fn new(mut stream: StreamHandle, options: &DemuxOptions) -> Result<Self> {
        let mut metadata = ContainerMetadata::default();
        let head = stream.peek(10)?;
        if let Some(id3) = Id3Header::parse(head) {
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

        let data = stream.peek(SCAN_WINDOW)?;
        let at_eof = data.len() < SCAN_WINDOW;
        let (offset, header) = find_confirmed(data, 0, at_eof)
            .ok_or_else(|| PlaybackError::malformed("no ADTS frame found"))?;
        stream.skip(offset as u64)?;
        stream.commit();

        let audio_start = stream.position();
        let samples_per_frame = SAMPLES_PER_BLOCK * header.raw_blocks as u64;
        let total_ticks = stream
            .remaining()
            .map(|len| len / header.frame_len as u64 * samples_per_frame);
        let params = CodecParameters::new(CodecId::Aac, header.sample_rate(), header.channels())
            .with_total_ticks(total_ticks)
            .with_extra_data(Bytes::copy_from_slice(&header.audio_specific_config()));

        info!(
            sample_rate = header.sample_rate(),
            channels = header.channels(),
            object_type = header.object_type,
            "Opened ADTS stream"
        );

        Ok(Self {
            stream,
            params,
            metadata,
            first_header: header,
            audio_start,
            next_ts: 0,
            seek_points: vec![(0, audio_start)],
            pending: None,
        })
    }

    fn read_frame(&mut self) -> Result<Option<Packet>> {
        let head = self.stream.peek(9)?;
        if head.is_empty() {
            return Ok(None);
        }
        let Some(header) = AdtsHeader::parse(head).filter(|h| h.compatible(&self.first_header)) else {
            return self.resync();
        };
        let frame = self.stream.peek(header.frame_len)?;
        if frame.len() < header.frame_len {
            let len = frame.len();
            self.stream.skip(len as u64)?;
            return Err(PlaybackError::recoverable("truncated ADTS frame at end of stream"));
        }
        let payload = Bytes::copy_from_slice(&frame[header.header_len..]);
        self.remember_frame_start();
        self.stream.skip(header.frame_len as u64)?;

        let duration = SAMPLES_PER_BLOCK * header.raw_blocks as u64;
        let packet = Packet::new(self.next_ts, payload).with_duration(duration);
        self.next_ts += duration;
        Ok(Some(packet))
    }

    fn resync(&mut self) -> Result<Option<Packet>> {
        let start = self.stream.position();
        loop {
            let data = self.stream.peek(SCAN_WINDOW)?;
            let at_eof = data.len() < SCAN_WINDOW;
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
                    self.stream.skip((SCAN_WINDOW / 2) as u64)?;
                }
            }
        }
        let skipped = self.stream.position() - start;
        warn!(offset = start, skipped, "Lost ADTS frame sync, resynchronized");
        Err(PlaybackError::recoverable(format!(
            "skipped {} bytes of invalid ADTS data at offset {}",
            skipped, start
        )))
    }

    /// Records the current frame start once per second of new audio.
    fn remember_frame_start(&mut self) {
        let interval = self.params.sample_rate as u64;
        let due = self
            .seek_points
            .last()
            .map_or(true, |&(ts, _)| self.next_ts >= ts + interval);
        if due {
            self.seek_points.push((self.next_ts, self.stream.position()));
        }
    }
}

impl Demuxer for AdtsDemuxer {
    fn kind(&self) -> ContainerKind {
        ContainerKind::Adts
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

        let (ticks, offset) = self
            .seek_points
            .iter()
            .rev()
            .find(|&&(ts, _)| ts <= target_ticks)
            .copied()
            .unwrap_or((0, self.audio_start));
        debug!(ticks, offset, "ADTS seek from known frame start");
        self.stream.seek(offset)?;
        self.next_ts = ticks;

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemorySource;

    /// AAC-LC, 44.1 kHz, stereo, no CRC.
    fn frame(len: usize) -> Vec<u8> {
        let mut data = vec![0xFF, 0xF1, 0x50, 0x80, 0, 0, 0xFC];
        data[3] |= ((len >> 11) & 0x03) as u8;
        data[4] = ((len >> 3) & 0xFF) as u8;
        data[5] = (((len & 0x07) << 5) as u8) | 0x1F;
        data.resize(len, 0x21);
        data
    }

    fn demuxer(data: Vec<u8>) -> AdtsDemuxer {
        let stream = StreamHandle::new(Box::new(MemorySource::new(data)));
        AdtsDemuxer::new(stream, &DemuxOptions::default()).unwrap()
    }

    #[test]
    fn test_header_and_config() {
        let header = AdtsHeader::parse(&frame(200)).unwrap();
        assert_eq!(header.object_type, 2);
        assert_eq!(header.sample_rate(), 44_100);
        assert_eq!(header.channels(), 2);
        assert_eq!(header.frame_len, 200);
        assert_eq!(header.header_len, 7);
        assert_eq!(header.audio_specific_config(), [0x12, 0x10]);
    }

    #[test]
    fn test_probe() {
        let mut data = frame(200);
        data.extend(frame(180));
        assert_eq!(probe(&data), Some(85));
        assert_eq!(probe(&frame(200)[..100]), Some(30));
        assert_eq!(probe(b"fLaC\0\0\0\x22"), None);
    }

    #[test]
    fn test_packets_strip_headers() {
        let data: Vec<u8> = [200, 180, 220].iter().flat_map(|&len| frame(len)).collect();
        let mut demuxer = demuxer(data);
        assert_eq!(
            demuxer.codec_parameters().extra_data.as_deref(),
            Some([0x12u8, 0x10].as_slice())
        );
        let mut sizes = Vec::new();
        let mut stamps = Vec::new();
        while let Some(packet) = demuxer.next_packet().unwrap() {
            sizes.push(packet.data.len());
            stamps.push(packet.timestamp);
        }
        assert_eq!(sizes, vec![193, 173, 213]);
        assert_eq!(stamps, vec![0, 1024, 2048]);
    }

    #[test]
    fn test_garbage_between_frames() {
        let mut data = frame(200);
        data.extend(frame(200));
        data.extend_from_slice(&[0x00; 64]);
        data.extend(frame(200));
        data.extend(frame(200));

        let mut demuxer = demuxer(data);
        assert!(demuxer.next_packet().unwrap().is_some());
        assert!(demuxer.next_packet().unwrap().is_some());
        assert!(demuxer.next_packet().unwrap_err().is_recoverable());
        assert!(demuxer.next_packet().unwrap().is_some());
        assert!(demuxer.next_packet().unwrap().is_some());
        assert!(demuxer.next_packet().unwrap().is_none());
    }

    #[test]
    fn test_seek_estimate_then_discard() {
        let data: Vec<u8> = (0..50).flat_map(|_| frame(200)).collect();
        let mut demuxer = demuxer(data);
        let target = demuxer.codec_parameters().ticks_to_duration(10 * 1024);
        let landed = demuxer.seek(target).unwrap();
        assert_eq!(landed, target);
        assert_eq!(demuxer.next_packet().unwrap().unwrap().timestamp, 10 * 1024);
    }

    #[test]
    fn test_seek_with_varying_frame_sizes() {
        let len_of = |i: usize| 150 + (i * 37) % 97;
        let data: Vec<u8> = (0..200).flat_map(|i| frame(len_of(i))).collect();
        let mut demuxer = demuxer(data);

        // Forward past anything read so far, then back into the read region.
        for frame_index in [150u64, 20, 120] {
            let target = demuxer.codec_parameters().ticks_to_duration(frame_index * 1024);
            assert_eq!(demuxer.seek(target).unwrap(), target);
            let packet = demuxer.next_packet().unwrap().unwrap();
            assert_eq!(packet.timestamp, frame_index * 1024);
            assert_eq!(packet.data.len(), len_of(frame_index as usize) - 7);
        }
    }
}
