//! Shared fixtures for the integration tests: small programmatic writers for
//! every supported container plus engine helpers.

#![allow(dead_code)]

use bytes::Bytes;
use core_playback::{
    ByteSource, ExecutorContext, Frame, OpenedTrack, PlaybackConfig, PlaybackEngine,
    PlaybackError, PollResult, StreamHandle, TrackHandle, TrackMetadata, TrackSource,
};
use core_runtime::events::{CoreEvent, TrackEvent};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

// ============================================================================
// Checksums
// ============================================================================

fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 { (crc << 1) ^ 0x07 } else { crc << 1 };
        }
    }
    crc
}

fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x8005 } else { crc << 1 };
        }
    }
    crc
}

fn crc32_ogg(data: &[u8]) -> u32 {
    let mut crc = 0u32;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}

// ============================================================================
// WAV
// ============================================================================

/// 16-bit PCM WAV with interleaved `samples`.
pub fn wav_s16(samples: &[i16], rate: u32, channels: u16) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let block_align = channels * 2;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVEfmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&rate.to_le_bytes());
    out.extend_from_slice(&(rate * block_align as u32).to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// A mono ramp that never repeats within `len` samples.
pub fn ramp(len: usize) -> Vec<i16> {
    (0..len).map(|i| ((i * 7) % 30_000) as i16).collect()
}

// ============================================================================
// FLAC
// ============================================================================

pub const FLAC_BLOCK: usize = 256;

/// Mono 16-bit 44.1 kHz FLAC made of VERBATIM subframes, `blocks` frames of
/// `FLAC_BLOCK` samples each. Sample values stay below 0x400 so no sync
/// pattern appears inside frame bodies.
pub fn flac_verbatim(blocks: usize) -> Vec<u8> {
    let total = (blocks * FLAC_BLOCK) as u64;
    let mut data = b"fLaC".to_vec();
    data.extend_from_slice(&[0x80, 0, 0, 34]);
    data.extend_from_slice(&(FLAC_BLOCK as u16).to_be_bytes());
    data.extend_from_slice(&(FLAC_BLOCK as u16).to_be_bytes());
    data.extend_from_slice(&[0; 6]);
    let packed = (44_100u64 << 44) | (15 << 36) | total;
    data.extend_from_slice(&packed.to_be_bytes());
    data.extend_from_slice(&[0; 16]);

    for number in 0..blocks {
        let samples: Vec<i16> = (0..FLAC_BLOCK)
            .map(|i| ((number * FLAC_BLOCK + i) % 1000) as i16)
            .collect();
        data.extend(flac_frame(number as u8, &samples));
    }
    data
}

fn flac_frame(number: u8, samples: &[i16]) -> Vec<u8> {
    assert!(number < 128 && !samples.is_empty() && samples.len() <= 256);
    // Block size from an 8-bit field, 44.1 kHz, mono, 16 bit.
    let mut frame = vec![0xFF, 0xF8, 0x69, 0x08, number, (samples.len() - 1) as u8];
    frame.push(crc8(&frame));
    frame.push(0x02);
    for sample in samples {
        frame.extend_from_slice(&sample.to_be_bytes());
    }
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame
}

// ============================================================================
// MP3 / ADTS
// ============================================================================

pub const MP3_FRAME_SAMPLES: usize = 1152;

/// MPEG-1 Layer III, 128 kbps, 44.1 kHz stereo frame with empty side info.
pub fn mp3_silent_frame() -> Vec<u8> {
    let mut frame = vec![0u8; 417];
    frame[..4].copy_from_slice(&[0xFF, 0xFB, 0x90, 0x64]);
    frame
}

pub fn mp3_silence(frames: usize) -> Vec<u8> {
    (0..frames).flat_map(|_| mp3_silent_frame()).collect()
}

/// AAC-LC, 44.1 kHz stereo ADTS frame of `len` bytes.
pub fn adts_frame(len: usize) -> Vec<u8> {
    let mut data = vec![0xFF, 0xF1, 0x50, 0x80, 0, 0, 0xFC];
    data[3] |= ((len >> 11) & 0x03) as u8;
    data[4] = ((len >> 3) & 0xFF) as u8;
    data[5] = (((len & 0x07) << 5) as u8) | 0x1F;
    data.resize(len, 0x21);
    data
}

// ============================================================================
// Ogg Opus
// ============================================================================

fn ogg_page(serial: u32, seq: u32, flags: u8, granule: u64, packets: &[&[u8]]) -> Vec<u8> {
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

    let mut page = b"OggS".to_vec();
    page.push(0);
    page.push(flags);
    page.extend_from_slice(&granule.to_le_bytes());
    page.extend_from_slice(&serial.to_le_bytes());
    page.extend_from_slice(&seq.to_le_bytes());
    page.extend_from_slice(&[0; 4]);
    page.push(lacing.len() as u8);
    page.extend_from_slice(&lacing);
    page.extend_from_slice(&body);
    let crc = crc32_ogg(&page);
    page[22..26].copy_from_slice(&crc.to_le_bytes());
    page
}

/// Stereo Ogg Opus with `pages` audio pages of five 20 ms packets.
pub fn ogg_opus(pages: usize, pre_skip: u16) -> Vec<u8> {
    let mut head = b"OpusHead".to_vec();
    head.push(1);
    head.push(2);
    head.extend_from_slice(&pre_skip.to_le_bytes());
    head.extend_from_slice(&48_000u32.to_le_bytes());
    head.extend_from_slice(&0i16.to_le_bytes());
    head.push(0);

    let mut tags = b"OpusTags".to_vec();
    tags.extend_from_slice(&6u32.to_le_bytes());
    tags.extend_from_slice(b"writer");
    tags.extend_from_slice(&1u32.to_le_bytes());
    let title = b"TITLE=Fixture";
    tags.extend_from_slice(&(title.len() as u32).to_le_bytes());
    tags.extend_from_slice(title);

    let mut data = ogg_page(9, 0, 0x02, 0, &[&head]);
    data.extend(ogg_page(9, 1, 0, 0, &[&tags]));

    let mut packet = vec![0xF8];
    packet.resize(120, 0xAA);
    for index in 0..pages {
        let flags = if index + 1 == pages { 0x04 } else { 0 };
        let granule = (index as u64 + 1) * 5 * 960;
        data.extend(ogg_page(
            9,
            2 + index as u32,
            flags,
            granule,
            &[packet.as_slice(); 5],
        ));
    }
    data
}

// ============================================================================
// Matroska
// ============================================================================

fn ebml(id: u32, body: &[u8]) -> Vec<u8> {
    let id_bytes = id.to_be_bytes();
    let skip = id_bytes.iter().position(|&b| b != 0).unwrap_or(3);
    let mut out = id_bytes[skip..].to_vec();
    out.push(0x01);
    out.extend_from_slice(&(body.len() as u64).to_be_bytes()[1..]);
    out.extend_from_slice(body);
    out
}

fn ebml_uint(id: u32, value: u64) -> Vec<u8> {
    ebml(id, &value.to_be_bytes())
}

pub const MKV_BLOCK_MS: u64 = 100;
pub const MKV_RATE: u32 = 8_000;

/// 8 kHz mono S16 WebM: one-second clusters of ten 100 ms SimpleBlocks,
/// optionally indexed by Cues.
pub fn matroska_pcm(clusters: usize, with_cues: bool) -> Vec<u8> {
    let mut head = ebml(0x1549_A966, &ebml_uint(0x2A_D7B1, 1_000_000));
    let mut track = ebml_uint(0xD7, 1);
    track.extend(ebml_uint(0x83, 2));
    track.extend(ebml(0x86, b"A_PCM/INT/LIT"));
    let mut audio = ebml(0xB5, &(MKV_RATE as f64).to_be_bytes());
    audio.extend(ebml_uint(0x9F, 1));
    audio.extend(ebml_uint(0x6264, 16));
    track.extend(ebml(0xE1, &audio));
    head.extend(ebml(0x1654_AE6B, &ebml(0xAE, &track)));

    let block_samples = (MKV_RATE as u64 * MKV_BLOCK_MS / 1000) as usize;
    let mut body = Vec::new();
    let mut offsets = Vec::new();
    for c in 0..clusters {
        let mut cluster = ebml_uint(0xE7, c as u64 * 1000);
        for b in 0..10i16 {
            let mut block = vec![0x81];
            block.extend_from_slice(&(b * MKV_BLOCK_MS as i16).to_be_bytes());
            block.push(0x80);
            for i in 0..block_samples {
                block.extend_from_slice(&((i % 64) as i16).to_le_bytes());
            }
            cluster.extend(ebml(0xA3, &block));
        }
        offsets.push(body.len());
        body.extend(ebml(0x1F43_B675, &cluster));
    }

    let seek_head = |cues_position: u64| {
        let mut seek = ebml(0x53AB, &0x1C53_BB6Bu32.to_be_bytes());
        seek.extend(ebml_uint(0x53AC, cues_position));
        ebml(0x114D_9B74, &ebml(0x4DBB, &seek))
    };

    let mut segment = Vec::new();
    if with_cues {
        let prefix = seek_head(0).len() + head.len();
        let mut points = Vec::new();
        for (c, offset) in offsets.iter().enumerate() {
            let mut positions = ebml_uint(0xF7, 1);
            positions.extend(ebml_uint(0xF1, (prefix + offset) as u64));
            let mut point = ebml_uint(0xB3, c as u64 * 1000);
            point.extend(ebml(0xB7, &positions));
            points.extend(ebml(0xBB, &point));
        }
        segment.extend(seek_head((prefix + body.len()) as u64));
        segment.extend(head);
        segment.extend(body);
        segment.extend(ebml(0x1C53_BB6B, &points));
    } else {
        segment.extend(head);
        segment.extend(body);
    }

    let mut data = ebml(0x1A45_DFA3, &ebml(0x4282, b"webm"));
    data.extend(ebml(0x1853_8067, &segment));
    data
}

// ============================================================================
// Sources
// ============================================================================

/// In-memory transport that fails a number of reads once it reaches
/// `fail_at`.
pub struct FlakySource {
    data: Bytes,
    position: u64,
    fail_at: u64,
    failures: Arc<AtomicU32>,
}

impl FlakySource {
    pub fn new(data: impl Into<Bytes>, fail_at: u64, failures: Arc<AtomicU32>) -> Self {
        Self {
            data: data.into(),
            position: 0,
            fail_at,
            failures,
        }
    }
}

impl ByteSource for FlakySource {
    fn read(&mut self, buf: &mut [u8]) -> core_playback::Result<usize> {
        if self.position >= self.fail_at
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(PlaybackError::Transport {
                message: "connection reset by peer".to_string(),
                exhausted: false,
            });
        }
        let start = (self.position as usize).min(self.data.len());
        let n = buf.len().min(self.data.len() - start).min(4096);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.position += n as u64;
        Ok(n)
    }

    fn seek(&mut self, position: u64) -> core_playback::Result<u64> {
        self.position = position.min(self.data.len() as u64);
        Ok(self.position)
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn position(&self) -> u64 {
        self.position
    }
}

/// Serves one byte buffer through a [`FlakySource`].
pub struct FlakyTrackSource {
    pub data: Bytes,
    pub fail_at: u64,
    pub failures: Arc<AtomicU32>,
}

impl TrackSource for FlakyTrackSource {
    fn open(&self, identifier: &str) -> core_playback::Result<OpenedTrack> {
        let source = FlakySource::new(self.data.clone(), self.fail_at, self.failures.clone());
        Ok(OpenedTrack {
            stream: StreamHandle::new(Box::new(source)),
            metadata: TrackMetadata::new(identifier),
        })
    }
}

// ============================================================================
// Engine Helpers
// ============================================================================

pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

pub fn engine(rt: &tokio::runtime::Runtime, source: Arc<dyn TrackSource>) -> PlaybackEngine {
    PlaybackEngine::new(ExecutorContext::new(rt.handle().clone()), source)
}

pub fn fast_config() -> PlaybackConfig {
    let mut config = PlaybackConfig::default();
    config.poll_slice_ms = 10;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config
}

/// Pulls frames until the track ends. Panics if it stalls.
pub fn drain(track: &TrackHandle) -> Vec<Frame> {
    let deadline = Instant::now() + Duration::from_secs(20);
    let mut frames = Vec::new();
    loop {
        match track.poll_frame(Duration::from_millis(20)) {
            PollResult::Frame(frame) => frames.push(frame),
            PollResult::NoFrameYet => {
                assert!(Instant::now() < deadline, "track stalled in {:?}", track.current_state());
            }
            PollResult::TrackEnded => return frames,
        }
    }
}

/// Waits for the next frame. Panics if none arrives.
pub fn next_frame(track: &TrackHandle) -> Frame {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match track.poll_frame(Duration::from_millis(20)) {
            PollResult::Frame(frame) => return frame,
            PollResult::NoFrameYet => assert!(Instant::now() < deadline, "no frame arrived"),
            PollResult::TrackEnded => panic!("track ended early"),
        }
    }
}

pub fn total_frames(frames: &[Frame]) -> usize {
    frames.iter().map(|f| f.frames()).sum()
}

pub fn assert_non_decreasing(frames: &[Frame]) {
    for pair in frames.windows(2) {
        assert!(
            pair[1].timestamp >= pair[0].timestamp,
            "timestamp went back from {:?} to {:?}",
            pair[0].timestamp,
            pair[1].timestamp
        );
    }
}

/// Track events received so far.
pub fn track_events(rx: &mut broadcast::Receiver<CoreEvent>) -> Vec<TrackEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(CoreEvent::Track(event)) => events.push(event),
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}
