//! Seek, pause/resume and stop through the track handle.

mod common;

use common::*;
use core_playback::{
    Command, MemoryTrackSource, OpenedTrack, PlaybackError, PollResult, TrackSource, TrackState,
};
use core_runtime::events::{CoreEvent, EndReason, TrackEvent};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Blocks until a `Seeked` event arrives; returns `(requested_ms, landed_ms)`.
fn wait_seeked(rx: &mut broadcast::Receiver<CoreEvent>) -> (u64, u64) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        assert!(Instant::now() < deadline, "no Seeked event");
        match rx.try_recv() {
            Ok(CoreEvent::Track(TrackEvent::Seeked {
                requested_ms,
                landed_ms,
                ..
            })) => return (requested_ms, landed_ms),
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => std::thread::sleep(Duration::from_millis(5)),
        }
    }
}

/// Holds `open` until the test releases it.
struct GatedSource {
    inner: MemoryTrackSource,
    gate: Mutex<Option<mpsc::Receiver<()>>>,
}

impl TrackSource for GatedSource {
    fn open(&self, identifier: &str) -> core_playback::Result<OpenedTrack> {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.recv().unwrap();
        }
        self.inner.open(identifier)
    }
}

fn playing(track: &core_playback::TrackHandle) {
    assert_eq!(
        track.wait_for_state(|s| s == TrackState::Playing, Duration::from_secs(5)),
        TrackState::Playing
    );
}

#[test]
fn test_wav_seek_is_exact() {
    let rt = runtime();
    let samples = ramp(8_000 * 5);
    let source = MemoryTrackSource::new();
    source.insert("a.wav", wav_s16(&samples, 8_000, 1));
    let engine = engine(&rt, Arc::new(source));
    let mut rx = engine.subscribe();

    let track = engine.load("a.wav").unwrap();
    playing(&track);
    next_frame(&track);

    track.submit_command(Command::Seek(Duration::from_secs(2))).unwrap();
    let (requested, landed) = wait_seeked(&mut rx);
    assert_eq!((requested, landed), (2_000, 2_000));

    let frame = next_frame(&track);
    assert_eq!(frame.timestamp, Duration::from_secs(2));
    assert_eq!(frame.samples[0], samples[16_000] as f32 / 32768.0);
    assert_eq!(track.current_position(), Duration::from_secs(2));

    let rest = drain(&track);
    assert_eq!(total_frames(&rest) + frame.frames(), 8_000 * 3);
    assert_eq!(track.stats().seeks, 1);
}

#[test]
fn test_indexed_seek_lands_within_one_packet() {
    let rt = runtime();
    let source = MemoryTrackSource::new();
    source.insert("a.webm", matroska_pcm(4, true));
    let engine = engine(&rt, Arc::new(source));
    let mut rx = engine.subscribe();

    let track = engine.load("a.webm").unwrap();
    playing(&track);

    track
        .submit_command(Command::Seek(Duration::from_millis(2_250)))
        .unwrap();
    let (_, landed) = wait_seeked(&mut rx);
    assert!(landed.abs_diff(2_250) <= MKV_BLOCK_MS, "landed at {}", landed);

    let frames = drain(&track);
    assert_eq!(frames[0].timestamp, Duration::from_millis(landed));
    assert!(frames
        .iter()
        .all(|f| f.timestamp >= Duration::from_millis(landed)));
    assert_non_decreasing(&frames);
}

#[cfg(feature = "decoder-mp3")]
#[test]
fn test_unindexed_seek_lands_on_next_packet() {
    let rt = runtime();
    let source = MemoryTrackSource::new();
    source.insert("a.mp3", mp3_silence(60));
    let engine = engine(&rt, Arc::new(source));
    let mut rx = engine.subscribe();

    let track = engine.load("a.mp3").unwrap();
    playing(&track);

    let target = Duration::from_millis(500);
    track.submit_command(Command::Seek(target)).unwrap();
    let (_, landed) = wait_seeked(&mut rx);
    let frame_ms = MP3_FRAME_SAMPLES as f64 * 1000.0 / 44_100.0;
    assert!(landed >= 500 && (landed as f64) < 500.0 + frame_ms);

    let frame = next_frame(&track);
    assert!(frame.timestamp >= target);
    assert!(frame.timestamp.as_millis() as u64 == landed);
}

#[test]
fn test_seek_rejected_on_forward_only_stream() {
    let rt = runtime();
    let source = MemoryTrackSource::new();
    source.insert_non_seekable("live.wav", wav_s16(&ramp(80_000), 8_000, 1));
    let engine = engine(&rt, Arc::new(source));

    let track = engine.load("live.wav").unwrap();
    playing(&track);
    assert!(matches!(
        track.submit_command(Command::Seek(Duration::from_secs(1))),
        Err(PlaybackError::SeekNotSupported)
    ));
    assert_eq!(track.current_state(), TrackState::Playing);
}

#[test]
fn test_latest_seek_wins() {
    let rt = runtime();
    let source = MemoryTrackSource::new();
    source.insert("a.wav", wav_s16(&ramp(8_000 * 10), 8_000, 1));
    let engine = engine(&rt, Arc::new(source));
    let mut rx = engine.subscribe();

    let track = engine.load("a.wav").unwrap();
    playing(&track);
    track.submit_command(Command::Pause).unwrap();
    for secs in [1, 7, 3, 5] {
        track
            .submit_command(Command::Seek(Duration::from_secs(secs)))
            .unwrap();
    }
    track.submit_command(Command::Play).unwrap();

    // Only the newest target has to be honoured; earlier ones may or may
    // not have started before it arrived.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let (requested, landed) = wait_seeked(&mut rx);
        assert_eq!(requested, landed);
        if requested == 5_000 {
            break;
        }
        assert!(Instant::now() < deadline);
    }
    assert_eq!(next_frame(&track).timestamp, Duration::from_secs(5));
}

#[test]
fn test_pause_and_resume() {
    let rt = runtime();
    let source = MemoryTrackSource::new();
    source.insert("a.wav", wav_s16(&ramp(8_000 * 4), 8_000, 1));
    let engine = engine(&rt, Arc::new(source));
    let mut rx = engine.subscribe();

    let track = engine.load("a.wav").unwrap();
    playing(&track);
    let first = next_frame(&track);

    track.submit_command(Command::Pause).unwrap();
    assert_eq!(track.current_state(), TrackState::Paused);
    assert_eq!(track.poll_frame(Duration::from_millis(20)), PollResult::NoFrameYet);
    // Pausing twice is a no-op.
    track.submit_command(Command::Pause).unwrap();

    track.submit_command(Command::Play).unwrap();
    assert_eq!(track.current_state(), TrackState::Playing);
    let second = next_frame(&track);
    assert_eq!(second.timestamp, first.end());

    let events = track_events(&mut rx);
    let paused = events
        .iter()
        .filter(|e| matches!(e, TrackEvent::Paused { .. }))
        .count();
    let resumed = events
        .iter()
        .filter(|e| matches!(e, TrackEvent::Resumed { .. }))
        .count();
    assert_eq!((paused, resumed), (1, 1));
}

#[test]
fn test_pause_halts_producer() {
    let rt = runtime();
    let inner = MemoryTrackSource::new();
    inner.insert("a.wav", wav_s16(&ramp(8_000 * 30), 8_000, 1));
    let (release, gate) = mpsc::channel();
    let source = GatedSource {
        inner,
        gate: Mutex::new(Some(gate)),
    };
    let engine = engine(&rt, Arc::new(source));

    // Paused before the worker opens the track: nothing is read at all.
    let track = engine.load("a.wav").unwrap();
    track.submit_command(Command::Pause).unwrap();
    release.send(()).unwrap();
    assert_eq!(
        track.wait_for_state(|s| s == TrackState::Paused, Duration::from_secs(5)),
        TrackState::Paused
    );
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(track.stats().packets_read, 0);
    assert_eq!(track.buffer_stats().frames, 0);

    track.submit_command(Command::Play).unwrap();
    assert_eq!(next_frame(&track).timestamp, Duration::ZERO);

    // Paused mid-track: the read count settles and stays put.
    track.submit_command(Command::Pause).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    let (packets, buffered) = (track.stats().packets_read, track.buffer_stats().buffered);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(track.stats().packets_read, packets);
    assert_eq!(track.buffer_stats().buffered, buffered);

    track.submit_command(Command::Play).unwrap();
    let rest = drain(&track);
    assert!(!rest.is_empty());
}

#[test]
fn test_stop_then_commands_rejected() {
    let rt = runtime();
    let source = MemoryTrackSource::new();
    source.insert("a.wav", wav_s16(&ramp(8_000 * 20), 8_000, 1));
    let engine = engine(&rt, Arc::new(source));
    let mut rx = engine.subscribe();

    let track = engine.load("a.wav").unwrap();
    playing(&track);
    track.submit_command(Command::Stop).unwrap();

    assert_eq!(
        track.wait_for_state(|s| s.is_terminal(), Duration::from_secs(5)),
        TrackState::Finished
    );
    assert_eq!(track.poll_frame(Duration::from_millis(20)), PollResult::TrackEnded);
    assert!(matches!(
        track.submit_command(Command::Play),
        Err(PlaybackError::InvalidCommand(_))
    ));
    assert!(matches!(
        track.submit_command(Command::Seek(Duration::ZERO)),
        Err(PlaybackError::InvalidCommand(_))
    ));

    let ended: Vec<_> = track_events(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            TrackEvent::Ended { reason, .. } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(ended, vec![EndReason::Stopped]);
}

#[test]
fn test_stop_while_producer_blocked() {
    let rt = runtime();
    let source = MemoryTrackSource::new();
    source.insert("a.wav", wav_s16(&ramp(44_100 * 10), 44_100, 1));
    let engine = engine(&rt, Arc::new(source));

    let track = engine.load("a.wav").unwrap();
    playing(&track);
    // Nobody consumes, so the producer is parked on a full buffer.
    std::thread::sleep(Duration::from_millis(100));
    track.submit_command(Command::Stop).unwrap();
    assert_eq!(
        track.wait_for_state(|s| s.is_terminal(), Duration::from_secs(2)),
        TrackState::Finished
    );
}
