//! Remote playback through a mocked HTTP bridge.

mod common;

use async_trait::async_trait;
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::http::{HttpClient, HttpRequest, HttpStreamResponse};
use bytes::Bytes;
use common::*;
use core_playback::{Command, ExecutorContext, PlaybackEngine, TrackState};
use core_runtime::config::CoreConfig;
use core_runtime::events::{CoreEvent, FailureKind, StreamEvent, TrackEvent};
use mockall::mock;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

mock! {
    Http {}

    #[async_trait]
    impl HttpClient for Http {
        async fn open_stream(&self, request: HttpRequest) -> BridgeResult<HttpStreamResponse>;
    }
}

fn range_start(request: &HttpRequest) -> u64 {
    request
        .headers
        .get("Range")
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.trim_end_matches('-').parse().ok())
        .unwrap_or(0)
}

/// Server honouring `Range: bytes=<n>-` over `data`.
fn ranged_server(data: Bytes) -> MockHttp {
    flaky_server(data, Arc::new(AtomicU32::new(0)))
}

/// Ranged server answering `503` while `unavailable` is above zero.
fn flaky_server(data: Bytes, unavailable: Arc<AtomicU32>) -> MockHttp {
    let mut http = MockHttp::new();
    http.expect_open_stream().returning(move |request| {
        if unavailable
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BridgeError::Status {
                status: 503,
                message: "Service Unavailable".into(),
            });
        }
        let start = range_start(&request) as usize;
        let total = data.len();
        if start >= total {
            return Ok(HttpStreamResponse {
                status: 416,
                headers: HashMap::new(),
                body: Box::new(Cursor::new(Bytes::new())),
            });
        }
        let mut headers = HashMap::new();
        headers.insert(
            "Content-Range".to_string(),
            format!("bytes {}-{}/{}", start, total - 1, total),
        );
        headers.insert("Content-Length".to_string(), (total - start).to_string());
        Ok(HttpStreamResponse {
            status: 206,
            headers,
            body: Box::new(Cursor::new(data.slice(start..))),
        })
    });
    http
}

fn remote_engine(http: MockHttp) -> PlaybackEngine {
    let core = CoreConfig::builder()
        .http_client(Arc::new(http))
        .event_buffer_size(512)
        .build()
        .unwrap();
    PlaybackEngine::from_core_config(ExecutorContext::current().unwrap(), &core)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_wav_plays_and_seeks() {
    let samples = ramp(8_000 * 4);
    let engine = remote_engine(ranged_server(wav_s16(&samples, 8_000, 1).into()));
    let mut rx = engine.subscribe();
    let track = engine.load("https://cdn.example.com/audio/a.wav?sig=abc").unwrap();

    let track = tokio::task::spawn_blocking(move || {
        assert_eq!(
            track.wait_for_state(|s| s == TrackState::Playing, Duration::from_secs(5)),
            TrackState::Playing
        );
        track.submit_command(Command::Seek(Duration::from_secs(3))).unwrap();
        let frames = drain(&track);
        assert_eq!(total_frames(&frames), 8_000);
        assert_eq!(frames[0].timestamp, Duration::from_secs(3));
        assert_eq!(frames[0].samples[0], samples[24_000] as f32 / 32768.0);
        track
    })
    .await
    .unwrap();

    assert_eq!(track.current_state(), TrackState::Finished);
    let mut seeked = false;
    while let Ok(event) = rx.try_recv() {
        if let CoreEvent::Track(TrackEvent::Seeked { landed_ms, .. }) = event {
            assert_eq!(landed_ms, 3_000);
            seeked = true;
        }
    }
    assert!(seeked);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_open_retries_unavailable_server() {
    let samples = ramp(8_000);
    let unavailable = Arc::new(AtomicU32::new(1));
    let engine = remote_engine(flaky_server(
        wav_s16(&samples, 8_000, 1).into(),
        unavailable.clone(),
    ));
    let mut rx = engine.subscribe();
    let track = engine.load("https://cdn.example.com/audio/busy.wav").unwrap();

    let (track, frames) = tokio::task::spawn_blocking(move || {
        let frames = drain(&track);
        (track, frames)
    })
    .await
    .unwrap();

    assert_eq!(track.current_state(), TrackState::Finished);
    assert_eq!(total_frames(&frames), 8_000);
    assert_eq!(frames[0].timestamp, Duration::ZERO);
    assert_eq!(unavailable.load(Ordering::SeqCst), 0);

    let mut retries = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let CoreEvent::Stream(StreamEvent::RetryScheduled { attempt, reason, .. }) = event {
            retries.push((attempt, reason));
        }
    }
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].0, 1);
    assert!(retries[0].1.contains("503"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_not_found_fails_track() {
    let mut http = MockHttp::new();
    http.expect_open_stream().times(1).returning(|_| {
        Err(BridgeError::Status {
            status: 404,
            message: "Not Found".into(),
        })
    });
    let engine = remote_engine(http);
    let track = engine.load("https://cdn.example.com/missing.flac").unwrap();

    let track = tokio::task::spawn_blocking(move || {
        track.wait_for_state(|s| s.is_terminal(), Duration::from_secs(5));
        track
    })
    .await
    .unwrap();

    assert_eq!(track.current_state(), TrackState::Failed);
    let failure = track.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Internal);
    assert!(failure.retryable);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_disabled_by_feature_flags() {
    let core = CoreConfig::builder()
        .http_client(Arc::new(MockHttp::new()))
        .features(core_runtime::config::FeatureFlags {
            remote_sources: false,
            local_files: true,
        })
        .build()
        .unwrap();
    let engine = PlaybackEngine::from_core_config(ExecutorContext::current().unwrap(), &core);
    let track = engine.load("https://cdn.example.com/a.mp3").unwrap();

    let state = tokio::task::spawn_blocking(move || {
        track.wait_for_state(|s| s.is_terminal(), Duration::from_secs(5))
    })
    .await
    .unwrap();
    assert_eq!(state, TrackState::Failed);
}
