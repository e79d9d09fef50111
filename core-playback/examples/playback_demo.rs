//! # Headless playback demo
//!
//! Decodes a local file or an HTTP(S) URL to a null sink, printing track
//! events and a summary at the end.
//!
//! Run with:
//! `cargo run --example playback_demo --package core-playback -- <path-or-url> [seek-seconds]`

use anyhow::{bail, Context};
use core_playback::{Command, ExecutorContext, PlaybackEngine, PollResult};
use core_runtime::config::CoreConfig;
use core_runtime::events::CoreEvent;
use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
use std::time::{Duration, Instant};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging(LoggingConfig::default().with_format(LogFormat::Compact))
        .context("failed to initialise logging")?;

    let mut args = std::env::args().skip(1);
    let Some(identifier) = args.next() else {
        bail!("usage: playback_demo <path-or-url> [seek-seconds]");
    };
    let seek = args
        .next()
        .map(|s| s.parse::<f64>().map(Duration::from_secs_f64))
        .transpose()
        .context("seek position must be a number of seconds")?;

    let core = CoreConfig::builder().build()?;
    let engine = PlaybackEngine::from_core_config(ExecutorContext::current()?, &core);

    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let CoreEvent::Track(event) = event {
                println!("event: {:?}", event);
            }
        }
    });

    let track = engine.load(&identifier)?;
    let started = Instant::now();

    // The track handle blocks, so the consumer loop lives off the runtime.
    let track = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let mut frames = 0usize;
        let mut seek = seek;
        loop {
            match track.poll_frame(Duration::from_millis(100)) {
                PollResult::Frame(frame) => {
                    frames += frame.frames();
                    if let Some(target) = seek.take() {
                        track.submit_command(Command::Seek(target))?;
                    }
                }
                PollResult::NoFrameYet => {}
                PollResult::TrackEnded => break,
            }
        }
        println!("decoded {} frames", frames);
        Ok(track)
    })
    .await??;

    let metadata = track.metadata();
    let stats = track.stats();
    println!("state:     {:?}", track.current_state());
    println!("title:     {}", metadata.title.as_deref().unwrap_or("-"));
    println!("artist:    {}", metadata.artist.as_deref().unwrap_or("-"));
    println!("duration:  {:?}", metadata.duration);
    println!("position:  {:?}", track.current_position());
    println!(
        "packets:   {} ({:.3} ms avg decode)",
        stats.packets_read, stats.avg_decode_time_ms
    );
    println!("recovered: {}", stats.recovered_errors);
    println!("elapsed:   {:?}", started.elapsed());

    if let Some(failure) = track.failure() {
        bail!("track failed ({:?}): {}", failure.kind, failure.message);
    }
    Ok(())
}
