//! # Demuxers
//!
//! One demuxer per container family. A demuxer owns the [`StreamHandle`],
//! parses headers when it is constructed and then yields compressed
//! [`Packet`]s in presentation order.
//!
//! | Container | Malformed data | Seek |
//! |-----------|----------------|------|
//! | WAV | fatal | computed byte offset |
//! | FLAC | resync on frame header | SEEKTABLE, then discard |
//! | MP3 | resync on frame header pair | Xing TOC or CBR arithmetic, then discard |
//! | ADTS | resync on frame header pair | known frame starts, then discard |
//! | Ogg | resync on `OggS` + CRC | granule bisection, then discard |
//! | Matroska | resync on Cluster | Cues, then discard |

pub mod adts;
pub mod flac;
pub mod matroska;
pub mod mpeg;
pub mod ogg;
pub mod tags;
pub mod wav;

pub(crate) mod bytes;

use crate::error::Result;
use crate::stream::StreamHandle;
use crate::types::{CodecParameters, ContainerKind, ContainerMetadata, Packet};
use std::sync::Arc;
use std::time::Duration;

/// How a demuxer reacts to structurally invalid data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncPolicy {
    /// Skip to the next sync point and report one recoverable error.
    Resync,
    /// Any malformed data ends the track.
    Fatal,
}

/// Options handed to every demuxer factory.
#[derive(Debug, Clone)]
pub struct DemuxOptions {
    /// Largest buffer a size field may request.
    pub max_allocation_bytes: u64,
}

impl Default for DemuxOptions {
    fn default() -> Self {
        Self {
            max_allocation_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Container reader producing packets for a single audio track.
pub trait Demuxer: Send {
    fn kind(&self) -> ContainerKind;

    fn codec_parameters(&self) -> &CodecParameters;

    /// Tags found in the container.
    fn metadata(&self) -> &ContainerMetadata;

    /// Next packet; `Ok(None)` at end of stream.
    ///
    /// A recoverable [`MalformedData`](crate::PlaybackError::MalformedData)
    /// error is returned once per corrupt region, after the demuxer has
    /// already moved past it.
    fn next_packet(&mut self) -> Result<Option<Packet>>;

    /// Repositions so the next packet is the first one at or after `target`.
    ///
    /// Returns the timestamp of that packet (or the end of the track).
    fn seek(&mut self, target: Duration) -> Result<Duration>;

    fn can_seek(&self) -> bool;

    fn resync_policy(&self) -> ResyncPolicy;

    /// The owned stream; the executor swaps its cancellation token around
    /// each seek.
    fn stream_mut(&mut self) -> &mut StreamHandle;
}

/// Quick signature check; returns a confidence in `0..=100`.
pub type ProbeFn = Arc<dyn Fn(&[u8]) -> Option<u8> + Send + Sync>;

/// Builds a demuxer from a stream positioned at offset zero.
pub type DemuxerFactory =
    Arc<dyn Fn(StreamHandle, &DemuxOptions) -> Result<Box<dyn Demuxer>> + Send + Sync>;

/// Reads packets until one starts at or after `target` ticks.
///
/// Recoverable errors on the way are skipped; the returned packet must be
/// handed out by the next `next_packet` call.
pub(crate) fn discard_until<F>(target: u64, mut next: F) -> Result<Option<Packet>>
where
    F: FnMut() -> Result<Option<Packet>>,
{
    loop {
        match next() {
            Ok(Some(packet)) if packet.timestamp >= target => return Ok(Some(packet)),
            Ok(Some(_)) => continue,
            Ok(None) => return Ok(None),
            Err(err) if err.is_recoverable() => continue,
            Err(err) => return Err(err),
        }
    }
}
