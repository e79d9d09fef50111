//! # Container Prober
//!
//! Identifies the container of a fresh stream by running every registered
//! probe function over the first `probe_bytes` bytes.
//!
//! The bytes are read through the stream's look-ahead window, so the stream
//! is back at offset zero afterwards even when the source cannot seek. The
//! window stays retained until the demuxer commits.

use crate::config::MAX_PROBE_BYTES;
use crate::error::{PlaybackError, Result};
use crate::registry::{ContainerDescriptor, FormatRegistry};
use crate::stream::StreamHandle;
use tracing::{debug, info, warn};

/// Minimum confidence a probe winner must reach.
pub const DISAMBIGUATION_THRESHOLD: u8 = 50;

#[derive(Debug, Clone, Copy)]
pub struct Prober {
    probe_bytes: usize,
}

impl Prober {
    pub fn new(probe_bytes: usize) -> Self {
        Self {
            probe_bytes: probe_bytes.clamp(1, MAX_PROBE_BYTES),
        }
    }

    pub fn probe_bytes(&self) -> usize {
        self.probe_bytes
    }

    /// Picks the most confident container. Equal confidence goes to the
    /// earlier registration.
    pub fn probe(
        &self,
        stream: &mut StreamHandle,
        registry: &FormatRegistry,
    ) -> Result<ContainerDescriptor> {
        stream.begin_lookahead(self.probe_bytes);
        let window = stream.peek(self.probe_bytes)?.to_vec();

        let mut best: Option<(usize, u8)> = None;
        for (index, entry) in registry.container_entries().iter().enumerate() {
            let Some(confidence) = (entry.probe)(&window) else {
                continue;
            };
            let confidence = confidence.min(100);
            debug!(container = %entry.kind, confidence, "Probe match");
            if best.map_or(true, |(_, c)| confidence > c) {
                best = Some((index, confidence));
            }
        }

        stream.rewind()?;

        match best {
            Some((index, confidence)) if confidence >= DISAMBIGUATION_THRESHOLD => {
                let entry = &registry.container_entries()[index];
                info!(
                    container = %entry.kind,
                    confidence,
                    window = window.len(),
                    "Container identified"
                );
                Ok(ContainerDescriptor {
                    kind: entry.kind.clone(),
                    confidence,
                    factory: entry.factory.clone(),
                })
            }
            other => {
                warn!(
                    best = ?other.map(|(_, c)| c),
                    window = window.len(),
                    "No container reached the probe threshold"
                );
                Err(PlaybackError::UnsupportedFormat(
                    "unrecognized format".to_string(),
                ))
            }
        }
    }
}

impl Default for Prober {
    fn default() -> Self {
        Self::new(8 * 1024)
    }
}
