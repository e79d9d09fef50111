use super::ByteSource;
use crate::error::{PlaybackError, Result};
use bytes::Bytes;

/// In-memory byte source.
///
/// [`MemorySource::non_seekable`] behaves like a live network stream and is
/// what tests use to exercise the look-ahead path.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
    position: usize,
    seekable: bool,
    length_known: bool,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            position: 0,
            seekable: true,
            length_known: true,
        }
    }

    /// A forward-only source of unknown length.
    pub fn non_seekable(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            position: 0,
            seekable: false,
            length_known: false,
        }
    }
}

impl ByteSource for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let available = &self.data[self.position.min(self.data.len())..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.position += n;
        Ok(n)
    }

    fn seek(&mut self, position: u64) -> Result<u64> {
        if !self.seekable {
            return Err(PlaybackError::SeekNotSupported);
        }
        self.position = usize::try_from(position).unwrap_or(usize::MAX);
        Ok(position)
    }

    fn is_seekable(&self) -> bool {
        self.seekable
    }

    fn length(&self) -> Option<u64> {
        self.length_known.then_some(self.data.len() as u64)
    }

    fn position(&self) -> u64 {
        self.position as u64
    }
}
