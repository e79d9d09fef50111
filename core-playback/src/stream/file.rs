use super::ByteSource;
use crate::error::Result;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;

/// Local file source.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    length: u64,
    position: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let length = file.metadata()?.len();
        debug!(path = %path.display(), length, "Opened local file");
        Ok(Self {
            file,
            length,
            position: 0,
        })
    }
}

impl ByteSource for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = loop {
            match self.file.read(buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        self.position += n as u64;
        Ok(n)
    }

    fn seek(&mut self, position: u64) -> Result<u64> {
        self.position = self.file.seek(SeekFrom::Start(position))?;
        Ok(self.position)
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn length(&self) -> Option<u64> {
        Some(self.length)
    }

    fn position(&self) -> u64 {
        self.position
    }
}
