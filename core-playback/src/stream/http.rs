//! Ranged HTTP byte source.
//!
//! Every (re)connection issues `GET` with `Range: bytes=<pos>-`:
//!
//! - `206` with a parsable `Content-Range` makes the stream seekable and
//!   fixes its length
//! - `200` means the server ignores ranges; the stream is forward-only and a
//!   resume at a non-zero offset reads through the already consumed prefix
//! - `416` at or past the known end is end of stream
//!
//! Each body read runs on the runtime handle under the read timeout, so a
//! stalled server surfaces as [`PlaybackError::Timeout`] instead of pinning
//! the decode worker.

use super::ByteSource;
use crate::error::{PlaybackError, Result};
use bridge_traits::http::{HttpClient, HttpRequest};
use core_async::io::{AsyncReadExt, BoxAsyncRead};
use core_async::runtime::{block_on_with_timeout, Handle};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct HttpSource {
    client: Arc<dyn HttpClient>,
    handle: Handle,
    url: String,
    headers: HashMap<String, String>,
    read_timeout: Duration,
    body: Option<BoxAsyncRead>,
    position: u64,
    length: Option<u64>,
    ranges_supported: bool,
    at_end: bool,
}

impl HttpSource {
    /// Connects to `url` and reads the response headers.
    ///
    /// Must be called from a blocking thread, not from inside an async task.
    pub fn open(
        client: Arc<dyn HttpClient>,
        handle: Handle,
        url: impl Into<String>,
        read_timeout: Duration,
    ) -> Result<Self> {
        Self::open_with_headers(client, handle, url, HashMap::new(), read_timeout)
    }

    pub fn open_with_headers(
        client: Arc<dyn HttpClient>,
        handle: Handle,
        url: impl Into<String>,
        headers: HashMap<String, String>,
        read_timeout: Duration,
    ) -> Result<Self> {
        let mut source = Self {
            client,
            handle,
            url: url.into(),
            headers,
            read_timeout,
            body: None,
            position: 0,
            length: None,
            ranges_supported: false,
            at_end: false,
        };
        source.connect(0)?;
        info!(
            url = %core_runtime::logging::redact_url(&source.url),
            length = ?source.length,
            seekable = source.ranges_supported,
            "Opened HTTP source"
        );
        Ok(source)
    }

    fn connect(&mut self, offset: u64) -> Result<()> {
        self.body = None;
        self.at_end = false;

        let mut request = HttpRequest::get(self.url.clone())
            .range_from(offset)
            .timeout(self.read_timeout);
        for (key, value) in &self.headers {
            request = request.header(key.clone(), value.clone());
        }

        let client = Arc::clone(&self.client);
        let response = block_on_with_timeout(&self.handle, self.read_timeout, async move {
            client.open_stream(request).await
        })
        .map_err(|_| PlaybackError::Timeout(self.read_timeout))??;

        match response.status {
            206 => {
                let range = response.content_range().ok_or_else(|| {
                    PlaybackError::Source("206 response without a valid Content-Range".into())
                })?;
                if range.start != offset {
                    return Err(PlaybackError::Source(format!(
                        "server returned range starting at {} instead of {}",
                        range.start, offset
                    )));
                }
                self.ranges_supported = true;
                if range.total.is_some() {
                    self.length = range.total;
                }
                self.position = offset;
                self.body = Some(response.body);
            }
            200 => {
                self.ranges_supported = false;
                if let Some(len) = response.content_length() {
                    self.length = Some(len);
                }
                self.position = 0;
                self.body = Some(response.body);
                if offset > 0 {
                    warn!(offset, "Server ignored Range header, reading through prefix");
                    self.discard(offset)?;
                }
            }
            416 => match self.length {
                Some(len) if offset >= len => {
                    debug!(offset, "Range starts at end of stream");
                    self.position = offset;
                    self.at_end = true;
                }
                _ => {
                    return Err(PlaybackError::Source(format!(
                        "range starting at {} not satisfiable",
                        offset
                    )))
                }
            },
            status => {
                return Err(PlaybackError::Source(format!(
                    "unexpected HTTP status {}",
                    status
                )))
            }
        }
        Ok(())
    }

    fn discard(&mut self, mut count: u64) -> Result<()> {
        let mut scratch = vec![0u8; 16 * 1024];
        while count > 0 {
            let want = (count as usize).min(scratch.len());
            let n = self.read_body(&mut scratch[..want])?;
            if n == 0 {
                return Err(PlaybackError::Transport {
                    message: "connection closed while skipping to resume offset".into(),
                    exhausted: false,
                });
            }
            count -= n as u64;
        }
        Ok(())
    }

    fn read_body(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(body) = self.body.as_mut() else {
            return Ok(0);
        };
        let outcome = block_on_with_timeout(&self.handle, self.read_timeout, body.read(buf));
        match outcome {
            Err(_) => {
                self.body = None;
                Err(PlaybackError::Timeout(self.read_timeout))
            }
            Ok(Err(err)) => {
                self.body = None;
                Err(bridge_traits::error::BridgeError::Io(err).into())
            }
            Ok(Ok(n)) => {
                self.position += n as u64;
                Ok(n)
            }
        }
    }
}

impl ByteSource for HttpSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.at_end || self.length.is_some_and(|len| self.position >= len) {
            return Ok(0);
        }
        if self.body.is_none() {
            self.connect(self.position)?;
            if self.at_end {
                return Ok(0);
            }
        }
        let n = self.read_body(buf)?;
        if n == 0 {
            self.body = None;
            if let Some(len) = self.length {
                if self.position < len {
                    return Err(PlaybackError::Transport {
                        message: format!(
                            "connection closed at byte {} of {}",
                            self.position, len
                        ),
                        exhausted: false,
                    });
                }
            }
            self.at_end = true;
        }
        Ok(n)
    }

    fn seek(&mut self, position: u64) -> Result<u64> {
        if position == self.position {
            return Ok(position);
        }
        if !self.ranges_supported {
            return Err(PlaybackError::SeekNotSupported);
        }
        self.body = None;
        self.at_end = false;
        self.position = position;
        Ok(position)
    }

    fn is_seekable(&self) -> bool {
        self.ranges_supported
    }

    fn length(&self) -> Option<u64> {
        self.length
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn reconnect(&mut self, position: u64) -> Result<()> {
        debug!(position, "Reconnecting HTTP source");
        self.body = None;
        self.connect(position)
    }
}

impl fmt::Debug for HttpSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSource")
            .field("url", &core_runtime::logging::redact_url(&self.url))
            .field("position", &self.position)
            .field("length", &self.length)
            .field("ranges_supported", &self.ranges_supported)
            .finish_non_exhaustive()
    }
}
