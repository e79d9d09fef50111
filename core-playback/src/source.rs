//! # Track Sources
//!
//! A [`TrackSource`] resolves an identifier to a byte stream plus whatever
//! metadata the source already knows. Source-specific resolution (service
//! lookups, signed URLs) lives outside the engine behind this trait.

use crate::error::{PlaybackError, Result};
use crate::stream::{FileSource, HttpSource, MemorySource, StreamHandle};
use crate::types::TrackMetadata;
use bridge_traits::http::HttpClient;
use bytes::Bytes;
use core_async::runtime::Handle;
use core_runtime::config::{CoreConfig, FeatureFlags};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A resolved track: its stream and the metadata known up front.
#[derive(Debug)]
pub struct OpenedTrack {
    pub stream: StreamHandle,
    pub metadata: TrackMetadata,
}

/// Resolves identifiers to streams.
///
/// `open` runs on the track's blocking worker and may block on I/O.
pub trait TrackSource: Send + Sync {
    fn open(&self, identifier: &str) -> Result<OpenedTrack>;
}

// ============================================================================
// Default Source
// ============================================================================

/// `http://` / `https://` identifiers go through the [`HttpClient`] bridge,
/// everything else is a local path (an optional `file://` prefix is
/// stripped).
pub struct DefaultTrackSource {
    http: Option<Arc<dyn HttpClient>>,
    handle: Handle,
    read_timeout: Duration,
    features: FeatureFlags,
}

impl DefaultTrackSource {
    pub fn new(http: Option<Arc<dyn HttpClient>>, handle: Handle, read_timeout: Duration) -> Self {
        Self {
            http,
            handle,
            read_timeout,
            features: FeatureFlags::default(),
        }
    }

    /// Source honouring the host's capability wiring and feature flags.
    pub fn from_core_config(config: &CoreConfig, handle: Handle, read_timeout: Duration) -> Self {
        Self {
            http: config.http_client.clone(),
            handle,
            read_timeout,
            features: config.features,
        }
    }

    pub fn with_features(mut self, features: FeatureFlags) -> Self {
        self.features = features;
        self
    }

    fn is_remote(identifier: &str) -> bool {
        let lower = identifier.to_ascii_lowercase();
        lower.starts_with("http://") || lower.starts_with("https://")
    }

    fn open_remote(&self, url: &str) -> Result<StreamHandle> {
        if !self.features.remote_sources {
            return Err(PlaybackError::Source(
                "remote sources are disabled".to_string(),
            ));
        }
        let client = self.http.clone().ok_or_else(|| {
            PlaybackError::Source("no HTTP client configured for remote sources".to_string())
        })?;
        let source = HttpSource::open(client, self.handle.clone(), url, self.read_timeout)?;
        Ok(StreamHandle::new(Box::new(source)))
    }

    fn open_local(&self, identifier: &str) -> Result<StreamHandle> {
        if !self.features.local_files {
            return Err(PlaybackError::Source(
                "local files are disabled".to_string(),
            ));
        }
        let path = PathBuf::from(identifier.strip_prefix("file://").unwrap_or(identifier));
        let source = FileSource::open(&path).map_err(|e| match e {
            PlaybackError::Io(io) => {
                PlaybackError::Source(format!("cannot open {}: {}", path.display(), io))
            }
            other => other,
        })?;
        Ok(StreamHandle::new(Box::new(source)))
    }
}

impl TrackSource for DefaultTrackSource {
    fn open(&self, identifier: &str) -> Result<OpenedTrack> {
        let remote = Self::is_remote(identifier);
        debug!(identifier, remote, "Opening track source");
        let stream = if remote {
            self.open_remote(identifier)?
        } else {
            self.open_local(identifier)?
        };
        Ok(OpenedTrack {
            stream,
            metadata: TrackMetadata::new(identifier),
        })
    }
}

impl fmt::Debug for DefaultTrackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultTrackSource")
            .field("http", &self.http.as_ref().map(|_| "HttpClient { ... }"))
            .field("read_timeout", &self.read_timeout)
            .field("features", &self.features)
            .finish()
    }
}

// ============================================================================
// In-Memory Source
// ============================================================================

/// Serves registered byte buffers by identifier.
#[derive(Debug, Default, Clone)]
pub struct MemoryTrackSource {
    tracks: Arc<RwLock<HashMap<String, (Bytes, TrackMetadata, bool)>>>,
}

impl MemoryTrackSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a seekable track.
    pub fn insert(&self, identifier: impl Into<String>, data: impl Into<Bytes>) {
        let identifier = identifier.into();
        let metadata = TrackMetadata::new(identifier.clone());
        self.tracks
            .write()
            .insert(identifier, (data.into(), metadata, true));
    }

    /// Registers a forward-only track, like a live stream.
    pub fn insert_non_seekable(&self, identifier: impl Into<String>, data: impl Into<Bytes>) {
        let identifier = identifier.into();
        let metadata = TrackMetadata::new(identifier.clone());
        self.tracks
            .write()
            .insert(identifier, (data.into(), metadata, false));
    }

    /// Registers a track with metadata supplied by the source.
    pub fn insert_with_metadata(&self, data: impl Into<Bytes>, metadata: TrackMetadata) {
        self.tracks.write().insert(
            metadata.source_identifier.clone(),
            (data.into(), metadata, true),
        );
    }
}

impl TrackSource for MemoryTrackSource {
    fn open(&self, identifier: &str) -> Result<OpenedTrack> {
        let tracks = self.tracks.read();
        let (data, metadata, seekable) = tracks
            .get(identifier)
            .ok_or_else(|| PlaybackError::Source(format!("unknown track: {}", identifier)))?;
        let source = if *seekable {
            MemorySource::new(data.clone())
        } else {
            MemorySource::non_seekable(data.clone())
        };
        Ok(OpenedTrack {
            stream: StreamHandle::new(Box::new(source)),
            metadata: metadata.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use bridge_traits::http::{HttpRequest, HttpStreamResponse};
    use mockall::mock;
    use std::io::Write;

    mock! {
        Http {}

        #[async_trait]
        impl HttpClient for Http {
            async fn open_stream(&self, request: HttpRequest) -> BridgeResult<HttpStreamResponse>;
        }
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_memory_source() {
        let source = MemoryTrackSource::new();
        source.insert("a", vec![1u8, 2, 3]);
        source.insert_non_seekable("live", vec![4u8]);

        let opened = source.open("a").unwrap();
        assert!(opened.stream.is_seekable());
        assert_eq!(opened.metadata.source_identifier, "a");
        assert!(!source.open("live").unwrap().stream.is_seekable());
        assert!(matches!(source.open("b"), Err(PlaybackError::Source(_))));
    }

    #[test]
    fn test_local_file() {
        let rt = runtime();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"RIFF").unwrap();
        let path = file.path().to_string_lossy().to_string();

        let source = DefaultTrackSource::new(None, rt.handle().clone(), Duration::from_secs(1));
        let mut opened = source.open(&format!("file://{}", path)).unwrap();
        let mut head = [0u8; 4];
        opened.stream.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"RIFF");

        assert!(matches!(
            source.open("/definitely/not/here.wav"),
            Err(PlaybackError::Source(_))
        ));
    }

    #[test]
    fn test_remote_requires_client() {
        let rt = runtime();
        let source = DefaultTrackSource::new(None, rt.handle().clone(), Duration::from_secs(1));
        assert!(matches!(
            source.open("https://example.com/a.ogg"),
            Err(PlaybackError::Source(_))
        ));
    }

    #[test]
    fn test_remote_goes_through_bridge() {
        let rt = runtime();
        let mut http = MockHttp::new();
        http.expect_open_stream().times(1).returning(|_| {
            Err(BridgeError::Status {
                status: 404,
                message: "not found".into(),
            })
        });
        let source = DefaultTrackSource::new(
            Some(Arc::new(http)),
            rt.handle().clone(),
            Duration::from_secs(1),
        );
        let err = source.open("HTTPS://example.com/missing.mp3").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_feature_flags() {
        let rt = runtime();
        let source = DefaultTrackSource::new(None, rt.handle().clone(), Duration::from_secs(1))
            .with_features(FeatureFlags {
                remote_sources: true,
                local_files: false,
            });
        assert!(matches!(
            source.open("/tmp/x.flac"),
            Err(PlaybackError::Source(_))
        ));
    }
}
