//! # Core Configuration Module
//!
//! Runtime configuration for the Audio Playback Core.
//!
//! The builder collects the host capabilities the engine needs and fails fast
//! with an actionable message when one is missing. Remote sources require an
//! [`HttpClient`]; with the `desktop-shims` feature a `reqwest`-backed client
//! is injected automatically when none is supplied.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//! use core_runtime::logging::{LogFormat, LoggingConfig};
//!
//! let config = CoreConfig::builder()
//!     .logging(LoggingConfig::default().with_format(LogFormat::Compact))
//!     .event_buffer_size(256)
//!     .build()?;
//! ```
//!
//! Local-only hosts can disable remote sources and skip the HTTP bridge:
//!
//! ```rust
//! use core_runtime::config::{CoreConfig, FeatureFlags};
//!
//! let config = CoreConfig::builder()
//!     .features(FeatureFlags { remote_sources: false, local_files: true })
//!     .build()
//!     .unwrap();
//! assert!(config.http_client.is_none());
//! ```

use crate::error::{Error, Result};
use crate::events::{EventBus, DEFAULT_EVENT_BUFFER_SIZE};
use crate::logging::LoggingConfig;
use bridge_traits::HttpClient;
use std::fmt;
use std::sync::Arc;

/// Largest accepted event channel capacity.
const MAX_EVENT_BUFFER_SIZE: usize = 65_536;

/// Core runtime configuration. Use [`CoreConfigBuilder`] to construct it.
#[derive(Clone)]
pub struct CoreConfig {
    /// HTTP client for remote sources (required when `remote_sources` is on)
    pub http_client: Option<Arc<dyn HttpClient>>,

    /// Logging setup applied by the host at startup
    pub logging: LoggingConfig,

    /// Per-subscriber capacity of the event bus
    pub event_buffer_size: usize,

    pub features: FeatureFlags,
}

impl fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreConfig")
            .field(
                "http_client",
                &self.http_client.as_ref().map(|_| "HttpClient { ... }"),
            )
            .field("logging", &self.logging)
            .field("event_buffer_size", &self.event_buffer_size)
            .field("features", &self.features)
            .finish()
    }
}

/// Which kinds of track identifiers the engine accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureFlags {
    /// Accept `http://` and `https://` identifiers
    pub remote_sources: bool,

    /// Accept local filesystem paths
    pub local_files: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            remote_sources: true,
            local_files: true,
        }
    }
}

impl CoreConfig {
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Check the assembled configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.event_buffer_size == 0 || self.event_buffer_size > MAX_EVENT_BUFFER_SIZE {
            return Err(Error::Config(format!(
                "event_buffer_size must be between 1 and {}, got {}",
                MAX_EVENT_BUFFER_SIZE, self.event_buffer_size
            )));
        }

        if !self.features.remote_sources && !self.features.local_files {
            return Err(Error::Config(
                "At least one of remote_sources or local_files must be enabled".to_string(),
            ));
        }

        if self.features.remote_sources && self.http_client.is_none() {
            return Err(missing_http_client());
        }

        Ok(())
    }

    /// The HTTP client, or an actionable error when remote sources are unusable.
    pub fn require_http_client(&self) -> Result<Arc<dyn HttpClient>> {
        self.http_client.clone().ok_or_else(missing_http_client)
    }

    /// Create the event bus sized for this configuration.
    pub fn create_event_bus(&self) -> EventBus {
        EventBus::new(self.event_buffer_size)
    }
}

fn missing_http_client() -> Error {
    Error::capability_missing(
        "HttpClient",
        "No HTTP client implementation provided. \
         Desktop: enable the `desktop-shims` feature. \
         Other hosts: inject an HttpClient or disable remote sources.",
    )
}

/// Builder for [`CoreConfig`].
#[derive(Default)]
pub struct CoreConfigBuilder {
    http_client: Option<Arc<dyn HttpClient>>,
    logging: Option<LoggingConfig>,
    event_buffer_size: Option<usize>,
    features: FeatureFlags,
}

impl CoreConfigBuilder {
    /// Set the HTTP client used for remote sources.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = Some(logging);
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    pub fn features(mut self, features: FeatureFlags) -> Self {
        self.features = features;
        self
    }

    /// Builds the final `CoreConfig`, injecting desktop defaults where the
    /// `desktop-shims` feature allows it.
    pub fn build(self) -> Result<CoreConfig> {
        let http_client = match self.http_client {
            Some(client) => Some(client),
            None if self.features.remote_sources => provide_default_http_client()?,
            None => None,
        };

        let config = CoreConfig {
            http_client,
            logging: self.logging.unwrap_or_default(),
            event_buffer_size: self.event_buffer_size.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
            features: self.features,
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client() -> Result<Option<Arc<dyn HttpClient>>> {
    let client = bridge_desktop::ReqwestHttpClient::new().map_err(|e| {
        Error::capability_missing(
            "HttpClient",
            format!("Failed to create default desktop HTTP client: {}", e),
        )
    })?;
    Ok(Some(Arc::new(client)))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client() -> Result<Option<Arc<dyn HttpClient>>> {
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::http::{HttpRequest, HttpStreamResponse};
    use mockall::mock;

    mock! {
        Http {}

        #[async_trait]
        impl HttpClient for Http {
            async fn open_stream(&self, request: HttpRequest) -> BridgeResult<HttpStreamResponse>;
        }
    }

    #[test]
    fn test_build_with_injected_http_client() {
        let config = CoreConfig::builder()
            .http_client(Arc::new(MockHttp::new()))
            .event_buffer_size(32)
            .build()
            .unwrap();

        assert!(config.http_client.is_some());
        assert_eq!(config.event_buffer_size, 32);
        assert!(config.require_http_client().is_ok());
    }

    #[test]
    fn test_local_only_does_not_need_http_client() {
        let config = CoreConfig::builder()
            .features(FeatureFlags {
                remote_sources: false,
                local_files: true,
            })
            .build()
            .unwrap();

        assert!(matches!(
            config.require_http_client(),
            Err(Error::CapabilityMissing { .. })
        ));
    }

    #[cfg(not(feature = "desktop-shims"))]
    #[test]
    fn test_remote_sources_without_client_fails_fast() {
        let err = CoreConfig::builder().build().unwrap_err();
        match err {
            Error::CapabilityMissing { capability, .. } => assert_eq!(capability, "HttpClient"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(feature = "desktop-shims")]
    #[test]
    fn test_desktop_shims_provide_http_client() {
        let config = CoreConfig::builder().build().unwrap();
        assert!(config.http_client.is_some());
    }

    #[test]
    fn test_invalid_event_buffer_size() {
        let err = CoreConfig::builder()
            .http_client(Arc::new(MockHttp::new()))
            .event_buffer_size(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_all_sources_disabled() {
        let err = CoreConfig::builder()
            .features(FeatureFlags {
                remote_sources: false,
                local_files: false,
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_event_bus_capacity_follows_config() {
        let config = CoreConfig::builder()
            .http_client(Arc::new(MockHttp::new()))
            .build()
            .unwrap();
        let bus = config.create_event_bus();
        let _rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
    }
}
