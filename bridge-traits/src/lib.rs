//! # Host Bridge Traits
//!
//! Capabilities the playback core needs from its host, expressed as traits so
//! each platform can supply its own implementation.
//!
//! ## Traits
//!
//! - [`HttpClient`](http::HttpClient) - Async HTTP with ranged streaming bodies
//! - [`LoggerSink`](log::LoggerSink) - Forward structured logs to host logging
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! convert their platform errors into it and classify them through
//! [`BridgeError::is_transient`] so the core can decide whether to retry.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync`: the core calls them from blocking
//! decode workers as well as from async tasks.
//!
//! ## Example
//!
//! ```ignore
//! use bridge_traits::http::{HttpClient, HttpRequest, HttpStreamResponse};
//! use bridge_traits::error::Result;
//! use async_trait::async_trait;
//!
//! pub struct MyHttpClient;
//!
//! #[async_trait]
//! impl HttpClient for MyHttpClient {
//!     async fn open_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse> {
//!         todo!()
//!     }
//! }
//! ```

pub mod error;
pub mod http;
pub mod log;

pub use error::BridgeError;

pub use http::{
    ContentRange, HttpClient, HttpMethod, HttpRequest, HttpStreamResponse, RetryPolicy,
};
pub use log::{ConsoleLogger, LogEntry, LogLevel, LoggerSink};
