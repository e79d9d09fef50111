//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux):
//! - `HttpClient` using `reqwest`, with ranged streaming bodies for the
//!   seekable network stream
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::ReqwestHttpClient;
//! use std::sync::Arc;
//!
//! let http = Arc::new(ReqwestHttpClient::new()?);
//! let config = CoreConfig::builder().http_client(http).build()?;
//! ```

mod http;

pub use http::ReqwestHttpClient;
