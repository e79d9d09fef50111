//! Async I/O traits used by transport bridges.
//!
//! HTTP bodies are exposed to the core as `AsyncRead` streams; the seekable
//! stream layer reads them through [`AsyncReadExt`] from blocking workers.

pub use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// Boxed async byte stream handed across the bridge boundary.
pub type BoxAsyncRead = Box<dyn AsyncRead + Send + Unpin>;
