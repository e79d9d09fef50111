//! Runtime glue for the Audio Playback Core.
//!
//! The decode pipeline runs on blocking worker threads while network I/O is
//! driven by Tokio. This crate is the single place where the two meet:
//!
//! - `runtime`: runtime handles and blocking bridges into async I/O
//! - `sync`: synchronization primitives and the cancellation token
//! - `time`: durations, timeouts and cancellable blocking waits
//! - `io`: async I/O traits used by the transport bridges
//!
//! All core-* and bridge-* crates depend on this crate instead of reaching
//! for Tokio directly.
//!
//! # Examples
//!
//! ```rust
//! use core_async::runtime;
//! use core_async::time::Duration;
//!
//! let rt = runtime::Runtime::new().unwrap();
//! let handle = rt.handle().clone();
//!
//! let value = std::thread::spawn(move || {
//!     runtime::block_on_with_timeout(&handle, Duration::from_secs(1), async { 7 })
//! })
//! .join()
//! .unwrap();
//!
//! assert_eq!(value.unwrap(), 7);
//! ```

pub mod io;
pub mod runtime;
pub mod sync;
pub mod time;

pub use sync::CancellationToken;
pub use time::{Duration, Instant};
