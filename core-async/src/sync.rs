//! Synchronization primitives.
//!
//! Async-aware primitives come from `tokio::sync`; the cancellation token is
//! `tokio_util`'s, which can be polled synchronously with
//! [`CancellationToken::is_cancelled`] from blocking code and awaited from
//! async code.
//!
//! ```rust
//! use core_async::sync::CancellationToken;
//!
//! let parent = CancellationToken::new();
//! let child = parent.child_token();
//! parent.cancel();
//! assert!(child.is_cancelled());
//! ```

pub use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
pub use tokio_util::sync::CancellationToken;
