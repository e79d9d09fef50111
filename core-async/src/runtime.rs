//! Runtime handles and blocking bridges.
//!
//! Blocking code (demuxers, decoders, the track executor) never owns a
//! runtime. It receives a [`Handle`] and enters async code through
//! [`block_on_with_timeout`], which bounds every remote operation so a
//! stalled peer cannot pin a decode worker forever.

use std::future::Future;
use std::io;
use std::time::Duration;

pub use tokio::runtime::{Builder, Handle, Runtime};
pub use tokio::time::error::Elapsed;

/// Runs the provided future to completion on a throwaway current-thread runtime.
///
/// Intended for one-off calls from threads that are not attached to any
/// runtime (log sinks, tests).
pub fn block_on<F>(future: F) -> io::Result<F::Output>
where
    F: Future,
{
    let rt = Builder::new_current_thread().enable_all().build()?;
    Ok(rt.block_on(future))
}

/// Drives `future` on `handle` from a blocking thread, giving up after `timeout`.
///
/// Must be called from a thread that is not itself executing async tasks
/// (a `spawn_blocking` worker or a plain OS thread).
pub fn block_on_with_timeout<F>(
    handle: &Handle,
    timeout: Duration,
    future: F,
) -> Result<F::Output, Elapsed>
where
    F: Future,
{
    handle.block_on(async move { tokio::time::timeout(timeout, future).await })
}

/// Returns the handle of the runtime the caller is running on, if any.
pub fn try_current() -> Option<Handle> {
    Handle::try_current().ok()
}
