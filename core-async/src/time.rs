//! Time-related helpers.
//!
//! Re-exports `tokio::time` for async callers and adds
//! [`sleep_cancellable`] for blocking callers that must stay responsive to a
//! [`CancellationToken`].

pub use std::time::{Duration, Instant};
pub use tokio::time::{sleep, timeout};

use crate::sync::CancellationToken;

/// Granularity at which blocking waits re-check their cancellation token.
pub const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Blocks the current thread for `duration` unless `token` is cancelled first.
///
/// Returns `true` when the full duration elapsed, `false` when cancelled.
pub fn sleep_cancellable(duration: Duration, token: &CancellationToken) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if token.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(CANCEL_CHECK_INTERVAL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_cancellable_completes() {
        let token = CancellationToken::new();
        let start = Instant::now();
        assert!(sleep_cancellable(Duration::from_millis(30), &token));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_sleep_cancellable_returns_early() {
        let token = CancellationToken::new();
        let remote = token.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });

        let start = Instant::now();
        assert!(!sleep_cancellable(Duration::from_secs(5), &token));
        assert!(start.elapsed() < Duration::from_secs(1));
        canceller.join().unwrap();
    }

    #[test]
    fn test_sleep_cancellable_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(!sleep_cancellable(Duration::from_secs(1), &token));
    }
}
