//! Per-session idle timer with activity-based renewal.
//!
//! Every successful I/O completion reschedules the timer to fire
//! `idle_timeout` in the future; if it is ever allowed to actually fire, the
//! session is torn down. The `ArcSwap<Instant>` gives a lock-free
//! "latest wins" field that both relay directions can renew independently.

use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;

/// Sentinel meaning "never expires" — used when `idle_timeout` is `None`
/// (a configured timeout of zero disables the idle timeout) and as the initial
/// value before the first renewal.
fn far_future() -> tokio::time::Instant {
    tokio::time::Instant::now() + Duration::from_secs(60 * 60 * 24 * 365 * 50)
}

/// One session's idle timer. Cloning shares the same underlying state, so
/// both I/O pumps of a TCP relay can renew it independently.
#[derive(Clone)]
pub struct DeadlineGuard {
    expiry: Arc<ArcSwap<tokio::time::Instant>>,
    timeout: Option<Duration>,
    token: CancellationToken,
}

impl DeadlineGuard {
    pub fn new(timeout: Option<Duration>, token: CancellationToken) -> Self {
        Self {
            expiry: Arc::new(ArcSwap::new(Arc::new(far_future()))),
            timeout,
            token,
        }
    }

    /// Sets expiry to `now + idle_timeout`. A no-op when the timeout is
    /// disabled, and a no-op after the session has already been cancelled.
    pub fn renew(&self) {
        if self.token.is_cancelled() {
            return;
        }
        if let Some(timeout) = self.timeout {
            self.expiry.store(Arc::new(tokio::time::Instant::now() + timeout));
        }
    }

    /// Runs until the deadline expires or the session is cancelled by some
    /// other means (closed sockets, explicit `Session::close()`). Intended
    /// to be spawned as its own task on the session's reactor.
    pub async fn watch(self) {
        if self.timeout.is_none() {
            // No idle timeout configured: just wait for external
            // cancellation so the task isn't leaked.
            self.token.cancelled().await;
            return;
        }

        loop {
            let target = **self.expiry.load();
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = tokio::time::sleep_until(target) => {
                    if **self.expiry.load() <= tokio::time::Instant::now() {
                        self.token.cancel();
                        return;
                    }
                    // Expiry moved forward while we slept; loop and wait again.
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expires_without_renewal() {
        let token = CancellationToken::new();
        let guard = DeadlineGuard::new(Some(Duration::from_millis(50)), token.clone());
        tokio::spawn(guard.watch());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_postpones_expiry() {
        let token = CancellationToken::new();
        let guard = DeadlineGuard::new(Some(Duration::from_millis(100)), token.clone());
        let watcher = tokio::spawn(guard.clone().watch());

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            guard.renew();
        }
        assert!(!token.is_cancelled());
        watcher.abort();
    }

    #[tokio::test]
    async fn disabled_timeout_never_expires() {
        let token = CancellationToken::new();
        let guard = DeadlineGuard::new(None, token.clone());
        let watcher = tokio::spawn(guard.watch());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!token.is_cancelled());
        token.cancel();
        watcher.await.unwrap();
    }
}
