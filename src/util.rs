//! Small async building blocks shared by the connection and playback paths.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, RwLock};

/// A shared one-shot value.
///
/// Any number of tasks can `wait` on it; all of them observe the value set by
/// the first `resolve`. Later resolves are no-ops. Used for the
/// pending-connect handshake (resolved with the live socket writer) and the
/// ping/pong rendezvous.
pub struct Deferred<T: Clone> {
    slot: RwLock<Option<T>>,
    notify: Notify,
}

impl<T: Clone> Deferred<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: RwLock::new(None),
            notify: Notify::new(),
        })
    }

    /// Sets the value if it has not been set yet and wakes all waiters.
    pub async fn resolve(&self, value: T) {
        {
            let mut slot = self.slot.write().await;
            if slot.is_some() {
                return;
            }
            *slot = Some(value);
        }
        self.notify.notify_waiters();
    }

    /// Waits until the value is set and returns a clone of it.
    pub async fn wait(&self) -> T {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before the check so a resolve racing with the
            // check cannot be missed.
            notified.as_mut().enable();
            if let Some(value) = self.slot.read().await.as_ref() {
                return value.clone();
            }
            notified.await;
        }
    }

    /// Returns the value if already resolved, without waiting.
    pub async fn peek(&self) -> Option<T> {
        self.slot.read().await.clone()
    }
}

/// Sleeps for `duration` unless `cancel` fires first.
///
/// Returns `true` if the full duration elapsed, `false` if cancelled. The
/// watchdog sleeps with this so `close()` wakes it immediately.
pub async fn sleep_cancellable(duration: Duration, cancel: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.notified() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deferred_wakes_all_waiters() {
        let deferred = Deferred::new();
        let a = tokio::spawn({
            let d = Arc::clone(&deferred);
            async move { d.wait().await }
        });
        let b = tokio::spawn({
            let d = Arc::clone(&deferred);
            async move { d.wait().await }
        });
        tokio::task::yield_now().await;

        deferred.resolve(7u32).await;
        assert_eq!(a.await.unwrap(), 7);
        assert_eq!(b.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn deferred_resolve_is_idempotent() {
        let deferred = Deferred::new();
        deferred.resolve(1u32).await;
        deferred.resolve(2u32).await;
        assert_eq!(deferred.wait().await, 1);
        assert_eq!(deferred.peek().await, Some(1));
    }

    #[tokio::test]
    async fn deferred_wait_after_resolve_returns_immediately() {
        let deferred = Deferred::new();
        deferred.resolve("socket".to_string()).await;
        assert_eq!(deferred.wait().await, "socket");
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_when_not_cancelled() {
        let cancel = Notify::new();
        assert!(sleep_cancellable(Duration::from_millis(50), &cancel).await);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_observes_cancellation() {
        let cancel = Arc::new(Notify::new());
        let waiter = tokio::spawn({
            let cancel = Arc::clone(&cancel);
            async move { sleep_cancellable(Duration::from_secs(3600), &cancel).await }
        });
        tokio::task::yield_now().await;
        cancel.notify_waiters();
        assert!(!waiter.await.unwrap());
    }
}
