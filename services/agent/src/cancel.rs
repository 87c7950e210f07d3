//! One-shot cancellation broadcast built on a `watch` channel.
//!
//! Once cancelled, a token stays cancelled. Dropping the handle also counts as
//! cancellation, so a session never outlives the slot that owns its handle.

use tokio::sync::watch;

/// Owner side: signals cancellation. Idempotent.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Observer side, handed to every suspension point of a session.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Create a connected handle/token pair.
pub fn pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolve once cancellation has been signalled.
    pub async fn cancelled(&mut self) {
        // An error means the handle is gone, which is cancellation too.
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_is_sticky_and_idempotent() {
        let (handle, mut token) = pair();
        assert!(!token.is_cancelled());

        handle.cancel();
        handle.cancel();
        assert!(token.is_cancelled());
        assert!(handle.is_cancelled());

        // Resolves immediately for an already-cancelled token.
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_handle_cancels() {
        let (handle, mut token) = pair();
        drop(handle);
        assert!(token.is_cancelled());
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_clones_observe_the_same_signal() {
        let (handle, token) = pair();
        let mut other = token.clone();
        let waiter = tokio::spawn(async move { other.cancelled().await });
        handle.cancel();
        waiter.await.unwrap();
        assert!(token.is_cancelled());
    }
}
