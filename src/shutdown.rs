//! Cooperative shutdown signalling
//!
//! Every loop and blocking suspension point in the crate observes a
//! [`ShutdownToken`]; signalling the controller cancels them at their next
//! suspension point without side effects beyond work already committed.

use tokio::sync::watch;

/// Owning side of a shutdown signal. Dropping the controller also cancels.
#[derive(Debug)]
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Hand out a token observers can poll or await.
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken { rx: self.tx.subscribe() }
    }

    /// Signal shutdown. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable observer half of a shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    /// A token that never fires; useful as a default.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Leak the sender so the channel stays open forever.
        std::mem::forget(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when shutdown is signalled (or the controller is dropped).
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // Controller dropped: treat as cancelled so waiters unblock.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn token_observes_signal() {
        let ctrl = ShutdownController::new();
        let token = ctrl.token();
        assert!(!token.is_cancelled());

        ctrl.shutdown();
        assert!(token.is_cancelled());
        token.cancelled().await; // must not hang
    }

    #[tokio::test]
    async fn cancelled_wakes_pending_waiter() {
        let ctrl = ShutdownController::new();
        let token = ctrl.token();

        let waiter = tokio::spawn(async move { token.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctrl.shutdown();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve after shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn dropping_controller_cancels() {
        let ctrl = ShutdownController::new();
        let token = ctrl.token();
        drop(ctrl);
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("drop should unblock waiters");
    }

    #[tokio::test]
    async fn never_token_stays_pending() {
        let token = ShutdownToken::never();
        assert!(!token.is_cancelled());
        let res = tokio::time::timeout(Duration::from_millis(20), token.cancelled()).await;
        assert!(res.is_err(), "never() token must not resolve");
    }
}
