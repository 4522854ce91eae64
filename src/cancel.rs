// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cooperative cancellation token.
//!
//! Tokens propagate daemon → pipeline → stage → session/subprocess/validator.
//! Every suspension point races [`CancelToken::cancelled`] so components can
//! respond within the 5-second cancellation budget.

use std::sync::Arc;

use tokio::sync::watch;

/// A clonable cancellation token backed by a watch channel.
///
/// Cloning shares the same signal; `child()` derives a token that fires when
/// either the parent or the child itself is cancelled.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Signal cancellation to all clones.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Non-blocking check.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation is signalled.
    ///
    /// Resolves immediately if the token is already cancelled. If every
    /// sender is dropped without a cancel, this pends forever, which is the
    /// correct behavior for `select!` arms racing real work.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone without a cancel; never resolve.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Derive a child token cancelled along with this one.
    pub fn child(&self) -> Self {
        let child = Self::new();
        let parent_rx = self.rx.clone();
        let child_tx = Arc::clone(&child.tx);
        tokio::spawn(async move {
            let mut rx = parent_rx;
            loop {
                if *rx.borrow() {
                    let _ = child_tx.send(true);
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        });
        child
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_propagates_to_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
        // cancelled() resolves promptly once signalled
        tokio::time::timeout(Duration::from_secs(1), clone.cancelled())
            .await
            .expect("cancelled() should resolve");
    }

    #[tokio::test]
    async fn test_uncancelled_token_pends() {
        let token = CancelToken::new();
        let result =
            tokio::time::timeout(Duration::from_millis(50), token.cancelled()).await;
        assert!(result.is_err(), "should still be pending");
    }

    #[tokio::test]
    async fn test_child_token_follows_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), child.cancelled())
            .await
            .expect("child should observe parent cancel");
    }

    #[tokio::test]
    async fn test_child_cancel_does_not_touch_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        tokio::task::yield_now().await;
        assert!(!parent.is_cancelled());
    }
}
