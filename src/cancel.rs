//! Cancellation signals tied to server shutdown and request lifetimes.

use tokio::sync::watch;

/// Fires its token when [`CancelGuard::cancel`] is called or the guard is dropped.
#[derive(Debug)]
pub struct CancelGuard {
    tx: watch::Sender<bool>,
}

impl CancelGuard {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.tx.send_replace(true);
    }
}

/// Cheap, cloneable view of a cancellation signal.
///
/// A child token is also cancelled when its parent is.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
    parent: Option<watch::Receiver<bool>>,
}

impl CancelToken {
    /// Creates a root token and the guard that cancels it.
    pub fn root() -> (CancelGuard, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelGuard { tx }, CancelToken { rx, parent: None })
    }

    /// Creates a token cancelled by either the returned guard or `self`.
    pub fn child(&self) -> (CancelGuard, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (
            CancelGuard { tx },
            CancelToken {
                rx,
                parent: Some(self.rx.clone()),
            },
        )
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.parent.as_ref().is_some_and(|parent| *parent.borrow())
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&mut self) {
        match self.parent.as_mut() {
            Some(parent) => {
                tokio::select! {
                    _ = wait_for_cancel(&mut self.rx) => {}
                    _ = wait_for_cancel(parent) => {}
                }
            }
            None => wait_for_cancel(&mut self.rx).await,
        }
    }
}

async fn wait_for_cancel(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
    if closed {
        // sender gone without cancelling: this source never fires
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::CancelToken;

    #[tokio::test]
    async fn dropping_guard_cancels_token() {
        let (guard, mut token) = CancelToken::root();
        assert!(!token.is_cancelled());
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("cancelled");
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn parent_cancellation_reaches_child() {
        let (root_guard, root) = CancelToken::root();
        let (_child_guard, mut child) = root.child();
        assert!(!child.is_cancelled());

        root_guard.cancel();
        tokio::time::timeout(Duration::from_secs(1), child.cancelled())
            .await
            .expect("cancelled");
        assert!(root.is_cancelled());
        assert!(root.child().1.is_cancelled());
    }

    #[tokio::test]
    async fn child_cancellation_leaves_parent_alone() {
        let (_root_guard, root) = CancelToken::root();
        let (child_guard, child) = root.child();
        child_guard.cancel();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
    }
}
