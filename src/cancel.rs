//! Cooperative cancellation.
//!
//! Two levels exist at runtime: a scan-level flag set by the operator and a
//! job-level flag set by the worker when it retries or abandons a job. Both
//! are represented by the same primitive; a child flag trips when either its
//! own handle or any ancestor fires.

use std::sync::Arc;

use tokio::sync::watch;

/// Owner side of a cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

/// Observer side of a cancellation flag. Cheap to clone; safe to poll from
/// any task.
#[derive(Debug, Clone)]
pub struct CancelFlag {
    rx: watch::Receiver<bool>,
    parent: Option<Box<CancelFlag>>,
}

/// Create a new, untripped cancellation pair.
pub fn cancel_pair() -> (CancelHandle, CancelFlag) {
    let (tx, rx) = watch::channel(false);
    (
        CancelHandle { tx: Arc::new(tx) },
        CancelFlag { rx, parent: None },
    )
}

impl CancelHandle {
    /// Trip the flag. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl CancelFlag {
    /// A flag that can never fire. Useful for callers without a lifecycle.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive forever so the receiver never errors.
        std::mem::forget(tx);
        Self { rx, parent: None }
    }

    /// Derive a child pair: the child trips when its own handle fires or
    /// when `self` fires.
    pub fn child(&self) -> (CancelHandle, CancelFlag) {
        let (handle, mut flag) = cancel_pair();
        flag.parent = Some(Box::new(self.clone()));
        (handle, flag)
    }

    pub fn is_cancelled(&self) -> bool {
        if *self.rx.borrow() {
            return true;
        }
        self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Wait until the flag trips.
    pub async fn cancelled(&self) {
        // Walk the ancestor chain and wait for whichever fires first.
        let mut receivers = vec![self.rx.clone()];
        let mut cursor = self.parent.as_deref();
        while let Some(flag) = cursor {
            receivers.push(flag.rx.clone());
            cursor = flag.parent.as_deref();
        }
        let waits = receivers
            .iter_mut()
            .map(|rx| Box::pin(Self::wait(rx)))
            .collect::<Vec<_>>();
        futures::future::select_all(waits).await;
    }

    async fn wait(rx: &mut watch::Receiver<bool>) {
        if *rx.borrow() {
            return;
        }
        // An error means the sender is gone without ever cancelling; treat
        // that as "never fires".
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        futures::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trips_once_cancelled() {
        let (handle, flag) = cancel_pair();
        assert!(!flag.is_cancelled());
        handle.cancel();
        assert!(flag.is_cancelled());
        flag.cancelled().await;
    }

    #[tokio::test]
    async fn child_observes_parent() {
        let (parent_handle, parent_flag) = cancel_pair();
        let (_child_handle, child_flag) = parent_flag.child();
        assert!(!child_flag.is_cancelled());
        parent_handle.cancel();
        assert!(child_flag.is_cancelled());
    }

    #[tokio::test]
    async fn parent_unaffected_by_child() {
        let (_parent_handle, parent_flag) = cancel_pair();
        let (child_handle, child_flag) = parent_flag.child();
        child_handle.cancel();
        assert!(child_flag.is_cancelled());
        assert!(!parent_flag.is_cancelled());
    }
}
