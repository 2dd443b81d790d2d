use tokio::sync::watch;

/// One-shot closed notification for a transport.
///
/// The guard side travels with the write half of the connection's stream and
/// fires when that half is shut down or dropped; the signal side lets the
/// task that accepted the physical connection suspend until the transport is
/// released, whichever peer causes it.
pub fn closed_pair() -> (ClosedGuard, ClosedSignal) {
    let (tx, rx) = watch::channel(false);
    (ClosedGuard { tx: Some(tx) }, ClosedSignal { rx })
}

#[derive(Debug)]
pub struct ClosedGuard {
    tx: Option<watch::Sender<bool>>,
}

impl ClosedGuard {
    /// Idempotent; later calls (and the drop) are no-ops.
    pub fn fire(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(true);
        }
    }
}

impl Drop for ClosedGuard {
    fn drop(&mut self) {
        self.fire();
    }
}

#[derive(Debug)]
pub struct ClosedSignal {
    rx: watch::Receiver<bool>,
}

impl ClosedSignal {
    pub async fn wait(mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            // Sender gone counts as closed.
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn fire_wakes_waiter() {
        let (mut guard, signal) = closed_pair();
        let waiter = tokio::spawn(signal.wait());
        guard.fire();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn drop_counts_as_closed() {
        let (guard, signal) = closed_pair();
        let waiter = tokio::spawn(signal.wait());
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn wait_after_fire_returns_immediately() {
        let (mut guard, signal) = closed_pair();
        guard.fire();
        guard.fire();
        assert!(signal.is_closed());
        signal.wait().await;
    }
}
