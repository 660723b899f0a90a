//! Cooperative shutdown signaling
//!
//! One broadcast signal per job, observed by every blocking select in the
//! pipeline. Triggering is idempotent: the first call wins, later calls
//! report [`ReplayError::AlreadyShutdown`] which is never fatal.

use crate::common::error::{ReplayError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// The triggering side of a job's shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
    fired: Arc<AtomicBool>,
}

/// The observing side; cheap to clone into every task.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> (Self, ShutdownListener) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                tx: Arc::new(tx),
                fired: Arc::new(AtomicBool::new(false)),
            },
            ShutdownListener { rx },
        )
    }

    /// Fire the signal. Returns `AlreadyShutdown` on the second and later
    /// calls without re-firing.
    pub fn trigger(&self) -> Result<()> {
        if self.fired.swap(true, Ordering::SeqCst) {
            return Err(ReplayError::AlreadyShutdown);
        }
        let _ = self.tx.send(true);
        Ok(())
    }

    pub fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownListener {
    /// Resolve once the signal fires. Observed state is level-triggered, so
    /// late subscribers resolve immediately.
    pub async fn cancelled(&mut self) {
        // wait_for returns Err only when the sender is gone, which also
        // means the job is over
        let _ = self.rx.wait_for(|fired| *fired).await;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_unblocks_listeners() {
        let (signal, mut listener) = ShutdownSignal::new();
        let mut second = signal.subscribe();

        let waiter = tokio::spawn(async move {
            listener.cancelled().await;
        });

        signal.trigger().unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("listener should unblock")
            .unwrap();

        // late observers see the level-triggered state
        tokio::time::timeout(Duration::from_secs(1), second.cancelled())
            .await
            .expect("late listener should unblock");
    }

    #[tokio::test]
    async fn test_second_trigger_is_already_shutdown() {
        let (signal, _listener) = ShutdownSignal::new();
        signal.trigger().unwrap();
        let err = signal.trigger().unwrap_err();
        assert!(matches!(err, ReplayError::AlreadyShutdown));
        assert!(!err.is_fatal());
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_is_cancelled_flag() {
        let (signal, listener) = ShutdownSignal::new();
        assert!(!listener.is_cancelled());
        signal.trigger().unwrap();
        assert!(listener.is_cancelled());
    }
}
