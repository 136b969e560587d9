//! Run control signals.
//!
//! A `SignalBus` carries operator pause/resume/cancel requests. Both agent
//! loops observe it at every cooperative yield point: cancellation raises at
//! the next check, pause blocks until resumed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::error::{Error, Result};

/// Process-wide pause/resume/cancel signaling.
///
/// Injected as an `Arc` singleton owned by the runtime; tests substitute
/// their own instance.
#[derive(Debug, Default)]
pub struct SignalBus {
    exit_requested: AtomicBool,
    paused: AtomicBool,
    resume: Notify,
}

impl SignalBus {
    /// Create a new signal bus with cleared state
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Request that all runs stop at the next suspension point
    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::SeqCst);
        // Unblock anything parked on pause so it can observe the exit.
        self.resume.notify_waiters();
    }

    /// Pause all runs at the next suspension point
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resume paused runs
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resume.notify_waiters();
    }

    /// Clear all signal state; called when a run is accepted
    pub fn clear(&self) {
        self.exit_requested.store(false, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        self.resume.notify_waiters();
    }

    /// Whether an exit has been requested
    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst)
    }

    /// Raise a cancellation error when an exit has been requested
    pub fn raise_if_exit_requested(&self) -> Result<()> {
        if self.exit_requested() {
            return Err(Error::Cancelled("exit requested".to_string()));
        }
        Ok(())
    }

    /// Block while paused; returns immediately when not paused.
    ///
    /// An exit request wins over pause so a paused run can still be cancelled.
    pub async fn wait_for_resume(&self) -> Result<()> {
        loop {
            if self.exit_requested() {
                return Err(Error::Cancelled("exit requested".to_string()));
            }
            if !self.paused.load(Ordering::SeqCst) {
                return Ok(());
            }
            self.resume.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_exit_raises() {
        let bus = SignalBus::new();
        assert!(bus.raise_if_exit_requested().is_ok());
        bus.request_exit();
        assert!(bus.raise_if_exit_requested().is_err());
        bus.clear();
        assert!(bus.raise_if_exit_requested().is_ok());
    }

    #[tokio::test]
    async fn test_pause_blocks_until_resume() {
        let bus = SignalBus::new();
        bus.pause();

        let waiter = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.wait_for_resume().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        bus.resume();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish after resume")
            .expect("join");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_exit_unblocks_paused_run() {
        let bus = SignalBus::new();
        bus.pause();

        let waiter = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.wait_for_resume().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.request_exit();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish after exit")
            .expect("join");
        assert!(result.is_err());
    }
}
