//! Pause, resume and cancel signalling for running transfers.

use std::sync::Arc;
use tokio::sync::watch;

use crate::{Result, UpdateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Running,
    Paused,
    Cancelled,
}

/// Cloneable handle shared between a transfer and whoever steers it.
///
/// Transfers consult it between chunk reads, so an in-flight chunk is
/// always finished or dropped whole.
#[derive(Clone)]
pub struct TransferControl {
    tx: Arc<watch::Sender<ControlState>>,
}

impl TransferControl {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ControlState::Running);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> ControlState {
        *self.tx.borrow()
    }

    pub fn pause(&self) {
        self.tx.send_if_modified(|state| {
            if *state == ControlState::Running {
                *state = ControlState::Paused;
                true
            } else {
                false
            }
        });
    }

    pub fn resume(&self) {
        self.tx.send_if_modified(|state| {
            if *state == ControlState::Paused {
                *state = ControlState::Running;
                true
            } else {
                false
            }
        });
    }

    /// Cancellation is terminal.
    pub fn cancel(&self) {
        self.tx.send_replace(ControlState::Cancelled);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == ControlState::Cancelled
    }

    /// Block while paused; fail once cancelled.
    pub async fn checkpoint(&self) -> Result<()> {
        let mut rx = self.tx.subscribe();
        loop {
            match *rx.borrow_and_update() {
                ControlState::Running => return Ok(()),
                ControlState::Cancelled => return Err(UpdateError::Cancelled),
                ControlState::Paused => {}
            }
            if rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    /// Resolves once the transfer is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this cannot close while we wait
        let _ = rx.wait_for(|state| *state == ControlState::Cancelled).await;
    }
}

impl Default for TransferControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_checkpoint_running() {
        let control = TransferControl::new();
        assert!(control.checkpoint().await.is_ok());
    }

    #[tokio::test]
    async fn test_pause_blocks_until_resume() {
        let control = TransferControl::new();
        control.pause();
        assert_eq!(control.state(), ControlState::Paused);

        let waiter = control.clone();
        let handle = tokio::spawn(async move { waiter.checkpoint().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        control.resume();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }

    #[tokio::test]
    async fn test_cancel_while_paused() {
        let control = TransferControl::new();
        control.pause();

        let waiter = control.clone();
        let handle = tokio::spawn(async move { waiter.checkpoint().await });
        control.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(matches!(result, Ok(Ok(Err(UpdateError::Cancelled)))));
    }

    #[test]
    fn test_resume_after_cancel_is_ignored() {
        let control = TransferControl::new();
        control.cancel();
        control.resume();
        assert!(control.is_cancelled());
    }
}
