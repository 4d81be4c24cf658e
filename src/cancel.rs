//! Cooperative cancellation shared by the orchestrator and the request layer

use crate::error::{PipelineError, Result};
use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable cancellation flag. Every clone observes the same state.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel` has been called on any clone.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// `Err(Cancelled)` if the token has fired.
    pub fn check(&self, phase: &str) -> Result<()> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled { phase: phase.to_string() })
        } else {
            Ok(())
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleep that gives up early when `cancel` fires.
pub async fn sleep_or_cancel(
    duration: std::time::Duration,
    cancel: Option<&CancelToken>,
    phase: &str,
) -> Result<()> {
    match cancel {
        Some(token) => {
            tokio::select! {
                _ = tokio::time::sleep(duration) => Ok(()),
                _ = token.cancelled() => Err(PipelineError::Cancelled { phase: phase.to_string() }),
            }
        }
        None => {
            tokio::time::sleep(duration).await;
            Ok(())
        }
    }
}
