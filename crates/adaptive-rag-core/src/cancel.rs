//! Cooperative cancellation for the retrieval pipeline.
//!
//! No stage mutates shared state, so an aborted request simply returns
//! early at the next stage boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, RetrievalError};

/// Anything that can report a pending cancellation request.
pub trait Cancellable {
    /// Check if cancellation has been requested.
    fn is_cancelled(&self) -> bool;

    /// Request cancellation.
    fn cancel(&self);

    /// Fail with [`RetrievalError::Cancelled`] once cancellation was requested.
    fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(RetrievalError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Shared flag handed to a request; clones observe the same state.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellable for CancellationToken {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_shares_flag() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(token.checkpoint().is_ok());
        other.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.checkpoint(), Err(RetrievalError::Cancelled));
    }
}
