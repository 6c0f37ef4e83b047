//! Cancellation and time budget for one pass.
//!
//! Both are only consulted between batches and between pages; a batch that
//! has been submitted always runs to completion.

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;

#[derive(Debug, Clone)]
pub struct PassControl {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl PassControl {
    pub fn new(cancel: CancellationToken, deadline: Option<Instant>) -> Self {
        Self { cancel, deadline }
    }

    /// No cancellation source and no deadline.
    pub fn unbounded() -> Self {
        Self::new(CancellationToken::new(), None)
    }

    pub fn check(&self) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(SyncError::DeadlineExceeded);
            }
        }
        Ok(())
    }
}
