//! Run-level cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::CovError;

/// Shared abort flag. Workers poll it between units and at redshift/mass
/// checkpoints inside long integrations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// `Err(Cancelled)` once [`CancelToken::cancel`] has been called.
    pub fn checkpoint(&self) -> Result<(), CovError> {
        if self.is_cancelled() { Err(CovError::Cancelled) } else { Ok(()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = CancelToken::new();
        let worker = token.clone();
        assert!(worker.checkpoint().is_ok());
        token.cancel();
        assert_eq!(worker.checkpoint(), Err(CovError::Cancelled));
    }
}
