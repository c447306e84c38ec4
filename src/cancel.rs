use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::StoreError;

/// Cooperative cancellation flag shared between a caller and in-flight
/// operations.
///
/// Operations poll the token between protocol phases; an in-progress
/// syscall is never interrupted. Cloned tokens share the same flag.
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

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Phase checkpoint: `Canceled` once the token has been canceled.
    pub fn check(&self) -> Result<(), StoreError> {
        if self.is_canceled() {
            Err(StoreError::Canceled)
        } else {
            Ok(())
        }
    }
}
