pub mod queue;
pub mod single_flight;

pub use queue::{Completion, QueueItem, SequentialQueue};
pub use single_flight::{Flight, SingleFlight};

use sha2::{Digest, Sha256};
use std::sync::{Mutex, PoisonError};

/// Flag marking an operation that must not run twice concurrently
#[derive(Debug, Default)]
pub struct ProcessingFlag {
    active: Mutex<bool>,
}

impl ProcessingFlag {
    /// `None` when the operation is already running. The flag is released
    /// when the guard drops, including on early return or cancellation.
    pub fn try_acquire(&self) -> Option<ProcessingGuard<'_>> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if *active {
            None
        } else {
            *active = true;
            Some(ProcessingGuard { flag: self })
        }
    }
}

pub struct ProcessingGuard<'a> {
    flag: &'a ProcessingFlag,
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        *self
            .flag
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = false;
    }
}

/// Short hash of a purchase token, safe to log
pub fn token_digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..12].to_string()
}
