//! Admission control
//!
//! A fixed number of slots caps how many untrusted processes run at once.
//! A slot is held for the whole run and handed back when the returned guard
//! is dropped.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug)]
pub struct Admission {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    acquire_timeout: Duration,
}

/// One occupied slot; released on drop
#[derive(Debug)]
pub struct AdmissionSlot {
    _permit: OwnedSemaphorePermit,
}

impl Admission {
    pub fn new(capacity: usize, acquire_timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            acquire_timeout,
        }
    }

    /// Wait up to the acquire timeout for a free slot.
    pub async fn acquire(&self) -> Option<AdmissionSlot> {
        let acquire = self.semaphore.clone().acquire_owned();
        match tokio::time::timeout(self.acquire_timeout, acquire).await {
            Ok(Ok(permit)) => Some(AdmissionSlot { _permit: permit }),
            Ok(Err(_closed)) => None,
            Err(_elapsed) => None,
        }
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
