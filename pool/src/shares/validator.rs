//! Share validator worker pool
//!
//! Autolykos2 hashing is pure CPU (34 Blake2b passes over 8 KiB each), so it
//! runs on the blocking pool behind a semaphore. A burst of submits cannot
//! occupy more than `max_in_flight` blocking threads.

use std::sync::Arc;

use num_bigint::BigUint;
use tokio::sync::Semaphore;

use super::autolykos::{self, ValidationResult};
use crate::error::ValidationIntegrityError;

/// Everything needed to hash one share, owned so it can cross into
/// `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct ShareWork {
    pub header: [u8; 32],
    pub nonce: [u8; 8],
    pub height: u32,
    pub share_target: BigUint,
    pub network_target: BigUint,
}

#[derive(Clone)]
pub struct ShareValidator {
    permits: Arc<Semaphore>,
}

impl ShareValidator {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    /// Sized from available parallelism.
    pub fn with_default_parallelism() -> Self {
        let n = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new(n)
    }

    pub async fn validate(&self, work: ShareWork) -> Result<ValidationResult, ValidationIntegrityError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| ValidationIntegrityError(e.to_string()))?;

        tokio::task::spawn_blocking(move || {
            autolykos::validate(
                &work.header,
                &work.nonce,
                work.height,
                &work.share_target,
                &work.network_target,
            )
        })
        .await
        .map_err(|e| ValidationIntegrityError(e.to_string()))
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
