//! Cooperative interruption.
//!
//! Fetches can block on network or disk for a long time. Embedders flag an
//! interrupt (e.g. from a signal handler) and every blocking operation in the
//! resolution path checks the flag before proceeding. The solver never
//! persists a partial lock file, so interruption is always safe.

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// The operation was interrupted by the embedder.
#[derive(Debug, Error)]
#[error("interrupted")]
pub struct Interrupted;

/// Request interruption of the current operation.
pub fn trigger_interrupt() {
  INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Clear the interrupt flag, e.g. before starting a new operation.
pub fn reset_interrupt() {
  INTERRUPTED.store(false, Ordering::SeqCst);
}

/// Fail with [`Interrupted`] if an interrupt has been requested.
pub fn check_interrupt() -> Result<(), Interrupted> {
  if INTERRUPTED.load(Ordering::SeqCst) {
    Err(Interrupted)
  } else {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  // One test only: the flag is process-global and other tests in this
  // binary call check_interrupt through the fetch path.
  #[test]
  fn trigger_and_reset() {
    assert!(check_interrupt().is_ok());
    trigger_interrupt();
    assert!(check_interrupt().is_err());
    reset_interrupt();
    assert!(check_interrupt().is_ok());
  }
}
