//! Atomic test-and-set cell.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicBool, Ordering};

/// A single shared flag with an atomic test-and-set operation.
///
/// The cell sits on its own cache line so that CPUs spinning on different
/// cells do not contend with each other.
#[derive(Default)]
pub struct TasCell {
    flag: CachePadded<AtomicBool>,
}

impl TasCell {
    /// Creates a cleared cell.
    pub const fn new() -> Self {
        Self {
            flag: CachePadded::new(AtomicBool::new(false)),
        }
    }

    /// Sets the cell and returns its previous value.
    #[inline]
    pub fn test_and_set(&self) -> bool {
        self.flag.swap(true, Ordering::SeqCst)
    }

    /// Clears the cell.
    #[inline]
    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Reads the cell.
    #[inline]
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
