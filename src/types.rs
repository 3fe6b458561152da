//! Common types used across UVM_R
//!
//! This module defines shared types to avoid circular dependencies.

use core::sync::atomic::{AtomicU64, Ordering};

/// Address-space identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SpaceId(pub u64);

impl SpaceId {
    /// The kernel's own address space
    pub const KERNEL: Self = Self(0);

    /// Create a new space ID with a unique auto-incremented value
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        SpaceId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}
