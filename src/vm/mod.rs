//! UVM_R Virtual Memory Subsystem
//!
//! The demand-paging core of a user address space:
//! - addr: page geometry and address-space layout
//! - mapping: hardware mapping-table contract (and a software table)
//! - backing: backing-store variants (uninit / anon / file) and the
//!   swap and file collaborator contracts
//! - frame: the physical frame pool and eviction
//! - spt: supplemental page tables, page claiming, fork duplication
//! - fault: the page-fault entry point
//!
//! Control flow: a trap enters [`fault::handle_fault`], the supplemental
//! table is consulted, the frame pool supplies a frame (evicting if it
//! must), the page's backing variant materializes content, and the
//! hardware mapping is installed.

pub mod addr;
pub mod backing;
pub mod fault;
pub mod frame;
pub mod mapping;
pub mod spt;

pub use addr::{round_page, trunc_page, PAGE_SHIFT, PAGE_SIZE};
pub use backing::{Backing, BackingFile, PageInit, PageKind, SwapDevice, SwapSlot, Target};
pub use fault::{handle_fault, Access, Fault, FaultOutcome, FaultStatus};
pub use frame::{FrameIndex, FramePool, PoolSnapshot};
pub use mapping::{MappingTable, SoftMappingTable};
pub use spt::{Page, Spt};

use alloc::sync::Arc;

/// Errors surfaced by the virtual-memory core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// A page already occupies the requested virtual address
    Occupied,
    /// No page covers the requested virtual address
    NotFound,
    /// Null or kernel-space address in an allocation request
    BadAddress,
    /// Frame pool empty with nothing evictable; unrecoverable
    FramesExhausted,
    /// Swap area has no free slot
    SwapExhausted,
    /// Backing-store read or write failed
    Backing,
    /// Hardware mapping installation failed
    MappingFailed,
}

/// Initialize the VM subsystem with its physical memory region: installs
/// the system-wide frame pool over `frames` frames starting at `base`.
pub fn init_with_memory(base: u64, frames: usize, swap: Arc<dyn SwapDevice>) {
    frame::init_global(FramePool::new(base, frames, swap));
}
