//! Fault Handling - Demand Paging Entry Point
//!
//! [`handle_fault`] is the control-flow entry point invoked by the trap
//! glue on an invalid memory access. A fault either resolves — a frame is
//! materialized and mapped, execution can retry the access — or is
//! rejected with a status the process-termination collaborator reports.
//!
//! ## Resolution paths
//!
//! - **Demand materialization**: a not-present fault on a page the
//!   supplemental table knows about
//! - **Stack growth**: a not-present fault just below the live stack,
//!   bounded by the maximum stack size; extends the stack one page per
//!   fault
//! - **Write-unprotect**: a write fault on a hardware-read-only mapping
//!   whose page is logically writable
//!
//! Everything else rejects. Frame-pool exhaustion is *not* a rejection: it
//! propagates as [`VmError::FramesExhausted`], the unrecoverable condition.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::sync::Arc;

use crate::vm::addr::{
    is_null_page, is_user_addr, trunc_page, STACK_FLOOR, STACK_PUSH_SLACK, USER_STACK_TOP,
};
use crate::vm::backing::Target;
use crate::vm::frame::FramePool;
use crate::vm::spt::{self, Page, Spt};
use crate::vm::VmError;

// ============================================================================
// Fault Description
// ============================================================================

/// Access kind of a faulting instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// One memory-access trap, as delivered by the interrupt glue.
#[derive(Debug, Clone, Copy)]
pub struct Fault {
    /// Faulting virtual address
    pub addr: u64,
    /// Read or write access
    pub access: Access,
    /// Fault originated in user mode
    pub user: bool,
    /// No hardware mapping was present (as opposed to a rights violation
    /// on a present mapping)
    pub not_present: bool,
    /// Stack pointer of the faulting thread, for the growth heuristic
    pub sp: u64,
}

impl Fault {
    /// A fault on an address with no hardware mapping
    pub fn not_present(addr: u64, access: Access, user: bool, sp: u64) -> Self {
        Self {
            addr,
            access,
            user,
            not_present: true,
            sp,
        }
    }

    /// A rights violation on a present mapping
    pub fn protection(addr: u64, access: Access, user: bool, sp: u64) -> Self {
        Self {
            addr,
            access,
            user,
            not_present: false,
            sp,
        }
    }
}

/// Why a fault was rejected; reported with the terminating process's status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStatus {
    /// Access through the null page
    NullAccess,
    /// Access to a kernel-space address
    KernelAddress,
    /// No page at the address and no growth rule applies
    NoMapping,
    /// Write to a read-only page
    ReadOnly,
    /// Stack access beyond the maximum stack size
    StackOverflow,
    /// The page's backing store failed to produce content
    MaterializeFailed,
}

/// Terminal state of one fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Mapping installed; the faulting access can be retried
    Resolved,
    /// Illegal access; the owning process must be terminated
    Rejected(FaultStatus),
}

// ============================================================================
// Fault Statistics
// ============================================================================

/// Global fault statistics
static FAULT_STATS: FaultStats = FaultStats::new();

/// Fault statistics counters
pub struct FaultStats {
    /// Total faults
    pub total: AtomicU64,
    /// Faults resolved by materialization or unprotect
    pub resolved: AtomicU64,
    /// Faults rejected
    pub rejected: AtomicU64,
    /// Stack-growth pages allocated
    pub stack_growths: AtomicU64,
    /// Write-unprotect recoveries
    pub unprotects: AtomicU64,
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            resolved: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            stack_growths: AtomicU64::new(0),
            unprotects: AtomicU64::new(0),
        }
    }
}

/// Get fault statistics
pub fn stats() -> &'static FaultStats {
    &FAULT_STATS
}

// ============================================================================
// Fault Resolution
// ============================================================================

/// Resolve one fault against `spt`, drawing frames from `pool`.
///
/// Returns the terminal outcome, or [`VmError::FramesExhausted`] when the
/// pool is empty and nothing can be evicted — that condition is fatal and
/// never folded into a rejection.
pub fn handle_fault(
    spt: &mut Spt,
    pool: &FramePool,
    fault: &Fault,
) -> Result<FaultOutcome, VmError> {
    FAULT_STATS.total.fetch_add(1, Ordering::Relaxed);

    if is_null_page(fault.addr) {
        return Ok(reject(fault, FaultStatus::NullAccess));
    }
    if !is_user_addr(fault.addr) {
        return Ok(reject(fault, FaultStatus::KernelAddress));
    }

    if let Some(page) = spt.find(fault.addr) {
        let page = page.clone();
        if !fault.not_present {
            return resolve_protection_fault(&page, pool, fault);
        }
        if fault.access == Access::Write && !page.writable {
            return Ok(reject(fault, FaultStatus::ReadOnly));
        }
        return materialize(&page, pool, fault);
    }

    if fault.not_present && is_stack_access(fault) {
        if fault.addr < STACK_FLOOR {
            return Ok(reject(fault, FaultStatus::StackOverflow));
        }
        return grow_stack(spt, pool, fault);
    }

    Ok(reject(fault, FaultStatus::NoMapping))
}

/// A rights violation on a present mapping: recover by re-installing the
/// mapping writable when the page is logically writable, reject otherwise.
fn resolve_protection_fault(
    page: &Arc<Page>,
    pool: &FramePool,
    fault: &Fault,
) -> Result<FaultOutcome, VmError> {
    if fault.access != Access::Write || !page.writable {
        return Ok(reject(fault, FaultStatus::ReadOnly));
    }
    let pa = page.state.lock().frame.map(|idx| pool.pa_of(idx));
    match pa {
        Some(pa) => {
            if page.hw.install(page.va, pa, true) {
                FAULT_STATS.unprotects.fetch_add(1, Ordering::Relaxed);
                FAULT_STATS.resolved.fetch_add(1, Ordering::Relaxed);
                Ok(FaultOutcome::Resolved)
            } else {
                Ok(reject(fault, FaultStatus::MaterializeFailed))
            }
        }
        // Trap raced an eviction; treat as not-present.
        None => materialize(page, pool, fault),
    }
}

/// Extend the stack by exactly one anonymous page and materialize it.
fn grow_stack(spt: &mut Spt, pool: &FramePool, fault: &Fault) -> Result<FaultOutcome, VmError> {
    let va = trunc_page(fault.addr);
    if spt.alloc_page(va, true, Target::Anon).is_err() {
        return Ok(reject(fault, FaultStatus::NoMapping));
    }
    let page = match spt.find(va) {
        Some(p) => p.clone(),
        None => return Ok(reject(fault, FaultStatus::NoMapping)),
    };
    FAULT_STATS.stack_growths.fetch_add(1, Ordering::Relaxed);
    materialize(&page, pool, fault)
}

/// Claim the page; backing failures reject, pool exhaustion propagates.
fn materialize(page: &Arc<Page>, pool: &FramePool, fault: &Fault) -> Result<FaultOutcome, VmError> {
    match spt::claim(page, pool) {
        Ok(()) => {
            FAULT_STATS.resolved.fetch_add(1, Ordering::Relaxed);
            Ok(FaultOutcome::Resolved)
        }
        Err(VmError::FramesExhausted) => Err(VmError::FramesExhausted),
        Err(e) => {
            log::debug!("materialization failed for page {:#x}: {:?}", page.va, e);
            Ok(reject(fault, FaultStatus::MaterializeFailed))
        }
    }
}

/// Check whether a fault with no page behind it is a stack access: at most
/// a push's distance below the stack pointer and under the stack top.
fn is_stack_access(fault: &Fault) -> bool {
    fault.addr < USER_STACK_TOP && fault.addr >= fault.sp.saturating_sub(STACK_PUSH_SLACK)
}

fn reject(fault: &Fault, status: FaultStatus) -> FaultOutcome {
    FAULT_STATS.rejected.fetch_add(1, Ordering::Relaxed);
    log::debug!(
        "rejected {:?} fault at {:#x} (user={}): {:?}",
        fault.access,
        fault.addr,
        fault.user,
        status
    );
    FaultOutcome::Rejected(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SpaceId;
    use crate::vm::addr::{KERNEL_BASE, PAGE_SIZE, STACK_MAX};
    use crate::vm::backing::{HeapSwap, PageKind};
    use crate::vm::frame::frame_bytes;
    use crate::vm::mapping::{MappingTable, SoftMappingTable};
    use alloc::boxed::Box;
    use alloc::vec;
    use alloc::vec::Vec;

    /// Page-aligned heap region standing in for physical memory.
    fn arena(frames: usize) -> (Vec<u8>, u64) {
        let mem = vec![0u8; (frames + 1) * PAGE_SIZE];
        let base = (mem.as_ptr() as u64 + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
        (mem, base)
    }

    fn setup(frames: usize) -> (Vec<u8>, FramePool, Arc<SoftMappingTable>, Spt) {
        let (mem, base) = arena(frames);
        let pool = FramePool::new(base, frames, Arc::new(HeapSwap::new(16)));
        let hw = Arc::new(SoftMappingTable::new());
        let spt = Spt::new(SpaceId::new(), hw.clone());
        (mem, pool, hw, spt)
    }

    fn read_fault(addr: u64) -> Fault {
        Fault::not_present(addr, Access::Read, true, USER_STACK_TOP)
    }

    fn write_fault(addr: u64) -> Fault {
        Fault::not_present(addr, Access::Write, true, USER_STACK_TOP)
    }

    #[test]
    fn test_rejects_bad_accesses() {
        let (_mem, pool, _hw, mut spt) = setup(1);

        assert_eq!(
            handle_fault(&mut spt, &pool, &read_fault(0)),
            Ok(FaultOutcome::Rejected(FaultStatus::NullAccess))
        );
        assert_eq!(
            handle_fault(&mut spt, &pool, &read_fault(KERNEL_BASE + 0x1000)),
            Ok(FaultOutcome::Rejected(FaultStatus::KernelAddress))
        );
        assert_eq!(
            handle_fault(&mut spt, &pool, &read_fault(0x10_0000)),
            Ok(FaultOutcome::Rejected(FaultStatus::NoMapping))
        );

        // Write to a page created read-only.
        spt.alloc_page(0x4000, false, Target::Anon).unwrap();
        assert_eq!(
            handle_fault(&mut spt, &pool, &write_fault(0x4000)),
            Ok(FaultOutcome::Rejected(FaultStatus::ReadOnly))
        );
        // A present-mapping rights violation on the same page also rejects.
        spt.claim_page(0x4000, &pool).unwrap();
        let wp = Fault::protection(0x4000, Access::Write, true, USER_STACK_TOP);
        assert_eq!(
            handle_fault(&mut spt, &pool, &wp),
            Ok(FaultOutcome::Rejected(FaultStatus::ReadOnly))
        );
    }

    #[test]
    fn test_resolves_lazy_page_round_trip() {
        let (_mem, pool, hw, mut spt) = setup(2);
        spt.alloc_page_with_initializer(
            0x4000,
            true,
            Target::Anon,
            Some(Box::new(|frame: &mut [u8]| {
                frame[..6].copy_from_slice(b"warmup");
                Ok(())
            })),
        )
        .unwrap();

        assert_eq!(
            handle_fault(&mut spt, &pool, &read_fault(0x4321)),
            Ok(FaultOutcome::Resolved)
        );
        assert!(hw.is_mapped(0x4000));

        let pa = hw.lookup(0x4000).unwrap();
        assert_eq!(&frame_bytes(pa)[..6], b"warmup");
        assert!(spt.is_consistent());
    }

    #[test]
    fn test_stack_growth_within_bound() {
        let (_mem, pool, hw, mut spt) = setup(2);
        let sp = USER_STACK_TOP - 0x100;

        // A push faulting just below the stack pointer grows by one page.
        let fault = Fault::not_present(sp - 8, Access::Write, true, sp);
        assert_eq!(handle_fault(&mut spt, &pool, &fault), Ok(FaultOutcome::Resolved));
        assert_eq!(spt.len(), 1);
        let page = spt.find(sp - 8).unwrap();
        assert!(page.writable);
        assert_eq!(page.kind(), PageKind::Anon);
        assert!(hw.is_mapped(sp - 8));

        // Exactly one page per fault: the next page down is still absent.
        assert!(spt.find(trunc_page(sp - 8) - 1).is_none());
    }

    #[test]
    fn test_stack_growth_beyond_bound_rejected() {
        let (_mem, pool, _hw, mut spt) = setup(2);
        let sp = USER_STACK_TOP - STACK_MAX - 0x100;
        let fault = Fault::not_present(sp - 8, Access::Write, true, sp);
        assert_eq!(
            handle_fault(&mut spt, &pool, &fault),
            Ok(FaultOutcome::Rejected(FaultStatus::StackOverflow))
        );
        assert!(spt.is_empty());

        // Far below the stack pointer it is not a stack access at all.
        let wild = Fault::not_present(0x5000, Access::Write, true, USER_STACK_TOP - 0x100);
        assert_eq!(
            handle_fault(&mut spt, &pool, &wild),
            Ok(FaultOutcome::Rejected(FaultStatus::NoMapping))
        );
    }

    #[test]
    fn test_eviction_round_trip() {
        let (_mem, pool, hw, mut spt) = setup(2);
        for va in [0x4000u64, 0x5000, 0x6000] {
            spt.alloc_page(va, true, Target::Anon).unwrap();
        }

        // Fill the pool.
        assert_eq!(
            handle_fault(&mut spt, &pool, &write_fault(0x4000)),
            Ok(FaultOutcome::Resolved)
        );
        assert_eq!(
            handle_fault(&mut spt, &pool, &write_fault(0x5000)),
            Ok(FaultOutcome::Resolved)
        );
        assert_eq!(pool.free_count(), 0);

        // Write recognizable content into the first page.
        let pa = hw.lookup(0x4000).unwrap();
        frame_bytes(pa)[..5].copy_from_slice(b"saved");
        hw.set_accessed(0x4000, false);
        hw.set_accessed(0x5000, true);

        // One more fault must evict exactly one page and still succeed.
        assert_eq!(
            handle_fault(&mut spt, &pool, &write_fault(0x6000)),
            Ok(FaultOutcome::Resolved)
        );
        assert!(!hw.is_mapped(0x4000));
        assert!(hw.is_mapped(0x5000));
        assert!(hw.is_mapped(0x6000));
        assert_eq!(pool.snapshot().evicted, 1);
        assert!(spt.is_consistent());

        // Re-faulting the evicted page reproduces its last content.
        hw.set_accessed(0x5000, false);
        hw.set_accessed(0x6000, false);
        assert_eq!(
            handle_fault(&mut spt, &pool, &read_fault(0x4000)),
            Ok(FaultOutcome::Resolved)
        );
        let pa = hw.lookup(0x4000).unwrap();
        assert_eq!(&frame_bytes(pa)[..5], b"saved");
    }

    #[test]
    fn test_write_unprotect_recovers() {
        let (_mem, pool, hw, mut spt) = setup(1);
        spt.alloc_page(0x4000, true, Target::Anon).unwrap();
        spt.claim_page(0x4000, &pool).unwrap();

        // Downgrade the hardware mapping to read-only.
        let pa = hw.lookup(0x4000).unwrap();
        hw.install(0x4000, pa, false);
        assert!(!hw.is_writable(0x4000));

        let wp = Fault::protection(0x4000, Access::Write, true, USER_STACK_TOP);
        assert_eq!(handle_fault(&mut spt, &pool, &wp), Ok(FaultOutcome::Resolved));
        assert!(hw.is_writable(0x4000));
    }

    #[test]
    fn test_exhaustion_is_fatal_not_rejected() {
        let (_mem, pool, _hw, mut spt) = setup(0);
        spt.alloc_page(0x4000, true, Target::Anon).unwrap();
        assert_eq!(
            handle_fault(&mut spt, &pool, &read_fault(0x4000)),
            Err(VmError::FramesExhausted)
        );
    }
}
