//! Frame Pool - Physical Frame Management
//!
//! Manages the fixed-size physical frames available to user address spaces:
//! an arena of frame slots over one contiguous physical region, a free list,
//! and the frame↔page binding bookkeeping that eviction needs.
//!
//! When the pool runs dry, [`FramePool::acquire`] reclaims a frame with a
//! second-chance clock over all bound, unpinned frames: a victim whose
//! accessed bit is set gets the bit cleared and is passed over; an
//! unreferenced victim has its content written back through its page's
//! backing variant, its hardware mapping invalidated, and its frame rebound
//! to the requester.
//!
//! Acquire, victim selection, and release form a single critical section
//! under one lock. Callers must never enter the pool while holding a
//! page-state lock; the eviction path takes the victim's state lock inside
//! the pool lock, and that order is global.

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, Once};

use crate::vm::addr::PAGE_SIZE;
use crate::vm::backing::SwapDevice;
use crate::vm::spt::Page;
use crate::vm::VmError;

// ============================================================================
// Frame Index
// ============================================================================

/// Handle to one slot in the frame arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameIndex(pub u32);

// ============================================================================
// Pool Statistics
// ============================================================================

/// Frame pool statistics counters
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Frames handed out
    pub acquired: AtomicU64,
    /// Frames reclaimed by eviction
    pub evicted: AtomicU64,
    /// Frames returned to the free list
    pub released: AtomicU64,
    /// Eviction write-backs that failed (victim skipped)
    pub writeback_failures: AtomicU64,
}

/// Snapshot of pool state
#[derive(Debug, Clone, Copy)]
pub struct PoolSnapshot {
    pub total: usize,
    pub free: usize,
    pub acquired: u64,
    pub evicted: u64,
    pub released: u64,
    pub writeback_failures: u64,
}

// ============================================================================
// Frame Pool
// ============================================================================

/// One slot in the arena
struct FrameSlot {
    /// Page currently bound here; the page owns the binding, this is
    /// bookkeeping for eviction only
    owner: Option<Weak<Page>>,
    /// Excluded from victim selection while set
    pinned: bool,
}

struct PoolInner {
    slots: Vec<FrameSlot>,
    free: VecDeque<u32>,
    /// Clock hand for victim selection
    clock: usize,
}

/// The pool of physical frames available to user address spaces.
///
/// One instance is shared by every address space; all operations are
/// methods on it. The swap device handle lives here because eviction and
/// swap-in are pool-driven.
pub struct FramePool {
    base: u64,
    swap: Arc<dyn SwapDevice>,
    inner: Mutex<PoolInner>,
    /// Statistics
    pub stats: PoolStats,
}

impl FramePool {
    /// Create a pool of `frames` frames over the physical region starting
    /// at `base` (page-aligned), all initially free.
    pub fn new(base: u64, frames: usize, swap: Arc<dyn SwapDevice>) -> Self {
        let slots = (0..frames)
            .map(|_| FrameSlot {
                owner: None,
                pinned: false,
            })
            .collect();
        Self {
            base,
            swap,
            inner: Mutex::new(PoolInner {
                slots,
                free: (0..frames as u32).collect(),
                clock: 0,
            }),
            stats: PoolStats::default(),
        }
    }

    /// Total number of frames in the arena
    pub fn frame_count(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Number of frames currently on the free list
    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Physical address of a frame
    pub fn pa_of(&self, idx: FrameIndex) -> u64 {
        self.base + idx.0 as u64 * PAGE_SIZE as u64
    }

    /// The swap device behind this pool
    pub fn swap(&self) -> &dyn SwapDevice {
        &*self.swap
    }

    /// Snapshot pool statistics
    pub fn snapshot(&self) -> PoolSnapshot {
        let inner = self.inner.lock();
        PoolSnapshot {
            total: inner.slots.len(),
            free: inner.free.len(),
            acquired: self.stats.acquired.load(Ordering::Relaxed),
            evicted: self.stats.evicted.load(Ordering::Relaxed),
            released: self.stats.released.load(Ordering::Relaxed),
            writeback_failures: self.stats.writeback_failures.load(Ordering::Relaxed),
        }
    }

    /// Draw one frame for `for_page`, evicting if the pool is exhausted.
    ///
    /// The returned frame is owner-linked to `for_page` and **pinned**; the
    /// caller completes the page side of the binding and then unpins. Fails
    /// with [`VmError::FramesExhausted`] only when no frame is free and no
    /// victim can be reclaimed.
    pub(crate) fn acquire(&self, for_page: &Arc<Page>) -> Result<FrameIndex, VmError> {
        let mut inner = self.inner.lock();
        if let Some(i) = inner.free.pop_front() {
            inner.slots[i as usize] = FrameSlot {
                owner: Some(Arc::downgrade(for_page)),
                pinned: true,
            };
            self.stats.acquired.fetch_add(1, Ordering::Relaxed);
            return Ok(FrameIndex(i));
        }
        let idx = self.evict_into(&mut inner, for_page)?;
        self.stats.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(idx)
    }

    /// Second-chance clock sweep. Called with the pool lock held.
    fn evict_into(
        &self,
        inner: &mut PoolInner,
        for_page: &Arc<Page>,
    ) -> Result<FrameIndex, VmError> {
        let n = inner.slots.len();
        if n == 0 {
            return Err(VmError::FramesExhausted);
        }
        // Two full sweeps: the first may only clear accessed bits, the
        // second then finds those frames unreferenced.
        for _ in 0..2 * n {
            let i = inner.clock;
            inner.clock = (inner.clock + 1) % n;

            if inner.slots[i].pinned {
                continue;
            }
            let owner = match inner.slots[i].owner.clone() {
                Some(w) => w,
                None => continue,
            };
            let victim = match owner.upgrade() {
                Some(v) => v,
                None => {
                    // Owner vanished without unbinding; the frame is ours.
                    inner.slots[i] = FrameSlot {
                        owner: Some(Arc::downgrade(for_page)),
                        pinned: true,
                    };
                    return Ok(FrameIndex(i as u32));
                }
            };

            if victim.hw.accessed(victim.va) {
                victim.hw.clear_accessed(victim.va);
                continue;
            }

            let idx = FrameIndex(i as u32);
            let pa = self.pa_of(idx);
            let mut st = victim.state.lock();
            if st.frame != Some(idx) {
                continue;
            }
            let frame = frame_bytes(pa);
            match st
                .backing
                .evict(victim.va, victim.writable, frame, &*self.swap, &*victim.hw)
            {
                Ok(()) => {
                    victim.hw.clear(victim.va);
                    st.frame = None;
                    drop(st);
                    inner.slots[i] = FrameSlot {
                        owner: Some(Arc::downgrade(for_page)),
                        pinned: true,
                    };
                    self.stats.evicted.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "evicted page {:#x} of space {:?} for frame {}",
                        victim.va,
                        victim.space,
                        i
                    );
                    return Ok(idx);
                }
                Err(e) => {
                    self.stats
                        .writeback_failures
                        .fetch_add(1, Ordering::Relaxed);
                    log::warn!("eviction write-back failed for page {:#x}: {:?}", victim.va, e);
                    continue;
                }
            }
        }
        Err(VmError::FramesExhausted)
    }

    /// Pin the frame currently bound to `page`, if any.
    ///
    /// Takes the pool lock before the page-state lock, so it is safe to
    /// call from any context that holds neither.
    pub(crate) fn pin_bound_frame(&self, page: &Arc<Page>) -> Option<FrameIndex> {
        let mut inner = self.inner.lock();
        let st = page.state.lock();
        let idx = st.frame?;
        inner.slots[idx.0 as usize].pinned = true;
        Some(idx)
    }

    /// Make a frame eligible for eviction again
    pub(crate) fn unpin(&self, idx: FrameIndex) {
        self.inner.lock().slots[idx.0 as usize].pinned = false;
    }

    /// Unbind a frame and return it to the free list.
    ///
    /// Content is not cleared; every materialization path overwrites the
    /// whole frame before mapping it.
    pub(crate) fn release(&self, idx: FrameIndex) {
        let mut inner = self.inner.lock();
        inner.slots[idx.0 as usize] = FrameSlot {
            owner: None,
            pinned: false,
        };
        inner.free.push_back(idx.0);
        self.stats.released.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Raw Frame Access
// ============================================================================

/// View a frame's bytes.
pub(crate) fn frame_bytes<'a>(pa: u64) -> &'a mut [u8] {
    // SAFETY: `pa` designates one whole frame inside the pool's region and
    // the pool binds a frame to at most one page at a time.
    unsafe { core::slice::from_raw_parts_mut(pa as usize as *mut u8, PAGE_SIZE) }
}

/// Copy one frame's content onto another
pub(crate) fn copy_frame(src_pa: u64, dst_pa: u64) {
    let src = src_pa as usize as *const u8;
    let dst = dst_pa as usize as *mut u8;
    // SAFETY: both addresses designate distinct whole frames owned by the
    // caller for the duration of the copy.
    unsafe {
        core::ptr::copy_nonoverlapping(src, dst, PAGE_SIZE);
    }
}

// ============================================================================
// Global State
// ============================================================================

static FRAME_POOL: Once<FramePool> = Once::new();

/// Install the system-wide frame pool
pub fn init_global(pool: FramePool) {
    FRAME_POOL.call_once(|| pool);
}

/// Get the system-wide frame pool
pub fn global() -> &'static FramePool {
    FRAME_POOL.get().expect("Frame pool not initialized")
}

/// Get the system-wide frame pool if one was installed
pub fn try_global() -> Option<&'static FramePool> {
    FRAME_POOL.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SpaceId;
    use crate::vm::backing::{Backing, HeapSwap};
    use crate::vm::mapping::{MappingTable, SoftMappingTable};
    use crate::vm::spt;
    use alloc::vec;

    /// Page-aligned heap region standing in for physical memory.
    fn arena(frames: usize) -> (Vec<u8>, u64) {
        let mem = vec![0u8; (frames + 1) * PAGE_SIZE];
        let base = round_up(mem.as_ptr() as u64);
        (mem, base)
    }

    fn round_up(addr: u64) -> u64 {
        (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
    }

    fn anon_page(va: u64, hw: &Arc<SoftMappingTable>) -> Arc<Page> {
        Page::new(
            va,
            true,
            SpaceId::new(),
            hw.clone() as Arc<dyn MappingTable>,
            Backing::Anon { slot: None },
        )
    }

    #[test]
    fn test_acquire_and_release() {
        let (_mem, base) = arena(2);
        let pool = FramePool::new(base, 2, Arc::new(HeapSwap::new(4)));
        let hw = Arc::new(SoftMappingTable::new());

        assert_eq!(pool.free_count(), 2);
        let page = anon_page(0x4000, &hw);
        let idx = pool.acquire(&page).unwrap();
        assert_eq!(pool.free_count(), 1);
        assert!(pool.pa_of(idx) >= base);

        pool.release(idx);
        assert_eq!(pool.free_count(), 2);

        let snap = pool.snapshot();
        assert_eq!(snap.acquired, 1);
        assert_eq!(snap.released, 1);
        assert_eq!(snap.evicted, 0);
    }

    #[test]
    fn test_eviction_prefers_unreferenced_victim() {
        let (_mem, base) = arena(2);
        let pool = FramePool::new(base, 2, Arc::new(HeapSwap::new(4)));
        let hw = Arc::new(SoftMappingTable::new());

        let p1 = anon_page(0x4000, &hw);
        let p2 = anon_page(0x5000, &hw);
        spt::claim(&p1, &pool).unwrap();
        spt::claim(&p2, &pool).unwrap();
        assert_eq!(pool.free_count(), 0);

        // p1 referenced, p2 not: the clock must pick p2.
        hw.set_accessed(0x4000, true);
        hw.set_accessed(0x5000, false);

        let p3 = anon_page(0x6000, &hw);
        let idx = pool.acquire(&p3).unwrap();
        pool.unpin(idx);

        assert!(hw.is_mapped(0x4000));
        assert!(!hw.is_mapped(0x5000));
        assert!(p2.state.lock().frame.is_none());
        assert_eq!(pool.snapshot().evicted, 1);
    }

    #[test]
    fn test_exhaustion_when_everything_pinned() {
        let (_mem, base) = arena(1);
        let pool = FramePool::new(base, 1, Arc::new(HeapSwap::new(4)));
        let hw = Arc::new(SoftMappingTable::new());

        let p1 = anon_page(0x4000, &hw);
        let idx = spt::claim_pinned(&p1, &pool).unwrap();

        let p2 = anon_page(0x5000, &hw);
        assert_eq!(pool.acquire(&p2), Err(VmError::FramesExhausted));

        // Unpinning makes the frame evictable again.
        pool.unpin(idx);
        hw.set_accessed(0x4000, false);
        assert!(pool.acquire(&p2).is_ok());
    }

    #[test]
    fn test_copy_frame() {
        let (_mem, base) = arena(2);
        let src = base;
        let dst = base + PAGE_SIZE as u64;
        frame_bytes(src).fill(0x5a);
        copy_frame(src, dst);
        assert!(frame_bytes(dst).iter().all(|&b| b == 0x5a));
    }
}
