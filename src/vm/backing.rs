//! Backing-Store Variants
//!
//! Every virtual page is backed one of three ways:
//!
//! - **Uninit**: not yet materialized; carries a deferred initializer and
//!   the kind it will become on first use
//! - **Anon**: no file behind it; zero-filled on first use, swapped out
//!   under memory pressure
//! - **File**: content sourced from (and written back to) a region of an
//!   open file
//!
//! The variant is an explicit sum type; materialize/evict/destroy dispatch
//! via `match`. The swap area and the file system stay behind the
//! [`SwapDevice`] and [`BackingFile`] contracts — this module never opens,
//! closes, or block-addresses anything itself.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::vm::mapping::MappingTable;
use crate::vm::VmError;

// ============================================================================
// Collaborator Contracts
// ============================================================================

/// Opaque handle to one swap slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(pub u32);

/// Interface to the swap area: allocate, fill, drain, and free page-sized
/// slots. Slot contents are exactly one page.
pub trait SwapDevice: Send + Sync {
    /// Reserve a free slot, or `None` when the swap area is full
    fn alloc_slot(&self) -> Option<SwapSlot>;

    /// Write one page of data into `slot`
    fn write_slot(&self, slot: SwapSlot, buf: &[u8]) -> Result<(), VmError>;

    /// Read one page of data back out of `slot`
    fn read_slot(&self, slot: SwapSlot, buf: &mut [u8]) -> Result<(), VmError>;

    /// Return `slot` to the free pool
    fn free_slot(&self, slot: SwapSlot);
}

/// Interface to an open file a page can be mapped over.
///
/// Handles are created by the file-system collaborator and passed in at
/// page-creation time; this crate only reads and writes byte ranges.
pub trait BackingFile: Send + Sync {
    /// Read up to `buf.len()` bytes starting at `offset`; returns the
    /// number of bytes read (short at end of file)
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, VmError>;

    /// Write `buf` starting at `offset`; returns the number of bytes written
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, VmError>;

    /// Current length of the file in bytes
    fn len(&self) -> u64;

    /// Check whether the file is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Backing Variants
// ============================================================================

/// Deferred page initializer: runs once over the freshly zeroed frame on
/// first materialization. Auxiliary data lives in the closure's captures.
pub type PageInit = Box<dyn FnOnce(&mut [u8]) -> Result<(), VmError> + Send>;

/// The kind a lazily-created page becomes on first materialization.
pub enum Target {
    /// Becomes an anonymous, swappable page
    Anon,
    /// Becomes a page over a file region
    File {
        file: Arc<dyn BackingFile>,
        offset: u64,
        len: usize,
    },
}

/// Effective kind of a page, with lazy creation resolved to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Anon,
    File,
}

/// How one page's content is produced and persisted.
pub enum Backing {
    /// Not yet materialized
    Uninit {
        target: Target,
        init: Option<PageInit>,
    },
    /// Anonymous memory; `slot` records swapped-out content
    Anon { slot: Option<SwapSlot> },
    /// A region of an open file
    File {
        file: Arc<dyn BackingFile>,
        offset: u64,
        len: usize,
    },
}

impl Target {
    fn into_backing(self) -> Backing {
        match self {
            Target::Anon => Backing::Anon { slot: None },
            Target::File { file, offset, len } => Backing::File { file, offset, len },
        }
    }

    fn kind(&self) -> PageKind {
        match self {
            Target::Anon => PageKind::Anon,
            Target::File { .. } => PageKind::File,
        }
    }
}

impl Backing {
    /// Create a fresh lazily-initialized backing
    pub fn uninit(target: Target, init: Option<PageInit>) -> Self {
        Backing::Uninit { target, init }
    }

    /// Effective kind; an unmaterialized page reports its declared target
    pub fn kind(&self) -> PageKind {
        match self {
            Backing::Uninit { target, .. } => target.kind(),
            Backing::Anon { .. } => PageKind::Anon,
            Backing::File { .. } => PageKind::File,
        }
    }

    /// Check whether the page has not been materialized yet
    pub fn is_uninit(&self) -> bool {
        matches!(self, Backing::Uninit { .. })
    }

    /// Populate `frame` with this page's content.
    ///
    /// A Uninit backing zeroes the frame, runs its stored initializer (or
    /// loads its declared file region when it has none), and permanently
    /// becomes its target kind. Anon drains and frees its swap slot or
    /// zero-fills. File reads its region and leaves the tail zeroed.
    ///
    /// Every path overwrites the full frame, so recycled frames never leak
    /// a previous owner's content.
    pub(crate) fn materialize(
        &mut self,
        frame: &mut [u8],
        swap: &dyn SwapDevice,
    ) -> Result<(), VmError> {
        match self {
            Backing::Uninit { .. } => {
                let (target, init) =
                    match core::mem::replace(self, Backing::Anon { slot: None }) {
                        Backing::Uninit { target, init } => (target, init),
                        _ => unreachable!(),
                    };
                frame.fill(0);
                let loaded = match init {
                    Some(init) => init(frame),
                    None => match &target {
                        Target::File { file, offset, len } => {
                            read_region(file.as_ref(), *offset, *len, frame)
                        }
                        Target::Anon => Ok(()),
                    },
                };
                *self = target.into_backing();
                loaded
            }
            Backing::Anon { slot } => {
                match slot.take() {
                    Some(s) => {
                        swap.read_slot(s, frame)?;
                        swap.free_slot(s);
                    }
                    None => frame.fill(0),
                }
                Ok(())
            }
            Backing::File { file, offset, len } => {
                frame.fill(0);
                read_region(file.as_ref(), *offset, *len, frame)
            }
        }
    }

    /// Persist `frame`'s content so the frame can be reclaimed.
    ///
    /// Anon content goes to a fresh swap slot. File content goes back to
    /// the file, but only when the mapping is writable and the hardware
    /// reports it dirty; clean file pages are simply dropped.
    pub(crate) fn evict(
        &mut self,
        va: u64,
        writable: bool,
        frame: &[u8],
        swap: &dyn SwapDevice,
        hw: &dyn MappingTable,
    ) -> Result<(), VmError> {
        match self {
            Backing::Anon { slot } => {
                let s = swap.alloc_slot().ok_or(VmError::SwapExhausted)?;
                if let Err(e) = swap.write_slot(s, frame) {
                    swap.free_slot(s);
                    return Err(e);
                }
                *slot = Some(s);
                Ok(())
            }
            Backing::File { file, offset, len } => {
                if writable && hw.dirty(va) {
                    file.write_at(*offset, &frame[..(*len).min(frame.len())])?;
                }
                Ok(())
            }
            // Never bound to a frame, so never a victim.
            Backing::Uninit { .. } => Ok(()),
        }
    }

    /// Release variant-specific resources. The frame itself is released by
    /// the caller.
    pub(crate) fn destroy(&mut self, swap: &dyn SwapDevice) {
        if let Backing::Anon { slot } = self {
            if let Some(s) = slot.take() {
                swap.free_slot(s);
            }
        }
    }
}

/// Read `len` bytes of `file` at `offset` into the head of `frame`.
/// The caller has zeroed the frame; a short read leaves the tail zero.
fn read_region(
    file: &dyn BackingFile,
    offset: u64,
    len: usize,
    frame: &mut [u8],
) -> Result<(), VmError> {
    let len = len.min(frame.len());
    file.read_at(offset, &mut frame[..len])?;
    Ok(())
}

// ============================================================================
// Memory-Backed Collaborators
// ============================================================================

/// Swap device held entirely in memory.
///
/// Useful for embedders without a swap partition and for exercising the
/// eviction paths in tests.
pub struct HeapSwap {
    capacity: usize,
    inner: Mutex<HeapSwapInner>,
}

struct HeapSwapInner {
    slots: BTreeMap<u32, Vec<u8>>,
    free: Vec<u32>,
    next: u32,
}

impl HeapSwap {
    /// Create a swap area with room for `capacity` page slots
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(HeapSwapInner {
                slots: BTreeMap::new(),
                free: Vec::new(),
                next: 0,
            }),
        }
    }

    /// Number of slots currently holding swapped-out pages
    pub fn used_slots(&self) -> usize {
        self.inner.lock().slots.len()
    }
}

impl SwapDevice for HeapSwap {
    fn alloc_slot(&self) -> Option<SwapSlot> {
        let mut inner = self.inner.lock();
        if let Some(id) = inner.free.pop() {
            inner.slots.insert(id, Vec::new());
            return Some(SwapSlot(id));
        }
        if (inner.next as usize) < self.capacity {
            let id = inner.next;
            inner.next += 1;
            inner.slots.insert(id, Vec::new());
            return Some(SwapSlot(id));
        }
        None
    }

    fn write_slot(&self, slot: SwapSlot, buf: &[u8]) -> Result<(), VmError> {
        let mut inner = self.inner.lock();
        match inner.slots.get_mut(&slot.0) {
            Some(data) => {
                data.clear();
                data.extend_from_slice(buf);
                Ok(())
            }
            None => Err(VmError::Backing),
        }
    }

    fn read_slot(&self, slot: SwapSlot, buf: &mut [u8]) -> Result<(), VmError> {
        let inner = self.inner.lock();
        match inner.slots.get(&slot.0) {
            Some(data) if data.len() == buf.len() => {
                buf.copy_from_slice(data);
                Ok(())
            }
            _ => Err(VmError::Backing),
        }
    }

    fn free_slot(&self, slot: SwapSlot) {
        let mut inner = self.inner.lock();
        if inner.slots.remove(&slot.0).is_some() {
            inner.free.push(slot.0);
        }
    }
}

/// File handle over an in-memory byte buffer.
pub struct MemFile {
    data: Mutex<Vec<u8>>,
}

impl MemFile {
    /// Create a file with the given initial content
    pub fn new(content: &[u8]) -> Self {
        Self {
            data: Mutex::new(content.to_vec()),
        }
    }

    /// Snapshot the current content
    pub fn content(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl BackingFile for MemFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, VmError> {
        let data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, VmError> {
        let mut data = self.data.lock();
        let offset = offset as usize;
        let end = offset + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn len(&self) -> u64 {
        self.data.lock().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::addr::PAGE_SIZE;
    use crate::vm::mapping::SoftMappingTable;

    #[test]
    fn test_heap_swap_round_trip() {
        let swap = HeapSwap::new(2);

        let a = swap.alloc_slot().unwrap();
        let b = swap.alloc_slot().unwrap();
        assert!(swap.alloc_slot().is_none()); // Area full

        let page = [0xabu8; PAGE_SIZE];
        swap.write_slot(a, &page).unwrap();

        let mut out = [0u8; PAGE_SIZE];
        swap.read_slot(a, &mut out).unwrap();
        assert_eq!(out[0], 0xab);
        assert_eq!(out[PAGE_SIZE - 1], 0xab);

        swap.free_slot(a);
        swap.free_slot(b);
        assert_eq!(swap.used_slots(), 0);
        assert!(swap.alloc_slot().is_some()); // Freed slots are reusable
    }

    #[test]
    fn test_mem_file_io() {
        let file = MemFile::new(b"hello world");
        let mut buf = [0u8; 5];
        assert_eq!(file.read_at(6, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");

        file.write_at(0, b"jello").unwrap();
        assert_eq!(&file.content()[..5], b"jello");

        // Reads past the end are short, not errors.
        assert_eq!(file.read_at(100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_uninit_runs_initializer_once() {
        let swap = HeapSwap::new(4);
        let mut backing = Backing::uninit(
            Target::Anon,
            Some(Box::new(|frame: &mut [u8]| {
                frame[..4].copy_from_slice(&[1, 2, 3, 4]);
                Ok(())
            })),
        );
        assert!(backing.is_uninit());
        assert_eq!(backing.kind(), PageKind::Anon);

        let mut frame = [0xffu8; PAGE_SIZE];
        backing.materialize(&mut frame, &swap).unwrap();
        assert_eq!(&frame[..4], &[1, 2, 3, 4]);
        assert_eq!(frame[4], 0); // Zeroed before the initializer ran
        assert!(!backing.is_uninit());
    }

    #[test]
    fn test_anon_swap_cycle() {
        let swap = HeapSwap::new(4);
        let hw = SoftMappingTable::new();
        hw.install(0x4000, 0x1000, true);

        let mut backing = Backing::Anon { slot: None };
        let mut frame = [0u8; PAGE_SIZE];
        backing.materialize(&mut frame, &swap).unwrap();

        frame[17] = 0x7f;
        backing
            .evict(0x4000, true, &frame, &swap, &hw)
            .unwrap();
        assert_eq!(swap.used_slots(), 1);

        let mut refill = [0u8; PAGE_SIZE];
        backing.materialize(&mut refill, &swap).unwrap();
        assert_eq!(refill[17], 0x7f);
        assert_eq!(swap.used_slots(), 0); // Slot freed after swap-in
    }

    #[test]
    fn test_file_materialize_zeroes_tail() {
        let swap = HeapSwap::new(1);
        let file: Arc<dyn BackingFile> = Arc::new(MemFile::new(b"abc"));
        let mut backing = Backing::File {
            file,
            offset: 0,
            len: 3,
        };

        let mut frame = [0xffu8; PAGE_SIZE];
        backing.materialize(&mut frame, &swap).unwrap();
        assert_eq!(&frame[..3], b"abc");
        assert!(frame[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_file_evict_writes_back_only_dirty() {
        let swap = HeapSwap::new(1);
        let hw = SoftMappingTable::new();
        hw.install(0x4000, 0x1000, true);

        let mem = Arc::new(MemFile::new(b"aaaa"));
        let file: Arc<dyn BackingFile> = mem.clone();
        let mut backing = Backing::File {
            file,
            offset: 0,
            len: 4,
        };

        let mut frame = [0u8; PAGE_SIZE];
        backing.materialize(&mut frame, &swap).unwrap();
        frame[..4].copy_from_slice(b"bbbb");

        // Clean page: dropped, file untouched.
        backing.evict(0x4000, true, &frame, &swap, &hw).unwrap();
        assert_eq!(&mem.content()[..4], b"aaaa");

        // Dirty page: written back.
        hw.set_dirty(0x4000, true);
        backing.evict(0x4000, true, &frame, &swap, &hw).unwrap();
        assert_eq!(&mem.content()[..4], b"bbbb");
    }

    #[test]
    fn test_destroy_frees_swap_slot() {
        let swap = HeapSwap::new(1);
        let hw = SoftMappingTable::new();
        hw.install(0x4000, 0x1000, true);

        let mut backing = Backing::Anon { slot: None };
        let frame = [9u8; PAGE_SIZE];
        backing.evict(0x4000, true, &frame, &swap, &hw).unwrap();
        assert_eq!(swap.used_slots(), 1);

        backing.destroy(&swap);
        assert_eq!(swap.used_slots(), 0);
    }
}
