//! Hardware Mapping Table Interface
//!
//! The virtual-memory core never walks architecture page tables itself; it
//! drives them through the [`MappingTable`] contract:
//!
//! - `install`: map a virtual page to a physical frame
//! - `clear`: drop a mapping (and its TLB entry)
//! - `lookup`: translate a virtual page to its physical frame
//! - accessed/dirty bits: read and reset the usage bits the hardware keeps
//!
//! This crate is the sole writer of user-page mappings behind a given table.
//!
//! [`SoftMappingTable`] is a software implementation backed by an ordinary
//! map. It serves embedders that have no hardware integration yet and every
//! test in this crate.

use alloc::collections::btree_map::Entry;
use alloc::collections::BTreeMap;
use spin::Mutex;

use crate::vm::addr::trunc_page;

// ============================================================================
// Mapping Table Contract
// ============================================================================

/// Interface to the hardware translation structures of one address space.
///
/// All addresses are rounded down to their page boundary by implementations.
pub trait MappingTable: Send + Sync {
    /// Install a mapping from `va` to the physical frame at `pa`.
    ///
    /// Re-installing an existing mapping updates its target and write
    /// permission in place, preserving the usage bits.
    fn install(&self, va: u64, pa: u64, writable: bool) -> bool;

    /// Remove the mapping for `va`, if any.
    fn clear(&self, va: u64);

    /// Translate `va` to the mapped physical frame address.
    fn lookup(&self, va: u64) -> Option<u64>;

    /// Check whether a mapping for `va` is currently installed.
    fn is_mapped(&self, va: u64) -> bool {
        self.lookup(va).is_some()
    }

    /// Read the accessed bit for `va`. Unmapped addresses report `false`.
    fn accessed(&self, va: u64) -> bool;

    /// Reset the accessed bit for `va`.
    fn clear_accessed(&self, va: u64);

    /// Read the dirty bit for `va`. Unmapped addresses report `false`.
    fn dirty(&self, va: u64) -> bool;
}

// ============================================================================
// Software Mapping Table
// ============================================================================

/// One installed translation.
#[derive(Debug, Clone, Copy)]
struct SoftEntry {
    pa: u64,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// Software mapping table: a plain map standing in for hardware page tables.
///
/// A freshly installed mapping starts with the accessed bit set (the
/// faulting access that caused the install has, by definition, touched the
/// page) and the dirty bit clear. Tests flip the bits through
/// [`SoftMappingTable::set_accessed`] and [`SoftMappingTable::set_dirty`]
/// the way real hardware would on memory traffic.
#[derive(Debug, Default)]
pub struct SoftMappingTable {
    entries: Mutex<BTreeMap<u64, SoftEntry>>,
}

impl SoftMappingTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Number of installed mappings
    pub fn mapped_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check whether the mapping at `va` is writable
    pub fn is_writable(&self, va: u64) -> bool {
        self.entries
            .lock()
            .get(&trunc_page(va))
            .map(|e| e.writable)
            .unwrap_or(false)
    }

    /// Simulate a hardware access: set the accessed bit
    pub fn set_accessed(&self, va: u64, accessed: bool) {
        if let Some(e) = self.entries.lock().get_mut(&trunc_page(va)) {
            e.accessed = accessed;
        }
    }

    /// Simulate a hardware write: set the dirty bit
    pub fn set_dirty(&self, va: u64, dirty: bool) {
        if let Some(e) = self.entries.lock().get_mut(&trunc_page(va)) {
            e.dirty = dirty;
        }
    }
}

impl MappingTable for SoftMappingTable {
    fn install(&self, va: u64, pa: u64, writable: bool) -> bool {
        let mut entries = self.entries.lock();
        match entries.entry(trunc_page(va)) {
            Entry::Occupied(mut o) => {
                let e = o.get_mut();
                e.pa = trunc_page(pa);
                e.writable = writable;
                e.accessed = true;
            }
            Entry::Vacant(v) => {
                v.insert(SoftEntry {
                    pa: trunc_page(pa),
                    writable,
                    accessed: true,
                    dirty: false,
                });
            }
        }
        true
    }

    fn clear(&self, va: u64) {
        self.entries.lock().remove(&trunc_page(va));
    }

    fn lookup(&self, va: u64) -> Option<u64> {
        self.entries.lock().get(&trunc_page(va)).map(|e| e.pa)
    }

    fn accessed(&self, va: u64) -> bool {
        self.entries
            .lock()
            .get(&trunc_page(va))
            .map(|e| e.accessed)
            .unwrap_or(false)
    }

    fn clear_accessed(&self, va: u64) {
        self.set_accessed(va, false);
    }

    fn dirty(&self, va: u64) -> bool {
        self.entries
            .lock()
            .get(&trunc_page(va))
            .map(|e| e.dirty)
            .unwrap_or(false)
    }
}
