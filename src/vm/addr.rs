//! Page Geometry and Address-Space Layout
//!
//! Page-size constants, alignment helpers, and the fixed boundaries of the
//! user portion of the address space (kernel base, user stack region).

/// Page size (4KB on most platforms)
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// First address of the kernel half of the address space.
/// User mappings live strictly below this boundary.
pub const KERNEL_BASE: u64 = 0x0000_8000_0000_0000;

/// Top of the user stack region (exclusive). The stack grows downward
/// from here.
pub const USER_STACK_TOP: u64 = KERNEL_BASE;

/// Maximum size the user stack may grow to (1 MiB).
pub const STACK_MAX: u64 = 1 << 20;

/// Lowest address the stack may ever reach.
pub const STACK_FLOOR: u64 = USER_STACK_TOP - STACK_MAX;

/// Faults this far below the saved stack pointer still count as stack
/// accesses (covers push-style instructions that fault before the
/// pointer is updated).
pub const STACK_PUSH_SLACK: u64 = 32;

/// Round address down to page boundary
pub const fn trunc_page(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

/// Round address up to page boundary
pub const fn round_page(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Check whether an address sits exactly on a page boundary
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE as u64 - 1) == 0
}

/// Check whether an address lies in the user half of the address space
pub const fn is_user_addr(addr: u64) -> bool {
    addr < KERNEL_BASE
}

/// Check whether an address lies in the null page
pub const fn is_null_page(addr: u64) -> bool {
    trunc_page(addr) == 0
}
