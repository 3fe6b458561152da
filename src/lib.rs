//! UVM_R - A demand-paged virtual memory core in Rust
//!
//! This crate provides the memory-management heart of a user address
//! space: supplemental page tables, lazily-backed pages, a shared physical
//! frame pool with eviction, a page-fault resolution path, and eager
//! address-space duplication for fork.
//!
//! The hardware mapping tables, physical memory, swap area, and file
//! system stay behind narrow collaborator traits; embedders wire those up
//! and route traps into [`vm::handle_fault`].

#![no_std]

// Standard library replacement for no_std
extern crate alloc;

// Core types
pub mod types;

// Virtual memory subsystem
pub mod vm;

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = "UVM_R";

/// Initialize the library with its physical memory region: installs the
/// system-wide frame pool used when no pool is passed around explicitly.
pub fn init_with_memory(base: u64, frames: usize, swap: alloc::sync::Arc<dyn vm::SwapDevice>) {
    vm::init_with_memory(base, frames, swap);
}
