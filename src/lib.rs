//! Kernel core library: physical and virtual memory management, the bitmap
//! heap and the round-robin scheduler.
//!
//! The library builds freestanding for the i686 kernel image and on the host
//! for tests, where privileged instructions are emulated and physical memory
//! is simulated through a [`memory::PhysMapper`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod allocator;
pub mod arch;
pub mod config;
pub mod drivers;
pub mod logging;
pub mod memory;
#[cfg(all(target_arch = "x86", target_os = "none"))]
mod panic;
pub mod scheduler;
pub mod sync;
