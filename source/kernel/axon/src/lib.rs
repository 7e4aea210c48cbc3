// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sv39 virtual-memory engine for the Axon kernel.
//!
//! This crate owns the page-table walker, the region mapper, kernel and
//! per-process address-space construction, the process memory lifecycle
//! (load, grow, shrink, fork-time duplication, teardown), and the
//! user/kernel copy primitives, including the per-process shadow kernel
//! tables used for syscall argument access. Physical frames are reached
//! exclusively through [`mm::PhysMemory`], so the whole engine also runs
//! on the host against an emulated arena.

#![cfg_attr(not(any(test, feature = "emulated-memory")), no_std)]

#[macro_use]
pub mod diag;

pub mod arch;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod hal;
pub mod mm;
#[cfg(all(feature = "panic_handler", target_arch = "riscv64", target_os = "none", not(test)))]
mod panic;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod uart;

pub use mm::{
    Frame, KernelSpace, MemoryLayout, OnExisting, PageTable, PhysMemory, PteFlags, UserSpace,
    VmError, VmResult,
};
