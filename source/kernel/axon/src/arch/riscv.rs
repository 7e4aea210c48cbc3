// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! RISC-V helpers for translation-root control.
//!
//! Written so host builds still compile via lightweight
//! `#[cfg(not(target_arch = "riscv64"))]` stubs, as elsewhere in the
//! kernel. These two entry points are the only places this crate touches
//! translation-cache state.

/// Installs `satp` as the active translation root on the calling hart and
/// invalidates every cached translation. Takes effect for the next memory
/// access; infallible.
pub fn activate_translation(satp: usize) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        use riscv::register::satp::{self, Mode};

        let ppn = satp & ((1usize << 44) - 1);
        let asid = (satp >> 44) & 0xffff;
        unsafe {
            satp::set(Mode::Sv39, asid, ppn);
            core::arch::asm!("sfence.vma x0, x0", options(nostack));
        }
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = satp;
    }
}

/// Invalidates all cached translations on the calling hart.
pub fn flush_translation() {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    unsafe {
        core::arch::asm!("sfence.vma x0, x0", options(nostack));
    }
}
