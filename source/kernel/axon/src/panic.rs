// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Opt-in panic handler for images that link the engine standalone.

use core::fmt::Write;
use core::panic::PanicInfo;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    // Raw writer: the UART mutex may already be held by the panicking hart.
    let mut w = crate::uart::raw_writer();
    let _ = w.write_str("\nPANIC: ");
    let _ = write!(w, "{}", info);
    let _ = w.write_str("\n");
    loop {
        unsafe {
            core::arch::asm!("wfi", options(nomem, nostack));
        }
    }
}
