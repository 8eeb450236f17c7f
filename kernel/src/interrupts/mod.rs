//! Interrupt-side collaborators of the memory core.
//!
//! This module provides:
//! - Critical sections that keep interrupt handlers out of allocator state
//! - Decoding of page-fault events for the fault handler

pub mod page_fault;

/// EFLAGS.IF
#[cfg(all(target_os = "none", target_arch = "x86"))]
const INTERRUPT_FLAG: u32 = 1 << 9;

/// Executes a closure with interrupts disabled, restoring the previous state after.
///
/// Every mutation of the kernel-wide frame bitmap, heap index, block tags
/// and page tables runs inside one of these, since a page-fault handler may
/// itself need a frame.
///
/// Hosted builds (unit tests) run at ring 3 where `cli` faults, so the
/// closure is simply called there.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    #[cfg(all(target_os = "none", target_arch = "x86"))]
    {
        use core::arch::asm;

        let flags: u32;
        unsafe {
            asm!("pushfd; pop {}", out(reg) flags, options(nomem, preserves_flags));
            asm!("cli", options(nomem, nostack, preserves_flags));
        }
        let result = f();
        if flags & INTERRUPT_FLAG != 0 {
            unsafe { asm!("sti", options(nomem, nostack, preserves_flags)) };
        }
        result
    }
    #[cfg(not(all(target_os = "none", target_arch = "x86")))]
    {
        f()
    }
}
