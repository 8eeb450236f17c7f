//! Privileged translation-control operations.
//!
//! The page table manager only ever touches the MMU through [`Mmu`], so the
//! table-walking logic can run against a recording double in tests.

use x86_64::{structures::paging::PhysFrame, VirtAddr};

pub trait Mmu {
    /// Discards the cached translation for the page containing `addr`.
    fn flush(&self, addr: VirtAddr);

    /// Discards every cached translation.
    fn flush_all(&self);

    /// Makes `directory` the active address space.
    ///
    /// # Safety
    /// The directory must map the currently executing code and stack.
    unsafe fn load_directory(&self, directory: PhysFrame);

    /// Turns on address translation.
    ///
    /// # Safety
    /// A directory that identity- or offset-maps the running kernel must be loaded.
    unsafe fn enable_paging(&self);
}

/// The real MMU of the executing CPU.
///
/// Only exists on 32-bit x86, where CR3 takes the physical address of a
/// two-level directory and CR0.PG turns on non-PAE paging.
#[cfg(target_arch = "x86")]
#[derive(Debug, Default, Clone, Copy)]
pub struct X86Mmu;

#[cfg(target_arch = "x86")]
impl Mmu for X86Mmu {
    fn flush(&self, addr: VirtAddr) {
        let vaddr = addr.as_u64() as u32;
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) vaddr, options(nostack, preserves_flags));
        }
    }

    fn flush_all(&self) {
        // Rewriting CR3 drops every non-global translation.
        unsafe {
            core::arch::asm!(
                "mov {tmp}, cr3",
                "mov cr3, {tmp}",
                tmp = out(reg) _,
                options(nostack, preserves_flags),
            );
        }
    }

    unsafe fn load_directory(&self, directory: PhysFrame) {
        let pd = directory.start_address().as_u64() as u32;
        core::arch::asm!("mov cr3, {}", in(reg) pd, options(nostack, preserves_flags));
    }

    unsafe fn enable_paging(&self) {
        core::arch::asm!(
            "mov {tmp}, cr0",
            "or {tmp}, 0x80000000",
            "mov cr0, {tmp}",
            tmp = out(reg) _,
            options(nostack),
        );
    }
}
