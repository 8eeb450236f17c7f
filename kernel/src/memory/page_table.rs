//! In-memory layout of 32-bit page directories and page tables.

use core::fmt;
use core::ops::{Index, IndexMut};

use x86_64::{
    structures::paging::{PageTableFlags, PhysFrame},
    PhysAddr,
};

use crate::constants::memory::{
    ENTRY_ADDRESS_MASK, ENTRY_COUNT, ENTRY_FLAGS_MASK, LARGE_ADDRESS_MASK,
};

/// One directory or table entry: frame address in bits 12..32, flags below.
///
/// The low flag bits share their layout with `PageTableFlags`, so those are
/// used directly; only bits 0..12 are ever stored.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub const fn unused() -> Self {
        PageTableEntry(0)
    }

    /// Entry pointing at `frame`.
    ///
    /// Only the low 32 bits of the frame address can be stored; callers that
    /// accept frames from outside the frame allocator check with [`fits`].
    ///
    /// [`fits`]: PageTableEntry::fits
    pub fn new(frame: PhysFrame, flags: PageTableFlags) -> Self {
        let addr = frame.start_address().as_u64();
        debug_assert!(Self::fits(frame));
        PageTableEntry(addr as u32 | (flags.bits() as u32 & ENTRY_FLAGS_MASK))
    }

    /// Whether `frame` is addressable by a 32-bit entry.
    pub fn fits(frame: PhysFrame) -> bool {
        frame.start_address().as_u64() <= u32::MAX as u64
    }

    pub const fn from_raw(raw: u32) -> Self {
        PageTableEntry(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    pub fn flags(&self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate((self.0 & ENTRY_FLAGS_MASK) as u64)
    }

    pub fn is_present(&self) -> bool {
        self.flags().contains(PageTableFlags::PRESENT)
    }

    /// Directory entry that maps a 4 MiB page directly.
    pub fn is_large(&self) -> bool {
        self.flags().contains(PageTableFlags::PRESENT | PageTableFlags::HUGE_PAGE)
    }

    pub fn addr(&self) -> PhysAddr {
        PhysAddr::new((self.0 & ENTRY_ADDRESS_MASK) as u64)
    }

    pub fn large_addr(&self) -> PhysAddr {
        PhysAddr::new((self.0 & LARGE_ADDRESS_MASK) as u64)
    }

    pub fn frame(&self) -> PhysFrame {
        PhysFrame::containing_address(self.addr())
    }

    pub fn set_flags(&mut self, flags: PageTableFlags) {
        self.0 = (self.0 & ENTRY_ADDRESS_MASK) | (flags.bits() as u32 & ENTRY_FLAGS_MASK);
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("addr", &self.addr())
            .field("flags", &self.flags())
            .finish()
    }
}

/// A page directory or a page table; both are one frame of 1024 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRY_COUNT],
}

impl PageTable {
    /// True if no entry is present.
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|entry| !entry.is_present())
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}
