//! Splitting 32-bit virtual addresses into their two-level paging indices.

use x86_64::VirtAddr;

use crate::constants::memory::{ENTRY_COUNT, PAGE_SIZE};
use crate::memory::error::MemoryError;

/// Where a virtual address lands in a page directory walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageIndices {
    /// Bits 22..32.
    pub directory: usize,
    /// Bits 12..22.
    pub table: usize,
    /// Bits 0..12.
    pub offset: u32,
}

impl PageIndices {
    pub const fn from_u32(addr: u32) -> Self {
        PageIndices {
            directory: (addr >> 22) as usize,
            table: ((addr >> 12) as usize) & (ENTRY_COUNT - 1),
            offset: addr & (PAGE_SIZE as u32 - 1),
        }
    }

    /// Decomposes `addr`, which must fit in 32 bits.
    pub fn of(addr: VirtAddr) -> Result<Self, MemoryError> {
        let raw = u32::try_from(addr.as_u64()).map_err(|_| MemoryError::OutOfRange(addr.as_u64()))?;
        Ok(Self::from_u32(raw))
    }

    pub const fn to_u32(self) -> u32 {
        ((self.directory as u32) << 22) | ((self.table as u32) << 12) | self.offset
    }
}

/// Rounds `value` up to a multiple of `align` (a power of two).
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}
