use x86_64::VirtAddr;

/// Failures reported by the frame allocator, the page table manager and the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// No free frame left, or the heap cannot grow any further.
    OutOfMemory,
    /// Translation miss while walking a page directory.
    Unmapped(VirtAddr),
    /// The heap's free-block index is at capacity.
    IndexFull,
    /// The frame or heap block at this address is already free.
    DoubleFree(u64),
    /// This address does not name a frame or block that can be freed.
    InvalidFree(u64),
    /// A boundary tag at this address failed validation.
    HeapCorruption(u64),
    /// The region cannot even hold its own bookkeeping.
    RegionTooSmall,
    /// Address is not aligned the way the operation requires.
    Misaligned(u64),
    /// Requested alignment is not a power of two.
    InvalidAlignment(usize),
    /// Address lies outside what two-level paging can express.
    OutOfRange(u64),
    /// A 4 MiB directory entry already covers this address.
    MappingConflict(u64),
}

impl MemoryError {
    /// Corrupted boundary tags mean the heap can no longer be trusted; callers must halt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MemoryError::HeapCorruption(_))
    }
}

impl core::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MemoryError::OutOfMemory => write!(f, "Out of memory"),
            MemoryError::Unmapped(addr) => write!(f, "Address {:#x} is not mapped", addr.as_u64()),
            MemoryError::IndexFull => write!(f, "Heap index is full"),
            MemoryError::DoubleFree(addr) => write!(f, "Double free of {:#x}", addr),
            MemoryError::InvalidFree(addr) => write!(f, "Invalid free of {:#x}", addr),
            MemoryError::HeapCorruption(addr) => write!(f, "Heap corruption at {:#x}", addr),
            MemoryError::RegionTooSmall => write!(f, "Region too small"),
            MemoryError::Misaligned(addr) => write!(f, "Address {:#x} is misaligned", addr),
            MemoryError::InvalidAlignment(align) => {
                write!(f, "Alignment {} is not a power of two", align)
            }
            MemoryError::OutOfRange(addr) => write!(f, "Address {:#x} is out of range", addr),
            MemoryError::MappingConflict(addr) => {
                write!(f, "Address {:#x} is covered by a large page", addr)
            }
        }
    }
}
