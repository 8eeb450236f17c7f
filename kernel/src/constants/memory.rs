pub const PAGE_SIZE: usize = 4096;
pub const FRAME_SIZE: usize = 4096;

/// Entries in a page directory and in a page table.
pub const ENTRY_COUNT: usize = 1024;
/// Bytes covered by a single page directory entry (4 MiB).
pub const DIRECTORY_SPAN: u64 = (ENTRY_COUNT * PAGE_SIZE) as u64;

/// Bits of an entry that carry the frame address.
pub const ENTRY_ADDRESS_MASK: u32 = 0xFFFF_F000;
/// Frame address bits of a 4 MiB directory entry.
pub const LARGE_ADDRESS_MASK: u32 = 0xFFC0_0000;
/// Bits of an entry that carry flags.
pub const ENTRY_FLAGS_MASK: u32 = 0x0000_0FFF;

/// Physical memory below this address (BIOS data, VGA, option ROMs) is never handed out.
pub const LOW_MEMORY_END: u64 = 0x10_0000;
/// Two-level paging cannot address physical memory past 4 GiB.
pub const MAX_PHYSICAL_MEMORY: u64 = 0x1_0000_0000;

pub const BITMAP_ENTRY_SIZE: usize = 64;
pub const FULL_BITMAP_ENTRY: u64 = 0xFFFFFFFFFFFFFFFF;
pub const MAX_BITMAP_ENTRIES: usize = (MAX_PHYSICAL_MEMORY as usize / FRAME_SIZE) / BITMAP_ENTRY_SIZE;

/// Start of the kernel half of every address space. Directory slots from here up are shared.
pub const KERNEL_VIRT_BASE: u64 = 0xC000_0000;
/// Physical memory is visible at `KERNEL_VIRT_BASE + phys` for up to this many bytes.
pub const PHYS_WINDOW_SIZE: u64 = 0x2000_0000;

pub const KERNEL_HEAP_START: usize = 0xE000_0000;
pub const KERNEL_HEAP_INDEX: usize = 0x8000;
pub const KERNEL_HEAP_INITIAL_SIZE: usize = 0x10_0000;
pub const KERNEL_HEAP_MAX_SIZE: usize = 0x1000_0000;

/// Block header magic.
pub const HEAP_MAGIC: u32 = 0xEFBE_ADDE;
/// Block footer magic.
pub const HEAP_CIGAM: u32 = 0xDEAD_BEEF;
/// Alignment of every heap block and of every payload handed out.
pub const HEAP_BLOCK_ALIGN: usize = 16;
