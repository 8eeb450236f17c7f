//! The Kernel Heap
//!
//! A boundary-tagged heap over a reserved virtual region. Every block starts
//! with a `BlockHeader` and ends with a `BlockFooter`; blocks tile
//! `[start, end)` without gaps. Free blocks are tracked in a [`SortedIndex`]
//! ordered by size, which lives at the very beginning of the region, so the
//! heap never needs memory from anywhere else.
//!
//! The region grows page by page through a [`HeapBacking`] up to its maximum
//! and hands trailing pages back once they are no longer needed.

use core::{
    alloc::{GlobalAlloc, Layout},
    mem::{size_of, MaybeUninit},
    ops::Range,
    ptr::{self, NonNull},
};

use spin::Mutex;
use x86_64::structures::paging::PageTableFlags;

use crate::{
    constants::memory::{
        HEAP_BLOCK_ALIGN, HEAP_CIGAM, HEAP_MAGIC, KERNEL_HEAP_INDEX, KERNEL_HEAP_INITIAL_SIZE,
        KERNEL_HEAP_MAX_SIZE, PAGE_SIZE,
    },
    debug, error,
    interrupts::without_interrupts,
    memory::{
        address::align_up,
        error::MemoryError,
        sorted_index::SortedIndex,
    },
    trace, warn,
};

/// Supplies the pages behind a heap region.
pub trait HeapBacking {
    /// Makes `range` (page aligned) accessible with `flags`.
    ///
    /// On error nothing in `range` may stay mapped.
    fn grow(&mut self, range: Range<usize>, flags: PageTableFlags) -> Result<(), MemoryError>;

    /// Returns the pages of `range` (page aligned). The heap no longer touches them.
    fn shrink(&mut self, range: Range<usize>);
}

/// Sizing and protection of a heap region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Free blocks the index can hold.
    pub index_capacity: usize,
    /// Bytes mapped up front, index included.
    pub initial_size: usize,
    /// Bytes the region may grow to.
    pub max_size: usize,
    /// Pages are mapped without user access.
    pub supervisor: bool,
    /// Pages are mapped without write access.
    pub readonly: bool,
}

impl HeapConfig {
    pub const KERNEL: HeapConfig = HeapConfig {
        index_capacity: KERNEL_HEAP_INDEX,
        initial_size: KERNEL_HEAP_INITIAL_SIZE,
        max_size: KERNEL_HEAP_MAX_SIZE,
        supervisor: true,
        readonly: false,
    };
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct BlockHeader {
    magic: u32,
    /// Whole block, header and footer included.
    size: u32,
    allocated: u8,
    _reserved: [u8; 7],
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct BlockFooter {
    cigam: u32,
    /// Offset of the owning header from the region base.
    header: u32,
}

const HEADER_SIZE: usize = size_of::<BlockHeader>();
const FOOTER_SIZE: usize = size_of::<BlockFooter>();
const TAG_OVERHEAD: usize = HEADER_SIZE + FOOTER_SIZE;
const MIN_BLOCK_SIZE: usize = align_up(TAG_OVERHEAD, HEAP_BLOCK_ALIGN);

/// One free block: its size and where its header sits relative to the region base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeEntry {
    pub size: u32,
    pub offset: u32,
}

fn by_size(a: &FreeEntry, b: &FreeEntry) -> bool {
    a.size < b.size
}

/// Snapshot produced by [`Heap::check`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub used_blocks: usize,
    pub used_bytes: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    pub largest_free: usize,
}

impl HeapStats {
    /// Bytes covered by blocks; always `end - start` for a consistent heap.
    pub fn total_bytes(&self) -> usize {
        self.used_bytes + self.free_bytes
    }
}

pub struct Heap<B> {
    index: SortedIndex<'static, FreeEntry>,
    /// Region base; block offsets are relative to it.
    base: usize,
    /// First block, right after the index storage.
    start: usize,
    end: usize,
    /// The region never shrinks below this.
    initial_end: usize,
    max: usize,
    supervisor: bool,
    readonly: bool,
    backing: B,
}

impl<B: HeapBacking> Heap<B> {
    /// Creates a heap at `region_start`, mapping `config.initial_size` bytes through `backing`.
    ///
    /// # Safety
    /// `[region_start, region_start + config.max_size)` must be reserved for
    /// this heap alone and become accessible exactly when `backing` grows it.
    /// The heap must not outlive that memory.
    pub unsafe fn new(
        region_start: usize,
        config: HeapConfig,
        mut backing: B,
    ) -> Result<Self, MemoryError> {
        if region_start % PAGE_SIZE != 0 {
            return Err(MemoryError::Misaligned(region_start as u64));
        }
        let initial_size = align_up(config.initial_size, PAGE_SIZE);
        let max_size = align_up(config.max_size.max(initial_size), PAGE_SIZE);
        if max_size > u32::MAX as usize {
            return Err(MemoryError::OutOfRange(max_size as u64));
        }
        let max = region_start
            .checked_add(max_size)
            .ok_or(MemoryError::OutOfRange(region_start as u64))?;

        let index_bytes = config
            .index_capacity
            .checked_mul(size_of::<FreeEntry>())
            .ok_or(MemoryError::RegionTooSmall)?;
        let start = align_up(region_start + index_bytes, HEAP_BLOCK_ALIGN);
        let end = region_start + initial_size;
        if config.index_capacity == 0 || start + MIN_BLOCK_SIZE > end {
            return Err(MemoryError::RegionTooSmall);
        }

        let flags = page_flags(config.supervisor, config.readonly);
        backing.grow(region_start..end, flags)?;

        let storage = core::slice::from_raw_parts_mut(
            region_start as *mut MaybeUninit<FreeEntry>,
            config.index_capacity,
        );
        let less: fn(&FreeEntry, &FreeEntry) -> bool = by_size;
        let mut heap = Heap {
            index: SortedIndex::place(storage, less),
            base: region_start,
            start,
            end,
            initial_end: end,
            max,
            supervisor: config.supervisor,
            readonly: config.readonly,
            backing,
        };
        heap.make_free(start, end - start)?;

        debug!(
            "heap at {:#x}: blocks {:#x}..{:#x}, max {:#x}",
            region_start, start, end, max
        );
        Ok(heap)
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn backing(&self) -> &B {
        &self.backing
    }

    /// Flags for pages mapped into this heap.
    pub fn page_flags(&self) -> PageTableFlags {
        page_flags(self.supervisor, self.readonly)
    }

    /// Allocates `size` bytes aligned to `align`.
    ///
    /// Takes the smallest free block that can hold the request; anything
    /// aligned beyond the natural block alignment splits off the gap in front
    /// of the payload as a separate free block. Grows the region on a miss.
    pub fn alloc(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, MemoryError> {
        if !align.is_power_of_two() {
            return Err(MemoryError::InvalidAlignment(align));
        }
        if size > self.max - self.start {
            return Err(MemoryError::OutOfMemory);
        }
        let needed = block_size(size);
        let align = align.max(HEAP_BLOCK_ALIGN);

        loop {
            if let Some((i, gap)) = self.find_fit(needed, align) {
                return self.take(i, gap, needed);
            }
            let slack = if align > HEAP_BLOCK_ALIGN {
                align + MIN_BLOCK_SIZE
            } else {
                0
            };
            self.expand(needed + slack)?;
        }
    }

    /// Frees the block whose payload starts at `ptr` and merges it with free neighbours.
    pub fn free(&mut self, ptr: *mut u8) -> Result<(), MemoryError> {
        let addr = ptr as usize;
        if addr < self.start + HEADER_SIZE
            || addr >= self.end
            || (addr - HEADER_SIZE - self.start) % HEAP_BLOCK_ALIGN != 0
        {
            return Err(MemoryError::InvalidFree(addr as u64));
        }
        let block = addr - HEADER_SIZE;
        let header = self.block_at(block)?;
        if header.allocated == 0 {
            return Err(MemoryError::DoubleFree(addr as u64));
        }

        let mut merged_start = block;
        let mut merged_size = header.size as usize;

        let next = block + merged_size;
        let next_free = if next < self.end {
            let next_header = self.block_at(next)?;
            (next_header.allocated == 0).then_some((next, next_header.size as usize))
        } else {
            None
        };
        let prev_free = if block > self.start {
            let footer = self.footer_before(block);
            let prev = self.base + footer.header as usize;
            let prev_header = self.block_at(prev)?;
            if prev + prev_header.size as usize != block {
                return Err(MemoryError::HeapCorruption(prev as u64));
            }
            (prev_header.allocated == 0).then_some((prev, prev_header.size as usize))
        } else {
            None
        };

        if next_free.is_none() && prev_free.is_none() && self.index.is_full() {
            warn!("heap index full, block {:#x} stays allocated", addr);
            return Err(MemoryError::IndexFull);
        }

        if let Some((next, size)) = next_free {
            self.unindex(next)?;
            merged_size += size;
        }
        if let Some((prev, size)) = prev_free {
            self.unindex(prev)?;
            merged_start = prev;
            merged_size += size;
        }

        if merged_start + merged_size == self.end && self.end > self.initial_end {
            let keep = align_up(
                (merged_start + MIN_BLOCK_SIZE).max(self.initial_end),
                PAGE_SIZE,
            );
            if keep < self.end {
                trace!("heap shrinks {:#x}..{:#x}", keep, self.end);
                self.backing.shrink(keep..self.end);
                self.end = keep;
                merged_size = keep - merged_start;
            }
        }

        self.make_free(merged_start, merged_size)
    }

    /// Payload bytes available behind an allocated `ptr`.
    pub fn usable_size(&self, ptr: *const u8) -> Result<usize, MemoryError> {
        let addr = ptr as usize;
        if addr < self.start + HEADER_SIZE || addr >= self.end {
            return Err(MemoryError::InvalidFree(addr as u64));
        }
        let header = self.block_at(addr - HEADER_SIZE)?;
        if header.allocated == 0 {
            return Err(MemoryError::InvalidFree(addr as u64));
        }
        Ok(header.size as usize - TAG_OVERHEAD)
    }

    /// Walks every block and cross-checks the tags against the index.
    pub fn check(&self) -> Result<HeapStats, MemoryError> {
        let mut stats = HeapStats::default();
        let mut block = self.start;
        let mut previous_free = false;

        while block < self.end {
            let header = self.block_at(block)?;
            let size = header.size as usize;
            if header.allocated == 0 {
                if previous_free {
                    return Err(MemoryError::HeapCorruption(block as u64));
                }
                let offset = (block - self.base) as u32;
                let indexed = self
                    .index
                    .iter()
                    .any(|entry| entry.offset == offset && entry.size as usize == size);
                if !indexed {
                    return Err(MemoryError::HeapCorruption(block as u64));
                }
                stats.free_blocks += 1;
                stats.free_bytes += size;
                stats.largest_free = stats.largest_free.max(size);
            } else {
                stats.used_blocks += 1;
                stats.used_bytes += size;
            }
            previous_free = header.allocated == 0;
            block += size;
        }

        if stats.free_blocks != self.index.len() {
            return Err(MemoryError::HeapCorruption(self.base as u64));
        }
        let mut sizes = self.index.iter().map(|entry| entry.size);
        if let Some(mut last) = sizes.next() {
            for size in sizes {
                if size < last {
                    return Err(MemoryError::HeapCorruption(self.base as u64));
                }
                last = size;
            }
        }
        Ok(stats)
    }

    /// Smallest index position whose block can host `needed` bytes at `align`,
    /// with the gap to split off in front.
    fn find_fit(&self, needed: usize, align: usize) -> Option<(usize, usize)> {
        self.index.iter().enumerate().find_map(|(i, entry)| {
            let block = self.base + entry.offset as usize;
            let gap = leading_gap(block, align);
            (gap + needed <= entry.size as usize).then_some((i, gap))
        })
    }

    fn take(&mut self, i: usize, gap: usize, needed: usize) -> Result<NonNull<u8>, MemoryError> {
        let entry = self.index.remove(i).ok_or(MemoryError::IndexFull)?;
        let mut block = self.base + entry.offset as usize;
        let mut size = entry.size as usize;

        if gap > 0 {
            self.make_free(block, gap)?;
            block += gap;
            size -= gap;
        }

        let remainder = size - needed;
        if remainder >= MIN_BLOCK_SIZE && !self.index.is_full() {
            self.write_tags(block, needed, true);
            self.make_free(block + needed, remainder)?;
        } else {
            self.write_tags(block, size, true);
        }

        let payload = (block + HEADER_SIZE) as *mut u8;
        NonNull::new(payload).ok_or(MemoryError::HeapCorruption(block as u64))
    }

    /// Maps more pages so that a free block of at least `needed` bytes ends the region.
    fn expand(&mut self, needed: usize) -> Result<(), MemoryError> {
        let trailing = self.trailing_free()?;
        let available = trailing.map_or(0, |(_, size)| size);
        let grow = align_up(needed.saturating_sub(available), PAGE_SIZE).max(PAGE_SIZE);
        let new_end = self.end.checked_add(grow).ok_or(MemoryError::OutOfMemory)?;
        if new_end > self.max {
            return Err(MemoryError::OutOfMemory);
        }
        if trailing.is_none() && self.index.is_full() {
            return Err(MemoryError::IndexFull);
        }

        let flags = self.page_flags();
        self.backing.grow(self.end..new_end, flags)?;
        let old_end = self.end;
        self.end = new_end;
        trace!("heap grows {:#x}..{:#x}", old_end, new_end);

        match trailing {
            Some((block, size)) => {
                self.unindex(block)?;
                self.make_free(block, size + grow)
            }
            None => self.make_free(old_end, grow),
        }
    }

    /// The free block ending exactly at `end`, if any.
    fn trailing_free(&self) -> Result<Option<(usize, usize)>, MemoryError> {
        let footer = self.footer_before(self.end);
        let block = self.base + footer.header as usize;
        let header = self.block_at(block)?;
        if block + header.size as usize != self.end {
            return Err(MemoryError::HeapCorruption(block as u64));
        }
        Ok((header.allocated == 0).then_some((block, header.size as usize)))
    }

    fn make_free(&mut self, block: usize, size: usize) -> Result<(), MemoryError> {
        self.write_tags(block, size, false);
        let entry = FreeEntry {
            size: size as u32,
            offset: (block - self.base) as u32,
        };
        self.index.insert(entry).map(|_| ())
    }

    fn unindex(&mut self, block: usize) -> Result<FreeEntry, MemoryError> {
        let offset = (block - self.base) as u32;
        self.index
            .position(|entry| entry.offset == offset)
            .and_then(|i| self.index.remove(i))
            .ok_or(MemoryError::HeapCorruption(block as u64))
    }

    /// Header of the block at `block` after checking bounds, magic values and the footer link.
    fn block_at(&self, block: usize) -> Result<BlockHeader, MemoryError> {
        let corrupt = MemoryError::HeapCorruption(block as u64);
        if block < self.start
            || block + MIN_BLOCK_SIZE > self.end
            || (block - self.start) % HEAP_BLOCK_ALIGN != 0
        {
            return Err(corrupt);
        }
        // SAFETY: in bounds and aligned; every byte of [start, end) is mapped.
        let header = unsafe { ptr::read(block as *const BlockHeader) };
        let size = header.size as usize;
        if header.magic != HEAP_MAGIC
            || size < MIN_BLOCK_SIZE
            || size % HEAP_BLOCK_ALIGN != 0
            || block + size > self.end
        {
            return Err(corrupt);
        }
        let footer = self.footer_before(block + size);
        if footer.cigam != HEAP_CIGAM || self.base + footer.header as usize != block {
            return Err(corrupt);
        }
        Ok(header)
    }

    fn footer_before(&self, block_end: usize) -> BlockFooter {
        unsafe { ptr::read((block_end - FOOTER_SIZE) as *const BlockFooter) }
    }

    fn write_tags(&mut self, block: usize, size: usize, allocated: bool) {
        let header = BlockHeader {
            magic: HEAP_MAGIC,
            size: size as u32,
            allocated: allocated as u8,
            _reserved: [0; 7],
        };
        let footer = BlockFooter {
            cigam: HEAP_CIGAM,
            header: (block - self.base) as u32,
        };
        unsafe {
            ptr::write(block as *mut BlockHeader, header);
            ptr::write((block + size - FOOTER_SIZE) as *mut BlockFooter, footer);
        }
    }
}

/// Block size for a `size`-byte payload.
fn block_size(size: usize) -> usize {
    align_up(size + TAG_OVERHEAD, HEAP_BLOCK_ALIGN).max(MIN_BLOCK_SIZE)
}

/// Bytes to skip at `block` so the payload lands on `align`.
///
/// A non-zero gap is always big enough to become a free block of its own.
fn leading_gap(block: usize, align: usize) -> usize {
    let payload = block + HEADER_SIZE;
    let mut gap = align_up(payload, align) - payload;
    while gap != 0 && gap < MIN_BLOCK_SIZE {
        gap += align;
    }
    gap
}

fn page_flags(supervisor: bool, readonly: bool) -> PageTableFlags {
    let mut flags = PageTableFlags::PRESENT;
    if !readonly {
        flags |= PageTableFlags::WRITABLE;
    }
    if !supervisor {
        flags |= PageTableFlags::USER_ACCESSIBLE;
    }
    flags
}

/// A heap behind a spinlock, usable as the global allocator.
pub struct LockedHeap<B>(Mutex<Option<Heap<B>>>);

impl<B: HeapBacking> LockedHeap<B> {
    pub const fn empty() -> Self {
        LockedHeap(Mutex::new(None))
    }

    pub fn init(&self, heap: Heap<B>) {
        without_interrupts(|| *self.0.lock() = Some(heap));
    }

    /// Runs `f` on the heap with interrupts disabled, or returns `None` before `init`.
    pub fn with_heap<R>(&self, f: impl FnOnce(&mut Heap<B>) -> R) -> Option<R> {
        without_interrupts(|| self.0.lock().as_mut().map(f))
    }
}

unsafe impl<B: HeapBacking> GlobalAlloc for LockedHeap<B> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.with_heap(|heap| heap.alloc(layout.size(), layout.align())) {
            Some(Ok(ptr)) => ptr.as_ptr(),
            Some(Err(err)) if err.is_fatal() => panic!("{}", err),
            Some(Err(err)) => {
                debug!("allocation of {} bytes failed: {}", layout.size(), err);
                ptr::null_mut()
            }
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        match self.with_heap(|heap| heap.free(ptr)) {
            Some(Ok(())) => {}
            Some(Err(err)) if err.is_fatal() => panic!("{}", err),
            Some(Err(err)) => error!("dealloc of {:#x}: {}", ptr as usize, err),
            None => error!("dealloc of {:#x} before heap init", ptr as usize),
        }
    }
}
