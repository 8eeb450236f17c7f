//! Host-side stand-ins for physical memory, the MMU and heap backing.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::{Cell, RefCell};
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard};

use x86_64::{
    structures::paging::{PageTableFlags, PhysFrame},
    PhysAddr, VirtAddr,
};

use crate::constants::memory::PAGE_SIZE;
use crate::memory::{
    bitmap_frame_allocator::BitmapFrameAllocator, error::MemoryError, heap::HeapBacking,
    phys::PhysMemory, tlb::Mmu,
};

/// Zeroed, page-aligned host memory.
pub struct Arena {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl Arena {
    pub fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, PAGE_SIZE).unwrap();
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).expect("arena allocation failed");
        Arena { ptr, layout }
    }

    pub fn start(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Physical memory view where physical address 0 is the first arena byte.
    pub fn phys(&self) -> ArenaPhys {
        ArenaPhys {
            base: self.ptr.as_ptr(),
            len: self.len(),
        }
    }

    /// Heap backing that lets a heap grow up to the end of the arena.
    pub fn backing(&self) -> ArenaBacking {
        ArenaBacking {
            limit: self.start() + self.len(),
            grown: Vec::new(),
            released: Vec::new(),
            flags: None,
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[derive(Clone, Copy)]
pub struct ArenaPhys {
    base: *mut u8,
    len: usize,
}

impl ArenaPhys {
    pub fn frame_bytes(&self, frame: PhysFrame) -> &[u8] {
        let ptr = self.phys_to_virt(frame.start_address());
        unsafe { std::slice::from_raw_parts(ptr, PAGE_SIZE) }
    }

    pub fn fill_frame(&self, frame: PhysFrame, seed: u8) {
        let ptr = self.phys_to_virt(frame.start_address());
        for i in 0..PAGE_SIZE {
            unsafe { ptr.add(i).write(seed.wrapping_add(i as u8)) };
        }
    }
}

unsafe impl PhysMemory for ArenaPhys {
    fn phys_to_virt(&self, addr: PhysAddr) -> *mut u8 {
        let offset = addr.as_u64() as usize;
        assert!(offset < self.len, "physical address {:#x} outside arena", offset);
        unsafe { self.base.add(offset) }
    }
}

/// MMU double that records every privileged operation.
#[derive(Default)]
pub struct RecordingMmu {
    pub flushed: RefCell<Vec<VirtAddr>>,
    pub full_flushes: Cell<usize>,
    pub loaded: Cell<Option<PhysFrame>>,
    pub enable_calls: Cell<usize>,
}

impl Mmu for RecordingMmu {
    fn flush(&self, addr: VirtAddr) {
        self.flushed.borrow_mut().push(addr);
    }

    fn flush_all(&self) {
        self.full_flushes.set(self.full_flushes.get() + 1);
    }

    unsafe fn load_directory(&self, directory: PhysFrame) {
        self.loaded.set(Some(directory));
    }

    unsafe fn enable_paging(&self) {
        self.enable_calls.set(self.enable_calls.get() + 1);
    }
}

/// Heap backing over an [`Arena`]; growth past the arena fails.
pub struct ArenaBacking {
    limit: usize,
    pub grown: Vec<Range<usize>>,
    pub released: Vec<Range<usize>>,
    pub flags: Option<PageTableFlags>,
}

impl ArenaBacking {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

impl HeapBacking for ArenaBacking {
    fn grow(&mut self, range: Range<usize>, flags: PageTableFlags) -> Result<(), MemoryError> {
        if range.end > self.limit {
            return Err(MemoryError::OutOfMemory);
        }
        self.flags = Some(flags);
        self.grown.push(range);
        Ok(())
    }

    fn shrink(&mut self, range: Range<usize>) {
        self.released.push(range);
    }
}

/// Bitmap storage plus allocator for `memory_size` bytes with no kernel image.
pub fn frame_allocator(bitmap: &mut Vec<u64>, memory_size: u64) -> BitmapFrameAllocator<'_> {
    bitmap.resize(BitmapFrameAllocator::bitmap_words(memory_size), 0);
    BitmapFrameAllocator::init(bitmap, memory_size, PhysAddr::new(0)..PhysAddr::new(0)).unwrap()
}

static GLOBAL_STATE: Mutex<()> = Mutex::new(());

/// Serializes tests that install the kernel-wide statics.
pub fn lock_globals() -> MutexGuard<'static, ()> {
    GLOBAL_STATE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
