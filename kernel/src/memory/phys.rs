//! Access to physical frames from kernel virtual memory.

use x86_64::{PhysAddr, VirtAddr};

use crate::constants::memory::FRAME_SIZE;

/// Translates physical addresses into pointers the kernel can dereference.
///
/// # Safety
/// Implementors guarantee that for every frame handed out by the frame
/// allocator, `phys_to_virt` returns a pointer to `FRAME_SIZE` bytes that
/// alias exactly that frame and stay valid for the implementor's lifetime.
pub unsafe trait PhysMemory {
    fn phys_to_virt(&self, addr: PhysAddr) -> *mut u8;

    fn zero_frame(&self, frame: PhysAddr) {
        // SAFETY: covered by the trait contract.
        unsafe { core::ptr::write_bytes(self.phys_to_virt(frame), 0, FRAME_SIZE) };
    }

    fn copy_frame(&self, from: PhysAddr, to: PhysAddr) {
        // SAFETY: covered by the trait contract; distinct frames never overlap.
        unsafe {
            core::ptr::copy_nonoverlapping(self.phys_to_virt(from), self.phys_to_virt(to), FRAME_SIZE)
        };
    }
}

/// All of physical memory mapped linearly at a fixed virtual offset.
#[derive(Debug, Clone, Copy)]
pub struct OffsetPhysMemory {
    offset: VirtAddr,
}

impl OffsetPhysMemory {
    /// # Safety
    /// Physical memory must really be mapped at `offset` in every address
    /// space this is used from.
    pub const unsafe fn new(offset: VirtAddr) -> Self {
        OffsetPhysMemory { offset }
    }
}

unsafe impl PhysMemory for OffsetPhysMemory {
    fn phys_to_virt(&self, addr: PhysAddr) -> *mut u8 {
        (self.offset + addr.as_u64()).as_mut_ptr()
    }
}
