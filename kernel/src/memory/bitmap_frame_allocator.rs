use core::ops::Range;

use crate::{
    constants::memory::{
        BITMAP_ENTRY_SIZE, FRAME_SIZE, FULL_BITMAP_ENTRY, LOW_MEMORY_END, MAX_PHYSICAL_MEMORY,
    },
    debug, error,
    memory::error::MemoryError,
};
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

/// Bitmap over every frame of physical memory; a set bit means in use.
///
/// The bitmap lives in storage supplied by the caller, since this allocator
/// has to work before any heap exists.
pub struct BitmapFrameAllocator<'a> {
    total_frames: usize,
    free_frames: usize,
    /// Frames below this index are reserved forever.
    first_frame: usize,
    to_allocate: usize,
    bitmap: &'a mut [u64],
}

impl<'a> BitmapFrameAllocator<'a> {
    /// Number of `u64` words needed to track `memory_size` bytes.
    pub const fn bitmap_words(memory_size: u64) -> usize {
        let memory_size = if memory_size > MAX_PHYSICAL_MEMORY {
            MAX_PHYSICAL_MEMORY
        } else {
            memory_size
        };
        (memory_size as usize / FRAME_SIZE).div_ceil(BITMAP_ENTRY_SIZE)
    }

    /// Builds the allocator for `memory_size` bytes of physical memory.
    ///
    /// Frames below 1 MiB and the frames covering `kernel` start out used.
    pub fn init(
        bitmap: &'a mut [u64],
        memory_size: u64,
        kernel: Range<PhysAddr>,
    ) -> Result<Self, MemoryError> {
        let memory_size = memory_size.min(MAX_PHYSICAL_MEMORY);
        let total_frames = memory_size as usize / FRAME_SIZE;
        let first_frame = LOW_MEMORY_END as usize / FRAME_SIZE;
        if total_frames <= first_frame {
            return Err(MemoryError::RegionTooSmall);
        }
        if bitmap.len() < Self::bitmap_words(memory_size) {
            return Err(MemoryError::RegionTooSmall);
        }
        bitmap.fill(FULL_BITMAP_ENTRY);

        let mut allocator = Self {
            total_frames,
            free_frames: 0,
            first_frame,
            to_allocate: first_frame,
            bitmap,
        };

        for frame_index in first_frame..total_frames {
            allocator.clear_bit(frame_index);
        }

        let kernel_start = kernel.start.as_u64() as usize / FRAME_SIZE;
        let kernel_end = (kernel.end.as_u64() as usize).div_ceil(FRAME_SIZE);
        for frame_index in kernel_start.max(first_frame)..kernel_end.min(total_frames) {
            allocator.set_bit(frame_index);
        }

        debug!(
            "frame allocator: {} frames, {} free, kernel image {:#x}..{:#x}",
            allocator.total_frames,
            allocator.free_frames,
            kernel.start.as_u64(),
            kernel.end.as_u64()
        );

        Ok(allocator)
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Check if frame is used. Frames outside physical memory count as used.
    pub fn is_frame_used(&self, frame: PhysFrame) -> bool {
        match self.frame_index(frame) {
            Some(index) => self.is_bit_set(index),
            None => true,
        }
    }

    /// Hands out one free frame, searching onward from the last allocation.
    pub fn alloc_frame(&mut self) -> Result<PhysFrame, MemoryError> {
        if self.free_frames == 0 {
            return Err(MemoryError::OutOfMemory);
        }
        loop {
            if self.to_allocate >= self.total_frames {
                self.to_allocate = self.first_frame;
            }
            let index = self.to_allocate;
            self.to_allocate += 1;
            if !self.is_bit_set(index) {
                self.set_bit(index);
                let addr = (index * FRAME_SIZE) as u64;
                return Ok(PhysFrame::containing_address(PhysAddr::new(addr)));
            }
        }
    }

    /// Returns `frame` to the pool.
    ///
    /// Freeing a frame that is already free leaves the bitmap untouched and
    /// reports `DoubleFree`.
    pub fn free_frame(&mut self, frame: PhysFrame) -> Result<(), MemoryError> {
        let addr = frame.start_address().as_u64();
        let Some(index) = self.frame_index(frame).filter(|&i| i >= self.first_frame) else {
            error!("free of frame {:#x} outside allocatable memory", addr);
            return Err(MemoryError::InvalidFree(addr));
        };
        if !self.is_bit_set(index) {
            error!("double free of frame {:#x}", addr);
            return Err(MemoryError::DoubleFree(addr));
        }
        self.clear_bit(index);
        Ok(())
    }

    fn frame_index(&self, frame: PhysFrame) -> Option<usize> {
        let index = frame.start_address().as_u64() as usize / FRAME_SIZE;
        (index < self.total_frames).then_some(index)
    }

    /// set a particular bit (1), taking in frame_index (usize)
    fn set_bit(&mut self, frame_index: usize) {
        assert!(frame_index < self.total_frames);

        let mask = 1 << (frame_index % 64);
        let word = &mut self.bitmap[frame_index / 64];
        if *word & mask == 0 {
            *word |= mask;
            self.free_frames -= 1;
        }
    }

    /// clear a particular bit (0), taking in frame_index (usize)
    fn clear_bit(&mut self, frame_index: usize) {
        assert!(frame_index < self.total_frames);

        let mask = 1 << (frame_index % 64);
        let word = &mut self.bitmap[frame_index / 64];
        if *word & mask != 0 {
            *word &= !mask;
            self.free_frames += 1;
        }
    }

    /// check if bit is set at frame_index. returns true if bit == 1, false otherwise
    fn is_bit_set(&self, frame_index: usize) -> bool {
        assert!(frame_index < self.total_frames);

        let mask = 1 << (frame_index % 64);
        (self.bitmap[frame_index / 64] & mask) != 0
    }
}

unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocator<'_> {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.alloc_frame().ok()
    }
}

impl FrameDeallocator<Size4KiB> for BitmapFrameAllocator<'_> {
    /// Errors are already logged by `free_frame`.
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        let _ = self.free_frame(frame);
    }
}
