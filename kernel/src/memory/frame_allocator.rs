use crate::{
    interrupts::without_interrupts,
    memory::{bitmap_frame_allocator::BitmapFrameAllocator, error::MemoryError},
};
use spin::Mutex;

use x86_64::structures::paging::{PhysFrame, Size4KiB};

/// The kernel's single frame allocator, installed once at boot.
pub static FRAME_ALLOCATOR: Mutex<Option<BitmapFrameAllocator<'static>>> = Mutex::new(None);

/// Makes `allocator` the kernel-wide allocator, replacing any previous one.
pub fn install(allocator: BitmapFrameAllocator<'static>) {
    without_interrupts(|| *FRAME_ALLOCATOR.lock() = Some(allocator));
}

/// Allocates a frame from the kernel-wide allocator.
pub fn alloc_frame() -> Result<PhysFrame, MemoryError> {
    with_frame_allocator(|allocator| allocator.alloc_frame())
}

/// Returns a frame to the kernel-wide allocator.
pub fn dealloc_frame(frame: PhysFrame<Size4KiB>) -> Result<(), MemoryError> {
    with_frame_allocator(|allocator| allocator.free_frame(frame))
}

/// Runs `f` on the kernel-wide allocator with interrupts disabled.
///
/// A page-fault handler may need a frame, so the bitmap must never be seen
/// half-updated.
pub fn with_frame_allocator<F, R>(f: F) -> R
where
    F: FnOnce(&mut BitmapFrameAllocator<'static>) -> R,
{
    without_interrupts(|| {
        let mut guard = FRAME_ALLOCATOR.lock();
        if let Some(ref mut allocator) = *guard {
            f(allocator)
        } else {
            panic!("Frame allocator does not exist.");
        }
    })
}
