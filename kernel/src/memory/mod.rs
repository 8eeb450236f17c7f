//! Memory management: physical frames, address spaces and the kernel heap.
//!
//! The submodules are plain data structures that work on whatever memory
//! they are handed. [`kernel`] owns the kernel-wide instances and the boot
//! sequence that wires them together; it only exists for 32-bit x86.

pub mod address;
pub mod bitmap_frame_allocator;
pub mod error;
pub mod frame_allocator;
pub mod heap;
#[cfg(any(target_arch = "x86", test))]
pub mod kernel;
pub mod page_table;
pub mod paging;
pub mod phys;
pub mod sorted_index;
pub mod tlb;

#[cfg(all(target_arch = "x86", not(test)))]
pub use kernel::init;
#[cfg(any(target_arch = "x86", test))]
pub use kernel::{with_kernel_paging, BootInfo, KernelBacking, KERNEL_PAGING};
