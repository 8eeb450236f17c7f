//! The kernel-wide instances and the boot sequence that wires them together.

use core::ops::Range;

use spin::Mutex;
use x86_64::{
    structures::paging::{Page, PageTableFlags, PhysFrame},
    PhysAddr, VirtAddr,
};

use super::{
    address::PageIndices,
    bitmap_frame_allocator::BitmapFrameAllocator,
    error::MemoryError,
    frame_allocator::{self, with_frame_allocator},
    heap::{HeapBacking, LockedHeap},
    paging::PageTableManager,
    phys::{OffsetPhysMemory, PhysMemory},
    tlb::Mmu,
};
use crate::{
    constants::memory::{
        DIRECTORY_SPAN, KERNEL_HEAP_MAX_SIZE, KERNEL_HEAP_START, KERNEL_VIRT_BASE, PAGE_SIZE,
        PHYS_WINDOW_SIZE,
    },
    info,
    interrupts::without_interrupts,
    warn,
};

// The physical window must end where the heap begins.
const _: () = assert!(KERNEL_VIRT_BASE + PHYS_WINDOW_SIZE <= KERNEL_HEAP_START as u64);

#[cfg(not(test))]
type KernelMmu = super::tlb::X86Mmu;
#[cfg(test)]
type KernelMmu = crate::testing::RecordingMmu;

/// What the boot environment tells us about physical memory.
#[derive(Debug, Clone)]
pub struct BootInfo {
    /// Bytes of physical memory, starting at address 0.
    pub memory_size: u64,
    /// Physical extent of the loaded kernel image.
    pub kernel: Range<PhysAddr>,
}

impl BootInfo {
    /// Physical memory the kernel can reach through its window.
    ///
    /// Frames past this would alias the heap when zeroed or copied, so the
    /// frame allocator never hands them out.
    pub fn reachable_memory(&self) -> u64 {
        self.memory_size.min(PHYS_WINDOW_SIZE)
    }
}

pub type KernelPageTableManager = PageTableManager<OffsetPhysMemory, KernelMmu>;

/// The kernel's page table manager together with the kernel directory.
pub struct KernelPaging {
    pub manager: KernelPageTableManager,
    pub directory: PhysFrame,
}

pub static KERNEL_PAGING: Mutex<Option<KernelPaging>> = Mutex::new(None);

#[cfg_attr(target_os = "none", global_allocator)]
pub static ALLOCATOR: LockedHeap<KernelBacking> = LockedHeap::empty();

#[cfg(not(test))]
static INITIALIZED: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);

#[cfg(not(test))]
static mut FRAME_BITMAP: [u64; crate::constants::memory::MAX_BITMAP_ENTRIES] =
    [0; crate::constants::memory::MAX_BITMAP_ENTRIES];

/// Brings up memory management.
///
/// Expects the boot environment to run the kernel from the higher half with
/// physical memory already visible at `KERNEL_VIRT_BASE`. Builds the frame
/// allocator, creates the kernel directory with the physical window and the
/// heap's page tables, switches to it and finally creates the kernel heap.
#[cfg(not(test))]
pub fn init(boot: &BootInfo) -> Result<(), MemoryError> {
    use core::sync::atomic::Ordering;

    use super::heap::{Heap, HeapConfig};

    if INITIALIZED.swap(true, Ordering::AcqRel) {
        warn!("memory already initialized");
        return Ok(());
    }
    crate::logging::init();

    // SAFETY: `INITIALIZED` lets exactly one caller through here.
    let bitmap = unsafe { &mut *core::ptr::addr_of_mut!(FRAME_BITMAP) };
    // SAFETY: required of the boot environment, and kept by the window mapped in `bring_up`.
    let memory = unsafe { OffsetPhysMemory::new(VirtAddr::new(KERNEL_VIRT_BASE)) };
    bring_up(boot, bitmap, memory, super::tlb::X86Mmu)?;

    let heap = unsafe { Heap::new(KERNEL_HEAP_START, HeapConfig::KERNEL, KernelBacking) }?;
    ALLOCATOR.init(heap);
    info!("kernel heap ready at {:#x}", KERNEL_HEAP_START);
    Ok(())
}

/// Builds the frame allocator over the memory reachable through the window.
pub fn kernel_frame_allocator<'a>(
    boot: &BootInfo,
    bitmap: &'a mut [u64],
) -> Result<BitmapFrameAllocator<'a>, MemoryError> {
    let reachable = boot.reachable_memory();
    if reachable < boot.memory_size {
        warn!(
            "only the first {} MiB of {} MiB physical memory are usable",
            reachable >> 20,
            boot.memory_size >> 20
        );
    }
    BitmapFrameAllocator::init(bitmap, reachable, boot.kernel.clone())
}

/// Installs the frame allocator and switches to a fresh kernel directory.
fn bring_up(
    boot: &BootInfo,
    bitmap: &'static mut [u64],
    memory: OffsetPhysMemory,
    mmu: KernelMmu,
) -> Result<(), MemoryError> {
    let frames = kernel_frame_allocator(boot, bitmap)?;
    info!(
        "{} MiB physical memory, {} frames free",
        boot.memory_size >> 20,
        frames.free_frames()
    );
    frame_allocator::install(frames);

    let mut manager = PageTableManager::new(memory, mmu, VirtAddr::new(KERNEL_VIRT_BASE));
    let directory = with_frame_allocator(|frames| -> Result<PhysFrame, MemoryError> {
        let directory = manager.create_directory(frames)?;
        map_window(&manager, frames, directory, boot.reachable_memory())?;

        // Heap tables exist up front so every later directory shares them.
        let first = PageIndices::from_u32(KERNEL_HEAP_START as u32).directory;
        let slots = (KERNEL_HEAP_MAX_SIZE as u64).div_ceil(DIRECTORY_SPAN) as usize;
        for slot in first..first + slots {
            manager.ensure_table(frames, directory, slot, false)?;
        }
        Ok(directory)
    })?;

    unsafe {
        manager.load_directory(directory);
        manager.enable();
    }
    without_interrupts(|| *KERNEL_PAGING.lock() = Some(KernelPaging { manager, directory }));
    Ok(())
}

/// Runs `f` on the kernel page tables with interrupts disabled.
pub fn with_kernel_paging<F, R>(f: F) -> R
where
    F: FnOnce(&mut KernelPaging) -> R,
{
    without_interrupts(|| {
        let mut guard = KERNEL_PAGING.lock();
        if let Some(ref mut paging) = *guard {
            f(paging)
        } else {
            panic!("Kernel paging does not exist.");
        }
    })
}

/// Backs the kernel heap with fresh frames mapped into the kernel directory.
pub struct KernelBacking;

impl HeapBacking for KernelBacking {
    fn grow(&mut self, range: Range<usize>, flags: PageTableFlags) -> Result<(), MemoryError> {
        with_kernel_paging(|kernel| {
            with_frame_allocator(|frames| {
                map_fresh(&kernel.manager, frames, kernel.directory, range, flags)
            })
        })
    }

    fn shrink(&mut self, range: Range<usize>) {
        with_kernel_paging(|kernel| {
            with_frame_allocator(|frames| {
                unmap_and_free(&kernel.manager, frames, kernel.directory, range)
            })
        })
    }
}

fn map_window<M: PhysMemory, T: Mmu>(
    paging: &PageTableManager<M, T>,
    frames: &mut BitmapFrameAllocator,
    directory: PhysFrame,
    size: u64,
) -> Result<(), MemoryError> {
    for offset in (0..size).step_by(PAGE_SIZE) {
        let frame = PhysFrame::containing_address(PhysAddr::new(offset));
        let page = Page::containing_address(VirtAddr::new(KERNEL_VIRT_BASE + offset));
        paging.map_page(frames, directory, frame, page, PageTableFlags::WRITABLE)?;
    }
    Ok(())
}

/// Maps every page of `range` to a newly allocated frame. All or nothing.
fn map_fresh<M: PhysMemory, T: Mmu>(
    paging: &PageTableManager<M, T>,
    frames: &mut BitmapFrameAllocator,
    directory: PhysFrame,
    range: Range<usize>,
    flags: PageTableFlags,
) -> Result<(), MemoryError> {
    for addr in range.clone().step_by(PAGE_SIZE) {
        let page = Page::containing_address(VirtAddr::new(addr as u64));
        let mapped = frames.alloc_frame().and_then(|frame| {
            paging.map_page(frames, directory, frame, page, flags).inspect_err(|_| {
                let _ = frames.free_frame(frame);
            })
        });
        if let Err(err) = mapped {
            warn!("mapping {:#x} failed: {}", addr, err);
            unmap_and_free(paging, frames, directory, range.start..addr);
            return Err(err);
        }
    }
    Ok(())
}

fn unmap_and_free<M: PhysMemory, T: Mmu>(
    paging: &PageTableManager<M, T>,
    frames: &mut BitmapFrameAllocator,
    directory: PhysFrame,
    range: Range<usize>,
) {
    for addr in range.step_by(PAGE_SIZE) {
        let page = Page::containing_address(VirtAddr::new(addr as u64));
        if let Ok(frame) = paging.unmap_page(directory, page) {
            let _ = frames.free_frame(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constants::memory::FRAME_SIZE,
        memory::frame_allocator::{alloc_frame, dealloc_frame, FRAME_ALLOCATOR},
        testing::{frame_allocator, lock_globals, Arena, RecordingMmu},
    };

    const MEMORY: u64 = 4 * 1024 * 1024;

    fn boot(memory_size: u64) -> BootInfo {
        BootInfo {
            memory_size,
            kernel: PhysAddr::new(0x10_0000)..PhysAddr::new(0x11_0000),
        }
    }

    fn tear_down() {
        *KERNEL_PAGING.lock() = None;
        *FRAME_ALLOCATOR.lock() = None;
    }

    #[test]
    fn frames_past_the_window_are_never_handed_out() {
        let boot = boot(1 << 30);
        let mut bitmap = vec![0; BitmapFrameAllocator::bitmap_words(boot.memory_size)];
        let mut frames = kernel_frame_allocator(&boot, &mut bitmap).unwrap();
        assert_eq!((frames.total_frames() * FRAME_SIZE) as u64, PHYS_WINDOW_SIZE);

        let window = unsafe { OffsetPhysMemory::new(VirtAddr::new(KERNEL_VIRT_BASE)) };
        let mut highest = 0;
        for _ in 0..frames.total_frames() {
            let frame = frames.alloc_frame().unwrap();
            let virt = window.phys_to_virt(frame.start_address()) as usize;
            assert!(virt < KERNEL_HEAP_START, "frame {:?} aliases the heap", frame);
            highest = highest.max(frame.start_address().as_u64());
            frames.free_frame(frame).unwrap();
        }
        assert_eq!(highest, PHYS_WINDOW_SIZE - FRAME_SIZE as u64);
    }

    #[test]
    fn small_machines_keep_all_their_memory() {
        let boot = boot(MEMORY);
        let mut bitmap = vec![0; BitmapFrameAllocator::bitmap_words(MEMORY)];
        let frames = kernel_frame_allocator(&boot, &mut bitmap).unwrap();
        assert_eq!((frames.total_frames() * FRAME_SIZE) as u64, MEMORY);
    }

    #[test]
    fn bring_up_switches_to_kernel_directory_and_backs_the_heap() {
        let _globals = lock_globals();
        let arena = Arena::new(MEMORY as usize);
        let memory = unsafe { OffsetPhysMemory::new(VirtAddr::new(arena.start() as u64)) };
        let bitmap: &'static mut [u64] =
            vec![0; BitmapFrameAllocator::bitmap_words(MEMORY)].leak();
        bring_up(&boot(MEMORY), bitmap, memory, RecordingMmu::default()).unwrap();

        with_kernel_paging(|kernel| {
            assert_eq!(kernel.manager.mmu().loaded.get(), Some(kernel.directory));
            assert_eq!(kernel.manager.mmu().enable_calls.get(), 1);
            assert_eq!(kernel.manager.active_directory(), Some(kernel.directory));
            assert_eq!(
                kernel
                    .manager
                    .get_physical(kernel.directory, VirtAddr::new(KERNEL_VIRT_BASE + 0x20_1234))
                    .unwrap(),
                PhysAddr::new(0x20_1234)
            );
        });

        let flags = PageTableFlags::WRITABLE;
        let heap = KERNEL_HEAP_START..KERNEL_HEAP_START + 4 * PAGE_SIZE;
        let free = with_frame_allocator(|frames| frames.free_frames());
        KernelBacking.grow(heap.clone(), flags).unwrap();
        assert_eq!(with_frame_allocator(|frames| frames.free_frames()), free - 4);
        with_kernel_paging(|kernel| {
            let (_, entry_flags) = kernel
                .manager
                .mapping(kernel.directory, VirtAddr::new(KERNEL_HEAP_START as u64 + 0x3000))
                .unwrap();
            assert!(entry_flags.contains(PageTableFlags::WRITABLE));
        });

        KernelBacking.shrink(heap.clone());
        assert_eq!(with_frame_allocator(|frames| frames.free_frames()), free);

        let mut hoard = Vec::new();
        while with_frame_allocator(|frames| frames.free_frames()) > 2 {
            hoard.push(alloc_frame().unwrap());
        }
        assert_eq!(KernelBacking.grow(heap, flags), Err(MemoryError::OutOfMemory));
        assert_eq!(with_frame_allocator(|frames| frames.free_frames()), 2);
        let first = VirtAddr::new(KERNEL_HEAP_START as u64);
        with_kernel_paging(|kernel| {
            assert_eq!(
                kernel.manager.get_physical(kernel.directory, first),
                Err(MemoryError::Unmapped(first))
            );
        });
        for frame in hoard {
            dealloc_frame(frame).unwrap();
        }
        assert_eq!(with_frame_allocator(|frames| frames.free_frames()), free);

        tear_down();
    }

    #[test]
    fn fresh_mapping_is_all_or_nothing() {
        let arena = Arena::new(MEMORY as usize);
        let mut bitmap = Vec::new();
        let mut frames = frame_allocator(&mut bitmap, MEMORY);
        let paging = PageTableManager::new(arena.phys(), RecordingMmu::default(), VirtAddr::new(KERNEL_VIRT_BASE));
        let dir = paging.create_directory(&mut frames).unwrap();
        paging.ensure_table(&mut frames, dir, 0x380, false).unwrap();

        let free = frames.free_frames();
        let heap = 0xE000_0000usize;
        map_fresh(&paging, &mut frames, dir, heap..heap + 4 * PAGE_SIZE, PageTableFlags::WRITABLE).unwrap();
        assert_eq!(frames.free_frames(), free - 4);
        assert!(paging.get_physical(dir, VirtAddr::new(heap as u64 + 0x3123)).is_ok());

        unmap_and_free(&paging, &mut frames, dir, heap..heap + 4 * PAGE_SIZE);
        assert_eq!(frames.free_frames(), free);

        let mut hoard = Vec::new();
        while frames.free_frames() > 2 {
            hoard.push(frames.alloc_frame().unwrap());
        }
        assert_eq!(
            map_fresh(&paging, &mut frames, dir, heap..heap + 4 * PAGE_SIZE, PageTableFlags::WRITABLE),
            Err(MemoryError::OutOfMemory)
        );
        assert_eq!(frames.free_frames(), 2);
        let first = VirtAddr::new(heap as u64);
        assert_eq!(paging.get_physical(dir, first), Err(MemoryError::Unmapped(first)));
    }

    #[test]
    fn window_maps_physical_memory_into_kernel_half() {
        let arena = Arena::new(MEMORY as usize);
        let mut bitmap = Vec::new();
        let mut frames = frame_allocator(&mut bitmap, MEMORY);
        let paging = PageTableManager::new(arena.phys(), RecordingMmu::default(), VirtAddr::new(KERNEL_VIRT_BASE));
        let dir = paging.create_directory(&mut frames).unwrap();

        map_window(&paging, &mut frames, dir, 0x20_0000).unwrap();
        assert_eq!(
            paging.get_physical(dir, VirtAddr::new(KERNEL_VIRT_BASE + 0x1_2345)).unwrap(),
            PhysAddr::new(0x1_2345)
        );
        let past = VirtAddr::new(KERNEL_VIRT_BASE + 0x20_0000);
        assert_eq!(paging.get_physical(dir, past), Err(MemoryError::Unmapped(past)));
        assert!(paging.is_kernel_slot(PageIndices::of(past).unwrap().directory));
    }
}
