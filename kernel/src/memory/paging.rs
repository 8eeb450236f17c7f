//! Two-level address spaces: mapping, translation, cloning and teardown.
//!
//! Directory slots at or above the kernel base are shared by every address
//! space; their tables are linked into clones and never freed with one.
//! Below it, pages mapped with `USER_ACCESSIBLE` are private to their
//! directory: a clone gets its own copy of each one (no copy-on-write), and
//! tearing the directory down returns them to the frame allocator.

use x86_64::{
    structures::paging::{
        FrameAllocator, FrameDeallocator, Page, PageTableFlags, PhysFrame, Size4KiB,
    },
    PhysAddr, VirtAddr,
};

use crate::{
    constants::memory::{DIRECTORY_SPAN, ENTRY_COUNT},
    debug, trace, warn,
    memory::{
        address::PageIndices,
        error::MemoryError,
        page_table::{PageTable, PageTableEntry},
        phys::PhysMemory,
        tlb::Mmu,
    },
};

pub struct PageTableManager<M, T> {
    memory: M,
    mmu: T,
    /// First directory slot of the shared kernel half.
    kernel_slot: usize,
    active: Option<PhysFrame>,
    enabled: bool,
}

impl<M: PhysMemory, T: Mmu> PageTableManager<M, T> {
    /// `kernel_base` should sit on a 4 MiB boundary; the slot containing it is shared.
    pub fn new(memory: M, mmu: T, kernel_base: VirtAddr) -> Self {
        let kernel_slot = match u32::try_from(kernel_base.as_u64()) {
            Ok(base) => PageIndices::from_u32(base).directory,
            Err(_) => ENTRY_COUNT,
        };
        PageTableManager {
            memory,
            mmu,
            kernel_slot,
            active: None,
            enabled: false,
        }
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn mmu(&self) -> &T {
        &self.mmu
    }

    pub fn active_directory(&self) -> Option<PhysFrame> {
        self.active
    }

    pub fn is_kernel_slot(&self, index: usize) -> bool {
        index >= self.kernel_slot
    }

    /// Allocates an empty directory.
    pub fn create_directory(
        &self,
        frames: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<PhysFrame, MemoryError> {
        let frame = frames.allocate_frame().ok_or(MemoryError::OutOfMemory)?;
        self.memory.zero_frame(frame.start_address());
        Ok(frame)
    }

    /// Returns the table behind directory slot `index`, allocating and linking it if absent.
    pub fn ensure_table(
        &self,
        frames: &mut impl FrameAllocator<Size4KiB>,
        directory: PhysFrame,
        index: usize,
        user: bool,
    ) -> Result<PhysFrame, MemoryError> {
        let entry = self.read_entry(directory, index);
        if entry.is_large() {
            return Err(MemoryError::MappingConflict(
                PageIndices { directory: index, table: 0, offset: 0 }.to_u32() as u64,
            ));
        }
        if entry.is_present() {
            if user && !entry.flags().contains(PageTableFlags::USER_ACCESSIBLE) {
                let mut upgraded = entry;
                upgraded.set_flags(entry.flags() | PageTableFlags::USER_ACCESSIBLE);
                self.write_entry(directory, index, upgraded);
            }
            return Ok(entry.frame());
        }

        let table = frames.allocate_frame().ok_or(MemoryError::OutOfMemory)?;
        self.memory.zero_frame(table.start_address());
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        if user {
            flags |= PageTableFlags::USER_ACCESSIBLE;
        }
        self.write_entry(directory, index, PageTableEntry::new(table, flags));
        trace!("new page table {:#x} for slot {}", table.start_address().as_u64(), index);
        Ok(table)
    }

    /// Maps `page` to `frame` in `directory`.
    ///
    /// Replacing a present mapping invalidates the stale translation.
    pub fn map_page(
        &self,
        frames: &mut impl FrameAllocator<Size4KiB>,
        directory: PhysFrame,
        frame: PhysFrame,
        page: Page,
        flags: PageTableFlags,
    ) -> Result<(), MemoryError> {
        if !PageTableEntry::fits(frame) {
            return Err(MemoryError::OutOfRange(frame.start_address().as_u64()));
        }
        let indices = PageIndices::of(page.start_address())?;
        let user = flags.contains(PageTableFlags::USER_ACCESSIBLE);
        let table = self.ensure_table(frames, directory, indices.directory, user)?;

        let previous = self.read_entry(table, indices.table);
        self.write_entry(
            table,
            indices.table,
            PageTableEntry::new(frame, flags | PageTableFlags::PRESENT),
        );
        if previous.is_present() {
            self.mmu.flush(page.start_address());
        }
        Ok(())
    }

    /// Removes the mapping of `page` and returns the frame it pointed to.
    pub fn unmap_page(&self, directory: PhysFrame, page: Page) -> Result<PhysFrame, MemoryError> {
        let addr = page.start_address();
        let indices = PageIndices::of(addr).map_err(|_| MemoryError::Unmapped(addr))?;
        let entry = self.read_entry(directory, indices.directory);
        if !entry.is_present() {
            return Err(MemoryError::Unmapped(addr));
        }
        if entry.is_large() {
            return Err(MemoryError::MappingConflict(addr.as_u64()));
        }

        let table = entry.frame();
        let mapped = self.read_entry(table, indices.table);
        if !mapped.is_present() {
            return Err(MemoryError::Unmapped(addr));
        }
        self.write_entry(table, indices.table, PageTableEntry::unused());
        self.mmu.flush(addr);
        Ok(mapped.frame())
    }

    /// Physical address and effective flags behind `addr`.
    pub fn mapping(
        &self,
        directory: PhysFrame,
        addr: VirtAddr,
    ) -> Result<(PhysAddr, PageTableFlags), MemoryError> {
        let indices = PageIndices::of(addr).map_err(|_| MemoryError::Unmapped(addr))?;
        let entry = self.read_entry(directory, indices.directory);
        if !entry.is_present() {
            return Err(MemoryError::Unmapped(addr));
        }
        if entry.is_large() {
            let offset = addr.as_u64() & (DIRECTORY_SPAN - 1);
            return Ok((entry.large_addr() + offset, entry.flags()));
        }

        let mapped = self.read_entry(entry.frame(), indices.table);
        if !mapped.is_present() {
            return Err(MemoryError::Unmapped(addr));
        }
        Ok((mapped.addr() + indices.offset as u64, mapped.flags()))
    }

    pub fn get_physical(&self, directory: PhysFrame, addr: VirtAddr) -> Result<PhysAddr, MemoryError> {
        self.mapping(directory, addr).map(|(phys, _)| phys)
    }

    /// Copies the table at directory slot `index`.
    ///
    /// In the user half, private pages get fresh frames with identical
    /// contents; everything else is linked. On failure every frame taken so
    /// far is returned.
    pub fn clone_page_table<F>(
        &self,
        frames: &mut F,
        index: usize,
        original: PhysFrame,
    ) -> Result<PhysFrame, MemoryError>
    where
        F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        let copy = frames.allocate_frame().ok_or(MemoryError::OutOfMemory)?;
        self.memory.zero_frame(copy.start_address());
        let shared = self.is_kernel_slot(index);

        for i in 0..ENTRY_COUNT {
            let entry = self.read_entry(original, i);
            if !entry.is_present() {
                continue;
            }
            if shared || !is_private(entry) {
                self.write_entry(copy, i, entry);
                continue;
            }

            let Some(duplicate) = frames.allocate_frame() else {
                warn!("out of frames cloning table slot {}, rolling back", index);
                self.release_private_pages(frames, copy);
                unsafe { frames.deallocate_frame(copy) };
                return Err(MemoryError::OutOfMemory);
            };
            self.memory.copy_frame(entry.addr(), duplicate.start_address());
            self.write_entry(copy, i, PageTableEntry::new(duplicate, entry.flags()));
        }

        Ok(copy)
    }

    /// Deep-copies an address space for process duplication.
    pub fn clone_page_directory<F>(
        &self,
        frames: &mut F,
        original: PhysFrame,
    ) -> Result<PhysFrame, MemoryError>
    where
        F: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
    {
        let copy = self.create_directory(frames)?;

        for i in 0..ENTRY_COUNT {
            let entry = self.read_entry(original, i);
            if !entry.is_present() {
                continue;
            }
            if entry.is_large() || self.is_kernel_slot(i) {
                self.write_entry(copy, i, entry);
                continue;
            }
            if self.table_is_empty(entry.frame()) {
                continue;
            }

            match self.clone_page_table(frames, i, entry.frame()) {
                Ok(table) => self.write_entry(copy, i, PageTableEntry::new(table, entry.flags())),
                Err(err) => {
                    self.free_page_directory(frames, copy);
                    return Err(err);
                }
            }
        }

        debug!(
            "cloned directory {:#x} into {:#x}",
            original.start_address().as_u64(),
            copy.start_address().as_u64()
        );
        Ok(copy)
    }

    /// Tears down a process address space: private pages, user-half tables and
    /// the directory itself. Shared kernel tables are left alone.
    ///
    /// Must not be called on the directory that is currently loaded.
    pub fn free_page_directory(
        &self,
        frames: &mut impl FrameDeallocator<Size4KiB>,
        directory: PhysFrame,
    ) {
        debug_assert_ne!(self.active, Some(directory));
        self.release_user_slots(frames, directory);
        unsafe { frames.deallocate_frame(directory) };
    }

    /// Drops every user-half mapping of `directory` but keeps the directory
    /// and the kernel half, as needed when a process image is replaced.
    pub fn release_user_pages(
        &self,
        frames: &mut impl FrameDeallocator<Size4KiB>,
        directory: PhysFrame,
    ) {
        self.release_user_slots(frames, directory);
        if self.active == Some(directory) {
            self.mmu.flush_all();
        }
    }

    /// Makes `directory` the active address space.
    ///
    /// # Safety
    /// `directory` must map the running kernel, its stack and the physical
    /// memory window. Not reentrant.
    pub unsafe fn load_directory(&mut self, directory: PhysFrame) {
        self.mmu.load_directory(directory);
        self.active = Some(directory);
        debug!("loaded page directory {:#x}", directory.start_address().as_u64());
    }

    /// Turns paging on. Later calls only log.
    ///
    /// # Safety
    /// A directory must have been loaded with [`load_directory`](Self::load_directory).
    pub unsafe fn enable(&mut self) {
        if self.enabled {
            warn!("paging already enabled");
            return;
        }
        self.mmu.enable_paging();
        self.enabled = true;
    }

    fn release_user_slots(&self, frames: &mut impl FrameDeallocator<Size4KiB>, directory: PhysFrame) {
        for i in 0..self.kernel_slot.min(ENTRY_COUNT) {
            let entry = self.read_entry(directory, i);
            if !entry.is_present() || entry.is_large() {
                continue;
            }
            self.release_private_pages(frames, entry.frame());
            unsafe { frames.deallocate_frame(entry.frame()) };
            self.write_entry(directory, i, PageTableEntry::unused());
        }
    }

    fn release_private_pages(&self, frames: &mut impl FrameDeallocator<Size4KiB>, table: PhysFrame) {
        for i in 0..ENTRY_COUNT {
            let entry = self.read_entry(table, i);
            if entry.is_present() && is_private(entry) {
                unsafe { frames.deallocate_frame(entry.frame()) };
                self.write_entry(table, i, PageTableEntry::unused());
            }
        }
    }

    fn table(&self, frame: PhysFrame) -> *mut PageTable {
        self.memory.phys_to_virt(frame.start_address()).cast()
    }

    fn read_entry(&self, table: PhysFrame, index: usize) -> PageTableEntry {
        // SAFETY: `PhysMemory` guarantees the frame is accessible; tables are
        // only reached through frames this manager linked or was handed.
        unsafe { (&*self.table(table))[index] }
    }

    fn write_entry(&self, table: PhysFrame, index: usize, entry: PageTableEntry) {
        unsafe { (&mut *self.table(table))[index] = entry };
    }

    fn table_is_empty(&self, table: PhysFrame) -> bool {
        unsafe { (&*self.table(table)).is_empty() }
    }
}

fn is_private(entry: PageTableEntry) -> bool {
    entry.flags().contains(PageTableFlags::USER_ACCESSIBLE)
}
