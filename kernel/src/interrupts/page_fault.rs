//! Decoding of page-fault events.
//!
//! What to do about a fault (grow a stack, kill the task, panic) is up to the
//! handler; this only turns the raw error code and faulting address into
//! something it can match on and print.

use core::fmt;

use x86_64::{
    structures::{idt::PageFaultErrorCode, paging::PhysFrame},
    VirtAddr,
};

use crate::memory::{paging::PageTableManager, phys::PhysMemory, tlb::Mmu};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// No translation exists for the address.
    NotMapped,
    /// A translation exists but forbids the attempted access.
    AccessViolation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub address: VirtAddr,
    pub flags: PageFaultErrorCode,
}

impl PageFault {
    /// `error_code` is the value the CPU pushed; unknown bits are dropped.
    pub fn new(address: VirtAddr, error_code: u64) -> Self {
        PageFault {
            address,
            flags: PageFaultErrorCode::from_bits_truncate(error_code),
        }
    }

    pub fn is_protection_violation(&self) -> bool {
        self.flags.contains(PageFaultErrorCode::PROTECTION_VIOLATION)
    }

    pub fn is_write(&self) -> bool {
        self.flags.contains(PageFaultErrorCode::CAUSED_BY_WRITE)
    }

    pub fn from_user(&self) -> bool {
        self.flags.contains(PageFaultErrorCode::USER_MODE)
    }

    pub fn is_reserved_bit(&self) -> bool {
        self.flags.contains(PageFaultErrorCode::MALFORMED_TABLE)
    }

    pub fn is_instruction_fetch(&self) -> bool {
        self.flags.contains(PageFaultErrorCode::INSTRUCTION_FETCH)
    }

    /// Looks the faulting address up in `directory`.
    ///
    /// The walk decides, not the error code: by the time a handler runs
    /// another path may already have mapped the page.
    pub fn classify<M: PhysMemory, T: Mmu>(
        &self,
        paging: &PageTableManager<M, T>,
        directory: PhysFrame,
    ) -> FaultKind {
        match paging.mapping(directory, self.address) {
            Ok(_) => FaultKind::AccessViolation,
            Err(_) => FaultKind::NotMapped,
        }
    }
}

impl fmt::Display for PageFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Page Fault\nAttributes: {}, {}, {}{}{}\nFault address: {:#x}",
            if self.is_protection_violation() {
                "protection violation"
            } else {
                "non-present"
            },
            if self.is_write() {
                "write access"
            } else {
                "read access"
            },
            if self.from_user() {
                "user mode"
            } else {
                "kernel mode"
            },
            if self.is_reserved_bit() {
                ", reserved entries"
            } else {
                ""
            },
            if self.is_instruction_fetch() {
                ", instruction fetch"
            } else {
                ""
            },
            self.address.as_u64()
        )
    }
}
