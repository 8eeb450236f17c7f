//! Memory-management core for a small single-core kernel.
//!
//! Physical frames are tracked by a bitmap allocator, address spaces are
//! two-level page directories, and dynamic memory comes from a boundary-tagged
//! heap whose free blocks are kept in a size-ordered index.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(feature = "strict", deny(warnings))]

pub mod constants;
pub mod devices;
pub mod interrupts;
pub mod logging;
pub mod memory;

#[cfg(test)]
pub(crate) mod testing;

pub use devices::serial;

pub mod prelude {
    pub use crate::serial_print;
    pub use crate::serial_println;
}
