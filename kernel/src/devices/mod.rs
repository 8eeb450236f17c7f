//! Devices the memory core talks to directly.
//!
//! Only the COM1 serial port is needed: it carries log output and the
//! diagnostics printed before halting on heap corruption.

pub mod serial;
