//! Device drivers: pure function tables operating on an abstract
//! state-accessor, mirroring the source's `pma_device_driver` (read/write/peek
//! callbacks taking `i_device_state_access *`). Rust re-expresses the
//! abstract accessor as the [`DeviceHost`] trait, implemented by
//! [`crate::machine::Machine`].
use crate::primitives::constants::PAGE_SIZE;

pub mod clint;
pub mod htif;
pub mod shadow;

/// The slice of machine state a device driver may touch, carried through the
/// state-access trait for the duration of one call only.
pub trait DeviceHost {
    fn read_mip(&self) -> u64;
    fn set_mip(&mut self, bits: u64);
    fn reset_mip(&mut self, bits: u64);
    fn read_mcycle(&self) -> u64;
    fn read_mtimecmp(&self) -> u64;
    fn write_mtimecmp(&mut self, val: u64);
    fn read_htif_tohost(&self) -> u64;
    fn write_htif_tohost(&mut self, val: u64);
    fn read_htif_fromhost(&self) -> u64;
    fn write_htif_fromhost(&mut self, val: u64);
    /// Emits one byte to the host console (HTIF device 1, cmd 1).
    fn console_putchar(&mut self, byte: u8);
    /// Records that the guest asked for a console-read interrupt (HTIF device 1, cmd 0).
    fn request_console_getchar(&mut self);
    /// Halts the machine (HTIF device 0, cmd 0, payload bit 0 set).
    fn halt(&mut self);
    /// Whether `config.htif.yield_manual` allows HTIF device 2, cmd 0
    /// (yield-manual) requests to actually park the machine.
    fn yield_manual_enabled(&self) -> bool;
    /// Whether `config.htif.yield_automatic` allows HTIF device 2, cmd 1
    /// (yield-automatic) requests to actually park the machine.
    fn yield_automatic_enabled(&self) -> bool;
    /// Sets `iflags.Y`, parking the machine until the host resumes it
    /// (HTIF device 2; reported to the host as `YIELDED`).
    fn request_yield(&mut self);
}

/// Result of a side-effect-free `peek` of one page, used by the Merkle walk.
pub enum PeekOutcome {
    Success(Vec<u8>),
    Pristine,
    Invalid,
}

pub(crate) fn zero_page() -> Vec<u8> {
    vec![0u8; PAGE_SIZE as usize]
}
