//! This module holds global constants employed by the emulator.

/// The number of general-purpose integer registers.
pub const NUM_REGISTERS: usize = 32;

/// One byte len
pub const BYTE: u8 = 8;
/// Half word len
pub const HALFWORD: u8 = 16;
/// Whole word len
pub const WORD: u8 = 32;
/// Doubleword len
pub const DOUBLEWORD: u8 = 64;

/// log2 of the page size used by the PMA table and the TLBs (4 KiB pages).
pub const PAGE_SHIFT: u32 = 12;
/// Page size in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
/// Mask of the bits within a page.
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Maximum number of PMA entries a machine may register.
pub const PMA_MAX: usize = 32;
/// Number of directly-mapped slots in each of the three TLBs.
pub const TLB_SIZE: usize = 256;
/// Sentinel `vaddr_page` marking an empty TLB slot.
pub const TLB_INVALID_PAGE: u64 = u64::MAX;

/// Divider between `mcycle` and the derived CLINT `mtime` register.
pub const RTC_FREQ_DIV: u64 = 100;

/// Reset program counter.
pub const RESET_PC: u64 = 0x1000;

/// Default RAM base address.
pub const RAM_BASE: u64 = 0x8000_0000;
/// Default ROM base address.
pub const ROM_BASE: u64 = 0x1000;
/// Default ROM length.
pub const ROM_LENGTH: u64 = 0x1_0000;
/// Default CLINT base address.
pub const CLINT_BASE: u64 = 0x0200_0000;
/// CLINT register range length.
pub const CLINT_LENGTH: u64 = 0x10000;
/// Default HTIF base address.
pub const HTIF_BASE: u64 = 0x4000_0000;
/// HTIF register range length.
pub const HTIF_LENGTH: u64 = 0x1000;
/// Default shadow-state base address.
pub const SHADOW_BASE: u64 = 0x4001_0000;
/// Shadow-state register range length.
pub const SHADOW_LENGTH: u64 = 0x1000;

/// Sentinel value of `ilrsc` meaning "no reservation".
pub const ILRSC_NONE: u64 = u64::MAX;

/// Total depth of the Merkle tree over the machine state, in powers of two:
/// `LOG2_ROOT_SIZE - LOG2_WORD_SIZE`.
pub const LOG2_ROOT_SIZE: u32 = 64;
/// log2 of the leaf (word) size in bytes.
pub const LOG2_WORD_SIZE: u32 = 3;
