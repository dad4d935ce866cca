//! The machine configuration contract consumed by [`crate::machine::Machine::new`]
//!. Image and drive *paths* are a host concern (file loading is
//! explicitly out of scope); the core only accepts already-loaded image bytes,
//! so a host driver owns every `std::fs` call.
use serde::{Deserialize, Serialize};

use crate::primitives::constants::{
    CLINT_BASE, HTIF_BASE, RAM_BASE, RESET_PC, ROM_BASE, ROM_LENGTH, SHADOW_BASE,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RamConfig {
    #[serde(default = "default_ram_base")]
    pub start: u64,
    pub length: u64,
    #[serde(skip)]
    pub image: Option<Vec<u8>>,
}

fn default_ram_base() -> u64 {
    RAM_BASE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RomConfig {
    #[serde(default = "default_rom_base")]
    pub start: u64,
    #[serde(default = "default_rom_length")]
    pub length: u64,
    #[serde(skip)]
    pub image: Option<Vec<u8>>,
}

fn default_rom_base() -> u64 {
    ROM_BASE
}

fn default_rom_length() -> u64 {
    ROM_LENGTH
}

impl Default for RomConfig {
    fn default() -> Self {
        Self { start: ROM_BASE, length: ROM_LENGTH, image: None }
    }
}

/// One memory-mapped flash drive. `shared` only affects host mmap semantics
/// and has no bearing on core determinism.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashDriveConfig {
    pub start: u64,
    pub length: u64,
    pub shared: bool,
    #[serde(skip)]
    pub image: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClintConfig {
    #[serde(default = "default_clint_base")]
    pub start: u64,
}

fn default_clint_base() -> u64 {
    CLINT_BASE
}

impl Default for ClintConfig {
    fn default() -> Self {
        Self { start: CLINT_BASE }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HtifConfig {
    #[serde(default = "default_htif_base")]
    pub start: u64,
    #[serde(default)]
    pub console_getchar: bool,
    #[serde(default)]
    pub yield_manual: bool,
    #[serde(default)]
    pub yield_automatic: bool,
}

fn default_htif_base() -> u64 {
    HTIF_BASE
}

impl Default for HtifConfig {
    fn default() -> Self {
        Self { start: HTIF_BASE, console_getchar: false, yield_manual: false, yield_automatic: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowConfig {
    #[serde(default = "default_shadow_base")]
    pub start: u64,
}

fn default_shadow_base() -> u64 {
    SHADOW_BASE
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self { start: SHADOW_BASE }
    }
}

/// Advisory parallelism hint; never observable in outputs.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default)]
    pub update_merkle_tree: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub ram: RamConfig,
    #[serde(default)]
    pub rom: RomConfig,
    #[serde(default)]
    pub flash_drives: Vec<FlashDriveConfig>,
    #[serde(default)]
    pub clint: ClintConfig,
    #[serde(default)]
    pub htif: HtifConfig,
    #[serde(default)]
    pub shadow: ShadowConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default = "default_initial_pc")]
    pub initial_pc: u64,
}

fn default_initial_pc() -> u64 {
    RESET_PC
}

impl MachineConfig {
    pub fn with_ram_length(length: u64) -> Self {
        Self {
            ram: RamConfig { start: RAM_BASE, length, image: None },
            rom: RomConfig::default(),
            flash_drives: Vec::new(),
            clint: ClintConfig::default(),
            htif: HtifConfig::default(),
            shadow: ShadowConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            initial_pc: RESET_PC,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_canonical_addresses() {
        let cfg = MachineConfig::with_ram_length(0x1000);
        assert_eq!(cfg.rom.start, ROM_BASE);
        assert_eq!(cfg.clint.start, CLINT_BASE);
        assert_eq!(cfg.htif.start, HTIF_BASE);
        assert_eq!(cfg.initial_pc, RESET_PC);
    }

    #[test]
    fn round_trips_through_json_excluding_images() {
        let cfg = MachineConfig::with_ram_length(0x2000);
        let json = serde_json::to_string(&cfg).unwrap();
        let back: MachineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ram.length, 0x2000);
    }
}
