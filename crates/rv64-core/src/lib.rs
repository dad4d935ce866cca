//! A deterministic RV64IMASU system emulator core: interpreter,
//! address translation, and a state-access abstraction with direct and
//! logging/replay flavors, usable as a replayable off-chain computation
//! engine.
//!
//! The module layout mirrors the reference emulator's: [`machine`] is the
//! architectural state and its direct accessor, [`pma`]/[`tlb`]/[`translate`]
//! the memory subsystem, [`device`] the peripheral drivers, [`decode`]/[`exec`]
//! the instruction set, [`trap`] exception/interrupt delivery, [`access`] the
//! state-access trait and its logging/replay flavors, and [`interp`]
//! the outer cycle loop that drives all of the above.

pub mod access;
pub mod config;
pub mod decode;
pub mod device;
pub mod error;
pub mod exec;
pub mod hash;
pub mod interp;
pub mod machine;
pub mod mode;
pub mod pma;
pub mod primitives;
pub mod reg;
pub mod tlb;
pub mod translate;
pub mod trap;

pub use access::{
    log::{verify_log, AccessLog, LogType},
    StateAccess,
};
pub use config::MachineConfig;
pub use error::{CoreError, CoreResult};
pub use hash::{Hash, MerkleProof};
pub use interp::{run, step, RunOutcome};
pub use machine::Machine;
