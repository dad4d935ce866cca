//! The `Logging` and `Replay` flavors of [`StateAccess`], and
//! `verify_log`, the host-facing replay verifier.
//!
//! Grounded in `examples/original_source/src/step-state-access.h`'s
//! `step_state_access`: every architectural touch — a register, `pc`,
//! `mcycle`, a CSR, `iflags` — lives at a canonical shadow-state address
//! (see [`crate::device::shadow`]) and is logged at full 8-byte word
//! granularity via a read-modify-write pair (`check_read_word`/
//! `check_write_word` there; `log_read`/`log_write` here), even when the
//! architectural access itself is narrower. `iflags.B` (`break_inner`) is the
//! one exception: the source keeps it in a separate `brkflag` word outside
//! the hashed `iflags` word; this crate treats it as an optimization
//! fence an implementation may omit from the observable state entirely —
//! this crate's `read_iflags` projection already excludes it, so neither
//! flavor here logs `set_break_inner`/`clear_break_inner`.
use crate::access::StateAccess;
use crate::device::shadow;
use crate::error::{CoreError, CoreResult};
use crate::hash::{keccak256, AddressSpace, Hash, MerkleProof};
use crate::machine::{IFlags, Machine};
use crate::mode::Mode;
use crate::primitives::constants::{LOG2_WORD_SIZE, SHADOW_BASE};
use crate::reg::csr::{CsrAddress, CsrFieldRange, CYCLE, INSTRET, MCYCLE, MINSTRET, MIP, TIME};
use crate::tlb::TlbClass;
use crate::trap::Trap;

/// Whether a logged access read or wrote its word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AccessType {
    Read,
    Write,
}

/// One transcript entry: `read_bytes` is the word's value
/// before the access in both cases; `written_bytes` is populated for writes.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Access {
    pub kind: AccessType,
    pub address: u64,
    pub log2_size: u32,
    pub read_bytes: [u8; 8],
    pub written_bytes: Option<[u8; 8]>,
    pub proof: Option<MerkleProof>,
}

/// A log's type descriptor.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct LogType {
    pub proofs: bool,
    pub annotations: bool,
}

/// The full transcript of one `step`.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct AccessLog {
    pub log_type: LogType,
    pub accesses: Vec<Access>,
}

fn word_hash(bytes: [u8; 8]) -> Hash {
    keccak256(&bytes)
}

/// Canonical shadow address of a CSR: the dedicated `mcycle`/`minstret`
/// words for their user-mode shadows (`cycle`/`instret`/`time`), else the
/// CSR's slot in the shadow CSR block.
fn csr_shadow_addr(addr: CsrAddress) -> u64 {
    match addr {
        MCYCLE | CYCLE | TIME => SHADOW_BASE + shadow::mcycle_offset(),
        MINSTRET | INSTRET => SHADOW_BASE + shadow::minstret_offset(),
        _ => SHADOW_BASE + shadow::csr_offset(addr).expect("every decodable CSR has a shadow slot"),
    }
}

/// Wraps a [`Machine`] and appends a transcript entry to every architectural
/// touch, exactly mirroring the source's `step_state_access`.
pub struct LoggingAccess<'m> {
    machine: &'m mut Machine,
    log_type: LogType,
    accesses: Vec<Access>,
}

impl<'m> LoggingAccess<'m> {
    pub fn new(machine: &'m mut Machine, log_type: LogType) -> Self {
        Self { machine, log_type, accesses: Vec::new() }
    }

    pub fn into_log(self) -> AccessLog {
        AccessLog { log_type: self.log_type, accesses: self.accesses }
    }

    fn proof_of(&self, addr: u64) -> Option<MerkleProof> {
        self.log_type.proofs.then(|| self.machine.proof(addr, LOG2_WORD_SIZE))
    }

    fn log_read(&mut self, addr: u64) -> u64 {
        let proof = self.proof_of(addr);
        let bytes = AddressSpace::peek_word(&*self.machine, addr);
        self.accesses.push(Access {
            kind: AccessType::Read,
            address: addr,
            log2_size: LOG2_WORD_SIZE,
            read_bytes: bytes,
            written_bytes: None,
            proof,
        });
        u64::from_le_bytes(bytes)
    }

    fn log_write(&mut self, addr: u64, mutate: impl FnOnce(&mut Machine)) {
        let proof = self.proof_of(addr);
        let before = AddressSpace::peek_word(&*self.machine, addr);
        mutate(self.machine);
        let after = AddressSpace::peek_word(&*self.machine, addr);
        self.accesses.push(Access {
            kind: AccessType::Write,
            address: addr,
            log2_size: LOG2_WORD_SIZE,
            read_bytes: before,
            written_bytes: Some(after),
            proof,
        });
    }

    /// Logs a physical access at its natural `size_log2`, rounding down to
    /// the containing 8-byte word: every Merkle leaf is a whole word, so a
    /// narrower access is recorded as a read (or read-modify-write) of the
    /// word it lives in, matching `do_read_memory_word`/`do_write_memory_word`
    /// in the source.
    fn log_physical_read(&mut self, paddr: u64, size_log2: u32) -> Result<u64, Trap> {
        let paligned = paddr & !7;
        let poffset = (paddr & 7) as u32;
        let word = self.log_read(paligned);
        let real = <Machine as StateAccess>::read_physical(self.machine, paddr, size_log2)?;
        debug_assert_eq!((word >> (8 * poffset)) & mask(size_log2), real & mask(size_log2));
        Ok(real)
    }

    fn log_physical_write(&mut self, paddr: u64, size_log2: u32, val: u64) -> Result<(), Trap> {
        let paligned = paddr & !7;
        let mut result = Ok(());
        self.log_write(paligned, |m| {
            result = <Machine as StateAccess>::write_physical(m, paddr, size_log2, val);
        });
        if result.is_err() {
            // The write never happened; drop the (now misleading) log entry.
            self.accesses.pop();
        }
        result
    }
}

fn mask(size_log2: u32) -> u64 {
    if size_log2 >= 6 {
        u64::MAX
    } else {
        (1u64 << (8 * (1u64 << size_log2))) - 1
    }
}

impl<'m> StateAccess for LoggingAccess<'m> {
    fn mode(&mut self) -> Mode {
        self.log_read(SHADOW_BASE + shadow::iflags_offset());
        self.machine.mode()
    }
    fn set_mode(&mut self, mode: Mode) {
        self.log_write(SHADOW_BASE + shadow::iflags_offset(), |m| m.set_mode(mode));
    }

    fn read_x(&mut self, i: u64) -> u64 {
        self.log_read(SHADOW_BASE + shadow::x_offset(i))
    }
    fn write_x(&mut self, i: u64, val: u64) {
        self.log_write(SHADOW_BASE + shadow::x_offset(i), |m| m.write_x(i, val));
    }

    fn read_pc(&mut self) -> u64 {
        self.log_read(SHADOW_BASE + shadow::pc_offset())
    }
    fn write_pc(&mut self, val: u64) {
        self.log_write(SHADOW_BASE + shadow::pc_offset(), |m| m.write_pc(val));
    }

    fn read_mcycle(&mut self) -> u64 {
        self.log_read(SHADOW_BASE + shadow::mcycle_offset())
    }
    fn write_mcycle(&mut self, val: u64) {
        self.log_write(SHADOW_BASE + shadow::mcycle_offset(), |m| m.write_mcycle(val));
    }

    fn read_minstret(&mut self) -> u64 {
        self.log_read(SHADOW_BASE + shadow::minstret_offset())
    }
    fn write_minstret(&mut self, val: u64) {
        self.log_write(SHADOW_BASE + shadow::minstret_offset(), |m| m.write_minstret(val));
    }

    fn read_ilrsc(&mut self) -> u64 {
        self.log_read(SHADOW_BASE + shadow::ilrsc_offset())
    }
    fn write_ilrsc(&mut self, val: u64) {
        self.log_write(SHADOW_BASE + shadow::ilrsc_offset(), |m| m.write_ilrsc(val));
    }

    fn iflags(&mut self) -> IFlags {
        self.machine.iflags()
    }
    fn set_halted(&mut self) {
        self.log_write(SHADOW_BASE + shadow::iflags_offset(), |m| m.set_halted());
    }
    fn set_yielded(&mut self) {
        self.log_write(SHADOW_BASE + shadow::iflags_offset(), |m| m.set_yielded());
    }
    fn clear_yielded(&mut self) {
        self.log_write(SHADOW_BASE + shadow::iflags_offset(), |m| m.clear_yielded());
    }
    fn set_idle(&mut self) {
        self.log_write(SHADOW_BASE + shadow::iflags_offset(), |m| m.set_idle());
    }
    fn clear_idle(&mut self) {
        self.log_write(SHADOW_BASE + shadow::iflags_offset(), |m| m.clear_idle());
    }
    fn set_break_inner(&mut self) {
        self.machine.set_break_inner();
    }
    fn clear_break_inner(&mut self) {
        self.machine.clear_break_inner();
    }

    fn read_csr(&mut self, addr: CsrAddress) -> u64 {
        self.log_read(csr_shadow_addr(addr));
        self.machine.read_csr(addr)
    }
    fn write_csr(&mut self, addr: CsrAddress, val: u64) {
        self.log_write(csr_shadow_addr(addr), |m| m.write_csr(addr, val));
    }
    fn write_mip_hw(&mut self, val: u64) {
        self.log_write(csr_shadow_addr(MIP), |m| m.write_mip_hw(val));
    }
    fn check_csr_access(&self, addr: CsrAddress, is_write: bool) -> Result<(), Trap> {
        self.machine.check_csr_access(addr, is_write)
    }
    fn read_csr_bits(&mut self, addr: CsrAddress, range: CsrFieldRange) -> u64 {
        self.log_read(csr_shadow_addr(addr));
        self.machine.read_csr_bits(addr, range)
    }
    fn write_csr_bits(&mut self, addr: CsrAddress, range: CsrFieldRange, val: u64) {
        self.log_write(csr_shadow_addr(addr), |m| m.write_csr_bits(addr, range, val));
    }

    fn flush_tlb_all(&mut self) {
        self.machine.flush_tlb_all();
    }
    fn flush_tlb_page(&mut self, vaddr: u64) {
        self.machine.flush_tlb_page(vaddr);
    }

    fn read_physical(&mut self, paddr: u64, size_log2: u32) -> Result<u64, Trap> {
        self.log_physical_read(paddr, size_log2)
    }
    fn write_physical(&mut self, paddr: u64, size_log2: u32, val: u64) -> Result<(), Trap> {
        self.log_physical_write(paddr, size_log2, val)
    }

    fn translate(&mut self, vaddr: u64, class: TlbClass) -> Result<u64, Trap> {
        crate::translate::translate(self, vaddr, class)
    }
}

/// Replays a transcript with no backing [`Machine`] at all. Every accessor consumes the next logged entry in
/// order, checks it against the address the generic executor asked for, and
/// (when proofs are present) rolls the running root hash up the sibling
/// path via [`MerkleProof::is_consistent`]/[`MerkleProof::bubble_up`] —
/// the Rust counterpart of `roll_hash_up_tree` in the source.
pub struct ReplayAccess<'a> {
    log_type: LogType,
    accesses: std::slice::Iter<'a, Access>,
    root_hash: Hash,
    /// `mode` cannot be recovered from nothing: the generic executors branch
    /// on it before any shadow-state access necessarily happens this step
    /// (e.g. `ECALL`'s cause code), so it is tracked locally from the
    /// `iflags` word's PRV bits as soon as any access touches that word,
    /// seeded at construction from the caller's known starting privilege.
    mode: Mode,
}

impl<'a> ReplayAccess<'a> {
    /// `root_hash_before` is the Merkle root the log is replayed against;
    /// `mode_before` is the privilege the step began in (not itself part of
    /// the logged transcript — see the `mode` field doc).
    pub fn new(log: &'a AccessLog, root_hash_before: Hash, mode_before: Mode) -> Self {
        Self { log_type: log.log_type, accesses: log.accesses.iter(), root_hash: root_hash_before, mode: mode_before }
    }

    pub fn root_hash(&self) -> Hash {
        self.root_hash
    }

    /// Fails if the log still has unconsumed entries.
    pub fn finish(&mut self) -> CoreResult<()> {
        if self.accesses.next().is_some() {
            return Err(CoreError::InvalidArgument("access log has unconsumed entries".into()));
        }
        Ok(())
    }

    fn next_access(&mut self, expect: AccessType, addr: u64) -> Access {
        let access = self
            .accesses
            .next()
            .unwrap_or_else(|| panic!("access log exhausted, expected {expect:?} at {addr:#x}"))
            .clone();
        assert_eq!(access.kind, expect, "access log type mismatch at {addr:#x}");
        assert_eq!(access.address, addr, "access log address mismatch");
        if self.log_type.proofs {
            let proof = access.proof.as_ref().expect("proofed log missing a proof entry");
            assert_eq!(proof.root_hash, self.root_hash, "proof root does not match rolling hash");
            assert_eq!(proof.target_hash, word_hash(access.read_bytes), "proof target does not match read_bytes");
            assert!(proof.is_consistent(), "inconsistent Merkle proof in access log");
            if let Some(written) = access.written_bytes {
                self.root_hash = proof.bubble_up(word_hash(written));
            }
        }
        access
    }

    fn replay_read(&mut self, addr: u64) -> u64 {
        let access = self.next_access(AccessType::Read, addr);
        u64::from_le_bytes(access.read_bytes)
    }

    fn replay_write(&mut self, addr: u64) -> [u8; 8] {
        let access = self.next_access(AccessType::Write, addr);
        access.written_bytes.expect("write access log entry missing written_bytes")
    }

    fn track_mode_from_iflags(&mut self, word: u64) {
        if let Some(m) = Mode::from_bits((word >> 3) & 0b11) {
            self.mode = m;
        }
    }
}

impl<'a> StateAccess for ReplayAccess<'a> {
    fn mode(&mut self) -> Mode {
        let word = self.replay_read(SHADOW_BASE + shadow::iflags_offset());
        self.track_mode_from_iflags(word);
        self.mode
    }
    fn set_mode(&mut self, mode: Mode) {
        let after = self.replay_write(SHADOW_BASE + shadow::iflags_offset());
        self.track_mode_from_iflags(u64::from_le_bytes(after));
        self.mode = mode;
    }

    fn read_x(&mut self, i: u64) -> u64 {
        self.replay_read(SHADOW_BASE + shadow::x_offset(i))
    }
    fn write_x(&mut self, i: u64, _val: u64) {
        self.replay_write(SHADOW_BASE + shadow::x_offset(i));
    }

    fn read_pc(&mut self) -> u64 {
        self.replay_read(SHADOW_BASE + shadow::pc_offset())
    }
    fn write_pc(&mut self, _val: u64) {
        self.replay_write(SHADOW_BASE + shadow::pc_offset());
    }

    fn read_mcycle(&mut self) -> u64 {
        self.replay_read(SHADOW_BASE + shadow::mcycle_offset())
    }
    fn write_mcycle(&mut self, _val: u64) {
        self.replay_write(SHADOW_BASE + shadow::mcycle_offset());
    }

    fn read_minstret(&mut self) -> u64 {
        self.replay_read(SHADOW_BASE + shadow::minstret_offset())
    }
    fn write_minstret(&mut self, _val: u64) {
        self.replay_write(SHADOW_BASE + shadow::minstret_offset());
    }

    fn read_ilrsc(&mut self) -> u64 {
        self.replay_read(SHADOW_BASE + shadow::ilrsc_offset())
    }
    fn write_ilrsc(&mut self, _val: u64) {
        self.replay_write(SHADOW_BASE + shadow::ilrsc_offset());
    }

    fn iflags(&mut self) -> IFlags {
        // Never consulted mid-instruction by the generic executors (only the
        // outer loop reads it, directly off `Machine`); no log entry to consume.
        IFlags::default()
    }
    fn set_halted(&mut self) {
        self.replay_write(SHADOW_BASE + shadow::iflags_offset());
    }
    fn set_yielded(&mut self) {
        self.replay_write(SHADOW_BASE + shadow::iflags_offset());
    }
    fn clear_yielded(&mut self) {
        self.replay_write(SHADOW_BASE + shadow::iflags_offset());
    }
    fn set_idle(&mut self) {
        self.replay_write(SHADOW_BASE + shadow::iflags_offset());
    }
    fn clear_idle(&mut self) {
        self.replay_write(SHADOW_BASE + shadow::iflags_offset());
    }
    fn set_break_inner(&mut self) {}
    fn clear_break_inner(&mut self) {}

    fn read_csr(&mut self, addr: CsrAddress) -> u64 {
        self.replay_read(csr_shadow_addr(addr))
    }
    fn write_csr(&mut self, addr: CsrAddress, _val: u64) {
        self.replay_write(csr_shadow_addr(addr));
    }
    fn write_mip_hw(&mut self, _val: u64) {
        self.replay_write(csr_shadow_addr(MIP));
    }
    fn check_csr_access(&self, addr: CsrAddress, is_write: bool) -> Result<(), Trap> {
        crate::reg::csr::bank::check_csr_access(addr, self.mode, is_write)
            .map_err(|_| Trap::exception(crate::trap::cause::ILLEGAL_INSTRUCTION, 0))
    }
    fn read_csr_bits(&mut self, addr: CsrAddress, _range: CsrFieldRange) -> u64 {
        self.replay_read(csr_shadow_addr(addr))
    }
    fn write_csr_bits(&mut self, addr: CsrAddress, _range: CsrFieldRange, _val: u64) {
        self.replay_write(csr_shadow_addr(addr));
    }

    fn flush_tlb_all(&mut self) {}
    fn flush_tlb_page(&mut self, _vaddr: u64) {}

    fn read_physical(&mut self, paddr: u64, size_log2: u32) -> Result<u64, Trap> {
        let paligned = paddr & !7;
        let poffset = (paddr & 7) as u32;
        let word = self.replay_read(paligned);
        Ok((word >> (8 * poffset)) & mask(size_log2))
    }
    fn write_physical(&mut self, paddr: u64, _size_log2: u32, _val: u64) -> Result<(), Trap> {
        let paligned = paddr & !7;
        self.replay_write(paligned);
        Ok(())
    }

    fn translate(&mut self, vaddr: u64, class: TlbClass) -> Result<u64, Trap> {
        crate::translate::translate(self, vaddr, class)
    }
}

/// Replays `log` against `pre_root` and checks the resulting root matches
/// `post_root`. `mode_before` is the privilege the logged step
/// started in — not itself part of the transcript (see [`ReplayAccess`]).
///
/// Drives the replay with [`crate::interp::step_inner`] — the exact same
/// function [`crate::interp::step`] runs against a [`LoggingAccess`] to
/// produce the transcript in the first place (timer poll, pending-interrupt
/// check, fetch/execute, `mcycle`/`minstret` bookkeeping) — rather than
/// reconstructing that access pattern by hand, so the two can never drift
/// out of sync.
pub fn verify_log(log: &AccessLog, pre_root: Hash, post_root: Hash, mode_before: Mode) -> CoreResult<()> {
    let mut replay = ReplayAccess::new(log, pre_root, mode_before);
    crate::interp::step_inner(&mut replay);
    replay.finish()?;
    if replay.root_hash() != post_root {
        return Err(CoreError::InvalidArgument("replayed root hash does not match post_root".into()));
    }
    Ok(())
}
