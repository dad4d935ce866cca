//! The machine state `S` and the `Direct` flavor of the
//! state-access trait: every accessor here touches the struct in place,
//! consulting the TLB before falling back to the PMA table.
use crate::config::MachineConfig;
use crate::device::{clint, htif, shadow, DeviceHost, PeekOutcome};
use crate::error::{CoreError, CoreResult};
use crate::hash::{root_hash, AddressSpace, Hash, MerkleProof};
use crate::mode::Mode;
use crate::pma::{DeviceId, PmaFlags, PmaKind, PmaTable};
use crate::primitives::constants::{
    ILRSC_NONE, NUM_REGISTERS, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, RESET_PC,
};
use crate::reg::csr::{
    bank::{check_csr_access, CsrBank},
    CsrAddress, CsrFieldRange, CYCLE, INSTRET, MCYCLE, MINSTRET, MSTATUS, MSTATUS_MPP,
    MSTATUS_MPRV, MSTATUS_MXR, MSTATUS_SUM, SATP, SATP_MODE_BARE, SATP_MODE_SV39, SATP_MODE_SV48,
    TIME,
};
use crate::reg::IntRegisters;
use crate::tlb::{TlbClass, TlbSet};
use crate::trap::{cause, Trap};

/// `iflags`: `H` halted, `Y` yielded-manual, `I` idle
/// (executed `WFI` with no enabled interrupt pending), `B`
/// break-from-inner-loop.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct IFlags {
    pub halted: bool,
    pub yielded: bool,
    pub idle: bool,
    pub break_inner: bool,
}

pub struct Machine {
    regs: IntRegisters,
    pc: u64,
    mcycle: u64,
    minstret: u64,
    csrs: CsrBank,
    mode: Mode,
    iflags: IFlags,
    ilrsc: u64,
    pmas: PmaTable,
    tlbs: TlbSet,
    htif_tohost: u64,
    htif_fromhost: u64,
    clint_mtimecmp: u64,
    console_out: Vec<u8>,
    console_getchar_pending: bool,
    htif_yield_manual: bool,
    htif_yield_automatic: bool,
}

fn access_fault(class: TlbClass, vaddr: u64) -> Trap {
    let code = match class {
        TlbClass::Code => cause::INSTRUCTION_ACCESS_FAULT,
        TlbClass::Read => cause::LOAD_ACCESS_FAULT,
        TlbClass::Write => cause::STORE_AMO_ACCESS_FAULT,
    };
    tracing::trace!(?class, vaddr, "PMA violation");
    Trap::exception(code, vaddr)
}

fn page_fault(class: TlbClass, vaddr: u64) -> Trap {
    let code = match class {
        TlbClass::Code => cause::INSTRUCTION_PAGE_FAULT,
        TlbClass::Read => cause::LOAD_PAGE_FAULT,
        TlbClass::Write => cause::STORE_AMO_PAGE_FAULT,
    };
    Trap::exception(code, vaddr)
}

fn misaligned_fault(class: TlbClass, vaddr: u64) -> Trap {
    let code = match class {
        TlbClass::Code => cause::INSTRUCTION_ADDRESS_MISALIGNED,
        TlbClass::Read => cause::LOAD_ADDRESS_MISALIGNED,
        TlbClass::Write => cause::STORE_AMO_ADDRESS_MISALIGNED,
    };
    Trap::exception(code, vaddr)
}

impl Machine {
    /// A zeroed machine with no PMAs registered, for unit tests that only
    /// need the register/CSR/trap surface.
    pub fn bare() -> Self {
        Self {
            regs: IntRegisters::new(),
            pc: RESET_PC,
            mcycle: 0,
            minstret: 0,
            csrs: CsrBank::new(),
            mode: Mode::Machine,
            iflags: IFlags::default(),
            ilrsc: ILRSC_NONE,
            pmas: PmaTable::new(),
            tlbs: TlbSet::new(),
            htif_tohost: 0,
            htif_fromhost: 0,
            clint_mtimecmp: 0,
            console_out: Vec::new(),
            console_getchar_pending: false,
            htif_yield_manual: false,
            htif_yield_automatic: false,
        }
    }

    /// Builds a machine from a configuration: RAM,
    /// ROM, flash drives, CLINT, HTIF, and shadow state PMAs are registered;
    /// `pc = initial_pc`, `PRV = M`, all TLBs empty, `ilrsc` = no reservation.
    pub fn new(config: &MachineConfig) -> CoreResult<Self> {
        let mut m = Self::bare();
        m.pc = config.initial_pc;
        m.htif_yield_manual = config.htif.yield_manual;
        m.htif_yield_automatic = config.htif.yield_automatic;

        m.pmas
            .add_memory(config.ram.start, config.ram.length, PmaFlags::ram())
            .map_err(CoreError::InvalidArgument)?;
        if let Some(image) = &config.ram.image {
            m.pmas.load_image(config.ram.start, image).map_err(CoreError::InvalidArgument)?;
        }

        m.pmas
            .add_memory(config.rom.start, config.rom.length, PmaFlags::rom())
            .map_err(CoreError::InvalidArgument)?;
        if let Some(image) = &config.rom.image {
            m.pmas.load_image(config.rom.start, image).map_err(CoreError::InvalidArgument)?;
        }

        for drive in &config.flash_drives {
            m.pmas
                .add_memory(drive.start, drive.length, PmaFlags::ram())
                .map_err(CoreError::InvalidArgument)?;
            if let Some(image) = &drive.image {
                m.pmas.load_image(drive.start, image).map_err(CoreError::InvalidArgument)?;
            }
        }

        m.pmas
            .add_device(config.clint.start, crate::primitives::constants::CLINT_LENGTH, DeviceId::Clint)
            .map_err(CoreError::InvalidArgument)?;
        m.pmas
            .add_device(config.htif.start, crate::primitives::constants::HTIF_LENGTH, DeviceId::Htif)
            .map_err(CoreError::InvalidArgument)?;
        m.pmas
            .add_device(config.shadow.start, crate::primitives::constants::SHADOW_LENGTH, DeviceId::Shadow)
            .map_err(CoreError::InvalidArgument)?;

        Ok(m)
    }

    // -- plain accessors (also the StateAccess Direct flavor's backing methods) --

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        if mode != self.mode {
            self.tlbs.flush_all();
        }
        self.mode = mode;
    }

    pub fn read_x(&self, i: u64) -> u64 {
        self.regs.read(i)
    }

    pub fn write_x(&mut self, i: u64, val: u64) {
        self.regs.write(i, val);
    }

    pub fn read_pc(&self) -> u64 {
        self.pc
    }

    pub fn write_pc(&mut self, val: u64) {
        self.pc = val;
    }

    pub fn read_mcycle(&self) -> u64 {
        self.mcycle
    }

    pub fn write_mcycle(&mut self, val: u64) {
        self.mcycle = val;
    }

    pub fn read_minstret(&self) -> u64 {
        self.minstret
    }

    pub fn write_minstret(&mut self, val: u64) {
        self.minstret = val;
    }

    pub fn read_ilrsc(&self) -> u64 {
        self.ilrsc
    }

    pub fn write_ilrsc(&mut self, val: u64) {
        self.ilrsc = val;
    }

    pub fn iflags(&self) -> IFlags {
        self.iflags
    }

    pub fn set_halted(&mut self) {
        self.iflags.halted = true;
    }

    pub fn set_yielded(&mut self) {
        self.iflags.yielded = true;
    }

    pub fn clear_yielded(&mut self) {
        self.iflags.yielded = false;
    }

    pub fn set_idle(&mut self) {
        self.iflags.idle = true;
    }

    pub fn clear_idle(&mut self) {
        self.iflags.idle = false;
    }

    pub fn set_break_inner(&mut self) {
        self.iflags.break_inner = true;
    }

    pub fn clear_break_inner(&mut self) {
        self.iflags.break_inner = false;
    }

    /// `mcycle`/`minstret` live in dedicated fields, not the CSR
    /// bank array, since the outer loop advances them every cycle
    /// without going through a CSR write; `cycle`/`instret`/`time` are their
    /// read-only user-mode shadows and must stay in lockstep.
    pub fn read_csr(&self, addr: CsrAddress) -> u64 {
        match addr {
            MCYCLE | CYCLE => self.mcycle,
            MINSTRET | INSTRET => self.minstret,
            TIME => crate::device::clint::mtime_of(self.mcycle),
            _ => self.csrs.read(addr),
        }
    }

    /// Raw CSR write, flushing TLBs if the write touches any of the fields
    /// the flush discipline names.
    pub fn write_csr(&mut self, addr: CsrAddress, val: u64) {
        match addr {
            // The outer loop unconditionally increments these
            // after every retired instruction, so a CSR write of `val` must
            // land one below it for the post-increment to read back `val`.
            MCYCLE => self.mcycle = val.wrapping_sub(1),
            MINSTRET => self.minstret = val.wrapping_sub(1),
            _ => {
                let needs_flush = addr == SATP
                    || (addr == crate::reg::csr::MSTATUS)
                    || (addr == crate::reg::csr::SSTATUS);
                self.csrs.write(addr, val);
                if needs_flush {
                    self.tlbs.flush_all();
                    tracing::trace!(csr = addr, "TLB flush on CSR write");
                }
            }
        }
    }

    /// Sets `mip` to exactly `val`, bypassing the guest-CSR-write mask
    /// (used by the CLINT driver's MSIP write and the outer loop's timer
    /// poll, never by an executor).
    pub fn write_mip_hw(&mut self, val: u64) {
        self.csrs.write_mip_hw(val);
    }

    pub fn check_csr_access(&self, addr: CsrAddress, is_write: bool) -> Result<(), Trap> {
        check_csr_access(addr, self.mode, is_write)
            .map_err(|_| Trap::exception(cause::ILLEGAL_INSTRUCTION, 0))
    }

    pub fn read_csr_bits(&self, addr: CsrAddress, range: CsrFieldRange) -> u64 {
        self.csrs.read_bits(addr, range)
    }

    pub fn write_csr_bits(&mut self, addr: CsrAddress, range: CsrFieldRange, val: u64) {
        self.csrs.write_bits(addr, range, val);
        if addr == crate::reg::csr::MSTATUS || addr == crate::reg::csr::SSTATUS {
            self.tlbs.flush_all();
        }
    }

    pub fn flush_tlb_all(&mut self) {
        self.tlbs.flush_all();
    }

    pub fn flush_tlb_page(&mut self, vaddr: u64) {
        self.tlbs.code.invalidate_page(vaddr);
        self.tlbs.read.invalidate_page(vaddr);
        self.tlbs.write.invalidate_page(vaddr);
    }

    pub fn pmas(&self) -> &PmaTable {
        &self.pmas
    }

    // -- address translation --

    fn effective_mode(&self, class: TlbClass) -> Mode {
        if class != TlbClass::Code && self.csrs.read_bits(MSTATUS, MSTATUS_MPRV) != 0 {
            Mode::from_bits(self.csrs.read_bits(MSTATUS, MSTATUS_MPP)).unwrap_or(self.mode)
        } else {
            self.mode
        }
    }

    /// Sv39/Sv48 page walk, generalized over `levels`. Returns
    /// the physical address on success.
    pub fn translate(&mut self, vaddr: u64, class: TlbClass) -> Result<u64, Trap> {
        let effective = self.effective_mode(class);
        if effective == Mode::Machine {
            return Ok(vaddr);
        }

        let satp = self.csrs.read(SATP);
        let satp_mode = satp >> 60;
        let levels: u32 = match satp_mode {
            SATP_MODE_BARE => return Ok(vaddr),
            SATP_MODE_SV39 => 3,
            SATP_MODE_SV48 => 4,
            _ => return Err(page_fault(class, vaddr)),
        };

        let va_bits = PAGE_SHIFT + 9 * levels;
        let sign_mask = 1u64 << (va_bits - 1);
        let upper_mask = !0u64 << (va_bits - 1);
        let upper = vaddr & upper_mask;
        let expected = if vaddr & sign_mask != 0 { upper_mask } else { 0 };
        if upper != expected {
            return Err(page_fault(class, vaddr));
        }

        let mut a = (satp & ((1u64 << 44) - 1)) * PAGE_SIZE;
        let mut i: i64 = levels as i64 - 1;
        let mut pte: u64;
        let mut pte_addr: u64;
        loop {
            let vpn = (vaddr >> (PAGE_SHIFT + 9 * (i as u32))) & 0x1ff;
            pte_addr = a + vpn * 8;
            let bytes = self.read_physical_word(pte_addr).ok_or_else(|| access_fault(class, vaddr))?;
            pte = u64::from_le_bytes(bytes);
            let v = pte & 1;
            let r = (pte >> 1) & 1;
            let w = (pte >> 2) & 1;
            let x = (pte >> 3) & 1;
            if v == 0 || (r == 0 && w == 1) {
                return Err(page_fault(class, vaddr));
            }
            if r == 1 || x == 1 {
                break;
            }
            i -= 1;
            if i < 0 {
                return Err(page_fault(class, vaddr));
            }
            let ppn = (pte >> 10) & ((1u64 << 44) - 1);
            a = ppn * PAGE_SIZE;
        }

        let u = (pte >> 4) & 1;
        match effective {
            Mode::User => {
                if u == 0 {
                    return Err(page_fault(class, vaddr));
                }
            }
            Mode::Supervisor => {
                if u == 1 && self.csrs.read_bits(MSTATUS, MSTATUS_SUM) == 0 {
                    return Err(page_fault(class, vaddr));
                }
            }
            Mode::Machine => unreachable!("machine mode never walks page tables"),
        }

        let mxr = self.csrs.read_bits(MSTATUS, MSTATUS_MXR) != 0;
        let r = (pte >> 1) & 1;
        let w = (pte >> 2) & 1;
        let x = (pte >> 3) & 1;
        let permitted = match class {
            TlbClass::Code => x == 1,
            TlbClass::Read => r == 1 || (mxr && x == 1),
            TlbClass::Write => w == 1,
        };
        if !permitted {
            return Err(page_fault(class, vaddr));
        }

        let ppn_full = (pte >> 10) & ((1u64 << 44) - 1);
        if i > 0 {
            let low_mask = (1u64 << (9 * i)) - 1;
            if ppn_full & low_mask != 0 {
                return Err(page_fault(class, vaddr));
            }
        }

        let a_bit = (pte >> 6) & 1;
        let d_bit = (pte >> 7) & 1;
        let need_d = class == TlbClass::Write;
        if a_bit == 0 || (need_d && d_bit == 0) {
            let mut new_pte = pte | (1 << 6);
            if need_d {
                new_pte |= 1 << 7;
            }
            self.write_physical_word(pte_addr, new_pte).map_err(|_| access_fault(class, vaddr))?;
        }

        let page_mask = (1u64 << (PAGE_SHIFT + 9 * (i as u32))) - 1;
        Ok((ppn_full << PAGE_SHIFT & !page_mask) | (vaddr & page_mask))
    }

    // -- raw physical access (bypasses the TLB; used by the page walk and device peeks) --

    fn read_physical_word(&self, paddr: u64) -> Option<[u8; 8]> {
        self.pmas.read_memory_word(paddr)
    }

    fn write_physical_word(&mut self, paddr: u64, val: u64) -> Result<(), String> {
        let bytes = val.to_le_bytes();
        self.pmas.write_memory_word(paddr, &bytes)?;
        self.tlbs.on_memory_write(paddr, 8);
        Ok(())
    }

    fn read_physical_at(&self, paddr: u64, size_log2: u32, pma_index: usize) -> Result<u64, Trap> {
        let entry = &self.pmas.entries()[pma_index];
        let size = 1u64 << size_log2;
        if !entry.contains_range(paddr, size) {
            return Err(access_fault(TlbClass::Read, paddr));
        }
        match &entry.kind {
            PmaKind::Memory(mem) => {
                if !entry.flags.r {
                    return Err(access_fault(TlbClass::Read, paddr));
                }
                let offset = (paddr - entry.start) as usize;
                let mut buf = [0u8; 8];
                buf[..size as usize].copy_from_slice(&mem.host_memory()[offset..offset + size as usize]);
                Ok(u64::from_le_bytes(buf))
            }
            PmaKind::Device(id) => {
                let offset = paddr - entry.start;
                self.device_read(*id, offset, size_log2).ok_or_else(|| access_fault(TlbClass::Read, paddr))
            }
            PmaKind::Empty => Err(access_fault(TlbClass::Read, paddr)),
        }
    }

    fn write_physical_at(&mut self, paddr: u64, size_log2: u32, val: u64, pma_index: usize) -> Result<(), Trap> {
        let size = 1u64 << size_log2;
        {
            let entry = &self.pmas.entries()[pma_index];
            if !entry.contains_range(paddr, size) || !entry.flags.w {
                return Err(access_fault(TlbClass::Write, paddr));
            }
        }
        let is_memory = matches!(self.pmas.entries()[pma_index].kind, PmaKind::Memory(_));
        if is_memory {
            let entry = &mut self.pmas.entries_mut()[pma_index];
            let PmaKind::Memory(mem) = &mut entry.kind else { unreachable!() };
            let offset = paddr - entry.start;
            mem.mark_dirty_page(offset);
            let off = offset as usize;
            mem.host_memory_mut()[off..off + size as usize].copy_from_slice(&val.to_le_bytes()[..size as usize]);
            self.tlbs.on_memory_write(paddr, size);
            Ok(())
        } else {
            let id = match self.pmas.entries()[pma_index].kind {
                PmaKind::Device(id) => id,
                _ => return Err(access_fault(TlbClass::Write, paddr)),
            };
            let offset = paddr - self.pmas.entries()[pma_index].start;
            if self.device_write(id, offset, val, size_log2) {
                Ok(())
            } else {
                Err(access_fault(TlbClass::Write, paddr))
            }
        }
    }

    fn maybe_insert_tlb(&mut self, class: TlbClass, vaddr: u64, paddr: u64, pma_index: usize) {
        let entry = &self.pmas.entries()[pma_index];
        let idempotent = match class {
            TlbClass::Write => entry.flags.iw,
            _ => entry.flags.ir,
        };
        if !matches!(entry.kind, PmaKind::Memory(_)) || !idempotent {
            return;
        }
        let vaddr_page = vaddr & !PAGE_MASK;
        let paddr_page = paddr & !PAGE_MASK;
        self.tlbs.by_class_mut(class).insert(vaddr_page, paddr_page, pma_index);
    }

    /// Aligned word read of `2^size_log2` bytes, consulting the TLB first.
    pub fn read_memory_aligned(&mut self, vaddr: u64, size_log2: u32, class: TlbClass) -> Result<u64, Trap> {
        if let Some((paddr, pma_index)) = self.tlbs.by_class(class).lookup(vaddr) {
            return self.read_physical_at(paddr, size_log2, pma_index);
        }
        let paddr = self.translate(vaddr, class)?;
        let pma_index = self.pmas.find_index(paddr).ok_or_else(|| access_fault(class, vaddr))?;
        self.maybe_insert_tlb(class, vaddr, paddr, pma_index);
        self.read_physical_at(paddr, size_log2, pma_index)
    }

    pub fn write_memory_aligned(&mut self, vaddr: u64, size_log2: u32, val: u64, class: TlbClass) -> Result<(), Trap> {
        if let Some((paddr, pma_index)) = self.tlbs.by_class(class).lookup(vaddr) {
            return self.write_physical_at(paddr, size_log2, val, pma_index);
        }
        let paddr = self.translate(vaddr, class)?;
        let pma_index = self.pmas.find_index(paddr).ok_or_else(|| access_fault(class, vaddr))?;
        self.maybe_insert_tlb(class, vaddr, paddr, pma_index);
        self.write_physical_at(paddr, size_log2, val, pma_index)
    }

    /// Full read, decomposing into byte-granular accesses when `vaddr` is not
    /// naturally aligned.
    pub fn read_memory(&mut self, vaddr: u64, size_log2: u32, class: TlbClass) -> Result<u64, Trap> {
        let size = 1u64 << size_log2;
        if vaddr % size == 0 {
            return self.read_memory_aligned(vaddr, size_log2, class);
        }
        let mut bytes = [0u8; 8];
        for i in 0..size {
            bytes[i as usize] = self.read_memory_aligned(vaddr + i, 0, class)? as u8;
        }
        let mut word = [0u8; 8];
        word[..size as usize].copy_from_slice(&bytes[..size as usize]);
        Ok(u64::from_le_bytes(word))
    }

    pub fn write_memory(&mut self, vaddr: u64, size_log2: u32, val: u64, class: TlbClass) -> Result<(), Trap> {
        let size = 1u64 << size_log2;
        if vaddr % size == 0 {
            return self.write_memory_aligned(vaddr, size_log2, val, class);
        }
        // Probe every constituent byte's translation before committing any write.
        let mut paddrs = Vec::with_capacity(size as usize);
        for i in 0..size {
            let addr = vaddr + i;
            let paddr = if let Some((p, _)) = self.tlbs.by_class(class).lookup(addr) {
                p
            } else {
                self.translate(addr, class)?
            };
            if self.pmas.find_index(paddr).is_none() {
                return Err(access_fault(class, vaddr));
            }
            paddrs.push(paddr);
        }
        for (i, paddr) in paddrs.into_iter().enumerate() {
            let byte = (val >> (8 * i)) & 0xff;
            let pma_index = self.pmas.find_index(paddr).ok_or_else(|| access_fault(class, vaddr))?;
            self.write_physical_at(paddr, 0, byte, pma_index)?;
        }
        Ok(())
    }

    /// Fetches the 32-bit instruction at `pc` (no C extension: `pc` must be
    /// 4-aligned).
    pub fn fetch(&mut self) -> Result<u32, Trap> {
        let pc = self.pc;
        if pc % 4 != 0 {
            return Err(misaligned_fault(TlbClass::Code, pc));
        }
        let word = self.read_memory_aligned(pc, 2, TlbClass::Code)?;
        Ok(word as u32)
    }

    // -- device dispatch --

    fn device_read(&self, id: DeviceId, offset: u64, size_log2: u32) -> Option<u64> {
        match id {
            DeviceId::Clint => clint::read(self, offset, size_log2),
            DeviceId::Htif => htif::read(self, offset, size_log2),
            DeviceId::Shadow => shadow::read(self, offset, size_log2),
        }
    }

    fn device_write(&mut self, id: DeviceId, offset: u64, val: u64, size_log2: u32) -> bool {
        match id {
            DeviceId::Clint => clint::write(self, offset, val, size_log2),
            DeviceId::Htif => htif::write(self, offset, val, size_log2),
            DeviceId::Shadow => false,
        }
    }

    fn device_peek(&self, id: DeviceId, page_index: u64) -> PeekOutcome {
        match id {
            DeviceId::Clint => clint::peek(self, page_index),
            DeviceId::Htif => htif::peek(self, page_index),
            DeviceId::Shadow => shadow::peek(self, page_index),
        }
    }

    pub fn console_output(&self) -> &[u8] {
        &self.console_out
    }

    pub fn console_getchar_pending(&self) -> bool {
        self.console_getchar_pending
    }

    // -- Merkle hashing --

    pub fn root_hash(&self) -> Hash {
        root_hash(self)
    }

    pub fn proof(&self, addr: u64, log2_size: u32) -> MerkleProof {
        MerkleProof::new(self, addr, log2_size)
    }

    // -- snapshot (spec.md §6 wire format) --

    /// Writes `self` to `dir` as a directory containing `config` (the
    /// configuration needed to reconstruct the PMA layout), `hash` (the root
    /// hash at the time of the snapshot, 32 raw bytes), `registers` (the
    /// register/CSR/mailbox state the shadow-state device projects rather
    /// than backs with real memory — see `DESIGN.md`), and one
    /// `<start-hex>-<length-hex>.bin` blob per memory PMA. Fails with
    /// `CoreError::Aborted` if `dir` already exists, matching the source's
    /// refusal to silently clobber an existing snapshot.
    pub fn save_snapshot(&self, config: &MachineConfig, dir: &std::path::Path) -> CoreResult<()> {
        if dir.exists() {
            return Err(CoreError::Aborted(format!("snapshot directory {} already exists", dir.display())));
        }
        std::fs::create_dir_all(dir).map_err(|e| CoreError::RuntimeError(e.to_string()))?;

        let config_json =
            serde_json::to_vec_pretty(config).map_err(|e| CoreError::RuntimeError(e.to_string()))?;
        std::fs::write(dir.join("config"), config_json).map_err(|e| CoreError::RuntimeError(e.to_string()))?;

        std::fs::write(dir.join("hash"), self.root_hash()).map_err(|e| CoreError::RuntimeError(e.to_string()))?;

        let state = SnapshotRegisters::capture(self);
        let state_json = serde_json::to_vec(&state).map_err(|e| CoreError::RuntimeError(e.to_string()))?;
        std::fs::write(dir.join("registers"), state_json).map_err(|e| CoreError::RuntimeError(e.to_string()))?;

        for entry in self.pmas.entries() {
            if let PmaKind::Memory(mem) = &entry.kind {
                let name = format!("{:x}-{:x}.bin", entry.start, entry.length);
                std::fs::write(dir.join(name), mem.host_memory())
                    .map_err(|e| CoreError::RuntimeError(e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Reconstructs a `Machine` from a directory written by `save_snapshot`.
    /// Rebuilds the PMA layout from `config`, then overwrites each memory
    /// PMA's backing bytes with its blob and restores the register/CSR/
    /// mailbox state from `registers`. Dirty-page bitmaps are not part of
    /// the wire format (they gate no observable behavior — `root_hash`
    /// always recomputes fully) and come back all-clear, matching a freshly
    /// constructed machine.
    pub fn load_snapshot(dir: &std::path::Path) -> CoreResult<Self> {
        let config_bytes = std::fs::read(dir.join("config")).map_err(|e| CoreError::RuntimeError(e.to_string()))?;
        let config: MachineConfig =
            serde_json::from_slice(&config_bytes).map_err(|e| CoreError::RuntimeError(e.to_string()))?;
        let mut m = Self::new(&config)?;

        for entry in m.pmas.entries_mut() {
            if let PmaKind::Memory(_) = &entry.kind {
                let name = format!("{:x}-{:x}.bin", entry.start, entry.length);
                let blob = std::fs::read(dir.join(&name)).map_err(|e| CoreError::RuntimeError(e.to_string()))?;
                let PmaKind::Memory(mem) = &mut entry.kind else { unreachable!() };
                if blob.len() as u64 != entry.length {
                    return Err(CoreError::RuntimeError(format!(
                        "snapshot blob {name} has length {:#x}, expected {:#x}",
                        blob.len(),
                        entry.length
                    )));
                }
                mem.host_memory_mut().copy_from_slice(&blob);
            }
        }

        let state_bytes = std::fs::read(dir.join("registers")).map_err(|e| CoreError::RuntimeError(e.to_string()))?;
        let state: SnapshotRegisters =
            serde_json::from_slice(&state_bytes).map_err(|e| CoreError::RuntimeError(e.to_string()))?;
        state.restore(&mut m);

        let expected_hash = std::fs::read(dir.join("hash")).map_err(|e| CoreError::RuntimeError(e.to_string()))?;
        if m.root_hash().as_slice() != expected_hash.as_slice() {
            return Err(CoreError::RuntimeError(
                "restored root hash does not match the snapshot's recorded hash".to_string(),
            ));
        }

        Ok(m)
    }
}

/// Everything in `S` that the shadow-state device computes on the fly rather
/// than backing with an addressable memory PMA — captured separately so
/// `save_snapshot`/`load_snapshot` can round-trip it.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct SnapshotRegisters {
    x: Vec<u64>,
    pc: u64,
    mcycle: u64,
    minstret: u64,
    ilrsc: u64,
    mode: u64,
    iflags: IFlags,
    csrs: Vec<u64>,
    htif_tohost: u64,
    htif_fromhost: u64,
    clint_mtimecmp: u64,
    console_out: Vec<u8>,
    console_getchar_pending: bool,
}

impl SnapshotRegisters {
    fn capture(m: &Machine) -> Self {
        Self {
            x: m.regs.raw().to_vec(),
            pc: m.pc,
            mcycle: m.mcycle,
            minstret: m.minstret,
            ilrsc: m.ilrsc,
            mode: m.mode.bits(),
            iflags: m.iflags,
            csrs: m.csrs.raw().to_vec(),
            htif_tohost: m.htif_tohost,
            htif_fromhost: m.htif_fromhost,
            clint_mtimecmp: m.clint_mtimecmp,
            console_out: m.console_out.clone(),
            console_getchar_pending: m.console_getchar_pending,
        }
    }

    fn restore(self, m: &mut Machine) {
        let mut x = [0u64; NUM_REGISTERS];
        x.copy_from_slice(&self.x);
        m.regs.load_raw(x);
        m.pc = self.pc;
        m.mcycle = self.mcycle;
        m.minstret = self.minstret;
        m.ilrsc = self.ilrsc;
        m.mode = Mode::from_bits(self.mode).unwrap_or(Mode::Machine);
        m.iflags = self.iflags;
        let mut csrs = [0u64; crate::reg::csr::CSR_SIZE];
        csrs.copy_from_slice(&self.csrs);
        m.csrs.load_raw(csrs);
        m.htif_tohost = self.htif_tohost;
        m.htif_fromhost = self.htif_fromhost;
        m.clint_mtimecmp = self.clint_mtimecmp;
        m.console_out = self.console_out;
        m.console_getchar_pending = self.console_getchar_pending;
        m.tlbs.flush_all();
    }
}

impl DeviceHost for Machine {
    fn read_mip(&self) -> u64 {
        self.csrs.read(crate::reg::csr::MIP)
    }
    fn set_mip(&mut self, bits: u64) {
        let v = self.csrs.read(crate::reg::csr::MIP) | bits;
        self.csrs.write_mip_hw(v);
    }
    fn reset_mip(&mut self, bits: u64) {
        let v = self.csrs.read(crate::reg::csr::MIP) & !bits;
        self.csrs.write_mip_hw(v);
    }
    fn read_mcycle(&self) -> u64 {
        self.mcycle
    }
    fn read_mtimecmp(&self) -> u64 {
        self.clint_mtimecmp
    }
    fn write_mtimecmp(&mut self, val: u64) {
        self.clint_mtimecmp = val;
    }
    fn read_htif_tohost(&self) -> u64 {
        self.htif_tohost
    }
    fn write_htif_tohost(&mut self, val: u64) {
        self.htif_tohost = val;
    }
    fn read_htif_fromhost(&self) -> u64 {
        self.htif_fromhost
    }
    fn write_htif_fromhost(&mut self, val: u64) {
        self.htif_fromhost = val;
    }
    fn console_putchar(&mut self, byte: u8) {
        self.console_out.push(byte);
    }
    fn request_console_getchar(&mut self) {
        self.console_getchar_pending = true;
    }
    fn halt(&mut self) {
        self.iflags.halted = true;
    }
    fn yield_manual_enabled(&self) -> bool {
        self.htif_yield_manual
    }
    fn yield_automatic_enabled(&self) -> bool {
        self.htif_yield_automatic
    }
    fn request_yield(&mut self) {
        self.set_yielded();
    }
}

impl shadow::ShadowSource for Machine {
    fn read_x(&self, i: usize) -> u64 {
        self.regs.read(i as u64)
    }
    fn read_pc(&self) -> u64 {
        self.pc
    }
    fn read_mcycle(&self) -> u64 {
        self.mcycle
    }
    fn read_minstret(&self) -> u64 {
        self.minstret
    }
    fn read_iflags(&self) -> u64 {
        (self.iflags.halted as u64)
            | ((self.iflags.yielded as u64) << 1)
            | ((self.iflags.idle as u64) << 2)
            | ((self.mode.bits()) << 3)
    }
    fn read_ilrsc(&self) -> u64 {
        self.ilrsc
    }
    fn read_csr(&self, addr: CsrAddress) -> u64 {
        self.csrs.read(addr)
    }
    fn read_htif_tohost(&self) -> u64 {
        self.htif_tohost
    }
    fn read_htif_fromhost(&self) -> u64 {
        self.htif_fromhost
    }
    fn read_clint_mtimecmp(&self) -> u64 {
        self.clint_mtimecmp
    }
    fn pma_istart(&self, index: usize) -> Option<u64> {
        self.pmas.entries().get(index).map(|e| e.istart())
    }
    fn pma_ilength(&self, index: usize) -> Option<u64> {
        self.pmas.entries().get(index).map(|e| e.ilength())
    }
}

impl AddressSpace for Machine {
    fn overlaps_any(&self, addr: u64, size: u64) -> bool {
        self.pmas.overlaps_any(addr, size)
    }

    fn peek_word(&self, addr: u64) -> [u8; 8] {
        let Some(entry) = self.pmas.find(addr) else { return [0u8; 8] };
        match &entry.kind {
            PmaKind::Memory(_) => self.pmas.read_memory_word(addr).unwrap_or([0u8; 8]),
            PmaKind::Device(id) => {
                let page_index = addr & !(PAGE_SIZE - 1);
                let offset = (addr - page_index) as usize;
                match self.device_peek(*id, page_index) {
                    PeekOutcome::Success(page) => {
                        let mut word = [0u8; 8];
                        word.copy_from_slice(&page[offset..offset + 8]);
                        word
                    }
                    PeekOutcome::Pristine | PeekOutcome::Invalid => [0u8; 8],
                }
            }
            PmaKind::Empty => [0u8; 8],
        }
    }
}

/// The `Direct` flavor: every method here is the existing
/// TLB-accelerated inherent implementation, called through UFCS so the
/// method-resolution priority inherent methods already enjoy doesn't matter.
impl crate::access::StateAccess for Machine {
    fn mode(&mut self) -> Mode {
        Machine::mode(self)
    }
    fn set_mode(&mut self, mode: Mode) {
        Machine::set_mode(self, mode)
    }

    fn read_x(&mut self, i: u64) -> u64 {
        Machine::read_x(self, i)
    }
    fn write_x(&mut self, i: u64, val: u64) {
        Machine::write_x(self, i, val)
    }

    fn read_pc(&mut self) -> u64 {
        Machine::read_pc(self)
    }
    fn write_pc(&mut self, val: u64) {
        Machine::write_pc(self, val)
    }

    fn read_mcycle(&mut self) -> u64 {
        Machine::read_mcycle(self)
    }
    fn write_mcycle(&mut self, val: u64) {
        Machine::write_mcycle(self, val)
    }

    fn read_minstret(&mut self) -> u64 {
        Machine::read_minstret(self)
    }
    fn write_minstret(&mut self, val: u64) {
        Machine::write_minstret(self, val)
    }

    fn read_ilrsc(&mut self) -> u64 {
        Machine::read_ilrsc(self)
    }
    fn write_ilrsc(&mut self, val: u64) {
        Machine::write_ilrsc(self, val)
    }

    fn iflags(&mut self) -> IFlags {
        Machine::iflags(self)
    }
    fn set_halted(&mut self) {
        Machine::set_halted(self)
    }
    fn set_yielded(&mut self) {
        Machine::set_yielded(self)
    }
    fn clear_yielded(&mut self) {
        Machine::clear_yielded(self)
    }
    fn set_idle(&mut self) {
        Machine::set_idle(self)
    }
    fn clear_idle(&mut self) {
        Machine::clear_idle(self)
    }
    fn set_break_inner(&mut self) {
        Machine::set_break_inner(self)
    }
    fn clear_break_inner(&mut self) {
        Machine::clear_break_inner(self)
    }

    fn read_csr(&mut self, addr: CsrAddress) -> u64 {
        Machine::read_csr(self, addr)
    }
    fn write_csr(&mut self, addr: CsrAddress, val: u64) {
        Machine::write_csr(self, addr, val)
    }
    fn write_mip_hw(&mut self, val: u64) {
        Machine::write_mip_hw(self, val)
    }
    fn check_csr_access(&self, addr: CsrAddress, is_write: bool) -> Result<(), Trap> {
        Machine::check_csr_access(self, addr, is_write)
    }
    fn read_csr_bits(&mut self, addr: CsrAddress, range: CsrFieldRange) -> u64 {
        Machine::read_csr_bits(self, addr, range)
    }
    fn write_csr_bits(&mut self, addr: CsrAddress, range: CsrFieldRange, val: u64) {
        Machine::write_csr_bits(self, addr, range, val)
    }

    fn flush_tlb_all(&mut self) {
        Machine::flush_tlb_all(self)
    }
    fn flush_tlb_page(&mut self, vaddr: u64) {
        Machine::flush_tlb_page(self, vaddr)
    }

    fn read_physical(&mut self, paddr: u64, size_log2: u32) -> Result<u64, Trap> {
        let pma_index = self.pmas.find_index(paddr).ok_or_else(|| access_fault(TlbClass::Read, paddr))?;
        self.read_physical_at(paddr, size_log2, pma_index)
    }
    fn write_physical(&mut self, paddr: u64, size_log2: u32, val: u64) -> Result<(), Trap> {
        let pma_index = self.pmas.find_index(paddr).ok_or_else(|| access_fault(TlbClass::Write, paddr))?;
        self.write_physical_at(paddr, size_log2, val, pma_index)
    }

    fn translate(&mut self, vaddr: u64, class: TlbClass) -> Result<u64, Trap> {
        Machine::translate(self, vaddr, class)
    }

    fn read_memory(&mut self, vaddr: u64, size_log2: u32, class: TlbClass) -> Result<u64, Trap> {
        Machine::read_memory(self, vaddr, size_log2, class)
    }
    fn write_memory(&mut self, vaddr: u64, size_log2: u32, val: u64, class: TlbClass) -> Result<(), Trap> {
        Machine::write_memory(self, vaddr, size_log2, val, class)
    }
    fn fetch(&mut self) -> Result<u32, Trap> {
        Machine::fetch(self)
    }
}

#[allow(dead_code)]
const fn _assert_register_count() {
    assert!(NUM_REGISTERS == 32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;

    fn small_machine() -> Machine {
        Machine::new(&MachineConfig::with_ram_length(0x4000)).unwrap()
    }

    #[test]
    fn bare_machine_resets_to_spec_defaults() {
        let m = Machine::bare();
        assert_eq!(m.read_pc(), RESET_PC);
        assert_eq!(m.mode(), Mode::Machine);
        assert_eq!(m.read_ilrsc(), ILRSC_NONE);
    }

    #[test]
    fn machine_mode_identity_maps() {
        let mut m = small_machine();
        let paddr = m.translate(0x8000_0000, TlbClass::Read).unwrap();
        assert_eq!(paddr, 0x8000_0000);
    }

    #[test]
    fn write_then_read_round_trips_through_ram() {
        let mut m = small_machine();
        m.write_memory_aligned(0x8000_0000, 3, 0x1122_3344_5566_7788, TlbClass::Write).unwrap();
        let val = m.read_memory_aligned(0x8000_0000, 3, TlbClass::Read).unwrap();
        assert_eq!(val, 0x1122_3344_5566_7788);
    }

    #[test]
    fn write_dirties_the_containing_page() {
        let mut m = small_machine();
        m.write_memory_aligned(0x8000_0008, 3, 42, TlbClass::Write).unwrap();
        let entry = m.pmas.find(0x8000_0000).unwrap();
        let PmaKind::Memory(mem) = &entry.kind else { unreachable!() };
        assert!(mem.is_page_dirty(8));
    }

    #[test]
    fn out_of_range_access_faults() {
        let mut m = small_machine();
        let err = m.read_memory_aligned(0xffff_ffff, 3, TlbClass::Read);
        assert!(err.is_err());
    }

    #[test]
    fn tlb_caches_ram_and_satp_write_flushes_it() {
        let mut m = small_machine();
        m.read_memory_aligned(0x8000_0000, 3, TlbClass::Read).unwrap();
        assert!(m.tlbs.read.lookup(0x8000_0000).is_some());
        m.write_csr(SATP, 0);
        assert!(m.tlbs.read.lookup(0x8000_0000).is_none());
    }

    #[test]
    fn mcycle_csr_write_lands_one_below_requested_value() {
        let mut m = small_machine();
        m.write_csr(MCYCLE, 100);
        assert_eq!(m.read_csr(MCYCLE), 99);
        assert_eq!(m.read_mcycle(), 99);
    }

    #[test]
    fn cycle_and_time_shadow_mcycle() {
        let mut m = small_machine();
        m.write_mcycle(1000);
        assert_eq!(m.read_csr(crate::reg::csr::CYCLE), 1000);
        assert_eq!(m.read_csr(TIME), 1000 / crate::primitives::constants::RTC_FREQ_DIV);
    }

    #[test]
    fn clint_msip_write_sets_mip_msip_bit() {
        let mut m = small_machine();
        m.write_memory_aligned(
            crate::primitives::constants::CLINT_BASE + clint::MSIP0,
            2,
            1,
            TlbClass::Write,
        )
        .unwrap();
        assert_ne!(m.read_csr(crate::reg::csr::MIP) & crate::reg::csr::MSIP_BIT, 0);
        m.write_memory_aligned(crate::primitives::constants::CLINT_BASE + clint::MSIP0, 2, 0, TlbClass::Write)
            .unwrap();
        assert_eq!(m.read_csr(crate::reg::csr::MIP) & crate::reg::csr::MSIP_BIT, 0);
    }

    #[test]
    fn clint_device_round_trips_through_memory_mapping() {
        let mut m = Machine::new(&MachineConfig::with_ram_length(0x1000)).unwrap();
        m.write_memory_aligned(
            crate::primitives::constants::CLINT_BASE + clint::MTIMECMP,
            3,
            123,
            TlbClass::Write,
        )
        .unwrap();
        let val = m
            .read_memory_aligned(crate::primitives::constants::CLINT_BASE + clint::MTIMECMP, 3, TlbClass::Read)
            .unwrap();
        assert_eq!(val, 123);
    }

    #[test]
    fn htif_yield_manual_parks_machine_only_when_configured() {
        let mut cfg = MachineConfig::with_ram_length(0x1000);
        let tohost = 2u64 << 56; // device=2 (yield), cmd=0 (manual)

        let mut m = Machine::new(&cfg).unwrap();
        m.write_memory_aligned(crate::primitives::constants::HTIF_BASE + htif::TOHOST, 3, tohost, TlbClass::Write)
            .unwrap();
        assert!(!m.iflags().yielded, "yield_manual defaults to disabled");

        cfg.htif.yield_manual = true;
        let mut m = Machine::new(&cfg).unwrap();
        m.write_memory_aligned(crate::primitives::constants::HTIF_BASE + htif::TOHOST, 3, tohost, TlbClass::Write)
            .unwrap();
        assert!(m.iflags().yielded);
    }

    fn temp_snapshot_dir(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("rv64-core-snapshot-test-{tag}-{}", std::process::id()))
    }

    #[test]
    fn snapshot_round_trips_root_hash() {
        let dir = temp_snapshot_dir("root-hash");
        let _ = std::fs::remove_dir_all(&dir);

        let cfg = MachineConfig::with_ram_length(0x4000);
        let mut m = Machine::new(&cfg).unwrap();
        m.write_x(5, 0xdead_beef);
        m.write_pc(0x1004);
        m.write_memory_aligned(0x8000_0010, 3, 0x1234_5678_9abc_def0, TlbClass::Write).unwrap();
        let before = m.root_hash();

        m.save_snapshot(&cfg, &dir).unwrap();
        let restored = Machine::load_snapshot(&dir).unwrap();

        assert_eq!(restored.root_hash(), before);
        assert_eq!(restored.read_x(5), 0xdead_beef);
        assert_eq!(restored.read_pc(), 0x1004);
        assert_eq!(restored.read_memory_aligned(0x8000_0010, 3, TlbClass::Read), Ok(0x1234_5678_9abc_def0));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn snapshot_refuses_to_clobber_existing_directory() {
        let dir = temp_snapshot_dir("clobber");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let cfg = MachineConfig::with_ram_length(0x1000);
        let m = Machine::new(&cfg).unwrap();
        let err = m.save_snapshot(&cfg, &dir);
        assert!(matches!(err, Err(CoreError::Aborted(_))));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
