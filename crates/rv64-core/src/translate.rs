//! Address translation, generic over [`crate::access::StateAccess`].
//!
//! [`crate::machine::Machine`] has its own inherent, TLB-accelerated
//! `translate`/`read_memory`/`write_memory`/`fetch` (the direct flavor's hot
//! path never goes through a trait call). This module supplies the same
//! algorithm expressed purely in terms of the trait, so
//! [`crate::access::log::LoggingAccess`] gets a translation path whose every PTE
//! fetch and A/D writeback is itself a logged physical access — exactly as
//! in the source, where `translate_virtual_address` is a template over
//! `STATE_ACCESS` and every PTE touch goes through `a.read_word`/`a.write_word`.
use crate::access::StateAccess;
use crate::mode::Mode;
use crate::primitives::constants::{PAGE_SHIFT, PAGE_SIZE};
use crate::reg::csr::{
    MSTATUS, MSTATUS_MPP, MSTATUS_MPRV, MSTATUS_MXR, MSTATUS_SUM, SATP, SATP_MODE_BARE,
    SATP_MODE_SV39, SATP_MODE_SV48,
};
use crate::tlb::TlbClass;
use crate::trap::{cause, Trap};

fn access_fault(class: TlbClass, vaddr: u64) -> Trap {
    let code = match class {
        TlbClass::Code => cause::INSTRUCTION_ACCESS_FAULT,
        TlbClass::Read => cause::LOAD_ACCESS_FAULT,
        TlbClass::Write => cause::STORE_AMO_ACCESS_FAULT,
    };
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

/// The effective privilege for a translation: `MPP` when
/// `MPRV` is set and the access is not a code fetch, else the current `PRV`.
pub fn effective_mode<A: StateAccess + ?Sized>(access: &mut A, class: TlbClass) -> Mode {
    if class != TlbClass::Code && access.read_csr_bits(MSTATUS, MSTATUS_MPRV) != 0 {
        Mode::from_bits(access.read_csr_bits(MSTATUS, MSTATUS_MPP)).unwrap_or_else(|| access.mode())
    } else {
        access.mode()
    }
}

/// Sv39/Sv48 page walk, generic over the state-access trait.
pub fn translate<A: StateAccess + ?Sized>(access: &mut A, vaddr: u64, class: TlbClass) -> Result<u64, Trap> {
    let effective = effective_mode(access, class);
    if effective == Mode::Machine {
        return Ok(vaddr);
    }

    let satp = access.read_csr(SATP);
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
        pte = access.read_physical(pte_addr, 3).map_err(|_| access_fault(class, vaddr))?;
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
            if u == 1 && access.read_csr_bits(MSTATUS, MSTATUS_SUM) == 0 {
                return Err(page_fault(class, vaddr));
            }
        }
        Mode::Machine => unreachable!("machine mode never walks page tables"),
    }

    let mxr = access.read_csr_bits(MSTATUS, MSTATUS_MXR) != 0;
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
        access.write_physical(pte_addr, 3, new_pte).map_err(|_| access_fault(class, vaddr))?;
    }

    let page_mask = (1u64 << (PAGE_SHIFT + 9 * (i as u32))) - 1;
    Ok((ppn_full << PAGE_SHIFT & !page_mask) | (vaddr & page_mask))
}

/// Default `read_memory`: translate then decompose into byte-granular
/// fallbacks when `vaddr` is not naturally aligned.
pub fn read_memory_default<A: StateAccess + ?Sized>(
    access: &mut A,
    vaddr: u64,
    size_log2: u32,
    class: TlbClass,
) -> Result<u64, Trap> {
    let size = 1u64 << size_log2;
    if vaddr % size == 0 {
        let paddr = access.translate(vaddr, class)?;
        return access.read_physical(paddr, size_log2);
    }
    let mut bytes = [0u8; 8];
    for i in 0..size {
        let paddr = access.translate(vaddr + i, class)?;
        bytes[i as usize] = access.read_physical(paddr, 0)? as u8;
    }
    let mut word = [0u8; 8];
    word[..size as usize].copy_from_slice(&bytes[..size as usize]);
    Ok(u64::from_le_bytes(word))
}

/// Default `write_memory`: probes every constituent byte's translation
/// before committing any write, so a fault never leaves a partial write
///.
pub fn write_memory_default<A: StateAccess + ?Sized>(
    access: &mut A,
    vaddr: u64,
    size_log2: u32,
    val: u64,
    class: TlbClass,
) -> Result<(), Trap> {
    let size = 1u64 << size_log2;
    if vaddr % size == 0 {
        let paddr = access.translate(vaddr, class)?;
        return access.write_physical(paddr, size_log2, val);
    }
    let mut paddrs = Vec::with_capacity(size as usize);
    for i in 0..size {
        paddrs.push(access.translate(vaddr + i, class)?);
    }
    for (i, paddr) in paddrs.into_iter().enumerate() {
        let byte = (val >> (8 * i)) & 0xff;
        access.write_physical(paddr, 0, byte)?;
    }
    Ok(())
}

/// Default `fetch`: 4-aligned instruction word at `pc` (no C extension).
pub fn fetch_default<A: StateAccess + ?Sized>(access: &mut A) -> Result<u32, Trap> {
    let pc = access.read_pc();
    if pc % 4 != 0 {
        return Err(misaligned_fault(TlbClass::Code, pc));
    }
    let word = access.read_memory(pc, 2, TlbClass::Code)?;
    Ok(word as u32)
}
