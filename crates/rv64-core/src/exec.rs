//! Instruction executors: per-instruction semantics for RV64IMA +
//! Zicsr + the privileged subset, generic over
//! [`crate::access::StateAccess`] so the same code runs whether state is
//! touched directly or logged (mirrors the source's executors being
//! templates over `STATE_ACCESS` in `riscv_cpu.cpp`).
use crate::access::StateAccess;
use crate::decode::{
    decode, AluOp, AmoOp, AtomicWidth, BranchOp, CsrOp, CsrSrc, Instruction, LoadWidth, MulOp,
    StoreWidth,
};
use crate::mode::Mode;
use crate::primitives::constants::ILRSC_NONE;
use crate::reg::csr::{
    MSTATUS, MSTATUS_MIE, MSTATUS_MPIE, MSTATUS_MPP, MSTATUS_TVM, MSTATUS_TW, SEPC, SSTATUS,
    SSTATUS_SIE_MASK, XSTATUS_SIE, XSTATUS_SPIE, XSTATUS_SPP,
};
use crate::tlb::TlbClass;
use crate::trap::{cause, Trap};

fn misaligned_fetch(target: u64) -> Trap {
    Trap::exception(cause::INSTRUCTION_ADDRESS_MISALIGNED, target)
}

fn illegal() -> Trap {
    tracing::trace!("illegal instruction");
    Trap::exception(cause::ILLEGAL_INSTRUCTION, 0)
}

fn sext32(val: u32) -> u64 {
    val as i32 as i64 as u64
}

fn div_signed(a: i64, b: i64) -> i64 {
    if b == 0 {
        return -1;
    }
    if a == i64::MIN && b == -1 {
        return i64::MIN;
    }
    a.wrapping_div(b)
}

fn rem_signed(a: i64, b: i64) -> i64 {
    if b == 0 {
        return a;
    }
    if a == i64::MIN && b == -1 {
        return 0;
    }
    a.wrapping_rem(b)
}

fn div_unsigned(a: u64, b: u64) -> u64 {
    if b == 0 {
        u64::MAX
    } else {
        a / b
    }
}

fn rem_unsigned(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        a % b
    }
}

fn div_signed32(a: i32, b: i32) -> i32 {
    if b == 0 {
        return -1;
    }
    if a == i32::MIN && b == -1 {
        return i32::MIN;
    }
    a.wrapping_div(b)
}

fn rem_signed32(a: i32, b: i32) -> i32 {
    if b == 0 {
        return a;
    }
    if a == i32::MIN && b == -1 {
        return 0;
    }
    a.wrapping_rem(b)
}

fn div_unsigned32(a: u32, b: u32) -> u32 {
    if b == 0 {
        u32::MAX
    } else {
        a / b
    }
}

fn rem_unsigned32(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        a % b
    }
}

fn alu_op(op: AluOp, a: u64, b: u64) -> u64 {
    match op {
        AluOp::Add => a.wrapping_add(b),
        AluOp::Sub => a.wrapping_sub(b),
        AluOp::Sll => a.wrapping_shl((b & 0x3f) as u32),
        AluOp::Slt => ((a as i64) < (b as i64)) as u64,
        AluOp::Sltu => (a < b) as u64,
        AluOp::Xor => a ^ b,
        AluOp::Srl => a.wrapping_shr((b & 0x3f) as u32),
        AluOp::Sra => (a as i64).wrapping_shr((b & 0x3f) as u32) as u64,
        AluOp::Or => a | b,
        AluOp::And => a & b,
    }
}

fn alu_op_w(op: AluOp, a: u64, b: u64) -> u64 {
    let a32 = a as u32;
    let shamt = (b as u32) & 0x1f;
    let result: i32 = match op {
        AluOp::Add => a32.wrapping_add(b as u32) as i32,
        AluOp::Sub => a32.wrapping_sub(b as u32) as i32,
        AluOp::Sll => a32.wrapping_shl(shamt) as i32,
        AluOp::Srl => a32.wrapping_shr(shamt) as i32,
        AluOp::Sra => (a32 as i32).wrapping_shr(shamt),
        _ => unreachable!("AluW/AluImmW only ever carries add/sub/sll/srl/sra"),
    };
    sext32(result as u32)
}

fn mul_op(op: MulOp, a: u64, b: u64) -> u64 {
    match op {
        MulOp::Mul => a.wrapping_mul(b),
        MulOp::Mulh => (((a as i64 as i128) * (b as i64 as i128)) >> 64) as u64,
        MulOp::Mulhsu => (((a as i64 as i128) * (b as u128 as i128)) >> 64) as u64,
        MulOp::Mulhu => (((a as u128) * (b as u128)) >> 64) as u64,
        MulOp::Div => div_signed(a as i64, b as i64) as u64,
        MulOp::Divu => div_unsigned(a, b),
        MulOp::Rem => rem_signed(a as i64, b as i64) as u64,
        MulOp::Remu => rem_unsigned(a, b),
    }
}

fn mul_op_w(op: MulOp, a: u64, b: u64) -> u64 {
    let a32 = a as u32;
    let b32 = b as u32;
    let result: i32 = match op {
        MulOp::Mul => a32.wrapping_mul(b32) as i32,
        MulOp::Div => div_signed32(a32 as i32, b32 as i32),
        MulOp::Divu => div_unsigned32(a32, b32) as i32,
        MulOp::Rem => rem_signed32(a32 as i32, b32 as i32),
        MulOp::Remu => rem_unsigned32(a32, b32) as i32,
        _ => unreachable!("MulW never carries a mulh variant"),
    };
    sext32(result as u32)
}

fn amo_apply(op: AmoOp, old: u64, operand: u64, width: AtomicWidth) -> u64 {
    match width {
        AtomicWidth::W => {
            let old32 = old as u32;
            let operand32 = operand as u32;
            let result: i32 = match op {
                AmoOp::Swap => operand32 as i32,
                AmoOp::Add => old32.wrapping_add(operand32) as i32,
                AmoOp::Xor => (old32 ^ operand32) as i32,
                AmoOp::And => (old32 & operand32) as i32,
                AmoOp::Or => (old32 | operand32) as i32,
                AmoOp::Min => (old32 as i32).min(operand32 as i32),
                AmoOp::Max => (old32 as i32).max(operand32 as i32),
                AmoOp::Minu => old32.min(operand32) as i32,
                AmoOp::Maxu => old32.max(operand32) as i32,
            };
            sext32(result as u32)
        }
        AtomicWidth::D => match op {
            AmoOp::Swap => operand,
            AmoOp::Add => old.wrapping_add(operand),
            AmoOp::Xor => old ^ operand,
            AmoOp::And => old & operand,
            AmoOp::Or => old | operand,
            AmoOp::Min => ((old as i64).min(operand as i64)) as u64,
            AmoOp::Max => ((old as i64).max(operand as i64)) as u64,
            AmoOp::Minu => old.min(operand),
            AmoOp::Maxu => old.max(operand),
        },
    }
}

/// Executes one already-fetched instruction word at `pc`, advancing `pc` on
/// success. On
/// `Err`, no register, CSR, or memory side effect named by the faulting
/// instruction itself is visible (loads/stores probe before committing;
/// every other op either fully succeeds or is rejected before any write).
pub fn execute<A: StateAccess + ?Sized>(access: &mut A, pc: u64, insn: u32) -> Result<(), Trap> {
    let instruction = decode(insn)?;
    let mut next_pc = pc.wrapping_add(4);

    match instruction {
        Instruction::Lui { rd, imm } => {
            access.write_x(rd, imm as u64);
        }
        Instruction::Auipc { rd, imm } => {
            access.write_x(rd, pc.wrapping_add(imm as u64));
        }
        Instruction::Jal { rd, imm } => {
            let target = pc.wrapping_add(imm as u64);
            if target % 4 != 0 {
                return Err(misaligned_fetch(target));
            }
            access.write_x(rd, next_pc);
            next_pc = target;
        }
        Instruction::Jalr { rd, rs1, imm } => {
            let base = access.read_x(rs1);
            let target = base.wrapping_add(imm as u64) & !1u64;
            if target % 4 != 0 {
                return Err(misaligned_fetch(target));
            }
            access.write_x(rd, next_pc);
            next_pc = target;
        }
        Instruction::Branch { op, rs1, rs2, imm } => {
            let a = access.read_x(rs1);
            let b = access.read_x(rs2);
            let taken = match op {
                BranchOp::Eq => a == b,
                BranchOp::Ne => a != b,
                BranchOp::Lt => (a as i64) < (b as i64),
                BranchOp::Ge => (a as i64) >= (b as i64),
                BranchOp::Ltu => a < b,
                BranchOp::Geu => a >= b,
            };
            if taken {
                let target = pc.wrapping_add(imm as u64);
                if target % 4 != 0 {
                    return Err(misaligned_fetch(target));
                }
                next_pc = target;
            }
        }
        Instruction::Load { width, rd, rs1, imm } => {
            let vaddr = access.read_x(rs1).wrapping_add(imm as u64);
            let (size_log2, sign_extend) = match width {
                LoadWidth::B => (0, true),
                LoadWidth::H => (1, true),
                LoadWidth::W => (2, true),
                LoadWidth::D => (3, false),
                LoadWidth::Bu => (0, false),
                LoadWidth::Hu => (1, false),
                LoadWidth::Wu => (2, false),
            };
            let raw = access.read_memory(vaddr, size_log2, TlbClass::Read)?;
            let bits = 8u32 << size_log2;
            let val = if sign_extend && bits < 64 {
                let shift = 64 - bits;
                (((raw << shift) as i64) >> shift) as u64
            } else {
                raw
            };
            access.write_x(rd, val);
        }
        Instruction::Store { width, rs1, rs2, imm } => {
            let vaddr = access.read_x(rs1).wrapping_add(imm as u64);
            let val = access.read_x(rs2);
            let size_log2 = match width {
                StoreWidth::B => 0,
                StoreWidth::H => 1,
                StoreWidth::W => 2,
                StoreWidth::D => 3,
            };
            access.write_memory(vaddr, size_log2, val, TlbClass::Write)?;
        }
        Instruction::AluImm { op, rd, rs1, imm } => {
            let a = access.read_x(rs1);
            access.write_x(rd, alu_op(op, a, imm as u64));
        }
        Instruction::Alu { op, rd, rs1, rs2 } => {
            let a = access.read_x(rs1);
            let b = access.read_x(rs2);
            access.write_x(rd, alu_op(op, a, b));
        }
        Instruction::AluImmW { op, rd, rs1, imm } => {
            let a = access.read_x(rs1);
            access.write_x(rd, alu_op_w(op, a, imm as u64));
        }
        Instruction::AluW { op, rd, rs1, rs2 } => {
            let a = access.read_x(rs1);
            let b = access.read_x(rs2);
            access.write_x(rd, alu_op_w(op, a, b));
        }
        Instruction::Mul { op, rd, rs1, rs2 } => {
            let a = access.read_x(rs1);
            let b = access.read_x(rs2);
            access.write_x(rd, mul_op(op, a, b));
        }
        Instruction::MulW { op, rd, rs1, rs2 } => {
            let a = access.read_x(rs1);
            let b = access.read_x(rs2);
            access.write_x(rd, mul_op_w(op, a, b));
        }
        Instruction::Fence | Instruction::FenceI => {
            // Single-hart and coherent: no-op.
        }
        Instruction::Ecall => {
            let code = match access.mode() {
                Mode::User => cause::ECALL_FROM_U,
                Mode::Supervisor => cause::ECALL_FROM_S,
                Mode::Machine => cause::ECALL_FROM_M,
            };
            return Err(Trap::exception(code, 0));
        }
        Instruction::Ebreak => {
            return Err(Trap::exception(cause::BREAKPOINT, 0));
        }
        Instruction::Mret => {
            if access.mode() != Mode::Machine {
                return Err(illegal());
            }
            let mpie = access.read_csr_bits(MSTATUS, MSTATUS_MPIE);
            access.write_csr_bits(MSTATUS, MSTATUS_MIE, mpie);
            access.write_csr_bits(MSTATUS, MSTATUS_MPIE, 1);
            let mpp = access.read_csr_bits(MSTATUS, MSTATUS_MPP);
            access.write_csr_bits(MSTATUS, MSTATUS_MPP, Mode::User.bits());
            access.set_mode(Mode::from_bits(mpp).unwrap_or(Mode::User));
            access.write_ilrsc(ILRSC_NONE);
            next_pc = access.read_csr(crate::reg::csr::MEPC);
            access.set_break_inner();
        }
        Instruction::Sret => {
            let mode = access.mode();
            let tsr = access.read_csr_bits(MSTATUS, crate::reg::csr::MSTATUS_TSR);
            if mode == Mode::User || (mode == Mode::Supervisor && tsr != 0) {
                return Err(illegal());
            }
            let spie = access.read_csr_bits(SSTATUS, XSTATUS_SPIE);
            access.write_csr_bits(SSTATUS, XSTATUS_SIE, spie);
            access.write_csr_bits(SSTATUS, XSTATUS_SPIE, 1);
            let spp = access.read_csr_bits(SSTATUS, XSTATUS_SPP);
            access.write_csr_bits(SSTATUS, XSTATUS_SPP, Mode::User.bits());
            access.set_mode(Mode::from_bits(spp).unwrap_or(Mode::User));
            access.write_ilrsc(ILRSC_NONE);
            next_pc = access.read_csr(SEPC);
            access.set_break_inner();
        }
        Instruction::Wfi => {
            let mode = access.mode();
            let tw = access.read_csr_bits(MSTATUS, MSTATUS_TW);
            if mode == Mode::User || (mode == Mode::Supervisor && tw != 0) {
                return Err(illegal());
            }
            if crate::trap::pending_interrupt(access).is_none() {
                access.set_idle();
            }
            access.set_break_inner();
        }
        Instruction::SfenceVma { rs1, rs2: _rs2 } => {
            let mode = access.mode();
            let tvm = access.read_csr_bits(MSTATUS, MSTATUS_TVM);
            if mode == Mode::User || (mode == Mode::Supervisor && tvm != 0) {
                return Err(illegal());
            }
            if rs1 == 0 {
                access.flush_tlb_all();
            } else {
                let vaddr = access.read_x(rs1);
                access.flush_tlb_page(vaddr);
            }
            access.set_break_inner();
        }
        Instruction::Csr { op, rd, src, addr } => {
            // RS1 = x0 (or a zero immediate) suppresses the write for
            // CSRRS/CSRRC and their immediate forms, preserving read-only
            // semantics.
            let suppress_write = match (op, src) {
                (CsrOp::Rs | CsrOp::Rc, CsrSrc::Reg(0)) => true,
                (CsrOp::Rs | CsrOp::Rc, CsrSrc::Imm(0)) => true,
                _ => false,
            };
            access.check_csr_access(addr, !suppress_write)?;
            let old = access.read_csr(addr);
            let operand = match src {
                CsrSrc::Reg(r) => access.read_x(r),
                CsrSrc::Imm(i) => i,
            };
            if !suppress_write {
                let new = match op {
                    CsrOp::Rw => operand,
                    CsrOp::Rs => old | operand,
                    CsrOp::Rc => old & !operand,
                };
                access.write_csr(addr, new);
            }
            access.write_x(rd, old);
        }
        Instruction::Lr { width, rd, rs1, .. } => {
            let vaddr = access.read_x(rs1);
            let size_log2 = match width {
                AtomicWidth::W => 2,
                AtomicWidth::D => 3,
            };
            let raw = access.read_memory(vaddr, size_log2, TlbClass::Read)?;
            let val = if let AtomicWidth::W = width { sext32(raw as u32) } else { raw };
            access.write_ilrsc(vaddr);
            access.write_x(rd, val);
        }
        Instruction::Sc { width, rd, rs1, rs2, .. } => {
            let vaddr = access.read_x(rs1);
            if access.read_ilrsc() == vaddr {
                let val = access.read_x(rs2);
                let size_log2 = match width {
                    AtomicWidth::W => 2,
                    AtomicWidth::D => 3,
                };
                let store_val = if let AtomicWidth::W = width { val & 0xffff_ffff } else { val };
                access.write_memory(vaddr, size_log2, store_val, TlbClass::Write)?;
                access.write_ilrsc(ILRSC_NONE);
                access.write_x(rd, 0);
            } else {
                access.write_ilrsc(ILRSC_NONE);
                access.write_x(rd, 1);
            }
        }
        Instruction::Amo { op, width, rd, rs1, rs2, .. } => {
            let vaddr = access.read_x(rs1);
            let size_log2 = match width {
                AtomicWidth::W => 2,
                AtomicWidth::D => 3,
            };
            let raw = access.read_memory(vaddr, size_log2, TlbClass::Read)?;
            let old = if let AtomicWidth::W = width { sext32(raw as u32) } else { raw };
            let operand = access.read_x(rs2);
            let result = amo_apply(op, old, operand, width);
            let store_val = if let AtomicWidth::W = width { result & 0xffff_ffff } else { result };
            access.write_memory(vaddr, size_log2, store_val, TlbClass::Write)?;
            access.write_x(rd, old);
        }
    }

    access.write_pc(next_pc);
    Ok(())
}
