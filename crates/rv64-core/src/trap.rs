//! Trap delivery and interrupt priority: RISC-V cause codes,
//! `medeleg`/`mideleg`-based delegation, and the delivery sequence common to
//! every exception and interrupt.
use crate::access::StateAccess;
use crate::mode::Mode;
use crate::reg::csr::{
    MCAUSE, MEDELEG, MEPC, MIDELEG, MIE, MIP, MSTATUS, MSTATUS_MIE, MSTATUS_MPIE, MSTATUS_MPP,
    MTVAL, MTVEC, SCAUSE, SEPC, SSTATUS, STVAL, STVEC, XSTATUS_SIE, XSTATUS_SPIE, XSTATUS_SPP,
};

pub mod cause {
    pub const INSTRUCTION_ADDRESS_MISALIGNED: u64 = 0;
    pub const INSTRUCTION_ACCESS_FAULT: u64 = 1;
    pub const ILLEGAL_INSTRUCTION: u64 = 2;
    pub const BREAKPOINT: u64 = 3;
    pub const LOAD_ADDRESS_MISALIGNED: u64 = 4;
    pub const LOAD_ACCESS_FAULT: u64 = 5;
    pub const STORE_AMO_ADDRESS_MISALIGNED: u64 = 6;
    pub const STORE_AMO_ACCESS_FAULT: u64 = 7;
    pub const ECALL_FROM_U: u64 = 8;
    pub const ECALL_FROM_S: u64 = 9;
    pub const ECALL_FROM_M: u64 = 11;
    pub const INSTRUCTION_PAGE_FAULT: u64 = 12;
    pub const LOAD_PAGE_FAULT: u64 = 13;
    pub const STORE_AMO_PAGE_FAULT: u64 = 15;

    pub const SUPERVISOR_SOFTWARE_INTERRUPT: u64 = 1;
    pub const MACHINE_SOFTWARE_INTERRUPT: u64 = 3;
    pub const SUPERVISOR_TIMER_INTERRUPT: u64 = 5;
    pub const MACHINE_TIMER_INTERRUPT: u64 = 7;
    pub const SUPERVISOR_EXTERNAL_INTERRUPT: u64 = 9;
    pub const MACHINE_EXTERNAL_INTERRUPT: u64 = 11;
}

/// Set on the MSB of `cause` to distinguish interrupts from exceptions.
pub const INTERRUPT_BIT: u64 = 1 << 63;

/// An architectural exception or interrupt about to be delivered. Carries
/// enough information to populate `xcause`/`xtval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trap {
    pub cause: u64,
    pub tval: u64,
}

impl Trap {
    pub fn exception(cause: u64, tval: u64) -> Self {
        Self { cause, tval }
    }

    pub fn interrupt(cause_bit: u64) -> Self {
        Self { cause: INTERRUPT_BIT | cause_bit, tval: 0 }
    }

    pub fn is_interrupt(&self) -> bool {
        self.cause & INTERRUPT_BIT != 0
    }

    fn code(&self) -> u64 {
        self.cause & !INTERRUPT_BIT
    }
}

/// Whether `trap` is delegated to S-mode given `medeleg`/`mideleg` and the
/// current privilege (delegation only applies when current `PRV <= S`).
fn delegated_to_supervisor(trap: &Trap, current: Mode, medeleg: u64, mideleg: u64) -> bool {
    if current == Mode::Machine {
        return false;
    }
    let deleg = if trap.is_interrupt() { mideleg } else { medeleg };
    (deleg >> trap.code()) & 1 != 0
}

/// Delivers `trap`, mutating `xcause/xepc/xtval`, `xPIE/xIE`, `xPP`, `PRV`,
/// and `pc`. Returns the mode the trap was delivered at.
pub fn deliver<A: StateAccess + ?Sized>(access: &mut A, trap: Trap) -> Mode {
    let current = access.mode();
    let medeleg = access.read_csr(MEDELEG);
    let mideleg = access.read_csr(MIDELEG);
    let target = if delegated_to_supervisor(&trap, current, medeleg, mideleg) {
        Mode::Supervisor
    } else {
        Mode::Machine
    };

    let pc = access.read_pc();
    match target {
        Mode::Supervisor => {
            access.write_csr(SCAUSE, trap.cause);
            access.write_csr(SEPC, pc);
            access.write_csr(STVAL, trap.tval);
            let sie = access.read_csr_bits(SSTATUS, XSTATUS_SIE);
            access.write_csr_bits(SSTATUS, XSTATUS_SPIE, sie);
            access.write_csr_bits(SSTATUS, XSTATUS_SIE, 0);
            access.write_csr_bits(SSTATUS, XSTATUS_SPP, current.bits());
            access.set_mode(Mode::Supervisor);
            access.write_pc(access.read_csr(STVEC));
        }
        _ => {
            access.write_csr(MCAUSE, trap.cause);
            access.write_csr(MEPC, pc);
            access.write_csr(MTVAL, trap.tval);
            let mie = access.read_csr_bits(MSTATUS, MSTATUS_MIE);
            access.write_csr_bits(MSTATUS, MSTATUS_MPIE, mie);
            access.write_csr_bits(MSTATUS, MSTATUS_MIE, 0);
            access.write_csr_bits(MSTATUS, MSTATUS_MPP, current.bits());
            access.set_mode(Mode::Machine);
            access.write_pc(access.read_csr(MTVEC));
        }
    }
    access.write_ilrsc(crate::primitives::constants::ILRSC_NONE);
    target
}

/// Picks the highest-priority enabled pending interrupt, if any.
pub fn pending_interrupt<A: StateAccess + ?Sized>(access: &mut A) -> Option<Trap> {
    let mode = access.mode();
    let mip = access.read_csr(MIP);
    let mie = access.read_csr(MIE);
    let mideleg = access.read_csr(MIDELEG);
    let pending = mip & mie;
    if pending == 0 {
        return None;
    }

    let mstatus_mie = access.read_csr_bits(MSTATUS, MSTATUS_MIE) != 0;
    let sstatus_sie = access.read_csr_bits(SSTATUS, XSTATUS_SIE) != 0;

    // Highest bit index first: MEI(11), MSI(3), MTI(7), SEI(9), SSI(1), STI(5)
    // per the RISC-V-mandated priority order (external > software > timer,
    // machine > supervisor).
    const PRIORITY: [u64; 6] = [
        cause::MACHINE_EXTERNAL_INTERRUPT,
        cause::MACHINE_SOFTWARE_INTERRUPT,
        cause::MACHINE_TIMER_INTERRUPT,
        cause::SUPERVISOR_EXTERNAL_INTERRUPT,
        cause::SUPERVISOR_SOFTWARE_INTERRUPT,
        cause::SUPERVISOR_TIMER_INTERRUPT,
    ];
    for bit in PRIORITY {
        if (pending >> bit) & 1 == 0 {
            continue;
        }
        let delegated = (mideleg >> bit) & 1 != 0;
        let enabled = if !delegated {
            // M-mode interrupts (or any non-delegated interrupt) are masked
            // only by mstatus.MIE when current privilege is M; always
            // enabled when current privilege is below M.
            mode != Mode::Machine || mstatus_mie
        } else {
            match mode {
                Mode::Machine => false,
                Mode::Supervisor => sstatus_sie,
                Mode::User => true,
            }
        };
        if enabled {
            return Some(Trap::interrupt(bit));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Machine;

    #[test]
    fn unprivileged_ecall_delegated_when_medeleg_set() {
        let mut m = Machine::bare();
        m.set_mode(Mode::User);
        m.write_csr(MEDELEG, 1 << cause::ECALL_FROM_U);
        m.write_csr(STVEC, 0x2000);
        let target = deliver(&mut m, Trap::exception(cause::ECALL_FROM_U, 0));
        assert_eq!(target, Mode::Supervisor);
        assert_eq!(m.read_csr(SCAUSE), cause::ECALL_FROM_U);
        assert_eq!(m.mode(), Mode::Supervisor);
    }

    #[test]
    fn ecall_defaults_to_machine_without_delegation() {
        let mut m = Machine::bare();
        m.set_mode(Mode::User);
        m.write_csr(MTVEC, 0x3000);
        let target = deliver(&mut m, Trap::exception(cause::ECALL_FROM_U, 0));
        assert_eq!(target, Mode::Machine);
        assert_eq!(m.read_pc(), 0x3000);
    }

    #[test]
    fn no_pending_interrupt_without_mie() {
        let mut m = Machine::bare();
        m.write_csr(MIE, 0);
        m.write_csr(MIP, 1 << cause::MACHINE_TIMER_INTERRUPT);
        assert!(pending_interrupt(&mut m).is_none());
    }
}
