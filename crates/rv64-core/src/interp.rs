//! The outer interpreter loop: cycle/instret accounting, CLINT timer
//! polling, and the fetch-execute-trap iteration that drives every other
//! module. Grounded in `examples/original_source/src/emulator/riscv_cpu.cpp`'s
//! `interpret`, which advances `mcycle` every iteration, polls the CLINT
//! comparator, and checks `mip & mie` before each instruction.
use crate::access::log::{AccessLog, LogType, LoggingAccess};
use crate::access::StateAccess;
use crate::device::clint;
use crate::device::DeviceHost;
use crate::machine::Machine;
use crate::primitives::constants::{CLINT_BASE, RTC_FREQ_DIV};
use crate::reg::csr::MIP;
use crate::trap;

/// Why [`run`] returned control to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// `mcycle` reached the caller's budget.
    ReachedTarget,
    /// `iflags.H` is set; the machine will never run again.
    Halted,
    /// `iflags.I` is set and no enabled interrupt is pending: the machine
    /// executed `WFI` and is waiting on the CLINT timer or an external event.
    Idle,
    /// `iflags.Y` is set: the machine yielded voluntarily and awaits the host.
    Yielded,
}

/// Compares `mtime` (derived from `mcycle`) against the CLINT `mtimecmp`
/// register and sets or clears `mip.MTIP` to match. This is the hardware
/// side of the comparator, so it writes through [`StateAccess::write_mip_hw`]
/// rather than the guest-CSR-masked `write_csr`.
pub fn poll_clint_timer<A: StateAccess + ?Sized>(access: &mut A) {
    let mtime = clint::mtime_of(access.read_mcycle());
    let mtimecmp = access.read_physical(CLINT_BASE + clint::MTIMECMP, 3).unwrap_or(u64::MAX);
    let cur = access.read_csr(MIP);
    let want = mtime >= mtimecmp;
    let have = cur & crate::reg::csr::MTIP_BIT != 0;
    if want != have {
        let new = if want { cur | crate::reg::csr::MTIP_BIT } else { cur & !crate::reg::csr::MTIP_BIT };
        access.write_mip_hw(new);
    }
}

/// One tick of the inner fetch-execute loop: poll the timer,
/// then either deliver a pending interrupt or fetch and execute the
/// instruction at `pc`, then advance `mcycle`/`minstret`.
///
/// The reference pseudocode gates the interrupt check on `iflags.B`,
/// an optimization fence the same section's Open Questions explicitly
/// permits an implementation to omit "without changing observable behavior"
/// by polling every iteration instead — which is what this does, so
/// `break_inner` (still set by `MRET`/`SRET`/`WFI`/`SFENCE.VMA` in `exec`,
/// matching the source) never needs to be consulted here.
/// `pub(crate)` rather than private: [`crate::access::log::verify_log`]
/// replays a logged step by running this exact function against a
/// [`crate::access::log::ReplayAccess`] instead of hand-reconstructing the
/// access pattern, so the two can never drift apart.
pub(crate) fn step_inner<A: StateAccess + ?Sized>(access: &mut A) {
    poll_clint_timer(access);
    match trap::pending_interrupt(access) {
        Some(t) => {
            trap::deliver(access, t);
        }
        None => match access.fetch() {
            Ok(insn) => {
                let pc = access.read_pc();
                match crate::exec::execute(access, pc, insn) {
                    Ok(()) => {
                        let instret = access.read_minstret();
                        access.write_minstret(instret.wrapping_add(1));
                    }
                    Err(t) => {
                        trap::deliver(access, t);
                    }
                }
            }
            Err(t) => {
                trap::deliver(access, t);
            }
        },
    }
    let mcycle = access.read_mcycle();
    access.write_mcycle(mcycle.wrapping_add(1));
}

/// Interprets exactly one instruction against `machine`, producing the
/// transcript of every architectural touch it made.
pub fn step(machine: &mut Machine, log_type: LogType) -> AccessLog {
    let mut logging = LoggingAccess::new(machine, log_type);
    step_inner(&mut logging);
    logging.into_log()
}

/// Runs `machine` until `mcycle` reaches `cycles_end` or it halts, idles, or
/// yields. The caller supplies the cycle budget; there is
/// no wall-clock timeout inside the core.
pub fn run(machine: &mut Machine, cycles_end: u64) -> RunOutcome {
    loop {
        if machine.iflags().halted {
            return RunOutcome::Halted;
        }
        if machine.read_mcycle() >= cycles_end {
            return RunOutcome::ReachedTarget;
        }
        if machine.iflags().yielded {
            return RunOutcome::Yielded;
        }
        if machine.iflags().idle {
            match idle_tick(machine, cycles_end) {
                IdleTick::StillIdle => return RunOutcome::Idle,
                IdleTick::ReachedTarget => return RunOutcome::ReachedTarget,
                IdleTick::WokeUp => continue,
            }
        }
        step_inner(machine);
    }
}

enum IdleTick {
    StillIdle,
    ReachedTarget,
    WokeUp,
}

/// Fast-forwards `mcycle` to the scheduled timer interrupt or `cycles_end`,
/// whichever is smaller, with no wall-clock input. Wakes the machine (clearing `iflags.I`) the moment an
/// enabled interrupt becomes pending.
fn idle_tick(machine: &mut Machine, cycles_end: u64) -> IdleTick {
    poll_clint_timer(machine);
    if trap::pending_interrupt(machine).is_some() {
        machine.clear_idle();
        return IdleTick::WokeUp;
    }

    let scheduled = DeviceHost::read_mtimecmp(machine).saturating_mul(RTC_FREQ_DIV);
    let cur = machine.read_mcycle();
    let target = scheduled.max(cur).min(cycles_end);
    if target > cur {
        machine.write_mcycle(target);
        poll_clint_timer(machine);
        if trap::pending_interrupt(machine).is_some() {
            machine.clear_idle();
            return IdleTick::WokeUp;
        }
    }

    if machine.read_mcycle() >= cycles_end {
        IdleTick::ReachedTarget
    } else {
        IdleTick::StillIdle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;
    use crate::device::clint;
    use crate::mode::Mode;
    use crate::reg::csr::{MIE, MSTATUS, MSTATUS_MIE, MTVEC};
    use crate::tlb::TlbClass;

    const ADDI_X0_X0_0: u32 = 0x0000_0013;
    // opcode=SYSTEM(0b1110011), funct3=0, rd=0, rs1=0, rs2=0b00101, funct7=0b0001000.
    const WFI: u32 = (0b0001000 << 25) | (0b00101 << 20) | 0b1110011;
    // opcode=SYSTEM, funct3=0, rd=0, rs1=0, funct12=0.
    const ECALL: u32 = 0b1110011;

    fn rom_machine(ram_len: u64, image: u32) -> Machine {
        let mut cfg = MachineConfig::with_ram_length(ram_len);
        cfg.rom.image = Some(image.to_le_bytes().to_vec());
        Machine::new(&cfg).unwrap()
    }

    #[test]
    fn run_reaches_cycle_target_after_one_nop() {
        let mut m = rom_machine(0x1000, ADDI_X0_X0_0);
        let outcome = run(&mut m, 1);
        assert_eq!(outcome, RunOutcome::ReachedTarget);
        assert_eq!(m.read_mcycle(), 1);
        assert_eq!(m.read_minstret(), 1);
        assert_eq!(m.read_pc(), 0x1004);
    }

    #[test]
    fn run_stops_immediately_when_halted() {
        let mut m = rom_machine(0x1000, ADDI_X0_X0_0);
        m.set_halted();
        assert_eq!(run(&mut m, 10), RunOutcome::Halted);
        assert_eq!(m.read_mcycle(), 0);
    }

    #[test]
    fn wfi_idles_then_wakes_on_scheduled_timer_interrupt() {
        let mut m = rom_machine(0x1000, WFI);
        m.write_csr(MIE, crate::reg::csr::MTIP_BIT);
        m.write_csr_bits(MSTATUS, MSTATUS_MIE, 1);
        m.write_memory_aligned(crate::primitives::constants::CLINT_BASE + clint::MTIMECMP, 3, 5, TlbClass::Write)
            .unwrap();

        // One tick retires the WFI itself and parks the machine in iflags.I.
        let parked = run(&mut m, 1);
        assert_eq!(parked, RunOutcome::ReachedTarget);
        assert!(m.iflags().idle);

        // mtimecmp=5 is due at mcycle=500 (mtime = mcycle / RTC_FREQ_DIV);
        // a budget that lands exactly there should fast-forward and wake.
        let woke = run(&mut m, 1 + 5 * crate::primitives::constants::RTC_FREQ_DIV);
        assert_eq!(woke, RunOutcome::ReachedTarget);
        assert!(!m.iflags().idle);
        assert_eq!(m.read_mcycle(), 1 + 5 * crate::primitives::constants::RTC_FREQ_DIV);
    }

    #[test]
    fn step_log_replays_to_the_same_root_hash() {
        let mut m = rom_machine(0x1000, ADDI_X0_X0_0);
        let pre_root = m.root_hash();
        let log = step(&mut m, LogType { proofs: true, annotations: false });
        let post_root = m.root_hash();
        crate::access::log::verify_log(&log, pre_root, post_root, Mode::Machine).unwrap();
    }

    #[test]
    fn ecall_trap_delivered_through_run() {
        let mut m = rom_machine(0x1000, ECALL);
        m.write_csr(MTVEC, 0x2000);
        let outcome = run(&mut m, 1);
        assert_eq!(outcome, RunOutcome::ReachedTarget);
        assert_eq!(m.mode(), Mode::Machine);
        assert_eq!(m.read_pc(), 0x2000);
        assert_eq!(m.read_csr(crate::reg::csr::MCAUSE), crate::trap::cause::ECALL_FROM_M);
        // instret must not advance: the trapping instruction never retired.
        assert_eq!(m.read_minstret(), 0);
    }
}
