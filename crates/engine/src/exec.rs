//! Per-CPU architectural state and the single-step executor.

use crate::decode::{Decoder, Op};
use crate::exception::{Exception, SRR1_ILLEGAL, SRR1_TRAP};
use bus::Bus;
use gekko::{
    Address,
    regs::{Bat, Cond, CondReg, MachineState, Registers, Spr, XerReg},
};
use mmu::{Access, Mmu, MmuError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

pub const MAX_BREAKPOINTS: usize = 16;
const MEMLOG_ENTRIES: usize = 16;
/// Timebase ticks credited per instruction, a first-order approximation of
/// real cycle timing.
const TIMEBASE_TICKS_PER_STEP: u64 = 100;

/// What the main loop should do after one `step()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Instruction retired normally; IA was already advanced by 4.
    Advanced,
    /// A branch, exception, or `rfi` set IA explicitly; do not advance it.
    Redirected,
    /// The CPU hit its idle-match PC enough times in a row to be considered
    /// idle; the caller may sleep the thread for a bounded interval.
    Idle,
}

#[derive(Debug, Clone, Copy)]
struct MemLogEntry {
    ia: Address,
    vaddr: Address,
    data: u32,
    store: bool,
}

/// Running/halted/suspended state, observed by the owning thread at the top
/// of each loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Halted,
    Suspended,
}

/// Execution statistics, exposed read-only for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub instructions: u64,
    pub external_irqs: u64,
    pub timer_irqs: u64,
    pub timer_drift: u64,
    pub device_accesses: u64,
}

enum ControlFlow {
    Next,
    Jump(Address),
    Trap,
}

/// One emulated PowerPC-32 CPU: architectural registers, the MMU/VTLB, and
/// the execution bookkeeping (IRQ handshake, reservation, breakpoints,
/// idle-loop detector, and a small diagnostic access ring buffer).
pub struct Cpu {
    pub regs: Registers,
    pub mmu: Mmu,
    decoder: Decoder,

    /// Set by any thread calling `set_irq`; cleared by the CPU thread once
    /// delivered. Survives `MSR[EE]` being clear -- the edge is remembered.
    irq_pending: AtomicBool,
    /// Set alongside `irq_pending` only when `MSR[EE]` was set at the time;
    /// the CPU thread clears this on every poll regardless of outcome.
    irq_check: AtomicBool,

    reservation: Option<u64>,

    breakpoints: Vec<Address>,
    pub breakpoint_hit: Option<Address>,

    idle_pc: Option<Address>,
    idle_hits: u32,
    idle_threshold: u32,

    memlog: [Option<MemLogEntry>; MEMLOG_ENTRIES],
    memlog_next: usize,

    pub stats: Stats,
    pub state: RunState,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            regs: Registers::default(),
            mmu: Mmu::new(),
            decoder: Decoder::new(),
            irq_pending: AtomicBool::new(false),
            irq_check: AtomicBool::new(false),
            reservation: None,
            breakpoints: Vec::new(),
            breakpoint_hit: None,
            idle_pc: None,
            idle_hits: 0,
            idle_threshold: 64,
            memlog: [None; MEMLOG_ENTRIES],
            memlog_next: 0,
            stats: Stats::default(),
            state: RunState::Running,
        }
    }

    /// Safe to call from any thread.
    pub fn set_irq(&self) {
        self.irq_pending.store(true, Ordering::Relaxed);
        if self.regs.supervisor.msr.external_interrupts() {
            self.irq_check.store(true, Ordering::Relaxed);
        }
    }

    /// Safe to call from any thread.
    pub fn clear_irq(&self) {
        self.irq_pending.store(false, Ordering::Relaxed);
    }

    pub fn set_idle_pc(&mut self, pc: Option<Address>) {
        self.idle_pc = pc;
        self.idle_hits = 0;
    }

    pub fn add_breakpoint(&mut self, ia: Address) {
        if self.breakpoints.len() < MAX_BREAKPOINTS && !self.breakpoints.contains(&ia) {
            self.breakpoints.push(ia);
        }
    }

    pub fn remove_breakpoint(&mut self, ia: Address) {
        self.breakpoints.retain(|&bp| bp != ia);
    }

    fn log_access(&mut self, ia: Address, vaddr: Address, data: u32, store: bool) {
        self.memlog[self.memlog_next] = Some(MemLogEntry { ia, vaddr, data, store });
        self.memlog_next = (self.memlog_next + 1) % MEMLOG_ENTRIES;
    }

    /// Executes exactly one instruction. `bus` is locked only for the span
    /// of each individual fetch/load/store/MMIO dispatch below, never for
    /// the whole step -- decode and register-only execution run lock-free.
    pub fn step(&mut self, bus: &Mutex<Bus>) -> StepOutcome {
        if self.irq_check.swap(false, Ordering::Relaxed)
            && self.irq_pending.load(Ordering::Relaxed)
            && self.regs.supervisor.msr.external_interrupts()
        {
            self.stats.external_irqs += 1;
            self.raise(Exception::External);
            return StepOutcome::Redirected;
        }

        if let Some(idle_pc) = self.idle_pc {
            if self.regs.pc == idle_pc {
                self.idle_hits += 1;
                if self.idle_hits >= self.idle_threshold {
                    return StepOutcome::Idle;
                }
            } else {
                self.idle_hits = 0;
            }
        }

        self.regs.supervisor.misc.timebase =
            self.regs.supervisor.misc.timebase.wrapping_add(TIMEBASE_TICKS_PER_STEP);
        if self.regs.supervisor.misc.decrementer == 0 {
            self.regs.supervisor.misc.decrementer = u32::MAX;
        } else {
            self.regs.supervisor.misc.decrementer -= 1;
            if self.regs.supervisor.misc.decrementer == 0 && self.regs.supervisor.msr.external_interrupts() {
                self.stats.timer_irqs += 1;
                self.raise(Exception::Decrementer);
                return StepOutcome::Redirected;
            }
        }

        if !self.breakpoints.is_empty() && self.breakpoints.contains(&self.regs.pc) {
            self.breakpoint_hit = Some(self.regs.pc);
        }

        let ia = self.regs.pc;
        let word = match self.fetch(ia, bus) {
            Ok(word) => word,
            Err(()) => return StepOutcome::Redirected,
        };

        let op = self.decoder.decode(word);
        self.stats.instructions += 1;

        match self.execute(op, ia, bus) {
            ControlFlow::Next => {
                self.regs.pc += 4;
                StepOutcome::Advanced
            }
            ControlFlow::Jump(target) => {
                self.regs.pc = target;
                StepOutcome::Redirected
            }
            ControlFlow::Trap => StepOutcome::Redirected,
        }
    }

    fn user_mode(&self) -> bool {
        self.regs.supervisor.msr.user_mode()
    }

    fn translation_enabled(&self, access: Access) -> bool {
        match access {
            Access::Fetch => self.regs.supervisor.msr.instr_addr_translation(),
            Access::Load | Access::Store => self.regs.supervisor.msr.data_addr_translation(),
        }
    }

    fn fetch(&mut self, ia: Address, bus: &Mutex<Bus>) -> Result<u32, ()> {
        let user = self.user_mode();
        let translation_enabled = self.translation_enabled(Access::Fetch);
        let mut guard = bus.lock();
        let translated =
            self.mmu
                .translate(ia, Access::Fetch, translation_enabled, user, &self.regs.supervisor.memory, &mut guard);
        match translated {
            Ok((phys, target)) => {
                let word: u32 = match target {
                    Some(target) => guard.read_at(target, self).unwrap_or_default(),
                    None => guard.read(phys, self).unwrap_or_default(),
                };
                Ok(word)
            }
            Err(err) => {
                drop(guard);
                self.raise_mmu_fault(err, true);
                Err(())
            }
        }
    }

    fn load<T: gekko::Primitive>(&mut self, vaddr: Address, bus: &Mutex<Bus>) -> Option<T> {
        let user = self.user_mode();
        let translation_enabled = self.translation_enabled(Access::Load);
        let mut guard = bus.lock();
        let translated =
            self.mmu
                .translate(vaddr, Access::Load, translation_enabled, user, &self.regs.supervisor.memory, &mut guard);
        match translated {
            Ok((phys, target)) => {
                let value: T = match target {
                    Some(target) => guard.read_at(target, self).unwrap_or_default(),
                    None => guard.read(phys, self).unwrap_or_default(),
                };
                Some(value)
            }
            Err(err) => {
                drop(guard);
                self.raise_mmu_fault(err, false);
                None
            }
        }
    }

    fn store<T: gekko::Primitive>(&mut self, vaddr: Address, value: T, bus: &Mutex<Bus>) -> bool {
        let user = self.user_mode();
        let translation_enabled = self.translation_enabled(Access::Store);
        let mut guard = bus.lock();
        let translated =
            self.mmu
                .translate(vaddr, Access::Store, translation_enabled, user, &self.regs.supervisor.memory, &mut guard);
        match translated {
            Ok((phys, target)) => {
                match target {
                    Some(target) => {
                        let _ = guard.write_at(target, value, self);
                    }
                    None => {
                        let _ = guard.write(phys, value, self);
                    }
                }
                true
            }
            Err(err) => {
                drop(guard);
                self.raise_mmu_fault(err, false);
                false
            }
        }
    }

    fn raise_mmu_fault(&mut self, err: MmuError, instruction_side: bool) {
        if instruction_side {
            self.raise(Exception::InstructionStorage { srr1_bits: err.status_bits() & 0x3 });
        } else {
            let dar = err.addr().value();
            let dsisr = err.status_bits();
            self.raise(Exception::DataStorage { dsisr, dar });
        }
    }

    fn illegal(&mut self) -> ControlFlow {
        self.raise(Exception::Program { srr1_bits: SRR1_ILLEGAL });
        ControlFlow::Trap
    }

    /// Performs the exception-injection sequence common to every trap: save
    /// IA/MSR into SRR0/SRR1, mask MSR, clear the IRQ-check flag, and
    /// redirect IA to the vector base.
    fn raise(&mut self, exception: Exception) {
        let msr = self.regs.supervisor.msr;
        self.regs.supervisor.exception.srr[0] = self.regs.pc.value();
        self.regs.supervisor.exception.srr[1] = msr_to_bits(msr) | exception.srr1_bits();

        if let Exception::DataStorage { dsisr, dar } = exception {
            self.regs.supervisor.exception.dsisr = dsisr;
            self.regs.supervisor.exception.dar = dar;
        }

        let mut msr = msr;
        msr.set_data_addr_translation(false);
        msr.set_instr_addr_translation(false);
        msr.set_external_interrupts(false);
        msr.set_recoverable_exception(false);
        msr.set_user_mode(false);
        let prefix = msr.exception_prefix();
        self.regs.supervisor.msr = msr;

        self.reservation = None;
        self.irq_check.store(false, Ordering::Relaxed);

        let base = if prefix { 0xFFF0_0000 } else { 0 };
        self.regs.pc = Address(base | exception.vector());
    }

    fn read_spr(&self, spr: Spr) -> u32 {
        use Spr::*;
        match spr {
            Xer => xer_to_bits(&self.regs.user.xer),
            Lr => self.regs.user.lr,
            Ctr => self.regs.user.ctr,
            Dsisr => self.regs.supervisor.exception.dsisr,
            Dar => self.regs.supervisor.exception.dar,
            Dec => self.regs.supervisor.misc.decrementer,
            Sdr1 => self.regs.supervisor.memory.sdr1,
            Srr0 => self.regs.supervisor.exception.srr[0],
            Srr1 => self.regs.supervisor.exception.srr[1],
            Sprg0 => self.regs.supervisor.exception.sprg[0],
            Sprg1 => self.regs.supervisor.exception.sprg[1],
            Sprg2 => self.regs.supervisor.exception.sprg[2],
            Sprg3 => self.regs.supervisor.exception.sprg[3],
            Pvr => self.regs.supervisor.pvr,
            Ibat0U => bat_upper(&self.regs.supervisor.memory.ibat[0]),
            Ibat0L => bat_lower(&self.regs.supervisor.memory.ibat[0]),
            Ibat1U => bat_upper(&self.regs.supervisor.memory.ibat[1]),
            Ibat1L => bat_lower(&self.regs.supervisor.memory.ibat[1]),
            Ibat2U => bat_upper(&self.regs.supervisor.memory.ibat[2]),
            Ibat2L => bat_lower(&self.regs.supervisor.memory.ibat[2]),
            Ibat3U => bat_upper(&self.regs.supervisor.memory.ibat[3]),
            Ibat3L => bat_lower(&self.regs.supervisor.memory.ibat[3]),
            Dbat0U => bat_upper(&self.regs.supervisor.memory.dbat[0]),
            Dbat0L => bat_lower(&self.regs.supervisor.memory.dbat[0]),
            Dbat1U => bat_upper(&self.regs.supervisor.memory.dbat[1]),
            Dbat1L => bat_lower(&self.regs.supervisor.memory.dbat[1]),
            Dbat2U => bat_upper(&self.regs.supervisor.memory.dbat[2]),
            Dbat2L => bat_lower(&self.regs.supervisor.memory.dbat[2]),
            Dbat3U => bat_upper(&self.regs.supervisor.memory.dbat[3]),
            Dbat3L => bat_lower(&self.regs.supervisor.memory.dbat[3]),
            Hid0 => self.regs.supervisor.hid[0],
            Hid1 => self.regs.supervisor.hid[1],
        }
    }

    fn write_spr(&mut self, spr: Spr, value: u32) {
        use Spr::*;
        match spr {
            Xer => self.regs.user.xer = XerReg::from_bits(value),
            Lr => self.regs.user.lr = value,
            Ctr => self.regs.user.ctr = value,
            Dsisr => self.regs.supervisor.exception.dsisr = value,
            Dar => self.regs.supervisor.exception.dar = value,
            Dec => self.regs.supervisor.misc.decrementer = value,
            Sdr1 => {
                self.regs.supervisor.memory.sdr1 = value;
                self.mmu.invalidate_all();
            }
            Srr0 => self.regs.supervisor.exception.srr[0] = value,
            Srr1 => self.regs.supervisor.exception.srr[1] = value,
            Sprg0 => self.regs.supervisor.exception.sprg[0] = value,
            Sprg1 => self.regs.supervisor.exception.sprg[1] = value,
            Sprg2 => self.regs.supervisor.exception.sprg[2] = value,
            Sprg3 => self.regs.supervisor.exception.sprg[3] = value,
            Pvr => {}
            Ibat0U => self.write_bat(true, 0, true, value),
            Ibat0L => self.write_bat(true, 0, false, value),
            Ibat1U => self.write_bat(true, 1, true, value),
            Ibat1L => self.write_bat(true, 1, false, value),
            Ibat2U => self.write_bat(true, 2, true, value),
            Ibat2L => self.write_bat(true, 2, false, value),
            Ibat3U => self.write_bat(true, 3, true, value),
            Ibat3L => self.write_bat(true, 3, false, value),
            Dbat0U => self.write_bat(false, 0, true, value),
            Dbat0L => self.write_bat(false, 0, false, value),
            Dbat1U => self.write_bat(false, 1, true, value),
            Dbat1L => self.write_bat(false, 1, false, value),
            Dbat2U => self.write_bat(false, 2, true, value),
            Dbat2L => self.write_bat(false, 2, false, value),
            Dbat3U => self.write_bat(false, 3, true, value),
            Dbat3L => self.write_bat(false, 3, false, value),
            Hid0 => self.regs.supervisor.hid[0] = value,
            Hid1 => self.regs.supervisor.hid[1] = value,
        }
    }

    fn write_bat(&mut self, instr: bool, index: usize, upper: bool, value: u32) {
        let bats = if instr { &mut self.regs.supervisor.memory.ibat } else { &mut self.regs.supervisor.memory.dbat };
        let raw = if upper {
            ((value as u64) << 32) | bat_lower(&bats[index]) as u64
        } else {
            ((bat_upper(&bats[index]) as u64) << 32) | value as u64
        };
        bats[index] = Bat::from_bits(raw);
        self.mmu.invalidate_all();
    }

    #[inline(always)]
    fn gpr(&self, r: u8) -> u32 {
        self.regs.user.gpr[r as usize]
    }

    /// PowerPC's "RA = 0 means literal 0" convention, used by `addi`/`addis`
    /// and every base-register address computation.
    #[inline(always)]
    fn gpr0(&self, r: u8) -> u32 {
        if r == 0 { 0 } else { self.gpr(r) }
    }

    #[inline(always)]
    fn set_gpr(&mut self, r: u8, value: u32) {
        self.regs.user.gpr[r as usize] = value;
    }

    fn update_cr0(&mut self, result: i32) {
        let so = self.regs.user.xer.summary_overflow();
        let mut cond = Cond::default();
        cond.set_so(so);
        cond.set_lt(result < 0);
        cond.set_gt(result > 0);
        cond.set_eq(result == 0);
        self.regs.user.cr.set_cr0(cond);
    }

    fn compare_signed(&mut self, crf: u8, a: i32, b: i32) {
        let so = self.regs.user.xer.summary_overflow();
        let mut cond = Cond::default();
        cond.set_so(so);
        cond.set_lt(a < b);
        cond.set_gt(a > b);
        cond.set_eq(a == b);
        self.regs.user.cr.set_field(crf, cond);
    }

    fn compare_unsigned(&mut self, crf: u8, a: u32, b: u32) {
        let so = self.regs.user.xer.summary_overflow();
        let mut cond = Cond::default();
        cond.set_so(so);
        cond.set_lt(a < b);
        cond.set_gt(a > b);
        cond.set_eq(a == b);
        self.regs.user.cr.set_field(crf, cond);
    }

    fn set_xer_ov(&mut self, overflow: bool) {
        self.regs.user.xer.set_overflow(overflow);
        if overflow {
            self.regs.user.xer.set_summary_overflow(true);
        }
    }

    fn set_xer_ca(&mut self, carry: bool) {
        self.regs.user.xer.set_carry(carry);
    }

    /// Four independent booleans packed into BO, decoded per the
    /// architecture: bit2 ignores CTR, bit1 is the CTR test polarity, bit0
    /// ignores the condition, bit3 is the condition test polarity. CTR is
    /// decremented exactly once, only when it isn't being ignored.
    fn branch_taken(&mut self, bo: u8, bi: u8) -> bool {
        let ignore_ctr = bo & 0b00100 != 0;
        if !ignore_ctr {
            self.regs.user.ctr = self.regs.user.ctr.wrapping_sub(1);
        }
        let ctr_ok = ignore_ctr || {
            if bo & 0b00010 != 0 { self.regs.user.ctr == 0 } else { self.regs.user.ctr != 0 }
        };
        let cond_ok = bo & 0b10000 != 0 || {
            let crf = bi >> 2;
            let which = bi & 0x3;
            let cond = self.regs.user.cr.field(crf);
            let bit = match which {
                0 => cond.lt(),
                1 => cond.gt(),
                2 => cond.eq(),
                _ => cond.so(),
            };
            bit == (bo & 0b01000 != 0)
        };
        ctr_ok && cond_ok
    }

    fn execute(&mut self, op: Op, ia: Address, bus: &Mutex<Bus>) -> ControlFlow {
        match op {
            Op::Illegal { .. } => self.illegal(),

            Op::Add { rt, ra, rb, oe, rc } => {
                let a = self.gpr(ra) as i32;
                let b = self.gpr(rb) as i32;
                let result = a.wrapping_add(b);
                if oe {
                    self.set_xer_ov(add_overflowed(a, b, result));
                }
                self.set_gpr(rt, result as u32);
                if rc {
                    self.update_cr0(result);
                }
                ControlFlow::Next
            }
            Op::Addc { rt, ra, rb, oe, rc } => {
                let a = self.gpr(ra);
                let b = self.gpr(rb);
                let (result, carry) = a.overflowing_add(b);
                self.set_xer_ca(carry);
                if oe {
                    self.set_xer_ov(add_overflowed(a as i32, b as i32, result as i32));
                }
                self.set_gpr(rt, result);
                if rc {
                    self.update_cr0(result as i32);
                }
                ControlFlow::Next
            }
            Op::Adde { rt, ra, rb, oe, rc } => {
                let a = self.gpr(ra);
                let b = self.gpr(rb);
                let carry_in = self.regs.user.xer.carry();
                let (result, carry) = add_with_carry(a, b, carry_in);
                self.set_xer_ca(carry);
                if oe {
                    self.set_xer_ov(add_overflowed(a as i32, b as i32, result as i32));
                }
                self.set_gpr(rt, result);
                if rc {
                    self.update_cr0(result as i32);
                }
                ControlFlow::Next
            }
            Op::Subf { rt, ra, rb, oe, rc } => {
                let a = self.gpr(ra) as i32;
                let b = self.gpr(rb) as i32;
                let result = b.wrapping_sub(a);
                if oe {
                    self.set_xer_ov(sub_overflowed(b, a, result));
                }
                self.set_gpr(rt, result as u32);
                if rc {
                    self.update_cr0(result);
                }
                ControlFlow::Next
            }
            Op::Subfc { rt, ra, rb, oe, rc } => {
                let a = self.gpr(ra);
                let b = self.gpr(rb);
                let (result, carry) = add_with_carry(!a, b, true);
                self.set_xer_ca(carry);
                if oe {
                    self.set_xer_ov(sub_overflowed(b as i32, a as i32, result as i32));
                }
                self.set_gpr(rt, result);
                if rc {
                    self.update_cr0(result as i32);
                }
                ControlFlow::Next
            }
            Op::Subfe { rt, ra, rb, oe, rc } => {
                let a = self.gpr(ra);
                let b = self.gpr(rb);
                let carry_in = self.regs.user.xer.carry();
                let (result, carry) = add_with_carry(!a, b, carry_in);
                self.set_xer_ca(carry);
                if oe {
                    self.set_xer_ov(sub_overflowed(b as i32, a as i32, result as i32));
                }
                self.set_gpr(rt, result);
                if rc {
                    self.update_cr0(result as i32);
                }
                ControlFlow::Next
            }
            Op::Neg { rt, ra, oe, rc } => {
                let a = self.gpr(ra) as i32;
                let result = a.wrapping_neg();
                if oe {
                    self.set_xer_ov(a == i32::MIN);
                }
                self.set_gpr(rt, result as u32);
                if rc {
                    self.update_cr0(result);
                }
                ControlFlow::Next
            }
            Op::Mullw { rt, ra, rb, oe, rc } => {
                let a = self.gpr(ra) as i32;
                let b = self.gpr(rb) as i32;
                let result = a.wrapping_mul(b);
                if oe {
                    let full = a as i64 * b as i64;
                    self.set_xer_ov(full != result as i64);
                }
                self.set_gpr(rt, result as u32);
                if rc {
                    self.update_cr0(result);
                }
                ControlFlow::Next
            }
            Op::Divw { rt, ra, rb, oe, rc } => {
                let a = self.gpr(ra) as i32;
                let b = self.gpr(rb) as i32;
                let degenerate = b == 0 || (a == i32::MIN && b == -1);
                let result = if degenerate { 0 } else { a.wrapping_div(b) };
                if oe {
                    self.set_xer_ov(degenerate);
                }
                self.set_gpr(rt, result as u32);
                if rc {
                    self.update_cr0(result);
                }
                ControlFlow::Next
            }
            Op::Divwu { rt, ra, rb, oe, rc } => {
                let a = self.gpr(ra);
                let b = self.gpr(rb);
                let result = if b == 0 { 0 } else { a / b };
                if oe {
                    self.set_xer_ov(b == 0);
                }
                self.set_gpr(rt, result);
                if rc {
                    self.update_cr0(result as i32);
                }
                ControlFlow::Next
            }

            Op::Addi { rt, ra, simm } => {
                self.set_gpr(rt, self.gpr0(ra).wrapping_add(simm as u32));
                ControlFlow::Next
            }
            Op::Addis { rt, ra, simm } => {
                let imm = (simm << 16) as u32;
                self.set_gpr(rt, self.gpr0(ra).wrapping_add(imm));
                ControlFlow::Next
            }
            Op::Addic { rt, ra, simm, rc } => {
                let a = self.gpr(ra);
                let (result, carry) = a.overflowing_add(simm as u32);
                self.set_xer_ca(carry);
                self.set_gpr(rt, result);
                if rc {
                    self.update_cr0(result as i32);
                }
                ControlFlow::Next
            }
            Op::Subfic { rt, ra, simm } => {
                let a = self.gpr(ra);
                let (result, carry) = add_with_carry(!a, simm as u32, true);
                self.set_xer_ca(carry);
                self.set_gpr(rt, result);
                ControlFlow::Next
            }
            Op::Mulli { rt, ra, simm } => {
                self.set_gpr(rt, self.gpr(ra).wrapping_mul(simm as u32));
                ControlFlow::Next
            }

            Op::Ori { ra, rs, uimm } => {
                self.set_gpr(ra, self.gpr(rs) | uimm);
                ControlFlow::Next
            }
            Op::Oris { ra, rs, uimm } => {
                self.set_gpr(ra, self.gpr(rs) | (uimm << 16));
                ControlFlow::Next
            }
            Op::Xori { ra, rs, uimm } => {
                self.set_gpr(ra, self.gpr(rs) ^ uimm);
                ControlFlow::Next
            }
            Op::Xoris { ra, rs, uimm } => {
                self.set_gpr(ra, self.gpr(rs) ^ (uimm << 16));
                ControlFlow::Next
            }
            Op::Andi { ra, rs, uimm } => {
                let result = self.gpr(rs) & uimm;
                self.set_gpr(ra, result);
                self.update_cr0(result as i32);
                ControlFlow::Next
            }
            Op::Andis { ra, rs, uimm } => {
                let result = self.gpr(rs) & (uimm << 16);
                self.set_gpr(ra, result);
                self.update_cr0(result as i32);
                ControlFlow::Next
            }
            Op::And { ra, rs, rb, rc } => {
                let result = self.gpr(rs) & self.gpr(rb);
                self.set_gpr(ra, result);
                if rc {
                    self.update_cr0(result as i32);
                }
                ControlFlow::Next
            }
            Op::Or { ra, rs, rb, rc } => {
                let result = self.gpr(rs) | self.gpr(rb);
                self.set_gpr(ra, result);
                if rc {
                    self.update_cr0(result as i32);
                }
                ControlFlow::Next
            }
            Op::Xor { ra, rs, rb, rc } => {
                let result = self.gpr(rs) ^ self.gpr(rb);
                self.set_gpr(ra, result);
                if rc {
                    self.update_cr0(result as i32);
                }
                ControlFlow::Next
            }
            Op::Nand { ra, rs, rb, rc } => {
                let result = !(self.gpr(rs) & self.gpr(rb));
                self.set_gpr(ra, result);
                if rc {
                    self.update_cr0(result as i32);
                }
                ControlFlow::Next
            }
            Op::Nor { ra, rs, rb, rc } => {
                let result = !(self.gpr(rs) | self.gpr(rb));
                self.set_gpr(ra, result);
                if rc {
                    self.update_cr0(result as i32);
                }
                ControlFlow::Next
            }

            Op::Cmpi { crf, ra, simm } => {
                self.compare_signed(crf, self.gpr(ra) as i32, simm);
                ControlFlow::Next
            }
            Op::Cmpli { crf, ra, uimm } => {
                self.compare_unsigned(crf, self.gpr(ra), uimm);
                ControlFlow::Next
            }
            Op::Cmp { crf, ra, rb } => {
                self.compare_signed(crf, self.gpr(ra) as i32, self.gpr(rb) as i32);
                ControlFlow::Next
            }
            Op::Cmpl { crf, ra, rb } => {
                self.compare_unsigned(crf, self.gpr(ra), self.gpr(rb));
                ControlFlow::Next
            }

            Op::Rlwinm { ra, rs, sh, mb, me, rc } => {
                let rotated = self.gpr(rs).rotate_left(sh as u32);
                let result = rotated & rotate_mask(mb, me);
                self.set_gpr(ra, result);
                if rc {
                    self.update_cr0(result as i32);
                }
                ControlFlow::Next
            }
            Op::Rlwimi { ra, rs, sh, mb, me, rc } => {
                let rotated = self.gpr(rs).rotate_left(sh as u32);
                let m = rotate_mask(mb, me);
                let result = (rotated & m) | (self.gpr(ra) & !m);
                self.set_gpr(ra, result);
                if rc {
                    self.update_cr0(result as i32);
                }
                ControlFlow::Next
            }
            Op::Rlwnm { ra, rs, rb, mb, me, rc } => {
                let shamt = self.gpr(rb) & 0x1F;
                let rotated = self.gpr(rs).rotate_left(shamt);
                let result = rotated & rotate_mask(mb, me);
                self.set_gpr(ra, result);
                if rc {
                    self.update_cr0(result as i32);
                }
                ControlFlow::Next
            }
            Op::Slw { ra, rs, rb, rc } => {
                let shamt = self.gpr(rb) & 0x3F;
                let result = if shamt >= 32 { 0 } else { self.gpr(rs) << shamt };
                self.set_gpr(ra, result);
                if rc {
                    self.update_cr0(result as i32);
                }
                ControlFlow::Next
            }
            Op::Srw { ra, rs, rb, rc } => {
                let shamt = self.gpr(rb) & 0x3F;
                let result = if shamt >= 32 { 0 } else { self.gpr(rs) >> shamt };
                self.set_gpr(ra, result);
                if rc {
                    self.update_cr0(result as i32);
                }
                ControlFlow::Next
            }
            Op::Sraw { ra, rs, rb, rc } => {
                let value = self.gpr(rs) as i32;
                let shamt = self.gpr(rb) & 0x3F;
                let (result, carry) = arithmetic_shift_right(value, shamt);
                self.set_xer_ca(carry);
                self.set_gpr(ra, result as u32);
                if rc {
                    self.update_cr0(result);
                }
                ControlFlow::Next
            }
            Op::Srawi { ra, rs, sh, rc } => {
                let value = self.gpr(rs) as i32;
                let (result, carry) = arithmetic_shift_right(value, sh as u32);
                self.set_xer_ca(carry);
                self.set_gpr(ra, result as u32);
                if rc {
                    self.update_cr0(result);
                }
                ControlFlow::Next
            }

            Op::B { li, aa, lk } => {
                if lk {
                    self.regs.user.lr = (ia + 4).value();
                }
                let target = if aa { Address(li as u32) } else { ia + (li as u32) };
                ControlFlow::Jump(target)
            }
            Op::Bc { bo, bi, bd, aa, lk } => {
                let taken = self.branch_taken(bo, bi);
                if lk {
                    self.regs.user.lr = (ia + 4).value();
                }
                if taken {
                    let target = if aa { Address(bd as u32) } else { ia + (bd as u32) };
                    ControlFlow::Jump(target)
                } else {
                    ControlFlow::Next
                }
            }
            Op::Bclr { bo, bi, lk } => {
                let taken = self.branch_taken(bo, bi);
                let target = Address(self.regs.user.lr & !0x3);
                if lk {
                    self.regs.user.lr = (ia + 4).value();
                }
                if taken { ControlFlow::Jump(target) } else { ControlFlow::Next }
            }
            Op::Bcctr { bo, bi, lk } => {
                let taken = self.branch_taken(bo, bi);
                let target = Address(self.regs.user.ctr & !0x3);
                if lk {
                    self.regs.user.lr = (ia + 4).value();
                }
                if taken { ControlFlow::Jump(target) } else { ControlFlow::Next }
            }

            Op::Mfcr { rt } => {
                self.set_gpr(rt, cr_to_bits(&self.regs.user.cr));
                ControlFlow::Next
            }
            Op::Mtcrf { fxm, rs } => {
                let value = self.gpr(rs);
                set_cr_from_bits(&mut self.regs.user.cr, value, fxm);
                ControlFlow::Next
            }

            Op::Lwz { rt, ra, d } => self.do_load::<u32>(ia, ra, d, rt, bus, |cpu, rt, v| cpu.set_gpr(rt, v)),
            Op::Lwzu { rt, ra, d } => self.do_load_update::<u32>(ia, ra, d, rt, bus, |cpu, rt, v| cpu.set_gpr(rt, v)),
            Op::Lhz { rt, ra, d } => self.do_load::<u16>(ia, ra, d, rt, bus, |cpu, rt, v| cpu.set_gpr(rt, v as u32)),
            Op::Lhzu { rt, ra, d } => {
                self.do_load_update::<u16>(ia, ra, d, rt, bus, |cpu, rt, v| cpu.set_gpr(rt, v as u32))
            }
            Op::Lha { rt, ra, d } => {
                self.do_load::<u16>(ia, ra, d, rt, bus, |cpu, rt, v| cpu.set_gpr(rt, v as i16 as i32 as u32))
            }
            Op::Lbz { rt, ra, d } => self.do_load::<u8>(ia, ra, d, rt, bus, |cpu, rt, v| cpu.set_gpr(rt, v as u32)),
            Op::Lbzu { rt, ra, d } => {
                self.do_load_update::<u8>(ia, ra, d, rt, bus, |cpu, rt, v| cpu.set_gpr(rt, v as u32))
            }
            Op::Stw { rs, ra, d } => self.do_store(ia, ra, d, self.gpr(rs), bus),
            Op::Stwu { rs, ra, d } => self.do_store_update(ia, ra, d, self.gpr(rs), bus),
            Op::Sth { rs, ra, d } => self.do_store(ia, ra, d, self.gpr(rs) as u16, bus),
            Op::Sthu { rs, ra, d } => self.do_store_update(ia, ra, d, self.gpr(rs) as u16, bus),
            Op::Stb { rs, ra, d } => self.do_store(ia, ra, d, self.gpr(rs) as u8, bus),
            Op::Stbu { rs, ra, d } => self.do_store_update(ia, ra, d, self.gpr(rs) as u8, bus),
            Op::Lfd { ft, ra, d } => {
                let addr = Address(self.gpr0(ra).wrapping_add(d as u32));
                match self.load::<u64>(addr, bus) {
                    Some(v) => {
                        self.regs.user.fpr[ft as usize] = v;
                        ControlFlow::Next
                    }
                    None => ControlFlow::Trap,
                }
            }
            Op::Lfdu { ft, ra, d } => {
                let addr = Address(self.gpr0(ra).wrapping_add(d as u32));
                match self.load::<u64>(addr, bus) {
                    Some(v) => {
                        self.regs.user.fpr[ft as usize] = v;
                        self.set_gpr(ra, addr.value());
                        ControlFlow::Next
                    }
                    None => ControlFlow::Trap,
                }
            }
            Op::Stfd { fs, ra, d } => {
                let addr = Address(self.gpr0(ra).wrapping_add(d as u32));
                let value = self.regs.user.fpr[fs as usize];
                if self.store(addr, value, bus) { ControlFlow::Next } else { ControlFlow::Trap }
            }
            Op::Stfdu { fs, ra, d } => {
                let addr = Address(self.gpr0(ra).wrapping_add(d as u32));
                let value = self.regs.user.fpr[fs as usize];
                if self.store(addr, value, bus) {
                    self.set_gpr(ra, addr.value());
                    ControlFlow::Next
                } else {
                    ControlFlow::Trap
                }
            }

            Op::Lwzx { rt, ra, rb } => {
                self.do_load_x::<u32>(ra, rb, rt, bus, |cpu, rt, v| cpu.set_gpr(rt, v))
            }
            Op::Lwzux { rt, ra, rb } => {
                self.do_load_x_update::<u32>(ra, rb, rt, bus, |cpu, rt, v| cpu.set_gpr(rt, v))
            }
            Op::Lhzx { rt, ra, rb } => {
                self.do_load_x::<u16>(ra, rb, rt, bus, |cpu, rt, v| cpu.set_gpr(rt, v as u32))
            }
            Op::Lbzx { rt, ra, rb } => {
                self.do_load_x::<u8>(ra, rb, rt, bus, |cpu, rt, v| cpu.set_gpr(rt, v as u32))
            }
            Op::Stwx { rs, ra, rb } => {
                let addr = Address(self.gpr0(ra).wrapping_add(self.gpr(rb)));
                self.finish_store(self.gpr(rs), addr, bus)
            }
            Op::Stwux { rs, ra, rb } => {
                let addr = Address(self.gpr0(ra).wrapping_add(self.gpr(rb)));
                let value = self.gpr(rs);
                if self.store(addr, value, bus) {
                    self.set_gpr(ra, addr.value());
                    ControlFlow::Next
                } else {
                    ControlFlow::Trap
                }
            }
            Op::Sthx { rs, ra, rb } => {
                let addr = Address(self.gpr0(ra).wrapping_add(self.gpr(rb)));
                self.finish_store(self.gpr(rs) as u16, addr, bus)
            }
            Op::Stbx { rs, ra, rb } => {
                let addr = Address(self.gpr0(ra).wrapping_add(self.gpr(rb)));
                self.finish_store(self.gpr(rs) as u8, addr, bus)
            }
            Op::Lfdx { ft, ra, rb } => {
                let addr = Address(self.gpr0(ra).wrapping_add(self.gpr(rb)));
                match self.load::<u64>(addr, bus) {
                    Some(v) => {
                        self.regs.user.fpr[ft as usize] = v;
                        ControlFlow::Next
                    }
                    None => ControlFlow::Trap,
                }
            }
            Op::Stfdx { fs, ra, rb } => {
                let addr = Address(self.gpr0(ra).wrapping_add(self.gpr(rb)));
                let value = self.regs.user.fpr[fs as usize];
                self.finish_store(value, addr, bus)
            }

            Op::Lmw { rt, ra, d } => {
                let base = Address(self.gpr0(ra).wrapping_add(d as u32));
                for i in rt..=31u8 {
                    let addr = base + (4 * (i - rt) as u32);
                    match self.load::<u32>(addr, bus) {
                        Some(v) => self.set_gpr(i, v),
                        None => return ControlFlow::Trap,
                    }
                }
                ControlFlow::Next
            }
            Op::Stmw { rs, ra, d } => {
                let base = Address(self.gpr0(ra).wrapping_add(d as u32));
                for i in rs..=31u8 {
                    let addr = base + (4 * (i - rs) as u32);
                    if !self.store(addr, self.gpr(i), bus) {
                        return ControlFlow::Trap;
                    }
                }
                ControlFlow::Next
            }
            Op::Lswi { rt, ra, nb } => {
                let base = Address(self.gpr0(ra));
                self.load_string(base, rt, if nb == 0 { 32 } else { nb as u32 }, bus)
            }
            Op::Stswi { rs, ra, nb } => {
                let base = Address(self.gpr0(ra));
                self.store_string(base, rs, if nb == 0 { 32 } else { nb as u32 }, bus)
            }
            Op::Lswx { rt, ra, rb } => {
                let base = Address(self.gpr0(ra).wrapping_add(self.gpr(rb)));
                let count = self.regs.user.xer.byte_count().value() as u32;
                self.load_string(base, rt, count, bus)
            }
            Op::Stswx { rs, ra, rb } => {
                let base = Address(self.gpr0(ra).wrapping_add(self.gpr(rb)));
                let count = self.regs.user.xer.byte_count().value() as u32;
                self.store_string(base, rs, count, bus)
            }

            Op::Lwarx { rt, ra, rb } => {
                let vaddr = Address(self.gpr0(ra).wrapping_add(self.gpr(rb)));
                let user = self.user_mode();
                let translation_enabled = self.translation_enabled(Access::Load);
                let mut guard = bus.lock();
                let translated = self.mmu.translate(
                    vaddr,
                    Access::Load,
                    translation_enabled,
                    user,
                    &self.regs.supervisor.memory,
                    &mut guard,
                );
                match translated {
                    Ok((phys, target)) => {
                        let value: u32 = match target {
                            Some(t) => guard.read_at(t, self).unwrap_or_default(),
                            None => guard.read(phys, self).unwrap_or_default(),
                        };
                        drop(guard);
                        self.reservation = Some(phys.value());
                        self.set_gpr(rt, value);
                        ControlFlow::Next
                    }
                    Err(err) => {
                        drop(guard);
                        self.raise_mmu_fault(err, false);
                        ControlFlow::Trap
                    }
                }
            }
            Op::Stwcx { rs, ra, rb } => {
                let vaddr = Address(self.gpr0(ra).wrapping_add(self.gpr(rb)));
                let user = self.user_mode();
                let translation_enabled = self.translation_enabled(Access::Store);
                let mut guard = bus.lock();
                let translated = self.mmu.translate(
                    vaddr,
                    Access::Store,
                    translation_enabled,
                    user,
                    &self.regs.supervisor.memory,
                    &mut guard,
                );
                match translated {
                    Ok((phys, target)) => {
                        let success = self.reservation == Some(phys.value());
                        if success {
                            let value = self.gpr(rs);
                            match target {
                                Some(t) => {
                                    let _ = guard.write_at(t, value, self);
                                }
                                None => {
                                    let _ = guard.write(phys, value, self);
                                }
                            }
                        }
                        drop(guard);
                        self.reservation = None;
                        let so = self.regs.user.xer.summary_overflow();
                        let mut cond = Cond::default();
                        cond.set_so(so);
                        cond.set_eq(success);
                        self.regs.user.cr.set_cr0(cond);
                        ControlFlow::Next
                    }
                    Err(err) => {
                        drop(guard);
                        self.reservation = None;
                        self.raise_mmu_fault(err, false);
                        ControlFlow::Trap
                    }
                }
            }

            Op::Sc => {
                self.raise(Exception::Syscall);
                ControlFlow::Trap
            }
            Op::Rfi => {
                if self.user_mode() {
                    return self.illegal();
                }
                let srr0 = self.regs.supervisor.exception.srr[0];
                let srr1 = self.regs.supervisor.exception.srr[1];
                self.regs.supervisor.msr = MachineState::from_bits(srr1);
                self.regs.pc = Address(srr0 & !0x3);
                self.reservation = None;
                ControlFlow::Trap
            }
            Op::Tw { to, ra, rb } => {
                let a = self.gpr(ra) as i32;
                let b = self.gpr(rb) as i32;
                self.trap_if(to, a, b)
            }
            Op::Twi { to, ra, simm } => {
                let a = self.gpr(ra) as i32;
                self.trap_if(to, a, simm)
            }
            Op::Sync | Op::Isync | Op::Eieio => ControlFlow::Next,

            Op::Mfmsr { rt } => {
                if self.user_mode() {
                    return self.illegal();
                }
                self.set_gpr(rt, msr_to_bits(self.regs.supervisor.msr));
                ControlFlow::Next
            }
            Op::Mtmsr { rs } => {
                if self.user_mode() {
                    return self.illegal();
                }
                self.regs.supervisor.msr = MachineState::from_bits(self.gpr(rs));
                ControlFlow::Next
            }
            Op::Mfspr { rt, spr } => {
                let Some(spr) = spr else { return self.illegal() };
                if spr.is_privileged() && self.user_mode() {
                    return self.illegal();
                }
                let value = self.read_spr(spr);
                self.set_gpr(rt, value);
                ControlFlow::Next
            }
            Op::Mtspr { rs, spr } => {
                let Some(spr) = spr else { return self.illegal() };
                if spr.is_privileged() && self.user_mode() {
                    return self.illegal();
                }
                let value = self.gpr(rs);
                self.write_spr(spr, value);
                ControlFlow::Next
            }
            Op::Mfsr { rt, sr } => {
                if self.user_mode() {
                    return self.illegal();
                }
                self.set_gpr(rt, self.regs.supervisor.memory.sr[sr as usize & 0xF]);
                ControlFlow::Next
            }
            Op::Mtsr { rs, sr } => {
                if self.user_mode() {
                    return self.illegal();
                }
                self.regs.supervisor.memory.sr[sr as usize & 0xF] = self.gpr(rs);
                self.mmu.invalidate_all();
                ControlFlow::Next
            }
            Op::Mfsrin { rt, rb } => {
                if self.user_mode() {
                    return self.illegal();
                }
                let idx = (self.gpr(rb) >> 28) & 0xF;
                self.set_gpr(rt, self.regs.supervisor.memory.sr[idx as usize]);
                ControlFlow::Next
            }
            Op::Mtsrin { rs, rb } => {
                if self.user_mode() {
                    return self.illegal();
                }
                let idx = (self.gpr(rb) >> 28) & 0xF;
                self.regs.supervisor.memory.sr[idx as usize] = self.gpr(rs);
                self.mmu.invalidate_all();
                ControlFlow::Next
            }
            Op::Tlbie { .. } => {
                if self.user_mode() {
                    return self.illegal();
                }
                self.mmu.invalidate_all();
                ControlFlow::Next
            }
        }
    }

    fn trap_if(&mut self, to: u8, a: i32, b: i32) -> ControlFlow {
        let au = a as u32;
        let bu = b as u32;
        let trap = (to & 0b10000 != 0 && a < b)
            || (to & 0b01000 != 0 && a > b)
            || (to & 0b00100 != 0 && a == b)
            || (to & 0b00010 != 0 && au < bu)
            || (to & 0b00001 != 0 && au > bu);
        if trap {
            self.raise(Exception::Program { srr1_bits: SRR1_TRAP });
            ControlFlow::Trap
        } else {
            ControlFlow::Next
        }
    }

    fn do_load<T: gekko::Primitive>(
        &mut self,
        ia: Address,
        ra: u8,
        d: i32,
        rt: u8,
        bus: &Mutex<Bus>,
        apply: impl FnOnce(&mut Self, u8, T),
    ) -> ControlFlow {
        let addr = Address(self.gpr0(ra).wrapping_add(d as u32));
        match self.load::<T>(addr, bus) {
            Some(v) => {
                apply(self, rt, v);
                self.log_access(ia, addr, 0, false);
                ControlFlow::Next
            }
            None => ControlFlow::Trap,
        }
    }

    fn do_load_update<T: gekko::Primitive>(
        &mut self,
        ia: Address,
        ra: u8,
        d: i32,
        rt: u8,
        bus: &Mutex<Bus>,
        apply: impl FnOnce(&mut Self, u8, T),
    ) -> ControlFlow {
        let addr = Address(self.gpr0(ra).wrapping_add(d as u32));
        match self.load::<T>(addr, bus) {
            Some(v) => {
                apply(self, rt, v);
                self.set_gpr(ra, addr.value());
                self.log_access(ia, addr, 0, false);
                ControlFlow::Next
            }
            None => ControlFlow::Trap,
        }
    }

    fn do_load_x<T: gekko::Primitive>(
        &mut self,
        ra: u8,
        rb: u8,
        rt: u8,
        bus: &Mutex<Bus>,
        apply: impl FnOnce(&mut Self, u8, T),
    ) -> ControlFlow {
        let addr = Address(self.gpr0(ra).wrapping_add(self.gpr(rb)));
        match self.load::<T>(addr, bus) {
            Some(v) => {
                apply(self, rt, v);
                ControlFlow::Next
            }
            None => ControlFlow::Trap,
        }
    }

    fn do_load_x_update<T: gekko::Primitive>(
        &mut self,
        ra: u8,
        rb: u8,
        rt: u8,
        bus: &Mutex<Bus>,
        apply: impl FnOnce(&mut Self, u8, T),
    ) -> ControlFlow {
        let addr = Address(self.gpr0(ra).wrapping_add(self.gpr(rb)));
        match self.load::<T>(addr, bus) {
            Some(v) => {
                apply(self, rt, v);
                self.set_gpr(ra, addr.value());
                ControlFlow::Next
            }
            None => ControlFlow::Trap,
        }
    }

    fn do_store<T: gekko::Primitive>(&mut self, ia: Address, ra: u8, d: i32, value: T, bus: &Mutex<Bus>) -> ControlFlow {
        let addr = Address(self.gpr0(ra).wrapping_add(d as u32));
        if self.store(addr, value, bus) {
            self.log_access(ia, addr, 0, true);
            ControlFlow::Next
        } else {
            ControlFlow::Trap
        }
    }

    fn do_store_update<T: gekko::Primitive>(
        &mut self,
        ia: Address,
        ra: u8,
        d: i32,
        value: T,
        bus: &Mutex<Bus>,
    ) -> ControlFlow {
        let addr = Address(self.gpr0(ra).wrapping_add(d as u32));
        if self.store(addr, value, bus) {
            self.set_gpr(ra, addr.value());
            self.log_access(ia, addr, 0, true);
            ControlFlow::Next
        } else {
            ControlFlow::Trap
        }
    }

    fn finish_store<T: gekko::Primitive>(&mut self, value: T, addr: Address, bus: &Mutex<Bus>) -> ControlFlow {
        if self.store(addr, value, bus) { ControlFlow::Next } else { ControlFlow::Trap }
    }

    fn load_string(&mut self, base: Address, rt: u8, count: u32, bus: &Mutex<Bus>) -> ControlFlow {
        let mut reg = rt;
        let mut shift = 24i32;
        let mut word = 0u32;
        for i in 0..count {
            let byte = match self.load::<u8>(base + i, bus) {
                Some(b) => b,
                None => return ControlFlow::Trap,
            };
            word |= (byte as u32) << shift;
            shift -= 8;
            if shift < 0 {
                self.set_gpr(reg, word);
                reg = (reg + 1) % 32;
                word = 0;
                shift = 24;
            }
        }
        if shift != 24 {
            self.set_gpr(reg, word);
        }
        ControlFlow::Next
    }

    fn store_string(&mut self, base: Address, rs: u8, count: u32, bus: &Mutex<Bus>) -> ControlFlow {
        let mut reg = rs;
        let mut shift = 24i32;
        for i in 0..count {
            let byte = (self.gpr(reg) >> shift) as u8;
            if !self.store(base + i, byte, bus) {
                return ControlFlow::Trap;
            }
            shift -= 8;
            if shift < 0 {
                reg = (reg + 1) % 32;
                shift = 24;
            }
        }
        ControlFlow::Next
    }
}

fn add_with_carry(a: u32, b: u32, carry_in: bool) -> (u32, bool) {
    let (r1, c1) = a.overflowing_add(b);
    let (r2, c2) = r1.overflowing_add(carry_in as u32);
    (r2, c1 || c2)
}

fn add_overflowed(a: i32, b: i32, result: i32) -> bool {
    ((a ^ result) & (b ^ result)) < 0
}

/// Overflow for `x - y = result`.
fn sub_overflowed(x: i32, y: i32, result: i32) -> bool {
    ((x ^ y) & (x ^ result)) < 0
}

fn arithmetic_shift_right(value: i32, shamt: u32) -> (i32, bool) {
    if shamt >= 32 {
        let result = if value < 0 { -1 } else { 0 };
        let carry = value < 0;
        (result, carry)
    } else {
        let result = value >> shamt;
        let mask = if shamt == 0 { 0 } else { (1i32 << shamt) - 1 };
        let carry = value < 0 && (value & mask) != 0;
        (result, carry)
    }
}

/// Classic PowerPC rotate mask: the inclusive bit range `mb..=me`, wrapping
/// around bit 0 when `mb > me`.
fn rotate_mask(mb: u8, me: u8) -> u32 {
    let m1 = u32::MAX >> mb;
    let m2 = u32::MAX << (31 - me);
    if mb <= me { m1 & m2 } else { m1 | m2 }
}

fn cond_to_nibble(c: Cond) -> u32 {
    (c.so() as u32) | ((c.eq() as u32) << 1) | ((c.gt() as u32) << 2) | ((c.lt() as u32) << 3)
}

fn nibble_to_cond(nibble: u32) -> Cond {
    let mut c = Cond::default();
    c.set_so(nibble & 1 != 0);
    c.set_eq(nibble & 2 != 0);
    c.set_gt(nibble & 4 != 0);
    c.set_lt(nibble & 8 != 0);
    c
}

fn cr_to_bits(cr: &CondReg) -> u32 {
    let mut bits = 0u32;
    for n in 0..8u8 {
        bits |= cond_to_nibble(cr.field(n)) << (4 * (7 - n as u32));
    }
    bits
}

fn set_cr_from_bits(cr: &mut CondReg, raw: u32, fxm: u8) {
    for n in 0..8u8 {
        if (fxm >> (7 - n)) & 1 != 0 {
            let nibble = (raw >> (4 * (7 - n as u32))) & 0xF;
            cr.set_field(n, nibble_to_cond(nibble));
        }
    }
}

fn xer_to_bits(xer: &XerReg) -> u32 {
    let mut bits = xer.byte_count().value() as u32;
    bits |= (xer.carry() as u32) << 29;
    bits |= (xer.overflow() as u32) << 30;
    bits |= (xer.summary_overflow() as u32) << 31;
    bits
}

/// `bitos` doesn't expose a raw-value getter for scalar-bitfield structs, so
/// `mfmsr`/SRR1 packing is done by hand from the per-field accessors,
/// mirroring the bit positions declared on [`MachineState`].
fn msr_to_bits(msr: MachineState) -> u32 {
    let mut bits = 0u32;
    bits |= (msr.little_endian() as u32) << 0;
    bits |= (msr.recoverable_exception() as u32) << 1;
    bits |= (msr.data_addr_translation() as u32) << 3;
    bits |= (msr.instr_addr_translation() as u32) << 4;
    bits |= (msr.exception_prefix() as u32) << 6;
    bits |= (msr.float_exception_mode_1() as u32) << 8;
    bits |= (msr.single_step_trace() as u32) << 9;
    bits |= (msr.branch_trace() as u32) << 10;
    bits |= (msr.float_exception_mode_0() as u32) << 11;
    bits |= (msr.machine_check() as u32) << 12;
    bits |= (msr.float_available() as u32) << 13;
    bits |= (msr.user_mode() as u32) << 14;
    bits |= (msr.external_interrupts() as u32) << 15;
    bits |= (msr.exception_little_endian() as u32) << 16;
    bits |= (msr.power_management() as u32) << 18;
    bits
}

/// Same rationale as [`msr_to_bits`]: pack a `Bat`'s two halves by hand from
/// its field accessors, grounded on the bit ranges declared on [`Bat`].
fn bat_upper(bat: &Bat) -> u32 {
    let mut bits = 0u32;
    bits |= bat.user_mode() as u32;
    bits |= (bat.supervisor_mode() as u32) << 1;
    bits |= (bat.block_length_mask().value() as u32) << 2;
    bits |= (bat.effective_address_region().value() as u32) << 17;
    bits
}

fn bat_lower(bat: &Bat) -> u32 {
    let mut bits = 0u32;
    bits |= bat.protection().value() as u32;
    bits |= (bat.wimg().value() as u32) << 3;
    bits |= (bat.physical_address_region().value() as u32) << 17;
    bits
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus::{RegionFlags, RegionKind};
    use gekko::PhysAddr;

    fn test_bus() -> Bus {
        let mut bus = Bus::new();
        bus.add_region("ram", PhysAddr::from(0u32), 0x10000, RegionKind::Ram, RegionFlags::default())
            .unwrap();
        bus
    }

    fn place(bus: &mut Bus, ia: u32, word: u32) {
        let mut scratch = ();
        bus.write::<u32>(PhysAddr::from(ia), word, &mut scratch).unwrap();
    }

    #[test]
    fn add_dot_sets_cr0_on_sign_change() {
        let mut bus = test_bus();
        place(&mut bus, 0, 0x7CA3_2215); // add. r5,r3,r4
        let bus = Mutex::new(bus);
        let mut cpu = Cpu::new();
        cpu.regs.user.gpr[3] = 0x7FFF_FFFF;
        cpu.regs.user.gpr[4] = 1;

        cpu.step(&bus);

        assert_eq!(cpu.regs.user.gpr[5], 0x8000_0000);
        let cr0 = cpu.regs.user.cr.cr0();
        assert!(cr0.lt());
        assert!(!cr0.gt());
        assert!(!cr0.eq());
    }

    #[test]
    fn addc_sets_carry_on_wraparound() {
        let mut bus = test_bus();
        place(&mut bus, 0, 0x7CA3_2014); // addc r5,r3,r4
        let bus = Mutex::new(bus);
        let mut cpu = Cpu::new();
        cpu.regs.user.gpr[3] = 0xFFFF_FFFF;
        cpu.regs.user.gpr[4] = 0x0000_0001;

        cpu.step(&bus);

        assert_eq!(cpu.regs.user.gpr[5], 0);
        assert!(cpu.regs.user.xer.carry());
    }

    #[test]
    fn subfic_clears_carry_when_result_is_negative() {
        let mut bus = test_bus();
        place(&mut bus, 0, 0x2063_0003); // subfic r3,r3,3
        let bus = Mutex::new(bus);
        let mut cpu = Cpu::new();
        cpu.regs.user.gpr[3] = 5;

        cpu.step(&bus);

        assert_eq!(cpu.regs.user.gpr[3], 0xFFFF_FFFE);
        assert!(!cpu.regs.user.xer.carry());
    }

    #[test]
    fn bl_sets_link_register_to_the_return_address() {
        let mut bus = test_bus();
        place(&mut bus, 0x100, 0x4800_0005); // bl +4
        place(&mut bus, 0x104, 0x7C68_02A6); // mflr r3
        let bus = Mutex::new(bus);
        let mut cpu = Cpu::new();
        cpu.regs.pc = Address(0x100);

        cpu.step(&bus);
        assert_eq!(cpu.regs.pc, Address(0x104));
        assert_eq!(cpu.regs.user.lr, 0x104);

        cpu.step(&bus);
        assert_eq!(cpu.regs.user.gpr[3], 0x104);
    }

    #[test]
    fn rlwinm_extracts_a_byte_field() {
        let mut bus = test_bus();
        place(&mut bus, 0, 0x5464_C63E); // rlwinm r4,r3,24,24,31
        let bus = Mutex::new(bus);
        let mut cpu = Cpu::new();
        cpu.regs.user.gpr[3] = 0xAABB_CCDD;

        cpu.step(&bus);

        assert_eq!(cpu.regs.user.gpr[4], 0x0000_00BB);
    }

    #[test]
    fn unmapped_load_injects_a_data_storage_exception() {
        let mut bus = test_bus();
        place(&mut bus, 0, 0x8064_0000); // lwz r3,0(r4)
        let bus = Mutex::new(bus);
        let mut cpu = Cpu::new();
        cpu.regs.supervisor.msr.set_data_addr_translation(true);
        cpu.regs.user.gpr[4] = 0xDEAD_0000;

        cpu.step(&bus);

        assert_eq!(cpu.regs.supervisor.exception.srr[0], 0);
        assert_eq!(cpu.regs.supervisor.exception.dar, 0xDEAD_0000);
        assert_ne!(cpu.regs.supervisor.exception.dsisr & gekko::regs::DSISR_NOT_FOUND, 0);
        assert_ne!(cpu.regs.supervisor.exception.dsisr & 0x4000_0000, 0);
        assert_eq!(cpu.regs.pc, Address(0x0000_0300));
    }

    #[test]
    fn decrementer_underflow_fires_exactly_one_exception() {
        let mut bus = test_bus();
        for ia in (0..0x40).step_by(4) {
            place(&mut bus, ia, 0x6000_0000); // ori r0,r0,0 (nop-equivalent)
        }
        let bus = Mutex::new(bus);
        let mut cpu = Cpu::new();
        cpu.regs.supervisor.msr.set_external_interrupts(true);
        cpu.regs.supervisor.misc.decrementer = 1;

        cpu.step(&bus);
        assert_eq!(cpu.stats.timer_irqs, 1);
        assert_eq!(cpu.regs.pc, Address(0x0000_0900));

        cpu.regs.pc = Address(0x20);
        cpu.step(&bus);
        assert_eq!(cpu.stats.timer_irqs, 1);
    }

    #[test]
    fn breakpoint_is_recorded_without_altering_control_flow() {
        let mut bus = test_bus();
        place(&mut bus, 0, 0x6000_0000); // ori r0,r0,0
        let bus = Mutex::new(bus);
        let mut cpu = Cpu::new();
        cpu.add_breakpoint(Address(0));

        cpu.step(&bus);

        assert_eq!(cpu.breakpoint_hit, Some(Address(0)));
        assert_eq!(cpu.regs.pc, Address(4));
    }
}
