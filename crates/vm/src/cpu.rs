//! A running CPU: the architectural state from [`engine::Cpu`], a
//! dedicated OS thread that steps it, and a companion thread that paces
//! its timer interrupt independently of instruction throughput.

use crate::Vm;
use engine::RunState;
use gekko::regs::{Bat, Pte};
use gekko::{Address, PhysAddr};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Which instruction set a [`Cpu`] executes. Only [`Arch::PowerPc32`] is
/// implemented; [`Arch::Mips64`] exists so platform wiring code can name
/// the processor family a slot expects without every caller matching on a
/// single-variant enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    PowerPc32,
    Mips64,
}

const DEFAULT_TIMER_HZ: u32 = 250;

/// An interruptible sleep: the timer thread waits here instead of
/// `thread::sleep`, so tearing a CPU down never waits out a full tick.
struct Parker {
    stop: Mutex<bool>,
    cv: Condvar,
}

impl Parker {
    fn new() -> Self {
        Self {
            stop: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Sleeps up to `duration` unless woken by [`Self::wake`]. Returns
    /// `false` once woken, so the caller's loop can exit promptly.
    fn sleep(&self, duration: Duration) -> bool {
        let mut stop = self.stop.lock();
        if *stop {
            return false;
        }
        self.cv.wait_for(&mut stop, duration);
        !*stop
    }

    fn wake(&self) {
        *self.stop.lock() = true;
        self.cv.notify_all();
    }
}

struct Shared {
    vm: Vm,
    core: Mutex<engine::Cpu>,
    timer_hz: AtomicU32,
}

/// One emulated CPU: its architectural state, the dedicated thread that
/// steps it, and the companion thread that raises its timer interrupt at a
/// fixed rate regardless of how fast the CPU thread is actually running.
pub struct Cpu {
    id: u32,
    arch: Arch,
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    parker: Arc<Parker>,
    worker: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

impl Cpu {
    pub fn new(vm: &Vm, arch: Arch, cpu_id: u32) -> Self {
        assert_eq!(arch, Arch::PowerPc32, "only PowerPC-32 execution is implemented");
        Self {
            id: cpu_id,
            arch,
            shared: Arc::new(Shared {
                vm: vm.clone(),
                core: Mutex::new(engine::Cpu::new()),
                timer_hz: AtomicU32::new(DEFAULT_TIMER_HZ),
            }),
            running: Arc::new(AtomicBool::new(false)),
            parker: Arc::new(Parker::new()),
            worker: None,
            timer: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Raises the external interrupt line. Safe to call from any thread;
    /// the brief lock this takes only ever contends with the stepping
    /// thread's own per-instruction critical section, never blocks on I/O.
    pub fn set_irq(&self) {
        self.shared.core.lock().set_irq();
    }

    pub fn clear_irq(&self) {
        self.shared.core.lock().clear_irq();
    }

    pub fn set_timer_frequency(&self, hz: u32) {
        self.shared.timer_hz.store(hz.max(1), Ordering::Relaxed);
    }

    pub fn set_idle_pc(&self, pc: Option<Address>) {
        self.shared.core.lock().set_idle_pc(pc);
    }

    /// Sets the program counter directly, for bring-up code that just
    /// loaded a boot image and needs to point the CPU at its entry point
    /// before the first [`Self::start`].
    pub fn set_pc(&self, pc: Address) {
        self.shared.core.lock().regs.pc = pc;
    }

    pub fn pc(&self) -> Address {
        self.shared.core.lock().regs.pc
    }

    pub fn add_breakpoint(&self, ia: Address) {
        self.shared.core.lock().add_breakpoint(ia);
    }

    pub fn remove_breakpoint(&self, ia: Address) {
        self.shared.core.lock().remove_breakpoint(ia);
    }

    /// Address of the last breakpoint hit, if the CPU is currently
    /// suspended at one. Cleared by [`Self::resume`].
    pub fn breakpoint_hit(&self) -> Option<Address> {
        self.shared.core.lock().breakpoint_hit
    }

    pub fn stats(&self) -> engine::Stats {
        self.shared.core.lock().stats
    }

    pub fn run_state(&self) -> RunState {
        self.shared.core.lock().state
    }

    /// Sets an instruction/data BAT register and invalidates the VTLB, as
    /// any BAT write must.
    pub fn set_bat(&self, instr: bool, index: usize, upper_word: u32, lower_word: u32) {
        let mut core = self.shared.core.lock();
        let raw = ((upper_word as u64) << 32) | lower_word as u64;
        let bat = Bat::from_bits(raw);
        let table = if instr {
            &mut core.regs.supervisor.memory.ibat
        } else {
            &mut core.regs.supervisor.memory.dbat
        };
        table[index] = bat;
        core.mmu.invalidate_all();
    }

    pub fn set_sdr1(&self, value: u32) {
        let mut core = self.shared.core.lock();
        core.regs.supervisor.memory.sdr1 = value;
        core.mmu.invalidate_all();
    }

    /// Installs a page-table-equivalent mapping directly into the
    /// segmented hashed page table backing the current `SDR1`, for
    /// bring-up code that wants to establish a mapping before the guest
    /// has built its own page table. Writes the first slot of the primary
    /// PTEG for the address, which is the one a freshly zeroed page table
    /// always has free.
    pub fn map_page(&self, vsid: u32, vaddr: Address, paddr: PhysAddr, wimg: u32, pp: u32) {
        let mut core = self.shared.core.lock();
        let sdr1 = core.regs.supervisor.memory.sdr1;
        let htab_base = (sdr1 & 0xFFFF_0000) as u64;
        let htab_mask = (((sdr1 & 0x1FF) << 16) | 0xFFC0) as u64;

        let page_index = (vaddr.value() >> 12) & 0xFFFF;
        let api = (page_index >> 10) & 0x3F;
        let rpn = (paddr.value() >> 12) as u32;
        let primary_hash = vsid ^ page_index;
        let pteg_addr = htab_base | (((primary_hash as u64) << 6) & htab_mask);

        let pte = Pte::pack(vsid, false, api, rpn, wimg, pp);
        let mut bus = self.shared.vm.bus().lock();
        let mut scratch = ();
        let _ = bus.write(PhysAddr::from(pteg_addr), pte.hi, &mut scratch);
        let _ = bus.write(PhysAddr::from(pteg_addr + 4), pte.lo, &mut scratch);
        drop(bus);

        core.mmu.invalidate_all();
    }

    /// Starts the dedicated execution thread and its timer companion.
    /// Idempotent: calling this on an already-started CPU is a no-op.
    pub fn start(&mut self) {
        if self.worker.is_some() {
            return;
        }

        self.running.store(true, Ordering::Relaxed);
        self.shared.core.lock().state = RunState::Running;

        let shared = self.shared.clone();
        let running = self.running.clone();
        let id = self.id;
        self.worker = Some(
            std::thread::Builder::new()
                .name(format!("cpu{id}"))
                .spawn(move || run_worker(shared, running))
                .expect("failed to spawn cpu thread"),
        );

        let shared = self.shared.clone();
        let running = self.running.clone();
        let parker = self.parker.clone();
        self.timer = Some(
            std::thread::Builder::new()
                .name(format!("cpu{id}-timer"))
                .spawn(move || run_timer(shared, running, parker))
                .expect("failed to spawn timer thread"),
        );
    }

    /// Halts the CPU permanently and joins both threads.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        self.shared.core.lock().state = RunState::Halted;
        self.parker.wake();

        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.timer.take() {
            let _ = handle.join();
        }
    }

    /// Suspends stepping without tearing down the threads; [`Self::resume`]
    /// continues from exactly where it left off.
    pub fn pause(&self) {
        let mut core = self.shared.core.lock();
        if core.state == RunState::Running {
            core.state = RunState::Suspended;
        }
    }

    pub fn resume(&self) {
        let mut core = self.shared.core.lock();
        core.breakpoint_hit = None;
        if core.state == RunState::Suspended {
            core.state = RunState::Running;
        }
    }
}

impl Drop for Cpu {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

fn run_worker(shared: Arc<Shared>, running: Arc<AtomicBool>) {
    while running.load(Ordering::Relaxed) {
        let mut core = shared.core.lock();
        match core.state {
            RunState::Halted => break,
            RunState::Suspended => {
                drop(core);
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            RunState::Running => {}
        }

        // step() locks the bus itself, once per fetch/load/store/MMIO
        // dispatch, so the bus is never held across a whole instruction.
        let outcome = core.step(shared.vm.bus());

        if core.breakpoint_hit.is_some() {
            core.state = RunState::Suspended;
        }

        if outcome == engine::StepOutcome::Idle {
            drop(core);
            std::thread::sleep(Duration::from_micros(200));
        }
    }
}

fn run_timer(shared: Arc<Shared>, running: Arc<AtomicBool>, parker: Arc<Parker>) {
    while running.load(Ordering::Relaxed) {
        let hz = shared.timer_hz.load(Ordering::Relaxed).max(1);
        let period = Duration::from_secs_f64(1.0 / hz as f64);
        let before = Instant::now();
        if !parker.sleep(period) {
            break;
        }
        if !running.load(Ordering::Relaxed) {
            break;
        }

        let mut core = shared.core.lock();
        if before.elapsed() > period.mul_f64(1.1) {
            core.stats.timer_drift += 1;
        }
        core.set_irq();
    }
}
