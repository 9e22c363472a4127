use core::{arch::asm, ptr};

use array_macro::array;

use crate::{
    param::NCPU,
    proc::{Context, Proc, ProcState},
    process::PROCESS_TABLE,
    register::{sstatus, tp},
    spinlock::SpinLockGuard,
};

pub static mut CPU_TABLE: CpuTable = CpuTable::new();

extern "C" {
    // swtch.S: save the callee-saved registers in old, load new.
    fn swtch(old: *mut Context, new: *const Context);
}

pub struct CpuTable {
    tables: [Cpu; NCPU],
}

impl CpuTable {
    const fn new() -> Self {
        Self {
            tables: array![_ => Cpu::new(); NCPU],
        }
    }

    /// Must be called with interrupts disabled to prevent a move to a
    /// different CPU between reading tp and using the result.
    #[inline]
    pub fn cpu_id() -> usize {
        unsafe { tp::read() }
    }

    /// Per-CPU scheduler loop, entered once per hart at boot and
    /// re-entered every time a process gives the CPU back.
    pub unsafe fn scheduler(&mut self) -> ! {
        let cpu = self.my_cpu_mut();

        loop {
            // give devices a chance to interrupt; wfi parks the hart
            // until the next one when there is nothing to run.
            sstatus::intr_on();

            match PROCESS_TABLE.find_runnable() {
                Some(p) => {
                    cpu.proc = p as *mut _;

                    let mut guard = p.inner.lock();
                    guard.state = ProcState::Running;

                    // the process releases this lock when it resumes
                    // on the other side of swtch, and re-acquires it
                    // before switching back here.
                    swtch(&mut cpu.scheduler as *mut _, p.data.get_mut().get_context());

                    cpu.proc = ptr::null_mut();
                    drop(guard);
                }
                None => {
                    asm!("wfi");
                }
            }
        }
    }

    /// Give the CPU to the scheduler, carrying the process lock
    /// across the switch. Returns with the same lock re-held once the
    /// scheduler runs this process again.
    pub unsafe fn sched<'a>(
        &mut self,
        guard: SpinLockGuard<'a, crate::proc::ProcInner>,
        ctx: *mut Context,
    ) -> SpinLockGuard<'a, crate::proc::ProcInner> {
        let cpu = self.my_cpu_mut();
        if cpu.noff != 1 {
            panic!("sched: holding locks");
        }
        if guard.state == ProcState::Running {
            panic!("sched: process running");
        }
        if sstatus::intr_get() {
            panic!("sched: interruptible");
        }

        let intena = cpu.intena;
        swtch(ctx, &cpu.scheduler as *const _);
        // this process may resume on a different hart.
        self.my_cpu_mut().intena = intena;

        guard
    }

    #[inline]
    pub fn my_cpu_mut(&mut self) -> &mut Cpu {
        let id = Self::cpu_id();
        &mut self.tables[id]
    }

    #[inline]
    fn my_cpu(&self) -> &Cpu {
        let id = Self::cpu_id();
        &self.tables[id]
    }

    /// The process running on this CPU. Panics on a hart that is
    /// sitting in the scheduler.
    pub fn my_proc(&mut self) -> &mut Proc {
        let _intr = IntrGuard::new();

        let c = self.my_cpu();
        if c.proc.is_null() {
            panic!("my_proc: no process on cpu {}", Self::cpu_id());
        }

        unsafe { &mut *c.proc }
    }

    /// Raw pointer to the current process; null while in the
    /// scheduler. Used where the caller only compares identities.
    pub fn my_proc_raw(&mut self) -> *mut Proc {
        let _intr = IntrGuard::new();
        self.my_cpu().proc
    }
}

pub struct Cpu {
    proc: *mut Proc,
    // saved scheduler context; sched() switches back to it.
    scheduler: Context,
    // depth of IntrGuard nesting on this CPU.
    noff: u8,
    // were interrupts enabled before the outermost IntrGuard?
    intena: bool,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            proc: ptr::null_mut(),
            scheduler: Context::new(),
            noff: 0,
            intena: false,
        }
    }
}

/// A scope during which interrupts are off on this CPU.
///
/// Guards nest: the first one saves the previous interrupt state and
/// the last one dropped restores it.
pub struct IntrGuard;

impl IntrGuard {
    pub fn new() -> Self {
        push_off();
        Self
    }
}

impl Drop for IntrGuard {
    fn drop(&mut self) {
        pop_off();
    }
}

/// Raise the interrupt-off nesting level, saving the interrupt state
/// at the outermost level. The spinlock hand-off across a context
/// switch pairs a push in one kernel thread with a pop in another, so
/// these stay callable outside `IntrGuard`.
pub fn push_off() {
    let old = sstatus::intr_get();
    unsafe {
        sstatus::intr_off();
    }

    let cpu = unsafe { CPU_TABLE.my_cpu_mut() };
    if cpu.noff == 0 {
        cpu.intena = old;
    }
    cpu.noff += 1;
}

pub fn pop_off() {
    let cpu = unsafe { CPU_TABLE.my_cpu_mut() };
    if sstatus::intr_get() {
        panic!("pop_off: interrupts on in a critical section");
    }
    if cpu.noff < 1 {
        panic!("pop_off: unbalanced");
    }
    cpu.noff -= 1;

    if cpu.noff == 0 && cpu.intena {
        unsafe {
            sstatus::intr_on();
        }
    }
}
