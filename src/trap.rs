//! The trap core: every entry to the kernel funnels through here.
//!
//! Traps from user space arrive via the trampoline at usertrap();
//! traps while in the kernel arrive via kernelvec at kerneltrap().
//! The user path dispatches system calls, device interrupts and
//! timer ticks, and is where a pending kill finally takes effect;
//! the kernel path accepts only device and timer interrupts, since
//! anything else in supervisor mode is a kernel bug.

use core::mem;

use crate::{
    cpu::{CpuTable, CPU_TABLE},
    param::{self, TRAMPOLINE, TRAPFRAME},
    plic, println,
    proc::Event,
    process::PROCESS_TABLE,
    register::{
        scause::{self, ScauseType},
        sepc, sip, sstatus, stvec,
    },
    spinlock::SpinLock,
    uart,
    virtio::DISK,
};

extern "C" {
    fn kernelvec();
    fn uservec();
    fn userret();
    fn trampoline();
}

/// Install the kernel trap vector on this hart.
pub unsafe fn init_hart() {
    stvec::write(kernelvec as usize);
}

static TICKS: SpinLock<usize> = SpinLock::new(0, "time");

/// The global tick count, advanced by CPU 0's timer interrupt.
pub fn ticks_now() -> usize {
    let guard = TICKS.lock();
    let t = *guard;
    drop(guard);
    t
}

/// Sleep for n clock ticks. Fails with Interrupted if the process is
/// killed while waiting.
pub fn sleep_ticks(n: usize) -> crate::error::Result<()> {
    let mut guard = TICKS.lock();
    let start = *guard;
    while *guard - start < n {
        let p = unsafe { CPU_TABLE.my_proc() };
        if p.is_killed() {
            drop(guard);
            return Err(crate::error::KernelError::Interrupted);
        }
        guard = p.sleep(Event::Ticks, guard);
    }
    drop(guard);
    Ok(())
}

fn clock_intr() {
    let mut guard = TICKS.lock();
    *guard += 1;
    unsafe { PROCESS_TABLE.wakeup(Event::Ticks) };
    drop(guard);
}

/// Handle a trap from user space. Called from the trampoline with
/// the kernel page table already installed.
#[no_mangle]
pub unsafe fn usertrap() {
    if sstatus::is_from_supervisor() {
        panic!("usertrap: not from user mode");
    }

    // we're in the kernel now: traps go to kernelvec.
    stvec::write(kernelvec as usize);

    let p = CPU_TABLE.my_proc();
    let tf = p.data.get_mut().trapframe.as_mut().unwrap();
    // save the user program counter; a syscall or another trap on
    // this hart would clobber sepc.
    tf.epc = sepc::read();

    let mut timer_fired = false;

    match scause::get_type() {
        ScauseType::EnvCall => {
            if p.is_killed() {
                PROCESS_TABLE.exit(p, -1);
            }

            // sepc points at the ecall; return past it.
            tf.epc += 4;

            // an interrupt will change sepc and sstatus, which are
            // saved now, so it is safe to enable them.
            sstatus::intr_on();

            p.syscall();
        }
        ScauseType::IntSExt => {
            dev_intr();
        }
        ScauseType::IntSSoft => {
            // forwarded machine-mode timer interrupt.
            if CpuTable::cpu_id() == 0 {
                clock_intr();
            }
            sip::clear_ssip();
            timer_fired = true;
        }
        ScauseType::PageFault(addr) => {
            // no lazily-mapped regions: user faults are fatal.
            let pid = p.inner.lock().pid;
            println!("usertrap: page fault at {:#x} pid={}", addr, pid);
            p.set_killed();
        }
        ScauseType::Unknown(v) => {
            let pid = p.inner.lock().pid;
            println!("usertrap: unexpected scause {:#x} pid={}", v, pid);
            p.set_killed();
        }
    }

    if p.is_killed() {
        PROCESS_TABLE.exit(p, -1);
    }

    if timer_fired {
        // give up the CPU after a clock tick.
        p.yield_process();
    }

    user_trap_ret();
}

/// Return to user space through the trampoline.
pub unsafe fn user_trap_ret() -> ! {
    let p = CPU_TABLE.my_proc();

    // about to switch the trap destination back to uservec; no
    // interrupts until we're in user space again.
    sstatus::intr_off();

    let trampoline_uservec = TRAMPOLINE + (uservec as usize - trampoline as usize);
    stvec::write(trampoline_uservec);

    // the trapframe fields uservec needs on the next entry.
    let satp = p.data.get_mut().setup_user_ret();

    // sret targets user mode with interrupts enabled there.
    sstatus::prepare_user_ret();
    sepc::write(p.data.get_mut().get_epc());

    // jump to userret in the trampoline, which switches page tables
    // and restores the user registers.
    let trampoline_userret = TRAMPOLINE + (userret as usize - trampoline as usize);
    let userret_fn: extern "C" fn(usize, usize) -> ! = mem::transmute(trampoline_userret);
    userret_fn(TRAPFRAME, satp)
}

/// Traps from supervisor mode: device and timer interrupts only.
#[no_mangle]
pub unsafe fn kerneltrap() {
    // the handlers below may trap and clobber these; restore before
    // returning to kernelvec's sret.
    let saved_sepc = sepc::read();
    let saved_sstatus = sstatus::read();

    if !sstatus::is_from_supervisor() {
        panic!("kerneltrap: not from supervisor mode");
    }
    if sstatus::intr_get() {
        panic!("kerneltrap: interrupts enabled");
    }

    match scause::get_type() {
        ScauseType::IntSExt => {
            dev_intr();
        }
        ScauseType::IntSSoft => {
            if CpuTable::cpu_id() == 0 {
                clock_intr();
            }
            sip::clear_ssip();

            // a process running in kernel mode gives up the CPU too.
            let p = CPU_TABLE.my_proc_raw();
            if !p.is_null() {
                (*p).yield_process();
            }
        }
        ScauseType::EnvCall => {
            panic!("kerneltrap: ecall from supervisor mode, sepc={:#x}", saved_sepc);
        }
        ScauseType::PageFault(addr) => {
            panic!(
                "kerneltrap: page fault at {:#x}, sepc={:#x}",
                addr, saved_sepc
            );
        }
        ScauseType::Unknown(v) => {
            panic!("kerneltrap: scause {:#x}, sepc={:#x}", v, saved_sepc);
        }
    }

    sepc::write(saved_sepc);
    sstatus::write(saved_sstatus);
}

/// Route one external interrupt from the PLIC to its driver.
unsafe fn dev_intr() {
    let irq = plic::claim();

    match irq as usize {
        param::UART0_IRQ => uart::intr(),
        param::VIRTIO0_IRQ => DISK.intr(),
        0 => {} // spurious: another hart already claimed it
        _ => {
            println!("dev_intr: unexpected irq {}", irq);
        }
    }

    if irq != 0 {
        plic::complete(irq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn ticks_advance() {
        let start = ticks_now();
        // interrupts are on in test context; a timer tick arrives in
        // about a tenth of a second.
        while ticks_now() <= start {}
        assert!(ticks_now() > start);
    }

    #[test_case]
    fn sleep_returns_after_ticks() {
        let start = ticks_now();
        sleep_ticks(2).expect("sleep_ticks");
        assert!(ticks_now() >= start + 2);
    }
}
