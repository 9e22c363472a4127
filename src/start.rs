use core::arch::asm;

use crate::{param::NCPU, register};

// a boot stack for each hart; entry.S points sp here.
#[no_mangle]
static STACK0: [u8; 4096 * NCPU] = [0; 4096 * NCPU];

// scratch area per hart for the machine-mode timer interrupt handler.
#[no_mangle]
static mut TIMER_SCRATCH: [[usize; 5]; NCPU] = [[0; 5]; NCPU];

/// entry.S jumps here in machine mode on each hart, on STACK0.
#[no_mangle]
unsafe fn start() -> ! {
    // set MPP mode to supervisor, for mret.
    register::mstatus::set_mpp_supervisor();

    // set mepc to main, for mret.
    extern "Rust" {
        fn main();
    }
    register::mepc::write(main as usize);

    // disable paging for now.
    register::satp::write(0);

    // delegate all interrupts and exceptions to supervisor mode.
    register::medeleg::write(0xffff);
    register::mideleg::write(0xffff);
    register::sie::intr_on();

    // configure PMP to give supervisor mode access to all of physical
    // memory.
    register::pmp::allow_all();

    // ask for clock interrupts.
    timer_init();

    // keep each CPU's hartid in its tp register, for cpu_id().
    let id = register::mhartid::read();
    register::tp::write(id);

    // switch to supervisor mode and jump to main().
    asm!("mret");

    loop {}
}

/// arrange to receive timer interrupts in machine mode, which arrive
/// at timervec in kernelvec.S and are turned into supervisor software
/// interrupts for the trap handler.
unsafe fn timer_init() {
    let id = register::mhartid::read();

    // ask the CLINT for a timer interrupt.
    let interval = 1_000_000u64; // cycles; about 1/10th second in qemu.
    register::clint::add_mtimecmp(id, interval);

    // prepare information in scratch[] for timervec.
    // scratch[3]: address of the CLINT MTIMECMP register.
    // scratch[4]: the interval between timer interrupts.
    let scratch = &mut TIMER_SCRATCH[id];
    scratch[3] = register::clint::CLINT_MTIMECMP + 8 * id;
    scratch[4] = interval as usize;
    register::mscratch::write(scratch.as_ptr() as usize);

    // set the machine-mode trap handler.
    extern "C" {
        fn timervec();
    }
    register::mtvec::write(timervec as usize);

    // enable machine-mode interrupts.
    register::mstatus::intr_on();

    // enable the machine-mode timer interrupt.
    register::mie::enable_machine_timer_interrupt();
}
