#![no_std]
#![cfg_attr(test, no_main)]
#![feature(custom_test_frameworks)]
#![test_runner(crate::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![feature(alloc_error_handler)]
#![feature(allocator_api)]

extern crate alloc;

use core::{
    panic::PanicInfo,
    ptr,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    bio::BCACHE,
    cpu::{CpuTable, CPU_TABLE},
    param::{QEMU_EXIT_FAIL, QEMU_EXIT_SUCCESS, QEMU_TEST0},
    process::PROCESS_TABLE,
    virtio::DISK,
};

mod bio;
mod bmap;
mod console;
mod cpu;
mod error;
mod file;
mod fs;
mod kalloc;
mod kvm;
mod log;
mod page_table;
mod param;
mod plic;
pub mod printf;
mod proc;
mod process;
mod register;
mod sleeplock;
mod spinlock;
mod start;
mod superblock;
mod trap;
mod uart;
mod virtio;

/// Set on the first panic; freezes console output from other harts
/// so the backtrace stays readable.
pub static PANICKED: AtomicBool = AtomicBool::new(false);

static STARTED: AtomicBool = AtomicBool::new(false);

/// Kernel entry in supervisor mode, every hart. Hart 0 initializes
/// the world; the others wait, then switch on their own paging and
/// interrupts. Nobody returns: each hart ends up in its scheduler.
pub unsafe fn bootstrap() -> ! {
    let cpu_id = CpuTable::cpu_id();
    if cpu_id == 0 {
        console::init();
        println!();
        println!("opal kernel is booting");
        kalloc::heap_init(); // physical frame allocator
        kvm::init(); // build the kernel page table
        kvm::init_hart(); // turn on paging
        PROCESS_TABLE.init(); // process slots and kernel stacks
        trap::init_hart(); // install the kernel trap vector
        plic::init(); // set up the interrupt controller
        plic::init_hart(cpu_id); // ask the PLIC for device interrupts
        BCACHE.init(); // buffer cache
        DISK.lock().init(); // the emulated hard disk
        PROCESS_TABLE.user_init(); // first user process
        STARTED.store(true, Ordering::SeqCst);
    } else {
        while !STARTED.load(Ordering::SeqCst) {}
        println!("hart {} starting", cpu_id);
        kvm::init_hart();
        trap::init_hart();
        plic::init_hart(cpu_id);
    }

    CPU_TABLE.scheduler();
}

#[no_mangle]
fn abort() -> ! {
    panic!("abort");
}

#[cfg(test)]
#[panic_handler]
pub fn panic(info: &PanicInfo<'_>) -> ! {
    test_panic_handler(info)
}

pub fn test_panic_handler(info: &PanicInfo<'_>) -> ! {
    println!("failed: {}", info);
    PANICKED.store(true, Ordering::Relaxed);
    unsafe { ptr::write_volatile(QEMU_TEST0 as *mut u32, QEMU_EXIT_FAIL) };
    loop {}
}

pub fn test_runner(tests: &[&dyn Testable]) {
    println!("running {} kernel tests", tests.len());
    for test in tests {
        test.run();
    }

    println!("\x1b[0;32mall kernel tests finished!\x1b[0m");
    unsafe { ptr::write_volatile(QEMU_TEST0 as *mut u32, QEMU_EXIT_SUCCESS) };
}

pub trait Testable {
    fn run(&self);
}

impl<T> Testable for T
where
    T: Fn(),
{
    fn run(&self) {
        print!("{}...\t", core::any::type_name::<T>());
        self();
        println!("\x1b[0;32m[ok]\x1b[0m");
    }
}

#[cfg(test)]
#[no_mangle]
unsafe fn main() -> ! {
    bootstrap();
}

#[cfg(test)]
mod tests {
    #[test_case]
    fn trivial_assertion() {
        assert_eq!(1, 1);
    }
}
