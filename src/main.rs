#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(opal_kernel::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::{panic::PanicInfo, sync::atomic::Ordering};

use opal_kernel::{println, PANICKED};

#[no_mangle]
unsafe fn main() -> ! {
    #[cfg(test)]
    test_main();
    opal_kernel::bootstrap();
}

#[panic_handler]
fn panic(info: &PanicInfo<'_>) -> ! {
    println!("panic: {}", info);
    PANICKED.store(true, Ordering::Relaxed);
    loop {}
}
