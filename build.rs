fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src/entry.S");
    println!("cargo:rerun-if-changed=src/kernelvec.S");
    println!("cargo:rerun-if-changed=src/swtch.S");
    println!("cargo:rerun-if-changed=src/trampoline.S");
    println!("cargo:rerun-if-changed=src/kernel.ld");

    // assemble the boot/trap/context shims and link them statically.
    cc::Build::new()
        .file("src/entry.S")
        .file("src/kernelvec.S")
        .file("src/swtch.S")
        .file("src/trampoline.S")
        .flag("-march=rv64gc_zicsr_zifencei")
        .flag("-mabi=lp64d")
        .compile("asm");
}
