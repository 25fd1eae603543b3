use std::env;

fn main() {
    let arch = env::var("CARGO_CFG_TARGET_ARCH").expect("CARGO_CFG_TARGET_ARCH not set");
    let os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();

    // The linker script only applies to the bare-metal riscv64 target; host
    // builds (unit tests, tooling) link normally.
    if arch == "riscv64" && os == "none" {
        println!("cargo:rustc-link-arg=-Tkernel/kernel.ld");
        println!("cargo:rerun-if-changed=kernel.ld");
    }

    // Platform RAM size override, in MiB (mirrors the RAM_SIZE_MB make
    // parameter of the QEMU virt platform this kernel targets).
    println!("cargo:rerun-if-env-changed=CONFIG_RAM_SIZE_MB");
    if let Ok(mb) = env::var("CONFIG_RAM_SIZE_MB") {
        println!("cargo:rustc-env=COBALT_RAM_SIZE_MB={}", mb);
    }
}
