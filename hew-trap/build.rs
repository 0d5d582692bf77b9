//! Target capability detection for `hew-trap`.
//!
//! Emits `hew_trap_native` when the target OS/architecture pair has a
//! register-context layout we know how to read, and `hew_trap_mach` when the
//! kernel exception-port model is available.

/// OS/architecture pairs with a known fault-context layout.
const NATIVE_TARGETS: &[(&str, &[&str])] = &[
    ("linux", &["x86_64", "x86", "aarch64", "arm", "riscv64"]),
    ("android", &["x86_64", "x86", "aarch64", "arm"]),
    ("macos", &["x86_64", "aarch64"]),
    ("freebsd", &["x86_64", "aarch64"]),
    ("openbsd", &["x86_64", "aarch64"]),
    ("windows", &["x86_64", "aarch64"]),
];

fn main() {
    println!("cargo::rustc-check-cfg=cfg(hew_trap_native)");
    println!("cargo::rustc-check-cfg=cfg(hew_trap_mach)");
    println!("cargo:rerun-if-changed=build.rs");

    let os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();

    let native = NATIVE_TARGETS
        .iter()
        .any(|(o, arches)| *o == os && arches.contains(&arch.as_str()));
    if native {
        println!("cargo:rustc-cfg=hew_trap_native");
        if os == "macos" {
            println!("cargo:rustc-cfg=hew_trap_mach");
        }
    }
}
