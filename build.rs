const STATIC_LIBS: &[&str] = &[
    "crypto",
    "cryptsetup",
    "devmapper",
    "json-c",
    "ssl",
    "tss2-esys",
    "tss2-mu",
    "tss2-sys",
    "uuid",
];

fn main() {
    println!("cargo:rerun-if-env-changed=TPM_NV_LUKS_BUILD_STATIC");
    let build_static = match std::env::var("TPM_NV_LUKS_BUILD_STATIC") {
        Ok(value) => matches!(value.to_lowercase().as_ref(), "1" | "y" | "yes" | "true"),
        Err(_) => false,
    };
    if !build_static {
        return;
    }

    // The keyscript only ever talks to /dev/tpmrm0, so the device TCTI is the
    // one loader we link in.
    println!("cargo:rustc-link-arg=-l:libc.a");
    println!("cargo:rustc-link-arg=-l:libtss2-tcti-device.a");
    for lib in STATIC_LIBS {
        println!("cargo:rustc-link-lib=static={lib}");
    }
    println!("cargo:rustc-link-search=/usr/lib");
    println!("cargo:rustc-link-search=/usr/local/ssl/lib");
}
