// build.rs

fn main() {
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_XLIB");

    // The mock-only build has nothing native to link.
    if std::env::var_os("CARGO_FEATURE_XLIB").is_none() {
        return;
    }

    // --- Link against libX11 ---
    // pkg-config is the standard way to find linker flags on Unix-like systems.
    // If it fails (not installed, or x11.pc missing) we fall back to a plain
    // -lX11 and hope the library sits in a default search path.
    match pkg_config::probe_library("x11") {
        Ok(_) => {
            eprintln!("pkg-config found x11. Linking configured automatically.");
        }
        Err(e) => {
            eprintln!(
                "pkg-config failed for library 'x11' ({}). Falling back to manual linking.",
                e
            );
            println!("cargo:rustc-link-lib=X11");
            println!("cargo:rustc-link-search=/usr/lib");
            eprintln!("Manual linking flags applied. Ensure the libX11 development package is installed.");
        }
    }
}
