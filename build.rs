#[cfg(feature = "clamav")]
mod bindings {
    use std::{env, path::PathBuf};

    pub const RUSTC_LINK_LIB: &str = "cargo:rustc-link-lib=";
    pub const RUSTC_LINK_SEARCH: &str = "cargo:rustc-link-search=native=";

    const BINDGEN_VARS: &[&str] = &[
        "CL_INIT_DEFAULT",
        "CL_DB_STDOPT",
        "CL_SCAN_GENERAL_ALLMATCHES",
        "CL_SCAN_GENERAL_COLLECT_METADATA",
        "CL_SCAN_GENERAL_HEURISTICS",
        "CL_SCAN_GENERAL_HEURISTIC_PRECEDENCE",
        "CL_SCAN_GENERAL_UNPRIVILEGED",
        "CL_SCAN_PARSE_ARCHIVE",
        "CL_SCAN_PARSE_MAIL",
        "CL_SCAN_PARSE_OLE2",
        "CL_SCAN_HEURISTIC_BROKEN",
        "cl_error_t_CL_SUCCESS",
        "cl_error_t_CL_CLEAN",
        "cl_error_t_CL_VIRUS",
        "cl_error_t_CL_EMEM",
        "cl_engine_field_CL_ENGINE_DB_VERSION",
    ];

    const BINDGEN_TYPES: &[&str] = &[
        "cl_engine",
        "cl_scan_options",
        "cl_fmap_t",
        "cl_error_t",
        "cl_engine_field",
    ];

    const BINDGEN_FUNCTIONS: &[&str] = &[
        "cl_init",
        "cl_retver",
        "cl_strerror",
        "cl_engine_new",
        "cl_engine_free",
        "cl_engine_get_num",
        "cl_load",
        "cl_engine_compile",
        "cl_fmap_open_memory",
        "cl_fmap_close",
        "cl_scanmap_callback",
        "cl_scanfile",
    ];

    pub fn build_and_link() {
        println!("cargo:rerun-if-changed=wrapper.h");
        println!("cargo:rerun-if-env-changed=CLAMAV_LIB_DIR");
        println!("cargo:rerun-if-env-changed=CLAMAV_INCLUDE_DIR");
        println!("cargo:rerun-if-env-changed=CLAMAV_STATIC");

        if let Ok(lib_dir) = env::var("CLAMAV_LIB_DIR") {
            println!("{}{}", RUSTC_LINK_SEARCH, lib_dir);
        }
        if env::var("CLAMAV_STATIC").is_ok() {
            println!("{}static=clamav_static", RUSTC_LINK_LIB);
        } else {
            println!("{}clamav", RUSTC_LINK_LIB);
        }

        let mut builder = bindgen::builder()
            .header("wrapper.h")
            .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()));
        if let Ok(include_dir) = env::var("CLAMAV_INCLUDE_DIR") {
            builder = builder.clang_arg(format!("-I{}", include_dir));
        }
        for &c_var in BINDGEN_VARS {
            builder = builder.allowlist_var(c_var);
        }
        for &c_function in BINDGEN_FUNCTIONS {
            builder = builder.allowlist_function(c_function);
        }
        for &c_type in BINDGEN_TYPES {
            builder = builder.allowlist_type(c_type);
        }

        let out = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
        builder
            .generate()
            .expect("unable to generate libclamav bindings")
            .write_to_file(out.join("clamav.rs"))
            .expect("unable to write libclamav bindings");
    }
}

fn main() {
    #[cfg(feature = "clamav")]
    bindings::build_and_link();
}
