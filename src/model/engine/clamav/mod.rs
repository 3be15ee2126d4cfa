#[allow(warnings, dead_code, non_upper_case_globals, non_camel_case_types, non_snake_case)]
mod clamav {
    include!(concat!(env!("OUT_DIR"), "/clamav.rs"));
}

use std::{
    ffi::{c_void, CStr},
    ptr,
};

use lazy_static::lazy_static;
use libc::{c_char, c_int, c_uint, c_ulong};

use super::{NativeLibrary, ScanOptions};

const GENERAL_MASK: u32 = clamav::CL_SCAN_GENERAL_ALLMATCHES
    | clamav::CL_SCAN_GENERAL_COLLECT_METADATA
    | clamav::CL_SCAN_GENERAL_HEURISTICS
    | clamav::CL_SCAN_GENERAL_HEURISTIC_PRECEDENCE
    | clamav::CL_SCAN_GENERAL_UNPRIVILEGED;

lazy_static! {
    static ref INIT_STATUS: c_int = unsafe { clamav::cl_init(clamav::CL_INIT_DEFAULT) as c_int };
}

/// libclamav behind the [`NativeLibrary`] seam.
pub struct ClamavLibrary;

fn scan_options(options: ScanOptions) -> clamav::cl_scan_options {
    let mask = options.bits();
    let mut opts = clamav::cl_scan_options {
        general: mask & GENERAL_MASK,
        parse: 0,
        heuristic: 0,
        mail: 0,
        dev: 0,
    };
    if options.contains(ScanOptions::ARCHIVE) {
        opts.parse |= clamav::CL_SCAN_PARSE_ARCHIVE;
    }
    if options.contains(ScanOptions::MAIL) {
        opts.parse |= clamav::CL_SCAN_PARSE_MAIL;
    }
    if options.contains(ScanOptions::OLE2) {
        opts.parse |= clamav::CL_SCAN_PARSE_OLE2;
    }
    if options.contains(ScanOptions::HEURISTIC_BROKEN) {
        opts.heuristic |= clamav::CL_SCAN_HEURISTIC_BROKEN;
    }
    opts
}

unsafe impl NativeLibrary for ClamavLibrary {
    type Engine = clamav::cl_engine;

    fn init() -> c_int {
        *INIT_STATUS
    }

    fn engine_new() -> *mut clamav::cl_engine {
        unsafe { clamav::cl_engine_new() }
    }

    unsafe fn engine_free(engine: *mut clamav::cl_engine) {
        clamav::cl_engine_free(engine);
    }

    unsafe fn load(engine: *mut clamav::cl_engine, path: &CStr, signo: &mut c_uint) -> c_int {
        clamav::cl_load(path.as_ptr(), engine, signo, clamav::CL_DB_STDOPT) as c_int
    }

    unsafe fn compile(engine: *mut clamav::cl_engine) -> c_int {
        clamav::cl_engine_compile(engine) as c_int
    }

    unsafe fn scan_file(
        engine: *mut clamav::cl_engine,
        path: &CStr,
        options: ScanOptions,
        virname: &mut *const c_char,
    ) -> c_int {
        let mut opts = scan_options(options);
        let mut scanned: c_ulong = 0;
        clamav::cl_scanfile(path.as_ptr(), virname, &mut scanned, engine, &mut opts) as c_int
    }

    unsafe fn scan_buffer(
        engine: *mut clamav::cl_engine,
        buf: &[u8],
        options: ScanOptions,
        virname: &mut *const c_char,
    ) -> c_int {
        let map = clamav::cl_fmap_open_memory(buf.as_ptr() as *const c_void, buf.len() as _);
        if map.is_null() {
            return clamav::cl_error_t_CL_EMEM as c_int;
        }
        let mut opts = scan_options(options);
        let mut scanned: c_ulong = 0;
        let retc = clamav::cl_scanmap_callback(
            map,
            ptr::null(),
            virname,
            &mut scanned,
            engine,
            &mut opts,
            ptr::null_mut(),
        );
        clamav::cl_fmap_close(map);
        retc as c_int
    }

    unsafe fn db_version(engine: *mut clamav::cl_engine, err: &mut c_int) -> i64 {
        clamav::cl_engine_get_num(engine, clamav::cl_engine_field_CL_ENGINE_DB_VERSION, err) as i64
    }

    fn version() -> String {
        unsafe { CStr::from_ptr(clamav::cl_retver()) }
            .to_string_lossy()
            .into_owned()
    }

    fn strerror(code: c_int) -> String {
        unsafe { CStr::from_ptr(clamav::cl_strerror(code as _)) }
            .to_string_lossy()
            .into_owned()
    }
}
