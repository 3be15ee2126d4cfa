//! In-process stand-in for libclamav used by the unit tests.
//!
//! Loads `*.ndb` files of `Name:TargetType:Offset:HexSig` lines and matches
//! the hex body as a literal byte string. An optional `version` file holds
//! the database version (unparsable contents make the version query fail);
//! a `fail-compile` marker makes `compile` fail.

use std::{
    collections::HashMap,
    ffi::{CStr, CString},
    fs,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use lazy_static::lazy_static;
use libc::{c_char, c_int, c_uint};
use parking_lot::Mutex;
use tempfile::TempDir;

use super::{NativeLibrary, ScanOptions, CL_CLEAN, CL_SUCCESS, CL_VIRUS};

pub const CL_EARG: c_int = 3;
pub const CL_EMALFDB: c_int = 4;
pub const CL_EOPEN: c_int = 8;
pub const CL_EREAD: c_int = 12;
pub const CL_EMEM: c_int = 20;

pub const EICAR: &[u8] =
    b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";
pub const EICAR_NAME: &str = "Eicar-Test-Signature";

lazy_static! {
    static ref FREED: Mutex<HashMap<u64, usize>> = Mutex::new(HashMap::new());
}
static NEXT_ENGINE: AtomicU64 = AtomicU64::new(1);

pub struct TestEngine {
    id: u64,
    signatures: Vec<(CString, Vec<u8>)>,
    version: Option<i64>,
    compiled: bool,
    fail_compile: bool,
}

pub struct TestLibrary;

unsafe impl NativeLibrary for TestLibrary {
    type Engine = TestEngine;

    fn init() -> c_int {
        CL_SUCCESS
    }

    fn engine_new() -> *mut TestEngine {
        Box::into_raw(Box::new(TestEngine {
            id: NEXT_ENGINE.fetch_add(1, Ordering::SeqCst),
            signatures: Vec::new(),
            version: Some(0),
            compiled: false,
            fail_compile: false,
        }))
    }

    unsafe fn engine_free(engine: *mut TestEngine) {
        let engine = Box::from_raw(engine);
        *FREED.lock().entry(engine.id).or_insert(0) += 1;
    }

    unsafe fn load(engine: *mut TestEngine, path: &CStr, signo: &mut c_uint) -> c_int {
        let engine = &mut *engine;
        let dir = PathBuf::from(std::ffi::OsStr::from_bytes(path.to_bytes()));
        let mut files: Vec<PathBuf> = match fs::read_dir(&dir) {
            Ok(rd) => rd
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().map_or(false, |ext| ext == "ndb"))
                .collect(),
            Err(_) => return CL_EOPEN,
        };
        if files.is_empty() {
            return CL_EOPEN;
        }
        files.sort();
        let mut loaded = Vec::new();
        for file in files {
            let content = match fs::read_to_string(&file) {
                Ok(c) => c,
                Err(_) => return CL_EREAD,
            };
            for line in content.lines().map(str::trim) {
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                match parse_signature(line) {
                    Some(sig) => loaded.push(sig),
                    None => return CL_EMALFDB,
                }
            }
        }
        if let Ok(v) = fs::read_to_string(dir.join("version")) {
            engine.version = v.trim().parse().ok();
        }
        engine.fail_compile = dir.join("fail-compile").exists();
        *signo += loaded.len() as c_uint;
        engine.signatures.extend(loaded);
        CL_SUCCESS
    }

    unsafe fn compile(engine: *mut TestEngine) -> c_int {
        let engine = &mut *engine;
        if engine.fail_compile {
            return CL_EMEM;
        }
        engine.compiled = true;
        CL_SUCCESS
    }

    unsafe fn scan_file(
        engine: *mut TestEngine,
        path: &CStr,
        options: ScanOptions,
        virname: &mut *const c_char,
    ) -> c_int {
        match fs::read(Path::new(std::ffi::OsStr::from_bytes(path.to_bytes()))) {
            Ok(buf) => Self::scan_buffer(engine, &buf, options, virname),
            Err(_) => CL_EOPEN,
        }
    }

    unsafe fn scan_buffer(
        engine: *mut TestEngine,
        buf: &[u8],
        _options: ScanOptions,
        virname: &mut *const c_char,
    ) -> c_int {
        let engine = &*engine;
        if !engine.compiled {
            return CL_EARG;
        }
        for (name, pattern) in &engine.signatures {
            if buf.windows(pattern.len()).any(|w| w == pattern.as_slice()) {
                *virname = name.as_ptr();
                return CL_VIRUS;
            }
        }
        CL_CLEAN
    }

    unsafe fn db_version(engine: *mut TestEngine, err: &mut c_int) -> i64 {
        match (*engine).version {
            Some(version) => {
                *err = CL_SUCCESS;
                version
            }
            None => {
                *err = CL_EMALFDB;
                0
            }
        }
    }

    fn version() -> String {
        "test-0.0.1".to_string()
    }

    fn strerror(code: c_int) -> String {
        match code {
            CL_CLEAN => "No viruses detected",
            CL_VIRUS => "Virus(es) detected",
            CL_EARG => "Invalid argument passed to function",
            CL_EMALFDB => "Malformed database",
            CL_EOPEN => "Can't open file or directory",
            CL_EREAD => "Can't read file",
            CL_EMEM => "Can't allocate memory",
            _ => "Unknown error code",
        }
        .to_string()
    }
}

fn parse_signature(line: &str) -> Option<(CString, Vec<u8>)> {
    let mut fields = line.split(':');
    let name = fields.next()?;
    let hex = fields.last()?;
    if name.is_empty() || hex.is_empty() || hex.len() % 2 != 0 {
        return None;
    }
    let pattern = (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    Some((CString::new(name).ok()?, pattern))
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Writes one single-signature `.ndb` file into `dir`.
pub fn write_signature(dir: &Path, file: &str, name: &str, pattern: &[u8]) {
    fs::write(
        dir.join(file),
        format!("{}:0:*:{}\n", name, to_hex(pattern)),
    )
    .unwrap();
}

/// Scratch database directory holding the EICAR signature.
pub fn eicar_db() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_signature(dir.path(), "test.ndb", EICAR_NAME, EICAR);
    dir
}

pub fn engine_id(engine: *mut TestEngine) -> u64 {
    unsafe { (*engine).id }
}

pub fn free_count(id: u64) -> usize {
    FREED.lock().get(&id).copied().unwrap_or(0)
}
