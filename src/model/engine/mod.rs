#[cfg(feature = "clamav")]
pub mod clamav;
pub mod handle;
#[cfg(test)]
pub(crate) mod testlib;

pub use handle::EngineHandle;

use std::ffi::CStr;

use libc::{c_char, c_int, c_uint};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Native return codes, libclamav numbering.
pub const CL_SUCCESS: c_int = 0;
pub const CL_CLEAN: c_int = 0;
pub const CL_VIRUS: c_int = 1;

pub const ENGINE_INVALID_ERROR: &str = "engine resource is invalid or has been freed";
pub const ENGINE_NOT_INITIALIZED_ERROR: &str = "engine not initialized with database";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine allocation failed: {0}")]
    Allocation(String),
    #[error("database load failed: {0}")]
    Load(String),
    #[error("engine compile failed: {0}")]
    Compile(String),
    #[error("{}", ENGINE_INVALID_ERROR)]
    InvalidHandle,
    #[error("{}", ENGINE_NOT_INITIALIZED_ERROR)]
    NotInitialized,
    #[error("scan failed: {0}")]
    Scan(String),
    #[error("database query failed: {0}")]
    Query(String),
    #[error("scan coordinator unavailable")]
    Unavailable,
}

/// Result of one scan call. Errors are never folded into `Clean`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "name", rename_all = "snake_case")]
pub enum ScanVerdict {
    Clean,
    Infected(String),
}

impl ScanVerdict {
    pub fn is_clean(&self) -> bool {
        matches!(self, ScanVerdict::Clean)
    }
}

/// Opaque scan-behaviour bitset handed to the native layer as is.
///
/// Known bit positions:
///
/// | bit   | meaning                              |
/// |-------|--------------------------------------|
/// | `0x1` | archive parsing                      |
/// | `0x2` | mail parsing                         |
/// | `0x4` | OLE2 container parsing               |
/// | `0x8` | broken-executable heuristic          |
///
/// libclamav additionally reads the low bits as its general flags
/// (all-matches, collect-metadata, heuristics, heuristic-precedence,
/// unprivileged).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanOptions(pub u32);

impl ScanOptions {
    pub const NONE: ScanOptions = ScanOptions(0);
    pub const ARCHIVE: u32 = 0x1;
    pub const MAIL: u32 = 0x2;
    pub const OLE2: u32 = 0x4;
    pub const HEURISTIC_BROKEN: u32 = 0x8;

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, bit: u32) -> bool {
        self.0 & bit == bit
    }
}

impl From<u32> for ScanOptions {
    fn from(bits: u32) -> Self {
        ScanOptions(bits)
    }
}

/// Raw entry points of a native, non thread-safe scanning library.
///
/// Every engine-taking function receives a pointer previously returned by
/// [`NativeLibrary::engine_new`] and not yet passed to
/// [`NativeLibrary::engine_free`].
///
/// # Safety
///
/// Implementors guarantee that `engine_new` returns either null or a pointer
/// that stays valid until `engine_free`, and that a virus name written through
/// `virname` stays readable until the next call on the same engine.
pub unsafe trait NativeLibrary: 'static {
    type Engine;

    /// Process-wide library initialisation. Called before every engine
    /// creation; implementors run the native init at most once.
    fn init() -> c_int;

    fn engine_new() -> *mut Self::Engine;

    unsafe fn engine_free(engine: *mut Self::Engine);

    unsafe fn load(engine: *mut Self::Engine, path: &CStr, signo: &mut c_uint) -> c_int;

    unsafe fn compile(engine: *mut Self::Engine) -> c_int;

    unsafe fn scan_file(
        engine: *mut Self::Engine,
        path: &CStr,
        options: ScanOptions,
        virname: &mut *const c_char,
    ) -> c_int;

    unsafe fn scan_buffer(
        engine: *mut Self::Engine,
        buf: &[u8],
        options: ScanOptions,
        virname: &mut *const c_char,
    ) -> c_int;

    unsafe fn db_version(engine: *mut Self::Engine, err: &mut c_int) -> i64;

    fn version() -> String;

    fn strerror(code: c_int) -> String;
}
