use std::{
    ffi::{CStr, CString},
    marker::PhantomData,
    os::unix::ffi::OsStrExt,
    path::Path,
    ptr::{self, NonNull},
};

use libc::{c_char, c_int, c_uint};
use log::*;

use super::{
    EngineError, NativeLibrary, ScanOptions, ScanVerdict, CL_CLEAN, CL_SUCCESS, CL_VIRUS,
};

/// Single-owner wrapper around one native engine instance.
///
/// The handle is neither `Send` nor `Sync`: it is built, used and released
/// on the thread of the coordinator that owns it. `release` and `Drop` share
/// one free path that takes the pointer out first, so the native free runs
/// at most once and every call after it fails without touching native code.
pub struct EngineHandle<L: NativeLibrary> {
    engine: Option<NonNull<L::Engine>>,
    loaded: bool,
    compiled: bool,
    signatures: u32,
    _library: PhantomData<L>,
}

impl<L: NativeLibrary> EngineHandle<L> {
    pub fn create() -> Result<Self, EngineError> {
        let retc = L::init();
        if retc != CL_SUCCESS {
            return Err(EngineError::Allocation(L::strerror(retc)));
        }
        let engine = NonNull::new(L::engine_new())
            .ok_or_else(|| EngineError::Allocation("failed to create engine".to_string()))?;
        Ok(Self {
            engine: Some(engine),
            loaded: false,
            compiled: false,
            signatures: 0,
            _library: PhantomData,
        })
    }

    /// create + load_database + compile; the handle is ready to scan.
    pub fn build(db_path: &Path) -> Result<Self, EngineError> {
        let mut engine = Self::create()?;
        let signo = engine.load_database(db_path)?;
        engine.compile()?;
        info!(
            "[Engine] {} signatures loaded from {}",
            signo,
            db_path.display()
        );
        Ok(engine)
    }

    pub fn load_database(&mut self, db_path: &Path) -> Result<u32, EngineError> {
        let engine = self.live()?;
        let c_path = to_cstring(db_path).map_err(EngineError::Load)?;
        let mut signo: c_uint = 0;
        let retc = unsafe { L::load(engine.as_ptr(), &c_path, &mut signo) };
        if retc != CL_SUCCESS {
            return Err(EngineError::Load(L::strerror(retc)));
        }
        self.loaded = true;
        self.signatures += signo;
        Ok(signo)
    }

    pub fn compile(&mut self) -> Result<(), EngineError> {
        let engine = self.live()?;
        if !self.loaded {
            return Err(EngineError::NotInitialized);
        }
        let retc = unsafe { L::compile(engine.as_ptr()) };
        if retc != CL_SUCCESS {
            return Err(EngineError::Compile(L::strerror(retc)));
        }
        self.compiled = true;
        Ok(())
    }

    pub fn scan_path(
        &mut self,
        fpath: &Path,
        options: ScanOptions,
    ) -> Result<ScanVerdict, EngineError> {
        let engine = self.ready()?;
        let c_path = to_cstring(fpath).map_err(EngineError::Scan)?;
        let mut virus_name: *const c_char = ptr::null();
        let retc = unsafe { L::scan_file(engine.as_ptr(), &c_path, options, &mut virus_name) };
        Self::verdict(retc, virus_name)
    }

    pub fn scan_bytes(
        &mut self,
        buf: &[u8],
        options: ScanOptions,
    ) -> Result<ScanVerdict, EngineError> {
        let engine = self.ready()?;
        let mut virus_name: *const c_char = ptr::null();
        let retc = unsafe { L::scan_buffer(engine.as_ptr(), buf, options, &mut virus_name) };
        Self::verdict(retc, virus_name)
    }

    pub fn database_version(&self) -> Result<u64, EngineError> {
        let engine = self.live()?;
        let mut err: c_int = CL_SUCCESS;
        let version = unsafe { L::db_version(engine.as_ptr(), &mut err) };
        if err != CL_SUCCESS {
            return Err(EngineError::Query(L::strerror(err)));
        }
        Ok(version.max(0) as u64)
    }

    /// Frees the native engine. Safe to call any number of times.
    pub fn release(&mut self) {
        if let Some(engine) = self.engine.take() {
            unsafe { L::engine_free(engine.as_ptr()) };
            debug!("[Engine] native engine released");
        }
        self.loaded = false;
        self.compiled = false;
    }

    pub fn is_released(&self) -> bool {
        self.engine.is_none()
    }

    pub fn is_ready(&self) -> bool {
        self.engine.is_some() && self.loaded && self.compiled
    }

    pub fn signatures(&self) -> u32 {
        self.signatures
    }

    pub fn library_version() -> String {
        L::version()
    }

    #[cfg(test)]
    pub(crate) fn raw(&self) -> Option<*mut L::Engine> {
        self.engine.map(|engine| engine.as_ptr())
    }

    fn live(&self) -> Result<NonNull<L::Engine>, EngineError> {
        self.engine.ok_or(EngineError::InvalidHandle)
    }

    fn ready(&self) -> Result<NonNull<L::Engine>, EngineError> {
        let engine = self.live()?;
        if !(self.loaded && self.compiled) {
            return Err(EngineError::NotInitialized);
        }
        Ok(engine)
    }

    fn verdict(retc: c_int, virus_name: *const c_char) -> Result<ScanVerdict, EngineError> {
        match retc {
            CL_CLEAN => Ok(ScanVerdict::Clean),
            CL_VIRUS => {
                let name = if virus_name.is_null() {
                    String::new()
                } else {
                    unsafe { CStr::from_ptr(virus_name) }
                        .to_string_lossy()
                        .into_owned()
                };
                Ok(ScanVerdict::Infected(name))
            }
            tc => Err(EngineError::Scan(L::strerror(tc))),
        }
    }
}

impl<L: NativeLibrary> Drop for EngineHandle<L> {
    fn drop(&mut self) {
        self.release();
    }
}

fn to_cstring(path: &Path) -> Result<CString, String> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| format!("path {} contains a NUL byte", path.display()))
}
