//! Dynamic binding to the libkrun family of hypervisor libraries.
//!
//! The backend is never a compile-time dependency: the library is opened by
//! soname at load time and every entry point is resolved by name at its
//! first use. The call surface lives behind the [`VmBackend`] trait so the
//! lifecycle code can run against a fake backend in tests.

use crate::error::HandlerError;
use crate::vmfile::KernelSpec;
use libloading::Library;
use nix::errno::Errno;
use std::ffi::CString;
use std::os::raw::c_char;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tracing::debug;

/// Soname of the standard backend.
pub const LIBKRUN: &str = "libkrun.so.1";
/// Soname of the confidential-compute (SEV) backend.
pub const LIBKRUN_SEV: &str = "libkrun-sev.so.1";

type CreateCtxFn = unsafe extern "C" fn() -> i32;
type SetLogLevelFn = unsafe extern "C" fn(u32) -> i32;
type SetKernelFn =
    unsafe extern "C" fn(u32, *const c_char, u32, *const c_char, *const c_char) -> i32;
type SetVmConfigFn = unsafe extern "C" fn(u32, u8, u32) -> i32;
type SetPathFn = unsafe extern "C" fn(u32, *const c_char) -> i32;
type StartEnterFn = unsafe extern "C" fn(u32) -> i32;

/// The entry points a usable krun backend has to provide.
///
/// Every call returns the backend's raw `i32` result; negative values are
/// negated error codes. [`BackendInstance`] translates them into
/// [`HandlerError::BackendCall`], callers normally go through it.
pub trait VmBackend {
    /// Identity used in diagnostics (the soname for a real backend).
    fn name(&self) -> &str;

    fn create_ctx(&self) -> Result<i32, HandlerError>;
    fn set_log_level(&self, level: u32) -> Result<i32, HandlerError>;
    fn set_kernel(&self, ctx: u32, kernel: &KernelSpec) -> Result<i32, HandlerError>;
    fn set_vm_config(&self, ctx: u32, vcpus: u8, ram_mib: u32) -> Result<i32, HandlerError>;
    fn set_root(&self, ctx: u32, root: &Path) -> Result<i32, HandlerError>;
    fn set_root_disk(&self, ctx: u32, disk: &Path) -> Result<i32, HandlerError>;
    fn set_workdir(&self, ctx: u32, workdir: &Path) -> Result<i32, HandlerError>;
    fn set_tee_config_file(&self, ctx: u32, config: &Path) -> Result<i32, HandlerError>;

    /// Blocks for the lifetime of the workload.
    fn start_enter(&self, ctx: u32) -> Result<i32, HandlerError>;

    fn close(self) -> Result<(), HandlerError>
    where
        Self: Sized;
}

/// Opens a backend library by soname.
///
/// Abstracted so tests can substitute a loader that hands out fake
/// backends or simulates a missing library.
pub trait BackendLoader {
    type Backend: VmBackend;

    fn open(&self, soname: &str) -> Result<Self::Backend, HandlerError>;
}

/// Production loader backed by the host dynamic linker.
pub struct DynamicLoader;

impl BackendLoader for DynamicLoader {
    type Backend = DynamicBackend;

    fn open(&self, soname: &str) -> Result<DynamicBackend, HandlerError> {
        let library = unsafe { Library::new(soname) }.map_err(|e| HandlerError::OpenLibrary {
            library: soname.to_string(),
            reason: e.to_string(),
        })?;
        debug!(library = soname, "opened backend library");
        Ok(DynamicBackend {
            library,
            name: soname.to_string(),
        })
    }
}

/// A krun backend bound through the dynamic linker.
#[derive(Debug)]
pub struct DynamicBackend {
    library: Library,
    name: String,
}

impl DynamicBackend {
    /// Resolves an entry point by name. A missing symbol is a configuration
    /// error naming the containing library, never silently ignored.
    fn sym<T>(&self, symbol: &'static str) -> Result<libloading::Symbol<'_, T>, HandlerError> {
        unsafe { self.library.get(symbol.as_bytes()) }.map_err(|_| HandlerError::MissingSymbol {
            library: self.name.clone(),
            symbol,
        })
    }

    fn set_path(&self, symbol: &'static str, ctx: u32, path: &Path) -> Result<i32, HandlerError> {
        let f = self.sym::<SetPathFn>(symbol)?;
        let path = cstring_path(path)?;
        Ok(unsafe { f(ctx, path.as_ptr()) })
    }
}

impl VmBackend for DynamicBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_ctx(&self) -> Result<i32, HandlerError> {
        let f = self.sym::<CreateCtxFn>("krun_create_ctx")?;
        Ok(unsafe { f() })
    }

    fn set_log_level(&self, level: u32) -> Result<i32, HandlerError> {
        let f = self.sym::<SetLogLevelFn>("krun_set_log_level")?;
        Ok(unsafe { f(level) })
    }

    fn set_kernel(&self, ctx: u32, kernel: &KernelSpec) -> Result<i32, HandlerError> {
        let f = self.sym::<SetKernelFn>("krun_set_kernel")?;
        let path = cstring(&kernel.path)?;
        let initrd = kernel.initrd.as_deref().map(cstring).transpose()?;
        let cmdline = kernel.cmdline.as_deref().map(cstring).transpose()?;
        Ok(unsafe {
            f(
                ctx,
                path.as_ptr(),
                kernel.format,
                opt_ptr(&initrd),
                opt_ptr(&cmdline),
            )
        })
    }

    fn set_vm_config(&self, ctx: u32, vcpus: u8, ram_mib: u32) -> Result<i32, HandlerError> {
        let f = self.sym::<SetVmConfigFn>("krun_set_vm_config")?;
        Ok(unsafe { f(ctx, vcpus, ram_mib) })
    }

    fn set_root(&self, ctx: u32, root: &Path) -> Result<i32, HandlerError> {
        self.set_path("krun_set_root", ctx, root)
    }

    fn set_root_disk(&self, ctx: u32, disk: &Path) -> Result<i32, HandlerError> {
        self.set_path("krun_set_root_disk", ctx, disk)
    }

    fn set_workdir(&self, ctx: u32, workdir: &Path) -> Result<i32, HandlerError> {
        self.set_path("krun_set_workdir", ctx, workdir)
    }

    fn set_tee_config_file(&self, ctx: u32, config: &Path) -> Result<i32, HandlerError> {
        self.set_path("krun_set_tee_config_file", ctx, config)
    }

    fn start_enter(&self, ctx: u32) -> Result<i32, HandlerError> {
        let f = self.sym::<StartEnterFn>("krun_start_enter")?;
        Ok(unsafe { f(ctx) })
    }

    fn close(self) -> Result<(), HandlerError> {
        let name = self.name;
        self.library.close().map_err(|e| HandlerError::CloseLibrary {
            library: name,
            reason: e.to_string(),
        })
    }
}

/// A backend paired with the execution context it allocated.
///
/// Wraps every raw entry point with the negative-return translation: a
/// negative result becomes [`HandlerError::BackendCall`] carrying the
/// negated code as an errno.
#[derive(Debug)]
pub struct BackendInstance<B: VmBackend> {
    backend: B,
    ctx: u32,
}

impl<B: VmBackend> BackendInstance<B> {
    /// Acquires an execution context for a freshly opened backend.
    pub fn new(backend: B) -> Result<Self, HandlerError> {
        let ret = backend.create_ctx()?;
        if ret < 0 {
            return Err(HandlerError::BackendCall {
                library: backend.name().to_string(),
                operation: "krun_create_ctx",
                errno: Errno::from_raw(-ret),
            });
        }
        Ok(Self {
            backend,
            ctx: ret as u32,
        })
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn ctx(&self) -> u32 {
        self.ctx
    }

    fn check(&self, operation: &'static str, ret: i32) -> Result<i32, HandlerError> {
        if ret < 0 {
            return Err(HandlerError::BackendCall {
                library: self.backend.name().to_string(),
                operation,
                errno: Errno::from_raw(-ret),
            });
        }
        Ok(ret)
    }

    pub fn set_log_level(&self, level: u32) -> Result<(), HandlerError> {
        let ret = self.backend.set_log_level(level)?;
        self.check("krun_set_log_level", ret).map(|_| ())
    }

    pub fn set_kernel(&self, kernel: &KernelSpec) -> Result<(), HandlerError> {
        let ret = self.backend.set_kernel(self.ctx, kernel)?;
        self.check("krun_set_kernel", ret).map(|_| ())
    }

    pub fn set_vm_config(&self, vcpus: u8, ram_mib: u32) -> Result<(), HandlerError> {
        let ret = self.backend.set_vm_config(self.ctx, vcpus, ram_mib)?;
        self.check("krun_set_vm_config", ret).map(|_| ())
    }

    pub fn set_root(&self, root: &Path) -> Result<(), HandlerError> {
        let ret = self.backend.set_root(self.ctx, root)?;
        self.check("krun_set_root", ret).map(|_| ())
    }

    pub fn set_root_disk(&self, disk: &Path) -> Result<(), HandlerError> {
        let ret = self.backend.set_root_disk(self.ctx, disk)?;
        self.check("krun_set_root_disk", ret).map(|_| ())
    }

    pub fn set_workdir(&self, workdir: &Path) -> Result<(), HandlerError> {
        let ret = self.backend.set_workdir(self.ctx, workdir)?;
        self.check("krun_set_workdir", ret).map(|_| ())
    }

    pub fn set_tee_config_file(&self, config: &Path) -> Result<(), HandlerError> {
        let ret = self.backend.set_tee_config_file(self.ctx, config)?;
        self.check("krun_set_tee_config_file", ret).map(|_| ())
    }

    /// Blocking start. A non-negative return means the guest has exited
    /// and the value is its result.
    pub fn start_enter(&self) -> Result<i32, HandlerError> {
        let ret = self.backend.start_enter(self.ctx)?;
        self.check("krun_start_enter", ret)
    }

    /// Closes the underlying library. The execution context is owned by
    /// the backend process-wide and is reclaimed with it.
    pub fn close(self) -> Result<(), HandlerError> {
        self.backend.close()
    }
}

fn cstring(s: &str) -> Result<CString, HandlerError> {
    CString::new(s).map_err(|_| HandlerError::EmbeddedNul(s.to_string()))
}

fn cstring_path(path: &Path) -> Result<CString, HandlerError> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| HandlerError::EmbeddedNul(path.display().to_string()))
}

fn opt_ptr(s: &Option<CString>) -> *const c_char {
    s.as_ref().map_or(std::ptr::null(), |s| s.as_ptr())
}
