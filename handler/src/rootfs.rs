//! Descriptor-scoped access to the container root filesystem.
//!
//! Everything below the rootfs is controlled by the workload and cannot be
//! trusted: paths are resolved relative to an already-opened root
//! descriptor, and writes into the tree go through `openat2` with
//! `RESOLVE_BENEATH` so a planted symlink cannot redirect them to the host.

use crate::error::HandlerError;
use nix::errno::Errno;
use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Opens a path as an `O_PATH` location reference.
pub(crate) fn open_tree(path: &Path) -> Result<OwnedFd, HandlerError> {
    let cpath = cstring_path(path)?;
    let fd = unsafe {
        libc::open(
            cpath.as_ptr(),
            libc::O_PATH | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(HandlerError::Open {
            path: path.to_path_buf(),
            errno: Errno::last(),
        });
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Opens a directory relative to an already-opened descriptor.
pub(crate) fn open_dir_at(dirfd: &OwnedFd, name: &str) -> Result<OwnedFd, HandlerError> {
    let cname = cstring(name)?;
    let fd = unsafe {
        libc::openat(
            dirfd.as_raw_fd(),
            cname.as_ptr(),
            libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(HandlerError::Open {
            path: Path::new(name).to_path_buf(),
            errno: Errno::last(),
        });
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Opens `name` for writing strictly below `dirfd`.
///
/// Resolution refuses symlinks, magic links and any step above the
/// starting descriptor; the file is created read-only for every class.
pub(crate) fn create_beneath(dirfd: &OwnedFd, name: &str) -> Result<OwnedFd, Errno> {
    let cname = cstring(name).map_err(|_| Errno::EINVAL)?;
    let mut how: libc::open_how = unsafe { std::mem::zeroed() };
    how.flags = (libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_NOFOLLOW | libc::O_CLOEXEC)
        as u64;
    how.mode = 0o444;
    how.resolve = libc::RESOLVE_BENEATH | libc::RESOLVE_NO_SYMLINKS | libc::RESOLVE_NO_MAGICLINKS;
    let fd = unsafe {
        libc::syscall(
            libc::SYS_openat2,
            dirfd.as_raw_fd(),
            cname.as_ptr(),
            &how as *const libc::open_how,
            std::mem::size_of::<libc::open_how>(),
        )
    };
    if fd < 0 {
        return Err(Errno::last());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd as std::os::fd::RawFd) })
}

/// Whether this process already runs inside a user namespace. Decides how
/// device nodes have to be materialized (mknod is not permitted there).
pub(crate) fn running_in_user_namespace() -> bool {
    match std::fs::read_to_string("/proc/self/uid_map") {
        Ok(content) => {
            let fields: Vec<&str> = content.split_whitespace().collect();
            fields != ["0", "0", "4294967295"]
        }
        Err(_) => false,
    }
}

pub(crate) fn cstring(s: &str) -> Result<CString, HandlerError> {
    CString::new(s).map_err(|_| HandlerError::EmbeddedNul(s.to_string()))
}

pub(crate) fn cstring_path(path: &Path) -> Result<CString, HandlerError> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| HandlerError::EmbeddedNul(path.display().to_string()))
}
