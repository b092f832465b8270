//! Host-OS glue: page-size discovery and filesystem probing.
//!
//! The distilled contract for the RAM mapper assumes a `host_page_size()`
//! collaborator is handed to it. This module is that collaborator, kept
//! separate from [`crate::ram`] so the mapper's alignment/guard logic stays
//! readable without libc plumbing mixed in.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::OnceLock;

use crate::ram::PageSize;

#[cfg(target_os = "linux")]
const HUGETLBFS_MAGIC: i64 = 0x958458f6;

/// sparc64 needs stricter alignment than its nominal page size.
#[cfg(target_arch = "sparc64")]
const VMALLOC_ALIGN: usize = 1 << 22;

static HOST_PAGE_SIZE: OnceLock<PageSize> = OnceLock::new();

/// The host's real (small) page size, as reported by `sysconf(_SC_PAGESIZE)`.
///
/// Cached after the first call: `sysconf` is a syscall on most platforms and
/// this value never changes for the lifetime of the process.
pub fn host_page_size() -> PageSize {
    *HOST_PAGE_SIZE.get_or_init(|| {
        let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let n = if n > 0 { n as usize } else { 4096 };
        PageSize(arch_override().unwrap_or(n))
    })
}

#[cfg(target_arch = "sparc64")]
fn arch_override() -> Option<usize> {
    Some(VMALLOC_ALIGN)
}

#[cfg(not(target_arch = "sparc64"))]
fn arch_override() -> Option<usize> {
    None
}

/// Probes `fd`'s filesystem; returns `Some(block_size)` if it is hugetlbfs.
///
/// Retries on `EINTR`, matching the source's `fstatfs` retry loop. Any other
/// error is returned to the caller, who decides fatality (the fd-based and
/// path-based callers differ on this).
#[cfg(target_os = "linux")]
pub fn fstatfs_is_hugetlbfs(fd: RawFd) -> io::Result<Option<PageSize>> {
    if fd < 0 {
        return Ok(None);
    }
    let mut fs: libc::statfs = unsafe { std::mem::zeroed() };
    loop {
        let ret = unsafe { libc::fstatfs(fd, &mut fs) };
        if ret == 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
    Ok(hugetlbfs_block_size(&fs))
}

#[cfg(not(target_os = "linux"))]
pub fn fstatfs_is_hugetlbfs(_fd: RawFd) -> io::Result<Option<PageSize>> {
    Ok(None)
}

/// Probes `path`'s filesystem; returns `Some(block_size)` if it is hugetlbfs.
#[cfg(target_os = "linux")]
pub fn statfs_is_hugetlbfs(path: &Path) -> io::Result<Option<PageSize>> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))?;
    let mut fs: libc::statfs = unsafe { std::mem::zeroed() };
    loop {
        let ret = unsafe { libc::statfs(c_path.as_ptr(), &mut fs) };
        if ret == 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
    Ok(hugetlbfs_block_size(&fs))
}

#[cfg(not(target_os = "linux"))]
pub fn statfs_is_hugetlbfs(_path: &Path) -> io::Result<Option<PageSize>> {
    Ok(None)
}

#[cfg(target_os = "linux")]
fn hugetlbfs_block_size(fs: &libc::statfs) -> Option<PageSize> {
    if fs.f_type == HUGETLBFS_MAGIC {
        Some(PageSize(fs.f_bsize as usize))
    } else {
        None
    }
}

/// Best-effort `/proc/self/fd/<fd>` readback, used only for diagnostics.
/// An unreadable link yields an empty string rather than an error, matching
/// the source's "don't let a diagnostic fail the operation" stance.
#[cfg(target_os = "linux")]
pub fn readlink_proc_fd(fd: RawFd) -> String {
    let link = format!("/proc/self/fd/{}", fd);
    std::fs::read_link(&link)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(not(target_os = "linux"))]
pub fn readlink_proc_fd(_fd: RawFd) -> String {
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_page_size_is_nonzero_power_of_two() {
        let p = host_page_size().0;
        assert!(p > 0);
        assert_eq!(p & (p - 1), 0);
    }

    #[test]
    fn host_page_size_is_stable() {
        assert_eq!(host_page_size(), host_page_size());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn statfs_on_tmp_succeeds_and_is_not_hugetlbfs() {
        // /tmp is essentially never hugetlbfs in a default CI container.
        let result = statfs_is_hugetlbfs(Path::new("/tmp"));
        assert!(result.is_ok());
    }

    #[test]
    fn readlink_proc_fd_on_invalid_fd_is_empty() {
        assert_eq!(readlink_proc_fd(-1), "");
    }
}
