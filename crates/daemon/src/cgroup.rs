// SPDX-License-Identifier: MIT

//! Control-group identity (spec.md §4.E).
//!
//! One-time discovery at startup of the unified cgroup-v2 mount, then
//! `path_to_id` translates a scope's `ControlGroup` path into the 64-bit id
//! the kernel classifier keys its maps on.

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use traffic_limitd_core::DaemonError;

const CGROUP2_SUPER_MAGIC: i64 = 0x6367_7270;

/// Candidate unified-hierarchy mount points, tried in order (spec.md §4.E).
const CANDIDATE_ROOTS: &[&str] =
    &["/sys/fs/cgroup", "/sys/fs/cgroup/unified", "/sys/fs/cgroup/systemd"];

/// Abstraction over `path_to_id` (spec.md §4.E) the orchestrator drives.
/// Same adapter split as `ServiceManager`/`RateLimitTable`: production code
/// resolves against the real cgroup-v2 mount, tests drive a fake that needs
/// no mounted filesystem at all.
pub trait CgroupIdResolver: Send + Sync + 'static {
    fn path_to_id(&self, relative_path: &Path) -> Result<u64, DaemonError>;
}

/// An opened path-only handle onto the cgroup-v2 root, resolved once at
/// startup.
pub struct CgroupRoot {
    dir: OwnedFd,
    path: PathBuf,
}

impl CgroupRoot {
    /// Locate the unified cgroup-v2 mount. A legacy v1-only hierarchy has no
    /// candidate mounted as `cgroup2` and is reported as `NoMedium`.
    pub fn discover() -> Result<Self, DaemonError> {
        for candidate in CANDIDATE_ROOTS {
            let path = Path::new(candidate);
            if !path.is_dir() {
                continue;
            }
            match open_path_only(path) {
                Ok(fd) => {
                    if is_cgroup2(&fd)? {
                        return Ok(Self { dir: fd, path: path.to_path_buf() });
                    }
                }
                Err(_) => continue,
            }
        }
        Err(DaemonError::Internal(
            "no cgroup-v2 (unified) hierarchy mounted; legacy cgroup-v1-only host".to_string(),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Query the kernel for a file handle below the opened root directory;
    /// the handle's first 8 bytes ARE the cgroup id (spec.md §4.E
    /// `path_to_id`).
    pub fn path_to_id(&self, relative_path: &Path) -> Result<u64, DaemonError> {
        let c_path = path_to_cstring(relative_path)?;
        name_to_handle_id(self.dir.as_raw_fd(), &c_path)
    }
}

impl CgroupIdResolver for CgroupRoot {
    fn path_to_id(&self, relative_path: &Path) -> Result<u64, DaemonError> {
        CgroupRoot::path_to_id(self, relative_path)
    }
}

/// Test double: maps a `ControlGroup` path string to a chosen id without
/// touching any real filesystem (spec.md §8 scenarios 1/3/4 need no root,
/// systemd, or mounted cgroup-v2 hierarchy).
#[derive(Default)]
pub struct FakeCgroupIdResolver {
    next_id: std::sync::atomic::AtomicU64,
    assigned: parking_lot::Mutex<std::collections::HashMap<PathBuf, u64>>,
}

impl FakeCgroupIdResolver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CgroupIdResolver for FakeCgroupIdResolver {
    fn path_to_id(&self, relative_path: &Path) -> Result<u64, DaemonError> {
        let mut assigned = self.assigned.lock();
        if let Some(id) = assigned.get(relative_path) {
            return Ok(*id);
        }
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        assigned.insert(relative_path.to_path_buf(), id);
        Ok(id)
    }
}

/// `file_handle` is a variable-length struct: a fixed header followed by
/// `handle_bytes` bytes of opaque kernel data. We lay header + an 8-byte
/// trailer out in one contiguous buffer (handle-bytes pre-set to 8, per the
/// spec) rather than overlay a fixed-size `#[repr(C)]` struct onto it.
fn name_to_handle_id(dir_fd: RawFd, c_path: &CString) -> Result<u64, DaemonError> {
    #[repr(C)]
    struct Header {
        handle_bytes: libc::c_uint,
        handle_type: libc::c_int,
    }
    const BUF_LEN: usize = std::mem::size_of::<Header>() + 8;
    let mut buf = [0u8; BUF_LEN];
    {
        let header = Header { handle_bytes: 8, handle_type: 0 };
        // SAFETY: `buf` is large enough for `Header` followed by 8 bytes;
        // `Header` has no padding-sensitive invariants we rely on beyond its
        // field layout matching `libc::file_handle`'s leading fields.
        unsafe {
            std::ptr::write(buf.as_mut_ptr().cast::<Header>(), header);
        }
    }
    let mut mount_id: libc::c_int = 0;
    // SAFETY: `buf` points at a valid `file_handle`-shaped buffer whose
    // `handle_bytes` matches its trailing capacity; `dir_fd` is a valid,
    // open, path-only descriptor owned by `CgroupRoot` for its whole
    // lifetime.
    let rc = unsafe {
        libc::name_to_handle_at(
            dir_fd,
            c_path.as_ptr(),
            buf.as_mut_ptr().cast::<libc::file_handle>(),
            &mut mount_id,
            0,
        )
    };
    if rc != 0 {
        return Err(DaemonError::Cgroup(std::io::Error::last_os_error()));
    }
    let handle_bytes = &buf[std::mem::size_of::<Header>()..];
    Ok(u64::from_ne_bytes(handle_bytes[0..8].try_into().unwrap_or([0; 8])))
}

fn open_path_only(path: &Path) -> std::io::Result<OwnedFd> {
    let c_path = path_to_cstring(path)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "non-UTF8 path"))?;
    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_PATH | libc::O_DIRECTORY) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: `open` returned a valid owned descriptor on success.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn is_cgroup2(fd: &OwnedFd) -> Result<bool, DaemonError> {
    let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::fstatfs(fd.as_raw_fd(), &mut stat) };
    if rc != 0 {
        return Err(DaemonError::Cgroup(std::io::Error::last_os_error()));
    }
    Ok(stat.f_type as i64 == CGROUP2_SUPER_MAGIC)
}

fn path_to_cstring(path: &Path) -> Result<CString, DaemonError> {
    CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| DaemonError::Internal("cgroup path contains NUL byte".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_nul_byte_paths() {
        let bad = Path::new("abc\0def");
        assert!(path_to_cstring(bad).is_err());
    }

    #[test]
    fn fake_resolver_is_stable_per_path_and_distinct_across_paths() {
        let resolver = FakeCgroupIdResolver::new();
        let a = resolver.path_to_id(Path::new("/traffic-limitd-scope-aaa.scope")).unwrap();
        let a_again = resolver.path_to_id(Path::new("/traffic-limitd-scope-aaa.scope")).unwrap();
        let b = resolver.path_to_id(Path::new("/traffic-limitd-scope-bbb.scope")).unwrap();
        assert_eq!(a, a_again);
        assert_ne!(a, b);
    }
}
