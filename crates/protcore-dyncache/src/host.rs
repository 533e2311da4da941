//! `mmap`-backed code cache memory.

use std::io;
use std::ptr;
use std::slice;

use tracing::debug;

use crate::{AllocMethod, CacheError, CacheOptions, DynCoreFlags, DynCorePolicy, PermMethod};

pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

const PROT_RW: libc::c_int = libc::PROT_READ | libc::PROT_WRITE;
const PROT_RX: libc::c_int = libc::PROT_READ | libc::PROT_EXEC;
const PROT_RWX: libc::c_int = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;

fn map(len: usize, prot: libc::c_int, flags: libc::c_int, fd: libc::c_int) -> Option<*mut u8> {
    // SAFETY: a fresh mapping with a null hint cannot alias any live Rust object.
    let p = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, fd, 0) };
    if p == libc::MAP_FAILED {
        debug!(prot, error = %io::Error::last_os_error(), "mmap refused");
        None
    } else {
        Some(p.cast())
    }
}

fn unmap(p: *mut u8, len: usize) {
    // SAFETY: `p` was returned by `map` for `len` bytes and is not used afterwards.
    unsafe {
        libc::munmap(p.cast(), len);
    }
}

/// Flip memory the process already owns, such as a heap buffer, between RW
/// and RWX. `p` must be page aligned and cover `len` bytes of one allocation.
pub(crate) fn reprotect(p: *mut u8, len: usize, executable: bool) -> bool {
    let prot = if executable { PROT_RWX } else { PROT_RW };
    // SAFETY: the caller owns the whole page range exclusively.
    if unsafe { libc::mprotect(p.cast(), len, prot) } != 0 {
        debug!(prot, error = %io::Error::last_os_error(), "mprotect refused");
        return false;
    }
    true
}

/// One or two views of the same pages.
pub(crate) struct Mapping {
    rw: *mut u8,
    rx: *mut u8,
    len: usize,
    fd: Option<libc::c_int>,
}

// SAFETY: the mapping is owned exclusively and only reached through
// `&self`/`&mut self`, so moving it across threads is sound.
unsafe impl Send for Mapping {}

impl Mapping {
    fn single(p: *mut u8, len: usize, fd: Option<libc::c_int>) -> Self {
        Self { rw: p, rx: p, len, fd }
    }

    /// Try each allocation strategy in order of preference.
    pub(crate) fn probe(len: usize, options: &CacheOptions) -> Option<(Self, DynCorePolicy)> {
        let anon = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        if !options.deny_rwx {
            if let Some(p) = map(len, PROT_RWX, anon, -1) {
                let policy = DynCorePolicy::new(
                    AllocMethod::MmapAnon,
                    PermMethod::Rwx,
                    DynCoreFlags::empty(),
                );
                return Some((Self::single(p, len, None), policy));
            }
        }

        #[cfg(any(target_os = "linux", target_os = "android"))]
        if let Some(found) = Self::probe_memfd(len, options) {
            return Some(found);
        }

        // W^X host: make sure RX is possible at all, then work RW <-> RX.
        let probe = map(len, PROT_RX, anon, -1)?;
        unmap(probe, len);
        let p = map(len, PROT_RW, anon, -1)?;
        let policy = DynCorePolicy::new(
            AllocMethod::MmapAnon,
            PermMethod::MprotectRwRx,
            DynCoreFlags::W_XOR_X,
        );
        Some((Self::single(p, len, None), policy))
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn probe_memfd(len: usize, options: &CacheOptions) -> Option<(Self, DynCorePolicy)> {
        if options.deny_rwx && options.deny_dual_mapping {
            return None;
        }
        let name = b"protcore-code-cache\0";
        // SAFETY: the name is a NUL-terminated static string.
        let fd = unsafe { libc::memfd_create(name.as_ptr().cast(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            debug!(error = %io::Error::last_os_error(), "memfd_create refused");
            return None;
        }
        let close = |fd| {
            // SAFETY: `fd` was opened above and is closed exactly once.
            unsafe {
                libc::close(fd);
            }
        };
        let Ok(size) = libc::off_t::try_from(len) else {
            close(fd);
            return None;
        };
        // SAFETY: `fd` is a valid memfd owned by this function.
        if unsafe { libc::ftruncate(fd, size) } != 0 {
            close(fd);
            return None;
        }

        if !options.deny_rwx {
            if let Some(p) = map(len, PROT_RWX, libc::MAP_SHARED, fd) {
                let policy =
                    DynCorePolicy::new(AllocMethod::Memfd, PermMethod::Rwx, DynCoreFlags::empty());
                return Some((Self::single(p, len, Some(fd)), policy));
            }
        }
        if !options.deny_dual_mapping {
            if let Some(rx) = map(len, PROT_RX, libc::MAP_SHARED, fd) {
                if let Some(rw) = map(len, PROT_RW, libc::MAP_SHARED, fd) {
                    let mapping = Self { rw, rx, len, fd: Some(fd) };
                    if mapping.views_alias() {
                        let policy = DynCorePolicy::new(
                            AllocMethod::Memfd,
                            PermMethod::DualRwX,
                            DynCoreFlags::W_XOR_X,
                        );
                        return Some((mapping, policy));
                    }
                    // Dropping unmaps both views and closes the fd.
                    return None;
                }
                unmap(rx, len);
            }
        }
        close(fd);
        None
    }

    /// Check that a store through the RW view is visible through the RX view.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn views_alias(&self) -> bool {
        // SAFETY: both pointers map at least one byte of the same file page.
        unsafe {
            ptr::write_volatile(self.rw, 0xaa);
            let seen = ptr::read_volatile(self.rx);
            ptr::write_volatile(self.rw, 0);
            seen == 0xaa
        }
    }

    pub(crate) fn protect(&mut self, executable: bool) -> Result<(), CacheError> {
        let prot = if executable { PROT_RX } else { PROT_RW };
        // SAFETY: the range is exactly the mapping we own; no outstanding
        // borrows exist because this takes `&mut self`.
        if unsafe { libc::mprotect(self.rw.cast(), self.len, prot) } != 0 {
            return Err(CacheError::Host {
                op: "mprotect",
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    pub(crate) fn writable(&mut self) -> &mut [u8] {
        // SAFETY: the RW view covers `len` bytes and the exclusive borrow of
        // `self` prevents any other slice over it.
        unsafe { slice::from_raw_parts_mut(self.rw, self.len) }
    }

    pub(crate) fn executable(&self) -> &[u8] {
        // SAFETY: the RX view is readable for `len` bytes; writers need `&mut self`.
        unsafe { slice::from_raw_parts(self.rx, self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unmap(self.rw, self.len);
        if self.rx != self.rw {
            unmap(self.rx, self.len);
        }
        if let Some(fd) = self.fd {
            // SAFETY: the fd is owned by this mapping and closed once.
            unsafe {
                libc::close(fd);
            }
        }
    }
}
