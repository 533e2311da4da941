//! Host memory for recompiled code.
//!
//! The allocation primitive and the permission-toggle method are chosen once,
//! by probing what the host allows, and are reported as a [`DynCorePolicy`].
//! Generated code is only reachable through a [`CodeCache`], which moves
//! between three states:
//!
//! ```text
//! Uncommitted --begin_write--> Writable --commit--> Executable
//!                                  ^                    |
//!                                  +----begin_write-----+
//! ```
//!
//! The executable view exists only in `Executable`; the writable window
//! borrows the cache mutably, so the two can never be held at the same time.

use std::ops::{Deref, DerefMut};

use bitflags::bitflags;
use thiserror::Error;
use tracing::{debug, info};

#[cfg(unix)]
mod host;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DynCoreFlags: u8 {
        /// The host refuses pages that are writable and executable at once.
        const W_XOR_X = 0x1;
        /// No executable memory could be obtained; recompiling cores are off.
        const IMPOSSIBLE = 0x2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocMethod {
    #[default]
    None,
    VirtualAlloc,
    MmapAnon,
    Malloc,
    Memfd,
    SharedMem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermMethod {
    #[default]
    None,
    /// One mapping, read/write/execute at all times.
    Rwx,
    /// One mapping toggled with `mprotect` between RW and RX.
    MprotectRwRx,
    /// Two mappings of the same pages, one RW and one RX.
    DualRwX,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DynCorePolicy {
    pub alloc: AllocMethod,
    pub method: PermMethod,
    pub flags: DynCoreFlags,
}

impl DynCorePolicy {
    pub const fn new(alloc: AllocMethod, method: PermMethod, flags: DynCoreFlags) -> Self {
        Self { alloc, method, flags }
    }

    pub const fn impossible() -> Self {
        Self::new(AllocMethod::Malloc, PermMethod::None, DynCoreFlags::IMPOSSIBLE)
    }

    pub fn can_execute(&self) -> bool {
        !self.flags.contains(DynCoreFlags::IMPOSSIBLE)
    }
}

/// Host restrictions to honour (or simulate) while probing.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    pub deny_rwx: bool,
    pub deny_dual_mapping: bool,
    pub force_impossible: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Uncommitted,
    Writable,
    Executable,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("code cache size must be non-zero")]
    ZeroSize,
    #[error("code cache is {actual:?}, operation needs {expected:?}")]
    WrongState { actual: CacheState, expected: CacheState },
    #[error("{op} failed")]
    Host {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Page-aligned heap storage. Executable only if the host let us `mprotect`
/// it RWX in place.
struct HeapBuf {
    buf: Vec<u8>,
    start: usize,
    len: usize,
    rwx: bool,
}

impl HeapBuf {
    fn new(len: usize, page: usize) -> Self {
        let buf = vec![0u8; len + page];
        let start = buf.as_ptr().align_offset(page).min(page);
        Self {
            buf,
            start,
            len,
            rwx: false,
        }
    }

    fn bytes(&self) -> &[u8] {
        &self.buf[self.start..self.start + self.len]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.start..self.start + self.len]
    }

    #[cfg(unix)]
    fn make_executable(&mut self) -> bool {
        let p = self.bytes_mut().as_mut_ptr();
        self.rwx = host::reprotect(p, self.len, true);
        self.rwx
    }
}

impl Drop for HeapBuf {
    fn drop(&mut self) {
        // The allocator must get its pages back non-executable.
        #[cfg(unix)]
        if self.rwx {
            let p = self.bytes_mut().as_mut_ptr();
            host::reprotect(p, self.len, false);
        }
    }
}

enum Backing {
    Heap(HeapBuf),
    #[cfg(unix)]
    Mapped(host::Mapping),
}

impl Backing {
    fn heap(len: usize, page: usize) -> Self {
        Backing::Heap(HeapBuf::new(len, page))
    }
}

/// Capability over the code cache memory.
pub struct CodeCache {
    backing: Backing,
    policy: DynCorePolicy,
    state: CacheState,
    len: usize,
    /// Pages are currently mapped RX (mprotect method only).
    rx: bool,
    flushes: u64,
}

impl std::fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeCache")
            .field("policy", &self.policy)
            .field("state", &self.state)
            .field("len", &self.len)
            .finish()
    }
}

pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        host::page_size()
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

fn round_to_page(size: usize, page: usize) -> usize {
    size.div_ceil(page) * page
}

impl CodeCache {
    /// Probe the host and allocate `size` bytes (rounded up to whole pages).
    ///
    /// When no mapping can be had the cache falls back to heap memory made
    /// RWX in place. If even that is refused the cache is still returned,
    /// flagged [`DynCoreFlags::IMPOSSIBLE`].
    pub fn allocate(size: usize, options: &CacheOptions) -> Result<Self> {
        if size == 0 {
            return Err(CacheError::ZeroSize);
        }
        let page = page_size();
        let len = round_to_page(size, page);

        let (backing, policy) = if options.force_impossible {
            (Backing::heap(len, page), DynCorePolicy::impossible())
        } else {
            Self::probe(len, page, options)
        };
        info!(
            alloc = ?policy.alloc,
            method = ?policy.method,
            flags = ?policy.flags,
            size = len,
            "dyncore code cache"
        );
        Ok(Self {
            backing,
            policy,
            state: CacheState::Uncommitted,
            len,
            rx: false,
            flushes: 0,
        })
    }

    #[cfg(unix)]
    fn probe(len: usize, page: usize, options: &CacheOptions) -> (Backing, DynCorePolicy) {
        match host::Mapping::probe(len, options) {
            Some((mapping, policy)) => (Backing::Mapped(mapping), policy),
            None => Self::heap_fallback(len, page, options),
        }
    }

    #[cfg(unix)]
    fn heap_fallback(len: usize, page: usize, options: &CacheOptions) -> (Backing, DynCorePolicy) {
        let mut heap = HeapBuf::new(len, page);
        let policy = if !options.deny_rwx && heap.make_executable() {
            DynCorePolicy::new(AllocMethod::Malloc, PermMethod::Rwx, DynCoreFlags::empty())
        } else {
            DynCorePolicy::impossible()
        };
        (Backing::Heap(heap), policy)
    }

    #[cfg(not(unix))]
    fn probe(len: usize, page: usize, _options: &CacheOptions) -> (Backing, DynCorePolicy) {
        (Backing::heap(len, page), DynCorePolicy::impossible())
    }

    pub fn policy(&self) -> DynCorePolicy {
        self.policy
    }

    pub fn state(&self) -> CacheState {
        self.state
    }

    pub fn capacity(&self) -> usize {
        self.len
    }

    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    /// Open the cache for writing. Code cannot be executed until
    /// [`CodeCache::commit`].
    pub fn begin_write(&mut self) -> Result<WriteWindow<'_>> {
        if self.policy.method == PermMethod::MprotectRwRx {
            self.protect(false)?;
        }
        self.state = CacheState::Writable;
        let bytes: &mut [u8] = match &mut self.backing {
            Backing::Heap(heap) => heap.bytes_mut(),
            #[cfg(unix)]
            Backing::Mapped(mapping) => mapping.writable(),
        };
        Ok(WriteWindow { bytes })
    }

    /// Make written code executable.
    pub fn commit(&mut self) -> Result<()> {
        if self.state != CacheState::Writable {
            return Err(CacheError::WrongState {
                actual: self.state,
                expected: CacheState::Writable,
            });
        }
        if self.policy.method == PermMethod::MprotectRwRx {
            self.protect(true)?;
        }
        self.state = CacheState::Executable;
        Ok(())
    }

    /// Read-only view of committed code.
    pub fn exec_view(&self) -> Result<&[u8]> {
        if self.state != CacheState::Executable {
            return Err(CacheError::WrongState {
                actual: self.state,
                expected: CacheState::Executable,
            });
        }
        Ok(match &self.backing {
            Backing::Heap(heap) => heap.bytes(),
            #[cfg(unix)]
            Backing::Mapped(mapping) => mapping.executable(),
        })
    }

    /// Forget all generated code. The next write starts from scratch.
    pub fn flush(&mut self) {
        self.flushes += 1;
        if self.state != CacheState::Uncommitted {
            debug!(flushes = self.flushes, "code cache flushed");
        }
        // Pages that are RX stay RX until the next begin_write.
        self.state = CacheState::Uncommitted;
    }

    fn protect(&mut self, executable: bool) -> Result<()> {
        if self.rx == executable {
            return Ok(());
        }
        match &mut self.backing {
            #[cfg(unix)]
            Backing::Mapped(mapping) => mapping.protect(executable)?,
            Backing::Heap(_) => {}
        }
        self.rx = executable;
        Ok(())
    }
}

/// Exclusive writable access to the cache between `begin_write` and
/// `commit`.
pub struct WriteWindow<'a> {
    bytes: &'a mut [u8],
}

impl Deref for WriteWindow<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes
    }
}

impl DerefMut for WriteWindow<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_rounds_up_to_whole_pages() {
        let page = page_size();
        assert_eq!(round_to_page(1, page), page);
        assert_eq!(round_to_page(page, page), page);
        assert_eq!(round_to_page(page + 1, page), 2 * page);
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(matches!(
            CodeCache::allocate(0, &CacheOptions::default()),
            Err(CacheError::ZeroSize)
        ));
    }

    #[test]
    fn heap_backing_is_page_aligned() {
        let page = page_size();
        let heap = HeapBuf::new(page, page);
        assert_eq!(heap.bytes().as_ptr() as usize % page, 0);
        assert_eq!(heap.bytes().len(), page);
    }

    #[cfg(unix)]
    #[test]
    fn heap_fallback_is_rwx_or_impossible() {
        let page = page_size();
        let (mut backing, policy) = CodeCache::heap_fallback(page, page, &CacheOptions::default());
        if policy.can_execute() {
            assert_eq!(policy.alloc, AllocMethod::Malloc);
            assert_eq!(policy.method, PermMethod::Rwx);
            let Backing::Heap(heap) = &mut backing else {
                unreachable!()
            };
            assert!(heap.rwx);
            heap.bytes_mut()[0] = 0xc3;
            assert_eq!(heap.bytes()[0], 0xc3);
        } else {
            assert_eq!(policy, DynCorePolicy::impossible());
        }
    }

    #[cfg(unix)]
    #[test]
    fn heap_fallback_honours_deny_rwx() {
        let page = page_size();
        let opts = CacheOptions {
            deny_rwx: true,
            ..Default::default()
        };
        let (backing, policy) = CodeCache::heap_fallback(page, page, &opts);
        assert_eq!(policy, DynCorePolicy::impossible());
        let Backing::Heap(heap) = &backing else {
            unreachable!()
        };
        assert!(!heap.rwx);
    }

    #[test]
    fn commit_needs_an_open_window() {
        let opts = CacheOptions {
            force_impossible: true,
            ..Default::default()
        };
        let mut cache = CodeCache::allocate(64, &opts).unwrap();
        assert!(matches!(
            cache.commit(),
            Err(CacheError::WrongState {
                actual: CacheState::Uncommitted,
                expected: CacheState::Writable
            })
        ));
    }
}
