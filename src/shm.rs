// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 zenedge contributors
//
// File-backed shared memory mapping.
//
// The kernel peer maps the same regular file (typically under /dev/shm), so
// this is a plain open + mmap rather than a POSIX shm object. The region is
// exactly IPC_SHARED_MEM_SIZE bytes; it is never resized.

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU32;

use crate::error::{BridgeError, Result};
use crate::proto::IPC_SHARED_MEM_SIZE;

/// An owned read-write mapping of the shared region.
///
/// The mapping is process-shared by design: the kernel peer mutates ring
/// cursors and heap state concurrently. All cross-process cursors must be
/// accessed through [`atomic_u32`](Self::atomic_u32); bulk payload bytes go
/// through the raw copy helpers.
pub struct SharedMem {
    mem: *mut u8,
    len: usize,
    path: PathBuf,
}

// Safety: the region is shared between processes by design; the host side
// is single-threaded and all cursor fields are accessed atomically.
unsafe impl Send for SharedMem {}
unsafe impl Sync for SharedMem {}

impl SharedMem {
    /// Open the backing file at `path` and map it read-write.
    ///
    /// With `create` set, a missing file is created and zero-filled to the
    /// region size. An existing file must already be exactly the region
    /// size.
    pub fn open(path: &Path, create: bool) -> Result<Self> {
        let c_path = CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|e| BridgeError::Decode(format!("bad shm path: {e}")))?;

        let mut flags = libc::O_RDWR;
        if create {
            flags |= libc::O_CREAT;
        }
        let fd = unsafe { libc::open(c_path.as_ptr(), flags, 0o666 as libc::c_uint) };
        if fd == -1 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::NotFound {
                return Err(BridgeError::ShmMissing(path.to_path_buf()));
            }
            return Err(err.into());
        }

        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err.into());
        }

        if st.st_size == 0 {
            // Fresh file: size it to the full region.
            if unsafe { libc::ftruncate(fd, IPC_SHARED_MEM_SIZE as libc::off_t) } != 0 {
                let err = std::io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err.into());
            }
        } else if st.st_size as u64 != IPC_SHARED_MEM_SIZE as u64 {
            unsafe { libc::close(fd) };
            return Err(BridgeError::ShmSize {
                path: path.to_path_buf(),
                actual: st.st_size as u64,
                expected: IPC_SHARED_MEM_SIZE as u64,
            });
        }

        let mem = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                IPC_SHARED_MEM_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };

        if mem == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }

        Ok(Self {
            mem: mem as *mut u8,
            len: IPC_SHARED_MEM_SIZE,
            path: path.to_path_buf(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw pointer to byte `offset` of the region.
    ///
    /// # Panics
    /// Panics if `offset` is out of bounds.
    pub fn ptr_at(&self, offset: usize) -> *mut u8 {
        assert!(offset < self.len, "shm offset {offset:#x} out of bounds");
        unsafe { self.mem.add(offset) }
    }

    /// Shared-atomic view of the u32 at `offset`.
    ///
    /// # Panics
    /// Panics if `offset` is unaligned or out of bounds.
    pub fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        assert!(offset % 4 == 0, "shm offset {offset:#x} unaligned");
        assert!(offset + 4 <= self.len, "shm offset {offset:#x} out of bounds");
        unsafe { &*(self.mem.add(offset) as *const AtomicU32) }
    }

    /// Copy `buf.len()` bytes starting at `offset` into `buf`.
    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= self.len, "shm read past end");
        unsafe {
            std::ptr::copy_nonoverlapping(self.mem.add(offset), buf.as_mut_ptr(), buf.len());
        }
    }

    /// Copy `buf` into the region starting at `offset`.
    pub fn write_bytes(&self, offset: usize, buf: &[u8]) {
        assert!(offset + buf.len() <= self.len, "shm write past end");
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), self.mem.add(offset), buf.len());
        }
    }

    /// Zero `len` bytes starting at `offset`.
    pub fn zero_bytes(&self, offset: usize, len: usize) {
        assert!(offset + len <= self.len, "shm zero past end");
        unsafe {
            std::ptr::write_bytes(self.mem.add(offset), 0, len);
        }
    }

    /// Borrowed view of `len` bytes at `offset`.
    ///
    /// The view aliases memory the peer may write; callers must only use it
    /// for bytes whose ownership protocol guarantees quiescence (e.g. a
    /// blob the host just allocated, a ring slot between its publish and
    /// consume cursors).
    pub fn slice_at(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.len, "shm slice past end");
        unsafe { std::slice::from_raw_parts(self.mem.add(offset), len) }
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        self.read_bytes(offset, &mut buf);
        u32::from_le_bytes(buf)
    }

    pub fn write_u32(&self, offset: usize, value: u32) {
        self.write_bytes(offset, &value.to_le_bytes());
    }
}

impl Drop for SharedMem {
    fn drop(&mut self) {
        if self.mem.is_null() {
            return;
        }
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.len) };
    }
}
