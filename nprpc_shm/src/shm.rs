// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Named POSIX shared-memory regions (`shm_open` + `mmap`).

use std::ffi::CString;
use std::io;
use std::ptr;

/// Open mode for shared memory segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmOpenMode {
    /// Create exclusively, fail if the name already exists.
    Create,
    /// Open existing, fail if it does not exist.
    Open,
}

/// A named, inter-process shared memory mapping.
///
/// The mapping is released on drop; the named object itself is only removed
/// by [`ShmRegion::unlink`], so the creating side decides the lifetime of
/// the backing storage.
pub struct ShmRegion {
    name: String,
    base: *mut u8,
    size: usize,
}

// The region is plain memory; all cross-process coordination happens via
// the atomics and pthread primitives placed inside it by the caller.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Acquire a named region of `size` bytes.
    ///
    /// In `Create` mode any stale object with the same name is unlinked
    /// first, the object is created with `O_EXCL` and truncated to `size`;
    /// the kernel guarantees the new pages read as zero.
    pub fn acquire(name: &str, size: usize, mode: ShmOpenMode) -> io::Result<Self> {
        let c_name = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in shm name"))?;

        let fd = unsafe {
            match mode {
                ShmOpenMode::Create => {
                    libc::shm_unlink(c_name.as_ptr());
                    let fd = libc::shm_open(
                        c_name.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                        0o600,
                    );
                    if fd < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::ftruncate(fd, size as libc::off_t) != 0 {
                        let e = io::Error::last_os_error();
                        libc::close(fd);
                        libc::shm_unlink(c_name.as_ptr());
                        return Err(e);
                    }
                    fd
                }
                ShmOpenMode::Open => {
                    let fd = libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o600);
                    if fd < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    fd
                }
            }
        };

        // When opening an existing object the caller does not know its
        // size; take it from the object itself.
        let size = if mode == ShmOpenMode::Open {
            let mut st: libc::stat = unsafe { std::mem::zeroed() };
            if unsafe { libc::fstat(fd, &mut st) } != 0 {
                let e = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(e);
            }
            st.st_size as usize
        } else {
            size
        };

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        // The mapping keeps its own reference to the object.
        unsafe { libc::close(fd) };

        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            name: name.to_string(),
            base: base as *mut u8,
            size,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the named object. Existing mappings stay valid until they are
    /// unmapped; new opens of the same name will fail.
    pub fn unlink(name: &str) {
        if let Ok(c_name) = CString::new(name) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}
