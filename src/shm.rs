// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX shared-memory backing for cross-process buffers.
//!
//! Wraps `shm_open`/`ftruncate`/`mmap` to produce a [`crate::buffer::BufferBacking`] that
//! several processes can map and use to back the same [`crate::buffer::ByteRegion`].
//!
//! # Segment lifecycle
//!
//! 1. One process creates the segment with [`ShmSegment::create`].
//! 2. Any number of other processes open it with [`ShmSegment::open`].
//! 3. The mapping is unmapped automatically when a segment's last handle drops.
//! 4. The creator calls [`ShmSegment::unlink`] once no process needs the segment anymore.
//!
//! # Naming
//!
//! Segment names must start with `/` and contain no other `/`.

use crate::buffer::BufferBacking;
use crate::error::{AgronaError, Result};
use std::ffi::CString;
use std::io;
use std::ptr;

/// A mapped POSIX shared-memory segment.
///
/// Unmaps the region on drop. Does **not** unlink the segment — that is the creator's
/// responsibility, since other processes may still have it mapped.
pub struct ShmSegment {
    ptr: *mut u8,
    size: usize,
    name: String,
}

// SAFETY: `ptr` refers to memory shared across processes; all access to it goes through
// the atomic/bounds-checked `ByteRegion` API layered on top.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create a new shared-memory segment of `size` bytes, replacing any existing
    /// segment with the same name.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;
        let c_name = CString::new(name).map_err(|_| AgronaError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is a valid NUL-terminated string; shm_unlink is safe to call on
        // a name that doesn't exist (errors ignored); shm_open with O_CREAT|O_EXCL either
        // creates a fresh segment or fails, checked below.
        let fd = unsafe {
            libc::shm_unlink(c_name.as_ptr());
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 {
            return Err(AgronaError::SegmentCreate(io::Error::last_os_error()));
        }

        // SAFETY: fd is the valid descriptor returned above; size is caller-supplied and
        // ftruncate reports failure rather than corrupting state.
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is still open and not used again after this point.
            unsafe { libc::close(fd) };
            return Err(AgronaError::SegmentCreate(err));
        }

        // SAFETY: null base address lets the kernel choose a mapping; fd was just sized
        // by ftruncate above; PROT_READ|PROT_WRITE and MAP_SHARED are valid for a
        // writable mapping visible to other processes.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        // SAFETY: fd is valid; the mapping (success or failure) retains its own
        // reference, so closing fd here is safe either way.
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            return Err(AgronaError::Mmap(io::Error::last_os_error()));
        }

        // SAFETY: ptr is valid for `size` writable bytes from the successful mmap above,
        // and no other reference to this fresh segment exists yet.
        unsafe { ptr::write_bytes(ptr as *mut u8, 0, size) };

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            name: name.to_string(),
        })
    }

    /// Open an existing shared-memory segment.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;
        let c_name = CString::new(name).map_err(|_| AgronaError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is valid; O_RDWR opens an existing segment without creating one.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(AgronaError::NotFound(name.to_string()));
            }
            return Err(AgronaError::SegmentOpen(err));
        }

        // SAFETY: same reasoning as in `create`; `size` must match (or be smaller than)
        // the segment's actual size, which is the caller's contract.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        // SAFETY: see `create`.
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            return Err(AgronaError::Mmap(io::Error::last_os_error()));
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            name: name.to_string(),
        })
    }

    fn validate_name(name: &str) -> Result<()> {
        if !name.starts_with('/') {
            return Err(AgronaError::InvalidName(format!(
                "segment name must start with '/': {name}"
            )));
        }
        if name.len() > 1 && name[1..].contains('/') {
            return Err(AgronaError::InvalidName(format!(
                "segment name must not contain '/' after the prefix: {name}"
            )));
        }
        if name.len() > 255 {
            return Err(AgronaError::InvalidName(format!(
                "segment name too long (max 255): {name}"
            )));
        }
        Ok(())
    }

    /// Remove a segment's name. The underlying memory is freed once every process that
    /// has it mapped has dropped its [`ShmSegment`].
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = CString::new(name).map_err(|_| AgronaError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is valid; shm_unlink only touches the shared-memory namespace,
        // never the mapped memory itself, and is safe to call on a missing name.
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(AgronaError::SegmentOpen(err));
            }
        }
        Ok(())
    }

    /// Whether a segment with this name currently exists.
    #[must_use]
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = CString::new(name) else {
            return false;
        };
        // SAFETY: c_name is valid; O_RDONLY with no O_CREAT only probes for existence.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd >= 0 {
            // SAFETY: fd is a valid descriptor from the probe above, used once.
            unsafe { libc::close(fd) };
            true
        } else {
            false
        }
    }

    /// The segment's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl BufferBacking for ShmSegment {
    fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    fn len(&self) -> usize {
        self.size
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: self.ptr/self.size come from a successful mmap in create()/open() and
        // have not been unmapped before (Drop runs once). We deliberately do not unlink
        // here — other processes may still have this segment mapped.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}
