//! Shared memory primitives
//!
//! Every structure that is shared between samplers and consumers lives in an
//! anonymous `MAP_SHARED` mapping so that it survives `fork()` and is visible
//! to all threads and child processes of the agent. Structures are laid out
//! with `#[repr(C)]` headers and refer to each other by offset, never by
//! pointer, so a mapping can be placed at any address.

use std::cell::UnsafeCell;
use std::io;
use std::ptr::NonNull;
use thiserror::Error;

/// Errors raised while setting up shared memory
#[derive(Debug, Error)]
pub enum ShmError {
    #[error("failed to map {size} bytes of shared memory: {source}")]
    Map { size: usize, source: io::Error },

    #[error("pthread call {call} failed with code {code}")]
    Mutex { call: &'static str, code: i32 },

    #[error("shared region too small: need {needed} bytes, have {available}")]
    TooSmall { needed: usize, available: usize },
}

/// An anonymous shared mapping, unmapped on drop
#[derive(Debug)]
pub struct SharedMapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain memory; concurrent access to its contents is
// governed by the atomics and locks of the structures placed inside it.
unsafe impl Send for SharedMapping {}
unsafe impl Sync for SharedMapping {}

impl SharedMapping {
    /// Map `len` zeroed bytes of shared anonymous memory
    pub fn anonymous(len: usize) -> Result<Self, ShmError> {
        if len == 0 {
            return Err(ShmError::TooSmall {
                needed: 1,
                available: 0,
            });
        }

        // SAFETY: anonymous mapping with no fixed address; the result is
        // checked against MAP_FAILED before use.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if raw == libc::MAP_FAILED {
            return Err(ShmError::Map {
                size: len,
                source: io::Error::last_os_error(),
            });
        }

        let ptr = NonNull::new(raw.cast::<u8>()).ok_or_else(|| ShmError::Map {
            size: len,
            source: io::Error::from(io::ErrorKind::OutOfMemory),
        })?;

        Ok(Self { ptr, len })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `ptr` points inside this mapping
    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.ptr.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr < start + self.len
    }
}

impl Drop for SharedMapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len are exactly what mmap returned.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

/// A process-shared pthread mutex placed inside a shared mapping
#[repr(C)]
pub struct ShmMutex {
    raw: UnsafeCell<libc::pthread_mutex_t>,
}

impl ShmMutex {
    /// Initialise a mutex in place with `PTHREAD_PROCESS_SHARED`
    ///
    /// # Safety
    ///
    /// `this` must point to writable memory large enough for a `ShmMutex`
    /// that no other thread is using yet.
    pub unsafe fn init(this: *mut ShmMutex) -> Result<(), ShmError> {
        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();

        check("pthread_mutexattr_init", libc::pthread_mutexattr_init(&mut attr))?;

        let shared = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if shared != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return check("pthread_mutexattr_setpshared", shared);
        }

        let init = libc::pthread_mutex_init((*this).raw.get(), &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        check("pthread_mutex_init", init)
    }

    /// Lock the mutex, unlocking when the guard drops
    pub fn lock(&self) -> ShmMutexGuard<'_> {
        // SAFETY: the mutex was initialised by `init` before the owning
        // structure was handed out.
        unsafe {
            libc::pthread_mutex_lock(self.raw.get());
        }
        ShmMutexGuard { mutex: self }
    }

    /// Destroy the mutex
    ///
    /// # Safety
    ///
    /// No thread may hold or wait on the mutex, and it must not be used again.
    pub unsafe fn destroy(&self) {
        libc::pthread_mutex_destroy(self.raw.get());
    }
}

pub struct ShmMutexGuard<'a> {
    mutex: &'a ShmMutex,
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard exists only while this thread holds the lock.
        unsafe {
            libc::pthread_mutex_unlock(self.mutex.raw.get());
        }
    }
}

fn check(call: &'static str, code: i32) -> Result<(), ShmError> {
    if code == 0 {
        Ok(())
    } else {
        Err(ShmError::Mutex { call, code })
    }
}

/// Round `value` up to the next multiple of `align` (a power of two)
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
