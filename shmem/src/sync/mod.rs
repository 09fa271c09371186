//! Process-shared pthread mutex and condition variable, constructed in place inside the
//! segment. `raw_sync` only offers locks and single-flag events, while the chat needs a
//! broadcast wake paired with the mutex guarding the message log.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;

use crate::errors::{ChatError, Result};

#[repr(C)]
pub struct SharedMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

impl SharedMutex {
    /// Initializes a mutex at `ptr` that can be locked from any process mapping it.
    ///
    /// # Safety
    /// `ptr` must be valid for writes and must not hold a mutex that is in use.
    pub unsafe fn init(ptr: *mut SharedMutex) -> Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        ChatError::check("pthread_mutexattr_init", libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
        let result = ChatError::check(
            "pthread_mutexattr_setpshared",
            libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED),
        )
        .and_then(|_| {
            ChatError::check(
                "pthread_mutex_init",
                libc::pthread_mutex_init(
                    ptr::addr_of_mut!((*ptr).inner) as *mut libc::pthread_mutex_t,
                    attr.as_ptr(),
                ),
            )
        });
        libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
        result
    }

    pub fn lock(&self) -> Result<()> {
        ChatError::check("pthread_mutex_lock", unsafe {
            libc::pthread_mutex_lock(self.inner.get())
        })
    }

    pub fn unlock(&self) -> Result<()> {
        ChatError::check("pthread_mutex_unlock", unsafe {
            libc::pthread_mutex_unlock(self.inner.get())
        })
    }
}

#[repr(C)]
pub struct SharedCondvar {
    inner: UnsafeCell<libc::pthread_cond_t>,
}

unsafe impl Send for SharedCondvar {}
unsafe impl Sync for SharedCondvar {}

impl SharedCondvar {
    /// # Safety
    /// Same contract as `SharedMutex::init`.
    pub unsafe fn init(ptr: *mut SharedCondvar) -> Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        ChatError::check("pthread_condattr_init", libc::pthread_condattr_init(attr.as_mut_ptr()))?;
        let result = ChatError::check(
            "pthread_condattr_setpshared",
            libc::pthread_condattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED),
        )
        .and_then(|_| {
            ChatError::check(
                "pthread_cond_init",
                libc::pthread_cond_init(
                    ptr::addr_of_mut!((*ptr).inner) as *mut libc::pthread_cond_t,
                    attr.as_ptr(),
                ),
            )
        });
        libc::pthread_condattr_destroy(attr.as_mut_ptr());
        result
    }

    /// Atomically releases `mutex` and sleeps until notified; `mutex` is held again on return.
    /// Wakes can be spurious, so callers wait in a loop on their own predicate.
    pub fn wait(&self, mutex: &SharedMutex) -> Result<()> {
        ChatError::check("pthread_cond_wait", unsafe {
            libc::pthread_cond_wait(self.inner.get(), mutex.inner.get())
        })
    }

    pub fn notify_all(&self) -> Result<()> {
        ChatError::check("pthread_cond_broadcast", unsafe {
            libc::pthread_cond_broadcast(self.inner.get())
        })
    }
}
