// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Process-shared pthread mutex/condvar pairs placed inside a mapped
//! region. Only the blocking-read wakeup path uses these; the ring indices
//! themselves are plain atomics.

use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Initialise a `pthread_mutex_t` at `m` with `PTHREAD_PROCESS_SHARED` and
/// `PTHREAD_MUTEX_ROBUST` so a crashed peer cannot wedge the reader.
///
/// # Safety
/// `m` must point to writable memory of at least `pthread_mutex_t` size
/// that no thread is currently using as a mutex.
pub(crate) unsafe fn init_mutex(m: *mut libc::pthread_mutex_t) -> io::Result<()> {
    let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
    let mut eno = libc::pthread_mutexattr_init(&mut attr);
    if eno == 0 {
        eno = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
    }
    if eno == 0 {
        eno = libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
    }
    if eno == 0 {
        eno = libc::pthread_mutex_init(m, &attr);
    }
    libc::pthread_mutexattr_destroy(&mut attr);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }
    Ok(())
}

/// Initialise a `pthread_cond_t` at `c` with `PTHREAD_PROCESS_SHARED`.
///
/// # Safety
/// Same requirements as [`init_mutex`].
pub(crate) unsafe fn init_cond(c: *mut libc::pthread_cond_t) -> io::Result<()> {
    let mut attr: libc::pthread_condattr_t = std::mem::zeroed();
    let mut eno = libc::pthread_condattr_init(&mut attr);
    if eno == 0 {
        eno = libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
    }
    if eno == 0 {
        eno = libc::pthread_cond_init(c, &attr);
    }
    libc::pthread_condattr_destroy(&mut attr);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }
    Ok(())
}

/// Lock a process-shared mutex, recovering from a dead previous owner.
///
/// # Safety
/// `m` must point to a mutex initialised by [`init_mutex`].
pub(crate) unsafe fn lock(m: *mut libc::pthread_mutex_t) -> io::Result<()> {
    let eno = libc::pthread_mutex_lock(m);
    match eno {
        0 => Ok(()),
        libc::EOWNERDEAD => {
            // Previous owner died while holding the lock; the protected
            // state is just the condvar wait, so mark consistent and go on.
            libc::pthread_mutex_consistent(m);
            Ok(())
        }
        _ => Err(io::Error::from_raw_os_error(eno)),
    }
}

/// # Safety
/// `m` must be locked by the calling thread.
pub(crate) unsafe fn unlock(m: *mut libc::pthread_mutex_t) -> io::Result<()> {
    let eno = libc::pthread_mutex_unlock(m);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }
    Ok(())
}

/// Wait on `c` for at most `timeout`. Returns `Ok(true)` when signalled,
/// `Ok(false)` on timeout.
///
/// # Safety
/// `m` must be locked by the calling thread and `c` initialised by
/// [`init_cond`].
pub(crate) unsafe fn timed_wait(
    c: *mut libc::pthread_cond_t,
    m: *mut libc::pthread_mutex_t,
    timeout: Duration,
) -> io::Result<bool> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let deadline = now + timeout;
    let ts = libc::timespec {
        tv_sec: deadline.as_secs() as libc::time_t,
        tv_nsec: deadline.subsec_nanos() as libc::c_long,
    };

    let eno = libc::pthread_cond_timedwait(c, m, &ts);
    match eno {
        0 => Ok(true),
        libc::ETIMEDOUT => Ok(false),
        _ => Err(io::Error::from_raw_os_error(eno)),
    }
}

/// # Safety
/// `c` must be initialised by [`init_cond`].
pub(crate) unsafe fn notify_one(c: *mut libc::pthread_cond_t) {
    libc::pthread_cond_signal(c);
}

/// # Safety
/// `c` must be initialised by [`init_cond`].
pub(crate) unsafe fn notify_all(c: *mut libc::pthread_cond_t) {
    libc::pthread_cond_broadcast(c);
}
