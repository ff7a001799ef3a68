// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Single-producer/single-consumer byte ring in a named shared-memory
//! region.
//!
//! Layout:
//!
//! ```text
//! +------------------+
//! | RingHeader       |  atomic read/write indices, capacity,
//! |                  |  process-shared mutex + condvar (blocking reads)
//! +------------------+
//! | data region      |  [u32 size][size bytes] records, byte-level wrap
//! +------------------+
//! ```
//!
//! `read_idx`/`write_idx` are monotonically increasing byte counters; the
//! in-ring position is `idx % capacity`. When a record would not fit in
//! the contiguous tail the writer emits a `0xFFFF_FFFF` sentinel (or, if
//! fewer than four tail bytes remain, nothing at all) and restarts at
//! offset zero; the skipped bytes are counted into both indices so the
//! capacity invariant `write_idx - read_idx <= capacity` holds throughout.

use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::shm::{ShmOpenMode, ShmRegion};
use crate::{sync, Error, MAX_MESSAGE_SIZE};

/// Written into a tail too short for the next record.
const WRAP_SENTINEL: u32 = 0xFFFF_FFFF;

/// Published by the creator once the header is fully initialised.
const RING_MAGIC: u32 = 0x4E_50_52_42; // "NPRB"

#[repr(C, align(64))]
struct RingHeader {
    write_idx: AtomicU64,
    read_idx: AtomicU64,
    capacity: u64,
    max_message_size: u32,
    magic: AtomicU32,
    mutex: libc::pthread_mutex_t,
    cond: libc::pthread_cond_t,
}

const fn data_offset() -> usize {
    (std::mem::size_of::<RingHeader>() + 63) & !63
}

/// A write window into the ring that the caller fills in place and
/// publishes with [`RingBuffer::commit_write`]. Abandoning a reservation
/// is free: nothing is published until the commit.
#[derive(Debug)]
pub struct WriteReservation {
    data_ptr: *mut u8,
    base_idx: u64,
    pad: u64,
    max_size: usize,
}

unsafe impl Send for WriteReservation {}

impl WriteReservation {
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.data_ptr
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

/// A read window into the ring. The record bytes stay in place until the
/// reader releases them with [`RingBuffer::commit_read`], which advances
/// `read_idx` past the record (and any wrap padding in front of it).
#[derive(Debug)]
pub struct ReadView {
    data_ptr: *const u8,
    size: usize,
    new_read_idx: u64,
}

unsafe impl Send for ReadView {}

impl ReadView {
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data_ptr, self.size) }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// One directional SPSC ring. Exactly one session writes and one reads a
/// given ring; the type is `Sync` only so a channel can share it between
/// its send path and its read thread.
pub struct RingBuffer {
    region: ShmRegion,
    creator: bool,
}

impl RingBuffer {
    /// Create a fresh ring of `capacity` data bytes under `name`.
    pub fn create(name: &str, capacity: usize) -> Result<Self, Error> {
        if capacity < 64 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "ring capacity too small",
            )));
        }

        let region = ShmRegion::acquire(name, data_offset() + capacity, ShmOpenMode::Create)?;
        let ring = Self {
            region,
            creator: true,
        };

        let hdr = ring.hdr();
        unsafe {
            (*hdr).capacity = capacity as u64;
            (*hdr).max_message_size = MAX_MESSAGE_SIZE;
            sync::init_mutex(std::ptr::addr_of_mut!((*hdr).mutex))?;
            sync::init_cond(std::ptr::addr_of_mut!((*hdr).cond))?;
            (*hdr).magic.store(RING_MAGIC, Ordering::Release);
        }

        Ok(ring)
    }

    /// Open an existing ring. Fails if the region does not exist or its
    /// creator has not finished initialising the header.
    pub fn open(name: &str) -> Result<Self, Error> {
        let region = ShmRegion::acquire(name, 0, ShmOpenMode::Open)?;
        if region.size() < data_offset() + 64 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "shm region too small for a ring",
            )));
        }

        let ring = Self {
            region,
            creator: false,
        };

        // The creator publishes `magic` last; give it a brief window to
        // finish in case we raced the creation.
        let hdr = ring.hdr();
        for _ in 0..100 {
            if unsafe { (*hdr).magic.load(Ordering::Acquire) } == RING_MAGIC {
                return Ok(ring);
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        Err(Error::Io(io::Error::new(
            io::ErrorKind::WouldBlock,
            "ring header not initialised",
        )))
    }

    /// Remove the named backing object without an open handle.
    pub fn remove(name: &str) {
        ShmRegion::unlink(name);
    }

    fn hdr(&self) -> *mut RingHeader {
        self.region.as_ptr() as *mut RingHeader
    }

    fn data(&self) -> *mut u8 {
        unsafe { self.region.as_ptr().add(data_offset()) }
    }

    fn write_idx(&self) -> &AtomicU64 {
        unsafe { &(*self.hdr()).write_idx }
    }

    fn read_idx(&self) -> &AtomicU64 {
        unsafe { &(*self.hdr()).read_idx }
    }

    pub fn capacity(&self) -> u64 {
        unsafe { (*self.hdr()).capacity }
    }

    pub fn max_message_size(&self) -> u32 {
        unsafe { (*self.hdr()).max_message_size }
    }

    /// Current absolute read index (monotonic byte counter).
    pub fn read_pos(&self) -> u64 {
        self.read_idx().load(Ordering::Acquire)
    }

    pub fn used_bytes(&self) -> u64 {
        let w = self.write_idx().load(Ordering::Acquire);
        let r = self.read_idx().load(Ordering::Acquire);
        w - r
    }

    pub fn is_empty(&self) -> bool {
        self.used_bytes() == 0
    }

    /// Figure the wrap padding a record of `len + 4` bytes needs at
    /// write position `w`, and whether a sentinel fits in the skipped tail.
    fn wrap_pad(&self, w: u64, len: usize) -> (u64, bool) {
        let cap = self.capacity();
        let pos = w % cap;
        let tail = cap - pos;
        if tail < 4 {
            (tail, false)
        } else if (tail as usize) < 4 + len {
            (tail, true)
        } else {
            (0, false)
        }
    }

    fn check_len(&self, len: usize) -> Result<(), Error> {
        if len as u64 > self.max_message_size() as u64 || len as u64 + 4 > self.capacity() {
            return Err(Error::MessageTooLarge);
        }
        Ok(())
    }

    /// Non-blocking framed write. The writer never blocks; a full ring is
    /// reported as [`Error::BufferFull`].
    pub fn try_write(&self, data: &[u8]) -> Result<(), Error> {
        self.check_len(data.len())?;

        let w = self.write_idx().load(Ordering::Relaxed);
        let r = self.read_idx().load(Ordering::Acquire);
        let (pad, sentinel) = self.wrap_pad(w, data.len());

        let needed = pad + 4 + data.len() as u64;
        if self.capacity() - (w - r) < needed {
            return Err(Error::BufferFull);
        }

        unsafe {
            if sentinel {
                let pos = (w % self.capacity()) as usize;
                self.data()
                    .add(pos)
                    .cast::<[u8; 4]>()
                    .write(WRAP_SENTINEL.to_le_bytes());
            }
            let start = ((w + pad) % self.capacity()) as usize;
            self.data()
                .add(start)
                .cast::<[u8; 4]>()
                .write((data.len() as u32).to_le_bytes());
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.data().add(start + 4), data.len());
        }

        self.write_idx().store(w + needed, Ordering::Release);
        self.notify();
        Ok(())
    }

    /// Reserve a contiguous window of up to `max` bytes that the caller
    /// fills in place; publish with [`Self::commit_write`].
    pub fn try_reserve_write(&self, max: usize) -> Result<WriteReservation, Error> {
        self.check_len(max)?;

        let w = self.write_idx().load(Ordering::Relaxed);
        let r = self.read_idx().load(Ordering::Acquire);
        let (pad, sentinel) = self.wrap_pad(w, max);

        if self.capacity() - (w - r) < pad + 4 + max as u64 {
            return Err(Error::BufferFull);
        }

        // The sentinel can go in now: nothing past `write_idx` is visible
        // to the reader until the commit publishes it.
        if sentinel {
            let pos = (w % self.capacity()) as usize;
            unsafe {
                self.data()
                    .add(pos)
                    .cast::<[u8; 4]>()
                    .write(WRAP_SENTINEL.to_le_bytes());
            }
        }

        let start = ((w + pad) % self.capacity()) as usize;
        Ok(WriteReservation {
            data_ptr: unsafe { self.data().add(start + 4) },
            base_idx: w,
            pad,
            max_size: max,
        })
    }

    /// Publish `actual` bytes of a reservation as one record.
    pub fn commit_write(&self, res: WriteReservation, actual: usize) {
        assert!(actual <= res.max_size);

        let start = ((res.base_idx + res.pad) % self.capacity()) as usize;
        unsafe {
            self.data()
                .add(start)
                .cast::<[u8; 4]>()
                .write((actual as u32).to_le_bytes());
        }

        self.write_idx()
            .store(res.base_idx + res.pad + 4 + actual as u64, Ordering::Release);
        self.notify();
    }

    /// Non-blocking framed read into `buf`. Returns the record length, or
    /// 0 when the ring is empty. A record larger than `buf` is abandoned
    /// (the read index advances past it) and reported as
    /// [`Error::MessageTooLarge`].
    pub fn try_read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let w = self.write_idx().load(Ordering::Acquire);
        let mut r = self.read_idx().load(Ordering::Relaxed);

        loop {
            if r == w {
                self.read_idx().store(r, Ordering::Release);
                return Ok(0);
            }

            let cap = self.capacity();
            let pos = (r % cap) as usize;
            let tail = cap - pos as u64;

            if tail < 4 {
                r += tail;
                continue;
            }

            let size = u32::from_le_bytes(unsafe { self.data().add(pos).cast::<[u8; 4]>().read() });
            if size == WRAP_SENTINEL {
                r += tail;
                continue;
            }

            let size = size as usize;
            if size > buf.len() {
                self.read_idx().store(r + 4 + size as u64, Ordering::Release);
                return Err(Error::MessageTooLarge);
            }

            unsafe {
                std::ptr::copy_nonoverlapping(self.data().add(pos + 4), buf.as_mut_ptr(), size);
            }
            self.read_idx().store(r + 4 + size as u64, Ordering::Release);
            return Ok(size);
        }
    }

    /// Zero-copy read: a view into the next record, released by
    /// [`Self::commit_read`]. Returns `None` when the ring is empty.
    pub fn try_read_view(&self) -> Option<ReadView> {
        let w = self.write_idx().load(Ordering::Acquire);
        let mut r = self.read_idx().load(Ordering::Relaxed);

        loop {
            if r == w {
                return None;
            }

            let cap = self.capacity();
            let pos = (r % cap) as usize;
            let tail = cap - pos as u64;

            if tail < 4 {
                r += tail;
                continue;
            }

            let size = u32::from_le_bytes(unsafe { self.data().add(pos).cast::<[u8; 4]>().read() });
            if size == WRAP_SENTINEL {
                r += tail;
                continue;
            }

            return Some(ReadView {
                data_ptr: unsafe { self.data().add(pos + 4) },
                size: size as usize,
                new_read_idx: r + 4 + size as u64,
            });
        }
    }

    /// Release a view, advancing the read index past the record.
    pub fn commit_read(&self, view: ReadView) {
        self.read_idx().store(view.new_read_idx, Ordering::Release);
    }

    /// Blocking framed read with a deadline.
    pub fn read_with_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            let n = self.try_read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            if !self.wait_for_data_until(deadline)? {
                // One final attempt: a writer may have slipped in between
                // the wait expiring and our observation of it.
                let n = self.try_read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
                return Err(Error::Timeout);
            }
        }
    }

    /// Park on the header condvar until data is available or `timeout`
    /// elapses. Returns whether the ring was non-empty on wakeup.
    pub fn wait_for_data(&self, timeout: Duration) -> Result<bool, Error> {
        self.wait_for_data_until(Instant::now() + timeout)
    }

    fn wait_for_data_until(&self, deadline: Instant) -> Result<bool, Error> {
        let hdr = self.hdr();
        let mutex = unsafe { std::ptr::addr_of_mut!((*hdr).mutex) };
        let cond = unsafe { std::ptr::addr_of_mut!((*hdr).cond) };

        unsafe {
            sync::lock(mutex)?;
            while self.is_empty() {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                sync::timed_wait(cond, mutex, deadline - now)?;
            }
            let ready = !self.is_empty();
            sync::unlock(mutex)?;
            Ok(ready)
        }
    }

    fn notify(&self) {
        let hdr = self.hdr();
        unsafe { sync::notify_one(std::ptr::addr_of_mut!((*hdr).cond)) };
    }

    /// Wake every parked reader (used on shutdown so read threads observe
    /// their stop flag promptly).
    pub fn notify_all(&self) {
        let hdr = self.hdr();
        unsafe { sync::notify_all(std::ptr::addr_of_mut!((*hdr).cond)) };
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        if self.creator {
            ShmRegion::unlink(self.region.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn unique_name(tag: &str) -> String {
        static SEQ: AtomicUsize = AtomicUsize::new(0);
        format!(
            "/nprpc_test_{}_{}_{}",
            tag,
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn write_then_read_preserves_records() {
        let ring = RingBuffer::create(&unique_name("fifo"), 4096).unwrap();

        ring.try_write(b"alpha").unwrap();
        ring.try_write(b"beta").unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(ring.try_read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"alpha");
        assert_eq!(ring.try_read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"beta");
        assert_eq!(ring.try_read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn fifo_across_wrap_boundary() {
        // Small ring so records wrap many times.
        let ring = RingBuffer::create(&unique_name("wrap"), 64).unwrap();
        let mut buf = [0u8; 64];

        // Varying record lengths so the write position drifts through
        // every wrap case (clean fit, sentinel, short stub).
        for i in 0u32..1000 {
            let record = vec![i as u8; (i % 13 + 1) as usize];
            ring.try_write(&record).unwrap();
            let n = ring.try_read(&mut buf).unwrap();
            assert_eq!(&buf[..n], record.as_slice());
        }
    }

    #[test]
    fn capacity_is_respected() {
        let ring = RingBuffer::create(&unique_name("cap"), 64).unwrap();

        // A record larger than capacity - 4 always fails.
        assert!(matches!(
            ring.try_write(&[0u8; 61]),
            Err(Error::MessageTooLarge)
        ));

        // Fill until full; used bytes never exceed capacity.
        let mut wrote = 0;
        loop {
            match ring.try_write(&[7u8; 10]) {
                Ok(()) => wrote += 1,
                Err(Error::BufferFull) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
            assert!(ring.used_bytes() <= ring.capacity());
        }
        assert!(wrote >= 3);

        // Draining recovers the space.
        let mut buf = [0u8; 16];
        for _ in 0..wrote {
            assert_eq!(ring.try_read(&mut buf).unwrap(), 10);
        }
        assert!(ring.is_empty());
        ring.try_write(&[1u8; 10]).unwrap();
    }

    #[test]
    fn reservation_commit_publishes_record() {
        let ring = RingBuffer::create(&unique_name("resv"), 4096).unwrap();

        let res = ring.try_reserve_write(128).unwrap();
        let payload = b"zero copy payload";
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), res.as_mut_ptr(), payload.len());
        }
        ring.commit_write(res, payload.len());

        let view = ring.try_read_view().unwrap();
        assert_eq!(view.bytes(), payload);
        ring.commit_read(view);
        assert!(ring.is_empty());
    }

    #[test]
    fn abandoned_reservation_publishes_nothing() {
        let ring = RingBuffer::create(&unique_name("abort"), 4096).unwrap();
        drop(ring.try_reserve_write(128).unwrap());
        assert!(ring.is_empty());

        ring.try_write(b"after").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(ring.try_read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"after");
    }

    #[test]
    fn undersized_read_buffer_abandons_record() {
        let ring = RingBuffer::create(&unique_name("small"), 4096).unwrap();
        ring.try_write(&[9u8; 32]).unwrap();
        ring.try_write(b"next").unwrap();

        let mut tiny = [0u8; 8];
        assert!(matches!(
            ring.try_read(&mut tiny),
            Err(Error::MessageTooLarge)
        ));
        // The oversized record was skipped, not re-delivered.
        assert_eq!(ring.try_read(&mut tiny).unwrap(), 4);
        assert_eq!(&tiny[..4], b"next");
    }

    #[test]
    fn read_with_timeout_times_out_when_empty() {
        let ring = RingBuffer::create(&unique_name("timeout"), 4096).unwrap();
        let mut buf = [0u8; 16];
        let started = Instant::now();
        assert!(matches!(
            ring.read_with_timeout(&mut buf, Duration::from_millis(50)),
            Err(Error::Timeout)
        ));
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn blocking_read_wakes_on_write() {
        let name = unique_name("wake");
        let ring = std::sync::Arc::new(RingBuffer::create(&name, 4096).unwrap());

        let reader = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                let mut buf = [0u8; 16];
                ring.read_with_timeout(&mut buf, Duration::from_secs(5))
                    .map(|n| buf[..n].to_vec())
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        ring.try_write(b"ping").unwrap();

        let got = reader.join().unwrap().unwrap();
        assert_eq!(got, b"ping");
    }

    #[test]
    fn open_sees_creator_records() {
        let name = unique_name("open");
        let creator = RingBuffer::create(&name, 4096).unwrap();
        let opener = RingBuffer::open(&name).unwrap();

        creator.try_write(b"hello").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(opener.try_read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
    }
}
