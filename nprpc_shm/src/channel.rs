// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A duplex shared-memory channel: one ring per direction, named after the
//! channel id. The server writes `<id>.s2c` and reads `<id>.c2s`; the
//! client swaps. A dedicated read thread drains the receive ring and hands
//! each record to the installed handler as a zero-copy view.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::*;

use crate::ring::{ReadView, RingBuffer};
use crate::{make_shm_name, Error, DEFAULT_RING_SIZE, SHUTDOWN_POLL};

/// Receives every inbound record. The view borrows ring memory; it is
/// released (and the read index advanced) when the `RecvView` drops, which
/// may happen after the handler returns. The read thread will not pop the
/// next record until the previous view has been released.
pub type RecvHandler = Box<dyn FnMut(RecvView) + Send + 'static>;

/// A zero-copy view of one received record. Dropping it releases the
/// record back to the ring.
pub struct RecvView {
    ring: Arc<RingBuffer>,
    view: Option<ReadView>,
}

impl RecvView {
    pub fn bytes(&self) -> &[u8] {
        self.view.as_ref().map(|v| v.bytes()).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.view.as_ref().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes().to_vec()
    }
}

impl Drop for RecvView {
    fn drop(&mut self) {
        if let Some(view) = self.view.take() {
            self.ring.commit_read(view);
        }
    }
}

/// A write window into the channel's send ring. While a reservation is
/// outstanding the channel's send path is held; commit or drop promptly.
pub struct SendReservation {
    channel: Arc<Channel>,
    inner: Option<crate::ring::WriteReservation>,
}

impl SendReservation {
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.inner
            .as_ref()
            .map(|r| r.as_mut_ptr())
            .unwrap_or(std::ptr::null_mut())
    }

    pub fn max_size(&self) -> usize {
        self.inner.as_ref().map(|r| r.max_size()).unwrap_or(0)
    }

    /// Publish `actual` bytes as one record.
    pub fn commit(mut self, actual: usize) {
        if let Some(res) = self.inner.take() {
            self.channel.send_ring.commit_write(res, actual);
        }
    }
}

impl Drop for SendReservation {
    fn drop(&mut self) {
        // An uncommitted reservation publishes nothing; either way the
        // send path is released.
        self.inner.take();
        self.channel.send_busy.store(false, Ordering::Release);
    }
}

pub struct Channel {
    channel_id: String,
    is_server: bool,
    send_ring: Arc<RingBuffer>,
    recv_ring: Arc<RingBuffer>,
    send_busy: AtomicBool,
    running: AtomicBool,
    read_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// Construct one side of a channel. Construction is symmetrical except
    /// for the `create_rings` flag: the side that creates also owns the
    /// backing shm objects and removes them on teardown.
    pub fn new(channel_id: &str, is_server: bool, create_rings: bool) -> Result<Arc<Self>, Error> {
        let send_name = make_shm_name(channel_id, if is_server { "s2c" } else { "c2s" });
        let recv_name = make_shm_name(channel_id, if is_server { "c2s" } else { "s2c" });

        let (send_ring, recv_ring) = if create_rings {
            (
                RingBuffer::create(&send_name, DEFAULT_RING_SIZE)?,
                RingBuffer::create(&recv_name, DEFAULT_RING_SIZE)?,
            )
        } else {
            (RingBuffer::open(&send_name)?, RingBuffer::open(&recv_name)?)
        };

        debug!(
            "shm channel {channel_id} ({}): rings {send_name}, {recv_name}",
            if is_server { "server" } else { "client" }
        );

        Ok(Arc::new(Self {
            channel_id: channel_id.to_string(),
            is_server,
            send_ring: Arc::new(send_ring),
            recv_ring: Arc::new(recv_ring),
            send_busy: AtomicBool::new(false),
            running: AtomicBool::new(false),
            read_thread: Mutex::new(None),
        }))
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// Install the receive handler and spawn the read thread. Must be
    /// called before the peer can have sent anything; for server-side
    /// channels that means inside the listener's accept callback.
    pub fn start(self: &Arc<Self>, handler: RecvHandler) {
        let mut guard = self.read_thread.lock().unwrap();
        assert!(guard.is_none(), "channel read thread already started");

        self.running.store(true, Ordering::Release);
        let this = Arc::clone(self);
        *guard = Some(std::thread::spawn(move || this.read_loop(handler)));
    }

    fn read_loop(self: Arc<Self>, mut handler: RecvHandler) {
        while self.running.load(Ordering::Acquire) {
            match self.recv_ring.wait_for_data(SHUTDOWN_POLL) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    if self.running.load(Ordering::Acquire) {
                        warn!("shm channel {}: receive error: {e}", self.channel_id);
                    }
                    break;
                }
            }

            while let Some(view) = self.recv_ring.try_read_view() {
                let release_target = self.recv_ring.read_pos() + 4 + view.len() as u64;
                handler(RecvView {
                    ring: Arc::clone(&self.recv_ring),
                    view: Some(view),
                });

                // The handler may hand the view to another thread (a
                // blocked caller parsing its reply in place); hold off on
                // the next record until the view has been released.
                while self.running.load(Ordering::Acquire)
                    && self.recv_ring.read_pos() < release_target
                {
                    std::thread::sleep(Duration::from_micros(50));
                }

                if !self.running.load(Ordering::Acquire) {
                    break;
                }
            }
        }

        trace!("shm channel {} read thread exiting", self.channel_id);
    }

    /// Copying send. Fails with `BufferFull` when the peer is not draining.
    pub fn send(&self, data: &[u8]) -> Result<(), Error> {
        self.acquire_send();
        let res = self.send_ring.try_write(data);
        self.send_busy.store(false, Ordering::Release);
        res
    }

    /// Reserve a zero-copy write window of up to `max` bytes in the send
    /// ring.
    pub fn reserve_write(self: &Arc<Self>, max: usize) -> Result<SendReservation, Error> {
        self.acquire_send();
        match self.send_ring.try_reserve_write(max) {
            Ok(inner) => Ok(SendReservation {
                channel: Arc::clone(self),
                inner: Some(inner),
            }),
            Err(e) => {
                self.send_busy.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    // The rings are SPSC; within the process concurrent senders are
    // serialised on this flag.
    fn acquire_send(&self) {
        while self
            .send_busy
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.send_ring.max_message_size() as usize
    }

    /// Stop the read thread and join it. Teardown latency is bounded by
    /// [`SHUTDOWN_POLL`].
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.recv_ring.notify_all();

        let handle = self.read_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Can't join from the read thread itself (the last Arc may be
        // dropped there); stop() from the owner is the normal path.
        self.running.store(false, Ordering::Release);
    }
}
