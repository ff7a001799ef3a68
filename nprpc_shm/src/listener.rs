// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The shared-memory accept path: a listener owns one small well-known
//! ring at `<name>.accept`; clients publish a handshake record carrying a
//! fresh channel id, the listener creates the per-connection channel and
//! hands it synchronously to the accept callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::*;

use crate::channel::Channel;
use crate::ring::RingBuffer;
use crate::{generate_channel_id, make_shm_name, Error, SHUTDOWN_POLL};

pub const HANDSHAKE_MAGIC: u32 = 0x534D_454D; // "SMEM"
pub const HANDSHAKE_VERSION: u32 = 1;

/// Size of the accept ring: a handful of pending handshakes is plenty.
const ACCEPT_RING_SIZE: usize = 4096;

/// How long a connecting client waits for the server to create the
/// per-connection rings.
const CONNECT_DEADLINE: Duration = Duration::from_secs(5);

/// One connection request, written to the accept ring as a single record.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Handshake {
    pub magic: u32,
    pub version: u32,
    pub channel_id: [u8; 64],
}

impl Handshake {
    pub const WIRE_SIZE: usize = 72;

    pub fn new(channel_id: &str) -> Self {
        let mut id = [0u8; 64];
        let n = channel_id.len().min(63);
        id[..n].copy_from_slice(&channel_id.as_bytes()[..n]);
        Self {
            magic: HANDSHAKE_MAGIC,
            version: HANDSHAKE_VERSION,
            channel_id: id,
        }
    }

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..].copy_from_slice(&self.channel_id);
        out
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != Self::WIRE_SIZE {
            return None;
        }
        let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
        if magic != HANDSHAKE_MAGIC || version != HANDSHAKE_VERSION {
            return None;
        }
        let mut channel_id = [0u8; 64];
        channel_id.copy_from_slice(&data[8..]);
        Some(Self {
            magic,
            version,
            channel_id,
        })
    }

    /// The channel id as a string, up to the first NUL.
    pub fn channel_id_str(&self) -> &str {
        let end = self
            .channel_id
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.channel_id.len());
        std::str::from_utf8(&self.channel_id[..end]).unwrap_or("")
    }
}

/// Called for every accepted connection with the freshly created server
/// side channel. The callback must install the channel's receive handler
/// (`Channel::start`) before returning, since the client may send its first
/// request the moment its rings open.
pub type AcceptHandler = Box<dyn FnMut(Arc<Channel>) + Send + 'static>;

pub struct Listener {
    name: String,
    accept_ring: Arc<RingBuffer>,
    running: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    /// Create the well-known accept ring and start the accept thread. Any
    /// stale ring left by a crashed server is removed first.
    pub fn bind(name: &str, handler: AcceptHandler) -> Result<Self, Error> {
        if name.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "listener name cannot be empty",
            )));
        }

        let ring_name = make_shm_name(name, "accept");
        RingBuffer::remove(&ring_name);
        let accept_ring = Arc::new(RingBuffer::create(&ring_name, ACCEPT_RING_SIZE)?);

        debug!("shm listener created: {name}");

        let listener = Self {
            name: name.to_string(),
            accept_ring,
            running: Arc::new(AtomicBool::new(true)),
            accept_thread: Mutex::new(None),
        };

        let ring = Arc::clone(&listener.accept_ring);
        let running = Arc::clone(&listener.running);
        let listener_name = listener.name.clone();
        *listener.accept_thread.lock().unwrap() = Some(std::thread::spawn(move || {
            accept_loop(&listener_name, &ring, &running, handler)
        }));

        Ok(listener)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.accept_ring.notify_all();
        let handle = self.accept_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener_name: &str,
    ring: &RingBuffer,
    running: &AtomicBool,
    mut handler: AcceptHandler,
) {
    let mut buf = [0u8; 1024];

    while running.load(Ordering::Acquire) {
        let n = match ring.read_with_timeout(&mut buf, SHUTDOWN_POLL) {
            Ok(n) => n,
            Err(Error::Timeout) => continue,
            Err(e) => {
                if running.load(Ordering::Acquire) {
                    warn!("shm listener {listener_name}: accept error: {e}");
                }
                break;
            }
        };

        let Some(handshake) = Handshake::decode(&buf[..n]) else {
            warn!("shm listener {listener_name}: rejected malformed handshake ({n} bytes)");
            continue;
        };

        let channel_id = handshake.channel_id_str().to_string();
        debug!("shm listener {listener_name}: accepting channel {channel_id}");

        match Channel::new(&channel_id, true, true) {
            // Synchronous hand-off: the handler installs its receive
            // callback before we look at the next handshake, so no message
            // can arrive on an unwired channel.
            Ok(channel) => handler(channel),
            Err(e) => {
                warn!("shm listener {listener_name}: failed to create channel {channel_id}: {e}")
            }
        }
    }

    trace!("shm listener {listener_name} accept loop exiting");
}

/// Client side: generate a channel id, publish the handshake to the
/// listener's accept ring, then poll-open the per-connection rings until
/// the server has created them.
pub fn connect_to_listener(listener_name: &str) -> Result<Arc<Channel>, Error> {
    if listener_name.is_empty() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "listener name cannot be empty",
        )));
    }

    let channel_id = generate_channel_id();
    let accept_ring = RingBuffer::open(&make_shm_name(listener_name, "accept"))?;
    accept_ring.try_write(&Handshake::new(&channel_id).encode())?;

    trace!("sent handshake to {listener_name}, waiting for channel {channel_id}");

    let start = Instant::now();
    loop {
        match Channel::new(&channel_id, false, false) {
            Ok(channel) => return Ok(channel),
            Err(_) if start.elapsed() < CONNECT_DEADLINE => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                warn!("connect to {listener_name} timed out: {e}");
                return Err(Error::Timeout);
            }
        }
    }
}
