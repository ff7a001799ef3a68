// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Shared-memory transport primitives: named POSIX shared-memory regions,
//! process-shared mutex/condvar pairs, SPSC byte rings with framed records,
//! and the channel/listener layer that pairs two rings into a duplex
//! connection reachable through a well-known accept ring.

pub mod channel;
pub mod listener;
pub mod ring;
pub mod shm;
pub(crate) mod sync;

use std::fmt;
use std::io::Read;

pub use channel::{Channel, RecvView, SendReservation};
pub use listener::{connect_to_listener, Handshake, Listener};
pub use ring::{ReadView, RingBuffer, WriteReservation};

/// Default per-ring capacity (the original uses 16 MiB rings).
pub const DEFAULT_RING_SIZE: usize = 16 * 1024 * 1024;

/// Largest record accepted by a ring regardless of its capacity.
pub const MAX_MESSAGE_SIZE: u32 = 32 * 1024 * 1024;

/// How often blocked reader threads re-check their shutdown flag. This
/// bounds teardown latency of channel read threads and listener accept
/// threads.
pub const SHUTDOWN_POLL: std::time::Duration = std::time::Duration::from_millis(100);

/// The possible errors arising from ring-buffer and channel operations.
#[derive(Debug)]
pub enum Error {
    /// A write did not fit in the free tail of the ring. The writer never
    /// blocks; a full ring signals backpressure to the caller.
    BufferFull,

    /// The record exceeds the ring's configured maximum message size (or
    /// the capacity of the buffer supplied to a read).
    MessageTooLarge,

    /// A blocking read reached its deadline without data.
    Timeout,

    /// Errors returned by shared-memory system calls.
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BufferFull => write!(f, "ring buffer full"),
            Self::MessageTooLarge => write!(f, "message exceeds maximum size"),
            Self::Timeout => write!(f, "timed out waiting for data"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Derive the shm object name for one directional ring of a channel.
/// POSIX shm names must begin with exactly one slash.
pub fn make_shm_name(channel_id: &str, direction: &str) -> String {
    format!("/nprpc_{channel_id}_{direction}")
}

/// Generate a fresh channel id: 32 hex digits drawn from the OS entropy
/// pool, used both for `mem://` connects and the accept handshake.
pub fn generate_channel_id() -> String {
    let mut bytes = [0u8; 16];
    // /dev/urandom never blocks once seeded; a failure here means the
    // platform is unusable for shm channels anyway.
    std::fs::File::open("/dev/urandom")
        .and_then(|mut f| f.read_exact(&mut bytes))
        .expect("reading /dev/urandom");

    let mut id = String::with_capacity(32);
    for b in bytes {
        id.push_str(&format!("{b:02x}"));
    }
    id
}
