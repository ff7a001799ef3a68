// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! NPRPC core runtime: remote invocations on strongly-typed server-resident
//! objects, addressed by a stable `(poa_idx, oid)` identity and reachable
//! over TCP, WebSocket, UDP, or local shared-memory ring channels.
//!
//! The crate provides the ORB ([`Runtime`]), the POA layer ([`Poa`]), the
//! wire envelope ([`message`]), the session contract every transport
//! implements ([`session::Session`]), and the client proxy runtime
//! ([`Object`]). IDL code generation is out of scope: argument payloads are
//! opaque bytes marshalled through [`FlatBuffer`] by generated (or
//! hand-written) stubs.

pub mod buffer;
pub mod dispatch;
pub mod endpoint;
pub mod idtable;
pub mod message;
pub mod object;
pub mod poa;
pub mod runtime;
pub mod session;
pub mod streams;
pub mod transport;

use std::fmt;

pub use buffer::FlatBuffer;
pub use endpoint::{EndPoint, EndPointType};
pub use message::{CallHeader, Header, MessageId, MessageType};
pub use object::{
    handle_standard_reply, Object, ObjectActivationFlags, ObjectId, Proxy, Servant, StandardReply,
};
pub use poa::{Lifespan, ObjectIdPolicy, Poa, PoaBuilder};
pub use runtime::{DebugLevel, RpcBuilder, Runtime};
pub use session::{Session, SessionContext};
pub use streams::{ChunkSource, StreamPoll, StreamReader};

/// Maximum allowed message size, enforced at the transport level before
/// allocating memory for a body.
pub const MAX_MESSAGE_SIZE: u32 = 32 * 1024 * 1024;

/// Maximum number of in-flight requests per session.
pub const MAX_PENDING_REQUESTS: usize = 1000;

/// Maximum number of queued outgoing messages per session.
pub const MAX_WRITE_QUEUE_SIZE: usize = 100;

/// Maximum number of remote object references a single session may hold.
pub const MAX_REFERENCES_PER_SESSION: usize = 10_000;

/// The object id returned when a slot table is exhausted, and the value
/// carried by an unresolved object reference on the wire.
pub const INVALID_OBJECT_ID: u64 = u64::MAX;

/// The failure kinds that surface to callers of the runtime.
///
/// The `Error_*` wire messages map onto these 1:1 (see
/// [`MessageId::to_error`]); typed application exceptions travel as a
/// `BlockResponse` with a reserved discriminator and surface as
/// [`Error::AppException`].
#[derive(Debug)]
pub enum Error {
    /// Transport broken after the single permitted reconnect.
    CommFailure,

    /// The per-call deadline expired.
    Timeout,

    /// The `poa_idx` addressed a POA this process never created.
    PoaNotExist,

    /// Slot missing or the generation in the oid is stale.
    ObjectNotExist,

    /// The servant refused the session.
    BadAccess,

    /// The decoder rejected a message, or dispatch failed.
    BadInput,

    /// Programming error: function index out of range for the interface.
    UnknownFunctionIdx,

    /// Programming error: unrecognised `msg_id`.
    UnknownMessageId,

    /// A session-layer limit (queue depth, reference cap, view capacity)
    /// was exceeded; the offending operation fails, the session survives.
    NoBufferSpace,

    /// A typed application exception: class discriminator plus the
    /// payload bytes for the generated stub to decode.
    AppException { class_id: u32, data: Vec<u8> },

    /// Errors returned by I/O failures.
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::CommFailure => write!(f, "communication failure"),
            Self::Timeout => write!(f, "request timed out"),
            Self::PoaNotExist => write!(f, "POA does not exist"),
            Self::ObjectNotExist => write!(f, "object does not exist"),
            Self::BadAccess => write!(f, "access denied"),
            Self::BadInput => write!(f, "malformed message"),
            Self::UnknownFunctionIdx => write!(f, "unknown function index"),
            Self::UnknownMessageId => write!(f, "unknown message id"),
            Self::NoBufferSpace => write!(f, "buffer space exhausted"),
            Self::AppException { class_id, .. } => {
                write!(f, "application exception (class {class_id})")
            }
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<nprpc_shm::Error> for Error {
    fn from(e: nprpc_shm::Error) -> Self {
        match e {
            nprpc_shm::Error::BufferFull => Self::NoBufferSpace,
            nprpc_shm::Error::MessageTooLarge => Self::NoBufferSpace,
            nprpc_shm::Error::Timeout => Self::Timeout,
            nprpc_shm::Error::Io(e) => Self::Io(e),
        }
    }
}
