// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The per-connection session contract every transport implements, the
//! session context handed to servant dispatch, and the reference list that
//! tracks remote object references held through a session.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use log::*;

use crate::buffer::FlatBuffer;
use crate::endpoint::EndPoint;
use crate::runtime::Runtime;
use crate::streams::StreamManager;
use crate::{Error, MAX_REFERENCES_PER_SESSION};

/// Completion for an asynchronous send/receive.
pub type SendHandler = Box<dyn FnOnce(Result<FlatBuffer, Error>) + Send + 'static>;

/// Uniform per-connection contract every transport implements; the ORB
/// caches outbound sessions keyed by endpoint.
pub trait Session: Send + Sync {
    fn remote_endpoint(&self) -> &EndPoint;

    /// Synchronous request/response. The request buffer is consumed; the
    /// reply buffer is returned (for shared-memory sessions it may be a
    /// zero-copy view into the receive ring).
    fn send_receive(&self, buf: FlatBuffer, timeout_ms: u32) -> Result<FlatBuffer, Error>;

    /// Non-blocking variant; the handler (if any) observes the outcome.
    fn send_receive_async(&self, buf: FlatBuffer, handler: Option<SendHandler>, timeout_ms: u32);

    /// Unreliable, no reply expected. Stream sessions emulate this by
    /// routing through the write queue with no completion attached.
    fn send_datagram(&self, buf: FlatBuffer) -> Result<(), Error>;

    /// Optional zero-copy marshalling: shared-memory sessions hand out a
    /// buffer in view mode over a ring reservation; other transports
    /// refuse and the caller falls back to owned allocation.
    fn prepare_zero_copy_buffer(&self, _n: usize) -> Option<FlatBuffer> {
        None
    }

    /// The per-session stream state, when the transport supports streams.
    fn stream_manager(&self) -> Option<Arc<StreamManager>> {
        None
    }

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Allocate a request id. Zero is reserved for fire-and-forget.
pub fn next_request_id() -> u32 {
    static NEXT: AtomicU32 = AtomicU32::new(1);
    let id = NEXT.fetch_add(1, Ordering::Relaxed);
    if id == 0 {
        NEXT.fetch_add(1, Ordering::Relaxed)
    } else {
        id
    }
}

struct RefEntry {
    poa_idx: u16,
    object_id: u64,
    count: u32,
}

/// The set of servant references a peer holds through one session.
/// Draining on session destruction synthesises the releases the peer can
/// no longer send, so leaks do not survive a disconnect.
#[derive(Default)]
pub struct ReferenceList {
    refs: Mutex<Vec<RefEntry>>,
}

impl ReferenceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference on `(poa_idx, oid)`. Fails with `ObjectNotExist`
    /// for a stale id and `BadInput` when the session's reference cap is
    /// exhausted.
    pub fn add_ref(&self, rt: &Runtime, poa_idx: u16, object_id: u64) -> Result<(), Error> {
        let mut refs = self.refs.lock().unwrap();

        let held: usize = refs.iter().map(|r| r.count as usize).sum();
        if held >= MAX_REFERENCES_PER_SESSION {
            warn!("session reference cap reached ({MAX_REFERENCES_PER_SESSION}); rejecting");
            return Err(Error::BadInput);
        }

        let poa = rt.get_poa(poa_idx).ok_or(Error::PoaNotExist)?;
        if !poa.add_object_reference(object_id) {
            return Err(Error::ObjectNotExist);
        }

        if let Some(entry) = refs
            .iter_mut()
            .find(|r| r.poa_idx == poa_idx && r.object_id == object_id)
        {
            entry.count += 1;
        } else {
            refs.push(RefEntry {
                poa_idx,
                object_id,
                count: 1,
            });
        }
        Ok(())
    }

    /// Drop one reference. `false` if the session never held one.
    pub fn remove_ref(&self, rt: &Runtime, poa_idx: u16, object_id: u64) -> bool {
        let mut refs = self.refs.lock().unwrap();
        let Some(pos) = refs
            .iter()
            .position(|r| r.poa_idx == poa_idx && r.object_id == object_id)
        else {
            return false;
        };

        refs[pos].count -= 1;
        if refs[pos].count == 0 {
            refs.swap_remove(pos);
        }

        if let Some(poa) = rt.get_poa(poa_idx) {
            poa.release_object_reference(object_id);
        }
        true
    }

    /// Total references currently held through this session.
    pub fn total(&self) -> usize {
        self.refs.lock().unwrap().iter().map(|r| r.count as usize).sum()
    }

    /// Release everything (session teardown).
    pub fn drain(&self, rt: &Runtime) {
        let mut refs = self.refs.lock().unwrap();
        for entry in refs.drain(..) {
            if let Some(poa) = rt.get_poa(entry.poa_idx) {
                for _ in 0..entry.count {
                    poa.release_object_reference(entry.object_id);
                }
            }
        }
    }
}

/// Per-connection state visible to servant dispatch. The context is an
/// explicit argument to servant methods; nothing here is thread-local.
pub struct SessionContext {
    pub remote_endpoint: EndPoint,
    pub ref_list: ReferenceList,

    /// For server-side shared memory sessions: the channel, for zero-copy
    /// responses. `None` for every other session type.
    pub shm_channel: Option<Arc<nprpc_shm::Channel>>,

    /// Per-session stream state; discarded on session close.
    pub stream_manager: Option<Arc<StreamManager>>,

    /// Set while dispatching a `StreamInitialization`: the stream id the
    /// servant should register its writer under.
    pub current_stream: Option<u64>,

    /// HTTP-upgraded sessions only: the `Cookie` header of the upgrade
    /// request. Empty for TCP/UDP/SHM.
    pub cookies: String,

    /// HTTP-upgraded sessions only: `Set-Cookie` values for the outer
    /// HTTP layer to attach to its response.
    pub set_cookies: Vec<String>,
}

impl SessionContext {
    pub fn new(remote_endpoint: EndPoint) -> Self {
        Self {
            remote_endpoint,
            ref_list: ReferenceList::new(),
            shm_channel: None,
            stream_manager: None,
            current_stream: None,
            cookies: String::new(),
            set_cookies: Vec::new(),
        }
    }
}

/// Outbound message path a stream manager uses to emit chunks outside the
/// request/response cycle. Implemented by the server connection types and
/// by client sessions (for window grants and cancels).
pub trait MessageSink: Send + Sync {
    fn send_message(&self, buf: FlatBuffer) -> Result<(), Error>;
}
