// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Shared-memory sessions over `nprpc_shm` channels.
//!
//! The client marshals into a ring reservation when the caller asks for a
//! zero-copy buffer, and replies surface as views into the receive ring.
//! A broken channel means the peer process is gone: shared-memory
//! sessions never reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use log::*;
use nprpc_shm::{connect_to_listener, Channel, Listener, RecvView};

use crate::buffer::FlatBuffer;
use crate::dispatch;
use crate::endpoint::{EndPoint, EndPointType};
use crate::message::Header;
use crate::runtime::Runtime;
use crate::session::{MessageSink, SendHandler, Session, SessionContext};
use crate::streams::StreamManager;
use crate::Error;

/// How long a full send ring is retried before the call gives up.
const SEND_RETRY: Duration = Duration::from_secs(1);

fn raw_request_id(data: &[u8]) -> u32 {
    if data.len() >= Header::SIZE {
        u32::from_le_bytes(data[12..16].try_into().unwrap())
    } else {
        0
    }
}

/// Copying send with bounded retry while the ring is full.
fn send_with_retry(channel: &Channel, data: &[u8], limit: Duration) -> Result<(), Error> {
    let deadline = Instant::now() + limit;
    loop {
        match channel.send(data) {
            Ok(()) => return Ok(()),
            Err(nprpc_shm::Error::BufferFull) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(nprpc_shm::Error::BufferFull) => return Err(Error::NoBufferSpace),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Transmit a marshalled buffer: commit its reservation when it is a
/// write view, otherwise copy it into the ring.
fn transmit(channel: &Arc<Channel>, mut buf: FlatBuffer, limit: Duration) -> Result<(), Error> {
    if buf.overflowed() {
        return Err(Error::NoBufferSpace);
    }
    if let Some((res, len)) = buf.take_reservation() {
        res.commit(len);
        return Ok(());
    }
    send_with_retry(channel, buf.as_slice(), limit)
}

// ---------------------------------------------------------------------------
// Client session
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PendingState {
    waiting: Option<u32>,
    reply: Option<FlatBuffer>,
}

#[derive(Default)]
struct Pending {
    state: Mutex<PendingState>,
    cv: Condvar,
}

pub struct ShmSession {
    endpoint: EndPoint,
    channel: Arc<Channel>,
    pending: Arc<Pending>,
    streams: Arc<StreamManager>,
    call_lock: Mutex<()>,
    closed: AtomicBool,
}

struct ShmSink {
    channel: Arc<Channel>,
}

impl MessageSink for ShmSink {
    fn send_message(&self, buf: FlatBuffer) -> Result<(), Error> {
        transmit(&self.channel, buf, SEND_RETRY)
    }
}

impl ShmSession {
    /// Connect to `mem://<listener>`: handshake, open the rings, start the
    /// receive thread.
    pub fn connect(endpoint: &EndPoint) -> Result<Arc<Self>, Error> {
        let listener_name = endpoint.memory_channel_id().ok_or(Error::BadInput)?;
        let channel = connect_to_listener(listener_name)?;

        let pending = Arc::new(Pending::default());
        let streams = StreamManager::new();
        streams.set_sink(Arc::new(ShmSink {
            channel: Arc::clone(&channel),
        }));

        let session = Arc::new(Self {
            endpoint: endpoint.clone(),
            channel: Arc::clone(&channel),
            pending: Arc::clone(&pending),
            streams: Arc::clone(&streams),
            call_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        });

        channel.start(Box::new(move |view: RecvView| {
            let fb = FlatBuffer::view_for_read(view);
            if Header::peek_msg_id(fb.as_slice()).is_some_and(|id| id.is_stream()) {
                streams.handle_message(&fb);
                return;
            }
            let mut state = pending.state.lock().unwrap();
            if state.waiting == Some(raw_request_id(fb.as_slice())) {
                // The waiter parses the reply in place; the ring record is
                // released when it drops the buffer.
                state.reply = Some(fb);
                pending.cv.notify_all();
            }
            // Unmatched (stale) replies drop here, releasing the record.
        }));

        Ok(session)
    }
}

impl Session for ShmSession {
    fn remote_endpoint(&self) -> &EndPoint {
        &self.endpoint
    }

    fn send_receive(&self, buf: FlatBuffer, timeout_ms: u32) -> Result<FlatBuffer, Error> {
        let _guard = self.call_lock.lock().unwrap();
        if self.is_closed() {
            return Err(Error::CommFailure);
        }

        let request_id = raw_request_id(buf.as_slice());
        let deadline = Instant::now() + Duration::from_millis(timeout_ms.max(1) as u64);

        {
            let mut state = self.pending.state.lock().unwrap();
            state.waiting = Some(request_id);
            // Dropping a stale zero-copy reply releases its ring record,
            // unblocking the channel's read thread.
            state.reply = None;
        }

        if let Err(e) = transmit(&self.channel, buf, Duration::from_millis(timeout_ms as u64)) {
            self.pending.state.lock().unwrap().waiting = None;
            return Err(e);
        }

        let mut state = self.pending.state.lock().unwrap();
        loop {
            if let Some(reply) = state.reply.take() {
                state.waiting = None;
                return Ok(reply);
            }
            let now = Instant::now();
            if now >= deadline {
                state.waiting = None;
                state.reply = None;
                return Err(Error::Timeout);
            }
            let (guard, _) = self.pending.cv.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }

    fn send_receive_async(&self, buf: FlatBuffer, handler: Option<SendHandler>, timeout_ms: u32) {
        if raw_request_id(buf.as_slice()) == 0 || handler.is_none() {
            let result = transmit(&self.channel, buf, SEND_RETRY);
            if let (Some(h), Err(e)) = (handler, result) {
                h(Err(e));
            }
            return;
        }

        // Correlated async: hand off to a helper thread; the pending slot
        // protocol is identical to the synchronous path.
        let channel = Arc::clone(&self.channel);
        let pending = Arc::clone(&self.pending);
        let handler = handler.unwrap();
        std::thread::spawn(move || {
            let request_id = raw_request_id(buf.as_slice());
            let deadline = Instant::now() + Duration::from_millis(timeout_ms.max(1) as u64);

            {
                let mut state = pending.state.lock().unwrap();
                state.waiting = Some(request_id);
                state.reply = None;
            }
            if let Err(e) = transmit(&channel, buf, Duration::from_millis(timeout_ms as u64)) {
                pending.state.lock().unwrap().waiting = None;
                handler(Err(e));
                return;
            }

            let mut state = pending.state.lock().unwrap();
            loop {
                if let Some(reply) = state.reply.take() {
                    state.waiting = None;
                    drop(state);
                    handler(Ok(reply));
                    return;
                }
                let now = Instant::now();
                if now >= deadline {
                    state.waiting = None;
                    state.reply = None;
                    drop(state);
                    handler(Err(Error::Timeout));
                    return;
                }
                let (guard, _) = pending.cv.wait_timeout(state, deadline - now).unwrap();
                state = guard;
            }
        });
    }

    fn send_datagram(&self, buf: FlatBuffer) -> Result<(), Error> {
        transmit(&self.channel, buf, SEND_RETRY)
    }

    fn prepare_zero_copy_buffer(&self, n: usize) -> Option<FlatBuffer> {
        self.channel
            .reserve_write(n)
            .ok()
            .map(FlatBuffer::view_for_write)
    }

    fn stream_manager(&self) -> Option<Arc<StreamManager>> {
        Some(Arc::clone(&self.streams))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.streams.close();
        self.channel.stop();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for ShmSession {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub(crate) struct ShmAcceptorHandle {
    listener: Listener,
    channels: Arc<Mutex<Vec<Arc<Channel>>>>,
    name: String,
}

impl ShmAcceptorHandle {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn stop(&mut self) {
        self.listener.stop();
        for channel in self.channels.lock().unwrap().drain(..) {
            channel.stop();
        }
    }
}

impl Drop for ShmAcceptorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Create the `mem://<name>` listener and serve accepted channels.
pub(crate) fn start_server(rt: &Arc<Runtime>, name: &str) -> Result<ShmAcceptorHandle, Error> {
    let weak = Arc::downgrade(rt);
    let channels: Arc<Mutex<Vec<Arc<Channel>>>> = Arc::new(Mutex::new(Vec::new()));

    let accepted = Arc::clone(&channels);
    let listener = Listener::bind(
        name,
        Box::new(move |channel: Arc<Channel>| {
            serve_channel(weak.clone(), &channel);
            accepted.lock().unwrap().push(channel);
        }),
    )?;

    debug!("shared-memory listener {name} started");

    Ok(ShmAcceptorHandle {
        listener,
        channels,
        name: name.to_string(),
    })
}

/// Everything one server-side channel session owns; dropping it (when the
/// channel's read thread exits) releases the peer's references.
struct ServerChannelState {
    ctx: SessionContext,
    manager: Arc<StreamManager>,
    rt: Weak<Runtime>,
}

impl Drop for ServerChannelState {
    fn drop(&mut self) {
        self.manager.close();
        if let Some(rt) = self.rt.upgrade() {
            self.ctx.ref_list.drain(&rt);
        }
    }
}

fn serve_channel(rt: Weak<Runtime>, channel: &Arc<Channel>) {
    let endpoint = EndPoint::new(EndPointType::SharedMemory, channel.channel_id(), 0);

    let manager = StreamManager::new();
    manager.set_sink(Arc::new(ShmSink {
        channel: Arc::clone(channel),
    }));

    let mut ctx = SessionContext::new(endpoint);
    ctx.shm_channel = Some(Arc::clone(channel));
    ctx.stream_manager = Some(Arc::clone(&manager));

    let mut state = ServerChannelState { ctx, manager, rt };
    let reply_channel = Arc::clone(channel);

    // Must run inside the accept callback so the handler is wired before
    // the client's first request can arrive.
    channel.start(Box::new(move |view: RecvView| {
        let Some(rt) = state.rt.upgrade() else { return };

        let rx = FlatBuffer::view_for_read(view);
        let mut tx = FlatBuffer::new();
        let has_reply = dispatch::handle_request(&rt, &mut state.ctx, &rx, &mut tx);
        // Release the request record before writing the reply; dispatch is
        // done with the view and the space may be needed for flow.
        drop(rx);

        if has_reply {
            if let Err(e) = send_reply(&reply_channel, tx) {
                warn!(
                    "shm reply on channel {} failed: {e}",
                    reply_channel.channel_id()
                );
            }
        }
    }));
}

/// Reply path: reserve the exact size in the s2c ring so the client's
/// receive is a view into it, falling back to a copying send.
fn send_reply(channel: &Arc<Channel>, tx: FlatBuffer) -> Result<(), Error> {
    if tx.overflowed() {
        return Err(Error::NoBufferSpace);
    }
    match channel.reserve_write(tx.len()) {
        Ok(res) => {
            unsafe {
                std::ptr::copy_nonoverlapping(tx.as_slice().as_ptr(), res.as_mut_ptr(), tx.len());
            }
            res.commit(tx.len());
            Ok(())
        }
        Err(_) => send_with_retry(channel, tx.as_slice(), SEND_RETRY),
    }
}
