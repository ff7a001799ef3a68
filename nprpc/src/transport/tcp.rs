// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! TCP stream sessions.
//!
//! Client side: a FIFO work queue drained by one I/O thread. At most one
//! request is on the wire at a time, replies are correlated by request id,
//! and a write failure earns exactly one reconnect (resolve, connect,
//! retry the same item) before the session reports `CommFailure`.
//!
//! Server side: an accept thread plus one read-pump thread per
//! connection; all writes (replies and stream chunks) funnel through a
//! shared sink so they never interleave.

use std::io::Write;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::*;

use crate::buffer::FlatBuffer;
use crate::dispatch;
use crate::endpoint::{EndPoint, EndPointType};
use crate::message::Header;
use crate::runtime::Runtime;
use crate::session::{MessageSink, SendHandler, Session, SessionContext};
use crate::streams::StreamManager;
use crate::transport::{
    is_reconnectable, is_timeout, read_frame, read_frame_with_deadline, write_frame,
};
use crate::{Error, MAX_WRITE_QUEUE_SIZE};

/// How often blocked waits re-check deadlines and shutdown flags.
const POLL: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Client session
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SyncCell {
    slot: Mutex<Option<Result<FlatBuffer, Error>>>,
    cv: Condvar,
}

impl SyncCell {
    fn complete(&self, result: Result<FlatBuffer, Error>) {
        *self.slot.lock().unwrap() = Some(result);
        self.cv.notify_one();
    }

    fn wait(&self, limit: Duration) -> Result<FlatBuffer, Error> {
        let deadline = Instant::now() + limit;
        let mut slot = self.slot.lock().unwrap();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            let now = Instant::now();
            if now >= deadline {
                // The I/O thread failed to complete us at all; only a dead
                // thread gets here.
                return Err(Error::CommFailure);
            }
            let (guard, _) = self.cv.wait_timeout(slot, deadline - now).unwrap();
            slot = guard;
        }
    }
}

enum Completion {
    Sync(Arc<SyncCell>),
    Async(Option<SendHandler>),
    WriteOnly,
}

impl Completion {
    fn complete(self, result: Result<FlatBuffer, Error>) {
        match self {
            Self::Sync(cell) => cell.complete(result),
            Self::Async(Some(handler)) => handler(result),
            Self::Async(None) | Self::WriteOnly => {}
        }
    }
}

struct Work {
    buf: FlatBuffer,
    timeout_ms: u32,
    completion: Completion,
}

pub struct TcpSession {
    endpoint: EndPoint,
    queue: mpsc::SyncSender<Work>,
    closed: Arc<AtomicBool>,
    streams: Arc<StreamManager>,
}

struct ClientSink {
    queue: mpsc::SyncSender<Work>,
}

impl MessageSink for ClientSink {
    fn send_message(&self, buf: FlatBuffer) -> Result<(), Error> {
        self.queue
            .try_send(Work {
                buf,
                timeout_ms: 0,
                completion: Completion::WriteOnly,
            })
            .map_err(|e| match e {
                mpsc::TrySendError::Full(_) => Error::NoBufferSpace,
                mpsc::TrySendError::Disconnected(_) => Error::CommFailure,
            })
    }
}

impl TcpSession {
    pub fn connect(endpoint: &EndPoint) -> Result<Arc<Self>, Error> {
        let stream = open_stream(endpoint)?;
        let (tx, rx) = mpsc::sync_channel(MAX_WRITE_QUEUE_SIZE);
        let closed = Arc::new(AtomicBool::new(false));
        let streams = StreamManager::new();
        streams.set_sink(Arc::new(ClientSink { queue: tx.clone() }));

        let session = Arc::new(Self {
            endpoint: endpoint.clone(),
            queue: tx,
            closed: Arc::clone(&closed),
            streams: Arc::clone(&streams),
        });

        let endpoint = endpoint.clone();
        std::thread::spawn(move || io_loop(stream, rx, endpoint, closed, streams));

        Ok(session)
    }

    fn enqueue(&self, work: Work) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::CommFailure);
        }
        self.queue.try_send(work).map_err(|e| match e {
            mpsc::TrySendError::Full(_) => Error::NoBufferSpace,
            mpsc::TrySendError::Disconnected(_) => Error::CommFailure,
        })
    }
}

impl Session for TcpSession {
    fn remote_endpoint(&self) -> &EndPoint {
        &self.endpoint
    }

    fn send_receive(&self, buf: FlatBuffer, timeout_ms: u32) -> Result<FlatBuffer, Error> {
        let cell = Arc::new(SyncCell::default());
        self.enqueue(Work {
            buf,
            timeout_ms,
            completion: Completion::Sync(Arc::clone(&cell)),
        })?;
        // Queueing delay plus the on-the-wire deadline; the I/O thread is
        // the one enforcing the real timeout.
        cell.wait(Duration::from_millis(timeout_ms as u64).saturating_mul(2) + Duration::from_secs(10))
    }

    fn send_receive_async(&self, buf: FlatBuffer, handler: Option<SendHandler>, timeout_ms: u32) {
        let work = Work {
            buf,
            timeout_ms,
            completion: Completion::Async(handler),
        };
        if let Err(e) = self.enqueue(work) {
            debug!("async send rejected: {e}");
        }
    }

    fn send_datagram(&self, buf: FlatBuffer) -> Result<(), Error> {
        self.enqueue(Work {
            buf,
            timeout_ms: 0,
            completion: Completion::WriteOnly,
        })
    }

    fn stream_manager(&self) -> Option<Arc<StreamManager>> {
        Some(Arc::clone(&self.streams))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.streams.close();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn open_stream(endpoint: &EndPoint) -> Result<TcpStream, Error> {
    let addr = (endpoint.hostname(), endpoint.port())
        .to_socket_addrs()?
        .next()
        .ok_or(Error::CommFailure)?;
    let stream = TcpStream::connect(addr)?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

fn io_loop(
    mut stream: TcpStream,
    rx: mpsc::Receiver<Work>,
    endpoint: EndPoint,
    closed: Arc<AtomicBool>,
    streams: Arc<StreamManager>,
) {
    let mut broken = false;

    loop {
        match rx.recv_timeout(POLL) {
            Ok(work) => {
                if closed.load(Ordering::Acquire) || broken {
                    work.completion.complete(Err(Error::CommFailure));
                    continue;
                }
                if process_work(&mut stream, &endpoint, work, &streams).is_err() {
                    broken = true;
                    closed.store(true, Ordering::Release);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if closed.load(Ordering::Acquire) {
                    break;
                }
                if !broken {
                    poll_stream_frames(&mut stream, &streams);
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    streams.close();
    trace!("client session {endpoint} I/O thread exiting");
}

/// Write one work item and, when a reply is expected, pump the socket
/// until the correlated answer arrives or the deadline passes. `Err`
/// means the transport is beyond use.
fn process_work(
    stream: &mut TcpStream,
    endpoint: &EndPoint,
    work: Work,
    streams: &StreamManager,
) -> Result<(), ()> {
    let Work {
        buf,
        timeout_ms,
        completion,
    } = work;

    if buf.overflowed() {
        completion.complete(Err(Error::NoBufferSpace));
        return Ok(());
    }

    let request_id = raw_request_id(buf.as_slice());

    if let Err(e) = write_frame(stream, buf.as_slice()) {
        if is_reconnectable(&e) {
            // Exactly one reconnect, then retry this very item.
            debug!("write to {endpoint} failed ({e}); reconnecting");
            match open_stream(endpoint) {
                Ok(new_stream) => {
                    *stream = new_stream;
                    if let Err(e) = write_frame(stream, buf.as_slice()) {
                        warn!("retry after reconnect failed: {e}");
                        completion.complete(Err(Error::CommFailure));
                        return Err(());
                    }
                }
                Err(e) => {
                    warn!("reconnect to {endpoint} failed: {e}");
                    completion.complete(Err(Error::CommFailure));
                    return Err(());
                }
            }
        } else {
            warn!("write to {endpoint} failed: {e}");
            completion.complete(Err(Error::CommFailure));
            return Err(());
        }
    }

    // Fire-and-forget: nothing to read.
    let expects_reply = !matches!(completion, Completion::WriteOnly) && request_id != 0;
    if !expects_reply {
        completion.complete(Ok(FlatBuffer::new()));
        return Ok(());
    }

    match read_reply(stream, request_id, timeout_ms, streams) {
        Ok(reply) => {
            completion.complete(Ok(reply));
            Ok(())
        }
        Err(Error::Timeout) => {
            // The session stays usable: a late reply for this id will be
            // recognised as stale and discarded.
            completion.complete(Err(Error::Timeout));
            Ok(())
        }
        Err(e) => {
            completion.complete(Err(e));
            Err(())
        }
    }
}

fn read_reply(
    stream: &mut TcpStream,
    request_id: u32,
    timeout_ms: u32,
    streams: &StreamManager,
) -> Result<FlatBuffer, Error> {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms.max(1) as u64);

    loop {
        match read_frame_with_deadline(stream, deadline, POLL) {
            Ok(Some(frame)) => {
                let fb = FlatBuffer::from_vec(frame);
                if Header::peek_msg_id(fb.as_slice()).is_some_and(|id| id.is_stream()) {
                    streams.handle_message(&fb);
                    continue;
                }
                if raw_request_id(fb.as_slice()) == request_id {
                    return Ok(fb);
                }
                trace!(
                    "discarding stale reply (request {})",
                    raw_request_id(fb.as_slice())
                );
            }
            Ok(None) => return Err(Error::Timeout),
            Err(e) => {
                warn!("read failed: {e}");
                return Err(Error::CommFailure);
            }
        }
    }
}

/// With no request in flight, keep draining unsolicited stream traffic so
/// chunks flow while the queue is idle.
fn poll_stream_frames(stream: &mut TcpStream, streams: &StreamManager) {
    loop {
        let deadline = Instant::now() + Duration::from_millis(5);
        match read_frame_with_deadline(stream, deadline, Duration::from_millis(5)) {
            Ok(Some(frame)) => {
                let fb = FlatBuffer::from_vec(frame);
                if Header::peek_msg_id(fb.as_slice()).is_some_and(|id| id.is_stream()) {
                    streams.handle_message(&fb);
                } else {
                    trace!("discarding stale reply while idle");
                }
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
}

fn raw_request_id(data: &[u8]) -> u32 {
    if data.len() >= Header::SIZE {
        u32::from_le_bytes(data[12..16].try_into().unwrap())
    } else {
        0
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub(crate) struct AcceptorHandle {
    port: u16,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl AcceptorHandle {
    pub(crate) fn assemble(port: u16, stop: Arc<AtomicBool>, join: JoinHandle<()>) -> Self {
        Self {
            port,
            stop,
            join: Some(join),
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for AcceptorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bind the TCP listener (port 0 requests an ephemeral port) and start
/// the accept thread.
pub(crate) fn start_server(rt: &Arc<Runtime>, port: u16) -> Result<AcceptorHandle, Error> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    let _ = nix::sys::socket::setsockopt(&listener, nix::sys::socket::sockopt::ReuseAddr, &true);
    let port = listener.local_addr()?.port();
    listener.set_nonblocking(true)?;

    let stop = Arc::new(AtomicBool::new(false));
    let weak = Arc::downgrade(rt);
    let join = {
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || accept_loop(listener, weak, stop, handle_connection))
    };

    debug!("TCP acceptor listening on port {port}");

    Ok(AcceptorHandle {
        port,
        stop,
        join: Some(join),
    })
}

pub(crate) fn accept_loop(
    listener: TcpListener,
    rt: Weak<Runtime>,
    stop: Arc<AtomicBool>,
    handler: fn(Weak<Runtime>, TcpStream, std::net::SocketAddr),
) {
    while !stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let _ = stream.set_nonblocking(false);
                let rt = rt.clone();
                std::thread::spawn(move || handler(rt, stream, peer));
            }
            Err(e) if is_timeout(&e) => std::thread::sleep(POLL),
            Err(e) => {
                warn!("error accepting connection: {e}");
                std::thread::sleep(POLL);
            }
        }
    }
}

struct ServerSink {
    stream: Mutex<TcpStream>,
}

impl MessageSink for ServerSink {
    fn send_message(&self, buf: FlatBuffer) -> Result<(), Error> {
        if buf.overflowed() {
            return Err(Error::NoBufferSpace);
        }
        let mut stream = self.stream.lock().unwrap();
        write_frame(&mut *stream, buf.as_slice())?;
        stream.flush()?;
        Ok(())
    }
}

fn handle_connection(rt: Weak<Runtime>, mut stream: TcpStream, peer: std::net::SocketAddr) {
    let _ = stream.set_nodelay(true);

    let endpoint = EndPoint::new(EndPointType::Tcp, peer.ip().to_string(), peer.port());
    let mut ctx = SessionContext::new(endpoint.clone());

    let Ok(write_half) = stream.try_clone() else {
        return;
    };
    let sink = Arc::new(ServerSink {
        stream: Mutex::new(write_half),
    });
    let manager = StreamManager::new();
    manager.set_sink(sink.clone());
    ctx.stream_manager = Some(Arc::clone(&manager));

    trace!("accepted TCP connection from {endpoint}");

    loop {
        let frame = match read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(e) => {
                if e.kind() == std::io::ErrorKind::InvalidData {
                    warn!("disconnecting {endpoint}: {e}");
                }
                break;
            }
        };

        let Some(rt) = rt.upgrade() else { break };

        let rx = FlatBuffer::from_vec(frame);
        let mut tx = FlatBuffer::new();
        if dispatch::handle_request(&rt, &mut ctx, &rx, &mut tx) {
            if let Err(e) = sink.send_message(tx) {
                warn!("reply to {endpoint} failed: {e}");
                break;
            }
        }
    }

    manager.close();
    if let Some(rt) = rt.upgrade() {
        ctx.ref_list.drain(&rt);
    }
    trace!("connection from {endpoint} closed");
}
