// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! WebSocket sessions. One RPC envelope travels as one binary WebSocket
//! message; past the upgrade handshake the session behaves exactly like a
//! TCP session (same limits, same reconnect policy). The upgrade
//! request's `Cookie` header is captured into the session context for the
//! HTTP-auth layer.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use log::*;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::protocol::WebSocketConfig;
use tungstenite::{Message, WebSocket};

use crate::buffer::FlatBuffer;
use crate::dispatch;
use crate::endpoint::{EndPoint, EndPointType};
use crate::message::Header;
use crate::runtime::Runtime;
use crate::session::{MessageSink, SendHandler, Session, SessionContext};
use crate::streams::StreamManager;
use crate::transport::{is_reconnectable, is_timeout};
use crate::{Error, MAX_MESSAGE_SIZE, MAX_WRITE_QUEUE_SIZE};

const POLL: Duration = Duration::from_millis(50);

fn ws_config() -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(Some(MAX_MESSAGE_SIZE as usize))
        .max_frame_size(Some(MAX_MESSAGE_SIZE as usize))
}

/// Validate an inbound binary payload as an RPC envelope.
fn check_envelope(data: &[u8]) -> Result<(), Error> {
    if data.len() < Header::SIZE {
        return Err(Error::BadInput);
    }
    let header = Header::decode(data)?;
    if header.size as usize + 4 != data.len() {
        return Err(Error::BadInput);
    }
    Ok(())
}

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

pub struct WsSession {
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
            .map_err(|_| Error::NoBufferSpace)
    }
}

fn ws_connect(endpoint: &EndPoint) -> Result<WebSocket<TcpStream>, Error> {
    if endpoint.type_() == EndPointType::SecuredWebSocket {
        // TLS is the stream adapter's concern, not the core's.
        return Err(Error::CommFailure);
    }

    let stream = TcpStream::connect((endpoint.hostname(), endpoint.port()))?;
    let _ = stream.set_nodelay(true);

    let url = format!("ws://{}:{}/", endpoint.hostname(), endpoint.port());
    let (ws, _response) = tungstenite::client::client_with_config(url, stream, Some(ws_config()))
        .map_err(|e| {
            warn!("websocket handshake with {endpoint} failed: {e}");
            Error::CommFailure
        })?;
    Ok(ws)
}

impl WsSession {
    pub fn connect(endpoint: &EndPoint) -> Result<Arc<Self>, Error> {
        let ws = ws_connect(endpoint)?;
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
        std::thread::spawn(move || io_loop(ws, rx, endpoint, closed, streams));

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

impl Session for WsSession {
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
        cell.wait(
            Duration::from_millis(timeout_ms as u64).saturating_mul(2) + Duration::from_secs(10),
        )
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

fn set_ws_timeout(ws: &WebSocket<TcpStream>, d: Option<Duration>) {
    let _ = ws.get_ref().set_read_timeout(d);
}

fn ws_io_error(e: &tungstenite::Error) -> Option<&std::io::Error> {
    match e {
        tungstenite::Error::Io(io) => Some(io),
        _ => None,
    }
}

fn io_loop(
    mut ws: WebSocket<TcpStream>,
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
                if process_work(&mut ws, &endpoint, work, &streams).is_err() {
                    broken = true;
                    closed.store(true, Ordering::Release);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if closed.load(Ordering::Acquire) {
                    break;
                }
                if !broken {
                    poll_stream_messages(&mut ws, &streams);
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    let _ = ws.close(None);
    streams.close();
    trace!("websocket session {endpoint} I/O thread exiting");
}

fn send_binary(ws: &mut WebSocket<TcpStream>, data: &[u8]) -> Result<(), tungstenite::Error> {
    ws.send(Message::binary(data.to_vec()))
}

fn process_work(
    ws: &mut WebSocket<TcpStream>,
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

    if let Err(e) = send_binary(ws, buf.as_slice()) {
        let reconnectable = ws_io_error(&e).is_some_and(is_reconnectable);
        if !reconnectable {
            warn!("send to {endpoint} failed: {e}");
            completion.complete(Err(Error::CommFailure));
            return Err(());
        }
        debug!("send to {endpoint} failed ({e}); reconnecting");
        match ws_connect(endpoint) {
            Ok(new_ws) => {
                *ws = new_ws;
                if let Err(e) = send_binary(ws, buf.as_slice()) {
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
    }

    let expects_reply = !matches!(completion, Completion::WriteOnly) && request_id != 0;
    if !expects_reply {
        completion.complete(Ok(FlatBuffer::new()));
        return Ok(());
    }

    match read_reply(ws, request_id, timeout_ms, streams) {
        Ok(reply) => {
            completion.complete(Ok(reply));
            Ok(())
        }
        Err(Error::Timeout) => {
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
    ws: &mut WebSocket<TcpStream>,
    request_id: u32,
    timeout_ms: u32,
    streams: &StreamManager,
) -> Result<FlatBuffer, Error> {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms.max(1) as u64);

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout);
        }
        set_ws_timeout(ws, Some((deadline - now).min(POLL)));

        match ws.read() {
            Ok(Message::Binary(data)) => {
                let fb = FlatBuffer::from_vec(data.to_vec());
                if check_envelope(fb.as_slice()).is_err() {
                    continue;
                }
                if Header::peek_msg_id(fb.as_slice()).is_some_and(|id| id.is_stream()) {
                    streams.handle_message(&fb);
                    continue;
                }
                if raw_request_id(fb.as_slice()) == request_id {
                    return Ok(fb);
                }
            }
            Ok(Message::Close(_)) => return Err(Error::CommFailure),
            Ok(_) => continue,
            Err(e) if ws_io_error(&e).is_some_and(is_timeout) => continue,
            Err(e) => {
                warn!("websocket read failed: {e}");
                return Err(Error::CommFailure);
            }
        }
    }
}

fn poll_stream_messages(ws: &mut WebSocket<TcpStream>, streams: &StreamManager) {
    set_ws_timeout(ws, Some(Duration::from_millis(5)));
    loop {
        match ws.read() {
            Ok(Message::Binary(data)) => {
                let fb = FlatBuffer::from_vec(data.to_vec());
                if Header::peek_msg_id(fb.as_slice()).is_some_and(|id| id.is_stream()) {
                    streams.handle_message(&fb);
                }
            }
            Ok(_) => continue,
            Err(e) if ws_io_error(&e).is_some_and(is_timeout) => break,
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

/// Bind the WebSocket listener and start accepting upgrade handshakes.
pub(crate) fn start_server(
    rt: &Arc<Runtime>,
    port: u16,
) -> Result<super::tcp::AcceptorHandle, Error> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    let _ = nix::sys::socket::setsockopt(&listener, nix::sys::socket::sockopt::ReuseAddr, &true);
    let port = listener.local_addr()?.port();
    listener.set_nonblocking(true)?;

    let stop = Arc::new(AtomicBool::new(false));
    let weak = Arc::downgrade(rt);
    let join = {
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || super::tcp::accept_loop(listener, weak, stop, handle_upgrade))
    };

    debug!("WebSocket acceptor listening on port {port}");

    Ok(super::tcp::AcceptorHandle::assemble(port, stop, join))
}

struct WsServerSink {
    ws: Arc<Mutex<WebSocket<TcpStream>>>,
}

impl MessageSink for WsServerSink {
    fn send_message(&self, buf: FlatBuffer) -> Result<(), Error> {
        if buf.overflowed() {
            return Err(Error::NoBufferSpace);
        }
        let mut ws = self.ws.lock().unwrap();
        send_binary(&mut ws, buf.as_slice()).map_err(|e| {
            warn!("websocket send failed: {e}");
            Error::CommFailure
        })
    }
}

fn handle_upgrade(rt: Weak<Runtime>, stream: TcpStream, peer: std::net::SocketAddr) {
    let _ = stream.set_nodelay(true);

    let mut cookies = String::new();
    let ws = {
        let cookies = &mut cookies;
        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if let Some(value) = req.headers().get("Cookie") {
                *cookies = value.to_str().unwrap_or("").to_string();
            }
            Ok(resp)
        };
        match tungstenite::accept_hdr_with_config(stream, callback, Some(ws_config())) {
            Ok(ws) => ws,
            Err(e) => {
                warn!("websocket upgrade from {peer} failed: {e}");
                return;
            }
        }
    };

    let endpoint = EndPoint::new(EndPointType::WebSocket, peer.ip().to_string(), peer.port());
    let mut ctx = SessionContext::new(endpoint.clone());
    ctx.cookies = cookies;

    let ws = Arc::new(Mutex::new(ws));
    let sink = Arc::new(WsServerSink { ws: Arc::clone(&ws) });
    let manager = StreamManager::new();
    manager.set_sink(sink.clone());
    ctx.stream_manager = Some(Arc::clone(&manager));

    trace!("accepted websocket connection from {endpoint}");

    loop {
        // Short read timeouts so the sink (stream chunks) gets its turn at
        // the socket between polls.
        let message = {
            let mut guard = ws.lock().unwrap();
            set_ws_timeout(&guard, Some(POLL));
            guard.read()
        };

        let data = match message {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) if ws_io_error(&e).is_some_and(is_timeout) => {
                // Give the sink a fair shot at the socket lock.
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            Err(tungstenite::Error::Capacity(e)) => {
                warn!("disconnecting {endpoint}: oversized message: {e}");
                break;
            }
            Err(e) => {
                debug!("websocket connection from {endpoint} ended: {e}");
                break;
            }
        };

        let rx = FlatBuffer::from_vec(data.to_vec());
        if check_envelope(rx.as_slice()).is_err() {
            warn!("disconnecting {endpoint}: malformed envelope");
            break;
        }

        let Some(rt) = rt.upgrade() else { break };

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
    trace!("websocket connection from {endpoint} closed");
}
