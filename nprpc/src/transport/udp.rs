// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! UDP datagram sessions. Fire-and-forget calls (`request_id = 0`) send a
//! single datagram and keep no state; correlated calls wait for a reply
//! datagram carrying the same request id. No retransmission; the caller
//! observes a timeout.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use log::*;

use crate::buffer::FlatBuffer;
use crate::dispatch;
use crate::endpoint::{EndPoint, EndPointType};
use crate::message::{Header, MessageId};
use crate::runtime::Runtime;
use crate::session::{SendHandler, Session, SessionContext};
use crate::transport::is_timeout;
use crate::Error;

const POLL: Duration = Duration::from_millis(100);

/// Larger than any datagram a v4 UDP socket can carry.
const DATAGRAM_BUF: usize = 65536;

fn bump_receive_buffer(socket: &UdpSocket) {
    // Matches the original's receive_buffer_size(65536) socket option.
    if let Err(e) = nix::sys::socket::setsockopt(socket, nix::sys::socket::sockopt::RcvBuf, &DATAGRAM_BUF)
    {
        debug!("could not grow UDP receive buffer: {e}");
    }
}

// ---------------------------------------------------------------------------
// Client session
// ---------------------------------------------------------------------------

pub struct UdpSession {
    endpoint: EndPoint,
    socket: UdpSocket,
    // One correlated exchange at a time; datagrams bypass this.
    call_lock: Mutex<()>,
    closed: AtomicBool,
}

impl UdpSession {
    pub fn connect(endpoint: &EndPoint) -> Result<Arc<Self>, Error> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        bump_receive_buffer(&socket);
        socket.connect((endpoint.hostname(), endpoint.port()))?;

        Ok(Arc::new(Self {
            endpoint: endpoint.clone(),
            socket,
            call_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }))
    }

    fn send_checked(&self, buf: &FlatBuffer) -> Result<(), Error> {
        if buf.overflowed() {
            return Err(Error::NoBufferSpace);
        }
        if buf.len() > DATAGRAM_BUF {
            return Err(Error::NoBufferSpace);
        }
        self.socket.send(buf.as_slice())?;
        Ok(())
    }
}

impl Session for UdpSession {
    fn remote_endpoint(&self) -> &EndPoint {
        &self.endpoint
    }

    fn send_receive(&self, buf: FlatBuffer, timeout_ms: u32) -> Result<FlatBuffer, Error> {
        let _guard = self.call_lock.lock().unwrap();

        let request_id = if buf.len() >= Header::SIZE {
            u32::from_le_bytes(buf.as_slice()[12..16].try_into().unwrap())
        } else {
            0
        };

        self.send_checked(&buf)?;

        let deadline = Instant::now() + Duration::from_millis(timeout_ms.max(1) as u64);
        let mut datagram = vec![0u8; DATAGRAM_BUF];

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            self.socket
                .set_read_timeout(Some((deadline - now).min(POLL)))?;

            match self.socket.recv(&mut datagram) {
                Ok(n) => {
                    if n < Header::SIZE {
                        continue;
                    }
                    let Ok(header) = Header::decode(&datagram[..n]) else {
                        continue;
                    };
                    if header.size as usize + 4 != n {
                        continue;
                    }
                    if header.request_id == request_id {
                        return Ok(FlatBuffer::from_vec(datagram[..n].to_vec()));
                    }
                }
                Err(e) if is_timeout(&e) => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    fn send_receive_async(&self, buf: FlatBuffer, handler: Option<SendHandler>, timeout_ms: u32) {
        // The socket pool is cheap to clone; a correlated async call gets
        // its own socket so it does not serialise behind sync callers.
        let Ok(socket) = self.socket.try_clone() else {
            if let Some(h) = handler {
                h(Err(Error::CommFailure));
            }
            return;
        };
        let endpoint = self.endpoint.clone();
        std::thread::spawn(move || {
            let session = UdpSession {
                endpoint,
                socket,
                call_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
            };
            let result = session.send_receive(buf, timeout_ms);
            if let Some(h) = handler {
                h(result);
            }
        });
    }

    fn send_datagram(&self, buf: FlatBuffer) -> Result<(), Error> {
        self.send_checked(&buf)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Bind the UDP listener and start the receive thread.
pub(crate) fn start_server(
    rt: &Arc<Runtime>,
    port: u16,
) -> Result<super::tcp::AcceptorHandle, Error> {
    let socket = UdpSocket::bind(("0.0.0.0", port))?;
    bump_receive_buffer(&socket);
    let port = socket.local_addr()?.port();
    socket.set_read_timeout(Some(POLL))?;

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let weak = Arc::downgrade(rt);
    let join = {
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || listen_loop(socket, weak, stop))
    };

    debug!("UDP listener on port {port}");

    Ok(super::tcp::AcceptorHandle::assemble(port, stop, join))
}

fn listen_loop(socket: UdpSocket, rt: Weak<Runtime>, stop: Arc<AtomicBool>) {
    let mut datagram = vec![0u8; DATAGRAM_BUF];

    while !stop.load(Ordering::Acquire) {
        let (n, sender) = match socket.recv_from(&mut datagram) {
            Ok(v) => v,
            Err(e) if is_timeout(&e) => continue,
            Err(e) => {
                warn!("UDP receive error: {e}");
                continue;
            }
        };

        if n < Header::SIZE {
            debug!("datagram too small: {n} bytes");
            continue;
        }
        let Ok(header) = Header::decode(&datagram[..n]) else {
            debug!("datagram with undecodable header from {sender}");
            continue;
        };
        if header.size as usize + 4 != n {
            debug!(
                "datagram size mismatch: header says {} but received {n}",
                header.size as usize + 4
            );
            continue;
        }
        if header.msg_id != MessageId::FunctionCall {
            debug!("unexpected datagram message id: {:?}", header.msg_id);
            continue;
        }

        let Some(rt) = rt.upgrade() else { break };

        let endpoint = EndPoint::new(EndPointType::Udp, sender.ip().to_string(), sender.port());
        let mut ctx = SessionContext::new(endpoint);

        let rx = FlatBuffer::from_vec(datagram[..n].to_vec());
        let mut tx = FlatBuffer::new();
        let has_reply = dispatch::handle_request(&rt, &mut ctx, &rx, &mut tx);

        // Fire-and-forget leaves no state; correlated calls are answered
        // back to the sender's endpoint with the request id preserved.
        if header.request_id != 0 && has_reply && !tx.overflowed() {
            if let Err(e) = socket.send_to(tx.as_slice(), sender) {
                debug!("reply datagram to {sender} failed: {e}");
            }
        }

        ctx.ref_list.drain(&rt);
    }
}
