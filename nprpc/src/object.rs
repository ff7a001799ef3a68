// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Object identity, the servant capability, and the client-side proxy
//! runtime.
//!
//! An [`ObjectId`] is globally routable: given its URL list any client can
//! construct an [`Object`] reference and invoke methods on it. Generated
//! (or hand-written) typed proxies wrap an `Object` and implement
//! [`Proxy`]; servant implementations implement [`Servant`] and are
//! activated in a [`crate::Poa`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use log::*;

use crate::buffer::{FlatBuffer, Reader};
use crate::endpoint::{EndPoint, EndPointType};
use crate::message::{self, Header, MessageId, MessageType};
use crate::runtime::Runtime;
use crate::session::{Session, SessionContext};
use crate::{Error, INVALID_OBJECT_ID};

/// Selects which of the process's enabled listeners are advertised in a
/// freshly activated object's URL list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectActivationFlags(pub u32);

impl ObjectActivationFlags {
    pub const ALLOW_TCP: Self = Self(1);
    pub const ALLOW_WEBSOCKET: Self = Self(2);
    pub const ALLOW_UDP: Self = Self(4);
    pub const ALLOW_SHARED_MEMORY: Self = Self(8);
    pub const ALLOW_ALL: Self = Self(0xF);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ObjectActivationFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// The wire-visible identity of an object: its `(poa_idx, oid)` pair, the
/// class id of its most derived interface, and the endpoint URLs it is
/// reachable through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectId {
    pub object_id: u64,
    pub poa_idx: u16,
    pub flags: u16,
    pub class_id: String,
    pub urls: Vec<String>,
}

impl ObjectId {
    pub fn is_valid(&self) -> bool {
        self.object_id != INVALID_OBJECT_ID
    }

    pub fn invalid() -> Self {
        Self {
            object_id: INVALID_OBJECT_ID,
            poa_idx: 0,
            flags: 0,
            class_id: String::new(),
            urls: Vec::new(),
        }
    }

    pub fn marshal(&self, buf: &mut FlatBuffer) {
        buf.write_u64(self.object_id);
        buf.write_u16(self.poa_idx);
        buf.write_u16(self.flags);
        buf.write_str(&self.class_id);
        buf.write_u32(self.urls.len() as u32);
        for url in &self.urls {
            buf.write_str(url);
        }
    }

    pub fn unmarshal(r: &mut Reader) -> Result<Self, Error> {
        let object_id = r.read_u64()?;
        let poa_idx = r.read_u16()?;
        let flags = r.read_u16()?;
        let class_id = r.read_str()?;
        let n = r.read_u32()?;
        // A hostile peer could claim an enormous list; every entry still
        // has to fit in the message.
        if n as usize > r.remaining() / 4 {
            return Err(Error::BadInput);
        }
        let mut urls = Vec::with_capacity(n as usize);
        for _ in 0..n {
            urls.push(r.read_str()?);
        }
        Ok(Self {
            object_id,
            poa_idx,
            flags,
            class_id,
            urls,
        })
    }
}

/// Server-side implementation of an interface.
///
/// `dispatch` switches on the function index in the call header, invokes
/// the implementation, and marshals the reply into `tx`. Returning `Err`
/// makes the dispatch loop answer with the corresponding error envelope;
/// the session survives.
pub trait Servant: Send + Sync {
    fn class_id(&self) -> &'static str;

    fn dispatch(
        &self,
        ctx: &mut SessionContext,
        rx: &FlatBuffer,
        tx: &mut FlatBuffer,
        from_parent: bool,
    ) -> Result<(), Error>;

    /// Gate access per session; a refusal is answered with `BadAccess`.
    fn validate_session(&self, _ctx: &SessionContext) -> bool {
        true
    }
}

/// Client-side local representative of a remote object.
///
/// Holds the object's identity and URL list, the cached endpoint choice,
/// and the per-proxy call timeout.
pub struct Object {
    runtime: Arc<Runtime>,
    data: ObjectId,
    endpoint: Mutex<Option<EndPoint>>,
    timeout_ms: AtomicU32,
}

pub const DEFAULT_CALL_TIMEOUT_MS: u32 = 5000;

impl Object {
    pub fn new(runtime: Arc<Runtime>, data: ObjectId) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            data,
            endpoint: Mutex::new(None),
            timeout_ms: AtomicU32::new(DEFAULT_CALL_TIMEOUT_MS),
        })
    }

    pub fn data(&self) -> &ObjectId {
        &self.data
    }

    pub fn object_id(&self) -> u64 {
        self.data.object_id
    }

    pub fn poa_idx(&self) -> u16 {
        self.data.poa_idx
    }

    pub fn class_id(&self) -> &str {
        &self.data.class_id
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms.load(Ordering::Relaxed)
    }

    pub fn set_timeout(&self, ms: u32) {
        self.timeout_ms.store(ms, Ordering::Relaxed);
    }

    /// The cached endpoint, if one has been selected.
    pub fn endpoint(&self) -> Option<EndPoint> {
        self.endpoint.lock().unwrap().clone()
    }

    /// Pick the preferred transport and return the matching session from
    /// the ORB's table (constructing it on first use): shared memory when
    /// the peer is reachable locally, then TCP, then WebSocket. UDP is
    /// excluded here; it only carries fire-and-forget datagrams.
    pub fn select_session(&self) -> Result<Arc<dyn Session>, Error> {
        if let Some(ep) = self.endpoint() {
            return self.runtime.get_session(&ep);
        }

        const PREFERENCE: [EndPointType; 4] = [
            EndPointType::SharedMemory,
            EndPointType::Tcp,
            EndPointType::WebSocket,
            EndPointType::SecuredWebSocket,
        ];

        for type_ in PREFERENCE {
            for url in &self.data.urls {
                let Ok(ep) = url.parse::<EndPoint>() else {
                    continue;
                };
                if ep.type_() != type_ {
                    continue;
                }
                match self.runtime.get_session(&ep) {
                    Ok(session) => {
                        *self.endpoint.lock().unwrap() = Some(ep);
                        return Ok(session);
                    }
                    Err(e) => {
                        debug!("endpoint {ep} unreachable: {e}");
                    }
                }
            }
        }

        Err(Error::CommFailure)
    }

    /// Synchronous request/response on the object's session. The request
    /// buffer is consumed; the reply buffer is returned.
    pub fn call(&self, buf: FlatBuffer) -> Result<FlatBuffer, Error> {
        self.select_session()?.send_receive(buf, self.timeout_ms())
    }

    /// Fire-and-forget: prefers a UDP endpoint when the object advertises
    /// one, otherwise routes through the regular session's datagram path.
    pub fn send_datagram(&self, buf: FlatBuffer) -> Result<(), Error> {
        for url in &self.data.urls {
            if let Ok(ep) = url.parse::<EndPoint>() {
                if ep.type_() == EndPointType::Udp {
                    return self.runtime.get_session(&ep)?.send_datagram(buf);
                }
            }
        }
        self.select_session()?.send_datagram(buf)
    }

    /// Ask the peer to take a reference on behalf of this process.
    pub fn add_reference(&self) -> Result<(), Error> {
        let reply = self.call(local_id_message(
            MessageId::AddReference,
            self.data.poa_idx,
            self.data.object_id,
        ))?;
        expect_success(&reply)
    }

    fn release_remote(&self) {
        let msg = local_id_message(
            MessageId::ReleaseObject,
            self.data.poa_idx,
            self.data.object_id,
        );
        if let Ok(session) = self.select_session() {
            let _ = session.send_datagram(msg);
        }
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        // Best effort; a dead peer has already dropped our references.
        self.release_remote();
    }
}

/// Typed client proxy over an [`Object`] reference.
pub trait Proxy: Sized {
    const CLASS_ID: &'static str;
    const INTERFACE_IDX: u8;

    fn from_object(obj: Arc<Object>) -> Self;
    fn object(&self) -> &Arc<Object>;

    /// Class-id checked downcast from a generic reference.
    fn narrow(obj: Arc<Object>) -> Option<Self> {
        if obj.class_id() == Self::CLASS_ID {
            Some(Self::from_object(obj))
        } else {
            None
        }
    }

    fn interface_idx(&self) -> u8 {
        Self::INTERFACE_IDX
    }

    fn endpoint(&self) -> Option<EndPoint> {
        self.object().endpoint()
    }

    fn object_id(&self) -> u64 {
        self.object().object_id()
    }
}

/// A header-only `AddReference`/`ReleaseObject` message addressing a local
/// `(poa_idx, oid)` pair on the peer: `u16 poa_idx`, six bytes of padding,
/// `u64 object_id`.
pub fn local_id_message(msg_id: MessageId, poa_idx: u16, object_id: u64) -> FlatBuffer {
    let mut buf = FlatBuffer::with_capacity(Header::SIZE + 16);
    buf.write_bytes(
        &Header {
            size: 0,
            msg_id,
            msg_type: MessageType::Request,
            request_id: 0,
        }
        .encode(),
    );
    buf.write_u16(poa_idx);
    buf.write_bytes(&[0u8; 6]);
    buf.write_u64(object_id);
    message::finalize(&mut buf);
    buf
}

pub fn parse_local_id(buf: &FlatBuffer) -> Result<(u16, u64), Error> {
    let mut r = Reader::at(buf.as_slice(), Header::SIZE);
    let poa_idx = r.read_u16()?;
    r.read_bytes(6)?;
    let object_id = r.read_u64()?;
    Ok((poa_idx, object_id))
}

/// The two reply shapes a stub accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandardReply {
    /// Void return, header only.
    Success,
    /// Out-arguments (or an exception payload) follow the header.
    Block,
}

/// Inspect a reply envelope: map `Error_*` onto the matching error kind,
/// decode a typed exception payload, or hand the reply back to the stub
/// for unmarshalling.
pub fn handle_standard_reply(buf: &FlatBuffer) -> Result<StandardReply, Error> {
    let header = Header::decode(buf.as_slice())?;
    match header.msg_id {
        MessageId::Success => Ok(StandardReply::Success),
        MessageId::BlockResponse => {
            if let Some(err) = decode_exception(buf) {
                return Err(err);
            }
            Ok(StandardReply::Block)
        }
        other => Err(other.to_error().unwrap_or(Error::BadInput)),
    }
}

fn expect_success(buf: &FlatBuffer) -> Result<(), Error> {
    match handle_standard_reply(buf)? {
        StandardReply::Success => Ok(()),
        StandardReply::Block => {
            warn!("received an unusual reply for a function with no output arguments");
            Ok(())
        }
    }
}

/// Reserved discriminator marking a `BlockResponse` payload as a typed
/// application exception rather than out-arguments.
pub const EXCEPTION_DISCRIMINATOR: u32 = 0xFFFF_FFFF;

/// Serialise a typed application exception into `tx` with
/// `msg_id = BlockResponse`, preserving the request id.
pub fn write_exception(tx: &mut FlatBuffer, request_id: u32, class_id: u32, payload: &[u8]) {
    tx.clear();
    tx.write_bytes(
        &Header {
            size: 0,
            msg_id: MessageId::BlockResponse,
            msg_type: MessageType::Answer,
            request_id,
        }
        .encode(),
    );
    tx.write_u32(EXCEPTION_DISCRIMINATOR);
    tx.write_u32(class_id);
    tx.write_bytes(payload);
    message::finalize(tx);
}

fn decode_exception(buf: &FlatBuffer) -> Option<Error> {
    let mut r = Reader::at(buf.as_slice(), Header::SIZE);
    if r.read_u32().ok()? != EXCEPTION_DISCRIMINATOR {
        return None;
    }
    let class_id = r.read_u32().ok()?;
    let data = r.read_bytes(r.remaining()).ok()?.to_vec();
    Some(Error::AppException { class_id, data })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_marshal_round_trip() {
        let oid = ObjectId {
            object_id: (3u64 << 32) | 7,
            poa_idx: 2,
            flags: 0,
            class_id: "test/Echo".to_string(),
            urls: vec![
                "tcp://127.0.0.1:15000".to_string(),
                "mem://nsA".to_string(),
            ],
        };

        let mut buf = FlatBuffer::new();
        oid.marshal(&mut buf);
        let mut r = Reader::new(buf.as_slice());
        assert_eq!(ObjectId::unmarshal(&mut r).unwrap(), oid);
    }

    #[test]
    fn object_id_unmarshal_rejects_truncation() {
        let oid = ObjectId::invalid();
        let mut buf = FlatBuffer::new();
        oid.marshal(&mut buf);

        let bytes = buf.as_slice();
        let mut r = Reader::new(&bytes[..bytes.len() - 1]);
        // invalid() has empty vectors, so cut into the url count instead.
        assert!(ObjectId::unmarshal(&mut r).is_err());
    }

    #[test]
    fn local_id_message_round_trip() {
        let buf = local_id_message(MessageId::AddReference, 3, 99);
        let header = Header::decode(buf.as_slice()).unwrap();
        assert_eq!(header.msg_id, MessageId::AddReference);
        assert_eq!(buf.len(), header.size as usize + 4);
        assert_eq!(parse_local_id(&buf).unwrap(), (3, 99));
    }

    #[test]
    fn exception_payload_round_trip() {
        let mut tx = FlatBuffer::new();
        write_exception(&mut tx, 5, 42, b"details");

        let header = Header::decode(tx.as_slice()).unwrap();
        assert_eq!(header.request_id, 5);
        assert_eq!(header.msg_id, MessageId::BlockResponse);

        match handle_standard_reply(&tx) {
            Err(Error::AppException { class_id, data }) => {
                assert_eq!(class_id, 42);
                assert_eq!(data, b"details");
            }
            other => panic!("expected AppException, got {other:?}"),
        }
    }

    #[test]
    fn error_replies_map_to_error_kinds() {
        let mut buf = FlatBuffer::new();
        message::make_simple_answer(&mut buf, MessageId::Error_ObjectNotExist, 1);
        assert!(matches!(
            handle_standard_reply(&buf),
            Err(Error::ObjectNotExist)
        ));

        message::make_simple_answer(&mut buf, MessageId::Error_Timeout, 1);
        assert!(matches!(handle_standard_reply(&buf), Err(Error::Timeout)));
    }
}
