// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The nameserver: bind object references under well-known names and
//! resolve them from any process. An ordinary application built on the
//! core runtime: interface index 0, function 0 = Bind, function 1 =
//! Resolve.

pub mod server;

use std::sync::Arc;

use nprpc::buffer::Reader;
use nprpc::message::{self, CallHeader, Header, MessageId, MessageType, CALL_PAYLOAD_OFFSET};
use nprpc::object::{handle_standard_reply, StandardReply};
use nprpc::session::next_request_id;
use nprpc::{
    Error, FlatBuffer, Object, ObjectId, Proxy, Runtime, Servant, SessionContext,
};

pub const NAMESERVER_CLASS_ID: &str = "nprpc.Nameserver";

/// The nameserver's well-known identity: slot 0 of POA 0, user-supplied.
pub const NAMESERVER_OID: u64 = 0;

const FN_BIND: u8 = 0;
const FN_RESOLVE: u8 = 1;

/// Client proxy.
pub struct Nameserver {
    object: Arc<Object>,
}

impl Proxy for Nameserver {
    const CLASS_ID: &'static str = NAMESERVER_CLASS_ID;
    const INTERFACE_IDX: u8 = 0;

    fn from_object(obj: Arc<Object>) -> Self {
        Self { object: obj }
    }

    fn object(&self) -> &Arc<Object> {
        &self.object
    }
}

impl Nameserver {
    /// A proxy for the nameserver reachable at `url`
    /// (e.g. `tcp://192.168.1.2:15000`).
    pub fn connect(rt: &Arc<Runtime>, url: &str) -> Result<Self, Error> {
        url.parse::<nprpc::EndPoint>()?;

        let data = ObjectId {
            object_id: NAMESERVER_OID,
            poa_idx: 0,
            flags: 0,
            class_id: NAMESERVER_CLASS_ID.to_string(),
            urls: vec![url.to_string()],
        };

        Ok(Self {
            object: Object::new(Arc::clone(rt), data),
        })
    }

    fn call_header(&self, function_idx: u8) -> CallHeader {
        CallHeader {
            poa_idx: self.object.poa_idx(),
            interface_idx: Self::INTERFACE_IDX,
            function_idx,
            object_id: self.object.object_id(),
        }
    }

    /// Bind `obj` under `name`, replacing any previous binding.
    pub fn bind(&self, obj: &ObjectId, name: &str) -> Result<(), Error> {
        let mut buf = FlatBuffer::new();
        message::begin_call(&mut buf, &self.call_header(FN_BIND), next_request_id());
        obj.marshal(&mut buf);
        buf.write_str(name);
        message::finalize(&mut buf);

        let reply = self.object.call(buf)?;
        match handle_standard_reply(&reply)? {
            StandardReply::Success => Ok(()),
            StandardReply::Block => {
                log::warn!("received an unusual reply for a function with no output arguments");
                Ok(())
            }
        }
    }

    /// Resolve `name`; `None` when no binding exists.
    pub fn resolve(&self, name: &str) -> Result<Option<ObjectId>, Error> {
        let mut buf = FlatBuffer::new();
        message::begin_call(&mut buf, &self.call_header(FN_RESOLVE), next_request_id());
        buf.write_str(name);
        message::finalize(&mut buf);

        let reply = self.object.call(buf)?;
        match handle_standard_reply(&reply)? {
            StandardReply::Block => {}
            StandardReply::Success => return Err(Error::BadInput),
        }

        let mut r = Reader::at(reply.as_slice(), Header::SIZE);
        let found = r.read_u8()? != 0;
        let oid = ObjectId::unmarshal(&mut r)?;
        Ok(found.then_some(oid))
    }

    /// Resolve and construct a live proxy in one step.
    pub fn resolve_object(&self, name: &str) -> Result<Option<Arc<Object>>, Error> {
        let Some(oid) = self.resolve(name)? else {
            return Ok(None);
        };
        Ok(self.object.runtime().create_object_from_id(oid))
    }
}

/// What a nameserver implementation provides.
pub trait NameserverService: Send + Sync {
    fn bind(&self, obj: ObjectId, name: &str);
    fn resolve(&self, name: &str) -> Option<ObjectId>;
}

/// Servant glue: unmarshal arguments, invoke the service, marshal the
/// reply.
pub struct NameserverServant<T: NameserverService> {
    service: T,
}

impl<T: NameserverService> NameserverServant<T> {
    pub fn new(service: T) -> Self {
        Self { service }
    }
}

impl<T: NameserverService> Servant for NameserverServant<T> {
    fn class_id(&self) -> &'static str {
        NAMESERVER_CLASS_ID
    }

    fn dispatch(
        &self,
        _ctx: &mut SessionContext,
        rx: &FlatBuffer,
        tx: &mut FlatBuffer,
        _from_parent: bool,
    ) -> Result<(), Error> {
        let header = Header::decode(rx.as_slice())?;
        let ch = CallHeader::decode(&rx.as_slice()[Header::SIZE..])?;

        match ch.function_idx {
            FN_BIND => {
                let mut r = Reader::at(rx.as_slice(), CALL_PAYLOAD_OFFSET);
                let obj = ObjectId::unmarshal(&mut r)?;
                let name = r.read_str()?;
                self.service.bind(obj, &name);
                message::make_simple_answer(tx, MessageId::Success, header.request_id);
                Ok(())
            }
            FN_RESOLVE => {
                let mut r = Reader::at(rx.as_slice(), CALL_PAYLOAD_OFFSET);
                let name = r.read_str()?;
                let found = self.service.resolve(&name);

                tx.clear();
                tx.write_bytes(
                    &Header {
                        size: 0,
                        msg_id: MessageId::BlockResponse,
                        msg_type: MessageType::Answer,
                        request_id: header.request_id,
                    }
                    .encode(),
                );
                tx.write_u8(found.is_some() as u8);
                found.unwrap_or_else(ObjectId::invalid).marshal(tx);
                message::finalize(tx);
                Ok(())
            }
            _ => Err(Error::UnknownFunctionIdx),
        }
    }
}
