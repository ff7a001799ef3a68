// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Fixtures shared by the end-to-end scenarios: a hand-marshalled Echo
//! interface (the role generated IDL stubs play in a real deployment)
//! plus small helpers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nprpc::buffer::Reader;
use nprpc::message::{self, CallHeader, Header, MessageId, MessageType, CALL_PAYLOAD_OFFSET};
use nprpc::object::handle_standard_reply;
use nprpc::session::next_request_id;
use nprpc::{
    Error, FlatBuffer, Object, ObjectId, Proxy, Runtime, Servant, SessionContext, StandardReply,
};

pub const ECHO_CLASS_ID: &str = "test/Echo";

/// `RUST_LOG`-driven logging for test debugging; safe to call repeatedly.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Unique names for shm listeners so parallel tests never collide.
pub fn unique_name(tag: &str) -> String {
    static SEQ: AtomicUsize = AtomicUsize::new(0);
    format!(
        "e2e_{tag}_{}_{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

/// Marshal an `i32` return value as a `BlockResponse`.
pub fn reply_i32(tx: &mut FlatBuffer, request_id: u32, value: i32) {
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
    tx.write_i32(value);
    message::finalize(tx);
}

/// `Echo.f(i32) -> i32`, with an optional artificial service delay for
/// the timeout scenarios.
pub struct EchoServant {
    pub delay: Duration,
}

impl EchoServant {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Servant for EchoServant {
    fn class_id(&self) -> &'static str {
        ECHO_CLASS_ID
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
            0 => {
                let mut r = Reader::at(rx.as_slice(), CALL_PAYLOAD_OFFSET);
                let value = r.read_i32()?;
                if !self.delay.is_zero() {
                    std::thread::sleep(self.delay);
                }
                reply_i32(tx, header.request_id, value);
                Ok(())
            }
            _ => Err(Error::UnknownFunctionIdx),
        }
    }
}

pub struct EchoProxy {
    object: Arc<Object>,
}

impl Proxy for EchoProxy {
    const CLASS_ID: &'static str = ECHO_CLASS_ID;
    const INTERFACE_IDX: u8 = 0;

    fn from_object(obj: Arc<Object>) -> Self {
        Self { object: obj }
    }

    fn object(&self) -> &Arc<Object> {
        &self.object
    }
}

impl EchoProxy {
    pub fn f(&self, value: i32) -> Result<i32, Error> {
        let mut buf = FlatBuffer::new();
        message::begin_call(
            &mut buf,
            &CallHeader {
                poa_idx: self.object.poa_idx(),
                interface_idx: Self::INTERFACE_IDX,
                function_idx: 0,
                object_id: self.object.object_id(),
            },
            next_request_id(),
        );
        buf.write_i32(value);
        message::finalize(&mut buf);

        let reply = self.object.call(buf)?;
        match handle_standard_reply(&reply)? {
            StandardReply::Block => {
                let mut r = Reader::at(reply.as_slice(), Header::SIZE);
                r.read_i32()
            }
            StandardReply::Success => Err(Error::BadInput),
        }
    }

    /// Raw variant returning the reply buffer itself, for asserting
    /// transport-level properties (zero-copy views).
    pub fn f_raw(&self, value: i32) -> Result<FlatBuffer, Error> {
        let mut buf = FlatBuffer::new();
        message::begin_call(
            &mut buf,
            &CallHeader {
                poa_idx: self.object.poa_idx(),
                interface_idx: Self::INTERFACE_IDX,
                function_idx: 0,
                object_id: self.object.object_id(),
            },
            next_request_id(),
        );
        buf.write_i32(value);
        message::finalize(&mut buf);
        self.object.call(buf)
    }
}

/// A proxy for an object id resolved from another process/runtime.
pub fn proxy_for(rt: &Arc<Runtime>, oid: ObjectId) -> EchoProxy {
    let object = rt
        .create_object_from_id(oid)
        .expect("object id should be valid");
    EchoProxy::narrow(object).expect("class id should match")
}
