// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Fire-and-forget over UDP with an acknowledgement called back over TCP:
//! the client registers a callback object, then datagrams position
//! updates; the server dispatches each update and invokes `Confirm` on
//! the registered callback exactly once per update.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use nprpc::buffer::Reader;
use nprpc::message::{self, CallHeader, Header, MessageId, CALL_PAYLOAD_OFFSET};
use nprpc::session::next_request_id;
use nprpc::{
    Error, FlatBuffer, Object, ObjectActivationFlags, ObjectId, PoaBuilder, RpcBuilder, Runtime,
    Servant, SessionContext,
};

const POSITION_CLASS_ID: &str = "test/PositionTracker";
const CALLBACK_CLASS_ID: &str = "test/AckCallback";

/// Server-side servant: fn 0 registers the ACK callback (regular TCP
/// call), fn 1 is the fire-and-forget position update.
struct PositionServant {
    runtime: Mutex<Weak<Runtime>>,
    callback: Mutex<Option<Arc<Object>>>,
}

impl PositionServant {
    fn new() -> Self {
        Self {
            runtime: Mutex::new(Weak::new()),
            callback: Mutex::new(None),
        }
    }

    fn attach(&self, rt: &Arc<Runtime>) {
        *self.runtime.lock().unwrap() = Arc::downgrade(rt);
    }

    fn confirm(&self, text: &str) -> Result<(), Error> {
        let callback = self.callback.lock().unwrap().clone();
        let Some(callback) = callback else {
            return Err(Error::ObjectNotExist);
        };

        let mut buf = FlatBuffer::new();
        message::begin_call(
            &mut buf,
            &CallHeader {
                poa_idx: callback.poa_idx(),
                interface_idx: 0,
                function_idx: 0,
                object_id: callback.object_id(),
            },
            next_request_id(),
        );
        buf.write_str(text);
        message::finalize(&mut buf);

        let reply = callback.call(buf)?;
        nprpc::handle_standard_reply(&reply)?;
        Ok(())
    }
}

impl Servant for PositionServant {
    fn class_id(&self) -> &'static str {
        POSITION_CLASS_ID
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
            // RegisterCallback(ObjectId)
            0 => {
                let mut r = Reader::at(rx.as_slice(), CALL_PAYLOAD_OFFSET);
                let oid = ObjectId::unmarshal(&mut r)?;
                let rt = self
                    .runtime
                    .lock()
                    .unwrap()
                    .upgrade()
                    .ok_or(Error::CommFailure)?;
                *self.callback.lock().unwrap() = rt.create_object_from_id(oid);
                message::make_simple_answer(tx, MessageId::Success, header.request_id);
                Ok(())
            }
            // UpdatePosition(id, position, orientation), fire-and-forget
            1 => {
                let mut r = Reader::at(rx.as_slice(), CALL_PAYLOAD_OFFSET);
                let _entity = r.read_u32()?;
                for _ in 0..3 {
                    let _coord = r.read_u32()?;
                }
                for _ in 0..4 {
                    let _quat = r.read_u32()?;
                }
                self.confirm("UpdatePosition ACK")?;
                message::make_simple_answer(tx, MessageId::Success, header.request_id);
                Ok(())
            }
            _ => Err(Error::UnknownFunctionIdx),
        }
    }
}

/// Client-side callback servant recording every Confirm it receives.
struct AckCallback {
    received: Arc<Mutex<Vec<String>>>,
}

impl Servant for AckCallback {
    fn class_id(&self) -> &'static str {
        CALLBACK_CLASS_ID
    }

    fn dispatch(
        &self,
        _ctx: &mut SessionContext,
        rx: &FlatBuffer,
        tx: &mut FlatBuffer,
        _from_parent: bool,
    ) -> Result<(), Error> {
        let header = Header::decode(rx.as_slice())?;
        let mut r = Reader::at(rx.as_slice(), CALL_PAYLOAD_OFFSET);
        let text = r.read_str()?;
        self.received.lock().unwrap().push(text);
        message::make_simple_answer(tx, MessageId::Success, header.request_id);
        Ok(())
    }
}

fn wait_for<T>(deadline: Duration, mut poll: impl FnMut() -> Option<T>) -> Option<T> {
    let end = Instant::now() + deadline;
    loop {
        if let Some(v) = poll() {
            return Some(v);
        }
        if Instant::now() >= end {
            return None;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn udp_update_triggers_one_tcp_ack() {
    let _ = env_logger::builder().is_test(true).try_init();

    // Server: TCP for registration, UDP for the updates.
    let server = RpcBuilder::new().with_tcp(0).with_udp(0).build().unwrap();
    let servant = Arc::new(PositionServant::new());
    servant.attach(&server);

    let server_poa = PoaBuilder::new(&server).with_max_objects(4).build();
    let tracker_oid = server_poa
        .activate_object(
            servant.clone(),
            ObjectActivationFlags::ALLOW_TCP | ObjectActivationFlags::ALLOW_UDP,
        )
        .unwrap();
    assert!(tracker_oid.urls.iter().any(|u| u.starts_with("udp://")));

    // Client: hosts the callback servant over TCP.
    let received = Arc::new(Mutex::new(Vec::new()));
    let client = RpcBuilder::new().with_tcp(0).build().unwrap();
    let client_poa = PoaBuilder::new(&client).with_max_objects(4).build();
    let callback_oid = client_poa
        .activate_object(
            Arc::new(AckCallback {
                received: Arc::clone(&received),
            }),
            ObjectActivationFlags::ALLOW_TCP,
        )
        .unwrap();

    let tracker = client.create_object_from_id(tracker_oid).unwrap();

    // Register the callback over TCP.
    let mut buf = FlatBuffer::new();
    message::begin_call(
        &mut buf,
        &CallHeader {
            poa_idx: tracker.poa_idx(),
            interface_idx: 0,
            function_idx: 0,
            object_id: tracker.object_id(),
        },
        next_request_id(),
    );
    callback_oid.marshal(&mut buf);
    message::finalize(&mut buf);
    nprpc::handle_standard_reply(&tracker.call(buf).unwrap()).unwrap();

    // Fire-and-forget position update: request_id stays 0 and the
    // datagram goes out the UDP endpoint.
    let mut update = FlatBuffer::new();
    message::begin_call(
        &mut update,
        &CallHeader {
            poa_idx: tracker.poa_idx(),
            interface_idx: 0,
            function_idx: 1,
            object_id: tracker.object_id(),
        },
        0,
    );
    update.write_u32(1);
    for coord in [10u32, 20, 30] {
        update.write_u32(coord);
    }
    for quat in [0u32, 0, 0, 1] {
        update.write_u32(quat);
    }
    message::finalize(&mut update);
    tracker.send_datagram(update).unwrap();

    // Exactly one ACK arrives over TCP.
    let acks = wait_for(Duration::from_secs(3), || {
        let got = received.lock().unwrap();
        (!got.is_empty()).then(|| got.clone())
    })
    .expect("ACK callback should have been invoked");
    assert_eq!(acks, vec!["UpdatePosition ACK".to_string()]);

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(received.lock().unwrap().len(), 1);

    client.destroy();
    server.destroy();
}
