// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

mod common;

use std::sync::Arc;

use common::*;
use nprpc::{ObjectActivationFlags, PoaBuilder, Proxy, RpcBuilder};

#[test]
fn shm_round_trip_is_zero_copy() {
    init_logging();
    let listener = unique_name("rt");
    let server = RpcBuilder::new()
        .with_shared_memory(&listener)
        .build()
        .unwrap();
    let poa = PoaBuilder::new(&server).with_max_objects(4).build();
    let oid = poa
        .activate_object(
            Arc::new(EchoServant::new()),
            ObjectActivationFlags::ALLOW_SHARED_MEMORY,
        )
        .unwrap();
    assert_eq!(oid.urls, vec![format!("mem://{listener}")]);

    let client = RpcBuilder::new().build().unwrap();
    let echo = proxy_for(&client, oid);

    // The reply arrives as a view into the server's s2c ring.
    let reply = echo.f_raw(99).unwrap();
    assert!(reply.is_read_view());

    // And it decodes like any other reply.
    let mut r = nprpc::buffer::Reader::at(reply.as_slice(), nprpc::Header::SIZE);
    assert_eq!(r.read_i32().unwrap(), 99);
    drop(reply);

    for i in 0..100 {
        assert_eq!(echo.f(i).unwrap(), i);
    }

    client.destroy();
    server.destroy();
}

#[test]
fn shm_client_can_marshal_into_the_ring() {
    init_logging();
    let listener = unique_name("zc");
    let server = RpcBuilder::new()
        .with_shared_memory(&listener)
        .build()
        .unwrap();
    let poa = PoaBuilder::new(&server).with_max_objects(4).build();
    let oid = poa
        .activate_object(
            Arc::new(EchoServant::new()),
            ObjectActivationFlags::ALLOW_SHARED_MEMORY,
        )
        .unwrap();

    let client = RpcBuilder::new().build().unwrap();
    let echo = proxy_for(&client, oid);
    let session = echo.object().select_session().unwrap();

    // Marshal the request directly into a ring reservation.
    let mut buf = session.prepare_zero_copy_buffer(256).expect(
        "shared-memory sessions support zero-copy marshalling",
    );
    assert!(buf.is_write_view());

    nprpc::message::begin_call(
        &mut buf,
        &nprpc::CallHeader {
            poa_idx: echo.object().poa_idx(),
            interface_idx: 0,
            function_idx: 0,
            object_id: echo.object().object_id(),
        },
        nprpc::session::next_request_id(),
    );
    buf.write_i32(1234);
    nprpc::message::finalize(&mut buf);

    let reply = session.send_receive(buf, 2000).unwrap();
    let mut r = nprpc::buffer::Reader::at(reply.as_slice(), nprpc::Header::SIZE);
    assert_eq!(r.read_i32().unwrap(), 1234);

    client.destroy();
    server.destroy();
}

#[test]
fn connecting_to_a_missing_listener_fails() {
    let client = RpcBuilder::new().build().unwrap();
    let ep: nprpc::EndPoint = format!("mem://{}", unique_name("missing")).parse().unwrap();
    assert!(client.get_session(&ep).is_err());
}
