// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use nprpc::{
    Error, ObjectActivationFlags, PoaBuilder, Proxy, RpcBuilder,
};

fn echo_server() -> (Arc<nprpc::Runtime>, nprpc::ObjectId) {
    init_logging();
    let rt = RpcBuilder::new().with_tcp(0).build().unwrap();
    let poa = PoaBuilder::new(&rt).with_max_objects(4).build();
    let oid = poa
        .activate_object(
            Arc::new(EchoServant::new()),
            ObjectActivationFlags::ALLOW_TCP,
        )
        .unwrap();
    (rt, oid)
}

#[test]
fn tcp_echo_round_trip() {
    let (server, oid) = echo_server();
    assert!(oid.urls[0].starts_with("tcp://"));

    let client = RpcBuilder::new().build().unwrap();
    let echo = proxy_for(&client, oid);

    assert_eq!(echo.f(7).unwrap(), 7);
    assert_eq!(echo.f(-12345).unwrap(), -12345);

    drop(server);
}

#[test]
fn narrow_rejects_wrong_class() {
    let (server, mut oid) = echo_server();
    oid.class_id = "test/NotEcho".to_string();

    let client = RpcBuilder::new().build().unwrap();
    let object = client.create_object_from_id(oid).unwrap();
    assert!(EchoProxy::narrow(object).is_none());

    drop(server);
}

#[test]
fn dead_server_surfaces_comm_failure() {
    let (server, oid) = echo_server();

    let client = RpcBuilder::new().build().unwrap();
    let echo = proxy_for(&client, oid);
    assert_eq!(echo.f(1).unwrap(), 1);

    // Kill the server outright; its connection threads exit and the
    // sockets close.
    drop(server);
    std::thread::sleep(Duration::from_millis(200));

    let err = echo.f(2);
    assert!(
        matches!(err, Err(Error::CommFailure) | Err(Error::Timeout)),
        "expected CommFailure after server death, got {err:?}"
    );
}

#[test]
fn stale_generation_is_object_not_exist() {
    let rt = RpcBuilder::new().with_tcp(0).build().unwrap();
    let poa = PoaBuilder::new(&rt).with_max_objects(4).build();
    let oid = poa
        .activate_object(
            Arc::new(EchoServant::new()),
            ObjectActivationFlags::ALLOW_TCP,
        )
        .unwrap();

    assert!(poa.deactivate_object(oid.object_id));

    let client = RpcBuilder::new().build().unwrap();
    let echo = proxy_for(&client, oid);
    assert!(matches!(echo.f(1), Err(Error::ObjectNotExist)));
}

#[test]
fn unknown_poa_is_poa_not_exist() {
    let (server, mut oid) = echo_server();
    oid.poa_idx = 40;

    let client = RpcBuilder::new().build().unwrap();
    let echo = proxy_for(&client, oid);
    assert!(matches!(echo.f(1), Err(Error::PoaNotExist)));

    drop(server);
}

#[test]
fn timeout_leaves_session_drainable() {
    let rt = RpcBuilder::new().with_tcp(0).build().unwrap();
    let poa = PoaBuilder::new(&rt).with_max_objects(4).build();
    let oid = poa
        .activate_object(
            Arc::new(EchoServant::slow(Duration::from_millis(300))),
            ObjectActivationFlags::ALLOW_TCP,
        )
        .unwrap();

    let client = RpcBuilder::new().build().unwrap();
    let echo = proxy_for(&client, oid);

    echo.object().set_timeout(50);
    assert!(matches!(echo.f(1), Err(Error::Timeout)));

    // The next call on the same session must succeed or fail cleanly,
    // never deadlock; the late reply to the first call is discarded by
    // request-id correlation.
    echo.object().set_timeout(2000);
    assert_eq!(echo.f(2).unwrap(), 2);

    drop(rt);
}

#[test]
fn reference_accounting_drains_on_disconnect() {
    let rt = RpcBuilder::new().with_tcp(0).build().unwrap();
    let poa = PoaBuilder::new(&rt).with_max_objects(4).build();
    let oid = poa
        .activate_object(
            Arc::new(EchoServant::new()),
            ObjectActivationFlags::ALLOW_TCP,
        )
        .unwrap();
    let raw_oid = oid.object_id;

    let client = RpcBuilder::new().build().unwrap();
    let echo = proxy_for(&client, oid);

    echo.object().add_reference().unwrap();
    echo.object().add_reference().unwrap();
    assert_eq!(poa.reference_count(raw_oid), 2);

    // Closing the client session drains the server-side reference list.
    client.destroy();
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while poa.reference_count(raw_oid) != 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(poa.reference_count(raw_oid), 0);

    drop(rt);
}
