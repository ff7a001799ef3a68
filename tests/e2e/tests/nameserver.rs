// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

mod common;

use std::sync::Arc;

use common::*;
use nprpc::{ObjectActivationFlags, PoaBuilder, RpcBuilder};
use nprpc_nameserver::Nameserver;

#[test]
fn bind_then_resolve_returns_the_same_identity() {
    init_logging();
    let server = RpcBuilder::new().with_tcp(0).build().unwrap();
    nprpc_nameserver::server::activate(&server).unwrap();

    // A second POA hosting an application object.
    let poa = PoaBuilder::new(&server).with_max_objects(4).build();
    let obj_a = poa
        .activate_object(
            Arc::new(EchoServant::new()),
            ObjectActivationFlags::ALLOW_TCP,
        )
        .unwrap();
    assert_eq!(obj_a.poa_idx, 1);

    let client = RpcBuilder::new().build().unwrap();
    let ns = Nameserver::connect(
        &client,
        &format!("tcp://127.0.0.1:{}", server.tcp_port().unwrap()),
    )
    .unwrap();

    ns.bind(&obj_a, "svc").unwrap();

    let resolved = ns.resolve("svc").unwrap().expect("svc should be bound");
    assert_eq!(resolved.poa_idx, obj_a.poa_idx);
    assert_eq!(resolved.object_id, obj_a.object_id);
    assert_eq!(resolved.class_id, ECHO_CLASS_ID);

    // The resolved reference is live: calls through it reach the servant.
    let echo = proxy_for(&client, resolved);
    assert_eq!(echo.f(21).unwrap(), 21);

    assert!(ns.resolve("missing").unwrap().is_none());

    client.destroy();
    server.destroy();
}

#[test]
fn rebinding_replaces_the_entry() {
    init_logging();
    let server = RpcBuilder::new().with_tcp(0).build().unwrap();
    nprpc_nameserver::server::activate(&server).unwrap();

    let poa = PoaBuilder::new(&server).with_max_objects(4).build();
    let first = poa
        .activate_object(
            Arc::new(EchoServant::new()),
            ObjectActivationFlags::ALLOW_TCP,
        )
        .unwrap();
    let second = poa
        .activate_object(
            Arc::new(EchoServant::new()),
            ObjectActivationFlags::ALLOW_TCP,
        )
        .unwrap();

    let client = RpcBuilder::new().build().unwrap();
    let ns = Nameserver::connect(
        &client,
        &format!("tcp://127.0.0.1:{}", server.tcp_port().unwrap()),
    )
    .unwrap();

    ns.bind(&first, "svc").unwrap();
    ns.bind(&second, "svc").unwrap();

    let resolved = ns.resolve("svc").unwrap().unwrap();
    assert_eq!(resolved.object_id, second.object_id);

    client.destroy();
    server.destroy();
}
