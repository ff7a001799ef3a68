// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Session-layer limit enforcement.

mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use nprpc::{ObjectActivationFlags, PoaBuilder, RpcBuilder};

#[test]
fn oversized_frame_disconnects_the_client() {
    init_logging();
    let server = RpcBuilder::new().with_tcp(0).build().unwrap();
    let poa = PoaBuilder::new(&server).with_max_objects(4).build();
    poa.activate_object(
        Arc::new(EchoServant::new()),
        ObjectActivationFlags::ALLOW_TCP,
    )
    .unwrap();

    let mut raw = TcpStream::connect(("127.0.0.1", server.tcp_port().unwrap())).unwrap();

    // Claim a 40 MiB body. The server must drop the connection without
    // allocating anything like that much.
    raw.write_all(&(40 * 1024 * 1024u32).to_le_bytes()).unwrap();
    raw.write_all(&[0u8; 64]).unwrap();

    raw.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut sink = [0u8; 64];
    // EOF (Ok(0)) or a reset both count as "disconnected".
    match raw.read(&mut sink) {
        Ok(0) => {}
        Ok(n) => panic!("expected disconnect, read {n} bytes"),
        Err(_) => {}
    }

    server.destroy();
}

#[test]
fn runt_frame_disconnects_the_client() {
    let server = RpcBuilder::new().with_tcp(0).build().unwrap();

    let mut raw = TcpStream::connect(("127.0.0.1", server.tcp_port().unwrap())).unwrap();
    // A size too small to hold even a header.
    raw.write_all(&4u32.to_le_bytes()).unwrap();
    raw.write_all(&[0u8; 4]).unwrap();

    raw.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut sink = [0u8; 16];
    match raw.read(&mut sink) {
        Ok(0) => {}
        Ok(n) => panic!("expected disconnect, read {n} bytes"),
        Err(_) => {}
    }

    server.destroy();
}

#[test]
fn unknown_message_id_is_answered_not_fatal() {
    let server = RpcBuilder::new().with_tcp(0).build().unwrap();
    let poa = PoaBuilder::new(&server).with_max_objects(4).build();
    let oid = poa
        .activate_object(
            Arc::new(EchoServant::new()),
            ObjectActivationFlags::ALLOW_TCP,
        )
        .unwrap();

    let mut raw = TcpStream::connect(("127.0.0.1", server.tcp_port().unwrap())).unwrap();

    // Header with msg_id = 99: answered with Error_UnknownMessageId.
    let mut msg = Vec::new();
    msg.extend_from_slice(&12u32.to_le_bytes());
    msg.extend_from_slice(&99i32.to_le_bytes());
    msg.extend_from_slice(&0i32.to_le_bytes());
    msg.extend_from_slice(&7u32.to_le_bytes());
    raw.write_all(&msg).unwrap();

    raw.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut reply = [0u8; 16];
    raw.read_exact(&mut reply).unwrap();

    let header = nprpc::Header::decode(&reply).unwrap();
    assert_eq!(header.msg_id, nprpc::MessageId::Error_UnknownMessageId);
    assert_eq!(header.request_id, 7);

    // The session survived: a real call on the same connection works.
    let client = RpcBuilder::new().build().unwrap();
    let echo = proxy_for(&client, oid);
    assert_eq!(echo.f(3).unwrap(), 3);

    client.destroy();
    server.destroy();
}
