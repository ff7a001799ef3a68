// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use nprpc_shm::{connect_to_listener, Channel, Listener};

fn unique_name(tag: &str) -> String {
    static SEQ: AtomicUsize = AtomicUsize::new(0);
    format!(
        "t{}_{}_{}",
        tag,
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

#[test]
fn channel_pair_carries_records_both_ways() {
    let id = unique_name("pair");

    let server = Channel::new(&id, true, true).unwrap();
    let client = Channel::new(&id, false, false).unwrap();

    let (server_rx, server_rx_recv) = mpsc::channel();
    server.start(Box::new(move |view| {
        server_rx.send(view.to_vec()).unwrap();
    }));

    let (client_rx, client_rx_recv) = mpsc::channel();
    client.start(Box::new(move |view| {
        client_rx.send(view.to_vec()).unwrap();
    }));

    client.send(b"ping").unwrap();
    let got = server_rx_recv.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(got, b"ping");

    server.send(b"pong").unwrap();
    let got = client_rx_recv.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(got, b"pong");

    client.stop();
    server.stop();
}

#[test]
fn zero_copy_reservation_reaches_peer() {
    let id = unique_name("zc");

    let server = Channel::new(&id, true, true).unwrap();
    let client = Channel::new(&id, false, false).unwrap();

    let (tx, rx) = mpsc::channel();
    client.start(Box::new(move |view| {
        tx.send(view.to_vec()).unwrap();
    }));

    let payload = b"written in place";
    let res = server.reserve_write(256).unwrap();
    unsafe {
        std::ptr::copy_nonoverlapping(payload.as_ptr(), res.as_mut_ptr(), payload.len());
    }
    res.commit(payload.len());

    let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(got, payload);

    client.stop();
    server.stop();
}

#[test]
fn listener_accepts_handshake_and_creates_channel() {
    let name = unique_name("listen");

    let (accepted_tx, accepted_rx) = mpsc::channel::<Arc<Channel>>();
    let (msg_tx, msg_rx) = mpsc::channel::<Vec<u8>>();

    let listener = Listener::bind(
        &name,
        Box::new(move |channel| {
            let msg_tx = msg_tx.clone();
            channel.start(Box::new(move |view| {
                msg_tx.send(view.to_vec()).unwrap();
            }));
            accepted_tx.send(channel).unwrap();
        }),
    )
    .unwrap();

    let client = connect_to_listener(&name).unwrap();
    let (reply_tx, reply_rx) = mpsc::channel::<Vec<u8>>();
    client.start(Box::new(move |view| {
        reply_tx.send(view.to_vec()).unwrap();
    }));

    // First message can be sent immediately after connect: the accept
    // callback wired the server side before the channel was handed out.
    client.send(b"hello server").unwrap();
    let server_channel = accepted_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let got = msg_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(got, b"hello server");

    server_channel.send(b"hello client").unwrap();
    let got = reply_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(got, b"hello client");

    client.stop();
    server_channel.stop();
    listener.stop();
}

#[test]
fn connect_without_listener_fails() {
    let err = connect_to_listener(&unique_name("nobody"));
    assert!(err.is_err());
}
