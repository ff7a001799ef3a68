// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Server→client streaming with window-based backpressure over TCP.

use std::sync::Arc;
use std::time::Duration;

use nprpc::buffer::Reader;
use nprpc::message::{CallHeader, Header};
use nprpc::streams::{self, ChunkSource, StreamPoll, INITIAL_WINDOW, STREAM_INIT_PAYLOAD_OFFSET};
use nprpc::{
    Error, FlatBuffer, ObjectActivationFlags, PoaBuilder, Proxy, RpcBuilder, Servant,
    SessionContext,
};

const FEED_CLASS_ID: &str = "test/Feed";

/// Yields `count` four-byte chunks, then completes.
struct Counter {
    next: u32,
    count: u32,
}

impl ChunkSource for Counter {
    fn try_next(&mut self) -> StreamPoll {
        if self.next == self.count {
            return StreamPoll::Complete;
        }
        let chunk = self.next.to_le_bytes().to_vec();
        self.next += 1;
        StreamPoll::Item(chunk)
    }
}

/// Stream fn 0: `subscribe(count)` yields `count` chunks.
struct FeedServant;

impl Servant for FeedServant {
    fn class_id(&self) -> &'static str {
        FEED_CLASS_ID
    }

    fn dispatch(
        &self,
        ctx: &mut SessionContext,
        rx: &FlatBuffer,
        _tx: &mut FlatBuffer,
        _from_parent: bool,
    ) -> Result<(), Error> {
        let ch = CallHeader::decode(&rx.as_slice()[Header::SIZE..])?;
        let stream_id = ctx.current_stream.ok_or(Error::BadInput)?;

        match ch.function_idx {
            0 => {
                let mut r = Reader::at(rx.as_slice(), STREAM_INIT_PAYLOAD_OFFSET);
                let count = r.read_u32()?;
                let manager = ctx.stream_manager.as_ref().ok_or(Error::BadInput)?;
                manager.register_writer(stream_id, Box::new(Counter { next: 0, count }));
                Ok(())
            }
            _ => Err(Error::UnknownFunctionIdx),
        }
    }
}

struct FeedProxy {
    object: Arc<nprpc::Object>,
}

impl Proxy for FeedProxy {
    const CLASS_ID: &'static str = FEED_CLASS_ID;
    const INTERFACE_IDX: u8 = 0;

    fn from_object(obj: Arc<nprpc::Object>) -> Self {
        Self { object: obj }
    }

    fn object(&self) -> &Arc<nprpc::Object> {
        &self.object
    }
}

impl FeedProxy {
    fn subscribe(&self, count: u32) -> Result<streams::StreamReader, Error> {
        streams::begin_stream(&self.object, Self::INTERFACE_IDX, 0, |buf| {
            buf.write_u32(count);
        })
    }
}

fn feed_fixture() -> (Arc<nprpc::Runtime>, Arc<nprpc::Runtime>, FeedProxy) {
    let _ = env_logger::builder().is_test(true).try_init();
    let server = RpcBuilder::new().with_tcp(0).build().unwrap();
    let poa = PoaBuilder::new(&server).with_max_objects(4).build();
    let oid = poa
        .activate_object(Arc::new(FeedServant), ObjectActivationFlags::ALLOW_TCP)
        .unwrap();

    let client = RpcBuilder::new().build().unwrap();
    let object = client.create_object_from_id(oid).unwrap();
    let feed = FeedProxy::narrow(object).unwrap();
    (server, client, feed)
}

#[test]
fn stream_delivers_all_chunks_in_order() {
    let (server, client, feed) = feed_fixture();

    let reader = feed.subscribe(200).unwrap();
    let mut expected = 0u32;
    while let Some(chunk) = reader.next(Duration::from_secs(5)).unwrap() {
        assert_eq!(chunk, expected.to_le_bytes());
        expected += 1;
    }
    assert_eq!(expected, 200);
    assert_eq!(reader.violations(), 0);

    client.destroy();
    server.destroy();
}

#[test]
fn producer_never_exceeds_the_window() {
    let (server, client, feed) = feed_fixture();

    let reader = feed.subscribe(1000).unwrap();

    // Consume nothing for a while: the producer must stall after the
    // initial window.
    std::thread::sleep(Duration::from_millis(400));
    assert!(reader.buffered() <= INITIAL_WINDOW as usize);
    assert_eq!(reader.violations(), 0);

    // Slowly consume some chunks, re-checking the in-flight bound.
    for i in 0..50u32 {
        let chunk = reader
            .next(Duration::from_secs(5))
            .unwrap()
            .expect("stream ended early");
        assert_eq!(chunk, i.to_le_bytes());
        if i % 10 == 0 {
            std::thread::sleep(Duration::from_millis(30));
            assert!(reader.buffered() <= INITIAL_WINDOW as usize);
        }
    }
    assert_eq!(reader.violations(), 0);

    // Drain the rest at full speed.
    let mut seen = 50u32;
    while let Some(chunk) = reader.next(Duration::from_secs(5)).unwrap() {
        assert_eq!(chunk, seen.to_le_bytes());
        seen += 1;
    }
    assert_eq!(seen, 1000);
    assert_eq!(reader.violations(), 0);

    client.destroy();
    server.destroy();
}

#[test]
fn cancelling_a_stream_stops_the_producer() {
    let (server, client, feed) = feed_fixture();

    let reader = feed.subscribe(1_000_000).unwrap();
    let first = reader.next(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(first, 0u32.to_le_bytes());

    reader.cancel();
    // The pump observes the cancel and stops; nothing left to assert
    // beyond the session staying healthy for ordinary traffic.
    std::thread::sleep(Duration::from_millis(200));

    client.destroy();
    server.destroy();
}
