// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Chunked byte streams with window-based backpressure.
//!
//! A stream is identified by a 64-bit id chosen by the client. The client
//! sends `StreamInitialization` (a call header plus the stream id) through
//! the normal request path; the servant registers a [`ChunkSource`] with
//! the session's [`StreamManager`], whose pump thread forwards chunks
//! while window credit is available. The consumer starts the producer with
//! a credit of [`INITIAL_WINDOW`] chunks and grants credit back as it
//! consumes; a producer that outruns its credit is a protocol violation
//! the reader counts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::*;

use crate::buffer::{FlatBuffer, Reader};
use crate::message::{self, CallHeader, Header, MessageId, MessageType};
use crate::object::Object;
use crate::session::{next_request_id, MessageSink};
use crate::Error;

/// Initial per-stream credit advertised by a consumer.
pub const INITIAL_WINDOW: u32 = 16;

/// Where the argument payload of a `StreamInitialization` begins
/// (header, call header, stream id).
pub const STREAM_INIT_PAYLOAD_OFFSET: usize = Header::SIZE + CallHeader::SIZE + 8;

/// What a producer yields when pumped. `Pending` lets a slow producer
/// keep the pump thread alive without blocking it forever.
pub enum StreamPoll {
    Item(Vec<u8>),
    Pending,
    Complete,
    Failed { error_code: u32, data: Vec<u8> },
}

/// A server-side stream producer: an iterator over chunk payloads with a
/// non-blocking `try_next`.
pub trait ChunkSource: Send {
    fn try_next(&mut self) -> StreamPoll;
}

// ---------------------------------------------------------------------------
// Wire encodings
// ---------------------------------------------------------------------------

pub fn encode_stream_init(
    buf: &mut FlatBuffer,
    ch: &CallHeader,
    stream_id: u64,
    request_id: u32,
) {
    buf.clear();
    buf.write_bytes(
        &Header {
            size: 0,
            msg_id: MessageId::StreamInitialization,
            msg_type: MessageType::Request,
            request_id,
        }
        .encode(),
    );
    buf.write_bytes(&ch.encode());
    buf.write_u64(stream_id);
}

pub fn encode_chunk(stream_id: u64, sequence: u64, window_size: u32, data: &[u8]) -> FlatBuffer {
    let mut buf = FlatBuffer::with_capacity(Header::SIZE + 24 + data.len());
    buf.write_bytes(
        &Header {
            size: 0,
            msg_id: MessageId::StreamChunk,
            msg_type: MessageType::Answer,
            request_id: 0,
        }
        .encode(),
    );
    buf.write_u64(stream_id);
    buf.write_u64(sequence);
    buf.write_u32(window_size);
    buf.write_u32(data.len() as u32);
    buf.write_bytes(data);
    message::finalize(&mut buf);
    buf
}

pub fn encode_complete(stream_id: u64, final_sequence: u64) -> FlatBuffer {
    let mut buf = FlatBuffer::with_capacity(Header::SIZE + 16);
    buf.write_bytes(
        &Header {
            size: 0,
            msg_id: MessageId::StreamComplete,
            msg_type: MessageType::Answer,
            request_id: 0,
        }
        .encode(),
    );
    buf.write_u64(stream_id);
    buf.write_u64(final_sequence);
    message::finalize(&mut buf);
    buf
}

pub fn encode_stream_error(stream_id: u64, error_code: u32, data: &[u8]) -> FlatBuffer {
    let mut buf = FlatBuffer::with_capacity(Header::SIZE + 16 + data.len());
    buf.write_bytes(
        &Header {
            size: 0,
            msg_id: MessageId::StreamError,
            msg_type: MessageType::Answer,
            request_id: 0,
        }
        .encode(),
    );
    buf.write_u64(stream_id);
    buf.write_u32(error_code);
    buf.write_u32(data.len() as u32);
    buf.write_bytes(data);
    message::finalize(&mut buf);
    buf
}

pub fn encode_cancel(stream_id: u64) -> FlatBuffer {
    let mut buf = FlatBuffer::with_capacity(Header::SIZE + 8);
    buf.write_bytes(
        &Header {
            size: 0,
            msg_id: MessageId::StreamCancel,
            msg_type: MessageType::Request,
            request_id: 0,
        }
        .encode(),
    );
    buf.write_u64(stream_id);
    message::finalize(&mut buf);
    buf
}

#[derive(Debug, Clone)]
pub struct StreamChunkMsg {
    pub stream_id: u64,
    pub sequence: u64,
    pub window_size: u32,
    pub data: Vec<u8>,
}

fn decode_chunk(buf: &FlatBuffer) -> Result<StreamChunkMsg, Error> {
    let mut r = Reader::at(buf.as_slice(), Header::SIZE);
    let stream_id = r.read_u64()?;
    let sequence = r.read_u64()?;
    let window_size = r.read_u32()?;
    let len = r.read_u32()? as usize;
    let data = r.read_bytes(len)?.to_vec();
    Ok(StreamChunkMsg {
        stream_id,
        sequence,
        window_size,
        data,
    })
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct WriterState {
    credit: Mutex<u32>,
    cv: Condvar,
    cancelled: AtomicBool,
}

#[derive(Default)]
struct ReaderQueue {
    chunks: std::collections::VecDeque<StreamChunkMsg>,
    completed: bool,
    failed: Option<(u32, Vec<u8>)>,
    unacked: u32,
    violations: u32,
    // Highest sequence handed to the consumer; echoed in credit grants.
    last_consumed: u64,
}

struct ReaderState {
    queue: Mutex<ReaderQueue>,
    cv: Condvar,
}

/// Per-session stream registry: producers on the server side, consumers
/// on the client side. Discarded (and every pump stopped) on session
/// close. The sink back-reference is cleared on shutdown so the manager
/// never keeps its session alive.
pub struct StreamManager {
    sink: Mutex<Option<Arc<dyn MessageSink>>>,
    writers: Mutex<HashMap<u64, Arc<WriterState>>>,
    readers: Mutex<HashMap<u64, Arc<ReaderState>>>,
    closed: AtomicBool,
}

impl StreamManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sink: Mutex::new(None),
            writers: Mutex::new(HashMap::new()),
            readers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Install the outbound path chunks travel through. Called by the
    /// session that owns this manager.
    pub fn set_sink(&self, sink: Arc<dyn MessageSink>) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn sink(&self) -> Option<Arc<dyn MessageSink>> {
        self.sink.lock().unwrap().clone()
    }

    /// Register a producer for `stream_id` and start its pump thread.
    pub fn register_writer(self: &Arc<Self>, stream_id: u64, mut source: Box<dyn ChunkSource>) {
        let state = Arc::new(WriterState {
            credit: Mutex::new(INITIAL_WINDOW),
            cv: Condvar::new(),
            cancelled: AtomicBool::new(false),
        });
        self.writers.lock().unwrap().insert(stream_id, Arc::clone(&state));

        let manager = Arc::clone(self);
        std::thread::spawn(move || {
            manager.pump(stream_id, &state, source.as_mut());
            manager.writers.lock().unwrap().remove(&stream_id);
        });
    }

    fn pump(&self, stream_id: u64, state: &WriterState, source: &mut dyn ChunkSource) {
        let mut sequence = 0u64;

        loop {
            if self.closed.load(Ordering::Acquire) || state.cancelled.load(Ordering::Acquire) {
                trace!("stream {stream_id}: pump stopping");
                return;
            }

            // The producer must not send more than its unacknowledged
            // window; park until the consumer grants credit.
            {
                let mut credit = state.credit.lock().unwrap();
                if *credit == 0 {
                    let (guard, _) = state
                        .cv
                        .wait_timeout(credit, Duration::from_millis(100))
                        .unwrap();
                    credit = guard;
                    if *credit == 0 {
                        continue;
                    }
                }
                *credit -= 1;
            }

            match source.try_next() {
                StreamPoll::Item(data) => {
                    let Some(sink) = self.sink() else { return };
                    let remaining = *state.credit.lock().unwrap();
                    if let Err(e) =
                        sink.send_message(encode_chunk(stream_id, sequence, remaining, &data))
                    {
                        warn!("stream {stream_id}: chunk send failed: {e}");
                        return;
                    }
                    sequence += 1;
                }
                StreamPoll::Pending => {
                    // Not an emission; give the credit back.
                    *state.credit.lock().unwrap() += 1;
                    std::thread::sleep(Duration::from_millis(1));
                }
                StreamPoll::Complete => {
                    if let Some(sink) = self.sink() {
                        let _ = sink.send_message(encode_complete(stream_id, sequence));
                    }
                    return;
                }
                StreamPoll::Failed { error_code, data } => {
                    if let Some(sink) = self.sink() {
                        let _ = sink.send_message(encode_stream_error(stream_id, error_code, &data));
                    }
                    return;
                }
            }
        }
    }

    /// Register a consumer for `stream_id` before initiating the stream.
    pub fn register_reader(self: &Arc<Self>, stream_id: u64) -> StreamReader {
        let state = Arc::new(ReaderState {
            queue: Mutex::new(ReaderQueue::default()),
            cv: Condvar::new(),
        });
        self.readers.lock().unwrap().insert(stream_id, Arc::clone(&state));
        StreamReader {
            manager: Arc::clone(self),
            state,
            stream_id,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Route an inbound `Stream*` message. Returns `false` for ids this
    /// session knows nothing about (late chunks after a cancel are normal
    /// and dropped silently).
    pub fn handle_message(&self, buf: &FlatBuffer) -> bool {
        let Ok(header) = Header::decode(buf.as_slice()) else {
            return false;
        };

        match header.msg_id {
            MessageId::StreamChunk => {
                let Ok(msg) = decode_chunk(buf) else {
                    return false;
                };
                // An empty chunk addressed at one of our producers is a
                // window grant, not data.
                if msg.data.is_empty() {
                    if let Some(writer) = self.writers.lock().unwrap().get(&msg.stream_id) {
                        let mut credit = writer.credit.lock().unwrap();
                        *credit += msg.window_size;
                        writer.cv.notify_one();
                        return true;
                    }
                }
                if let Some(reader) = self.readers.lock().unwrap().get(&msg.stream_id) {
                    let mut q = reader.queue.lock().unwrap();
                    q.unacked += 1;
                    if q.unacked > INITIAL_WINDOW {
                        q.violations += 1;
                        warn!(
                            "stream {}: producer exceeded window ({} unacked)",
                            msg.stream_id, q.unacked
                        );
                    }
                    q.chunks.push_back(msg);
                    reader.cv.notify_one();
                    return true;
                }
                false
            }
            MessageId::StreamComplete => {
                let mut r = Reader::at(buf.as_slice(), Header::SIZE);
                let Ok(stream_id) = r.read_u64() else {
                    return false;
                };
                if let Some(reader) = self.readers.lock().unwrap().get(&stream_id) {
                    reader.queue.lock().unwrap().completed = true;
                    reader.cv.notify_all();
                    return true;
                }
                false
            }
            MessageId::StreamError => {
                let mut r = Reader::at(buf.as_slice(), Header::SIZE);
                let Ok(stream_id) = r.read_u64() else {
                    return false;
                };
                let code = r.read_u32().unwrap_or(0);
                let data = r
                    .read_u32()
                    .ok()
                    .and_then(|n| r.read_bytes(n as usize).ok())
                    .map(|b| b.to_vec())
                    .unwrap_or_default();
                if let Some(reader) = self.readers.lock().unwrap().get(&stream_id) {
                    reader.queue.lock().unwrap().failed = Some((code, data));
                    reader.cv.notify_all();
                    return true;
                }
                false
            }
            MessageId::StreamCancel => {
                let mut r = Reader::at(buf.as_slice(), Header::SIZE);
                let Ok(stream_id) = r.read_u64() else {
                    return false;
                };
                if let Some(writer) = self.writers.lock().unwrap().get(&stream_id) {
                    writer.cancelled.store(true, Ordering::Release);
                    writer.cv.notify_all();
                    return true;
                }
                if let Some(reader) = self.readers.lock().unwrap().remove(&stream_id) {
                    reader.queue.lock().unwrap().completed = true;
                    reader.cv.notify_all();
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    /// Stop every pump, fail every reader, drop the sink back-reference.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);

        for writer in self.writers.lock().unwrap().values() {
            writer.cancelled.store(true, Ordering::Release);
            writer.cv.notify_all();
        }
        for reader in self.readers.lock().unwrap().drain() {
            let mut q = reader.1.queue.lock().unwrap();
            if !q.completed && q.failed.is_none() {
                q.failed = Some((0, b"session closed".to_vec()));
            }
            reader.1.cv.notify_all();
        }

        self.sink.lock().unwrap().take();
    }
}

// ---------------------------------------------------------------------------
// Reader handle
// ---------------------------------------------------------------------------

/// Client-side stream consumer. Consuming a chunk grants one credit back
/// to the producer.
pub struct StreamReader {
    manager: Arc<StreamManager>,
    state: Arc<ReaderState>,
    stream_id: u64,
    cancelled: AtomicBool,
}

impl StreamReader {
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// Next chunk payload; `Ok(None)` when the stream completed.
    pub fn next(&self, timeout: Duration) -> Result<Option<Vec<u8>>, Error> {
        let deadline = Instant::now() + timeout;
        let mut q = self.state.queue.lock().unwrap();

        loop {
            if let Some(msg) = q.chunks.pop_front() {
                q.unacked = q.unacked.saturating_sub(1);
                q.last_consumed = q.last_consumed.max(msg.sequence);
                let consumed = q.last_consumed;
                drop(q);
                self.grant_credit(consumed, 1);
                return Ok(Some(msg.data));
            }
            if let Some((code, data)) = q.failed.clone() {
                return Err(Error::AppException {
                    class_id: code,
                    data,
                });
            }
            if q.completed {
                return Ok(None);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let (guard, _) = self
                .state
                .cv
                .wait_timeout(q, deadline - now)
                .unwrap();
            q = guard;
        }
    }

    /// Chunks received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.state.queue.lock().unwrap().chunks.len()
    }

    /// Times the producer was observed over its window. A non-zero value
    /// is a protocol violation by the peer.
    pub fn violations(&self) -> u32 {
        self.state.queue.lock().unwrap().violations
    }

    fn grant_credit(&self, consumed: u64, n: u32) {
        if let Some(sink) = self.manager.sink() {
            // An empty chunk carries the freed-slot count in window_size;
            // its sequence echoes the highest consumed sequence.
            let _ = sink.send_message(encode_chunk(self.stream_id, consumed, n, &[]));
        }
    }

    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(sink) = self.manager.sink() {
            let _ = sink.send_message(encode_cancel(self.stream_id));
        }
        self.manager.readers.lock().unwrap().remove(&self.stream_id);
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ---------------------------------------------------------------------------
// Client initiation
// ---------------------------------------------------------------------------

/// Allocate a stream id (client-chosen, process-unique).
pub fn next_stream_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Initiate a stream on `object`: registers a reader, sends
/// `StreamInitialization` with the marshalled arguments, and returns the
/// reader once the servant acknowledged with `Success`.
pub fn begin_stream(
    object: &Object,
    interface_idx: u8,
    function_idx: u8,
    marshal_args: impl FnOnce(&mut FlatBuffer),
) -> Result<StreamReader, Error> {
    let session = object.select_session()?;
    let manager = session.stream_manager().ok_or(Error::BadInput)?;

    let stream_id = next_stream_id();
    let reader = manager.register_reader(stream_id);

    let mut buf = FlatBuffer::new();
    encode_stream_init(
        &mut buf,
        &CallHeader {
            poa_idx: object.poa_idx(),
            interface_idx,
            function_idx,
            object_id: object.object_id(),
        },
        stream_id,
        next_request_id(),
    );
    marshal_args(&mut buf);
    message::finalize(&mut buf);

    let reply = session.send_receive(buf, object.timeout_ms())?;
    crate::object::handle_standard_reply(&reply)?;
    Ok(reader)
}
