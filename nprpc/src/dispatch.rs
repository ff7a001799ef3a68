// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The server-side dispatch loop: switch on the inbound message kind,
//! locate the servant, invoke it, and construct the reply envelope.
//!
//! Server-side failures never terminate the session: every error becomes
//! the corresponding `Error_*` answer (preserving the request id) and the
//! session resumes reading.

use std::sync::Arc;

use log::*;

use crate::buffer::{FlatBuffer, Reader};
use crate::message::{make_simple_answer, CallHeader, Header, MessageId};
use crate::object::{self, parse_local_id};
use crate::poa::ObjectEntry;
use crate::runtime::{DebugLevel, Runtime};
use crate::session::SessionContext;
use crate::Error;

fn error_to_msg_id(e: &Error) -> MessageId {
    match e {
        Error::PoaNotExist => MessageId::Error_PoaNotExist,
        Error::ObjectNotExist => MessageId::Error_ObjectNotExist,
        Error::BadAccess => MessageId::Error_BadAccess,
        Error::UnknownFunctionIdx => MessageId::Error_UnknownFunctionIdx,
        Error::UnknownMessageId => MessageId::Error_UnknownMessageId,
        Error::Timeout => MessageId::Error_Timeout,
        Error::CommFailure => MessageId::Error_CommFailure,
        // Everything else the peer can act on only as a malformed-input
        // failure of its call.
        _ => MessageId::Error_BadInput,
    }
}

fn answer_error(tx: &mut FlatBuffer, e: &Error, request_id: u32) {
    if let Error::AppException { class_id, data } = e {
        object::write_exception(tx, request_id, *class_id, data);
    } else {
        make_simple_answer(tx, error_to_msg_id(e), request_id);
    }
}

/// Pull the request id out of a raw message without full validation, so
/// even a reject preserves it.
fn raw_request_id(data: &[u8]) -> u32 {
    if data.len() >= Header::SIZE {
        u32::from_le_bytes(data[12..16].try_into().unwrap())
    } else {
        0
    }
}

fn locate(
    rt: &Runtime,
    poa_idx: u16,
    object_id: u64,
    ctx: &SessionContext,
) -> Result<ObjectEntry, Error> {
    let poa = rt.get_poa(poa_idx).ok_or(Error::PoaNotExist)?;
    let entry = poa.get_object(object_id).ok_or(Error::ObjectNotExist)?;

    if !entry.servant.validate_session(ctx) {
        warn!(
            "{} is trying to access secured object {}",
            ctx.remote_endpoint,
            entry.servant.class_id()
        );
        return Err(Error::BadAccess);
    }

    Ok(entry)
}

/// Handle one inbound message. Returns `true` when `tx` holds a reply to
/// transmit on the same session; stream messages produce none.
pub fn handle_request(
    rt: &Arc<Runtime>,
    ctx: &mut SessionContext,
    rx: &FlatBuffer,
    tx: &mut FlatBuffer,
) -> bool {
    let request_id = raw_request_id(rx.as_slice());

    let header = match Header::decode(rx.as_slice()) {
        Ok(h) => h,
        Err(e) => {
            debug!("rejecting message from {}: {e}", ctx.remote_endpoint);
            answer_error(tx, &e, request_id);
            return true;
        }
    };

    if rt.debug_level() >= DebugLevel::EveryMessageContent {
        debug!(
            "received {} bytes from {}: {:02x?}",
            rx.len(),
            ctx.remote_endpoint,
            rx.as_slice()
        );
    }

    match header.msg_id {
        MessageId::FunctionCall => {
            let ch = match CallHeader::decode(&rx.as_slice()[Header::SIZE..]) {
                Ok(ch) => ch,
                Err(e) => {
                    answer_error(tx, &e, request_id);
                    return true;
                }
            };

            if rt.debug_level() >= DebugLevel::EveryCall {
                debug!(
                    "FunctionCall request_id: {request_id}, interface_idx: {}, fn_idx: {}, \
                     poa_idx: {}, oid: {:#x}",
                    ch.interface_idx, ch.function_idx, ch.poa_idx, ch.object_id
                );
            }

            let entry = match locate(rt, ch.poa_idx, ch.object_id, ctx) {
                Ok(entry) => entry,
                Err(e) => {
                    answer_error(tx, &e, request_id);
                    return true;
                }
            };

            match entry.servant.dispatch(ctx, rx, tx, false) {
                Ok(()) if tx.overflowed() => {
                    answer_error(tx, &Error::NoBufferSpace, request_id);
                }
                Ok(()) => {}
                Err(e) => {
                    debug!("dispatch failed: {e}");
                    answer_error(tx, &e, request_id);
                }
            }
            true
        }

        MessageId::AddReference => {
            let Ok((poa_idx, object_id)) = parse_local_id(rx) else {
                answer_error(tx, &Error::BadInput, request_id);
                return true;
            };

            if rt.debug_level() >= DebugLevel::EveryCall {
                debug!("AddReference poa_idx: {poa_idx}, oid: {object_id:#x}");
            }

            match locate(rt, poa_idx, object_id, ctx)
                .and_then(|_| ctx.ref_list.add_ref(rt, poa_idx, object_id))
            {
                Ok(()) => make_simple_answer(tx, MessageId::Success, request_id),
                Err(e) => answer_error(tx, &e, request_id),
            }
            true
        }

        MessageId::ReleaseObject => {
            let Ok((poa_idx, object_id)) = parse_local_id(rx) else {
                answer_error(tx, &Error::BadInput, request_id);
                return true;
            };

            if rt.debug_level() >= DebugLevel::EveryCall {
                debug!("ReleaseObject poa_idx: {poa_idx}, oid: {object_id:#x}");
            }

            if ctx.ref_list.remove_ref(rt, poa_idx, object_id) {
                make_simple_answer(tx, MessageId::Success, request_id);
            } else {
                make_simple_answer(tx, MessageId::Error_ObjectNotExist, request_id);
            }
            true
        }

        MessageId::StreamInitialization => {
            let stream_call = || -> Result<(CallHeader, u64), Error> {
                let ch = CallHeader::decode(&rx.as_slice()[Header::SIZE..])?;
                let mut r = Reader::at(rx.as_slice(), Header::SIZE + CallHeader::SIZE);
                Ok((ch, r.read_u64()?))
            };
            let (ch, stream_id) = match stream_call() {
                Ok(v) => v,
                Err(e) => {
                    answer_error(tx, &e, request_id);
                    return true;
                }
            };

            if rt.debug_level() >= DebugLevel::EveryCall {
                debug!(
                    "StreamInitialization stream_id: {stream_id}, fn_idx: {}, poa_idx: {}, \
                     oid: {:#x}",
                    ch.function_idx, ch.poa_idx, ch.object_id
                );
            }

            let entry = match locate(rt, ch.poa_idx, ch.object_id, ctx) {
                Ok(entry) => entry,
                Err(e) => {
                    answer_error(tx, &e, request_id);
                    return true;
                }
            };

            ctx.current_stream = Some(stream_id);
            let result = entry.servant.dispatch(ctx, rx, tx, false);
            ctx.current_stream = None;

            match result {
                Ok(()) => make_simple_answer(tx, MessageId::Success, request_id),
                Err(e) => answer_error(tx, &e, request_id),
            }
            true
        }

        MessageId::StreamChunk
        | MessageId::StreamComplete
        | MessageId::StreamError
        | MessageId::StreamCancel => {
            if let Some(manager) = &ctx.stream_manager {
                manager.handle_message(rx);
            }
            false
        }

        _ => {
            make_simple_answer(tx, MessageId::Error_UnknownMessageId, request_id);
            true
        }
    }
}
