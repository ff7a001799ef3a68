// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The length-delimited binary envelope.
//!
//! Every on-the-wire message begins with a 16-byte little-endian
//! [`Header`]; function calls follow it with a 16-byte [`CallHeader`] and
//! the opaque argument payload produced by the IDL marshaller.

#![allow(non_camel_case_types)]

use crate::buffer::FlatBuffer;
use crate::Error;

/// Discriminates every message kind the dispatch loop understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MessageId {
    FunctionCall = 0,
    BlockResponse = 1,
    AddReference = 2,
    ReleaseObject = 3,
    Success = 4,
    StreamInitialization = 5,
    StreamChunk = 6,
    StreamComplete = 7,
    StreamError = 8,
    StreamCancel = 9,
    Error_PoaNotExist = 10,
    Error_ObjectNotExist = 11,
    Error_CommFailure = 12,
    Error_UnknownFunctionIdx = 13,
    Error_UnknownMessageId = 14,
    Error_BadAccess = 15,
    Error_BadInput = 16,
    Error_Timeout = 17,
}

impl MessageId {
    pub fn from_i32(v: i32) -> Option<Self> {
        use MessageId::*;
        Some(match v {
            0 => FunctionCall,
            1 => BlockResponse,
            2 => AddReference,
            3 => ReleaseObject,
            4 => Success,
            5 => StreamInitialization,
            6 => StreamChunk,
            7 => StreamComplete,
            8 => StreamError,
            9 => StreamCancel,
            10 => Error_PoaNotExist,
            11 => Error_ObjectNotExist,
            12 => Error_CommFailure,
            13 => Error_UnknownFunctionIdx,
            14 => Error_UnknownMessageId,
            15 => Error_BadAccess,
            16 => Error_BadInput,
            17 => Error_Timeout,
            _ => return None,
        })
    }

    /// Map an error reply onto the error kind a caller observes. `None`
    /// for non-error message ids.
    pub fn to_error(self) -> Option<Error> {
        use MessageId::*;
        Some(match self {
            Error_PoaNotExist => Error::PoaNotExist,
            Error_ObjectNotExist => Error::ObjectNotExist,
            Error_CommFailure => Error::CommFailure,
            Error_UnknownFunctionIdx => Error::UnknownFunctionIdx,
            Error_UnknownMessageId => Error::UnknownMessageId,
            Error_BadAccess => Error::BadAccess,
            Error_BadInput => Error::BadInput,
            Error_Timeout => Error::Timeout,
            _ => return None,
        })
    }

    pub fn is_stream(self) -> bool {
        matches!(
            self,
            Self::StreamChunk | Self::StreamComplete | Self::StreamError | Self::StreamCancel
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MessageType {
    Request = 0,
    Answer = 1,
}

impl MessageType {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Request),
            1 => Some(Self::Answer),
            _ => None,
        }
    }
}

/// The 16-byte message header. `size` counts every byte following the
/// size field itself, so a framed message occupies `size + 4` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub size: u32,
    pub msg_id: MessageId,
    pub msg_type: MessageType,
    pub request_id: u32,
}

impl Header {
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.size.to_le_bytes());
        out[4..8].copy_from_slice(&(self.msg_id as i32).to_le_bytes());
        out[8..12].copy_from_slice(&(self.msg_type as i32).to_le_bytes());
        out[12..16].copy_from_slice(&self.request_id.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.len() < Self::SIZE {
            return Err(Error::BadInput);
        }
        let size = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let msg_id = i32::from_le_bytes(data[4..8].try_into().unwrap());
        let msg_type = i32::from_le_bytes(data[8..12].try_into().unwrap());
        let request_id = u32::from_le_bytes(data[12..16].try_into().unwrap());

        Ok(Self {
            size,
            msg_id: MessageId::from_i32(msg_id).ok_or(Error::UnknownMessageId)?,
            msg_type: MessageType::from_i32(msg_type).ok_or(Error::BadInput)?,
            request_id,
        })
    }

    /// Peek just the `msg_id` field without validating the rest.
    pub fn peek_msg_id(data: &[u8]) -> Option<MessageId> {
        if data.len() < 8 {
            return None;
        }
        MessageId::from_i32(i32::from_le_bytes(data[4..8].try_into().unwrap()))
    }
}

/// The 16-byte call header following a `FunctionCall` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallHeader {
    pub poa_idx: u16,
    pub interface_idx: u8,
    pub function_idx: u8,
    pub object_id: u64,
}

impl CallHeader {
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..2].copy_from_slice(&self.poa_idx.to_le_bytes());
        out[2] = self.interface_idx;
        out[3] = self.function_idx;
        // out[4..8] is padding
        out[8..16].copy_from_slice(&self.object_id.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.len() < Self::SIZE {
            return Err(Error::BadInput);
        }
        Ok(Self {
            poa_idx: u16::from_le_bytes(data[0..2].try_into().unwrap()),
            interface_idx: data[2],
            function_idx: data[3],
            object_id: u64::from_le_bytes(data[8..16].try_into().unwrap()),
        })
    }
}

/// Where the argument payload of a `FunctionCall` begins.
pub const CALL_PAYLOAD_OFFSET: usize = Header::SIZE + CallHeader::SIZE;

/// Reset `buf` to a bare header-only answer (a `Success` or `Error_*`
/// reply), preserving the request id of the message being answered.
pub fn make_simple_answer(buf: &mut FlatBuffer, msg_id: MessageId, request_id: u32) {
    buf.clear();
    buf.write_bytes(
        &Header {
            size: (Header::SIZE - 4) as u32,
            msg_id,
            msg_type: MessageType::Answer,
            request_id,
        }
        .encode(),
    );
}

/// Start a request message: header (with a placeholder size) followed by
/// the call header. The caller marshals arguments after this and then
/// calls [`finalize`].
pub fn begin_call(buf: &mut FlatBuffer, ch: &CallHeader, request_id: u32) {
    buf.clear();
    buf.write_bytes(
        &Header {
            size: 0,
            msg_id: MessageId::FunctionCall,
            msg_type: MessageType::Request,
            request_id,
        }
        .encode(),
    );
    buf.write_bytes(&ch.encode());
}

/// Patch the header's size field once the body is complete. An overflowed
/// view is left alone; the send path reports it as `NoBufferSpace`.
pub fn finalize(buf: &mut FlatBuffer) {
    if buf.overflowed() || buf.len() < Header::SIZE {
        return;
    }
    let size = (buf.len() - 4) as u32;
    buf.patch_u32(0, size);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let h = Header {
            size: 44,
            msg_id: MessageId::FunctionCall,
            msg_type: MessageType::Request,
            request_id: 7,
        };
        assert_eq!(Header::decode(&h.encode()).unwrap(), h);
    }

    #[test]
    fn header_rejects_unknown_msg_id() {
        let mut bytes = Header {
            size: 12,
            msg_id: MessageId::Success,
            msg_type: MessageType::Answer,
            request_id: 0,
        }
        .encode();
        bytes[4..8].copy_from_slice(&999i32.to_le_bytes());
        assert!(matches!(
            Header::decode(&bytes),
            Err(Error::UnknownMessageId)
        ));
    }

    #[test]
    fn header_rejects_short_input() {
        assert!(matches!(Header::decode(&[0u8; 8]), Err(Error::BadInput)));
    }

    #[test]
    fn call_header_round_trip() {
        let ch = CallHeader {
            poa_idx: 3,
            interface_idx: 1,
            function_idx: 250,
            object_id: 0xDEAD_BEEF_0000_0001,
        };
        assert_eq!(CallHeader::decode(&ch.encode()).unwrap(), ch);
    }

    #[test]
    fn every_message_id_round_trips() {
        for v in 0..18 {
            let id = MessageId::from_i32(v).unwrap();
            assert_eq!(id as i32, v);
        }
        assert!(MessageId::from_i32(18).is_none());
        assert!(MessageId::from_i32(-1).is_none());
    }

    #[test]
    fn encoded_call_satisfies_size_invariant() {
        let mut buf = FlatBuffer::new();
        begin_call(
            &mut buf,
            &CallHeader {
                poa_idx: 0,
                interface_idx: 0,
                function_idx: 2,
                object_id: 9,
            },
            41,
        );
        buf.write_u32(1234);
        finalize(&mut buf);

        let header = Header::decode(buf.as_slice()).unwrap();
        assert_eq!(buf.len(), header.size as usize + 4);
        assert_eq!(header.request_id, 41);
    }

    #[test]
    fn simple_answer_preserves_request_id() {
        let mut buf = FlatBuffer::new();
        make_simple_answer(&mut buf, MessageId::Error_BadInput, 99);

        let header = Header::decode(buf.as_slice()).unwrap();
        assert_eq!(header.msg_id, MessageId::Error_BadInput);
        assert_eq!(header.msg_type, MessageType::Answer);
        assert_eq!(header.request_id, 99);
        assert_eq!(buf.len(), Header::SIZE);
    }
}
