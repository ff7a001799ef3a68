// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Transport implementations behind the uniform session contract: TCP and
//! WebSocket stream sessions, UDP datagram sessions, and shared-memory
//! channel sessions.

pub mod shm;
pub mod tcp;
pub mod udp;
pub mod ws;

use std::io::{self, Read, Write};

use crate::message::Header;
use crate::MAX_MESSAGE_SIZE;

/// Read one `[u32 size][size bytes]` frame. The returned vector contains
/// the whole envelope including the size field, ready for
/// [`Header::decode`]. A frame claiming more than the per-process maximum
/// is rejected *before* any allocation proportional to the claim.
pub(crate) fn read_frame(stream: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut size_bytes = [0u8; 4];
    stream.read_exact(&mut size_bytes)?;
    let size = u32::from_le_bytes(size_bytes);

    if size > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {size} bytes exceeds maximum"),
        ));
    }
    if (size as usize) < Header::SIZE - 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame too small for a header",
        ));
    }

    let mut frame = vec![0u8; size as usize + 4];
    frame[..4].copy_from_slice(&size_bytes);
    stream.read_exact(&mut frame[4..])?;
    Ok(frame)
}

pub(crate) fn write_frame(stream: &mut impl Write, data: &[u8]) -> io::Result<()> {
    stream.write_all(data)
}

/// Once a frame has started arriving we keep reading past the caller's
/// deadline rather than desynchronise the stream; a peer that stalls
/// mid-frame for this long is treated as dead.
const FRAME_STALL_LIMIT: std::time::Duration = std::time::Duration::from_secs(30);

/// Deadline-aware frame read for sockets with read timeouts armed.
///
/// Returns `Ok(None)` when the deadline passes before the first byte of a
/// frame arrives. Once any byte has been read the frame is always
/// completed (or the connection declared dead): abandoning a frame
/// mid-read would desynchronise the length-delimited stream.
pub(crate) fn read_frame_with_deadline(
    stream: &mut std::net::TcpStream,
    deadline: std::time::Instant,
    poll: std::time::Duration,
) -> io::Result<Option<Vec<u8>>> {
    stream.set_read_timeout(Some(poll))?;

    let mut size_bytes = [0u8; 4];
    let mut got = 0usize;
    let mut stall_deadline = None;

    while got < 4 {
        match stream.read(&mut size_bytes[got..]) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                got += n;
                stall_deadline = Some(std::time::Instant::now() + FRAME_STALL_LIMIT);
            }
            Err(e) if is_timeout(&e) => {
                let now = std::time::Instant::now();
                match stall_deadline {
                    None if now >= deadline => return Ok(None),
                    Some(stall) if now >= stall => {
                        return Err(io::ErrorKind::TimedOut.into());
                    }
                    _ => {}
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    let size = u32::from_le_bytes(size_bytes);
    if size > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {size} bytes exceeds maximum"),
        ));
    }
    if (size as usize) < Header::SIZE - 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame too small for a header",
        ));
    }

    let mut frame = vec![0u8; size as usize + 4];
    frame[..4].copy_from_slice(&size_bytes);

    let mut got = 4usize;
    let mut stall = std::time::Instant::now() + FRAME_STALL_LIMIT;
    while got < frame.len() {
        match stream.read(&mut frame[got..]) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                got += n;
                stall = std::time::Instant::now() + FRAME_STALL_LIMIT;
            }
            Err(e) if is_timeout(&e) => {
                if std::time::Instant::now() >= stall {
                    return Err(io::ErrorKind::TimedOut.into());
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    Ok(Some(frame))
}

/// Whether an I/O failure is the read-timeout tick of a socket with a
/// read timeout armed (as opposed to a dead peer).
pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// The write failures that make a client session eligible for its single
/// reconnect.
pub(crate) fn is_reconnectable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_frame_round_trip() {
        let mut msg = Vec::new();
        msg.extend_from_slice(&20u32.to_le_bytes());
        msg.extend_from_slice(&[7u8; 20]);

        let mut cursor = io::Cursor::new(msg.clone());
        assert_eq!(read_frame(&mut cursor).unwrap(), msg);
    }

    #[test]
    fn oversized_frame_rejected_without_allocation() {
        let mut msg = Vec::new();
        msg.extend_from_slice(&(40 * 1024 * 1024u32).to_le_bytes());
        msg.extend_from_slice(&[0u8; 8]);

        let mut cursor = io::Cursor::new(msg);
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn runt_frame_rejected() {
        let mut msg = Vec::new();
        msg.extend_from_slice(&4u32.to_le_bytes());
        msg.extend_from_slice(&[0u8; 4]);

        let mut cursor = io::Cursor::new(msg);
        assert!(read_frame(&mut cursor).is_err());
    }
}
