// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The marshalling target: a growable byte buffer that may borrow an
//! external region instead of owning its storage.
//!
//! Exactly one of three modes is active at any moment:
//!
//!   - **owned**: heap allocation, grows on demand;
//!   - **view-for-write**: borrows a ring-buffer write reservation;
//!     writes beyond the reservation set a sticky overflow flag instead of
//!     reallocating;
//!   - **view-for-read**: borrows a received ring record; dropping the
//!     buffer releases the record and advances the ring's read index.

use nprpc_shm::{RecvView, SendReservation};

use crate::Error;

enum Inner {
    Owned(Vec<u8>),
    WriteView { res: SendReservation, len: usize },
    ReadView(RecvView),
}

pub struct FlatBuffer {
    inner: Inner,
    overflow: bool,
}

impl Default for FlatBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FlatBuffer {
    pub fn new() -> Self {
        Self {
            inner: Inner::Owned(Vec::new()),
            overflow: false,
        }
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            inner: Inner::Owned(Vec::with_capacity(n)),
            overflow: false,
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            inner: Inner::Owned(data),
            overflow: false,
        }
    }

    /// Zero-copy send: marshal directly into a ring reservation.
    pub fn view_for_write(res: SendReservation) -> Self {
        Self {
            inner: Inner::WriteView { res, len: 0 },
            overflow: false,
        }
    }

    /// Zero-copy receive: parse a record in place in the ring.
    pub fn view_for_read(view: RecvView) -> Self {
        Self {
            inner: Inner::ReadView(view),
            overflow: false,
        }
    }

    pub fn is_write_view(&self) -> bool {
        matches!(self.inner, Inner::WriteView { .. })
    }

    pub fn is_read_view(&self) -> bool {
        matches!(self.inner, Inner::ReadView(_))
    }

    /// A write into a view that did not fit. Sticky until [`Self::clear`].
    pub fn overflowed(&self) -> bool {
        self.overflow
    }

    pub fn len(&self) -> usize {
        match &self.inner {
            Inner::Owned(v) => v.len(),
            Inner::WriteView { len, .. } => *len,
            Inner::ReadView(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.inner {
            Inner::Owned(v) => v,
            Inner::WriteView { res, len } => unsafe {
                std::slice::from_raw_parts(res.as_mut_ptr(), *len)
            },
            Inner::ReadView(v) => v.bytes(),
        }
    }

    /// Reset to empty, keeping the mode. A read view cannot be written
    /// into, so clearing one falls back to an empty owned buffer (and
    /// releases the ring record).
    pub fn clear(&mut self) {
        self.overflow = false;
        match &mut self.inner {
            Inner::Owned(v) => v.clear(),
            Inner::WriteView { len, .. } => *len = 0,
            Inner::ReadView(_) => self.inner = Inner::Owned(Vec::new()),
        }
    }

    /// Copy a read view out into an owned buffer so it can outlive the
    /// ring record. No-op in the other modes.
    pub fn detach(&mut self) {
        if let Inner::ReadView(v) = &self.inner {
            self.inner = Inner::Owned(v.to_vec());
        }
    }

    /// Take the reservation out of a write view for committing; the
    /// buffer is left empty-owned. Returns the reservation and the number
    /// of marshalled bytes.
    pub fn take_reservation(&mut self) -> Option<(SendReservation, usize)> {
        if !matches!(self.inner, Inner::WriteView { .. }) {
            return None;
        }
        match std::mem::replace(&mut self.inner, Inner::Owned(Vec::new())) {
            Inner::WriteView { res, len } => Some((res, len)),
            _ => unreachable!(),
        }
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        match &mut self.inner {
            Inner::Owned(v) => v.extend_from_slice(data),
            Inner::WriteView { res, len } => {
                if *len + data.len() > res.max_size() {
                    self.overflow = true;
                    return;
                }
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        data.as_ptr(),
                        res.as_mut_ptr().add(*len),
                        data.len(),
                    );
                }
                *len += data.len();
            }
            Inner::ReadView(_) => self.overflow = true,
        }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.write_bytes(&[v]);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write_bytes(&v.to_le_bytes());
    }

    /// Length-prefixed string.
    pub fn write_str(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.write_bytes(s.as_bytes());
    }

    /// Patch four already-written bytes in place (header size fixups).
    pub fn patch_u32(&mut self, offset: usize, v: u32) {
        let bytes = v.to_le_bytes();
        match &mut self.inner {
            Inner::Owned(vec) => {
                vec[offset..offset + 4].copy_from_slice(&bytes);
            }
            Inner::WriteView { res, len } => {
                assert!(offset + 4 <= *len);
                unsafe {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), res.as_mut_ptr().add(offset), 4);
                }
            }
            Inner::ReadView(_) => self.overflow = true,
        }
    }
}

impl std::fmt::Debug for FlatBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mode = match self.inner {
            Inner::Owned(_) => "owned",
            Inner::WriteView { .. } => "write-view",
            Inner::ReadView(_) => "read-view",
        };
        f.debug_struct("FlatBuffer")
            .field("mode", &mode)
            .field("len", &self.len())
            .field("overflow", &self.overflow)
            .finish()
    }
}

/// Bounds-checked sequential reader over a received message.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Start reading at `offset` (e.g. past the headers).
    pub fn at(data: &'a [u8], offset: usize) -> Self {
        Self { data, pos: offset }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.remaining() < n {
            return Err(Error::BadInput);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_i32(&mut self) -> Result<i32, Error> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, Error> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], Error> {
        self.take(n)
    }

    /// Length-prefixed string written by [`FlatBuffer::write_str`].
    pub fn read_str(&mut self) -> Result<String, Error> {
        let n = self.read_u32()? as usize;
        let bytes = self.take(n)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::BadInput)
    }
}
