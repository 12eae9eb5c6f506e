//! Netlink attribute encoding and decoding.
//!
//! Attributes are `(length, type)` headers followed by a payload, padded to
//! four bytes, in host byte order. Nesting is just an attribute whose
//! payload is itself an attribute stream.
//!
//! The encoder covers the full scalar vocabulary even though the control
//! plane currently only encodes a subset of it.

#![allow(dead_code)]

use super::NetlinkError;

/// Attribute header length.
const NLA_HDRLEN: usize = 4;
/// Mask off the nested/byte-order bits when matching attribute types.
const NLA_TYPE_MASK: u16 = 0x3fff;

pub(crate) fn align(len: usize) -> usize {
    (len + 3) & !3
}

/// Serialises a flat or nested attribute stream.
#[derive(Default)]
pub(crate) struct AttrEncoder {
    buf: Vec<u8>,
}

impl AttrEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, typ: u16, value: u8) {
        self.raw(typ, &[value]);
    }

    pub fn u16(&mut self, typ: u16, value: u16) {
        self.raw(typ, &value.to_ne_bytes());
    }

    pub fn u32(&mut self, typ: u16, value: u32) {
        self.raw(typ, &value.to_ne_bytes());
    }

    pub fn u64(&mut self, typ: u16, value: u64) {
        self.raw(typ, &value.to_ne_bytes());
    }

    /// A NUL-terminated string attribute.
    pub fn string(&mut self, typ: u16, value: &str) {
        let mut payload = Vec::with_capacity(value.len() + 1);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
        self.raw(typ, &payload);
    }

    /// An attribute whose payload is the attribute stream produced by `f`.
    pub fn nested(&mut self, typ: u16, f: impl FnOnce(&mut AttrEncoder)) {
        let mut inner = AttrEncoder::new();
        f(&mut inner);
        self.raw(typ, &inner.finish());
    }

    fn raw(&mut self, typ: u16, payload: &[u8]) {
        let len = NLA_HDRLEN + payload.len();
        self.buf.extend_from_slice(&(len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&typ.to_ne_bytes());
        self.buf.extend_from_slice(payload);
        self.buf.resize(align(self.buf.len()), 0);
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Iterates the `(type, payload)` pairs of an attribute stream.
pub(crate) struct AttrIter<'a> {
    rest: &'a [u8],
}

impl<'a> AttrIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { rest: buf }
    }
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = Result<(u16, &'a [u8]), NetlinkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        if self.rest.len() < NLA_HDRLEN {
            self.rest = &[];
            return Some(Err(NetlinkError::Malformed("truncated attribute header")));
        }
        let len = u16::from_ne_bytes([self.rest[0], self.rest[1]]) as usize;
        let typ = u16::from_ne_bytes([self.rest[2], self.rest[3]]) & NLA_TYPE_MASK;
        if len < NLA_HDRLEN || len > self.rest.len() {
            self.rest = &[];
            return Some(Err(NetlinkError::Malformed("bad attribute length")));
        }
        let payload = &self.rest[NLA_HDRLEN..len];
        self.rest = &self.rest[align(len).min(self.rest.len())..];
        Some(Ok((typ, payload)))
    }
}

pub(crate) fn get_u8(payload: &[u8]) -> Result<u8, NetlinkError> {
    match payload {
        [v, ..] => Ok(*v),
        [] => Err(NetlinkError::Malformed("u8 attribute too short")),
    }
}

pub(crate) fn get_u16(payload: &[u8]) -> Result<u16, NetlinkError> {
    payload
        .get(..2)
        .map(|b| u16::from_ne_bytes([b[0], b[1]]))
        .ok_or(NetlinkError::Malformed("u16 attribute too short"))
}

pub(crate) fn get_u32(payload: &[u8]) -> Result<u32, NetlinkError> {
    payload
        .get(..4)
        .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(NetlinkError::Malformed("u32 attribute too short"))
}
