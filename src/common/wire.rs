//! Length prefixed big endian primitives shared by contact and packet encoding.

use bytes::{Buf, BufMut};

use crate::{Error, Result};

pub(crate) fn put_bytes<B: BufMut>(buf: &mut B, bytes: &[u8]) {
    buf.put_i32(bytes.len() as i32);
    buf.put_slice(bytes);
}

pub(crate) fn get_u8(buf: &mut &[u8]) -> Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn get_i32(buf: &mut &[u8]) -> Result<i32> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

pub(crate) fn get_i64(buf: &mut &[u8]) -> Result<i64> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

/// Reads an `i32` length followed by that many bytes.
pub(crate) fn get_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = get_i32(buf)?;
    if len < 0 {
        return Err(Error::MalformedPacket("negative length"));
    }

    let len = len as usize;
    ensure(buf, len)?;

    let (bytes, rest) = buf.split_at(len);
    *buf = rest;

    Ok(bytes)
}

fn ensure(buf: &[u8], len: usize) -> Result<()> {
    if buf.remaining() < len {
        return Err(Error::MalformedPacket("truncated"));
    }

    Ok(())
}
