//! Fixed-Width Codec Helpers
//!
//! Everything on the wire and in persisted metadata uses fixed-width
//! little-endian integers and u32 length-prefixed byte strings. These helpers
//! wrap `bytes::Buf`/`BufMut` with bounds checks that fail as `Corruption`
//! instead of panicking, so a truncated frame never takes the process down.

use bytes::{Buf, BufMut, Bytes};

use crate::error::{Error, Result};

pub fn put_str(dst: &mut impl BufMut, s: &str) {
    dst.put_u32_le(s.len() as u32);
    dst.put_slice(s.as_bytes());
}

pub fn put_bytes(dst: &mut impl BufMut, b: &[u8]) {
    dst.put_u32_le(b.len() as u32);
    dst.put_slice(b);
}

pub fn get_u8(src: &mut impl Buf) -> Result<u8> {
    if src.remaining() < 1 {
        return Err(Error::corruption("truncated u8"));
    }
    Ok(src.get_u8())
}

pub fn get_u32(src: &mut impl Buf) -> Result<u32> {
    if src.remaining() < 4 {
        return Err(Error::corruption("truncated u32"));
    }
    Ok(src.get_u32_le())
}

pub fn get_u64(src: &mut impl Buf) -> Result<u64> {
    if src.remaining() < 8 {
        return Err(Error::corruption("truncated u64"));
    }
    Ok(src.get_u64_le())
}

pub fn get_bytes(src: &mut Bytes) -> Result<Bytes> {
    let len = get_u32(src)? as usize;
    if src.remaining() < len {
        return Err(Error::corruption(format!(
            "length prefix {} exceeds remaining {}",
            len,
            src.remaining()
        )));
    }
    Ok(src.split_to(len))
}

pub fn get_str(src: &mut Bytes) -> Result<String> {
    let raw = get_bytes(src)?;
    String::from_utf8(raw.to_vec()).map_err(|_| Error::corruption("non-utf8 string"))
}
