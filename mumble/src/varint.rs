//! The variable-length integer encoding used inside UDP audio packets.
//!
//! This is not the protobuf varint: Mumble's UDP framing uses its own
//! prefix-coded format with 1 to 9 byte encodings and an inverted form for
//! values with the high bit set (negative numbers on the wire).

use bytes::{Buf, BufMut};

/// Appends the canonical (minimum-length) encoding of `v` to `dst`.
pub fn encode(dst: &mut impl BufMut, v: u64) {
    let mut v = v;

    if v & 0x8000_0000_0000_0000 != 0 && !v < 0x1_0000_0000 {
        // negative number, send the complement instead
        let inv = !v;

        if inv <= 0x3 {
            dst.put_u8(0xFC | inv as u8);
            return;
        }

        dst.put_u8(0xF8);
        v = inv;
    }

    if v < 0x80 {
        dst.put_u8(v as u8);
    } else if v < 0x4000 {
        dst.put_u8((v >> 8) as u8 | 0x80);
        dst.put_u8(v as u8);
    } else if v < 0x20_0000 {
        dst.put_u8((v >> 16) as u8 | 0xC0);
        dst.put_u8((v >> 8) as u8);
        dst.put_u8(v as u8);
    } else if v < 0x1000_0000 {
        dst.put_u8((v >> 24) as u8 | 0xE0);
        dst.put_u8((v >> 16) as u8);
        dst.put_u8((v >> 8) as u8);
        dst.put_u8(v as u8);
    } else if v < 0x1_0000_0000 {
        dst.put_u8(0xF0);
        dst.put_u32(v as u32);
    } else {
        dst.put_u8(0xF4);
        dst.put_u64(v);
    }
}

/// Reads one varint from `src`, advancing it past the consumed bytes.
/// Returns `None` if the buffer is truncated.
pub fn decode(src: &mut impl Buf) -> Option<u64> {
    if !src.has_remaining() {
        return None;
    }

    let p = src.get_u8();

    let v = if p & 0x80 == 0x00 {
        (p & 0x7F) as u64
    } else if p & 0xC0 == 0x80 {
        if src.remaining() < 1 {
            return None;
        }
        ((p & 0x3F) as u64) << 8 | src.get_u8() as u64
    } else if p & 0xE0 == 0xC0 {
        if src.remaining() < 2 {
            return None;
        }
        ((p & 0x1F) as u64) << 16 | (src.get_u8() as u64) << 8 | src.get_u8() as u64
    } else if p & 0xF0 == 0xE0 {
        if src.remaining() < 3 {
            return None;
        }
        ((p & 0x0F) as u64) << 24
            | (src.get_u8() as u64) << 16
            | (src.get_u8() as u64) << 8
            | src.get_u8() as u64
    } else {
        match p & 0x0C {
            0x00 => {
                if src.remaining() < 4 {
                    return None;
                }
                src.get_u32() as u64
            }
            0x04 => {
                if src.remaining() < 8 {
                    return None;
                }
                src.get_u64()
            }
            0x08 => !decode(src)?,
            _ => !((p & 0x03) as u64),
        }
    };

    Some(v)
}

/// Number of bytes `encode` will emit for `v`.
pub fn encoded_len(v: u64) -> usize {
    let mut buf = Vec::with_capacity(9);
    encode(&mut buf, v);
    buf.len()
}
