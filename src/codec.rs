//! Binary codec for stream file event records.
//!
//! This module is pure data transformation -- no file I/O, no index management. It
//! provides the unsigned-varint and fixed-width integer helpers the on-disk format
//! is built from, plus encode/decode for a single event record.
//!
//! An event is laid out as:
//!
//! ```text
//! uvarint total_len            byte length of everything following in this event
//! uvarint index_count
//! index_count x (
//!     uvarint name_len
//!     name bytes               opaque index label, conventionally "name:value"
//!     uvarint back_offset      previous event in this file carrying the label
//! )
//! payload bytes
//! ```
//!
//! A 32-bit zero written at close terminates the event sequence: its first byte
//! decodes as a zero `total_len`, which [`decode_event`] reports as "no event".

use std::collections::HashMap;
use std::io::Read;

use bytes::Bytes;

use crate::error::Error;
use crate::types::Event;

/// Append `value` to `out` as an unsigned LEB128 varint.
pub fn write_uvarint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Number of bytes [`write_uvarint`] emits for `value`.
pub fn uvarint_len(value: u64) -> u64 {
    let mut len = 1;
    let mut value = value >> 7;
    while value != 0 {
        len += 1;
        value >>= 7;
    }
    len
}

/// Read an unsigned LEB128 varint from `r`.
pub fn read_uvarint<R: Read>(r: &mut R) -> std::io::Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0;
    loop {
        let mut byte = [0u8; 1];
        r.read_exact(&mut byte)?;
        value |= ((byte[0] & 0x7f) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "varint overflows u64",
            ));
        }
    }
}

/// Read a varint, mapping a clean end-of-stream on the first byte to `None`.
///
/// A varint cut off mid-way is an error: the caller was promised more bytes.
fn read_uvarint_opt<R: Read>(r: &mut R) -> std::io::Result<Option<u64>> {
    let mut first = [0u8; 1];
    if r.read(&mut first)? == 0 {
        return Ok(None);
    }
    if first[0] & 0x80 == 0 {
        return Ok(Some(first[0] as u64));
    }

    let mut value = (first[0] & 0x7f) as u64;
    let mut shift = 7;
    loop {
        let mut byte = [0u8; 1];
        r.read_exact(&mut byte)?;
        value |= ((byte[0] & 0x7f) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(Some(value));
        }
        shift += 7;
        if shift >= 64 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "varint overflows u64",
            ));
        }
    }
}

/// Append a little-endian `i32`.
pub fn write_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Append a little-endian `i64`.
pub fn write_i64(out: &mut Vec<u8>, value: i64) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Read a little-endian `i64` from `r`.
pub fn read_i64<R: Read>(r: &mut R) -> std::io::Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

/// Encode one event into `out`.
///
/// `offsets` is the event's back-pointer table as `(label, previous_offset)` pairs.
/// Callers pass the labels in sorted order so that the same logical event always
/// encodes to the same bytes.
pub fn encode_event(out: &mut Vec<u8>, data: &[u8], offsets: &[(String, u64)]) {
    let mut body = Vec::with_capacity(data.len() + 16 * offsets.len() + 1);
    write_uvarint(&mut body, offsets.len() as u64);
    for (label, offset) in offsets {
        write_uvarint(&mut body, label.len() as u64);
        body.extend_from_slice(label.as_bytes());
        write_uvarint(&mut body, *offset);
    }
    body.extend_from_slice(data);

    write_uvarint(out, body.len() as u64);
    out.extend_from_slice(&body);
}

/// Total encoded length of an event with the given payload and back-pointer table.
pub fn encoded_event_len(data: &[u8], offsets: &[(String, u64)]) -> u64 {
    let mut body_len = uvarint_len(offsets.len() as u64);
    for (label, offset) in offsets {
        body_len += uvarint_len(label.len() as u64) + label.len() as u64 + uvarint_len(*offset);
    }
    body_len += data.len() as u64;
    uvarint_len(body_len) + body_len
}

/// Decode one event from `r`.
///
/// Returns the event and the logical byte length consumed (length prefix included)
/// so callers can advance their offset. Returns `Ok(None)` at the end-of-events
/// sentinel (zero length prefix) or on a clean end of stream -- both terminate
/// iteration.
///
/// # Errors
///
/// Returns [`Error::CorruptedEvent`] if the stream ends inside a record or the
/// record's fields are malformed.
pub fn decode_event<R: Read>(r: &mut R) -> Result<Option<(Event, u64)>, Error> {
    let total_len = match read_uvarint_opt(r).map_err(|e| Error::CorruptedEvent {
        detail: format!("length prefix: {e}"),
    })? {
        None | Some(0) => return Ok(None),
        Some(len) => len,
    };

    let mut body = vec![0u8; total_len as usize];
    r.read_exact(&mut body).map_err(|e| Error::CorruptedEvent {
        detail: format!("body of {total_len} bytes: {e}"),
    })?;

    let mut cursor: &[u8] = &body;
    let index_count = read_uvarint(&mut cursor).map_err(|e| Error::CorruptedEvent {
        detail: format!("index count: {e}"),
    })?;

    let mut offsets = HashMap::with_capacity(index_count as usize);
    for _ in 0..index_count {
        let name_len = read_uvarint(&mut cursor).map_err(|e| Error::CorruptedEvent {
            detail: format!("index name length: {e}"),
        })?;
        if name_len as usize > cursor.len() {
            return Err(Error::CorruptedEvent {
                detail: "index name runs past event body".to_string(),
            });
        }
        let name = std::str::from_utf8(&cursor[..name_len as usize])
            .map_err(|e| Error::CorruptedEvent {
                detail: format!("index name is not UTF-8: {e}"),
            })?
            .to_string();
        cursor = &cursor[name_len as usize..];

        let back_offset = read_uvarint(&mut cursor).map_err(|e| Error::CorruptedEvent {
            detail: format!("back offset: {e}"),
        })?;
        offsets.insert(name, back_offset);
    }

    let event = Event {
        data: Bytes::copy_from_slice(cursor),
        offsets,
    };

    Ok(Some((event, uvarint_len(total_len) + total_len)))
}
