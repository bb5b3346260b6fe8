//! One-shot immutable sorted string table.
//!
//! A closed stream file ends with a small map from index label to the file offset of
//! the label's most recent event. This module builds and reads that map: a sequence
//! of length-prefixed `(key, value)` records, followed by an index of
//! `(key, record_offset)` pairs, followed by a fixed-size trailer pointing at the
//! index. Lookups binary-search the index, so a read costs O(log n).

use crate::codec::{read_uvarint, write_uvarint};
use crate::error::Error;

/// Byte width of the trailer: index offset (u64 LE) plus entry count (u32 LE).
const TRAILER_LEN: usize = 12;

/// Builds a sorted table in memory.
///
/// Keys must be set in strictly ascending byte order; the table is finalized with
/// [`Writer::finish`], which returns the complete on-disk byte form.
#[derive(Default)]
pub struct Writer {
    records: Vec<u8>,
    index: Vec<u8>,
    count: u32,
    last_key: Option<Vec<u8>>,
}

impl Writer {
    /// Create an empty table builder.
    pub fn new() -> Writer {
        Writer::default()
    }

    /// Add a key/value pair. Keys must arrive in strictly ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfOrderKey`] if `key` is not strictly greater than the
    /// previously set key. This is a programming error in the caller.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        if let Some(last) = &self.last_key
            && key <= last.as_slice()
        {
            return Err(Error::OutOfOrderKey);
        }

        let record_offset = self.records.len() as u64;
        write_uvarint(&mut self.records, key.len() as u64);
        self.records.extend_from_slice(key);
        write_uvarint(&mut self.records, value.len() as u64);
        self.records.extend_from_slice(value);

        write_uvarint(&mut self.index, key.len() as u64);
        self.index.extend_from_slice(key);
        self.index.extend_from_slice(&record_offset.to_le_bytes());

        self.count += 1;
        self.last_key = Some(key.to_vec());
        Ok(())
    }

    /// Finalize the table and return its on-disk bytes.
    pub fn finish(self) -> Vec<u8> {
        let mut out = self.records;
        let index_offset = out.len() as u64;
        out.extend_from_slice(&self.index);
        out.extend_from_slice(&index_offset.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
        out
    }
}

/// Read side of a sorted table.
///
/// Parses the index eagerly (it is one entry per index label seen in the file) and
/// resolves keys by binary search.
#[derive(Debug)]
pub struct Reader {
    data: Vec<u8>,
    /// `(key_start..key_end, record_offset)` per index entry, in key order.
    entries: Vec<(std::ops::Range<usize>, u64)>,
}

impl Reader {
    /// Parse a table from its on-disk bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptedFooter`] if the trailer or index is malformed.
    pub fn new(data: Vec<u8>) -> Result<Reader, Error> {
        if data.len() < TRAILER_LEN {
            return Err(Error::CorruptedFooter {
                detail: format!("sorted table shorter than its trailer: {} bytes", data.len()),
            });
        }

        let trailer = &data[data.len() - TRAILER_LEN..];
        let index_offset = u64::from_le_bytes(
            trailer[..8].try_into().expect("slice is exactly 8 bytes"),
        ) as usize;
        let count = u32::from_le_bytes(
            trailer[8..].try_into().expect("slice is exactly 4 bytes"),
        );

        let index_end = data.len() - TRAILER_LEN;
        if index_offset > index_end {
            return Err(Error::CorruptedFooter {
                detail: "sorted table index offset past trailer".to_string(),
            });
        }

        let mut entries = Vec::with_capacity(count as usize);
        let mut pos = index_offset;
        for _ in 0..count {
            let mut cursor = &data[pos..index_end];
            let before = cursor.len();
            let key_len = read_uvarint(&mut cursor).map_err(|e| Error::CorruptedFooter {
                detail: format!("sorted table index entry: {e}"),
            })? as usize;
            pos += before - cursor.len();

            if pos + key_len + 8 > index_end {
                return Err(Error::CorruptedFooter {
                    detail: "sorted table index entry runs past trailer".to_string(),
                });
            }
            let key_range = pos..pos + key_len;
            pos += key_len;
            let record_offset = u64::from_le_bytes(
                data[pos..pos + 8]
                    .try_into()
                    .expect("slice is exactly 8 bytes"),
            );
            pos += 8;
            entries.push((key_range, record_offset));
        }

        Ok(Reader { data, entries })
    }

    /// Number of entries in the table.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up `key`, returning its value bytes if present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptedFooter`] if the record the index points at is
    /// malformed.
    pub fn get(&self, key: &[u8]) -> Result<Option<&[u8]>, Error> {
        let found = self
            .entries
            .binary_search_by(|(range, _)| self.data[range.clone()].cmp(key));
        let Ok(idx) = found else {
            return Ok(None);
        };

        let mut cursor = &self.data[self.entries[idx].1 as usize..];
        let key_len = record_field_len(&mut cursor)?;
        cursor = &cursor[key_len..];
        let value_len = record_field_len(&mut cursor)?;
        Ok(Some(&cursor[..value_len]))
    }
}

/// Read one length prefix from a record and bounds-check it against the cursor.
fn record_field_len(cursor: &mut &[u8]) -> Result<usize, Error> {
    let len = read_uvarint(cursor).map_err(|e| Error::CorruptedFooter {
        detail: format!("sorted table record: {e}"),
    })? as usize;
    if len > cursor.len() {
        return Err(Error::CorruptedFooter {
            detail: "sorted table record runs past table".to_string(),
        });
    }
    Ok(len)
}
