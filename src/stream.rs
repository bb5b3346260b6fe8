//! Stream file: a single append-only, self-framing event log.
//!
//! A stream file has three lifecycle states. `missing` means no file exists yet.
//! `open` means the magic header has been written but no footer: the file accepts
//! appends and serves reads. `closed` means the footer is present: the file is
//! immutable and its per-index chain heads live in a trailing sorted table instead
//! of memory.
//!
//! On disk (little-endian throughout):
//!
//! ```text
//! MAGIC_HEADER
//! [ block-framed region:
//!     event records (see codec), one block run per event
//!     terminator: i32 zero ]
//! sorted table bytes
//! i64 sorted table length
//! MAGIC_FOOTER
//! ```
//!
//! Every event starts at a physical block boundary, so the file offsets recorded in
//! tails tables and back-pointer chains are valid seek targets for the block reader.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::error::Error;
use crate::types::{Event, label};
use crate::{blocks, codec, sst};

/// Fixed byte string opening every stream file.
pub const MAGIC_HEADER: &[u8] = b"tidelog\0stream";

/// Fixed byte string closing a finalized stream file.
pub const MAGIC_FOOTER: &[u8] = b"tidelog\0closed";

/// Positioned read cursor over a shared file descriptor.
///
/// Each cursor tracks its own position and reads with `read_at`, so any number of
/// them can serve concurrent reads of the same file without disturbing the write
/// position or each other.
struct FileCursor<'a> {
    file: &'a File,
    pos: u64,
}

impl<'a> FileCursor<'a> {
    fn new(file: &'a File, pos: u64) -> FileCursor<'a> {
        FileCursor { file, pos }
    }
}

impl Read for FileCursor<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.file.read_at(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for FileCursor<'_> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        match pos {
            SeekFrom::Start(offset) => {
                self.pos = offset;
                Ok(offset)
            }
            _ => Err(std::io::Error::other(Error::BadSeek)),
        }
    }
}

/// A stream file in the open state: appendable and readable.
///
/// Keeps the per-index chain heads (`tails`), the next write position, and the event
/// count in memory. All three are rebuilt by [`open`] when an un-footered file is
/// reopened after a crash.
#[derive(Debug)]
pub struct OpenStream {
    file: File,
    tails: HashMap<String, u64>,
    offset: u64,
    length: u64,
    block_size: usize,
    closed: bool,
}

impl OpenStream {
    /// Create a fresh stream file at `path` and write its magic header.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Io`] if the file already exists.
    pub fn create(path: &Path, block_size: usize) -> Result<OpenStream, Error> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_all(MAGIC_HEADER)?;

        Ok(OpenStream {
            file,
            tails: HashMap::new(),
            offset: MAGIC_HEADER.len() as u64,
            length: 0,
            block_size,
            closed: false,
        })
    }

    /// Reopen an un-footered file, rebuilding tails, offset, and length by scanning
    /// forward from the header. A torn final event reads as end-of-file and the torn
    /// bytes are truncated away so the next append starts clean.
    fn reopen(file: File, block_size: usize) -> Result<OpenStream, Error> {
        let (tails, offset, length) = scan(&file, block_size)?;

        let actual = file.metadata()?.len();
        if actual > offset {
            tracing::warn!(
                valid_events = length,
                torn_bytes = actual - offset,
                "truncating torn stream tail"
            );
            file.set_len(offset)?;
            file.sync_all()?;
        }

        Ok(OpenStream {
            file,
            tails,
            offset,
            length,
            block_size,
            closed: false,
        })
    }

    /// Append one event carrying the given index labels.
    ///
    /// The event's back-pointer table is built from the current tails, then every
    /// supplied label's tail is pointed at this event's start offset. Labels are
    /// sorted before encoding so the same logical event always produces the same
    /// bytes.
    ///
    /// Returns the number of bytes appended.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WritingToClosedStream`] after [`OpenStream::close`].
    pub fn write(&mut self, data: &[u8], indexes: &[String]) -> Result<u64, Error> {
        if self.closed() {
            return Err(Error::WritingToClosedStream);
        }

        let mut labels: Vec<&String> = indexes.iter().collect();
        labels.sort();
        labels.dedup();

        let offsets: Vec<(String, u64)> = labels
            .iter()
            .map(|l| ((*l).clone(), self.tails.get(*l).copied().unwrap_or(0)))
            .collect();

        let mut encoded = Vec::new();
        codec::encode_event(&mut encoded, data, &offsets);
        let framed = blocks::frame(&encoded, self.block_size);

        self.file.seek(SeekFrom::Start(self.offset))?;
        self.file.write_all(&framed)?;

        // The new chain head is where this event begins, captured before advancing.
        for (label, _) in &offsets {
            self.tails.insert(label.clone(), self.offset);
        }
        self.offset += framed.len() as u64;
        self.length += 1;

        Ok(framed.len() as u64)
    }

    /// Forward iteration from `from` (0 means the first event). See [`iterate_events`].
    pub fn iterate<F: FnMut(&Event) -> bool>(&self, from: u64, scanner: F) -> Result<u64, Error> {
        iterate_events(&self.file, self.block_size, from, scanner)
    }

    /// Reverse scan over the back-pointer chain of `name:value` starting at `from`
    /// (0 means the chain head). See [`scan_chain`].
    pub fn scan_index<F: FnMut(&Event) -> bool>(
        &self,
        name: &str,
        value: &str,
        from: u64,
        scanner: F,
    ) -> Result<u64, Error> {
        let label = label(name, value);
        let start = if from == 0 {
            self.tails.get(&label).copied().unwrap_or(0)
        } else {
            from
        };
        scan_chain(&self.file, self.block_size, &label, start, scanner)
    }

    /// Offset of the most recent event carrying `name:value`, or 0 if none.
    pub fn first(&self, name: &str, value: &str) -> u64 {
        self.tails.get(&label(name, value)).copied().unwrap_or(0)
    }

    /// Current write position.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of events in the file.
    pub fn len(&self) -> u64 {
        self.length
    }

    /// Whether the file holds no events.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Whether [`OpenStream::close`] has run.
    pub fn closed(&self) -> bool {
        self.closed
    }

    /// Finalize the file into the closed state.
    ///
    /// Writes the end-of-events sentinel, a sorted table mapping every index label
    /// seen to its chain head, the table's length, and the magic footer. Closing an
    /// already-closed stream is a no-op.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }

        self.file.seek(SeekFrom::Start(self.offset))?;

        // Nil event signals the end of the event region.
        let mut sentinel = Vec::new();
        codec::write_i32(&mut sentinel, 0);
        self.file
            .write_all(&blocks::frame(&sentinel, self.block_size))?;

        let mut labels: Vec<&String> = self.tails.keys().collect();
        labels.sort();

        let mut table = sst::Writer::new();
        for label in labels {
            let mut value = Vec::new();
            codec::write_uvarint(&mut value, self.tails[label]);
            table.set(label.as_bytes(), &value)?;
        }
        let table_bytes = table.finish();

        self.file.write_all(&table_bytes)?;

        let mut trailer = Vec::new();
        codec::write_i64(&mut trailer, table_bytes.len() as i64);
        trailer.extend_from_slice(MAGIC_FOOTER);
        self.file.write_all(&trailer)?;
        self.file.sync_all()?;

        self.closed = true;
        Ok(())
    }
}

/// A stream file in the closed state: immutable, chain heads resolved through the
/// trailing sorted table. Safe for concurrent positioned reads.
#[derive(Debug)]
pub struct ClosedStream {
    file: File,
    block_size: usize,
    index: sst::Reader,
}

impl ClosedStream {
    /// Load the trailing sorted table of a file already verified to carry the footer.
    fn from_file(file: File, block_size: usize) -> Result<ClosedStream, Error> {
        let len = file.metadata()?.len();
        let trailer_len = 8 + MAGIC_FOOTER.len() as u64;

        let mut len_buf = [0u8; 8];
        file.read_exact_at(&mut len_buf, len - trailer_len)?;
        let table_len = i64::from_le_bytes(len_buf);

        let table_end = len - trailer_len;
        if table_len < 0 || table_len as u64 > table_end - MAGIC_HEADER.len() as u64 {
            return Err(Error::CorruptedFooter {
                detail: format!("sorted table length {table_len} does not fit the file"),
            });
        }

        let mut data = vec![0u8; table_len as usize];
        file.read_exact_at(&mut data, table_end - table_len as u64)?;
        let index = sst::Reader::new(data)?;

        Ok(ClosedStream {
            file,
            block_size,
            index,
        })
    }

    /// Forward iteration from `from` (0 means the first event). See [`iterate_events`].
    pub fn iterate<F: FnMut(&Event) -> bool>(&self, from: u64, scanner: F) -> Result<u64, Error> {
        iterate_events(&self.file, self.block_size, from, scanner)
    }

    /// Reverse scan over the back-pointer chain of `name:value` starting at `from`
    /// (0 means the chain head, looked up in the sorted table).
    pub fn scan_index<F: FnMut(&Event) -> bool>(
        &self,
        name: &str,
        value: &str,
        from: u64,
        scanner: F,
    ) -> Result<u64, Error> {
        let label = label(name, value);
        let start = if from == 0 { self.tail(&label)? } else { from };
        scan_chain(&self.file, self.block_size, &label, start, scanner)
    }

    /// Offset of the most recent event carrying `name:value`, or 0 if none.
    pub fn first(&self, name: &str, value: &str) -> Result<u64, Error> {
        self.tail(&label(name, value))
    }

    fn tail(&self, label: &str) -> Result<u64, Error> {
        match self.index.get(label.as_bytes())? {
            None => Ok(0),
            Some(mut value) => {
                codec::read_uvarint(&mut value).map_err(|e| Error::CorruptedFooter {
                    detail: format!("chain head for {label}: {e}"),
                })
            }
        }
    }
}

/// A stream file in either lifecycle state.
///
/// The two states share the read operations; only `open` accepts writes. The switch
/// is observable through [`Stream::closed`].
#[derive(Debug)]
pub enum Stream {
    /// Header written, no footer: appendable.
    Open(OpenStream),
    /// Footer present: immutable.
    Closed(ClosedStream),
}

impl Stream {
    /// Whether this stream has been finalized.
    pub fn closed(&self) -> bool {
        match self {
            Stream::Open(open) => open.closed(),
            Stream::Closed(_) => true,
        }
    }

    /// Append one event. Fails on a closed stream.
    pub fn write(&mut self, data: &[u8], indexes: &[String]) -> Result<u64, Error> {
        match self {
            Stream::Open(open) => open.write(data, indexes),
            Stream::Closed(_) => Err(Error::WritingToClosedStream),
        }
    }

    /// Forward iteration from `from`.
    pub fn iterate<F: FnMut(&Event) -> bool>(&self, from: u64, scanner: F) -> Result<u64, Error> {
        match self {
            Stream::Open(open) => open.iterate(from, scanner),
            Stream::Closed(closed) => closed.iterate(from, scanner),
        }
    }

    /// Reverse scan over one index chain from `from`.
    pub fn scan_index<F: FnMut(&Event) -> bool>(
        &self,
        name: &str,
        value: &str,
        from: u64,
        scanner: F,
    ) -> Result<u64, Error> {
        match self {
            Stream::Open(open) => open.scan_index(name, value, from, scanner),
            Stream::Closed(closed) => closed.scan_index(name, value, from, scanner),
        }
    }

    /// Chain head offset for `name:value`, or 0 if the label was never seen.
    pub fn first(&self, name: &str, value: &str) -> Result<u64, Error> {
        match self {
            Stream::Open(open) => Ok(open.first(name, value)),
            Stream::Closed(closed) => closed.first(name, value),
        }
    }

    /// Finalize an open stream; a no-op on an already-closed one.
    pub fn close(&mut self) -> Result<(), Error> {
        match self {
            Stream::Open(open) => open.close(),
            Stream::Closed(_) => Ok(()),
        }
    }
}

/// Open an existing stream file, detecting its lifecycle state.
///
/// The magic header is verified first. Closed state is detected by probing the file
/// tail for the magic footer; without it the file is re-scanned into an
/// [`OpenStream`].
///
/// # Errors
///
/// Returns [`Error::CorruptedHeader`] if the header is missing or wrong, and
/// propagates `NotFound` unchanged for missing files.
pub fn open(path: &Path, block_size: usize) -> Result<Stream, Error> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;

    let mut header = vec![0u8; MAGIC_HEADER.len()];
    match file.read_exact_at(&mut header, 0) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::CorruptedHeader);
        }
        Err(e) => return Err(e.into()),
    }
    if header != MAGIC_HEADER {
        return Err(Error::CorruptedHeader);
    }

    if has_footer(&file)? {
        Ok(Stream::Closed(ClosedStream::from_file(file, block_size)?))
    } else {
        Ok(Stream::Open(OpenStream::reopen(file, block_size)?))
    }
}

fn has_footer(file: &File) -> Result<bool, Error> {
    let len = file.metadata()?.len();
    let min_closed = MAGIC_HEADER.len() as u64 + 8 + MAGIC_FOOTER.len() as u64;
    if len < min_closed {
        return Ok(false);
    }

    let mut probe = vec![0u8; MAGIC_FOOTER.len()];
    file.read_exact_at(&mut probe, len - MAGIC_FOOTER.len() as u64)?;
    Ok(probe == MAGIC_FOOTER)
}

/// Forward iteration over the event region.
///
/// Starts at `from`, or just past the magic header when `from` is 0. When the
/// scanner returns `false`, iteration halts and the offset immediately past the
/// delivered event is returned, so a resumed call does not re-read it. When the
/// sentinel or end of file is reached instead, 0 is returned to signal "advance to
/// the next file".
fn iterate_events<F: FnMut(&Event) -> bool>(
    file: &File,
    block_size: usize,
    from: u64,
    mut scanner: F,
) -> Result<u64, Error> {
    let mut offset = if from == 0 {
        MAGIC_HEADER.len() as u64
    } else {
        from
    };

    let mut reader = blocks::Reader::new(FileCursor::new(file, offset), block_size);
    loop {
        match codec::decode_event(&mut reader)? {
            None => return Ok(0),
            Some((event, logical_len)) => {
                let next = offset + blocks::framed_len(block_size, logical_len);
                if !scanner(&event) {
                    return Ok(next);
                }
                offset = next;
            }
        }
    }
}

/// Reverse scan along one index's back-pointer chain.
///
/// Visits the event at `start`, then follows each event's own back-pointer for
/// `label`. Returns the next unread offset when the scanner stops, or 0 when the
/// chain is exhausted. Chains are strictly decreasing in offset; a pointer that
/// fails to decrease is corruption.
fn scan_chain<F: FnMut(&Event) -> bool>(
    file: &File,
    block_size: usize,
    label: &str,
    start: u64,
    mut scanner: F,
) -> Result<u64, Error> {
    let mut offset = start;
    while offset > 0 {
        let mut reader = blocks::Reader::new(FileCursor::new(file, offset), block_size);
        let Some((event, _)) = codec::decode_event(&mut reader)? else {
            return Err(Error::CorruptedEvent {
                detail: format!("back-pointer chain hit end of events at offset {offset}"),
            });
        };

        let next = event.back_offset(label);
        if next != 0 && next >= offset {
            return Err(Error::CorruptedEvent {
                detail: format!("back-pointer chain not decreasing: {offset} -> {next}"),
            });
        }

        if !scanner(&event) {
            return Ok(next);
        }
        offset = next;
    }
    Ok(0)
}

/// Rebuild the in-memory state of an un-footered file: tails, next write offset,
/// and event count. A decode failure at the tail means the file was torn by a
/// crash and reads as end-of-file, not corruption.
fn scan(file: &File, block_size: usize) -> Result<(HashMap<String, u64>, u64, u64), Error> {
    let mut header = vec![0u8; MAGIC_HEADER.len()];
    let mut cursor = FileCursor::new(file, 0);
    if cursor.read_exact(&mut header).is_err() || header != MAGIC_HEADER {
        return Err(Error::CorruptedHeader);
    }

    let mut offset = MAGIC_HEADER.len() as u64;
    let mut tails = HashMap::new();
    let mut length = 0u64;

    let mut reader = blocks::Reader::new(FileCursor::new(file, offset), block_size);
    loop {
        match codec::decode_event(&mut reader) {
            Ok(Some((event, logical_len))) => {
                for label in event.offsets.keys() {
                    tails.insert(label.clone(), offset);
                }
                offset += blocks::framed_len(block_size, logical_len);
                length += 1;
            }
            Ok(None) => break,
            Err(Error::CorruptedEvent { .. }) => break,
            Err(e) => return Err(e),
        }
    }

    Ok((tails, offset, length))
}
