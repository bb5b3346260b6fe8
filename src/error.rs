//! Error types for tidelog-db.
//!
//! This module defines the unified error enum used throughout the crate. All fallible
//! operations return `Result<T, Error>`. Filesystem errors propagate unchanged through
//! the `Io` variant; the apply path treats unexpected I/O errors as fatal and lets the
//! embedding node decide how to die.

/// Unified error type for all tidelog-db operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The stream file's magic header is missing or wrong. Fatal for that file;
    /// recovery may fetch a replacement from a peer.
    #[error("incorrect stream file header")]
    CorruptedHeader,

    /// An event failed to decode mid-stream. During the reopen scan this is treated
    /// as end-of-file (the tail was torn by a crash); during a normal read it surfaces.
    #[error("corrupted event: {detail}")]
    CorruptedEvent {
        /// Human-readable description of what failed to decode.
        detail: String,
    },

    /// The closed-file trailer (sorted index, length, or magic footer) is malformed.
    #[error("corrupted stream footer: {detail}")]
    CorruptedFooter {
        /// Human-readable description of the malformed trailer.
        detail: String,
    },

    /// A snapshot blob handed back by the consensus layer failed to parse.
    #[error("corrupted snapshot: {detail}")]
    CorruptedSnapshot {
        /// Human-readable description of the malformed blob.
        detail: String,
    },

    /// Attempt to append to a stream that has already been closed.
    #[error("writing to closed stream")]
    WritingToClosedStream,

    /// A cache miss resolved to a stream that is still open where a closed one was
    /// expected.
    #[error("retrieved a stream that's still open: commit {commit}")]
    RetrievedOpenStream {
        /// Commit number of the stream that was expected to be closed.
        commit: u64,
    },

    /// The block reader can only seek relative to the beginning of the file.
    #[error("block reader can only seek relative to beginning of file")]
    BadSeek,

    /// Sorted-table keys must be set in strictly ascending order.
    #[error("sorted table keys must be set in ascending order")]
    OutOfOrderKey,

    /// An I/O error occurred during a file operation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
