//! tidelog-db: the storage core of a replicated, append-only event store.
//!
//! Timestamped binary events carrying secondary-index labels are persisted into
//! rotated on-disk stream files. Each file keeps one back-pointer chain per index
//! label, so a reverse scan of just the events matching a label costs O(k) in the
//! number of matches, and finalizes with a sorted table of chain heads when it is
//! closed. The [`Db`] stream manager owns the directory of files, applies writes
//! and rotations in the order an external consensus layer commits them, and serves
//! forward iterates and reverse indexed scans that span files through opaque
//! continuation cursors.

pub mod blocks;
pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod sst;
pub mod stream;
pub mod types;

pub use config::DbConfig;
pub use db::{Consensus, Db, NoopConsensus};
pub use error::Error;
pub use stream::{ClosedStream, MAGIC_FOOTER, MAGIC_HEADER, OpenStream, Stream};
pub use types::{Event, label};
