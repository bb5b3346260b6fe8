//! Stream manager: a directory of rotated stream files keyed by commit number.
//!
//! The consensus layer drives all state mutation through a serialized apply path:
//! [`Db::write`] and [`Db::rotate`] arrive one at a time in commit order. Reads
//! ([`Db::scan`], [`Db::iterate`], [`Db::continuation`]) may run concurrently with
//! each other and with the apply path.
//!
//! At most one file is open at a time; `current` is the commit number naming it.
//! Every earlier file is closed and immutable, cached on first use, and -- when a
//! file is missing locally -- fetched from a peer through the injected
//! [`Consensus`] collaborator.
//!
//! Continuation cursors have the external form `"<commit>:<offset>"`. Forward
//! iterates advance offset within a file and then step to the numerically next
//! commit; reverse indexed scans follow the back-pointer chain downward and then
//! step to the numerically previous commit. The empty cursor means "none".

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use metrics::{counter, gauge, histogram};

use crate::config::DbConfig;
use crate::error::Error;
use crate::stream::{self, ClosedStream, MAGIC_HEADER, OpenStream, Stream};
use crate::types::{Event, label};
use crate::{blocks, codec};

/// Seam to the external consensus engine.
///
/// The store never links against the consensus implementation; it only needs to
/// kick off log snapshots during rotation and to ask a peer for a closed stream
/// file it does not have locally.
pub trait Consensus: Send + Sync {
    /// Ask the consensus engine to snapshot its log from `index` at `term`.
    fn take_snapshot_from(&self, index: u64, term: u64) -> Result<(), Error>;

    /// Fetch the closed stream file `filename` from a peer into `dir` and return
    /// an opened handle to it.
    fn recover_stream(&self, dir: &Path, filename: &str) -> Result<ClosedStream, Error>;
}

/// Stand-in consensus collaborator for standalone and test use: snapshots succeed
/// trivially and no peers exist to recover from.
pub struct NoopConsensus;

impl Consensus for NoopConsensus {
    fn take_snapshot_from(&self, _index: u64, _term: u64) -> Result<(), Error> {
        Ok(())
    }

    fn recover_stream(&self, _dir: &Path, filename: &str) -> Result<ClosedStream, Error> {
        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no peer can supply {filename}"),
        )))
    }
}

/// Mutable manager state, guarded by one reader-writer lock so a rotation flips
/// the file set atomically with respect to readers.
struct DbState {
    /// Commit number naming the currently open file.
    current: u64,
    /// Commits whose files are closed and available, in insertion order.
    closed: Vec<u64>,
    /// Largest event timestamp observed.
    most_recent: i64,
    /// Write position accounted while no live stream exists (standby replay).
    mock_offset: u64,
    /// The open stream, absent on a standby that adopted an already-closed file.
    live: Option<OpenStream>,
}

/// The event store: owns a directory of stream files and serves the consensus
/// apply path plus concurrent reads.
pub struct Db {
    dir: PathBuf,
    config: DbConfig,
    state: RwLock<DbState>,
    /// Cache of opened closed streams. Scoped to this instance, not the process.
    streams: RwLock<HashMap<u64, Arc<ClosedStream>>>,
    consensus: Arc<dyn Consensus>,
}

impl Db {
    /// Open a store rooted at `dir`, rotating to the initial stream file.
    ///
    /// If a closed file already exists at the initial commit (a restarted node),
    /// it is adopted and the store starts in standby until the consensus layer
    /// replays state through [`Db::recovery`].
    pub fn new(
        dir: impl Into<PathBuf>,
        config: DbConfig,
        consensus: Arc<dyn Consensus>,
    ) -> Result<Db, Error> {
        let db = Db {
            dir: dir.into(),
            config,
            state: RwLock::new(DbState {
                current: 0,
                closed: Vec::new(),
                most_recent: 0,
                mock_offset: MAGIC_HEADER.len() as u64,
                live: None,
            }),
            streams: RwLock::new(HashMap::new()),
            consensus,
        };

        db.rotate(0, 0)?;
        Ok(db)
    }

    /// Current write position of the live stream, or the standby mock offset.
    ///
    /// The front-end compares this against the configured rotation threshold to
    /// decide when to submit a rotate command.
    pub fn offset(&self) -> u64 {
        let state = self.state.read().expect("db state lock poisoned");
        match &state.live {
            Some(live) => live.offset(),
            None => state.mock_offset,
        }
    }

    /// Commit number naming the currently open file.
    pub fn current(&self) -> u64 {
        self.state.read().expect("db state lock poisoned").current
    }

    /// Largest event timestamp observed so far.
    pub fn most_recent(&self) -> i64 {
        self.state
            .read()
            .expect("db state lock poisoned")
            .most_recent
    }

    /// Commits whose files are closed, in insertion order.
    pub fn closed_commits(&self) -> Vec<u64> {
        self.state
            .read()
            .expect("db state lock poisoned")
            .closed
            .clone()
    }

    /// Apply one write from the consensus log.
    ///
    /// A commit at or below `current` is a replayed entry already covered by an
    /// existing file: it succeeds with no side effects. On a standby with no live
    /// stream, only the bytes that would have been written are accounted.
    pub fn write(
        &self,
        commit: u64,
        body: &[u8],
        indexes: &HashMap<String, String>,
        timestamp: i64,
    ) -> Result<(), Error> {
        let started = Instant::now();
        let mut guard = self.state.write().expect("db state lock poisoned");
        let state = &mut *guard;

        if commit <= state.current {
            // Replayed commit, already covered by a rotated file.
            return Ok(());
        }

        let labels: Vec<String> = indexes.iter().map(|(n, v)| label(n, v)).collect();

        match &mut state.live {
            None => {
                let offsets: Vec<(String, u64)> = labels.into_iter().map(|l| (l, 0)).collect();
                let encoded = codec::encoded_event_len(body, &offsets);
                state.mock_offset += blocks::framed_len(self.config.block_size, encoded);
                return Ok(());
            }
            Some(live) => {
                live.write(body, &labels)?;
                gauge!("tidelog_live_stream_bytes").set(live.offset() as f64);
            }
        }

        if timestamp > state.most_recent {
            state.most_recent = timestamp;
        }

        counter!("tidelog_writes_total").increment(1);
        histogram!("tidelog_write_duration_seconds").record(started.elapsed().as_secs_f64());
        Ok(())
    }

    /// Apply one rotation from the consensus log: close the current file and open
    /// a fresh one named by `commit`.
    ///
    /// Replay paths keep this idempotent. A rotation that already ran in this
    /// process is a no-op; a rotation whose file already exists closed on disk
    /// (replay after restart) adopts that file and leaves the store in standby.
    pub fn rotate(&self, commit: u64, term: u64) -> Result<(), Error> {
        {
            let state = self.state.read().expect("db state lock poisoned");
            if state.current == commit && state.live.is_some() {
                return Ok(());
            }
        }

        let existing = self.retrieve_stream(commit, false)?;

        let mut state = self.state.write().expect("db state lock poisoned");

        if existing.is_some() {
            add_closed(&mut state, commit);
            state.live = None;
            state.mock_offset = MAGIC_HEADER.len() as u64;
            state.current = commit;
            return Ok(());
        }

        if let Some(mut live) = state.live.take() {
            let started = Instant::now();
            live.close()?;
            let finished = state.current;
            add_closed(&mut state, finished);
            tracing::info!(commit = finished, elapsed = ?started.elapsed(), "closed stream");
            histogram!("tidelog_close_duration_seconds").record(started.elapsed().as_secs_f64());

            self.snapshot(commit, term);
        }

        self.set_current(&mut state, commit)?;
        counter!("tidelog_rotations_total").increment(1);
        Ok(())
    }

    /// Starting cursor for a reverse scan of `name:value`.
    ///
    /// Points at the live stream's chain head when it has one, otherwise at the
    /// tail of the most recent closed file.
    pub fn continuation(&self, name: &str, value: &str) -> String {
        let state = self.state.read().expect("db state lock poisoned");

        if let Some(live) = &state.live {
            let offset = live.first(name, value);
            if offset > 0 {
                return build_continuation(Some(state.current), offset);
            }
        }

        build_continuation(state.closed.iter().copied().max(), 0)
    }

    /// Reverse indexed scan across files, newest first.
    ///
    /// Walks commits downward from the cursor (or from `current` for an empty
    /// cursor), following each file's back-pointer chain for `name:value`. Returns
    /// a cursor at the resume position when the scanner stops, or the empty cursor
    /// when every chain is exhausted.
    pub fn scan<F: FnMut(&Event) -> bool>(
        &self,
        name: &str,
        value: &str,
        continuation: &str,
        mut scanner: F,
    ) -> Result<String, Error> {
        let (mut commit, mut offset) = self.parse_continuation(continuation, true);
        let mut stopped = false;

        while let Some(c) = commit {
            let mut wrap = |event: &Event| {
                let keep = scanner(event);
                if !keep {
                    stopped = true;
                }
                keep
            };
            offset = self.scan_file(c, name, value, offset, &mut wrap)?;

            if stopped {
                break;
            }
            commit = self.prev(c);
            offset = 0;
        }

        if stopped && offset == 0 {
            // The chain ended exactly at this file's oldest event; point the cursor
            // at the previous file so a resume does not re-read it.
            commit = commit.and_then(|c| self.prev(c));
        }

        Ok(build_continuation(commit, offset))
    }

    /// Forward unindexed iteration across files, oldest first.
    ///
    /// Walks commits upward from the cursor (or from the oldest closed file for an
    /// empty cursor). Returns a cursor at the resume position when the scanner
    /// stops; when the live stream is exhausted the cursor points at its tail so a
    /// later call resumes there.
    pub fn iterate<F: FnMut(&Event) -> bool>(
        &self,
        continuation: &str,
        mut scanner: F,
    ) -> Result<String, Error> {
        let (mut commit, mut offset) = self.parse_continuation(continuation, false);
        let mut stopped = false;

        while let Some(c) = commit {
            let mut wrap = |event: &Event| {
                let keep = scanner(event);
                if !keep {
                    stopped = true;
                }
                keep
            };
            offset = self.iterate_file(c, offset, &mut wrap)?;

            if stopped {
                break;
            }
            match self.next(c) {
                Some(n) => {
                    commit = Some(n);
                    offset = 0;
                }
                None => {
                    // Tail of the live stream; resume from here later.
                    offset = self.offset();
                    break;
                }
            }
        }

        Ok(build_continuation(commit, offset))
    }

    /// Shrink the closed set after an external compaction produced a merged file.
    ///
    /// Atomically moves the precomputed `.tmpstream` artifact into place as the
    /// file for `start` and forgets cached handles for commits in `(start, stop]`.
    /// Callers must ensure no active scans reference that range.
    pub fn compress(&self, start: u64, stop: u64) -> Result<(), Error> {
        let mut cache = self.streams.write().expect("stream cache lock poisoned");
        let mut state = self.state.write().expect("db state lock poisoned");

        state.closed.retain(|&commit| {
            if commit <= start || commit > stop {
                true
            } else {
                cache.remove(&commit);
                false
            }
        });
        cache.remove(&start);

        let compressed = self.compressed_path(start);
        if compressed.exists() {
            std::fs::rename(&compressed, self.path(start))?;
        }

        Ok(())
    }

    /// Serialize manager state for a consensus snapshot.
    ///
    /// Layout: `i64 current | i64 most_recent | uvarint n | n x i64 closed-commit`.
    /// The bytes are opaque to the consensus layer.
    pub fn save(&self) -> Vec<u8> {
        let state = self.state.read().expect("db state lock poisoned");

        let mut buf = Vec::new();
        codec::write_i64(&mut buf, state.current as i64);
        codec::write_i64(&mut buf, state.most_recent);
        codec::write_uvarint(&mut buf, state.closed.len() as u64);
        for &commit in &state.closed {
            codec::write_i64(&mut buf, commit as i64);
        }
        buf
    }

    /// Restore manager state from a consensus snapshot blob.
    ///
    /// Re-creates the live stream at the restored `current`; the consensus layer
    /// replays any writes it covered afterwards.
    pub fn recovery(&self, data: &[u8]) -> Result<(), Error> {
        let mut cursor = data;
        let snapshot_err = |e: std::io::Error| Error::CorruptedSnapshot {
            detail: e.to_string(),
        };

        let current = codec::read_i64(&mut cursor).map_err(snapshot_err)? as u64;
        let most_recent = codec::read_i64(&mut cursor).map_err(snapshot_err)?;
        let count = codec::read_uvarint(&mut cursor).map_err(snapshot_err)?;

        let mut state = self.state.write().expect("db state lock poisoned");
        self.set_current(&mut state, current)?;
        state.most_recent = most_recent;

        for _ in 0..count {
            let commit = codec::read_i64(&mut cursor).map_err(snapshot_err)? as u64;
            add_closed(&mut state, commit);
        }

        tracing::info!(
            current,
            most_recent,
            closed = state.closed.len(),
            "recovered from snapshot"
        );
        Ok(())
    }

    /// Run one file's worth of a reverse scan: the live stream when `commit` is
    /// current, otherwise the cached (or fetched) closed stream.
    fn scan_file(
        &self,
        commit: u64,
        name: &str,
        value: &str,
        offset: u64,
        scanner: &mut dyn FnMut(&Event) -> bool,
    ) -> Result<u64, Error> {
        let live_result = {
            let state = self.state.read().expect("db state lock poisoned");
            if state.current == commit {
                Some(match &state.live {
                    Some(live) => live.scan_index(name, value, offset, &mut *scanner)?,
                    None => 0,
                })
            } else {
                None
            }
        };
        if let Some(next) = live_result {
            return Ok(next);
        }

        match self.retrieve_stream(commit, true)? {
            Some(stream) => stream.scan_index(name, value, offset, scanner),
            None => Ok(0),
        }
    }

    /// Run one file's worth of a forward iterate. See [`Db::scan_file`].
    fn iterate_file(
        &self,
        commit: u64,
        offset: u64,
        scanner: &mut dyn FnMut(&Event) -> bool,
    ) -> Result<u64, Error> {
        let live_result = {
            let state = self.state.read().expect("db state lock poisoned");
            if state.current == commit {
                Some(match &state.live {
                    Some(live) => live.iterate(offset, &mut *scanner)?,
                    None => 0,
                })
            } else {
                None
            }
        };
        if let Some(next) = live_result {
            return Ok(next);
        }

        match self.retrieve_stream(commit, true)? {
            Some(stream) => stream.iterate(offset, scanner),
            None => Ok(0),
        }
    }

    /// Resolve a closed stream by commit: cache hit, local open, or peer fetch.
    ///
    /// Concurrent retrievals of the same commit serialize on the cache write lock;
    /// once cached, lookups take only the read lock.
    fn retrieve_stream(
        &self,
        commit: u64,
        fetch_missing: bool,
    ) -> Result<Option<Arc<ClosedStream>>, Error> {
        {
            let cache = self.streams.read().expect("stream cache lock poisoned");
            if let Some(stream) = cache.get(&commit) {
                return Ok(Some(Arc::clone(stream)));
            }
        }

        let mut cache = self.streams.write().expect("stream cache lock poisoned");
        if let Some(stream) = cache.get(&commit) {
            return Ok(Some(Arc::clone(stream)));
        }

        match stream::open(&self.path(commit), self.config.block_size) {
            Ok(Stream::Closed(closed)) => {
                let closed = Arc::new(closed);
                cache.insert(commit, Arc::clone(&closed));
                Ok(Some(closed))
            }
            Ok(Stream::Open(_)) => {
                tracing::warn!(commit, "found open stream where closed was expected");
                if !fetch_missing {
                    return Ok(None);
                }
                self.recover_into_cache(&mut cache, commit, true)
            }
            Err(Error::Io(io)) if io.kind() == std::io::ErrorKind::NotFound => {
                if !fetch_missing {
                    return Ok(None);
                }
                self.recover_into_cache(&mut cache, commit, false)
            }
            Err(e) => Err(e),
        }
    }

    fn recover_into_cache(
        &self,
        cache: &mut HashMap<u64, Arc<ClosedStream>>,
        commit: u64,
        still_open: bool,
    ) -> Result<Option<Arc<ClosedStream>>, Error> {
        let filename = filename(commit);
        tracing::info!(commit, filename = %filename, "recovering stream from peer");

        match self.consensus.recover_stream(&self.dir, &filename) {
            Ok(recovered) => {
                let recovered = Arc::new(recovered);
                cache.insert(commit, Arc::clone(&recovered));
                Ok(Some(recovered))
            }
            Err(e) if still_open => {
                tracing::error!(commit, error = %e, "peer recovery failed");
                Err(Error::RetrievedOpenStream { commit })
            }
            Err(e) => Err(e),
        }
    }

    /// Largest closed commit strictly below `commit`.
    fn prev(&self, commit: u64) -> Option<u64> {
        let state = self.state.read().expect("db state lock poisoned");
        state.closed.iter().copied().filter(|&c| c < commit).max()
    }

    /// Smallest closed commit strictly above `commit`, or `current` when that is
    /// the next file up.
    fn next(&self, commit: u64) -> Option<u64> {
        let state = self.state.read().expect("db state lock poisoned");
        let mut result = state.closed.iter().copied().filter(|&c| c > commit).min();
        if state.current > commit && result.is_none_or(|r| state.current < r) {
            result = Some(state.current);
        }
        result
    }

    /// Resolve a continuation cursor into a starting `(commit, offset)`.
    ///
    /// An empty cursor starts a reverse scan at `current`, and a forward iterate
    /// at the oldest closed file (falling back to `current` when nothing has been
    /// closed yet). Malformed cursors fall back to the same defaults.
    fn parse_continuation(&self, continuation: &str, reverse: bool) -> (Option<u64>, u64) {
        let state = self.state.read().expect("db state lock poisoned");

        let mut commit = Some(state.current);
        if !reverse && let Some(&oldest) = state.closed.iter().min() {
            commit = Some(oldest);
        }

        let mut offset = 0;
        if !continuation.is_empty()
            && let Some((commit_part, offset_part)) = continuation.split_once(':')
            && let (Ok(c), Ok(o)) = (commit_part.parse::<u64>(), offset_part.parse::<u64>())
        {
            commit = Some(c);
            offset = o;
        }

        (commit, offset)
    }

    /// Point the store at a fresh stream file named by `commit`, removing any
    /// stale file in the way first.
    fn set_current(&self, state: &mut DbState, commit: u64) -> Result<(), Error> {
        state.current = commit;
        state.mock_offset = MAGIC_HEADER.len() as u64;

        let path = self.path(commit);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        state.live = Some(OpenStream::create(&path, self.config.block_size)?);
        tracing::info!(commit, "creating stream");
        Ok(())
    }

    /// Kick off a detached consensus snapshot so the apply path is not blocked
    /// past the close that preceded it.
    fn snapshot(&self, index: u64, term: u64) {
        let consensus = Arc::clone(&self.consensus);
        let from = index.saturating_sub(self.config.snapshot_buffer);

        tracing::info!(index = from, term, "starting consensus snapshot");
        std::thread::spawn(move || {
            let started = Instant::now();
            match consensus.take_snapshot_from(from, term) {
                Ok(()) => {
                    tracing::info!(elapsed = ?started.elapsed(), "consensus snapshot complete");
                }
                Err(e) => tracing::error!(error = %e, "consensus snapshot failed"),
            }
        });
    }

    fn path(&self, commit: u64) -> PathBuf {
        self.dir.join(filename(commit))
    }

    fn compressed_path(&self, commit: u64) -> PathBuf {
        self.dir.join(format!("events.{commit:024}.tmpstream"))
    }
}

/// Stream file name for a commit; zero-padded so lexicographic order equals
/// numeric order.
fn filename(commit: u64) -> String {
    format!("events.{commit:024}.stream")
}

fn add_closed(state: &mut DbState, commit: u64) {
    if !state.closed.contains(&commit) {
        state.closed.push(commit);
    }
}

fn build_continuation(commit: Option<u64>, offset: u64) -> String {
    match commit {
        Some(commit) => format!("{commit}:{offset}"),
        None => String::new(),
    }
}
