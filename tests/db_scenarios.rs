//! End-to-end scenarios for the stream manager: multi-file writes, rotation,
//! continuation cursors, snapshot save/recovery, and peer fetch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tidelog_db::stream::{self, Stream};
use tidelog_db::{Consensus, Db, DbConfig, Error, Event, NoopConsensus};

const BLOCK_SIZE: usize = 64;

fn config() -> DbConfig {
    DbConfig {
        block_size: BLOCK_SIZE,
        ..DbConfig::default()
    }
}

fn open_db(dir: &Path) -> Db {
    Db::new(dir, config(), Arc::new(NoopConsensus)).expect("db should open")
}

fn indexes(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .collect()
}

fn payload(event: &Event) -> String {
    String::from_utf8_lossy(&event.data).into_owned()
}

/// Run a forward iterate to completion and collect payloads.
fn iterate_all(db: &Db) -> Vec<String> {
    let mut seen = Vec::new();
    db.iterate("", |e| {
        seen.push(payload(e));
        true
    })
    .expect("iterate should succeed");
    seen
}

/// Run a forward iterate that stops after `limit` events.
fn iterate_chunk(db: &Db, continuation: &str, limit: usize) -> (Vec<String>, String) {
    let mut seen = Vec::new();
    let cursor = db
        .iterate(continuation, |e| {
            seen.push(payload(e));
            seen.len() < limit
        })
        .expect("iterate should succeed");
    (seen, cursor)
}

/// Run a reverse indexed scan to completion and collect payloads.
fn scan_all(db: &Db, name: &str, value: &str) -> Vec<String> {
    let mut seen = Vec::new();
    db.scan(name, value, "", |e| {
        seen.push(payload(e));
        true
    })
    .expect("scan should succeed");
    seen
}

/// Run a reverse indexed scan that stops after `limit` events.
fn scan_chunk(
    db: &Db,
    name: &str,
    value: &str,
    continuation: &str,
    limit: usize,
) -> (Vec<String>, String) {
    let mut seen = Vec::new();
    let cursor = db
        .scan(name, value, continuation, |e| {
            seen.push(payload(e));
            seen.len() < limit
        })
        .expect("scan should succeed");
    (seen, cursor)
}

/// Seed the S1 state: three events across two index labels in the initial file.
fn seed_s1(db: &Db) {
    db.write(1, b"a", &indexes(&[("u", "1")]), 100)
        .expect("write a");
    db.write(2, b"b", &indexes(&[("u", "1"), ("t", "x")]), 200)
        .expect("write b");
    db.write(3, b"c", &indexes(&[("t", "x")]), 150)
        .expect("write c");
}

/// Seed the S2 state: S1 plus a rotation and one event in the new file.
fn seed_s2(db: &Db) {
    seed_s1(db);
    db.rotate(10, 1).expect("rotate");
    db.write(11, b"d", &indexes(&[("u", "1")]), 300)
        .expect("write d");
}

#[test]
fn s1_fresh_db_serves_iterate_and_indexed_scans() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = open_db(dir.path());
    seed_s1(&db);

    assert_eq!(iterate_all(&db), ["a", "b", "c"]);
    assert_eq!(scan_all(&db, "u", "1"), ["b", "a"]);
    assert_eq!(scan_all(&db, "t", "x"), ["c", "b"]);
    assert_eq!(db.most_recent(), 200);
}

#[test]
fn s2_rotation_spans_reads_across_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = open_db(dir.path());
    seed_s2(&db);

    assert_eq!(db.current(), 10);
    assert_eq!(db.closed_commits(), [0]);
    assert_eq!(iterate_all(&db), ["a", "b", "c", "d"]);
    assert_eq!(scan_all(&db, "u", "1"), ["d", "b", "a"]);
    assert_eq!(scan_all(&db, "t", "x"), ["c", "b"]);
    assert_eq!(db.most_recent(), 300);
}

#[test]
fn s4_iterate_continuation_resumes_without_gaps() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = open_db(dir.path());
    seed_s1(&db);

    let (first, cursor) = iterate_chunk(&db, "", 2);
    assert_eq!(first, ["a", "b"]);
    assert!(!cursor.is_empty());

    let (rest, tail_cursor) = iterate_chunk(&db, &cursor, 10);
    assert_eq!(rest, ["c"]);

    // The tail cursor parks at the live stream's write position.
    assert_eq!(tail_cursor, format!("{}:{}", db.current(), db.offset()));

    // A later event is picked up from exactly there.
    db.write(4, b"e", &HashMap::new(), 400).expect("write e");
    let (more, _) = iterate_chunk(&db, &tail_cursor, 10);
    assert_eq!(more, ["e"]);
}

#[test]
fn s5_save_then_recovery_restores_manager_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let blob = {
        let db = open_db(dir.path());
        seed_s2(&db);
        db.save()
    };

    // A freshly opened db over the same directory adopts the closed initial file
    // and waits in standby; recovery restores the snapshot state.
    let db = open_db(dir.path());
    db.recovery(&blob).expect("recovery should succeed");

    assert_eq!(db.current(), 10);
    assert_eq!(db.closed_commits(), [0]);
    assert_eq!(db.most_recent(), 300);

    // Recovery re-created the live file empty; the consensus layer replays the
    // writes it covered.
    db.write(11, b"d", &indexes(&[("u", "1")]), 300)
        .expect("replayed write");
    assert_eq!(iterate_all(&db), ["a", "b", "c", "d"]);
    assert_eq!(scan_all(&db, "u", "1"), ["d", "b", "a"]);
}

#[test]
fn s6_duplicate_replay_write_is_dropped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = open_db(dir.path());
    seed_s2(&db);

    db.write(1, b"dup", &indexes(&[("u", "1")]), 999)
        .expect("replayed write should succeed");

    assert_eq!(iterate_all(&db), ["a", "b", "c", "d"]);
    assert_eq!(db.most_recent(), 300);
}

#[test]
fn recovery_rejects_malformed_blob() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = open_db(dir.path());

    let err = db.recovery(&[1, 2, 3]).unwrap_err();
    assert!(matches!(err, Error::CorruptedSnapshot { .. }));
}

#[test]
fn forward_iteration_crosses_three_files_in_commit_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = open_db(dir.path());

    db.write(1, b"a1", &indexes(&[("u", "1")]), 1).expect("write");
    db.write(2, b"a2", &indexes(&[("u", "1")]), 2).expect("write");
    db.rotate(10, 1).expect("rotate");
    db.write(11, b"b1", &indexes(&[("u", "1")]), 3).expect("write");
    db.rotate(20, 1).expect("rotate");
    db.write(21, b"c1", &indexes(&[("u", "1")]), 4).expect("write");

    assert_eq!(db.closed_commits(), [0, 10]);
    assert_eq!(iterate_all(&db), ["a1", "a2", "b1", "c1"]);
    assert_eq!(scan_all(&db, "u", "1"), ["c1", "b1", "a2", "a1"]);
}

#[test]
fn iterate_resumption_in_single_steps_equals_one_pass() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = open_db(dir.path());
    db.write(1, b"a1", &HashMap::new(), 1).expect("write");
    db.write(2, b"a2", &HashMap::new(), 2).expect("write");
    db.rotate(10, 1).expect("rotate");
    db.write(11, b"b1", &HashMap::new(), 3).expect("write");
    db.write(12, b"b2", &HashMap::new(), 4).expect("write");

    let mut collected = Vec::new();
    let mut cursor = String::new();
    loop {
        let (chunk, next) = iterate_chunk(&db, &cursor, 1);
        if chunk.is_empty() {
            break;
        }
        collected.extend(chunk);
        cursor = next;
    }

    assert_eq!(collected, iterate_all(&db));
}

#[test]
fn scan_resumption_in_single_steps_equals_one_pass() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = open_db(dir.path());
    seed_s2(&db);
    db.write(12, b"e", &indexes(&[("u", "1")]), 301)
        .expect("write e");

    let mut collected = Vec::new();
    let mut cursor = String::new();
    loop {
        let (chunk, next) = scan_chunk(&db, "u", "1", &cursor, 1);
        if chunk.is_empty() {
            break;
        }
        collected.extend(chunk);
        if next.is_empty() {
            break;
        }
        cursor = next;
    }

    assert_eq!(collected, scan_all(&db, "u", "1"));
    assert_eq!(collected, ["e", "d", "b", "a"]);
}

#[test]
fn rotate_is_idempotent_within_a_process() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = open_db(dir.path());
    seed_s1(&db);

    db.rotate(10, 1).expect("first rotate");
    let closed = db.closed_commits();
    let offset = db.offset();

    db.rotate(10, 1).expect("second rotate");
    assert_eq!(db.closed_commits(), closed);
    assert_eq!(db.current(), 10);
    assert_eq!(db.offset(), offset);
    assert_eq!(iterate_all(&db), ["a", "b", "c"]);
}

#[test]
fn continuation_points_at_live_tail_or_latest_closed_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = open_db(dir.path());
    seed_s2(&db);

    // "u:1" has a tail in the live file.
    let cursor = db.continuation("u", "1");
    let (commit_part, offset_part) = cursor.split_once(':').expect("cursor has two parts");
    assert_eq!(commit_part, "10");
    assert!(offset_part.parse::<u64>().expect("offset parses") > 0);

    // "t:x" lives only in the closed file, so the cursor starts at its tail.
    assert_eq!(db.continuation("t", "x"), "0:0");

    // Unknown labels fall back the same way.
    assert_eq!(db.continuation("nope", "never"), "0:0");
}

#[test]
fn compress_renames_artifact_and_shrinks_closed_set() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = open_db(dir.path());

    db.write(1, b"a", &indexes(&[("u", "1")]), 1).expect("write");
    db.rotate(10, 1).expect("rotate");
    db.write(11, b"b", &indexes(&[("u", "1")]), 2).expect("write");
    db.rotate(20, 1).expect("rotate");
    assert_eq!(db.closed_commits(), [0, 10]);

    // Stand in for the external compactor: the merged artifact for commit 0.
    let merged = dir.path().join("events.000000000000000000000000.tmpstream");
    std::fs::copy(
        dir.path().join("events.000000000000000000000000.stream"),
        &merged,
    )
    .expect("prepare compressed artifact");

    db.compress(0, 10).expect("compress should succeed");

    assert_eq!(db.closed_commits(), [0]);
    assert!(!merged.exists(), "artifact was renamed into place");

    // The renamed file serves reads again after its cache handle was dropped.
    let mut seen = Vec::new();
    db.scan("u", "1", "0:0", |e| {
        seen.push(payload(e));
        true
    })
    .expect("scan should succeed");
    assert_eq!(seen, ["a"]);
}

/// Consensus stub whose peer "network" is another directory on disk.
struct CopyingConsensus {
    source: PathBuf,
}

impl Consensus for CopyingConsensus {
    fn take_snapshot_from(&self, _index: u64, _term: u64) -> Result<(), Error> {
        Ok(())
    }

    fn recover_stream(&self, dir: &Path, filename: &str) -> Result<tidelog_db::ClosedStream, Error> {
        std::fs::copy(self.source.join(filename), dir.join(filename))?;
        match stream::open(&dir.join(filename), BLOCK_SIZE)? {
            Stream::Closed(closed) => Ok(closed),
            Stream::Open(_) => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{filename} fetched from peer is not closed"),
            ))),
        }
    }
}

#[test]
fn missing_closed_file_is_fetched_from_a_peer() {
    let peer_dir = tempfile::tempdir().expect("tempdir");
    {
        let peer = open_db(peer_dir.path());
        peer.write(1, b"remote", &indexes(&[("u", "1")]), 1)
            .expect("write");
        peer.rotate(5, 1).expect("rotate");
        peer.write(6, b"newer", &indexes(&[("u", "1")]), 2)
            .expect("write");
        peer.rotate(9, 1).expect("rotate");
    }

    let local_dir = tempfile::tempdir().expect("tempdir");
    let db = Db::new(
        local_dir.path(),
        config(),
        Arc::new(CopyingConsensus {
            source: peer_dir.path().to_path_buf(),
        }),
    )
    .expect("db should open");

    // Commit 5 exists only on the peer; scanning through it triggers the fetch.
    let mut seen = Vec::new();
    db.scan("u", "1", "5:0", |e| {
        seen.push(payload(e));
        true
    })
    .expect("scan should fetch the missing file");

    assert_eq!(seen, ["newer"]);
    assert!(
        local_dir
            .path()
            .join("events.000000000000000000000005.stream")
            .exists(),
        "fetched file landed in the local directory"
    );
}
