//! Every backend honors the same record contract, and the chunked protocol
//! round-trips payloads through each of them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use proptest::prelude::*;
use rcache_store::{
    Backend, ChunkedStore, FlatFileBackend, MemoryBackend, Packet, SqliteBackend, purge_unused,
};
use rcache_error::RcacheError;
use rcache_types::RecordKind;
use tempfile::TempDir;

// ─── Fixtures ───────────────────────────────────────────────────────────────

fn backends() -> Vec<(TempDir, Arc<dyn Backend>)> {
    let flat_dir = tempfile::tempdir().expect("tempdir");
    let flat: Arc<dyn Backend> =
        Arc::new(FlatFileBackend::open(flat_dir.path()).expect("open flatfile"));
    let sql_dir = tempfile::tempdir().expect("tempdir");
    let sql: Arc<dyn Backend> =
        Arc::new(SqliteBackend::open(sql_dir.path().join("cache.db")).expect("open sqlite"));
    let mem_dir = tempfile::tempdir().expect("tempdir");
    let mem: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    vec![(flat_dir, flat), (sql_dir, sql), (mem_dir, mem)]
}

// ─── Record contract ────────────────────────────────────────────────────────

#[test]
fn test_absent_is_none_not_error() {
    for (_dir, backend) in backends() {
        let got = backend.get(RecordKind::Descriptor, "nope").expect("get");
        assert!(got.is_none(), "{}", backend.describe());
        assert!(!backend.delete(RecordKind::Descriptor, "nope").expect("delete"));
    }
}

#[test]
fn test_put_overwrites_and_list_is_sorted() {
    for (_dir, backend) in backends() {
        let name = backend.describe();
        backend.put(RecordKind::Stack, "m.b", b"1").expect("put");
        backend.put(RecordKind::Stack, "m.a", b"1").expect("put");
        backend.put(RecordKind::Stack, "m.b", b"2").expect("put");
        assert_eq!(
            backend.get(RecordKind::Stack, "m.b").expect("get").as_deref(),
            Some(&b"2"[..]),
            "{name}"
        );
        assert_eq!(
            backend.list_keys(RecordKind::Stack).expect("list"),
            vec!["m.a", "m.b"],
            "{name}"
        );
    }
}

#[test]
fn test_purge_sweeps_every_backend() {
    for (_dir, backend) in backends() {
        let name = backend.describe();
        let chunked = ChunkedStore::new(Arc::clone(&backend), RecordKind::Descriptor, 64);
        chunked.save("keep", &[7_u8; 200]).expect("save keep");
        chunked.save("drop", &[9_u8; 200]).expect("save drop");
        backend.reset_used().expect("reset");

        chunked.fetch("keep").expect("fetch").expect("present");
        let report = purge_unused(backend.as_ref()).expect("purge");
        assert!(report.removed[&RecordKind::Descriptor] > 0, "{name}");
        assert_eq!(chunked.owners().expect("owners"), vec!["keep"], "{name}");
        assert_eq!(
            chunked.fetch("keep").expect("fetch").expect("present"),
            vec![7_u8; 200],
            "{name}"
        );
    }
}

/// Four writers rewrite one multi-packet record while a reader fetches it
/// in a loop. Every fetch must see one writer's payload whole.
fn writers_and_reader_never_see_a_torn_record(
    open: impl Fn() -> Arc<dyn Backend> + Send + Sync + 'static,
) {
    let open = Arc::new(open);
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let open = Arc::clone(&open);
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            let chunked = ChunkedStore::new(open(), RecordKind::Descriptor, 128);
            let mut whole_reads = 0_usize;
            loop {
                let finished = done.load(Ordering::SeqCst);
                match chunked.fetch("shared") {
                    Ok(Some(payload)) => {
                        let first = payload[0];
                        assert!(
                            payload.iter().all(|&b| b == first),
                            "torn record returned as success"
                        );
                        whole_reads += 1;
                    }
                    Ok(None) => {}
                    Err(RcacheError::Corrupt { .. }) => {}
                    Err(err) => panic!("unexpected fetch error: {err}"),
                }
                if finished {
                    break;
                }
            }
            whole_reads
        })
    };

    let writers: Vec<_> = (0_u8..4)
        .map(|worker| {
            let open = Arc::clone(&open);
            std::thread::spawn(move || {
                let chunked = ChunkedStore::new(open(), RecordKind::Descriptor, 128);
                for round in 0..10 {
                    chunked
                        .save("shared", &vec![worker; 300 + round])
                        .expect("save");
                }
            })
        })
        .collect();
    for handle in writers {
        handle.join().expect("writer thread");
    }
    done.store(true, Ordering::SeqCst);
    let whole_reads = reader.join().expect("reader thread");
    assert!(whole_reads > 0);

    let chunked = ChunkedStore::new(open(), RecordKind::Descriptor, 128);
    let payload = chunked.fetch("shared").expect("fetch").expect("present");
    let first = payload[0];
    assert!(payload.iter().all(|&b| b == first), "mixed writers in one record");
    assert_eq!(payload.len(), 309);
}

#[test]
fn test_concurrent_flatfile_readers_and_writers_do_not_tear_records() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().to_path_buf();
    writers_and_reader_never_see_a_torn_record(move || -> Arc<dyn Backend> {
        Arc::new(FlatFileBackend::open(&root).expect("open flatfile"))
    });
}

#[test]
fn test_concurrent_sqlite_readers_and_writers_do_not_tear_records() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("cache.db");
    SqliteBackend::open(&path).expect("create sqlite");
    writers_and_reader_never_see_a_torn_record(move || -> Arc<dyn Backend> {
        Arc::new(SqliteBackend::open(&path).expect("open sqlite"))
    });
}

// ─── Chunked round-trip ─────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_chunked_payload_reassembles_bit_identical(
        payload in proptest::collection::vec(any::<u8>(), 0..2048),
        room in 1_usize..300,
    ) {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let max = Packet::overhead("owner") + room;
        let chunked = ChunkedStore::new(backend, RecordKind::ExpectedValue, max);
        let packets = chunked.save("owner", &payload).expect("save");
        prop_assert_eq!(packets, payload.len().div_ceil(room).max(1));
        let fetched = chunked.fetch("owner").expect("fetch").expect("present");
        prop_assert_eq!(fetched, payload);
    }
}
