//! Concurrent access tests.

mod common;

use common::admin_store;
use flatshard::{RecordId, ShardId, Value, WalOperation, WriteAheadLog};
use std::collections::BTreeSet;
use std::fs;
use std::thread;
use tempfile::TempDir;

#[test]
fn test_concurrent_inserts_issue_unique_contiguous_ids() {
    let dir = TempDir::new().unwrap();
    let store = admin_store(&dir, 100);
    let threads = 8;
    let per_thread = 125;

    let ids: Vec<RecordId> = thread::scope(|s| {
        let workers: Vec<_> = (0..threads)
            .map(|t| {
                let store = &store;
                s.spawn(move || {
                    let handles: Vec<_> = (0..per_thread)
                        .map(|n| store.insert((t * per_thread + n) as i64).unwrap())
                        .collect();
                    handles
                        .into_iter()
                        .map(|h| h.wait().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect()
    });

    let total = (threads * per_thread) as u64;
    let unique: BTreeSet<u64> = ids.iter().map(|id| id.0).collect();
    assert_eq!(unique.len() as u64, total);
    assert_eq!(unique, (0..total).collect::<BTreeSet<_>>());
    assert_eq!(store.count().unwrap().wait().unwrap(), total);

    // Count rows on disk without opening them.
    let mut rows = 0;
    for shard in 0..10 {
        let contents = fs::read_to_string(store.shard_path(ShardId(shard))).unwrap();
        for line in contents.lines().skip(1) {
            let id: u64 = line.split(',').next().unwrap().parse().unwrap();
            assert_eq!(id / 100, shard);
            rows += 1;
        }
    }
    assert_eq!(rows, total);
}

#[test]
fn test_concurrent_updates_to_one_shard_are_not_lost() {
    let dir = TempDir::new().unwrap();
    let store = admin_store(&dir, 100);
    let ids = store
        .batch_insert((0..8i64).map(Value::Int).collect())
        .unwrap()
        .wait()
        .unwrap();

    thread::scope(|s| {
        for id in &ids {
            let store = &store;
            s.spawn(move || {
                for round in 1..=10i64 {
                    let updated = store
                        .update(*id, Value::tuple([Value::Int(id.0 as i64), Value::Int(round)]))
                        .unwrap()
                        .wait()
                        .unwrap();
                    assert!(updated);
                }
            });
        }
    });

    for id in &ids {
        assert_eq!(
            store.query(*id).unwrap().wait().unwrap(),
            Some(Value::tuple([Value::Int(id.0 as i64), Value::Int(10)]))
        );
    }
    assert_eq!(store.count().unwrap().wait().unwrap(), 8);
}

#[test]
fn test_concurrent_inserts_and_deletes_keep_counts_consistent() {
    let dir = TempDir::new().unwrap();
    let store = admin_store(&dir, 16);
    let seeded = store
        .batch_insert((0..64i64).map(Value::Int).collect())
        .unwrap()
        .wait()
        .unwrap();

    thread::scope(|s| {
        let deleter = {
            let store = &store;
            let seeded = &seeded;
            s.spawn(move || {
                seeded
                    .iter()
                    .filter(|id| id.0 % 2 == 0)
                    .map(|id| store.delete(*id).unwrap())
                    .collect::<Vec<_>>()
                    .into_iter()
                    .map(|h| h.wait().unwrap())
                    .filter(|removed| *removed)
                    .count()
            })
        };
        let inserter = {
            let store = &store;
            s.spawn(move || {
                (0..32i64)
                    .map(|n| store.insert(n).unwrap())
                    .collect::<Vec<_>>()
                    .into_iter()
                    .map(|h| h.wait().unwrap())
                    .count()
            })
        };
        assert_eq!(deleter.join().unwrap(), 32);
        assert_eq!(inserter.join().unwrap(), 32);
    });

    let stats = store.stats().unwrap().wait().unwrap();
    assert_eq!(stats.insertions, 96);
    assert_eq!(stats.deletions, 32);
    assert_eq!(stats.live_records, 64);
    assert_eq!(store.list_all_records().unwrap().wait().unwrap().len(), 64);
    assert!(store.verify_integrity().unwrap().wait().unwrap());
}

#[test]
fn test_index_built_during_inserts_sees_every_row() {
    let dir = TempDir::new().unwrap();
    let store = admin_store(&dir, 8);
    store
        .batch_insert((0..40i64).map(Value::Int).collect())
        .unwrap()
        .wait()
        .unwrap();

    thread::scope(|s| {
        let store = &store;
        let inserts = s.spawn(move || {
            (0..40i64)
                .map(|n| store.insert(n).unwrap())
                .collect::<Vec<_>>()
                .into_iter()
                .for_each(|h| {
                    h.wait().unwrap();
                })
        });
        store.create_index("ID").unwrap().wait().unwrap();
        inserts.join().unwrap();
    });

    for id in 0..80 {
        assert_eq!(
            store
                .lookup("ID", flatshard::IndexKey::for_id(RecordId(id)))
                .unwrap()
                .wait()
                .unwrap(),
            Some(RecordId(id))
        );
    }
}

#[test]
fn test_restore_racing_inserts_keeps_live_count_exact() {
    let dir = TempDir::new().unwrap();
    let store = admin_store(&dir, 4);
    let backup = dir.path().join("backup");
    store
        .batch_insert((0..6i64).map(Value::Int).collect())
        .unwrap()
        .wait()
        .unwrap();
    store.backup(&backup).unwrap().wait().unwrap();

    for round in 0..20i64 {
        let handles: Vec<_> = (0..16i64)
            .map(|n| store.insert(round * 100 + n).unwrap())
            .collect();
        let restored = store.restore(&backup).unwrap();
        for handle in handles {
            handle.wait().unwrap();
        }
        restored.wait().unwrap();

        let live = store.count().unwrap().wait().unwrap();
        let rows = store.list_all_records().unwrap().wait().unwrap();
        assert_eq!(live, rows.len() as u64, "round {}", round);
        let unique: BTreeSet<RecordId> = rows.iter().map(|r| r.id).collect();
        assert_eq!(unique.len(), rows.len());
    }
}

#[test]
fn test_racing_first_inserts_log_one_shard_creation() {
    let dir = TempDir::new().unwrap();
    let store = admin_store(&dir, 1000);

    let handles: Vec<_> = (0..32i64).map(|n| store.insert(n).unwrap()).collect();
    for handle in handles {
        handle.wait().unwrap();
    }

    let wal = WriteAheadLog::open(store.wal_path(), false).unwrap();
    let created = wal
        .entries()
        .unwrap()
        .into_iter()
        .filter(|e| e.operation == WalOperation::CreateShard)
        .count();
    assert_eq!(created, 1);
}
