//! Shard locks and the global counter lock.

use crate::error::Result;
use crate::types::{RecordId, ShardId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// One mutex per shard, created on first use.
///
/// Every operation that reads-then-rewrites a shard file holds that shard's
/// lock for the whole read-modify-write, so two ids in the same shard never
/// race on the file.
#[derive(Default)]
pub struct ShardLocks {
    locks: Mutex<HashMap<ShardId, Arc<Mutex<()>>>>,
}

impl ShardLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, shard: ShardId) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.lock().entry(shard).or_default())
    }

    /// Run `f` holding the lock of `shard`.
    pub fn with_shard<T>(&self, shard: ShardId, f: impl FnOnce() -> T) -> T {
        let lock = self.handle(shard);
        let _guard = lock.lock();
        f()
    }

    /// Run `f` holding the locks of every shard in `shards`.
    pub fn with_shards<T>(&self, shards: &[ShardId], f: impl FnOnce() -> T) -> T {
        let mut ordered = shards.to_vec();
        ordered.sort();
        ordered.dedup();

        let handles: Vec<Arc<Mutex<()>>> = ordered.iter().map(|s| self.handle(*s)).collect();
        let _guards: Vec<_> = handles.iter().map(|h| h.lock()).collect();
        f()
    }

    /// Shards that have been locked at least once.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Snapshot of the store counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterState {
    /// Ids issued so far; also the next id to issue.
    pub insertions: u64,
    /// Records removed so far, burned ids included.
    pub deletions: u64,
}

impl CounterState {
    pub fn live(&self) -> u64 {
        self.insertions.saturating_sub(self.deletions)
    }
}

/// The monotonic counters behind the global counter lock.
#[derive(Default)]
pub struct Counters {
    state: Mutex<CounterState>,
}

impl Counters {
    pub fn new(state: CounterState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Reserve `count` consecutive ids.
    ///
    /// `log` runs with the counter lock held and receives the first id; the
    /// reservation only takes effect if it succeeds, so the WAL sees ids in
    /// issuance order and a failed log write burns nothing.
    pub fn reserve_with<T>(
        &self,
        count: u64,
        log: impl FnOnce(RecordId) -> Result<T>,
    ) -> Result<(RecordId, T)> {
        let mut state = self.state.lock();
        let start = RecordId(state.insertions);
        let logged = log(start)?;
        state.insertions += count;
        Ok((start, logged))
    }

    pub fn record_deletions(&self, count: u64) {
        if count > 0 {
            self.state.lock().deletions += count;
        }
    }

    /// Take back `count` deletions recorded for rows that came back.
    pub fn revert_deletions(&self, count: u64) {
        if count > 0 {
            let mut state = self.state.lock();
            state.deletions = state.deletions.saturating_sub(count);
        }
    }

    pub fn snapshot(&self) -> CounterState {
        *self.state.lock()
    }

    pub fn live(&self) -> u64 {
        self.snapshot().live()
    }

    /// Next id to be issued.
    pub fn next_id(&self) -> RecordId {
        RecordId(self.state.lock().insertions)
    }

    /// Re-derive the counters after shard files were replaced wholesale.
    ///
    /// The insertion counter never moves backwards.
    pub fn reset(&self, recovered_insertions: u64, live_rows: u64) -> CounterState {
        let mut state = self.state.lock();
        state.insertions = state.insertions.max(recovered_insertions);
        state.deletions = state.insertions.saturating_sub(live_rows);
        *state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_reserve_is_contiguous() {
        let counters = Counters::default();
        assert_eq!(counters.reserve_with(1, |_| Ok(())).unwrap().0, RecordId(0));
        assert_eq!(counters.reserve_with(5, |_| Ok(())).unwrap().0, RecordId(1));
        assert_eq!(counters.next_id(), RecordId(6));

        counters.record_deletions(2);
        assert_eq!(counters.live(), 4);
    }

    #[test]
    fn test_failed_log_reserves_nothing() {
        let counters = Counters::default();
        let result: Result<(RecordId, ())> =
            counters.reserve_with(3, |_| Err(StoreError::NotInitialized));
        assert!(result.is_err());
        assert_eq!(counters.next_id(), RecordId(0));

        let (start, seen) = counters.reserve_with(3, |start| Ok(start)).unwrap();
        assert_eq!(start, RecordId(0));
        assert_eq!(seen, RecordId(0));
        assert_eq!(counters.next_id(), RecordId(3));
    }

    #[test]
    fn test_reset_never_lowers_insertions() {
        let counters = Counters::new(CounterState {
            insertions: 10,
            deletions: 2,
        });
        let state = counters.reset(4, 3);
        assert_eq!(state.insertions, 10);
        assert_eq!(state.deletions, 7);
        assert_eq!(state.live(), 3);

        let state = counters.reset(20, 3);
        assert_eq!(state.insertions, 20);
        assert_eq!(state.deletions, 17);
    }

    #[test]
    fn test_concurrent_reservations_are_unique() {
        let counters = Arc::new(Counters::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counters = Arc::clone(&counters);
                thread::spawn(move || {
                    (0..200)
                        .map(|_| {
                            let (id, ()) = counters.reserve_with(1, |_| Ok(())).unwrap();
                            id.0
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort();
        assert_eq!(ids, (0..1600).collect::<Vec<_>>());
    }

    #[test]
    fn test_same_shard_serializes() {
        let locks = Arc::new(ShardLocks::new());
        let inside = Arc::new(AtomicBool::new(false));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..20 {
                        locks.with_shard(ShardId(0), || {
                            assert!(!inside.swap(true, Ordering::SeqCst));
                            thread::sleep(Duration::from_micros(50));
                            inside.store(false, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn test_multi_shard_locking_tolerates_duplicates() {
        let locks = ShardLocks::new();
        let value = locks.with_shards(&[ShardId(3), ShardId(1), ShardId(3)], || 7);
        assert_eq!(value, 7);
        assert_eq!(locks.len(), 2);
    }
}
