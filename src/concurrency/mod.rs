//! Concurrency control: shard locks, the counter lock and the worker pool.
//!
//! Locks are always taken in the order permission check, counter lock,
//! WAL lock, shard lock(s), and released in reverse. Several shard locks
//! are taken in ascending shard order.
//!
//! Compaction and restore also read or reset the counters while holding
//! shard locks, and the first write to a shard logs its creation to the WAL
//! under that shard's lock. Neither can deadlock as long as the counter and
//! WAL locks are never held while waiting for a shard lock.

mod locks;
mod pool;

pub use locks::{CounterState, Counters, ShardLocks};
pub use pool::{OpHandle, WorkerPool};
