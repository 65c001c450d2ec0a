//! # Flatshard
//!
//! A concurrent, durable, sharded flat-record store.
//!
//! ## Core Concepts
//!
//! - **Shards**: Records live in CSV-style files of `shard_size` ids each
//! - **Sealing**: Every payload is compressed, encrypted and wrapped before it is written
//! - **WAL**: Each mutation is logged before it touches a shard
//! - **Indexes**: Optional in-memory maps from `ID`, `Type` or `Value` to record ids
//! - **Transactions**: One shard at a time, staged in a copy until commit
//! - **Access control**: Users with admin, editor or viewer roles
//!
//! Every operation returns an [`OpHandle`] resolved by the worker pool.
//!
//! ## Example
//!
//! ```ignore
//! use flatshard::{KeyPair, Role, Store, StoreConfig, Value};
//!
//! let store = Store::open_or_create(
//!     StoreConfig {
//!         path: "./my-store".into(),
//!         ..Default::default()
//!     },
//!     KeyPair::from_pem_files("private.pem", "public.pem")?,
//! )?;
//! store.add_user("admin", "secret", Role::Admin)?;
//! store.authenticate("admin", "secret")?;
//!
//! let id = store.insert(Value::tuple([1i64.into(), "one".into()]))?.wait()?;
//! assert!(store.query(id)?.wait()?.is_some());
//!
//! store.create_index("Type")?.wait()?;
//! ```

pub mod access;
pub mod concurrency;
pub mod crypto;
pub mod error;
pub mod index;
pub mod oplog;
pub mod schema;
pub mod shards;
pub mod store;
pub mod transaction;
pub mod types;
pub mod wal;

#[cfg(test)]
mod test_support;

// Re-exports
pub use access::{AccessControl, Permission, Role, User};
pub use concurrency::{CounterState, OpHandle, WorkerPool};
pub use crypto::{KeyPair, Sealer};
pub use error::{Result, StoreError};
pub use index::{IndexField, IndexKey, IndexManager};
pub use oplog::{LogEntry, OperationLog};
pub use schema::{Schema, ValueKind};
pub use store::{CompactionReport, Store, StoreConfig};
pub use transaction::{OpenTransaction, TransactionState};
pub use types::*;
pub use wal::{WalEntry, WalOperation, WriteAheadLog};
