//! Sharded record files.
//!
//! Record `id` lives in shard `id / shard_size`, one CSV-style file per
//! shard with an `ID,Type,Value` header. Shards are created on first use and
//! only ever rewritten whole, never deleted.

mod manager;
mod row;

pub use manager::{find_in, ShardManager, STAGING_SUFFIX};
pub use row::{CorruptRow, RowEntry, ShardRow, COLUMNS, HEADER};
