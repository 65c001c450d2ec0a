//! Main Store struct tying all components together.

use crate::access::{AccessControl, Permission, Role};
use crate::concurrency::{CounterState, Counters, OpHandle, ShardLocks, WorkerPool};
use crate::crypto::{KeyPair, Sealer};
use crate::error::{Result, StoreError};
use crate::index::{IndexField, IndexKey, IndexManager, RecordKeys};
use crate::oplog::OperationLog;
use crate::schema::Schema;
use crate::shards::{find_in, RowEntry, ShardManager, ShardRow};
use crate::transaction::{TransactionManager, TransactionState};
use crate::types::{ContentHash, Record, RecordId, ShardId, StoreStats, TypeTag, Value};
use crate::wal::{Detail, WalOperation, WriteAheadLog};
use fs2::FileExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding every store file.
    pub path: PathBuf,

    /// Prefix of every store file name.
    pub name: String,

    /// Ids per shard file.
    pub shard_size: u64,

    /// Worker threads executing operations.
    pub max_workers: usize,

    /// Operations that may wait for a worker before submitters block.
    pub queue_capacity: usize,

    /// Largest plaintext a record may seal to.
    pub max_payload_bytes: usize,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether shard and WAL writes are fsynced.
    pub sync_writes: bool,

    /// Runtime types required per type tag.
    pub schema: Schema,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./store"),
            name: "db".to_string(),
            shard_size: 1000,
            max_workers: 4,
            queue_capacity: 1024,
            max_payload_bytes: 16 * 1024 * 1024,
            create_if_missing: true,
            sync_writes: true,
            schema: Schema::default(),
        }
    }
}

impl StoreConfig {
    /// Load a configuration from a JSON file. Missing keys take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: StoreConfig = serde_json::from_str(&text)
            .map_err(|e| StoreError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_size == 0 {
            return Err(StoreError::InvalidConfig("shard_size must be positive".into()));
        }
        if self.max_workers == 0 {
            return Err(StoreError::InvalidConfig("max_workers must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(StoreError::InvalidConfig("queue_capacity must be positive".into()));
        }
        if self.name.is_empty() {
            return Err(StoreError::InvalidConfig("name must not be empty".into()));
        }
        if self.name.contains(['/', '\\']) {
            return Err(StoreError::InvalidConfig(format!(
                "name must not contain a path separator: {}",
                self.name
            )));
        }
        Ok(())
    }

    fn wal_path(&self) -> PathBuf {
        self.path.join(format!("{}_wal.log", self.name))
    }

    fn oplog_path(&self) -> PathBuf {
        self.path.join(format!("{}_log.csv", self.name))
    }

    fn lock_path(&self) -> PathBuf {
        self.path.join(format!("{}.lock", self.name))
    }
}

/// Outcome of compacting one shard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompactionReport {
    pub shard: ShardId,
    /// Rows left in the shard.
    pub kept: usize,
    /// Rows removed as invalid.
    pub dropped: usize,
}

/// The sharded record store.
///
/// Every operation checks permission and validates its input in the
/// caller's thread, then runs on the worker pool and resolves through the
/// returned [`OpHandle`].
pub struct Store {
    inner: Arc<StoreInner>,

    /// Dropped after `inner`; joins the workers, which hold the last
    /// references to it.
    pool: WorkerPool,
}

// Lock order: gate, counter, WAL, shard(s) ascending. Three places take a
// lock out of that order while holding shard locks. Compact reads the
// counter and restore resets it. First writes to a shard append its
// create_shard entry to the WAL. Each stays deadlock-free only while no
// holder of the counter or WAL lock ever waits on a shard lock.
struct StoreInner {
    config: StoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    sealer: Sealer,
    shards: ShardManager,
    wal: WriteAheadLog,
    oplog: OperationLog,
    index: IndexManager,
    locks: ShardLocks,
    counters: Counters,
    txns: TransactionManager,
    access: AccessControl,

    /// Held shared by every job and by `begin`, exclusively by restore, so
    /// a restore never sees an id reserved but not yet written.
    gate: RwLock<()>,
}

impl Store {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig, keys: KeyPair) -> Result<Self> {
        config.validate()?;
        if config.wal_path().exists() {
            Self::open(config, keys)
        } else if config.create_if_missing {
            fs::create_dir_all(&config.path)?;
            Self::start(config, keys)
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    /// Open an existing store.
    pub fn open(config: StoreConfig, keys: KeyPair) -> Result<Self> {
        config.validate()?;
        if !config.wal_path().exists() {
            return Err(StoreError::NotInitialized);
        }
        Self::start(config, keys)
    }

    fn start(config: StoreConfig, keys: KeyPair) -> Result<Self> {
        let lock_file = Self::acquire_lock(&config.lock_path())?;

        let shards = ShardManager::new(
            &config.path,
            &config.name,
            config.shard_size,
            config.sync_writes,
        );
        for staging in shards.leftover_staging()? {
            tracing::warn!(path = %staging.display(), "discarding uncommitted transaction");
            fs::remove_file(&staging)?;
        }

        let wal = WriteAheadLog::open(config.wal_path(), config.sync_writes)?;
        let oplog = OperationLog::open(config.oplog_path())?;
        let counters = Self::recover_counters(&shards, &wal)?;
        let pool = WorkerPool::new(config.max_workers, config.queue_capacity)?;

        tracing::info!(
            path = %config.path.display(),
            name = %config.name,
            next_id = counters.insertions,
            live = counters.live(),
            "store opened"
        );
        oplog.record_quietly(
            None,
            "open",
            Detail::new()
                .with("next_id", counters.insertions)
                .with("live", counters.live())
                .as_str(),
        );

        let inner = StoreInner {
            sealer: Sealer::new(keys, config.max_payload_bytes),
            config,
            _lock_file: lock_file,
            shards,
            wal,
            oplog,
            index: IndexManager::new(),
            locks: ShardLocks::new(),
            counters: Counters::new(counters),
            txns: TransactionManager::new(),
            access: AccessControl::new(),
            gate: RwLock::new(()),
        };

        Ok(Self {
            inner: Arc::new(inner),
            pool,
        })
    }

    /// Next id and deletion count, without replaying the WAL.
    ///
    /// The WAL contributes the highest id it ever reserved so ids stay
    /// unique even when the highest rows were deleted before a restart.
    fn recover_counters(shards: &ShardManager, wal: &WriteAheadLog) -> Result<CounterState> {
        let mut max_id: Option<u64> = None;
        let mut live = HashSet::new();
        for shard in shards.list_shards()? {
            for entry in shards.read_entries(shard)? {
                if let RowEntry::Valid(row) = entry {
                    max_id = max_id.max(Some(row.id.0));
                    live.insert(row.id);
                }
            }
        }
        if let Some(reserved) = wal.max_reserved_id()? {
            max_id = max_id.max(Some(reserved.0));
        }

        let insertions = max_id.map_or(0, |id| id + 1);
        Ok(CounterState {
            insertions,
            deletions: insertions.saturating_sub(live.len() as u64),
        })
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path)?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;
        Ok(lock_file)
    }

    // --- Access control ---

    /// Register a user. Needs no session.
    pub fn add_user(&self, username: &str, password: &str, role: Role) -> Result<()> {
        let inner = &self.inner;
        match inner.access.add_user(username, password, role) {
            Ok(()) => {
                tracing::info!(username, %role, "user added");
                inner.oplog.record_quietly(
                    inner.access.current_user().as_deref(),
                    "add_user",
                    Detail::new()
                        .with("user", username)
                        .with("role", role)
                        .as_str(),
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(username, error = %e, "add_user rejected");
                Err(e)
            }
        }
    }

    /// Make `username` the current user of this store.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<()> {
        let inner = &self.inner;
        match inner.access.authenticate(username, password) {
            Ok(()) => {
                tracing::info!(username, "authenticated");
                inner.oplog.record_quietly(
                    Some(username),
                    "authenticate",
                    Detail::new().with("user", username).as_str(),
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(username, error = %e, "authentication failed");
                inner.oplog.record_quietly(
                    None,
                    "authentication_failed",
                    Detail::new().with("user", username).as_str(),
                );
                Err(e)
            }
        }
    }

    pub fn logout(&self) {
        if let Some(user) = self.inner.access.current_user() {
            self.inner.oplog.record_quietly(Some(&user), "logout", "");
        }
        self.inner.access.logout();
    }

    pub fn current_user(&self) -> Option<String> {
        self.inner.access.current_user()
    }

    // --- Record operations ---

    /// Insert a value, returning its new id.
    pub fn insert(&self, value: impl Into<Value>) -> Result<OpHandle<RecordId>> {
        let user = self.authorize(Permission::Write)?;
        let value = value.into();
        let plaintext = self.inner.prepare(&value)?;
        self.run("insert", user, move |inner, user| {
            inner.insert(user, value.type_tag(), plaintext)
        })
    }

    /// The value stored under `id`, or `None`.
    pub fn query(&self, id: RecordId) -> Result<OpHandle<Option<Value>>> {
        let user = self.authorize(Permission::Read)?;
        self.run("query", user, move |inner, user| inner.query(user, id))
    }

    /// Replace the value stored under `id`. Resolves to whether it existed.
    pub fn update(&self, id: RecordId, value: impl Into<Value>) -> Result<OpHandle<bool>> {
        let user = self.authorize(Permission::Write)?;
        let value = value.into();
        let plaintext = self.inner.prepare(&value)?;
        self.run("update", user, move |inner, user| {
            inner.update(user, id, value.type_tag(), plaintext)
        })
    }

    /// Remove `id`. Resolves to whether it existed.
    pub fn delete(&self, id: RecordId) -> Result<OpHandle<bool>> {
        let user = self.authorize(Permission::Delete)?;
        self.run("delete", user, move |inner, user| inner.delete(user, id))
    }

    /// Insert all values under one contiguous id range.
    ///
    /// Every value is validated first; one invalid value rejects the batch.
    pub fn batch_insert(&self, values: Vec<Value>) -> Result<OpHandle<Vec<RecordId>>> {
        let user = self.authorize(Permission::Write)?;
        let items = values
            .iter()
            .map(|value| Ok((value.type_tag(), self.inner.prepare(value)?)))
            .collect::<Result<Vec<_>>>()?;
        self.run("batch_insert", user, move |inner, user| {
            inner.batch_insert(user, items)
        })
    }

    /// Apply several updates. Resolves to the ids that existed, ascending.
    ///
    /// A repeated id takes its last value.
    pub fn batch_update(&self, updates: Vec<(RecordId, Value)>) -> Result<OpHandle<Vec<RecordId>>> {
        let user = self.authorize(Permission::Write)?;
        let mut items = BTreeMap::new();
        for (id, value) in &updates {
            items.insert(*id, (value.type_tag(), self.inner.prepare(value)?));
        }
        self.run("batch_update", user, move |inner, user| {
            inner.batch_update(user, items)
        })
    }

    /// Remove several ids. Resolves to the number that existed.
    pub fn batch_delete(&self, ids: Vec<RecordId>) -> Result<OpHandle<usize>> {
        let user = self.authorize(Permission::Delete)?;
        let ids: BTreeSet<RecordId> = ids.into_iter().collect();
        self.run("batch_delete", user, move |inner, user| {
            inner.batch_delete(user, ids)
        })
    }

    /// Rewrite `shard` keeping only valid, issued, correctly routed rows.
    pub fn compact(&self, shard: ShardId) -> Result<OpHandle<CompactionReport>> {
        let user = self.authorize(Permission::Compact)?;
        self.run("compact", user, move |inner, user| inner.compact(user, shard))
    }

    /// Scan every shard. Resolves to `false` if any row is malformed.
    pub fn verify_integrity(&self) -> Result<OpHandle<bool>> {
        let user = self.authorize(Permission::Verify)?;
        self.run("verify_integrity", user, |inner, user| {
            inner.verify_integrity(user)
        })
    }

    /// Every readable record, in shard order then row order.
    pub fn list_all_records(&self) -> Result<OpHandle<Vec<Record>>> {
        let user = self.authorize(Permission::Read)?;
        self.run("list_all_records", user, |inner, user| {
            inner.list_all_records(user)
        })
    }

    /// Live record count.
    pub fn count(&self) -> Result<OpHandle<u64>> {
        let user = self.authorize(Permission::Read)?;
        self.run("count", user, |inner, _| Ok(inner.counters.live()))
    }

    pub fn stats(&self) -> Result<OpHandle<StoreStats>> {
        let user = self.authorize(Permission::Report)?;
        self.run("stats", user, |inner, user| inner.stats(user))
    }

    // --- Indexes ---

    /// Build an index on `ID`, `Type` or `Value`.
    pub fn create_index(&self, field: &str) -> Result<OpHandle<()>> {
        let user = self.authorize(Permission::Write)?;
        let field: IndexField = field.parse()?;
        self.run("create_index", user, move |inner, user| {
            inner.create_index(user, field)
        })
    }

    /// Remove an index. Resolves to whether it existed.
    pub fn drop_index(&self, field: &str) -> Result<OpHandle<bool>> {
        let user = self.authorize(Permission::Write)?;
        let field: IndexField = field.parse()?;
        self.run("drop_index", user, move |inner, user| {
            let dropped = inner.index.drop_index(field);
            tracing::info!(%field, dropped, "index dropped");
            inner.oplog.record_quietly(
                Some(user),
                "drop_index",
                Detail::new().with("field", field).as_str(),
            );
            Ok(dropped)
        })
    }

    /// Most recently issued live id holding `key` in `field`.
    pub fn lookup(&self, field: &str, key: IndexKey) -> Result<OpHandle<Option<RecordId>>> {
        let user = self.authorize(Permission::Read)?;
        let field = self.indexed_field(field)?;
        self.run("lookup", user, move |inner, _| {
            inner.index.lookup(field, &key)
        })
    }

    /// Every live id holding `key` in `field`, ascending.
    pub fn lookup_all(&self, field: &str, key: IndexKey) -> Result<OpHandle<Vec<RecordId>>> {
        let user = self.authorize(Permission::Read)?;
        let field = self.indexed_field(field)?;
        self.run("lookup_all", user, move |inner, _| {
            inner.index.lookup_all(field, &key)
        })
    }

    /// Look `key` up and read the record it points to.
    pub fn find_by_index(&self, field: &str, key: IndexKey) -> Result<OpHandle<Option<Record>>> {
        let user = self.authorize(Permission::Read)?;
        let field = self.indexed_field(field)?;
        self.run("find_by_index", user, move |inner, user| {
            let Some(id) = inner.index.lookup(field, &key)? else {
                return Ok(None);
            };
            let value = inner.query(user, id)?;
            Ok(value.map(|value| Record {
                id,
                tag: value.type_tag(),
                value,
            }))
        })
    }

    // --- Transactions ---

    /// Start staging every write to `shard`.
    ///
    /// The staging copy exists once this returns; the handle only reports
    /// completion.
    pub fn begin(&self, shard: ShardId) -> Result<OpHandle<()>> {
        let user = self.authorize(Permission::Write)?;
        let inner = &self.inner;
        {
            let _gate = inner.gate.read();
            inner.txns.begin(shard, inner.shards.staging_path(shard))?;

            // Staged before returning, so a commit or rollback submitted next
            // always finds the staging file.
            if let Err(e) = inner.begin(&user, shard) {
                inner.txns.finish();
                inner.report_failure(&user, "begin_transaction", &e);
                return Err(e);
            }
        }
        self.run("begin_transaction", user, |_, _| Ok(()))
    }

    /// Make the staged shard the committed one.
    pub fn commit(&self) -> Result<OpHandle<()>> {
        let user = self.authorize(Permission::Write)?;
        let shard = self.inner.txns.start_commit()?.shard;
        self.run("commit_transaction", user, move |inner, user| {
            let committed = inner.commit(user, shard);
            match committed {
                Ok(()) => inner.txns.finish(),
                Err(_) => inner.txns.resume(),
            }
            committed
        })
    }

    /// Throw the staged shard away.
    pub fn rollback(&self) -> Result<OpHandle<()>> {
        let user = self.authorize(Permission::Write)?;
        let shard = self.inner.txns.start_rollback()?.shard;
        self.run("rollback_transaction", user, move |inner, user| {
            let rolled_back = inner.rollback(user, shard);
            match rolled_back {
                Ok(()) => inner.txns.finish(),
                Err(_) => inner.txns.resume(),
            }
            rolled_back
        })
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.inner.txns.state()
    }

    // --- Backup ---

    /// Copy every committed shard into `dir`. Resolves to the written files.
    pub fn backup(&self, dir: impl AsRef<Path>) -> Result<OpHandle<Vec<PathBuf>>> {
        let user = self.authorize(Permission::Read)?;
        let dir = dir.as_ref().to_path_buf();
        self.run("backup", user, move |inner, user| inner.backup(user, &dir))
    }

    /// Replace every shard with the copy in `dir`. Resolves to the live count.
    pub fn restore(&self, dir: impl AsRef<Path>) -> Result<OpHandle<u64>> {
        let user = self.authorize(Permission::Write)?;
        self.inner.txns.ensure_idle()?;
        let dir = dir.as_ref().to_path_buf();
        self.run_exclusive("restore", user, move |inner, user| inner.restore(user, &dir))
    }

    // --- Accessors ---

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    /// Path of shard `shard`'s committed file.
    pub fn shard_path(&self, shard: ShardId) -> PathBuf {
        self.inner.shards.shard_path(shard)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.inner.config.wal_path()
    }

    pub fn oplog_path(&self) -> PathBuf {
        self.inner.config.oplog_path()
    }

    // --- Internals ---

    fn authorize(&self, permission: Permission) -> Result<String> {
        self.inner.access.check_permission(permission).map_err(|e| {
            tracing::warn!(%permission, error = %e, "permission denied");
            e
        })
    }

    fn indexed_field(&self, field: &str) -> Result<IndexField> {
        let field: IndexField = field.parse()?;
        if !self.inner.index.is_indexed(field) {
            return Err(StoreError::UnsupportedField(format!(
                "no index registered on {}",
                field
            )));
        }
        Ok(field)
    }

    fn run<T, F>(&self, operation: &'static str, user: String, task: F) -> Result<OpHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&StoreInner, &str) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.pool.submit(move || {
            let outcome = {
                let _gate = inner.gate.read();
                task(&inner, &user)
            };
            if let Err(e) = &outcome {
                inner.report_failure(&user, operation, e);
            }
            outcome
        })
    }

    /// Like [`Store::run`], but waits for every other job to finish and
    /// holds new ones back until `task` returns.
    fn run_exclusive<T, F>(
        &self,
        operation: &'static str,
        user: String,
        task: F,
    ) -> Result<OpHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&StoreInner, &str) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.pool.submit(move || {
            let outcome = {
                let _gate = inner.gate.write();
                task(&inner, &user)
            };
            if let Err(e) = &outcome {
                inner.report_failure(&user, operation, e);
            }
            outcome
        })
    }
}

/// Keep `entry` unless it is a valid row matching `doomed`.
fn keep_unless(entry: RowEntry, doomed: impl Fn(&ShardRow) -> bool) -> Option<RowEntry> {
    let dropped = entry.as_valid().map_or(false, doomed);
    if dropped {
        None
    } else {
        Some(entry)
    }
}

impl StoreInner {
    /// Validate `value` and encode the plaintext it will seal to.
    fn prepare(&self, value: &Value) -> Result<Vec<u8>> {
        self.config.schema.validate(value)?;
        let plaintext = value.to_plaintext()?;
        if plaintext.len() > self.sealer.max_payload() {
            return Err(StoreError::PayloadTooLarge {
                size: plaintext.len(),
                max: self.sealer.max_payload(),
            });
        }
        Ok(plaintext)
    }

    fn report_failure(&self, user: &str, operation: &str, error: &StoreError) {
        if error.is_rejection() {
            tracing::warn!(operation, user, error = %error, "operation rejected");
            return;
        }
        tracing::error!(operation, user, error = %error, "operation failed");
        self.oplog
            .record_quietly(Some(user), "error", &format!("{}: {}", operation, error));
    }

    fn open_row(&self, row: &ShardRow) -> Result<Value> {
        let plaintext = self.sealer.open(&row.sealed)?;
        Value::from_plaintext(&plaintext, row.tag)
    }

    fn row_keys(&self, row: &ShardRow) -> Result<RecordKeys> {
        let plaintext = self.sealer.open(&row.sealed)?;
        Ok(RecordKeys::new(row.id, row.tag, ContentHash::from_bytes(&plaintext)))
    }

    /// WAL the creation of `shard` if its file does not exist yet.
    ///
    /// Called with the shard lock held, so concurrent first writers log one
    /// creation between them.
    fn note_new_shard(&self, shard: ShardId) -> Result<()> {
        if !self.shards.exists(shard) {
            self.wal
                .append(WalOperation::CreateShard, Detail::new().with("shard", shard))?;
        }
        Ok(())
    }

    /// Count reserved ids that never reached a shard as deleted.
    fn burn(&self, start: RecordId, count: u64, cause: &StoreError) {
        self.counters.record_deletions(count);
        tracing::warn!(start = start.0, count, error = %cause, "reserved ids burned");
    }

    /// Count rows written to or removed from `shard`'s staging file.
    ///
    /// Called with the shard lock held, so the redirect cannot change.
    fn note_staged(&self, shard: ShardId, inserts: u64, deletes: u64) {
        if self.shards.active_path(shard) != self.shards.shard_path(shard) {
            self.txns.record_staged(shard, inserts, deletes);
        }
    }

    fn reindex(&self, keys: &RecordKeys) {
        match self.index.known(keys.id) {
            Some(old) => self.index.update_on_mutate(&old, keys),
            None => self.index.update_on_insert(keys),
        }
    }

    fn insert(&self, user: &str, tag: TypeTag, plaintext: Vec<u8>) -> Result<RecordId> {
        let sealed = self.sealer.seal(&plaintext)?;
        let content = ContentHash::from_bytes(&plaintext);

        let (id, _) = self.counters.reserve_with(1, |id| {
            self.wal.append(
                WalOperation::Insert,
                Detail::new()
                    .with("id", id)
                    .with("type", tag)
                    .with("shard", self.shards.shard_of(id)),
            )
        })?;
        let shard = self.shards.shard_of(id);

        let written = self.locks.with_shard(shard, || -> Result<()> {
            self.note_new_shard(shard)?;
            self.shards
                .append_rows(shard, &[ShardRow::new(id, tag, sealed)])?;
            self.note_staged(shard, 1, 0);
            self.index
                .update_on_insert(&RecordKeys::new(id, tag, content));
            Ok(())
        });
        if let Err(e) = written {
            self.burn(id, 1, &e);
            return Err(e);
        }

        tracing::debug!(id = id.0, %tag, shard = shard.0, "inserted");
        self.oplog.record_quietly(
            Some(user),
            "insert",
            Detail::new().with("id", id).with("type", tag).as_str(),
        );
        Ok(id)
    }

    fn query(&self, user: &str, id: RecordId) -> Result<Option<Value>> {
        let shard = self.shards.shard_of(id);
        let row = self
            .locks
            .with_shard(shard, || self.shards.find(shard, id))?;
        let value = row.map(|row| self.open_row(&row)).transpose()?;

        tracing::debug!(id = id.0, found = value.is_some(), "queried");
        self.oplog.record_quietly(
            Some(user),
            "query",
            Detail::new()
                .with("id", id)
                .with("found", value.is_some())
                .as_str(),
        );
        Ok(value)
    }

    fn update(&self, user: &str, id: RecordId, tag: TypeTag, plaintext: Vec<u8>) -> Result<bool> {
        let sealed = self.sealer.seal(&plaintext)?;
        let keys = RecordKeys::new(id, tag, ContentHash::from_bytes(&plaintext));
        let shard = self.shards.shard_of(id);

        self.wal.append(
            WalOperation::Update,
            Detail::new()
                .with("id", id)
                .with("type", tag)
                .with("shard", shard),
        )?;

        let found = self.locks.with_shard(shard, || -> Result<bool> {
            if self.shards.find(shard, id)?.is_none() {
                return Ok(false);
            }
            let mut replacement = Some(ShardRow::new(id, tag, sealed));
            self.shards.rewrite_shard(shard, |entry| match entry {
                RowEntry::Valid(row) if row.id == id => {
                    Some(RowEntry::Valid(replacement.take().unwrap_or(row)))
                }
                other => Some(other),
            })?;
            self.reindex(&keys);
            Ok(true)
        })?;

        tracing::debug!(id = id.0, found, "updated");
        self.oplog.record_quietly(
            Some(user),
            "update",
            Detail::new()
                .with("id", id)
                .with("type", tag)
                .with("found", found)
                .as_str(),
        );
        Ok(found)
    }

    fn delete(&self, user: &str, id: RecordId) -> Result<bool> {
        let shard = self.shards.shard_of(id);
        self.wal.append(
            WalOperation::Delete,
            Detail::new().with("id", id).with("shard", shard),
        )?;

        let removed = self.locks.with_shard(shard, || -> Result<bool> {
            if self.shards.find(shard, id)?.is_none() {
                return Ok(false);
            }
            self.shards
                .rewrite_shard(shard, |entry| keep_unless(entry, |row| row.id == id))?;
            self.note_staged(shard, 0, 1);
            self.index.update_on_delete(id);
            Ok(true)
        })?;
        if removed {
            self.counters.record_deletions(1);
        }

        tracing::debug!(id = id.0, removed, "deleted");
        self.oplog.record_quietly(
            Some(user),
            "delete",
            Detail::new()
                .with("id", id)
                .with("found", removed)
                .as_str(),
        );
        Ok(removed)
    }

    fn batch_insert(&self, user: &str, items: Vec<(TypeTag, Vec<u8>)>) -> Result<Vec<RecordId>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let count = items.len() as u64;

        let sealed = items
            .iter()
            .map(|(tag, plaintext)| {
                Ok((
                    *tag,
                    self.sealer.seal(plaintext)?,
                    ContentHash::from_bytes(plaintext),
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let (start, _) = self.counters.reserve_with(count, |start| {
            self.wal.append(
                WalOperation::BatchInsert,
                Detail::new()
                    .with_range("ids", start, RecordId(start.0 + count))
                    .with("count", count),
            )
        })?;

        let mut by_shard: BTreeMap<ShardId, Vec<(ShardRow, RecordKeys)>> = BTreeMap::new();
        let mut ids = Vec::with_capacity(sealed.len());
        for (offset, (tag, text, content)) in sealed.into_iter().enumerate() {
            let id = RecordId(start.0 + offset as u64);
            ids.push(id);
            by_shard
                .entry(self.shards.shard_of(id))
                .or_default()
                .push((ShardRow::new(id, tag, text), RecordKeys::new(id, tag, content)));
        }
        let shards: Vec<ShardId> = by_shard.keys().copied().collect();

        let written = self.locks.with_shards(&shards, || -> Result<()> {
            for shard in &shards {
                self.note_new_shard(*shard)?;
            }
            let mut appended = Vec::new();
            for (shard, batch) in &by_shard {
                let rows: Vec<ShardRow> = batch.iter().map(|(row, _)| row.clone()).collect();
                if let Err(e) = self.shards.append_rows(*shard, &rows) {
                    self.undo_appends(&appended, start, count);
                    return Err(e);
                }
                appended.push(*shard);
            }
            for (shard, batch) in &by_shard {
                self.note_staged(*shard, batch.len() as u64, 0);
                for (_, keys) in batch {
                    self.index.update_on_insert(keys);
                }
            }
            Ok(())
        });
        if let Err(e) = written {
            self.burn(start, count, &e);
            return Err(e);
        }

        tracing::debug!(start = start.0, count, shards = shards.len(), "batch inserted");
        self.oplog.record_quietly(
            Some(user),
            "batch_insert",
            Detail::new()
                .with_range("ids", start, RecordId(start.0 + count))
                .with("count", count)
                .as_str(),
        );
        Ok(ids)
    }

    /// Remove rows of a failed batch from shards it already reached.
    fn undo_appends(&self, shards: &[ShardId], start: RecordId, count: u64) {
        let range = start.0..start.0 + count;
        for shard in shards {
            let undone = self
                .shards
                .rewrite_shard(*shard, |entry| keep_unless(entry, |row| range.contains(&row.id.0)));
            if let Err(e) = undone {
                tracing::error!(shard = shard.0, error = %e, "could not undo partial batch insert");
            }
        }
    }

    fn batch_update(
        &self,
        user: &str,
        items: BTreeMap<RecordId, (TypeTag, Vec<u8>)>,
    ) -> Result<Vec<RecordId>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let mut by_shard: BTreeMap<ShardId, BTreeMap<RecordId, (ShardRow, RecordKeys)>> =
            BTreeMap::new();
        for (id, (tag, plaintext)) in &items {
            let row = ShardRow::new(*id, *tag, self.sealer.seal(plaintext)?);
            let keys = RecordKeys::new(*id, *tag, ContentHash::from_bytes(plaintext));
            by_shard
                .entry(self.shards.shard_of(*id))
                .or_default()
                .insert(*id, (row, keys));
        }

        self.wal.append(
            WalOperation::BatchUpdate,
            Detail::new()
                .with("count", items.len())
                .with("ids", join_ids(items.keys())),
        )?;

        let shards: Vec<ShardId> = by_shard.keys().copied().collect();
        let updated = self.locks.with_shards(&shards, || -> Result<Vec<RecordId>> {
            // Check every shard before rewriting any of them.
            let mut present: BTreeMap<ShardId, BTreeSet<RecordId>> = BTreeMap::new();
            for (shard, rows) in &by_shard {
                let entries = self.shards.read_entries(*shard)?;
                for id in rows.keys() {
                    if find_in(&entries, *shard, *id)?.is_some() {
                        present.entry(*shard).or_default().insert(*id);
                    }
                }
            }

            let mut updated = Vec::new();
            for (shard, ids) in &present {
                let rows = &by_shard[shard];
                let mut pending: BTreeSet<RecordId> = ids.clone();
                self.shards.rewrite_shard(*shard, |entry| match entry {
                    RowEntry::Valid(row) if pending.remove(&row.id) => {
                        Some(RowEntry::Valid(rows[&row.id].0.clone()))
                    }
                    other => Some(other),
                })?;
                for id in ids {
                    self.reindex(&rows[id].1);
                    updated.push(*id);
                }
            }
            Ok(updated)
        })?;

        tracing::debug!(requested = items.len(), updated = updated.len(), "batch updated");
        self.oplog.record_quietly(
            Some(user),
            "batch_update",
            Detail::new()
                .with("count", updated.len())
                .with("ids", join_ids(updated.iter()))
                .as_str(),
        );
        Ok(updated)
    }

    fn batch_delete(&self, user: &str, ids: BTreeSet<RecordId>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut by_shard: BTreeMap<ShardId, BTreeSet<RecordId>> = BTreeMap::new();
        for id in &ids {
            by_shard
                .entry(self.shards.shard_of(*id))
                .or_default()
                .insert(*id);
        }

        self.wal.append(
            WalOperation::BatchDelete,
            Detail::new()
                .with("count", ids.len())
                .with("ids", join_ids(ids.iter())),
        )?;

        let shards: Vec<ShardId> = by_shard.keys().copied().collect();
        let removed = self.locks.with_shards(&shards, || -> Result<Vec<RecordId>> {
            let mut present: BTreeMap<ShardId, BTreeSet<RecordId>> = BTreeMap::new();
            for (shard, wanted) in &by_shard {
                let entries = self.shards.read_entries(*shard)?;
                for id in wanted {
                    if find_in(&entries, *shard, *id)?.is_some() {
                        present.entry(*shard).or_default().insert(*id);
                    }
                }
            }

            let mut removed = Vec::new();
            for (shard, gone) in &present {
                self.shards
                    .rewrite_shard(*shard, |entry| keep_unless(entry, |row| gone.contains(&row.id)))?;
                self.note_staged(*shard, 0, gone.len() as u64);
                for id in gone {
                    self.index.update_on_delete(*id);
                    removed.push(*id);
                }
            }
            Ok(removed)
        })?;
        self.counters.record_deletions(removed.len() as u64);

        tracing::debug!(requested = ids.len(), removed = removed.len(), "batch deleted");
        self.oplog.record_quietly(
            Some(user),
            "batch_delete",
            Detail::new()
                .with("count", removed.len())
                .with("ids", join_ids(removed.iter()))
                .as_str(),
        );
        Ok(removed.len())
    }

    fn compact(&self, user: &str, shard: ShardId) -> Result<CompactionReport> {
        self.wal
            .append(WalOperation::Compact, Detail::new().with("shard", shard))?;

        let shard_size = self.shards.shard_size();
        let report = self.locks.with_shard(shard, || -> Result<CompactionReport> {
            let mut report = CompactionReport {
                shard,
                kept: 0,
                dropped: 0,
            };
            if !self.shards.exists(shard) {
                return Ok(report);
            }

            // Read under the shard lock: every row on disk was reserved first.
            let issued = self.counters.next_id();
            let mut seen = HashSet::new();
            let mut unissued = Vec::new();
            self.shards.rewrite_shard(shard, |entry| {
                let verdict = match &entry {
                    RowEntry::Corrupt(corrupt) => Err(corrupt.to_string()),
                    RowEntry::Valid(row) => {
                        if !shard.contains(row.id, shard_size) {
                            Err(format!(
                                "row {} belongs to shard {}",
                                row.id,
                                row.id.shard(shard_size)
                            ))
                        } else if row.id >= issued {
                            unissued.push(row.id);
                            Err(format!("row {} was never issued", row.id))
                        } else if !seen.insert(row.id) {
                            Err(format!("duplicate row {}", row.id))
                        } else {
                            Ok(())
                        }
                    }
                };
                match verdict {
                    Ok(()) => {
                        report.kept += 1;
                        Some(entry)
                    }
                    Err(reason) => {
                        tracing::warn!(shard = shard.0, %reason, "compaction dropped row");
                        report.dropped += 1;
                        None
                    }
                }
            })?;
            for id in unissued {
                self.index.update_on_delete(id);
            }
            Ok(report)
        })?;

        tracing::info!(shard = shard.0, kept = report.kept, dropped = report.dropped, "shard compacted");
        self.oplog.record_quietly(
            Some(user),
            "compact",
            Detail::new()
                .with("shard", shard)
                .with("kept", report.kept)
                .with("dropped", report.dropped)
                .as_str(),
        );
        Ok(report)
    }

    fn verify_integrity(&self, user: &str) -> Result<bool> {
        let mut corrupt_rows = 0usize;
        for shard in self.shards.list_shards()? {
            let entries = self
                .locks
                .with_shard(shard, || self.shards.read_entries(shard))?;
            for entry in entries {
                if let RowEntry::Corrupt(corrupt) = entry {
                    corrupt_rows += 1;
                    tracing::warn!(
                        shard = shard.0,
                        line = corrupt.line,
                        row = ?corrupt.leading_id(),
                        reason = %corrupt.reason,
                        "corrupt row"
                    );
                    self.oplog.record_quietly(
                        Some(user),
                        "integrity_error",
                        &format!("shard={};{}", shard, corrupt),
                    );
                }
            }
        }

        let clean = corrupt_rows == 0;
        tracing::info!(clean, corrupt_rows, "integrity verified");
        self.oplog.record_quietly(
            Some(user),
            "verify_integrity",
            Detail::new()
                .with("clean", clean)
                .with("corrupt_rows", corrupt_rows)
                .as_str(),
        );
        Ok(clean)
    }

    fn list_all_records(&self, user: &str) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        for shard in self.shards.list_shards()? {
            let entries = self
                .locks
                .with_shard(shard, || self.shards.read_entries(shard))?;
            for entry in entries {
                match entry {
                    RowEntry::Valid(row) => records.push(Record {
                        id: row.id,
                        tag: row.tag,
                        value: self.open_row(&row)?,
                    }),
                    RowEntry::Corrupt(corrupt) => {
                        tracing::warn!(shard = shard.0, %corrupt, "skipping corrupt row");
                    }
                }
            }
        }

        self.oplog.record_quietly(
            Some(user),
            "list_all_records",
            Detail::new().with("count", records.len()).as_str(),
        );
        Ok(records)
    }

    fn stats(&self, user: &str) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        let shards = self.shards.list_shards()?;
        for shard in &shards {
            let entries = self
                .locks
                .with_shard(*shard, || self.shards.read_entries(*shard))?;
            for entry in entries {
                match entry {
                    RowEntry::Valid(row) => *stats.records_by_type.entry(row.tag).or_default() += 1,
                    RowEntry::Corrupt(_) => stats.corrupt_rows += 1,
                }
            }
        }

        let counters = self.counters.snapshot();
        stats.live_records = counters.live();
        stats.insertions = counters.insertions;
        stats.deletions = counters.deletions;
        stats.shard_count = shards.len();
        stats.indexed_fields = self
            .index
            .fields()
            .into_iter()
            .map(|field| field.to_string())
            .collect();

        self.oplog.record_quietly(Some(user), "stats", "");
        Ok(stats)
    }

    fn create_index(&self, user: &str, field: IndexField) -> Result<()> {
        if !self.index.register(field) {
            tracing::debug!(%field, "index already registered");
            return Ok(());
        }
        for shard in self.shards.list_shards()? {
            if let Err(e) = self.index_shard(shard) {
                self.index.drop_index(field);
                return Err(e);
            }
        }

        tracing::info!(%field, "index created");
        self.oplog.record_quietly(
            Some(user),
            "create_index",
            Detail::new().with("field", field).as_str(),
        );
        Ok(())
    }

    /// Feed every row of `shard` to the registered indexes.
    fn index_shard(&self, shard: ShardId) -> Result<()> {
        self.locks.with_shard(shard, || -> Result<()> {
            let keys = self
                .shards
                .read_entries(shard)?
                .iter()
                .filter_map(RowEntry::as_valid)
                .map(|row| self.row_keys(row))
                .collect::<Result<Vec<_>>>()?;
            self.index.index_records(&keys);
            Ok(())
        })
    }

    fn rebuild_indexes(&self) -> Result<()> {
        if self.index.is_empty() {
            return Ok(());
        }
        self.index.clear_entries();
        for shard in self.shards.list_shards()? {
            self.index_shard(shard)?;
        }
        tracing::debug!("indexes rebuilt");
        Ok(())
    }

    fn begin(&self, user: &str, shard: ShardId) -> Result<()> {
        self.wal.append(
            WalOperation::BeginTransaction,
            Detail::new().with("shard", shard),
        )?;
        let staging = self
            .locks
            .with_shard(shard, || self.shards.stage(shard))?;

        tracing::info!(shard = shard.0, staging = %staging.display(), "transaction begun");
        self.oplog.record_quietly(
            Some(user),
            "begin_transaction",
            Detail::new().with("shard", shard).as_str(),
        );
        Ok(())
    }

    fn commit(&self, user: &str, shard: ShardId) -> Result<()> {
        self.wal.append(
            WalOperation::CommitTransaction,
            Detail::new().with("shard", shard),
        )?;
        self.locks
            .with_shard(shard, || self.shards.promote_staging(shard))?;

        tracing::info!(shard = shard.0, "transaction committed");
        self.oplog.record_quietly(
            Some(user),
            "commit_transaction",
            Detail::new().with("shard", shard).as_str(),
        );
        Ok(())
    }

    fn rollback(&self, user: &str, shard: ShardId) -> Result<()> {
        self.wal.append(
            WalOperation::RollbackTransaction,
            Detail::new().with("shard", shard),
        )?;
        let (inserts, deletes) = self.locks.with_shard(shard, || -> Result<(u64, u64)> {
            let staged = self
                .txns
                .current()
                .map_or((0, 0), |txn| (txn.staged_inserts, txn.staged_deletes));
            self.shards.discard_staging(shard)?;
            Ok(staged)
        })?;

        // Staged inserts are gone for good; staged deletes never happened.
        self.counters.record_deletions(inserts);
        self.counters.revert_deletions(deletes);
        self.rebuild_indexes()?;

        tracing::info!(shard = shard.0, inserts, deletes, "transaction rolled back");
        self.oplog.record_quietly(
            Some(user),
            "rollback_transaction",
            Detail::new()
                .with("shard", shard)
                .with("discarded_inserts", inserts)
                .with("restored_deletes", deletes)
                .as_str(),
        );
        Ok(())
    }

    fn backup(&self, user: &str, dir: &Path) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(dir)?;
        self.wal.append(
            WalOperation::Backup,
            Detail::new().with("dir", dir.display()),
        )?;

        let target = ShardManager::new(dir, &self.config.name, self.shards.shard_size(), false);
        let mut written = Vec::new();
        for shard in self.shards.list_shards()? {
            let path = target.shard_path(shard);
            self.locks.with_shard(shard, || -> Result<()> {
                fs::copy(self.shards.shard_path(shard), &path)?;
                Ok(())
            })?;
            written.push(path);
        }

        tracing::info!(dir = %dir.display(), shards = written.len(), "backup written");
        self.oplog.record_quietly(
            Some(user),
            "backup",
            Detail::new()
                .with("dir", dir.display())
                .with("shards", written.len())
                .as_str(),
        );
        Ok(written)
    }

    fn restore(&self, user: &str, dir: &Path) -> Result<u64> {
        self.txns.ensure_idle()?;
        let source = ShardManager::new(dir, &self.config.name, self.shards.shard_size(), false);
        let backed_up: BTreeSet<ShardId> = source.list_shards()?.into_iter().collect();

        self.wal.append(
            WalOperation::Restore,
            Detail::new()
                .with("dir", dir.display())
                .with("shards", backed_up.len()),
        )?;

        let mut shards: BTreeSet<ShardId> = self.shards.list_shards()?.into_iter().collect();
        shards.extend(backed_up.iter().copied());
        let shards: Vec<ShardId> = shards.into_iter().collect();

        let state = self.locks.with_shards(&shards, || -> Result<CounterState> {
            for shard in &shards {
                if backed_up.contains(shard) {
                    self.shards.replace_from(*shard, &source.shard_path(*shard))?;
                } else {
                    // Shard files are never deleted, only emptied.
                    self.shards.rewrite_shard(*shard, |_| None)?;
                }
            }

            let mut max_id: Option<u64> = None;
            let mut live = HashSet::new();
            for shard in &shards {
                for entry in self.shards.read_entries(*shard)? {
                    if let RowEntry::Valid(row) = entry {
                        max_id = max_id.max(Some(row.id.0));
                        live.insert(row.id);
                    }
                }
            }
            Ok(self
                .counters
                .reset(max_id.map_or(0, |id| id + 1), live.len() as u64))
        })?;
        self.rebuild_indexes()?;

        tracing::info!(
            dir = %dir.display(),
            live = state.live(),
            next_id = state.insertions,
            "store restored"
        );
        self.oplog.record_quietly(
            Some(user),
            "restore",
            Detail::new()
                .with("dir", dir.display())
                .with("live", state.live())
                .as_str(),
        );
        Ok(state.live())
    }
}

fn join_ids<'a>(ids: impl Iterator<Item = &'a RecordId>) -> String {
    ids.map(|id| id.0.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}
