//! Write-ahead log.
//!
//! Every mutating intent is appended here, one line per entry, before the
//! mutation becomes visible. The log is an audit journal: it is never
//! replayed. Crash consistency comes from atomic shard replacement; on open
//! the log is only consulted for the highest id ever reserved.

use crate::error::{Result, StoreError};
use crate::types::{RecordId, Timestamp};
use parking_lot::Mutex;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Operations recorded in the WAL.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WalOperation {
    Insert,
    BatchInsert,
    Update,
    BatchUpdate,
    Delete,
    BatchDelete,
    Compact,
    CreateShard,
    BeginTransaction,
    CommitTransaction,
    RollbackTransaction,
    Backup,
    Restore,
}

impl WalOperation {
    const ALL: [WalOperation; 13] = [
        WalOperation::Insert,
        WalOperation::BatchInsert,
        WalOperation::Update,
        WalOperation::BatchUpdate,
        WalOperation::Delete,
        WalOperation::BatchDelete,
        WalOperation::Compact,
        WalOperation::CreateShard,
        WalOperation::BeginTransaction,
        WalOperation::CommitTransaction,
        WalOperation::RollbackTransaction,
        WalOperation::Backup,
        WalOperation::Restore,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WalOperation::Insert => "insert",
            WalOperation::BatchInsert => "batch_insert",
            WalOperation::Update => "update",
            WalOperation::BatchUpdate => "batch_update",
            WalOperation::Delete => "delete",
            WalOperation::BatchDelete => "batch_delete",
            WalOperation::Compact => "compact",
            WalOperation::CreateShard => "create_shard",
            WalOperation::BeginTransaction => "begin_transaction",
            WalOperation::CommitTransaction => "commit_transaction",
            WalOperation::RollbackTransaction => "rollback_transaction",
            WalOperation::Backup => "backup",
            WalOperation::Restore => "restore",
        }
    }
}

impl fmt::Display for WalOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WalOperation {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        WalOperation::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| StoreError::InvalidFormat(format!("Unknown WAL operation: {}", s)))
    }
}

/// Builder for `key=value;key=value` detail strings.
#[derive(Clone, Debug, Default)]
pub struct Detail(String);

impl Detail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl fmt::Display) -> Self {
        if !self.0.is_empty() {
            self.0.push(';');
        }
        let value = value.to_string().replace(['\n', '\r', ';'], " ");
        self.0.push_str(key);
        self.0.push('=');
        self.0.push_str(&value);
        self
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Half-open id range `start..end`.
    pub fn with_range(self, key: &str, start: RecordId, end: RecordId) -> Self {
        self.with(key, format!("{}..{}", start.0, end.0))
    }
}

impl From<Detail> for String {
    fn from(detail: Detail) -> Self {
        detail.0
    }
}

/// A single WAL entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalEntry {
    pub timestamp: Timestamp,
    pub operation: WalOperation,
    pub detail: String,
}

impl WalEntry {
    pub fn to_line(&self) -> String {
        format!("{},{},{}", self.timestamp, self.operation, self.detail)
    }

    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.splitn(3, ',');
        let timestamp = parts
            .next()
            .and_then(Timestamp::parse)
            .ok_or_else(|| StoreError::InvalidFormat(format!("Bad WAL timestamp: {}", line)))?;
        let operation = parts
            .next()
            .ok_or_else(|| StoreError::InvalidFormat(format!("Missing WAL operation: {}", line)))?
            .parse()?;
        let detail = parts.next().unwrap_or_default().to_string();
        Ok(Self {
            timestamp,
            operation,
            detail,
        })
    }

    /// Value of `key` in the detail string.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.detail.split(';').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    /// Ids reserved by an insert entry, as a half-open range.
    pub fn reserved_ids(&self) -> Option<(RecordId, RecordId)> {
        match self.operation {
            WalOperation::Insert => {
                let id = self.field("id")?.parse::<u64>().ok()?;
                Some((RecordId(id), RecordId(id + 1)))
            }
            WalOperation::BatchInsert => {
                let (start, end) = self.field("ids")?.split_once("..")?;
                Some((
                    RecordId(start.parse().ok()?),
                    RecordId(end.parse().ok()?),
                ))
            }
            _ => None,
        }
    }
}

/// Append-only write-ahead log file.
pub struct WriteAheadLog {
    /// Path to the WAL file.
    path: PathBuf,

    /// Write handle; holding it is the process-wide log lock.
    writer: Mutex<BufWriter<File>>,

    /// Whether each append is fsynced.
    sync_writes: bool,
}

impl WriteAheadLog {
    /// Create or open a WAL file.
    pub fn open(path: impl AsRef<Path>, sync_writes: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            sync_writes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry. It is on disk when this returns.
    pub fn append(&self, operation: WalOperation, detail: impl Into<String>) -> Result<WalEntry> {
        let entry = WalEntry {
            timestamp: Timestamp::now(),
            operation,
            detail: detail.into(),
        };

        let mut writer = self.writer.lock();
        writer.write_all(entry.to_line().as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        if self.sync_writes {
            writer.get_ref().sync_data()?;
        }
        drop(writer);

        tracing::trace!(operation = %entry.operation, detail = %entry.detail, "wal append");
        Ok(entry)
    }

    /// Read every entry back in append order.
    ///
    /// A torn final line (crash mid-append) is skipped.
    pub fn entries(&self) -> Result<Vec<WalEntry>> {
        let file = File::open(&self.path)?;
        let mut entries = Vec::new();
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match WalEntry::parse(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(line = i + 1, error = %e, "skipping unreadable WAL line"),
            }
        }
        Ok(entries)
    }

    /// Highest id any insert entry ever reserved.
    pub fn max_reserved_id(&self) -> Result<Option<RecordId>> {
        Ok(self
            .entries()?
            .iter()
            .filter_map(WalEntry::reserved_ids)
            .filter(|(start, end)| end > start)
            .map(|(_, end)| RecordId(end.0 - 1))
            .max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_wal_basic() {
        let dir = TempDir::new().unwrap();
        let wal = WriteAheadLog::open(dir.path().join("db_wal.log"), false).unwrap();

        wal.append(
            WalOperation::Insert,
            Detail::new().with("id", 0).with("type", "int").with("shard", 0),
        )
        .unwrap();
        wal.append(WalOperation::Delete, Detail::new().with("id", 0))
            .unwrap();

        let entries = wal.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].operation, WalOperation::Insert);
        assert_eq!(entries[0].detail, "id=0;type=int;shard=0");
        assert_eq!(entries[0].field("type"), Some("int"));
        assert_eq!(entries[1].operation, WalOperation::Delete);
        assert!(entries[0].timestamp <= entries[1].timestamp);
    }

    #[test]
    fn test_wal_line_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db_wal.log");
        let wal = WriteAheadLog::open(&path, true).unwrap();
        wal.append(WalOperation::Compact, Detail::new().with("shard", 3))
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let line = contents.lines().next().unwrap();
        let parts: Vec<&str> = line.splitn(3, ',').collect();
        assert!(Timestamp::parse(parts[0]).is_some());
        assert_eq!(parts[1], "compact");
        assert_eq!(parts[2], "shard=3");
    }

    #[test]
    fn test_wal_persistence_and_reserved_ids() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db_wal.log");

        {
            let wal = WriteAheadLog::open(&path, false).unwrap();
            wal.append(WalOperation::Insert, Detail::new().with("id", 4))
                .unwrap();
            wal.append(
                WalOperation::BatchInsert,
                Detail::new().with_range("ids", RecordId(5), RecordId(9)),
            )
            .unwrap();
            wal.append(WalOperation::Delete, Detail::new().with("id", 8))
                .unwrap();
        }

        let wal = WriteAheadLog::open(&path, false).unwrap();
        assert_eq!(wal.entries().unwrap().len(), 3);
        assert_eq!(wal.max_reserved_id().unwrap(), Some(RecordId(8)));
    }

    #[test]
    fn test_torn_tail_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db_wal.log");
        let wal = WriteAheadLog::open(&path, false).unwrap();
        wal.append(WalOperation::Insert, Detail::new().with("id", 1))
            .unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"2024-01-0").unwrap();

        assert_eq!(wal.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_detail_values_cannot_break_lines() {
        let detail: String = Detail::new().with("path", "a\nb;c").into();
        assert_eq!(detail, "path=a b c");
    }

    #[test]
    fn test_concurrent_appends_do_not_interleave() {
        let dir = TempDir::new().unwrap();
        let wal = Arc::new(WriteAheadLog::open(dir.path().join("db_wal.log"), false).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let wal = Arc::clone(&wal);
                thread::spawn(move || {
                    for i in 0..50 {
                        wal.append(
                            WalOperation::Update,
                            Detail::new().with("id", t * 1000 + i).with("pad", "x".repeat(200)),
                        )
                        .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let entries = wal.entries().unwrap();
        assert_eq!(entries.len(), 400);
        assert!(entries.iter().all(|e| e.field("pad").map(str::len) == Some(200)));
    }
}
