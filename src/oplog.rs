//! Operation log.
//!
//! A CSV audit trail of completed operations, separate from the WAL: the
//! WAL records intents, this file records who did what and how it ended.

use crate::error::{Result, StoreError};
use crate::types::Timestamp;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Header row of the operation log.
pub const LOG_HEADER: &str = "Timestamp,User,Operation,Details";

/// User recorded when no session is active.
pub const SYSTEM_USER: &str = "System";

/// One operation log line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: Timestamp,
    pub user: String,
    pub operation: String,
    pub details: String,
}

impl LogEntry {
    pub fn to_line(&self) -> String {
        format!(
            "{},{},{},{}",
            self.timestamp, self.user, self.operation, self.details
        )
    }

    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.splitn(4, ',');
        let timestamp = parts
            .next()
            .and_then(Timestamp::parse)
            .ok_or_else(|| StoreError::InvalidFormat(format!("Bad log timestamp: {}", line)))?;
        let (user, operation) = match (parts.next(), parts.next()) {
            (Some(user), Some(operation)) => (user.to_string(), operation.to_string()),
            _ => {
                return Err(StoreError::InvalidFormat(format!(
                    "Truncated log line: {}",
                    line
                )))
            }
        };
        Ok(Self {
            timestamp,
            user,
            operation,
            details: parts.next().unwrap_or_default().to_string(),
        })
    }
}

/// Append-only operation log file.
pub struct OperationLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl OperationLog {
    /// Create or open the log, writing the header into a new file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let fresh = file.metadata()?.len() == 0;

        let mut writer = BufWriter::new(file);
        if fresh {
            writeln!(writer, "{}", LOG_HEADER)?;
            writer.flush()?;
        }

        Ok(Self {
            path,
            writer: Mutex::new(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry. `user` is `None` for system-initiated work.
    pub fn record(&self, user: Option<&str>, operation: &str, details: &str) -> Result<()> {
        let entry = LogEntry {
            timestamp: Timestamp::now(),
            user: clean(user.unwrap_or(SYSTEM_USER)).replace(',', " "),
            operation: clean(operation).replace(',', " "),
            details: clean(details),
        };

        let mut writer = self.writer.lock();
        writer.write_all(entry.to_line().as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Append one entry, reporting but not propagating a failure.
    ///
    /// Used on paths that are already failing or whose result must not
    /// depend on the audit file.
    pub fn record_quietly(&self, user: Option<&str>, operation: &str, details: &str) {
        if let Err(e) = self.record(user, operation, details) {
            tracing::error!(error = %e, operation, "failed to write operation log");
        }
    }

    /// All entries after the header.
    pub fn entries(&self) -> Result<Vec<LogEntry>> {
        let file = File::open(&self.path)?;
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines().skip(1) {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(LogEntry::parse(&line)?);
        }
        Ok(entries)
    }
}

fn clean(text: &str) -> String {
    text.replace(['\n', '\r'], " ")
}
