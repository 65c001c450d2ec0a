//! Shard row format.

use crate::types::{RecordId, TypeTag};
use std::fmt;

/// First line of every shard file.
pub const HEADER: &str = "ID,Type,Value";

/// Columns in every row.
pub const COLUMNS: usize = 3;

/// A well-formed row: `<id>,<type_tag>,<sealed_text>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardRow {
    pub id: RecordId,
    pub tag: TypeTag,
    /// Sealed payload text (base64, never contains a comma).
    pub sealed: String,
}

impl ShardRow {
    pub fn new(id: RecordId, tag: TypeTag, sealed: String) -> Self {
        Self { id, tag, sealed }
    }

    /// Render as a line without the trailing newline.
    pub fn to_line(&self) -> String {
        format!("{},{},{}", self.id.0, self.tag, self.sealed)
    }

    /// Parse one line.
    pub fn parse(line: &str) -> Result<Self, String> {
        let columns: Vec<&str> = line.split(',').collect();
        if columns.len() != COLUMNS {
            return Err(format!(
                "expected {} columns, found {}",
                COLUMNS,
                columns.len()
            ));
        }
        let id = columns[0]
            .trim()
            .parse::<u64>()
            .map_err(|_| format!("invalid id {:?}", columns[0]))?;
        let tag = columns[1]
            .trim()
            .parse::<TypeTag>()
            .map_err(|_| format!("unknown type tag {:?}", columns[1]))?;
        let sealed = columns[2].trim();
        if sealed.is_empty() {
            return Err("empty value column".into());
        }
        Ok(Self::new(RecordId(id), tag, sealed.to_string()))
    }
}

/// A row that failed to parse, kept verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorruptRow {
    /// 1-based line number in the shard file (the header is line 1).
    pub line: usize,
    pub raw: String,
    pub reason: String,
}

impl CorruptRow {
    /// The id in the first column, if it still parses.
    pub fn leading_id(&self) -> Option<RecordId> {
        self.raw
            .split(',')
            .next()
            .and_then(|first| first.trim().parse::<u64>().ok())
            .map(RecordId)
    }
}

impl fmt::Display for CorruptRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.leading_id() {
            Some(id) => write!(f, "line {} (row {}): {}", self.line, id, self.reason),
            None => write!(f, "line {}: {}", self.line, self.reason),
        }
    }
}

/// One line of a shard as read from disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RowEntry {
    Valid(ShardRow),
    Corrupt(CorruptRow),
}

impl RowEntry {
    pub fn read(line_number: usize, line: &str) -> Self {
        match ShardRow::parse(line) {
            Ok(row) => RowEntry::Valid(row),
            Err(reason) => RowEntry::Corrupt(CorruptRow {
                line: line_number,
                raw: line.to_string(),
                reason,
            }),
        }
    }

    pub fn to_line(&self) -> String {
        match self {
            RowEntry::Valid(row) => row.to_line(),
            RowEntry::Corrupt(corrupt) => corrupt.raw.clone(),
        }
    }

    pub fn as_valid(&self) -> Option<&ShardRow> {
        match self {
            RowEntry::Valid(row) => Some(row),
            RowEntry::Corrupt(_) => None,
        }
    }
}
