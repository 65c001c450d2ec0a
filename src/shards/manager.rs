//! Shard file management.

use super::row::{RowEntry, ShardRow, HEADER};
use crate::error::{Result, StoreError};
use crate::types::{RecordId, ShardId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Suffix of a transaction staging copy.
pub const STAGING_SUFFIX: &str = "txn";

/// Suffix of a rewrite in progress.
const REWRITE_SUFFIX: &str = "tmp";

/// Maps record ids to shard files and performs whole-shard rewrites.
///
/// Callers serialize access to a shard through its shard lock; the manager
/// itself only guarantees that a file opened by name is never half-written.
pub struct ShardManager {
    /// Directory holding the shard files.
    dir: PathBuf,

    /// File prefix.
    name: String,

    /// Ids per shard.
    shard_size: u64,

    /// Whether appends and rewrites are fsynced.
    sync_writes: bool,

    /// Shards whose reads and writes go to a staging file instead.
    redirects: RwLock<HashMap<ShardId, PathBuf>>,
}

impl ShardManager {
    pub fn new(dir: impl AsRef<Path>, name: &str, shard_size: u64, sync_writes: bool) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            name: name.to_string(),
            shard_size,
            sync_writes,
            redirects: RwLock::new(HashMap::new()),
        }
    }

    pub fn shard_size(&self) -> u64 {
        self.shard_size
    }

    /// The shard owning `id`.
    pub fn shard_of(&self, id: RecordId) -> ShardId {
        id.shard(self.shard_size)
    }

    /// Path of the committed shard file.
    pub fn shard_path(&self, shard: ShardId) -> PathBuf {
        self.dir.join(format!("{}_shard_{}.csv", self.name, shard.0))
    }

    /// Path of the staging copy used while a transaction targets `shard`.
    pub fn staging_path(&self, shard: ShardId) -> PathBuf {
        with_suffix(&self.shard_path(shard), STAGING_SUFFIX)
    }

    /// Path reads and writes of `shard` currently go to.
    pub fn active_path(&self, shard: ShardId) -> PathBuf {
        self.redirects
            .read()
            .get(&shard)
            .cloned()
            .unwrap_or_else(|| self.shard_path(shard))
    }

    /// Send reads and writes of `shard` to `path` until cleared.
    pub fn redirect(&self, shard: ShardId, path: PathBuf) {
        self.redirects.write().insert(shard, path);
    }

    pub fn clear_redirect(&self, shard: ShardId) {
        self.redirects.write().remove(&shard);
    }

    pub fn exists(&self, shard: ShardId) -> bool {
        self.active_path(shard).exists()
    }

    /// Create the shard with just a header if it is missing.
    ///
    /// Returns whether the file was created.
    pub fn ensure_shard_exists(&self, shard: ShardId) -> Result<bool> {
        let path = self.active_path(shard);
        if path.exists() {
            return Ok(false);
        }
        self.write_atomically(&path, std::iter::empty::<String>())?;
        tracing::debug!(shard = shard.0, path = %path.display(), "created shard");
        Ok(true)
    }

    /// All rows of a shard in file order. A missing shard has no rows.
    pub fn read_entries(&self, shard: ShardId) -> Result<Vec<RowEntry>> {
        read_entries_at(&self.active_path(shard))
    }

    /// Find the row holding `id`.
    ///
    /// Corrupt rows are skipped unless their leading id is `id`.
    pub fn find(&self, shard: ShardId, id: RecordId) -> Result<Option<ShardRow>> {
        let entries = self.read_entries(shard)?;
        Ok(find_in(&entries, shard, id)?.cloned())
    }

    /// Append rows to the end of a shard, creating it first if needed.
    pub fn append_rows(&self, shard: ShardId, rows: &[ShardRow]) -> Result<()> {
        self.ensure_shard_exists(shard)?;
        let path = self.active_path(shard);

        let mut buf = String::new();
        for row in rows {
            buf.push_str(&row.to_line());
            buf.push('\n');
        }

        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(buf.as_bytes())?;
        if self.sync_writes {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Rewrite a shard through `transform`.
    ///
    /// Every row is passed in file order; returning `None` drops it. The new
    /// contents are written next to the shard and renamed over it, so a
    /// reader opening the shard by name sees either the old or the new file.
    /// A missing shard is left missing.
    pub fn rewrite_shard<F>(&self, shard: ShardId, mut transform: F) -> Result<()>
    where
        F: FnMut(RowEntry) -> Option<RowEntry>,
    {
        let path = self.active_path(shard);
        if !path.exists() {
            return Ok(());
        }
        let entries = read_entries_at(&path)?;
        let kept: Vec<RowEntry> = entries.into_iter().filter_map(&mut transform).collect();
        self.write_atomically(&path, kept.iter().map(RowEntry::to_line))
    }

    /// Replace the committed shard file with the contents of `source`.
    pub fn replace_from(&self, shard: ShardId, source: &Path) -> Result<()> {
        let path = self.shard_path(shard);
        let tmp = with_suffix(&path, REWRITE_SUFFIX);
        fs::copy(source, &tmp)?;
        if self.sync_writes {
            File::open(&tmp)?.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Copy the committed shard to its staging file and redirect to it.
    ///
    /// The committed file is created first if missing.
    pub fn stage(&self, shard: ShardId) -> Result<PathBuf> {
        let primary = self.shard_path(shard);
        if !primary.exists() {
            self.write_atomically(&primary, std::iter::empty::<String>())?;
        }
        let staging = self.staging_path(shard);
        fs::copy(&primary, &staging)?;
        if self.sync_writes {
            File::open(&staging)?.sync_all()?;
        }
        self.redirect(shard, staging.clone());
        Ok(staging)
    }

    /// Rename the staging file over the committed shard.
    pub fn promote_staging(&self, shard: ShardId) -> Result<()> {
        fs::rename(self.staging_path(shard), self.shard_path(shard))?;
        self.clear_redirect(shard);
        Ok(())
    }

    /// Remove the staging file, leaving the committed shard untouched.
    pub fn discard_staging(&self, shard: ShardId) -> Result<()> {
        self.clear_redirect(shard);
        match fs::remove_file(self.staging_path(shard)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Staging files left behind in the directory.
    pub fn leftover_staging(&self) -> Result<Vec<PathBuf>> {
        let prefix = format!("{}_shard_", self.name);
        let suffix = format!(".csv.{}", STAGING_SUFFIX);
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name.starts_with(&prefix) && file_name.ends_with(&suffix) {
                found.push(entry.path());
            }
        }
        found.sort();
        Ok(found)
    }

    /// Committed shards present on disk, ascending.
    pub fn list_shards(&self) -> Result<Vec<ShardId>> {
        let prefix = format!("{}_shard_", self.name);
        let mut shards = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(number) = file_name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".csv"))
                .and_then(|n| n.parse::<u64>().ok())
            {
                shards.push(ShardId(number));
            }
        }
        shards.sort();
        Ok(shards)
    }

    fn write_atomically<I>(&self, path: &Path, lines: I) -> Result<()>
    where
        I: Iterator<Item = String>,
    {
        let tmp = with_suffix(path, REWRITE_SUFFIX);
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            writer.write_all(HEADER.as_bytes())?;
            writer.write_all(b"\n")?;
            for line in lines {
                writer.write_all(line.as_bytes())?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
            if self.sync_writes {
                writer.get_ref().sync_all()?;
            }
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// [`ShardManager::find`] over rows already read from `shard`.
pub fn find_in(entries: &[RowEntry], shard: ShardId, id: RecordId) -> Result<Option<&ShardRow>> {
    for entry in entries {
        match entry {
            RowEntry::Valid(row) if row.id == id => return Ok(Some(row)),
            RowEntry::Corrupt(corrupt) if corrupt.leading_id() == Some(id) => {
                return Err(StoreError::ShardCorruption {
                    shard,
                    detail: corrupt.to_string(),
                });
            }
            _ => {}
        }
    }
    Ok(None)
}

/// Read all rows of the shard file at `path`, skipping the header.
pub(crate) fn read_entries_at(path: &Path) -> Result<Vec<RowEntry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut entries = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line_number = i + 1;
        if line_number == 1 && line.trim_end() == HEADER {
            continue;
        }
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        entries.push(RowEntry::read(line_number, line));
    }
    Ok(entries)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".");
    os.push(suffix);
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeTag;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, shard_size: u64) -> ShardManager {
        ShardManager::new(dir.path(), "db", shard_size, false)
    }

    fn row(id: u64) -> ShardRow {
        ShardRow::new(RecordId(id), TypeTag::Int, format!("c2VhbGVk{}", id))
    }

    fn ids(entries: &[RowEntry]) -> Vec<u64> {
        entries
            .iter()
            .filter_map(|e| e.as_valid().map(|r| r.id.0))
            .collect()
    }

    #[test]
    fn test_shard_file_naming() {
        let dir = TempDir::new().unwrap();
        let shards = manager(&dir, 1000);
        assert_eq!(
            shards.shard_path(ShardId(4)).file_name().unwrap(),
            "db_shard_4.csv"
        );
        assert_eq!(
            shards.staging_path(ShardId(4)).file_name().unwrap(),
            "db_shard_4.csv.txn"
        );
    }

    #[test]
    fn test_append_creates_shard_with_header() {
        let dir = TempDir::new().unwrap();
        let shards = manager(&dir, 2);

        shards.append_rows(ShardId(0), &[row(0), row(1)]).unwrap();
        shards.append_rows(ShardId(1), &[row(2)]).unwrap();

        let contents = fs::read_to_string(shards.shard_path(ShardId(0))).unwrap();
        assert!(contents.starts_with("ID,Type,Value\n0,int,"));
        assert_eq!(ids(&shards.read_entries(ShardId(0)).unwrap()), vec![0, 1]);
        assert_eq!(ids(&shards.read_entries(ShardId(1)).unwrap()), vec![2]);
        assert_eq!(shards.list_shards().unwrap(), vec![ShardId(0), ShardId(1)]);
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let shards = manager(&dir, 10);
        assert!(shards.ensure_shard_exists(ShardId(3)).unwrap());
        shards.append_rows(ShardId(3), &[row(30)]).unwrap();
        assert!(!shards.ensure_shard_exists(ShardId(3)).unwrap());
        assert_eq!(ids(&shards.read_entries(ShardId(3)).unwrap()), vec![30]);
    }

    #[test]
    fn test_missing_shard_reads_empty() {
        let dir = TempDir::new().unwrap();
        let shards = manager(&dir, 10);
        assert!(shards.read_entries(ShardId(9)).unwrap().is_empty());
        assert!(shards.find(ShardId(9), RecordId(90)).unwrap().is_none());
        shards.rewrite_shard(ShardId(9), Some).unwrap();
        assert!(!shards.exists(ShardId(9)));
    }

    #[test]
    fn test_rewrite_replaces_and_filters() {
        let dir = TempDir::new().unwrap();
        let shards = manager(&dir, 10);
        shards
            .append_rows(ShardId(0), &[row(1), row(2), row(3)])
            .unwrap();

        shards
            .rewrite_shard(ShardId(0), |entry| match entry {
                RowEntry::Valid(r) if r.id == RecordId(2) => None,
                RowEntry::Valid(mut r) if r.id == RecordId(3) => {
                    r.sealed = "bmV3".into();
                    Some(RowEntry::Valid(r))
                }
                other => Some(other),
            })
            .unwrap();

        let entries = shards.read_entries(ShardId(0)).unwrap();
        assert_eq!(ids(&entries), vec![1, 3]);
        assert_eq!(
            shards.find(ShardId(0), RecordId(3)).unwrap().unwrap().sealed,
            "bmV3"
        );
        assert!(!with_suffix(&shards.shard_path(ShardId(0)), REWRITE_SUFFIX).exists());
    }

    #[test]
    fn test_corrupt_rows_survive_rewrites() {
        let dir = TempDir::new().unwrap();
        let shards = manager(&dir, 10);
        shards.append_rows(ShardId(0), &[row(1)]).unwrap();
        let path = shards.shard_path(ShardId(0));
        let mut contents = fs::read_to_string(&path).unwrap();
        contents.push_str("5,int\n");
        fs::write(&path, contents).unwrap();

        shards.rewrite_shard(ShardId(0), Some).unwrap();
        let entries = shards.read_entries(ShardId(0)).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[1], RowEntry::Corrupt(_)));

        assert!(shards.find(ShardId(0), RecordId(1)).unwrap().is_some());
        assert!(matches!(
            shards.find(ShardId(0), RecordId(5)),
            Err(StoreError::ShardCorruption { shard: ShardId(0), .. })
        ));
    }

    #[test]
    fn test_redirect_switches_active_file() {
        let dir = TempDir::new().unwrap();
        let shards = manager(&dir, 10);
        shards.append_rows(ShardId(0), &[row(1)]).unwrap();

        let staging = shards.staging_path(ShardId(0));
        fs::copy(shards.shard_path(ShardId(0)), &staging).unwrap();
        shards.redirect(ShardId(0), staging.clone());

        shards.append_rows(ShardId(0), &[row(2)]).unwrap();
        assert_eq!(ids(&shards.read_entries(ShardId(0)).unwrap()), vec![1, 2]);
        assert_eq!(ids(&read_entries_at(&shards.shard_path(ShardId(0))).unwrap()), vec![1]);

        shards.clear_redirect(ShardId(0));
        assert_eq!(ids(&shards.read_entries(ShardId(0)).unwrap()), vec![1]);
        // Staging files are not listed as shards.
        assert_eq!(shards.list_shards().unwrap(), vec![ShardId(0)]);
    }

    #[test]
    fn test_stage_promote_and_discard() {
        let dir = TempDir::new().unwrap();
        let shards = manager(&dir, 10);
        shards.append_rows(ShardId(0), &[row(1)]).unwrap();
        let before = fs::read(shards.shard_path(ShardId(0))).unwrap();

        shards.stage(ShardId(0)).unwrap();
        shards.append_rows(ShardId(0), &[row(2)]).unwrap();
        assert_eq!(shards.leftover_staging().unwrap().len(), 1);
        shards.discard_staging(ShardId(0)).unwrap();
        assert_eq!(fs::read(shards.shard_path(ShardId(0))).unwrap(), before);
        assert!(shards.leftover_staging().unwrap().is_empty());

        shards.stage(ShardId(0)).unwrap();
        shards.append_rows(ShardId(0), &[row(3)]).unwrap();
        shards.promote_staging(ShardId(0)).unwrap();
        assert_eq!(ids(&shards.read_entries(ShardId(0)).unwrap()), vec![1, 3]);
        assert!(!shards.staging_path(ShardId(0)).exists());
    }

    #[test]
    fn test_staging_a_missing_shard_creates_it() {
        let dir = TempDir::new().unwrap();
        let shards = manager(&dir, 10);
        shards.stage(ShardId(2)).unwrap();
        assert!(shards.shard_path(ShardId(2)).exists());
        assert_eq!(shards.active_path(ShardId(2)), shards.staging_path(ShardId(2)));
    }

    proptest! {
        #[test]
        fn prop_shard_of_is_integer_division(id in any::<u64>(), size in 1u64..100_000) {
            let shards = ShardManager::new(".", "db", size, false);
            let shard = shards.shard_of(RecordId(id));
            prop_assert_eq!(shard, ShardId(id / size));
            prop_assert!(shard.contains(RecordId(id), size));
            prop_assert_eq!(shards.shard_of(RecordId(id)), shard);
        }
    }
}
