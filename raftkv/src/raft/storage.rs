//! On-disk log store.
//!
//! The data directory holds rotating changelog segments (`changelog.<n>`),
//! snapshot files (`snapshot.<n>`) and the vote file. A changelog starts with
//! a single i64 header, the durable timestamp at the time the segment was
//! opened, followed by framed records. A snapshot is `{size, applied_ts}`
//! followed by exactly `size` single-operation records.

use crate::raft::framed::FramedFile;
use crate::raft::pb::{LogRecord, Operation};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

const CHANGELOG_PREFIX: &str = "changelog.";
const SNAPSHOT_PREFIX: &str = "snapshot.";

/// Naming, discovery and snapshot codec for the data directory.
#[derive(Clone)]
pub struct LogStore {
    dir: PathBuf,
}

impl LogStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(LogStore {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    pub fn vote_path(&self) -> PathBuf {
        self.dir.join("vote")
    }

    pub fn changelog_path(&self, number: u64) -> PathBuf {
        self.dir.join(format!("{}{}", CHANGELOG_PREFIX, number))
    }

    pub fn snapshot_path(&self, number: u64) -> PathBuf {
        self.dir.join(format!("{}{}", SNAPSHOT_PREFIX, number))
    }

    fn parse_name(prefix: &str, name: &str) -> Option<u64> {
        let suffix = name.strip_prefix(prefix)?;
        if suffix.is_empty() || !suffix.bytes().all(|c| c.is_ascii_digit()) {
            return None;
        }
        suffix.parse().ok()
    }

    fn discover(&self, prefix: &str) -> io::Result<Vec<u64>> {
        let mut numbers = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(number) = Self::parse_name(prefix, &entry.file_name().to_string_lossy()) {
                numbers.push(number);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    /// Changelog segment numbers, ascending.
    pub fn discover_changelogs(&self) -> io::Result<Vec<u64>> {
        self.discover(CHANGELOG_PREFIX)
    }

    /// Snapshot numbers, ascending.
    pub fn discover_snapshots(&self) -> io::Result<Vec<u64>> {
        self.discover(SNAPSHOT_PREFIX)
    }

    /// Open segment `number` for appending. The caller writes the header.
    pub fn create_changelog(&self, number: u64) -> io::Result<FramedFile> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.changelog_path(number))?;
        Ok(FramedFile::new(file))
    }

    pub fn open_changelog(&self, number: u64) -> io::Result<FramedFile> {
        Ok(FramedFile::new(fs::File::open(self.changelog_path(number))?))
    }

    pub fn create_snapshot(&self, number: u64) -> io::Result<FramedFile> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.snapshot_path(number))?;
        Ok(FramedFile::new(file))
    }

    /// Decode snapshot `number` into `fsm`. Returns the captured applied
    /// timestamp, or `None` when the file is missing, unreadable or
    /// truncated.
    pub fn read_snapshot(
        &self,
        number: u64,
        fsm: &mut BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> io::Result<Option<i64>> {
        let file = match fs::File::open(self.snapshot_path(number)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut input = FramedFile::new(file);
        let size = match input.read_i64()? {
            Some(size) => size,
            None => return Ok(None),
        };
        let applied_ts = match input.read_i64()? {
            Some(applied_ts) => applied_ts,
            None => return Ok(None),
        };
        for _ in 0..size {
            match input.read_record::<LogRecord>()? {
                Some(record) => {
                    for op in record.operations {
                        fsm.insert(op.key, op.value);
                    }
                }
                None => return Ok(None),
            }
        }
        Ok(Some(applied_ts))
    }

    /// Checkpoint `fsm` as of `applied_ts` into `snapshot.<applied_ts>`.
    pub fn write_snapshot(
        &self,
        applied_ts: i64,
        fsm: &BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> io::Result<()> {
        let mut out = self.create_snapshot(applied_ts as u64)?;
        out.write_i64(fsm.len() as i64)?;
        out.write_i64(applied_ts)?;
        for (key, value) in fsm {
            let record = LogRecord {
                ts: 0,
                operations: vec![Operation {
                    key: key.clone(),
                    value: value.clone(),
                }],
            };
            out.write_record(&record)?;
        }
        out.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn map(entries: &[(&str, &str)]) -> BTreeMap<Vec<u8>, Vec<u8>> {
        entries
            .iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn test_discovery_ignores_unrelated_names() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new(dir.path()).unwrap();

        for name in [
            "changelog.0",
            "changelog.2",
            "changelog.x",
            "changelog.",
            "snapshot.7",
            "notes.txt",
            "vote",
        ] {
            fs::write(dir.path().join(name), b"").unwrap();
        }

        assert_eq!(store.discover_changelogs().unwrap(), vec![0, 2]);
        assert_eq!(store.discover_snapshots().unwrap(), vec![7]);
    }

    #[test]
    fn test_changelog_header_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new(dir.path()).unwrap();

        let mut out = store.create_changelog(3).unwrap();
        out.write_i64(41).unwrap();
        out.sync().unwrap();

        let mut input = store.open_changelog(3).unwrap();
        assert_eq!(input.read_i64().unwrap(), Some(41));
        assert_eq!(input.read_record::<LogRecord>().unwrap(), None);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new(dir.path()).unwrap();

        let fsm = map(&[("a", "1"), ("b", "2"), ("c", "3")]);
        store.write_snapshot(9, &fsm).unwrap();
        assert_eq!(store.discover_snapshots().unwrap(), vec![9]);

        let mut recovered = BTreeMap::new();
        let applied_ts = store.read_snapshot(9, &mut recovered).unwrap();
        assert_eq!(applied_ts, Some(9));
        assert_eq!(recovered, fsm);
    }

    #[test]
    fn test_truncated_snapshot_is_invalid() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new(dir.path()).unwrap();

        store
            .write_snapshot(4, &map(&[("a", "1"), ("b", "2")]))
            .unwrap();
        let path = store.snapshot_path(4);
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let len = file.metadata().unwrap().len();
        file.set_len(len - 2).unwrap();

        let mut recovered = BTreeMap::new();
        assert_eq!(store.read_snapshot(4, &mut recovered).unwrap(), None);
    }

    #[test]
    fn test_missing_snapshot_is_invalid() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new(dir.path()).unwrap();

        let mut recovered = BTreeMap::new();
        assert_eq!(store.read_snapshot(11, &mut recovered).unwrap(), None);
    }
}
