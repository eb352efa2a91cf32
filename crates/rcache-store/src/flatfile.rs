//! Directory-of-files backend.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/lock             advisory lock serializing writers
//! <root>/used             journal, one `<kind>...<key>` line per used key
//! <root>/<kind>/<key>.rec one file per record
//! ```
//!
//! Keys are escaped into file names (`%XX` for anything outside
//! `[A-Za-z0-9_-]`), so arbitrary key text round-trips through
//! [`Backend::list_keys`]. Records are written to a temporary file in the
//! same directory and renamed into place while the exclusive lock is held.

use std::collections::{BTreeSet, HashSet};
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};

use rcache_error::{RcacheError, Result};
use rcache_types::RecordKind;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::lock::StoreLock;

const RECORD_EXTENSION: &str = "rec";
const USED_SEPARATOR: &str = "...";

/// File-per-record [`Backend`] rooted at a cache directory.
#[derive(Debug, Clone)]
pub struct FlatFileBackend {
    root: PathBuf,
    lock: StoreLock,
}

impl FlatFileBackend {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| io_error(&root, &err))?;
        for kind in RecordKind::ALL {
            let dir = root.join(kind.label());
            fs::create_dir_all(&dir).map_err(|err| io_error(&dir, &err))?;
        }
        let lock = StoreLock::new(root.join("lock"));
        debug!(root = %root.display(), "flat-file store opened");
        Ok(Self { root, lock })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, kind: RecordKind, key: &str) -> PathBuf {
        self.root
            .join(kind.label())
            .join(format!("{}.{RECORD_EXTENSION}", escape_key(key)))
    }

    fn used_path(&self) -> PathBuf {
        self.root.join("used")
    }

    fn write_record_locked(&self, kind: RecordKind, key: &str, record: &[u8]) -> Result<()> {
        let path = self.record_path(kind, key);
        let dir = self.root.join(kind.label());
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|err| io_error(&dir, &err))?;
        tmp.write_all(record).map_err(|err| io_error(&path, &err))?;
        tmp.as_file()
            .sync_data()
            .map_err(|err| io_error(&path, &err))?;
        tmp.persist(&path)
            .map_err(|err| io_error(&path, &err.error))?;
        Ok(())
    }

    fn delete_record_locked(&self, kind: RecordKind, key: &str) -> Result<bool> {
        let path = self.record_path(kind, key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_error(&path, &err)),
        }
    }

    fn read_record_locked(&self, kind: RecordKind, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.record_path(kind, key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(&path, &err)),
        }
    }

    fn read_journal_locked(&self) -> Result<String> {
        let path = self.used_path();
        match fs::read_to_string(&path) {
            Ok(text) => Ok(text),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(io_error(&path, &err)),
        }
    }

    /// Append journal lines for `keys` not already present. The journal is
    /// a set: each `(kind, key)` appears at most once between resets.
    fn journal_locked(&self, kind: RecordKind, keys: &[String]) -> Result<()> {
        let existing = self.read_journal_locked()?;
        let present: HashSet<&str> = existing.lines().map(str::trim_end).collect();
        let mut pending = String::new();
        let mut queued = HashSet::new();
        for key in keys {
            let line = format!("{}{USED_SEPARATOR}{}", kind.label(), escape_key(key));
            if present.contains(line.as_str()) || !queued.insert(line.clone()) {
                continue;
            }
            pending.push_str(&line);
            pending.push('\n');
        }
        if pending.is_empty() {
            return Ok(());
        }
        let path = self.used_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| io_error(&path, &err))?;
        file.write_all(pending.as_bytes())
            .map_err(|err| io_error(&path, &err))
    }
}

impl Backend for FlatFileBackend {
    fn describe(&self) -> String {
        format!("flatfile:{}", self.root.display())
    }

    fn put(&self, kind: RecordKind, key: &str, record: &[u8]) -> Result<()> {
        let _guard = self.lock.exclusive()?;
        self.write_record_locked(kind, key, record)
    }

    fn get(&self, kind: RecordKind, key: &str) -> Result<Option<Vec<u8>>> {
        let _guard = self.lock.shared()?;
        self.read_record_locked(kind, key)
    }

    fn delete(&self, kind: RecordKind, key: &str) -> Result<bool> {
        let _guard = self.lock.exclusive()?;
        self.delete_record_locked(kind, key)
    }

    fn contains(&self, kind: RecordKind, key: &str) -> Result<bool> {
        let _guard = self.lock.shared()?;
        Ok(self.record_path(kind, key).is_file())
    }

    fn list_keys(&self, kind: RecordKind) -> Result<Vec<String>> {
        let _guard = self.lock.shared()?;
        let dir = self.root.join(kind.label());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error(&dir, &err)),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| io_error(&dir, &err))?;
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != RECORD_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match unescape_key(stem) {
                Some(key) => keys.push(key),
                None => warn!(file = %path.display(), "skipping record with undecodable name"),
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn mark_used(&self, kind: RecordKind, key: &str) -> Result<()> {
        self.mark_used_all(kind, &[key.to_owned()])
    }

    fn mark_used_all(&self, kind: RecordKind, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.exclusive()?;
        self.journal_locked(kind, keys)
    }

    fn list_used(&self, kind: RecordKind) -> Result<BTreeSet<String>> {
        let _guard = self.lock.shared()?;
        let text = self.read_journal_locked()?;
        let mut used = BTreeSet::new();
        for line in text.lines() {
            let Some((label, escaped)) = line.split_once(USED_SEPARATOR) else {
                continue;
            };
            if RecordKind::from_label(label) != Some(kind) {
                continue;
            }
            if let Some(key) = unescape_key(escaped.trim_end()) {
                used.insert(key);
            }
        }
        Ok(used)
    }

    fn reset_used(&self) -> Result<()> {
        let _guard = self.lock.exclusive()?;
        let path = self.used_path();
        fs::write(&path, b"").map_err(|err| io_error(&path, &err))
    }

    fn get_run(&self, kind: RecordKind, key_for: &dyn Fn(u32) -> String) -> Result<Vec<Vec<u8>>> {
        let _guard = self.lock.shared()?;
        let mut records = Vec::new();
        for number in 0_u32.. {
            match self.read_record_locked(kind, &key_for(number))? {
                Some(record) => records.push(record),
                None => break,
            }
        }
        Ok(records)
    }

    fn replace_run(
        &self,
        kind: RecordKind,
        key_for: &dyn Fn(u32) -> String,
        fresh: &[(String, Vec<u8>)],
    ) -> Result<usize> {
        let _guard = self.lock.exclusive()?;
        let mut removed = 0;
        for number in 0_u32.. {
            if !self.delete_record_locked(kind, &key_for(number))? {
                break;
            }
            removed += 1;
        }
        for (key, record) in fresh {
            self.write_record_locked(kind, key, record)?;
        }
        Ok(removed)
    }
}

fn io_error(path: &Path, err: &std::io::Error) -> RcacheError {
    RcacheError::storage(format!("{}: {err}", path.display()))
}

/// Escape a key into a portable file stem.
fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

fn unescape_key(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%' {
            let hex = stem.get(idx + 1..idx + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            idx += 3;
        } else {
            out.push(bytes[idx]);
            idx += 1;
        }
    }
    String::from_utf8(out).ok()
}
