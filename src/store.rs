//! JSON-file log store.
//!
//! Single source of truth for attempt records. The whole document is read on
//! open and rewritten on flush/close; there is no incremental write and no
//! support for concurrent writers on the same path (last writer wins).
//!
//! On disk the log is `{"log": [[key, record], ...]}`. Keys are JSON arrays
//! because JSON objects only allow text keys.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{ArgKey, AttemptRecord};
use crate::telemetry::metrics;

/// Top-level field holding the `[key, record]` pairs.
pub const LOG_FIELD: &str = "log";

/// Log file used when none is configured.
pub const DEFAULT_LOG_PATH: &str = "default-log.json";

type Entries = IndexMap<ArgKey, AttemptRecord>;

/// Ordered, file-backed map from argument key to attempt record.
///
/// Every accessor fails with [`Error::StoreNotOpen`] outside the window
/// between [`LogStore::open`] and [`LogStore::close`].
#[derive(Debug)]
pub struct LogStore {
    path: PathBuf,
    entries: Option<Entries>,
    read_only: bool,
}

impl LogStore {
    /// A closed store bound to `path`. Nothing is read until [`LogStore::open`].
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            entries: None,
            read_only: false,
        }
    }

    /// Create a store at `path` and open it.
    pub fn open_at(path: impl AsRef<Path>) -> Result<Self> {
        let mut store = Self::new(path);
        store.open()?;
        Ok(store)
    }

    /// Load `path` for inspection only.
    ///
    /// The file is never written: a missing file is [`Error::Io`], a
    /// malformed one is [`Error::MalformedStore`], [`LogStore::flush`] is
    /// [`Error::ReadOnly`] and [`LogStore::close`] discards the records.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let mut store = Self::new(path);
        store.read_only = true;
        let bytes = fs::read(&store.path)?;
        let entries = parse_document(&bytes).map_err(|reason| Error::MalformedStore {
            path: store.path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, reason),
        })?;
        debug!(path = %store.path.display(), records = entries.len(), "log store opened read-only");
        store.entries = Some(entries);
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.entries.is_some()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Load the document from disk.
    ///
    /// A missing or unreadable document is replaced by an empty one, which is
    /// written immediately so the path becomes a valid log. Any other I/O
    /// failure (e.g. permissions) is [`Error::MalformedStore`].
    pub fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Err(Error::AlreadyOpen {
                path: self.path.clone(),
            });
        }

        let entries = match fs::read(&self.path) {
            Ok(bytes) => match parse_document(&bytes) {
                Ok(entries) => entries,
                Err(reason) => {
                    warn!(path = %self.path.display(), %reason, "log file is malformed, reinitializing");
                    self.reinitialize()?
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "log file not found, creating");
                self.reinitialize()?
            }
            Err(source) => {
                return Err(Error::MalformedStore {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        debug!(path = %self.path.display(), records = entries.len(), "log store opened");
        self.entries = Some(entries);
        Ok(())
    }

    fn reinitialize(&self) -> Result<Entries> {
        let empty = Entries::new();
        write_document(&self.path, &empty).map_err(|e| match e {
            Error::Io(source) => Error::MalformedStore {
                path: self.path.clone(),
                source,
            },
            other => other,
        })?;
        Ok(empty)
    }

    /// Write the whole document to disk without closing.
    pub fn flush(&self) -> Result<()> {
        let entries = self.entries()?;
        if self.read_only {
            return Err(Error::ReadOnly {
                path: self.path.clone(),
            });
        }
        write_document(&self.path, entries)
    }

    /// Write the whole document to disk and close the store. A read-only
    /// store is closed without writing.
    pub fn close(&mut self) -> Result<()> {
        if self.read_only {
            self.entries()?;
        } else {
            self.flush()?;
        }
        self.entries = None;
        debug!(path = %self.path.display(), "log store closed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Mapping access
    // -----------------------------------------------------------------------

    fn entries(&self) -> Result<&Entries> {
        self.entries.as_ref().ok_or_else(|| Error::StoreNotOpen {
            path: self.path.clone(),
        })
    }

    fn entries_mut(&mut self) -> Result<&mut Entries> {
        self.entries.as_mut().ok_or_else(|| Error::StoreNotOpen {
            path: self.path.clone(),
        })
    }

    pub fn get(&self, key: &ArgKey) -> Result<Option<&AttemptRecord>> {
        Ok(self.entries()?.get(key))
    }

    pub fn get_mut(&mut self, key: &ArgKey) -> Result<Option<&mut AttemptRecord>> {
        Ok(self.entries_mut()?.get_mut(key))
    }

    /// Insert or replace a record. Returns the previous record, if any.
    pub fn insert(&mut self, key: ArgKey, record: AttemptRecord) -> Result<Option<AttemptRecord>> {
        Ok(self.entries_mut()?.insert(key, record))
    }

    /// Remove a record, keeping the order of the rest.
    pub fn remove(&mut self, key: &ArgKey) -> Result<Option<AttemptRecord>> {
        Ok(self.entries_mut()?.shift_remove(key))
    }

    pub fn contains_key(&self, key: &ArgKey) -> Result<bool> {
        Ok(self.entries()?.contains_key(key))
    }

    /// The record for `key`, created in state `new` if absent.
    pub fn get_or_create(&mut self, key: &ArgKey) -> Result<&mut AttemptRecord> {
        Ok(self
            .entries_mut()?
            .entry(key.clone())
            .or_insert_with(AttemptRecord::new))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.entries()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.entries()?.is_empty())
    }

    pub fn keys(&self) -> Result<indexmap::map::Keys<'_, ArgKey, AttemptRecord>> {
        Ok(self.entries()?.keys())
    }

    pub fn values(&self) -> Result<indexmap::map::Values<'_, ArgKey, AttemptRecord>> {
        Ok(self.entries()?.values())
    }

    pub fn iter(&self) -> Result<indexmap::map::Iter<'_, ArgKey, AttemptRecord>> {
        Ok(self.entries()?.iter())
    }
}

// ---------------------------------------------------------------------------
// Document encoding
// ---------------------------------------------------------------------------

fn encode_document(entries: &Entries) -> Value {
    let pairs: Vec<Value> = entries
        .iter()
        .map(|(key, record)| json!([key.to_json(), record.to_json()]))
        .collect();
    json!({ LOG_FIELD: pairs })
}

/// Decode a document. The error is a human-readable reason for the log.
fn parse_document(bytes: &[u8]) -> std::result::Result<Entries, String> {
    let raw: Value = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
    let pairs = raw
        .get(LOG_FIELD)
        .and_then(Value::as_array)
        .ok_or_else(|| format!("missing `{LOG_FIELD}` array"))?;

    let mut entries = Entries::with_capacity(pairs.len());
    for (i, pair) in pairs.iter().enumerate() {
        let (key, record) = match pair.as_array().map(Vec::as_slice) {
            Some([key, record]) => (key, record),
            _ => return Err(format!("entry {i} is not a [key, record] pair")),
        };
        let key = ArgKey::from_json(key).ok_or_else(|| format!("entry {i} has an invalid key"))?;
        let record =
            AttemptRecord::from_json(record).ok_or_else(|| format!("entry {i} has an invalid record"))?;
        entries.insert(key, record);
    }
    Ok(entries)
}

/// Replace `path` with the encoded document via a sibling temp file, so an
/// interrupted write never truncates the previous log.
fn write_document(path: &Path, entries: &Entries) -> Result<()> {
    let json = serde_json::to_string_pretty(&encode_document(entries))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp_path, path)?;

    metrics::store_flushes().add(1, &[]);
    debug!(path = %path.display(), records = entries.len(), "log store written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::State;

    #[test]
    fn parse_document_rejects_wrong_shapes() {
        assert!(parse_document(b"not json").is_err());
        assert!(parse_document(br#"{"other": []}"#).is_err());
        assert!(parse_document(br#"{"log": [["only-key"]]}"#).is_err());
        assert!(parse_document(br#"{"log": [[null, {}]]}"#).is_err());
        assert!(parse_document(br#"{"log": [[["k"], "not a record"]]}"#).is_err());
    }

    #[test]
    fn parse_document_keeps_file_order() {
        let doc = br#"{"log": [
            [["b"], {"state": "completed"}],
            [["a"], {"state": "errored"}],
            ["c", {"state": "new"}]
        ]}"#;
        let entries = parse_document(doc).unwrap();
        let keys: Vec<_> = entries.keys().cloned().collect();
        assert_eq!(
            keys,
            vec![ArgKey::from("b"), ArgKey::from("a"), ArgKey::from("c")]
        );
        assert_eq!(entries[&ArgKey::from("a")].state().unwrap(), State::Errored);
    }

    #[test]
    fn encode_document_writes_key_record_pairs() {
        let mut entries = Entries::new();
        entries.insert(ArgKey::from(["x", "1"]), AttemptRecord::new());
        let doc = encode_document(&entries);
        assert_eq!(doc, json!({"log": [[["x", "1"], {"state": "new"}]]}));
    }

    #[test]
    fn closed_store_reports_lookup_failure() {
        let store = LogStore::new("never-opened.json");
        let err = store.get(&ArgKey::from("k")).unwrap_err();
        assert!(err.is_lookup_failure());
        assert!(!store.is_open());
    }
}
