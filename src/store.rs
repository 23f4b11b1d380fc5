//! Local key-value document store with merge-on-write upserts.
//!
//! Records live in an ordered in-memory map. A persistent store also appends
//! every accepted write to a JSON-lines log and replays it on open; later
//! lines win. Each upsert is a read-modify-write under a lock for its key, so
//! two edits of the same record can never lose one another.

use crate::keys::KeyRange;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    Serialize(serde_json::Error),
    Corrupt { key: String, source: serde_json::Error },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(err) => write!(f, "store io error: {err}"),
            StoreError::Serialize(err) => write!(f, "failed to serialize record: {err}"),
            StoreError::Corrupt { key, source } => {
                write!(f, "record {key} has an unexpected shape: {source}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<io::Error> for StoreError {
    fn from(value: io::Error) -> Self {
        StoreError::Io(value)
    }
}

/// A record as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDoc {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev")]
    pub rev: u64,
    pub doc: Value,
}

/// Result of an upsert.
#[derive(Debug, Clone)]
pub struct Upserted<T> {
    pub rev: u64,
    /// False when the merge left the record unchanged and nothing was written.
    pub updated: bool,
    pub doc: T,
}

/// Default file name for a written [`StoreExport`].
pub const EXPORT_FILENAME: &str = "sidecar_export.json";

/// Full dump of the store, shaped like an all-docs listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreExport {
    pub total_rows: usize,
    pub rows: Vec<ExportRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRow {
    pub id: String,
    pub key: String,
    pub value: ExportRev,
    pub doc: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRev {
    pub rev: u64,
}

#[derive(Clone)]
pub struct DocumentStore {
    shared: Arc<StoreShared>,
}

struct StoreShared {
    docs: RwLock<BTreeMap<String, StoredDoc>>,
    /// One writer lock per key with an upsert in flight.
    writers: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    log: Option<StoreLog>,
}

struct StoreLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl DocumentStore {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::with_docs(BTreeMap::new(), None)
    }

    /// Opens (or creates) a store backed by the log at `path`.
    ///
    /// A log holding superseded or unreadable lines is compacted on open.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let (docs, entries) = replay_log(&path)?;
        info!(path = %path.display(), records = docs.len(), entries, "opened annotation store");
        let log = StoreLog {
            file: Mutex::new(open_append(&path)?),
            path,
        };
        let store = Self::with_docs(docs, Some(log));
        if entries > store.len() {
            store.compact()?;
        }
        Ok(store)
    }

    fn with_docs(docs: BTreeMap<String, StoredDoc>, log: Option<StoreLog>) -> Self {
        Self {
            shared: Arc::new(StoreShared {
                docs: RwLock::new(docs),
                writers: Mutex::new(HashMap::new()),
                log,
            }),
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let stored = self.shared.docs.read().get(key).map(|stored| stored.doc.clone());
        stored.map(|doc| decode_doc(key, doc)).transpose()
    }

    /// Loads the record at `key` (or `T::default()`), applies `merge` and writes the result back.
    ///
    /// Upserts of one key run one at a time; upserts of different keys do not wait on each other.
    pub fn upsert<T, F>(&self, key: &str, merge: F) -> Result<Upserted<T>, StoreError>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(T) -> T,
    {
        self.with_writer(key, || self.upsert_locked(key, merge))
    }

    fn upsert_locked<T, F>(&self, key: &str, merge: F) -> Result<Upserted<T>, StoreError>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(T) -> T,
    {
        let existing = self.shared.docs.read().get(key).cloned();
        let current = match &existing {
            Some(stored) => decode_doc(key, stored.doc.clone())?,
            None => T::default(),
        };
        let merged = merge(current);
        let value = serde_json::to_value(&merged).map_err(StoreError::Serialize)?;

        if let Some(stored) = &existing {
            if stored.doc == value {
                return Ok(Upserted {
                    rev: stored.rev,
                    updated: false,
                    doc: merged,
                });
            }
        }

        let rev = existing.map_or(1, |stored| stored.rev + 1);
        self.commit(StoredDoc {
            id: key.to_string(),
            rev,
            doc: value,
        })?;
        Ok(Upserted {
            rev,
            updated: true,
            doc: merged,
        })
    }

    fn with_writer<R>(&self, key: &str, work: impl FnOnce() -> R) -> R {
        let writer = Arc::clone(
            self.shared
                .writers
                .lock()
                .entry(key.to_string())
                .or_default(),
        );
        let result = {
            let _turn = writer.lock();
            work()
        };
        let mut writers = self.shared.writers.lock();
        if Arc::strong_count(&writer) == 2 {
            writers.remove(key);
        }
        result
    }

    /// Appends to the log, then publishes. The log lock is held across both so
    /// compaction never drops a line that is not yet in the map.
    fn commit(&self, stored: StoredDoc) -> Result<(), StoreError> {
        let Some(log) = &self.shared.log else {
            self.shared.docs.write().insert(stored.id.clone(), stored);
            return Ok(());
        };
        let mut line = serde_json::to_vec(&stored).map_err(StoreError::Serialize)?;
        line.push(b'\n');
        let mut file = log.file.lock();
        file.write_all(&line)?;
        self.shared.docs.write().insert(stored.id.clone(), stored);
        Ok(())
    }

    /// Rewrites the log with one line per live record.
    pub fn compact(&self) -> Result<(), StoreError> {
        let Some(log) = &self.shared.log else {
            return Ok(());
        };
        let mut file = log.file.lock();
        let mut staging = log.path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);

        let docs = self.shared.docs.read();
        let mut out = BufWriter::new(File::create(&staging)?);
        for stored in docs.values() {
            serde_json::to_writer(&mut out, stored).map_err(StoreError::Serialize)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        drop(out);
        fs::rename(&staging, &log.path)?;
        *file = open_append(&log.path)?;
        info!(path = %log.path.display(), records = docs.len(), "compacted annotation store log");
        Ok(())
    }

    /// Records with keys in `range`, in key order.
    pub fn range_query<T: DeserializeOwned>(
        &self,
        range: &KeyRange,
    ) -> Result<Vec<(String, T)>, StoreError> {
        let guard = self.shared.docs.read();
        guard
            .range::<str, _>((
                Bound::Included(range.start.as_str()),
                Bound::Excluded(range.end.as_str()),
            ))
            .map(|(key, stored)| Ok((key.clone(), decode_doc(key, stored.doc.clone())?)))
            .collect::<Result<Vec<_>, StoreError>>()
    }

    pub fn export_all(&self) -> StoreExport {
        let guard = self.shared.docs.read();
        let rows: Vec<ExportRow> = guard
            .values()
            .map(|stored| ExportRow {
                id: stored.id.clone(),
                key: stored.id.clone(),
                value: ExportRev { rev: stored.rev },
                doc: stored.doc.clone(),
            })
            .collect();
        StoreExport {
            total_rows: rows.len(),
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.shared.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn open_append(path: &Path) -> Result<File, StoreError> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn decode_doc<T: DeserializeOwned>(key: &str, doc: Value) -> Result<T, StoreError> {
    serde_json::from_value(doc).map_err(|source| StoreError::Corrupt {
        key: key.to_string(),
        source,
    })
}

/// Replays the log; also returns how many non-blank lines it held.
fn replay_log(path: &Path) -> Result<(BTreeMap<String, StoredDoc>, usize), StoreError> {
    let mut docs = BTreeMap::new();
    let mut entries = 0;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok((docs, 0)),
        Err(err) => return Err(err.into()),
    };
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        entries += 1;
        match serde_json::from_str::<StoredDoc>(&line) {
            Ok(stored) => {
                docs.insert(stored.id.clone(), stored);
            }
            Err(err) => {
                warn!(path = %path.display(), line = idx + 1, error = %err, "skipping unreadable store log line");
            }
        }
    }
    Ok((docs, entries))
}
