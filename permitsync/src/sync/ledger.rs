use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use super::cache::{ScanCache, format_rfc3339};

const LEDGER_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("state parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Error record, keyed by the `(folder, file)` pair so partial failures are
/// tracked at file granularity regardless of the identifier the driver uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub folder: String,
    pub file: String,
    #[serde(default)]
    pub file_id: String,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestrictedRecord {
    pub file: String,
    pub permit: String,
}

/// Persisted sync state. Append-mostly audit trail: nothing removes entries
/// from `uploaded_files` or `errors` except an operator deleting the file.
/// All fields default so ledgers written before a field existed still load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ledger {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub uploaded_files: Vec<String>,
    #[serde(default)]
    pub skipped: Vec<String>,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    #[serde(default)]
    pub restricted: Vec<RestrictedRecord>,
    #[serde(default)]
    pub cache: ScanCache,
}

fn default_version() -> u32 {
    LEDGER_VERSION
}

impl Default for Ledger {
    fn default() -> Self {
        Self {
            version: LEDGER_VERSION,
            uploaded_files: Vec::new(),
            skipped: Vec::new(),
            errors: Vec::new(),
            restricted: Vec::new(),
            cache: ScanCache::default(),
        }
    }
}

impl Ledger {
    pub fn is_processed(&self, id: &str) -> bool {
        self.uploaded_files.iter().any(|entry| entry == id)
    }

    pub fn has_error_for(&self, folder: &str, file: &str) -> bool {
        self.errors
            .iter()
            .any(|record| record.folder == folder && record.file == file)
    }

    /// A processed identifier is only re-eligible while an error record for
    /// the same `(folder, file)` pair exists.
    pub fn is_eligible(&self, id: &str, folder: &str, file: &str) -> bool {
        !self.is_processed(id) || self.has_error_for(folder, file)
    }

    fn add_success(&mut self, id: &str, folder: &str, file: &str) {
        if !self.is_processed(id) {
            self.uploaded_files.push(id.to_string());
        }
        self.errors
            .retain(|record| !(record.folder == folder && record.file == file));
    }

    fn add_error(&mut self, record: ErrorRecord) {
        self.errors
            .retain(|existing| !(existing.folder == record.folder && existing.file == record.file));
        self.errors.push(record);
    }

    fn add_skip(&mut self, id: &str) {
        if !self.skipped.iter().any(|entry| entry == id) {
            self.skipped.push(id.to_string());
        }
    }
}

/// Owns the persisted ledger. The mutex serializes concurrent workers; it is
/// held only for the read-modify-write and the file rewrite, never across a
/// network call.
pub struct LedgerStore {
    path: PathBuf,
    state: Mutex<Ledger>,
}

impl LedgerStore {
    /// A missing file yields a default-shaped ledger; only unreadable or
    /// unparsable content is an error.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let ledger = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ledger::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            state: Mutex::new(ledger),
        })
    }

    pub fn snapshot(&self) -> Ledger {
        self.lock().clone()
    }

    pub fn record_success(
        &self,
        id: &str,
        folder: &str,
        file: &str,
    ) -> Result<(), LedgerError> {
        let mut state = self.lock();
        state.add_success(id, folder, file);
        persist(&self.path, &*state)
    }

    pub fn record_error(
        &self,
        folder: &str,
        file: &str,
        file_id: &str,
        detail: &str,
    ) -> Result<(), LedgerError> {
        let mut state = self.lock();
        state.add_error(ErrorRecord {
            folder: folder.to_string(),
            file: file.to_string(),
            file_id: file_id.to_string(),
            detail: Some(detail.to_string()),
            timestamp: Some(format_rfc3339(OffsetDateTime::now_utc())),
        });
        persist(&self.path, &*state)
    }

    pub fn record_restricted(&self, file: &str, permit: &str) -> Result<(), LedgerError> {
        let mut state = self.lock();
        state.restricted.push(RestrictedRecord {
            file: file.to_string(),
            permit: permit.to_string(),
        });
        persist(&self.path, &*state)
    }

    pub fn record_skip(&self, id: &str) -> Result<(), LedgerError> {
        let mut state = self.lock();
        state.add_skip(id);
        persist(&self.path, &*state)
    }

    pub fn update_cache(&self, cache: ScanCache) -> Result<(), LedgerError> {
        let mut state = self.lock();
        state.cache = cache;
        persist(&self.path, &*state)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Append-only mirror of successful uploads. Never reconciled against the
/// ledger automatically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct History {
    #[serde(default)]
    pub uploaded_files: Vec<String>,
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub first_upload: Option<String>,
    #[serde(default)]
    pub last_upload: Option<String>,
}

pub struct HistoryStore {
    path: PathBuf,
    state: Mutex<History>,
}

impl HistoryStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let history = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => History::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            state: Mutex::new(history),
        })
    }

    pub fn snapshot(&self) -> History {
        self.lock().clone()
    }

    pub fn append(&self, id: &str, now: OffsetDateTime) -> Result<(), LedgerError> {
        let mut state = self.lock();
        if state.uploaded_files.iter().any(|entry| entry == id) {
            return Ok(());
        }
        state.uploaded_files.push(id.to_string());
        state.total_count = state.uploaded_files.len() as u64;
        let stamp = format_rfc3339(now);
        if state.first_upload.is_none() {
            state.first_upload = Some(stamp.clone());
        }
        state.last_upload = Some(stamp);
        persist(&self.path, &*state)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, History> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Full rewrite through a sibling temp file, renamed into place so a crash
/// mid-write cannot truncate the previous state.
fn persist<T: Serialize>(path: &Path, value: &T) -> Result<(), LedgerError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let partial = path.with_extension("partial");
    std::fs::write(&partial, serde_json::to_vec_pretty(value)?)?;
    std::fs::rename(partial, path)?;
    Ok(())
}
