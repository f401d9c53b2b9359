use std::time::Duration;

use permitsync_core::{DriveClient, DriveError, FileMeta, FileQuery};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use super::backoff::{Backoff, retry_with_backoff};
use super::cache::{ScanCache, format_rfc3339};

const LIST_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("listing failed: {0}")]
    Drive(#[from] DriveError),
}

/// A candidate PDF decorated with its parent folder. Immutable once captured;
/// owned by the scan cache or the candidate list for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdfItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified_time: Option<String>,
    pub folder_id: String,
    pub folder_name: String,
}

impl PdfItem {
    pub fn from_meta(meta: FileMeta, folder: &FileMeta) -> Self {
        Self {
            id: meta.id,
            name: meta.name,
            size: meta.size,
            modified_time: meta.modified_time,
            folder_id: folder.id.clone(),
            folder_name: folder.name.clone(),
        }
    }

    /// Dedup identity: `"<folder_name>/<item_name>"`.
    pub fn composite_id(&self) -> String {
        format!("{}/{}", self.folder_name, self.name)
    }
}

pub struct RemoteScanner {
    drive: DriveClient,
    backoff: Backoff,
}

impl RemoteScanner {
    pub fn new(drive: DriveClient) -> Self {
        Self {
            drive,
            backoff: Backoff::new(Duration::from_secs(5), Duration::from_secs(60)),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// The recency filter is a performance optimization, not a correctness
    /// guarantee: folder modification times do not always propagate from
    /// child changes, so a filtered scan that finds nothing falls back to a
    /// full scan.
    pub async fn list_recent_folders(
        &self,
        now: OffsetDateTime,
        days: u64,
    ) -> Result<Vec<FileMeta>, ScanError> {
        let cutoff = format_rfc3339(now - time::Duration::days(days as i64));
        let recent = self.list_folders(Some(cutoff)).await?;
        if !recent.is_empty() {
            return Ok(recent);
        }
        eprintln!("[permitsync] no folders modified in the last {days} days, running a full scan");
        self.list_folders(None).await
    }

    pub async fn list_all_folders(&self) -> Result<Vec<FileMeta>, ScanError> {
        self.list_folders(None).await
    }

    async fn list_folders(
        &self,
        modified_after: Option<String>,
    ) -> Result<Vec<FileMeta>, ScanError> {
        let query = match modified_after {
            Some(threshold) => FileQuery::folders_modified_after(threshold),
            None => FileQuery::folders(),
        };
        retry_with_backoff(
            LIST_ATTEMPTS,
            self.backoff,
            || self.drive.list_files_all(&query),
            DriveError::is_retryable,
        )
        .await
        .map_err(Into::into)
    }

    /// Lists the PDFs of every folder, decorating each with the parent's id
    /// and name. A folder we are not allowed to read is skipped and the scan
    /// continues; transient listing failures are retried first. Returns the
    /// items plus the number of folders that could not be listed.
    pub async fn list_pdfs(&self, folders: &[FileMeta]) -> (Vec<PdfItem>, usize) {
        let mut items = Vec::new();
        let mut unlisted = 0usize;
        for folder in folders {
            let query = FileQuery::pdfs_in(&folder.id);
            let listed = retry_with_backoff(
                LIST_ATTEMPTS,
                self.backoff,
                || self.drive.list_files_all(&query),
                DriveError::is_retryable,
            )
            .await;
            match listed {
                Ok(files) => {
                    items.extend(
                        files
                            .into_iter()
                            .map(|meta| PdfItem::from_meta(meta, folder)),
                    );
                }
                Err(err) if err.is_permission_denied() => {
                    eprintln!(
                        "[permitsync] no access to folder {}, skipping: {err}",
                        folder.name
                    );
                    unlisted += 1;
                }
                Err(err) => {
                    eprintln!("[permitsync] listing {} failed: {err}", folder.name);
                    unlisted += 1;
                }
            }
        }
        (items, unlisted)
    }

    /// Serves candidates from a fresh cache, otherwise performs a live scan
    /// and overwrites the cache snapshot.
    pub async fn scan_with_cache(
        &self,
        cache: &mut ScanCache,
        now: OffsetDateTime,
        days: u64,
    ) -> Result<Vec<PdfItem>, ScanError> {
        if let Some(pdfs) = cache.pdfs_if_fresh(now) {
            eprintln!(
                "[permitsync] using cached scan: {} PDFs (last scan {})",
                pdfs.len(),
                cache.last_scan.as_deref().unwrap_or("unknown")
            );
            return Ok(pdfs.to_vec());
        }

        let folders = match cache.folders_if_fresh(now) {
            Some(folders) => folders.to_vec(),
            None => self.list_recent_folders(now, days).await?,
        };
        eprintln!("[permitsync] scanning {} folders for PDFs", folders.len());
        let (pdfs, unlisted) = self.list_pdfs(&folders).await;
        if unlisted > 0 {
            eprintln!("[permitsync] {unlisted} folders could not be listed");
        }
        cache.refresh(folders, pdfs.clone(), now);
        Ok(pdfs)
    }
}
