use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use permitsync_core::{DriveClient, DriveError, IngestClient, IngestError, SubmitRequest};
use time::OffsetDateTime;

use crate::config::SetupFailure;
use crate::token_provider::TokenProvider;

use super::backoff::{Backoff, retry_with_backoff};
use super::cache::format_rfc3339;
use super::ledger::{HistoryStore, LedgerStore};
use super::scanner::{PdfItem, RemoteScanner};

#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub scenario_id: String,
    pub language: String,
    pub group_id: String,
    pub recent_days: u64,
    pub max_uploads: usize,
    pub delay_between_items: Duration,
    pub workers: usize,
    pub download_attempts: u32,
    pub download_backoff: Backoff,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            scenario_id: "construction_safety_pdf".to_string(),
            language: "zh-TW".to_string(),
            group_id: String::new(),
            recent_days: 7,
            max_uploads: 500,
            delay_between_items: Duration::from_secs(5),
            workers: 1,
            download_attempts: 3,
            download_backoff: Backoff::new(Duration::from_secs(5), Duration::from_secs(60)),
        }
    }
}

/// Terminal outcome of one item's state machine. A gateway-timeout-class
/// submit is a success-pending outcome, not a failure: the backend keeps
/// processing after the connection drops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Accepted,
    ProcessingAsync,
    DownloadFailed(String),
    SubmitFailed(String),
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Accepted | ItemOutcome::ProcessingAsync)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunSummary {
    fn absorb(&mut self, outcome: &ItemOutcome) {
        if outcome.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }

    fn merge(&mut self, other: RunSummary) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

enum SubmitVerdict {
    Accepted,
    Pending,
    Failed(String),
}

pub struct SyncDriver {
    drive: DriveClient,
    ingest: IngestClient,
    tokens: Arc<TokenProvider>,
    ledger: Arc<LedgerStore>,
    history: Option<Arc<HistoryStore>>,
    options: DriverOptions,
    interrupted: Arc<AtomicBool>,
}

impl SyncDriver {
    pub fn new(
        drive: DriveClient,
        ingest: IngestClient,
        tokens: Arc<TokenProvider>,
        ledger: Arc<LedgerStore>,
        options: DriverOptions,
    ) -> Self {
        Self {
            drive,
            ingest,
            tokens,
            ledger,
            history: None,
            options,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_history(mut self, history: Arc<HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    /// Setting this flag stops the run after in-flight items finish; no
    /// mid-flight abort is attempted, so the ledger only ever reflects
    /// completed outcomes and a restart resumes idempotently.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    /// Ledger check, recency filter, newest-first ordering, upload cap.
    /// Processed items only re-qualify while a matching error record exists.
    pub fn plan(&self, candidates: Vec<PdfItem>, now: OffsetDateTime) -> Vec<PdfItem> {
        // RFC3339 UTC timestamps compare correctly as strings
        let cutoff = format_rfc3339(now - time::Duration::days(self.options.recent_days as i64));
        let ledger = self.ledger.snapshot();

        let mut recent: Vec<PdfItem> = candidates
            .into_iter()
            .filter(|item| item.modified_time.as_deref().unwrap_or("") >= cutoff.as_str())
            .collect();
        recent.sort_by(|a, b| b.modified_time.cmp(&a.modified_time));

        let mut planned = Vec::new();
        for item in recent {
            if !ledger.is_eligible(&item.composite_id(), &item.folder_name, &item.name) {
                continue;
            }
            planned.push(item);
            if planned.len() >= self.options.max_uploads {
                break;
            }
        }
        planned
    }

    /// Plans and executes a candidate set; the difference between candidates
    /// and planned items is reported as skips.
    pub async fn run(self: &Arc<Self>, candidates: Vec<PdfItem>, now: OffsetDateTime) -> RunSummary {
        let candidate_count = candidates.len();
        let planned = self.plan(candidates, now);
        let mut summary = self.run_planned(planned).await;
        summary.skipped = candidate_count - summary.succeeded - summary.failed;
        summary
    }

    /// Executes the per-item state machine over an already-planned list,
    /// sequentially or on the bounded worker pool. The cooperative
    /// inter-item delay is divided by the worker count.
    pub async fn run_planned(self: &Arc<Self>, planned: Vec<PdfItem>) -> RunSummary {
        let total = planned.len();
        if self.options.workers <= 1 {
            let mut summary = RunSummary::default();
            for (index, item) in planned.iter().enumerate() {
                if self.interrupted.load(Ordering::SeqCst) {
                    eprintln!("[permitsync] interrupted, stopping after completed items");
                    break;
                }
                eprintln!(
                    "[permitsync] [{}/{}] processing {}",
                    index + 1,
                    total,
                    item.composite_id()
                );
                let outcome = self.execute(item).await;
                summary.absorb(&outcome);
                if index + 1 < total {
                    tokio::time::sleep(self.options.delay_between_items).await;
                }
            }
            return summary;
        }

        let queue = Arc::new(Mutex::new(VecDeque::from(planned)));
        let delay = self.options.delay_between_items / self.options.workers as u32;
        let mut handles = Vec::new();
        for _ in 0..self.options.workers {
            let driver = Arc::clone(self);
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                let mut summary = RunSummary::default();
                loop {
                    if driver.interrupted.load(Ordering::SeqCst) {
                        break;
                    }
                    let next = {
                        let mut queue = queue.lock().unwrap_or_else(|p| p.into_inner());
                        queue.pop_front()
                    };
                    let Some(item) = next else { break };
                    eprintln!("[permitsync] processing {}", item.composite_id());
                    let outcome = driver.execute(&item).await;
                    summary.absorb(&outcome);
                    tokio::time::sleep(delay).await;
                }
                summary
            }));
        }

        let mut summary = RunSummary::default();
        for handle in handles {
            if let Ok(worker_summary) = handle.await {
                summary.merge(worker_summary);
            }
        }
        summary
    }

    async fn execute(&self, item: &PdfItem) -> ItemOutcome {
        let outcome = self.process_item(item).await;
        match &outcome {
            ItemOutcome::Accepted => {
                eprintln!("[permitsync] accepted: {}", item.composite_id());
            }
            ItemOutcome::ProcessingAsync => {
                eprintln!(
                    "[permitsync] accepted (processing continues server-side): {}",
                    item.composite_id()
                );
            }
            ItemOutcome::DownloadFailed(detail) => {
                eprintln!(
                    "[permitsync] download failed: {}: {detail}",
                    item.composite_id()
                );
            }
            ItemOutcome::SubmitFailed(detail) => {
                eprintln!(
                    "[permitsync] submit failed: {}: {detail}",
                    item.composite_id()
                );
            }
        }
        // the ledger is written only once the outcome is definitive
        if let Err(err) = self.record_outcome(item, &outcome) {
            eprintln!(
                "[permitsync] ledger write failed for {}: {err}",
                item.composite_id()
            );
        }
        outcome
    }

    async fn process_item(&self, item: &PdfItem) -> ItemOutcome {
        let content = match retry_with_backoff(
            self.options.download_attempts,
            self.options.download_backoff,
            || self.drive.download(&item.id),
            DriveError::is_retryable,
        )
        .await
        {
            Ok(bytes) => bytes,
            Err(err) => return ItemOutcome::DownloadFailed(err.to_string()),
        };

        match self.submit_with_refresh(item, content).await {
            SubmitVerdict::Accepted => ItemOutcome::Accepted,
            SubmitVerdict::Pending => ItemOutcome::ProcessingAsync,
            SubmitVerdict::Failed(detail) => ItemOutcome::SubmitFailed(detail),
        }
    }

    /// One submit attempt, plus exactly one refresh-and-retry when the
    /// backend rejects the credential.
    async fn submit_with_refresh(&self, item: &PdfItem, content: Vec<u8>) -> SubmitVerdict {
        let token = self.tokens.get_valid().await;
        match self.submit_once(&token, item, content.clone()).await {
            Ok(()) => SubmitVerdict::Accepted,
            Err(err) if err.is_gateway_pending() => SubmitVerdict::Pending,
            Err(err) if err.is_auth_rejected() => {
                let Some(fresh) = self.tokens.force_refresh().await else {
                    return SubmitVerdict::Failed(err.to_string());
                };
                match self.submit_once(&fresh, item, content).await {
                    Ok(()) => SubmitVerdict::Accepted,
                    Err(retry_err) if retry_err.is_gateway_pending() => SubmitVerdict::Pending,
                    Err(retry_err) => SubmitVerdict::Failed(retry_err.to_string()),
                }
            }
            Err(err) => SubmitVerdict::Failed(err.to_string()),
        }
    }

    async fn submit_once(
        &self,
        token: &str,
        item: &PdfItem,
        content: Vec<u8>,
    ) -> Result<(), IngestError> {
        let response = self
            .ingest
            .submit(
                token,
                SubmitRequest {
                    file_name: item.name.clone(),
                    content,
                    scenario_id: self.options.scenario_id.clone(),
                    language: self.options.language.clone(),
                    group_id: self.options.group_id.clone(),
                    additional_context: format!("建案代碼: {}", item.folder_name),
                    save_to_report: true,
                },
            )
            .await?;
        // an analysis error can still create the business record; a 2xx
        // response counts as accepted either way
        if let Some(project) = &response.construction_project {
            eprintln!(
                "[permitsync] project record: {} (report {})",
                project.project_code.as_deref().unwrap_or("?"),
                response.report_id.as_deref().unwrap_or("?")
            );
        } else if let Some(detail) = &response.error {
            eprintln!("[permitsync] backend reported: {detail}");
        }
        Ok(())
    }

    fn record_outcome(
        &self,
        item: &PdfItem,
        outcome: &ItemOutcome,
    ) -> Result<(), super::ledger::LedgerError> {
        match outcome {
            ItemOutcome::Accepted | ItemOutcome::ProcessingAsync => {
                let id = item.composite_id();
                self.ledger
                    .record_success(&id, &item.folder_name, &item.name)?;
                if let Some(history) = &self.history {
                    history.append(&id, OffsetDateTime::now_utc())?;
                }
            }
            ItemOutcome::DownloadFailed(detail) | ItemOutcome::SubmitFailed(detail) => {
                self.ledger
                    .record_error(&item.folder_name, &item.name, &item.id, detail)?;
            }
        }
        Ok(())
    }
}

/// Full upload run: scan (through the cache), persist the refreshed
/// snapshot, then drive every eligible item through the state machine.
/// An unreachable listing service is a setup failure; per-item failures
/// are recorded and never abort the run.
pub async fn run_sync(
    scanner: &RemoteScanner,
    driver: &Arc<SyncDriver>,
    ledger: &Arc<LedgerStore>,
    now: OffsetDateTime,
    recent_days: u64,
) -> anyhow::Result<RunSummary> {
    let mut cache = ledger.snapshot().cache;
    let candidates = scanner
        .scan_with_cache(&mut cache, now, recent_days)
        .await
        .map_err(|err| SetupFailure(format!("remote scan failed: {err}")))?;
    // the snapshot is persisted before filtering so even an aborted run
    // keeps the expensive listing
    ledger.update_cache(cache)?;

    if candidates.is_empty() {
        eprintln!("[permitsync] no PDFs found");
        return Ok(RunSummary::default());
    }

    let summary = driver.run(candidates, now).await;
    report_summary(&summary, ledger);
    Ok(summary)
}

/// Re-runs every item currently in the ledger's error list.
pub async fn run_retry(
    driver: &Arc<SyncDriver>,
    ledger: &Arc<LedgerStore>,
) -> anyhow::Result<RunSummary> {
    let errors = ledger.snapshot().errors;
    if errors.is_empty() {
        eprintln!("[permitsync] no recorded errors to retry");
        return Ok(RunSummary::default());
    }

    let items: Vec<PdfItem> = errors
        .into_iter()
        .map(|record| PdfItem {
            id: record.file_id,
            name: record.file,
            size: None,
            modified_time: None,
            folder_id: String::new(),
            folder_name: record.folder,
        })
        .collect();
    eprintln!("[permitsync] retrying {} failed items", items.len());
    let summary = driver.run_planned(items).await;
    report_summary(&summary, ledger);
    Ok(summary)
}

fn report_summary(summary: &RunSummary, ledger: &Arc<LedgerStore>) {
    eprintln!(
        "[permitsync] done: {} succeeded, {} failed, {} skipped",
        summary.succeeded, summary.failed, summary.skipped
    );
    let errors = ledger.snapshot().errors;
    if !errors.is_empty() {
        eprintln!("[permitsync] outstanding errors:");
        for record in errors {
            eprintln!(
                "[permitsync]   {}/{}: {}",
                record.folder,
                record.file,
                record.detail.as_deref().unwrap_or("unknown")
            );
        }
    }
}
