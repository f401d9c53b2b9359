use std::sync::Arc;

use permitsync_core::IngestClient;

use crate::sync::ledger::{HistoryStore, LedgerStore};
use crate::token_provider::TokenProvider;

const RECENT_UPLOADS_SHOWN: usize = 5;
const RECENT_REPORTS_PAGE_SIZE: u32 = 20;

/// Ledger statistics plus a recent-reports query against the ingestion
/// system, so an operator can confirm items that were accepted as
/// "processing continues server-side" actually landed.
pub async fn run_status(
    ledger: &Arc<LedgerStore>,
    history: &Arc<HistoryStore>,
    ingest: &IngestClient,
    tokens: &Arc<TokenProvider>,
    group_id: &str,
) -> anyhow::Result<()> {
    let snapshot = ledger.snapshot();
    println!("uploaded files: {}", snapshot.uploaded_files.len());
    println!("error records:  {}", snapshot.errors.len());
    println!("skipped items:  {}", snapshot.skipped.len());
    println!("restricted:     {}", snapshot.restricted.len());
    println!(
        "last scan:      {}",
        snapshot.cache.last_scan.as_deref().unwrap_or("never")
    );

    let recent_start = snapshot
        .uploaded_files
        .len()
        .saturating_sub(RECENT_UPLOADS_SHOWN);
    if !snapshot.uploaded_files.is_empty() {
        println!("recent uploads:");
        for entry in &snapshot.uploaded_files[recent_start..] {
            println!("  {entry}");
        }
    }
    if !snapshot.errors.is_empty() {
        println!("errors:");
        for record in &snapshot.errors {
            println!(
                "  {}/{}: {}",
                record.folder,
                record.file,
                record.detail.as_deref().unwrap_or("unknown")
            );
        }
    }

    let totals = history.snapshot();
    println!(
        "history: {} total, first {}, last {}",
        totals.total_count,
        totals.first_upload.as_deref().unwrap_or("-"),
        totals.last_upload.as_deref().unwrap_or("-")
    );

    let token = tokens.get_valid().await;
    match ingest
        .list_reports(&token, group_id, 1, RECENT_REPORTS_PAGE_SIZE)
        .await
    {
        Ok(page) => {
            println!("recent reports in the ingestion system:");
            for record in &page.results {
                println!(
                    "  {} [{}] {}",
                    record.filename(),
                    record.parse_state(),
                    record.created_at.as_deref().unwrap_or("")
                );
            }
        }
        Err(err) => {
            eprintln!("[permitsync] report listing unavailable: {err}");
        }
    }
    Ok(())
}
