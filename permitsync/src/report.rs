use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use permitsync_core::{FileMeta, IngestClient, IngestError};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::config::SetupFailure;
use crate::matcher::{self, CloudUsage, LinkScan};
use crate::pdftext;
use crate::sync::ledger::{History, Ledger, LedgerStore};
use crate::sync::scanner::{PdfItem, RemoteScanner};
use crate::token_provider::TokenProvider;

const REPORT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermitState {
    NoReports,
    Completed,
    InProgress,
    NotUploaded,
}

impl PermitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermitState::NoReports => "no_reports",
            PermitState::Completed => "completed",
            PermitState::InProgress => "in_progress",
            PermitState::NotUploaded => "not_uploaded",
        }
    }
}

/// The drive holds `drive_count` PDFs, the ingestion system knows
/// `system_count` of them: full coverage is completed, partial is in
/// progress, none is not uploaded, and an empty folder has nothing to track.
pub fn classify(drive_count: usize, system_count: usize) -> PermitState {
    if drive_count == 0 {
        PermitState::NoReports
    } else if system_count >= drive_count {
        PermitState::Completed
    } else if system_count > 0 {
        PermitState::InProgress
    } else {
        PermitState::NotUploaded
    }
}

#[derive(Debug, Clone)]
pub struct ReportEntry {
    pub filename: String,
    pub created_at: String,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct DriveStats {
    pub folder_id: String,
    pub pdf_count: usize,
    pub latest_pdf: String,
}

/// Groups a scanned folder/PDF listing into per-permit counts. Folders whose
/// name carries no permit number are ignored.
pub fn drive_stats(folders: &[FileMeta], pdfs: &[PdfItem]) -> HashMap<String, DriveStats> {
    let mut by_folder: HashMap<&str, (usize, String)> = HashMap::new();
    for pdf in pdfs {
        let entry = by_folder.entry(pdf.folder_id.as_str()).or_default();
        entry.0 += 1;
        if let Some(modified) = &pdf.modified_time
            && modified > &entry.1
        {
            entry.1 = modified.clone();
        }
    }

    let mut stats = HashMap::new();
    for folder in folders {
        let Some(permit) = matcher::extract_permit(&folder.name) else {
            continue;
        };
        let (pdf_count, latest_pdf) = by_folder
            .get(folder.id.as_str())
            .cloned()
            .unwrap_or((0, String::new()));
        stats.insert(
            permit,
            DriveStats {
                folder_id: folder.id.clone(),
                pdf_count,
                latest_pdf,
            },
        );
    }
    stats
}

/// Filename → permit mapping reconstructed from the composite
/// `"<folder>/<file>"` ids the ledger and history record.
pub fn filename_to_permit(ledger: &Ledger, history: &History) -> HashMap<String, String> {
    let mut mapping = HashMap::new();
    for entry in history
        .uploaded_files
        .iter()
        .chain(ledger.uploaded_files.iter())
    {
        let Some(permit) = matcher::extract_permit(entry) else {
            continue;
        };
        let filename = entry.rsplit('/').next().unwrap_or(entry).to_string();
        if !filename.to_lowercase().ends_with(".pdf") {
            mapping.insert(format!("{filename}.pdf"), permit.clone());
        }
        mapping.insert(filename, permit);
    }
    mapping
}

fn uploads_by_permit(history: &History) -> HashMap<String, BTreeSet<String>> {
    let mut grouped: HashMap<String, BTreeSet<String>> = HashMap::new();
    for entry in &history.uploaded_files {
        if let Some((permit, filename)) = entry.split_once('/') {
            grouped
                .entry(permit.to_string())
                .or_default()
                .insert(filename.to_string());
        }
    }
    grouped
}

/// Pages through the ingestion system's reports and groups them by permit,
/// seeded with the upload history so reports the API no longer returns are
/// still counted. A rejected credential is refreshed once.
pub async fn fetch_reports_by_permit(
    ingest: &IngestClient,
    tokens: &Arc<TokenProvider>,
    group_id: &str,
    ledger: &Ledger,
    history: &History,
) -> Result<HashMap<String, Vec<ReportEntry>>, IngestError> {
    let name_to_permit = filename_to_permit(ledger, history);

    let mut grouped: HashMap<String, Vec<ReportEntry>> = HashMap::new();
    for (permit, files) in uploads_by_permit(history) {
        grouped.insert(
            permit,
            files
                .into_iter()
                .map(|filename| ReportEntry {
                    filename,
                    created_at: String::new(),
                    status: "uploaded".to_string(),
                })
                .collect(),
        );
    }

    let mut token = tokens.get_valid().await;
    let mut refreshed = false;
    let mut page = 1u32;
    let mut records = Vec::new();
    loop {
        match ingest
            .list_reports(&token, group_id, page, REPORT_PAGE_SIZE)
            .await
        {
            Ok(listed) => {
                if listed.results.is_empty() {
                    break;
                }
                let has_next = listed.next.is_some();
                records.extend(listed.results);
                if !has_next {
                    break;
                }
                page += 1;
            }
            Err(err) if err.is_auth_rejected() && !refreshed => {
                refreshed = true;
                match tokens.force_refresh().await {
                    Some(fresh) => token = fresh,
                    None => return Err(err),
                }
            }
            Err(err) => return Err(err),
        }
    }

    let mut matched = 0usize;
    let mut unmatched = 0usize;
    for record in records {
        let filename = record.filename().to_string();
        let permit = matcher::extract_permit(&filename)
            .or_else(|| name_to_permit.get(&filename).cloned());
        let Some(permit) = permit else {
            unmatched += 1;
            continue;
        };
        matched += 1;
        let entries = grouped.entry(permit).or_default();
        if entries.iter().any(|entry| entry.filename == filename) {
            continue;
        }
        entries.push(ReportEntry {
            filename,
            created_at: record.created_at.clone().unwrap_or_default(),
            status: record.parse_state().to_string(),
        });
    }
    eprintln!("[permitsync] report matching: {matched} matched, {unmatched} unmatched");
    Ok(grouped)
}

#[derive(Debug, Clone)]
pub struct PermitRow {
    pub permit: String,
    pub cloud: String,
    pub drive_count: usize,
    pub system_count: usize,
    pub latest_report: String,
    pub days_since_update: Option<i64>,
    pub state: PermitState,
}

/// Merges drive counts, system counts and registry cloud usage into one row
/// per permit, newest permits first.
pub fn build_rows(
    stats: &HashMap<String, DriveStats>,
    reports: &HashMap<String, Vec<ReportEntry>>,
    non_google: &[CloudUsage],
    now: OffsetDateTime,
) -> Vec<PermitRow> {
    let cloud_by_permit: HashMap<&str, &str> = non_google
        .iter()
        .map(|usage| (usage.permit.as_str(), usage.provider.as_str()))
        .collect();

    let mut rows = Vec::new();
    for (permit, stat) in stats {
        let system_count = reports.get(permit).map(Vec::len).unwrap_or(0);
        rows.push(PermitRow {
            permit: permit.clone(),
            cloud: cloud_by_permit
                .get(permit.as_str())
                .map(|provider| (*provider).to_string())
                .unwrap_or_else(|| "Google Drive".to_string()),
            drive_count: stat.pdf_count,
            system_count,
            latest_report: stat.latest_pdf.clone(),
            days_since_update: days_since(&stat.latest_pdf, now),
            state: classify(stat.pdf_count, system_count),
        });
    }
    for usage in non_google {
        if stats.contains_key(&usage.permit) {
            continue;
        }
        rows.push(PermitRow {
            permit: usage.permit.clone(),
            cloud: usage.provider.clone(),
            drive_count: 0,
            system_count: 0,
            latest_report: String::new(),
            days_since_update: None,
            state: PermitState::NoReports,
        });
    }

    rows.sort_by(|a, b| {
        matcher::permit_sort_key(&b.permit).cmp(&matcher::permit_sort_key(&a.permit))
    });
    rows
}

fn days_since(timestamp: &str, now: OffsetDateTime) -> Option<i64> {
    let parsed = OffsetDateTime::parse(timestamp, &Rfc3339).ok()?;
    Some((now - parsed).whole_days())
}

pub fn render_csv(rows: &[PermitRow]) -> String {
    let mut lines =
        vec!["permit,cloud,drive_pdfs,system_pdfs,coverage,latest_report,days_since,status".to_string()];
    for row in rows {
        let coverage = if row.drive_count > 0 && row.system_count > 0 {
            format!(
                "{}%",
                (row.system_count * 100 / row.drive_count).min(100)
            )
        } else {
            "-".to_string()
        };
        let latest = row.latest_report.get(..10).unwrap_or("");
        let days = row
            .days_since_update
            .map(|days| days.to_string())
            .unwrap_or_default();
        lines.push(format!(
            "\"{}\",\"{}\",{},{},{},{},{},{}",
            row.permit,
            row.cloud,
            row.drive_count,
            row.system_count,
            coverage,
            latest,
            days,
            row.state.as_str()
        ));
    }
    lines.join("\n")
}

/// Cross-reference of the registry document against the remote listing.
#[derive(Debug, Default)]
pub struct Reconciliation {
    pub linked: usize,
    pub missed: usize,
    pub unsupported: Vec<(String, String)>,
    /// Permits whose link carries no parseable folder id.
    pub unresolvable: Vec<String>,
    /// Permits with a usable source link but no folder on the shared drive.
    pub missing_remote: Vec<String>,
}

pub fn reconcile(scan: &LinkScan, folders: &[FileMeta]) -> Reconciliation {
    let remote: HashSet<String> = folders
        .iter()
        .filter_map(|folder| matcher::extract_permit(&folder.name))
        .collect();

    let mut summary = Reconciliation {
        linked: scan.mapping.len(),
        missed: scan.missed,
        unsupported: scan.unsupported.clone(),
        ..Reconciliation::default()
    };
    for (permit, url) in &scan.mapping {
        if matcher::folder_id_from_url(url).is_none() {
            summary.unresolvable.push(permit.clone());
        }
        if !remote.contains(permit) {
            summary.missing_remote.push(permit.clone());
        }
    }
    summary
}

/// The registry host serves an incomplete certificate chain.
pub async fn fetch_registry(url: &str) -> Result<Vec<u8>, reqwest::Error> {
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(30))
        .build()?;
    let response = client.get(url).send().await?.error_for_status()?;
    Ok(response.bytes().await?.to_vec())
}

/// Downloads the registry document, builds the permit→link mapping with the
/// territory search, and checks it against the shared drive. Unsupported or
/// unresolvable sources are recorded as skips for manual follow-up.
pub async fn run_reconcile(
    scanner: &RemoteScanner,
    ledger: &Arc<LedgerStore>,
    registry_url: &str,
) -> anyhow::Result<()> {
    eprintln!("[permitsync] downloading registry document");
    let bytes = fetch_registry(registry_url)
        .await
        .map_err(|err| SetupFailure(format!("registry download failed: {err}")))?;
    let text = pdftext::extract_text(&bytes)
        .map_err(|err| SetupFailure(format!("registry parse failed: {err}")))?;

    let scan = matcher::chunk_scoped_link_search(&matcher::squash_whitespace(&text));
    if scan.mapping.is_empty() && scan.unsupported.is_empty() && scan.missed == 0 {
        return Err(SetupFailure("registry document contains no permit numbers".to_string()).into());
    }
    eprintln!(
        "[permitsync] registry mapping: {} linked, {} without a link",
        scan.mapping.len(),
        scan.missed
    );

    let folders = scanner
        .list_all_folders()
        .await
        .map_err(|err| SetupFailure(format!("remote scan failed: {err}")))?;
    let summary = reconcile(&scan, &folders);

    for (permit, url) in &summary.unsupported {
        eprintln!("[permitsync] unsupported source for {permit}: {url}");
        ledger.record_skip(permit)?;
    }
    for permit in &summary.unresolvable {
        eprintln!("[permitsync] source link for {permit} has no folder id");
        ledger.record_skip(permit)?;
    }

    println!("linked permits:        {}", summary.linked);
    println!("without a link:        {}", summary.missed);
    println!("unsupported providers: {}", summary.unsupported.len());
    println!("unresolvable links:    {}", summary.unresolvable.len());
    println!("missing on the drive:  {}", summary.missing_remote.len());
    for permit in &summary.missing_remote {
        println!("  {permit}");
    }
    Ok(())
}

/// Builds the per-permit tracking rows and writes the CSV export.
pub async fn run_report(
    scanner: &RemoteScanner,
    ingest: &IngestClient,
    tokens: &Arc<TokenProvider>,
    ledger: &Arc<LedgerStore>,
    history: &History,
    group_id: &str,
    registry_url: &str,
    csv_path: &Path,
    now: OffsetDateTime,
) -> anyhow::Result<()> {
    let folders = scanner
        .list_all_folders()
        .await
        .map_err(|err| SetupFailure(format!("remote scan failed: {err}")))?;
    let permit_folders: Vec<FileMeta> = folders
        .into_iter()
        .filter(|folder| matcher::extract_permit(&folder.name).is_some())
        .collect();
    eprintln!(
        "[permitsync] {} permit folders on the drive",
        permit_folders.len()
    );
    let (pdfs, unlisted) = scanner.list_pdfs(&permit_folders).await;
    if unlisted > 0 {
        eprintln!("[permitsync] {unlisted} folders could not be listed");
    }
    let stats = drive_stats(&permit_folders, &pdfs);

    let snapshot = ledger.snapshot();
    let reports = match fetch_reports_by_permit(ingest, tokens, group_id, &snapshot, history).await
    {
        Ok(reports) => reports,
        Err(err) => {
            eprintln!("[permitsync] report listing failed, continuing without it: {err}");
            HashMap::new()
        }
    };

    let non_google = match fetch_registry(registry_url).await {
        Ok(bytes) => match pdftext::extract_text(&bytes) {
            Ok(text) => matcher::find_non_google_permits(&text),
            Err(err) => {
                eprintln!("[permitsync] registry parse failed, continuing without it: {err}");
                Vec::new()
            }
        },
        Err(err) => {
            eprintln!("[permitsync] registry download failed, continuing without it: {err}");
            Vec::new()
        }
    };

    let rows = build_rows(&stats, &reports, &non_google, now);
    std::fs::write(csv_path, render_csv(&rows))?;

    let mut counts: HashMap<&'static str, usize> = HashMap::new();
    for row in &rows {
        *counts.entry(row.state.as_str()).or_default() += 1;
    }
    println!("permits tracked:  {}", rows.len());
    for state in ["completed", "in_progress", "not_uploaded", "no_reports"] {
        println!("{state:<17} {}", counts.get(state).copied().unwrap_or(0));
    }
    println!("other clouds:     {}", non_google.len());
    println!("csv written to {}", csv_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn meta(id: &str, name: &str) -> FileMeta {
        serde_json::from_value(serde_json::json!({"id": id, "name": name})).unwrap()
    }

    fn pdf(folder_id: &str, folder_name: &str, name: &str, modified: &str) -> PdfItem {
        PdfItem {
            id: format!("{folder_id}-{name}"),
            name: name.to_string(),
            size: None,
            modified_time: Some(modified.to_string()),
            folder_id: folder_id.to_string(),
            folder_name: folder_name.to_string(),
        }
    }

    #[test]
    fn classification_covers_all_states() {
        assert_eq!(classify(0, 0), PermitState::NoReports);
        assert_eq!(classify(3, 3), PermitState::Completed);
        assert_eq!(classify(3, 5), PermitState::Completed);
        assert_eq!(classify(3, 1), PermitState::InProgress);
        assert_eq!(classify(3, 0), PermitState::NotUploaded);
    }

    #[test]
    fn drive_stats_groups_pdfs_under_their_permit() {
        let folders = vec![
            meta("f1", "113建字第0008號 長春段"),
            meta("f2", "未命名資料夾"),
        ];
        let pdfs = vec![
            pdf("f1", "113建字第0008號 長春段", "w1.pdf", "2026-08-01T00:00:00Z"),
            pdf("f1", "113建字第0008號 長春段", "w2.pdf", "2026-08-03T00:00:00Z"),
        ];

        let stats = drive_stats(&folders, &pdfs);
        assert_eq!(stats.len(), 1);
        let stat = &stats["113建字第0008號"];
        assert_eq!(stat.pdf_count, 2);
        assert_eq!(stat.latest_pdf, "2026-08-03T00:00:00Z");
    }

    #[test]
    fn filename_mapping_is_built_from_composite_ids() {
        let ledger = Ledger {
            uploaded_files: vec!["113建字第0008號/週報39".to_string()],
            ..Ledger::default()
        };
        let history = History {
            uploaded_files: vec!["112建字第0238號/report.pdf".to_string()],
            ..History::default()
        };

        let mapping = filename_to_permit(&ledger, &history);
        assert_eq!(mapping.get("report.pdf").map(String::as_str), Some("112建字第0238號"));
        assert_eq!(mapping.get("週報39").map(String::as_str), Some("113建字第0008號"));
        assert_eq!(mapping.get("週報39.pdf").map(String::as_str), Some("113建字第0008號"));
    }

    #[test]
    fn rows_merge_counts_and_sort_newest_permit_first() {
        let now = datetime!(2026-08-07 00:00:00 UTC);
        let mut stats = HashMap::new();
        stats.insert(
            "112建字第0238號".to_string(),
            DriveStats {
                folder_id: "f2".into(),
                pdf_count: 2,
                latest_pdf: "2026-08-01T00:00:00Z".into(),
            },
        );
        stats.insert(
            "113建字第0008號".to_string(),
            DriveStats {
                folder_id: "f1".into(),
                pdf_count: 3,
                latest_pdf: "2026-07-01T00:00:00Z".into(),
            },
        );
        let mut reports = HashMap::new();
        reports.insert(
            "112建字第0238號".to_string(),
            vec![
                ReportEntry {
                    filename: "a.pdf".into(),
                    created_at: String::new(),
                    status: "done".into(),
                },
                ReportEntry {
                    filename: "b.pdf".into(),
                    created_at: String::new(),
                    status: "done".into(),
                },
            ],
        );
        let non_google = vec![CloudUsage {
            permit: "111建字第0101號".into(),
            provider: "SharePoint".into(),
            url: "https://x.sharepoint.com/a".into(),
        }];

        let rows = build_rows(&stats, &reports, &non_google, now);

        let permits: Vec<&str> = rows.iter().map(|row| row.permit.as_str()).collect();
        assert_eq!(
            permits,
            vec!["113建字第0008號", "112建字第0238號", "111建字第0101號"]
        );
        assert_eq!(rows[0].state, PermitState::NotUploaded);
        assert_eq!(rows[0].days_since_update, Some(37));
        assert_eq!(rows[1].state, PermitState::Completed);
        assert_eq!(rows[2].cloud, "SharePoint");
        assert_eq!(rows[2].state, PermitState::NoReports);
    }

    #[test]
    fn csv_includes_coverage_and_status() {
        let rows = vec![PermitRow {
            permit: "113建字第0008號".into(),
            cloud: "Google Drive".into(),
            drive_count: 4,
            system_count: 2,
            latest_report: "2026-08-01T00:00:00Z".into(),
            days_since_update: Some(6),
            state: PermitState::InProgress,
        }];
        let csv = render_csv(&rows);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("permit,cloud"));
        assert_eq!(
            lines[1],
            "\"113建字第0008號\",\"Google Drive\",4,2,50%,2026-08-01,6,in_progress"
        );
    }

    #[tokio::test]
    async fn report_listing_drains_pages_and_groups_by_permit() {
        use permitsync_core::AuthClient;
        use serde_json::json;
        use wiremock::matchers::{method, path, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/reports/construction-reports/"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    {"file_name": "113建字第0008號-週報39.pdf", "created_at": "2026-08-01T00:00:00Z", "parse_status": "done"}
                ],
                "next": "page-2"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/reports/construction-reports/"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    {"file_name": "mystery.pdf", "created_at": "2026-08-02T00:00:00Z", "status": "done"}
                ],
                "next": null
            })))
            .mount(&server)
            .await;

        let jwt = {
            use base64::Engine as _;
            use base64::engine::general_purpose::URL_SAFE_NO_PAD;
            let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
            let payload = URL_SAFE_NO_PAD.encode(br#"{"exp":99999999999}"#);
            format!("{header}.{payload}.signature")
        };
        let ingest = IngestClient::new(&server.uri()).unwrap();
        let auth = AuthClient::new(&format!("{}/api/auth/refresh/", server.uri())).unwrap();
        let tokens = Arc::new(TokenProvider::new(auth, jwt, "refresh-1"));
        let ledger = Ledger::default();
        let history = History {
            uploaded_files: vec!["112建字第0238號/old.pdf".to_string()],
            ..History::default()
        };

        let grouped = fetch_reports_by_permit(&ingest, &tokens, "group-7", &ledger, &history)
            .await
            .unwrap();

        // one permit matched from the API filename, one seeded from history;
        // the unmatched record is dropped from the grouping
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["113建字第0008號"].len(), 1);
        assert_eq!(grouped["113建字第0008號"][0].status, "done");
        assert_eq!(grouped["112建字第0238號"].len(), 1);
        assert_eq!(grouped["112建字第0238號"][0].status, "uploaded");
    }

    #[test]
    fn reconcile_flags_unresolvable_and_missing_permits() {
        let mut scan = LinkScan::default();
        scan.mapping.insert(
            "113建字第0008號".to_string(),
            "https://drive.google.com/drive/folders/AAA".to_string(),
        );
        scan.mapping.insert(
            "112建字第0238號".to_string(),
            "https://drive.google.com/sharing/no-folder-here".to_string(),
        );
        scan.missed = 1;
        scan.unsupported
            .push(("111建字第0101號".to_string(), "https://1drv.ms/x".to_string()));

        let folders = vec![meta("f1", "113建字第0008號")];
        let summary = reconcile(&scan, &folders);

        assert_eq!(summary.linked, 2);
        assert_eq!(summary.missed, 1);
        assert_eq!(summary.unsupported.len(), 1);
        assert_eq!(summary.unresolvable, vec!["112建字第0238號"]);
        assert_eq!(summary.missing_remote, vec!["112建字第0238號"]);
    }
}
