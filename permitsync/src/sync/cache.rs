use permitsync_core::FileMeta;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::scanner::PdfItem;

/// Staleness/cost tradeoff, not a correctness requirement: downstream dedup
/// by composite id protects against re-processing items from a stale scan.
pub const CACHE_TTL: time::Duration = time::Duration::hours(24);

/// Snapshot of the last full remote scan. Consulted at run start, overwritten
/// wholesale after a live scan, never partially invalidated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanCache {
    #[serde(default)]
    pub folders: Vec<FileMeta>,
    #[serde(default)]
    pub pdfs: Vec<PdfItem>,
    #[serde(default)]
    pub last_scan: Option<String>,
}

impl ScanCache {
    pub fn is_fresh(&self, now: OffsetDateTime, ttl: time::Duration) -> bool {
        let Some(last_scan) = self.last_scan.as_deref() else {
            return false;
        };
        let Ok(scanned_at) = OffsetDateTime::parse(last_scan, &Rfc3339) else {
            return false;
        };
        now - scanned_at < ttl
    }

    /// A fresh snapshot with an empty folder list is not usable.
    pub fn folders_if_fresh(&self, now: OffsetDateTime) -> Option<&[FileMeta]> {
        (self.is_fresh(now, CACHE_TTL) && !self.folders.is_empty())
            .then_some(self.folders.as_slice())
    }

    pub fn pdfs_if_fresh(&self, now: OffsetDateTime) -> Option<&[PdfItem]> {
        (self.is_fresh(now, CACHE_TTL) && !self.pdfs.is_empty()).then_some(self.pdfs.as_slice())
    }

    /// Overwrites both item lists and the scan timestamp unconditionally.
    pub fn refresh(&mut self, folders: Vec<FileMeta>, pdfs: Vec<PdfItem>, now: OffsetDateTime) {
        self.folders = folders;
        self.pdfs = pdfs;
        self.last_scan = Some(format_rfc3339(now));
    }
}

pub fn format_rfc3339(timestamp: OffsetDateTime) -> String {
    timestamp.format(&Rfc3339).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn folder(name: &str) -> FileMeta {
        serde_json::from_value(serde_json::json!({"id": "f1", "name": name})).unwrap()
    }

    #[test]
    fn snapshot_just_inside_the_ttl_is_fresh() {
        let now = datetime!(2026-08-07 12:00:00 UTC);
        let cache = ScanCache {
            folders: vec![folder("113建字第0008號")],
            pdfs: Vec::new(),
            last_scan: Some("2026-08-06T12:01:00Z".to_string()),
        };
        assert!(cache.is_fresh(now, CACHE_TTL));
        assert!(cache.folders_if_fresh(now).is_some());
    }

    #[test]
    fn snapshot_one_second_past_the_ttl_is_stale() {
        let now = datetime!(2026-08-07 12:00:00 UTC);
        let cache = ScanCache {
            folders: vec![folder("113建字第0008號")],
            pdfs: Vec::new(),
            last_scan: Some("2026-08-06T11:59:59Z".to_string()),
        };
        assert!(!cache.is_fresh(now, CACHE_TTL));
        assert!(cache.folders_if_fresh(now).is_none());
    }

    #[test]
    fn fresh_but_empty_snapshot_is_not_usable() {
        let now = datetime!(2026-08-07 12:00:00 UTC);
        let cache = ScanCache {
            folders: Vec::new(),
            pdfs: Vec::new(),
            last_scan: Some("2026-08-07T11:00:00Z".to_string()),
        };
        assert!(cache.is_fresh(now, CACHE_TTL));
        assert!(cache.folders_if_fresh(now).is_none());
        assert!(cache.pdfs_if_fresh(now).is_none());
    }

    #[test]
    fn missing_or_unparsable_scan_time_is_stale() {
        let now = datetime!(2026-08-07 12:00:00 UTC);
        let mut cache = ScanCache::default();
        assert!(!cache.is_fresh(now, CACHE_TTL));

        cache.last_scan = Some("yesterday-ish".to_string());
        assert!(!cache.is_fresh(now, CACHE_TTL));
    }

    #[test]
    fn refresh_overwrites_everything() {
        let now = datetime!(2026-08-07 12:00:00 UTC);
        let mut cache = ScanCache {
            folders: vec![folder("old")],
            pdfs: Vec::new(),
            last_scan: Some("2020-01-01T00:00:00Z".to_string()),
        };
        cache.refresh(vec![folder("new")], Vec::new(), now);
        assert_eq!(cache.folders.len(), 1);
        assert_eq!(cache.folders[0].name, "new");
        assert_eq!(cache.last_scan.as_deref(), Some("2026-08-07T12:00:00Z"));
    }
}
