use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

static PERMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{2,3}建字第\d{3,5}號").expect("permit regex"));
static PERMIT_PARTS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{2,3})建字第(\d{3,5})號").expect("permit parts regex"));
static DRIVE_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://drive\.google\.com[A-Za-z0-9/._?=%&-]+").expect("drive link regex")
});
static ONEDRIVE_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://(?:1drv\.ms|onedrive\.live\.com)[\w/._?=%&-]+").expect("onedrive regex")
});
static FOLDER_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/folders/([A-Za-z0-9_-]+)").expect("folder id regex"));
static QUERY_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"id=([A-Za-z0-9_-]+)").expect("query id regex"));
static GOOGLE_HOST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:drive|docs)\.google\.com").expect("google host regex"));
static GENERIC_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s)]+").expect("url regex"));
static HOST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://([^/]+)").expect("host regex"));

/// Non-Google cloud providers seen in the registry document, checked in
/// order; the short-link group last because shorteners can front anything.
static CLOUD_PROVIDERS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("SharePoint", r"(?i)sharepoint\.com[^\s]*"),
        ("Dropbox", r"(?i)dropbox\.com[^\s]*"),
        ("OneDrive", r"(?i)(?:onedrive\.live\.com|1drv\.ms)[^\s]*"),
        ("MEGA", r"(?i)mega\.nz[^\s]*"),
        ("pCloud", r"(?i)pcloud\.com[^\s]*"),
        ("GoFile", r"(?i)gofile\.io[^\s]*"),
        ("ownCloud", r"(?i)owncloud[^\s]*"),
        ("short-url", r"(?i)(?:reurl\.cc|bit\.ly|tinyurl\.com)[^\s]*"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("cloud provider regex")))
    .collect()
});

/// First permit-number match in free text. No checksum or range validation.
pub fn extract_permit(text: &str) -> Option<String> {
    PERMIT_RE.find(text).map(|found| found.as_str().to_string())
}

/// Numeric sort key `(year, serial)` for a permit number; unparsable permits
/// sort first.
pub fn permit_sort_key(permit: &str) -> (u32, u32) {
    PERMIT_PARTS_RE
        .captures(permit)
        .and_then(|caps| {
            let year = caps.get(1)?.as_str().parse().ok()?;
            let serial = caps.get(2)?.as_str().parse().ok()?;
            Some((year, serial))
        })
        .unwrap_or((0, 0))
}

/// Collapses all whitespace so URLs broken across extracted-text lines
/// rejoin before link matching.
pub fn squash_whitespace(text: &str) -> String {
    text.split_whitespace().collect()
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct LinkScan {
    pub mapping: BTreeMap<String, String>,
    /// Links on providers we can recognize but not fetch from.
    pub unsupported: Vec<(String, String)>,
    /// Identifiers whose territory held no link at all.
    pub missed: usize,
}

/// Territory-scoped link search. Identifiers and their links interleave in
/// tabular text, so a whole-document search misattributes links when several
/// pairs appear; each identifier only searches the span up to the next
/// identifier, and only the first link in that span counts.
pub fn chunk_scoped_link_search(text: &str) -> LinkScan {
    let occurrences: Vec<regex::Match<'_>> = PERMIT_RE.find_iter(text).collect();
    let mut scan = LinkScan::default();
    for (index, occurrence) in occurrences.iter().enumerate() {
        let territory_end = occurrences
            .get(index + 1)
            .map(|next| next.start())
            .unwrap_or(text.len());
        let territory = &text[occurrence.end()..territory_end];
        let permit = occurrence.as_str().to_string();

        if let Some(link) = DRIVE_LINK_RE.find(territory) {
            scan.mapping.insert(permit, link.as_str().to_string());
        } else if let Some(link) = ONEDRIVE_LINK_RE.find(territory) {
            scan.unsupported.push((permit, link.as_str().to_string()));
        } else {
            scan.missed += 1;
        }
    }
    scan
}

/// Accepts both `/folders/<id>` and `open?id=<id>` share-link shapes.
pub fn folder_id_from_url(url: &str) -> Option<String> {
    FOLDER_ID_RE
        .captures(url)
        .or_else(|| QUERY_ID_RE.captures(url))
        .map(|caps| caps[1].to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudUsage {
    pub permit: String,
    pub provider: String,
    pub url: String,
}

/// Scans a registry document for permits whose territory links to something
/// other than Google Drive. Known providers are named; any other external
/// host is reported as `other: <host>`; the registry's own portal links do
/// not count.
pub fn find_non_google_permits(text: &str) -> Vec<CloudUsage> {
    let occurrences: Vec<regex::Match<'_>> = PERMIT_RE.find_iter(text).collect();
    let mut usages = Vec::new();
    for (index, occurrence) in occurrences.iter().enumerate() {
        let territory_end = occurrences
            .get(index + 1)
            .map(|next| next.start())
            .unwrap_or(text.len());
        let territory = &text[occurrence.end()..territory_end];
        if GOOGLE_HOST_RE.is_match(territory) {
            continue;
        }
        if let Some((provider, url)) = detect_other_cloud(territory) {
            usages.push(CloudUsage {
                permit: occurrence.as_str().to_string(),
                provider,
                url,
            });
        }
    }
    usages
}

fn detect_other_cloud(territory: &str) -> Option<(String, String)> {
    for (provider, pattern) in CLOUD_PROVIDERS.iter() {
        if let Some(found) = pattern.find(territory) {
            return Some(((*provider).to_string(), found.as_str().to_string()));
        }
    }
    for found in GENERIC_URL_RE.find_iter(territory) {
        let url = found.as_str();
        if url.contains("gov.taipei") || url.contains("riskmap") {
            continue;
        }
        if let Some(host) = HOST_RE.captures(url).map(|caps| caps[1].to_string()) {
            return Some((format!("other: {host}"), url.to_string()));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_permit_takes_the_first_match() {
        let text = "卷一 113建字第0008號 之後 112建字第0238號";
        assert_eq!(extract_permit(text).as_deref(), Some("113建字第0008號"));
        assert_eq!(extract_permit("no permits here"), None);
    }

    #[test]
    fn permit_sort_key_orders_by_year_then_serial() {
        assert_eq!(permit_sort_key("113建字第0008號"), (113, 8));
        assert!(permit_sort_key("113建字第0008號") > permit_sort_key("112建字第0238號"));
        assert_eq!(permit_sort_key("not a permit"), (0, 0));
    }

    #[test]
    fn links_are_attributed_to_the_nearest_preceding_identifier() {
        let text = squash_whitespace(
            "113建字第0008號 基地 https://drive.google.com/drive/folders/AAA111 之 \
             112建字第0238號 基地 https://drive.google.com/open?id=BBB222",
        );
        let scan = chunk_scoped_link_search(&text);

        assert_eq!(
            scan.mapping.get("113建字第0008號").map(String::as_str),
            Some("https://drive.google.com/drive/folders/AAA111")
        );
        assert_eq!(
            scan.mapping.get("112建字第0238號").map(String::as_str),
            Some("https://drive.google.com/open?id=BBB222")
        );
        assert_eq!(scan.missed, 0);
    }

    #[test]
    fn only_the_first_link_in_a_territory_counts() {
        let text = squash_whitespace(
            "113建字第0008號 https://drive.google.com/drive/folders/FIRST 或 \
             https://drive.google.com/drive/folders/SECOND",
        );
        let scan = chunk_scoped_link_search(&text);
        assert_eq!(
            scan.mapping.get("113建字第0008號").map(String::as_str),
            Some("https://drive.google.com/drive/folders/FIRST")
        );
    }

    #[test]
    fn territory_without_a_link_is_a_miss_not_an_error() {
        let text = squash_whitespace(
            "113建字第0008號 紙本送件 112建字第0238號 https://drive.google.com/drive/folders/CCC",
        );
        let scan = chunk_scoped_link_search(&text);
        assert_eq!(scan.missed, 1);
        assert!(!scan.mapping.contains_key("113建字第0008號"));
        assert!(scan.mapping.contains_key("112建字第0238號"));
    }

    #[test]
    fn onedrive_links_are_detected_but_unsupported() {
        let text = squash_whitespace("111建字第0101號 https://1drv.ms/f/s_AbCd123");
        let scan = chunk_scoped_link_search(&text);
        assert!(scan.mapping.is_empty());
        assert_eq!(scan.unsupported.len(), 1);
        assert_eq!(scan.unsupported[0].0, "111建字第0101號");
        assert_eq!(scan.missed, 0);
    }

    #[test]
    fn folder_id_supports_both_share_link_shapes() {
        assert_eq!(
            folder_id_from_url("https://drive.google.com/drive/folders/AbC_12-3?usp=sharing")
                .as_deref(),
            Some("AbC_12-3")
        );
        assert_eq!(
            folder_id_from_url("https://drive.google.com/open?id=Xyz789").as_deref(),
            Some("Xyz789")
        );
        assert_eq!(folder_id_from_url("https://drive.google.com/file/preview"), None);
    }

    #[test]
    fn squash_whitespace_rejoins_broken_urls() {
        let text = "https://drive.google.com/drive/\nfolders/AAA";
        assert_eq!(
            squash_whitespace(text),
            "https://drive.google.com/drive/folders/AAA"
        );
    }

    #[test]
    fn non_google_providers_are_classified_per_territory() {
        let text = "113建字第0008號 https://company.sharepoint.com/sites/site1\n\
                    112建字第0238號 https://drive.google.com/drive/folders/AAA\n\
                    111建字第0101號 https://reurl.cc/abc123\n";
        let usages = find_non_google_permits(text);

        assert_eq!(usages.len(), 2);
        assert_eq!(usages[0].permit, "113建字第0008號");
        assert_eq!(usages[0].provider, "SharePoint");
        assert_eq!(usages[1].permit, "111建字第0101號");
        assert_eq!(usages[1].provider, "short-url");
    }

    #[test]
    fn unknown_external_hosts_are_reported_with_their_domain() {
        let text = "113建字第0008號 https://files.example.com.tw/x/1 下載";
        let usages = find_non_google_permits(text);
        assert_eq!(usages.len(), 1);
        assert_eq!(usages[0].provider, "other: files.example.com.tw");
    }

    #[test]
    fn registry_portal_links_do_not_count_as_cloud_usage() {
        let text = "113建字第0008號 https://www-ws.gov.taipei/dl/path.pdf";
        assert!(find_non_google_permits(text).is_empty());
    }
}
