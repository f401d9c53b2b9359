use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::sync::driver::DriverOptions;

/// Non-recoverable startup failure (missing credentials, unreachable
/// listing service, empty registry). The process exits with a distinct
/// status; per-item failures never raise this.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SetupFailure(pub String);

const DEFAULT_DRIVE_API_BASE: &str = "https://www.googleapis.com";
const DEFAULT_INGEST_API_BASE: &str = "https://riskmap.today";
const DEFAULT_REGISTRY_URL: &str =
    "https://www-ws.gov.taipei/001/Upload/845/relfile/-1/845/2a1b5b50-13e7-4378-bcb2-03888bf5c462.pdf";
const DEFAULT_STATE_DIR: &str = "./state";
const DEFAULT_SCENARIO_ID: &str = "construction_safety_pdf";
const DEFAULT_LANGUAGE: &str = "zh-TW";
const DEFAULT_RECENT_DAYS: u64 = 7;
const DEFAULT_MAX_UPLOADS: u64 = 500;
const DEFAULT_DELAY_SECS: u64 = 5;
const DEFAULT_WORKERS: u64 = 1;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub drive_api_base: String,
    pub drive_token: String,
    pub drive_id: String,
    pub ingest_api_base: String,
    pub auth_refresh_url: String,
    pub jwt_token: String,
    pub refresh_token: String,
    pub group_id: String,
    pub scenario_id: String,
    pub language: String,
    pub registry_url: String,
    pub state_dir: PathBuf,
    pub recent_days: u64,
    pub max_uploads: usize,
    pub delay_secs: u64,
    pub workers: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, SetupFailure> {
        let ingest_api_base = env_or("PERMITSYNC_INGEST_API_BASE", DEFAULT_INGEST_API_BASE);
        let auth_refresh_url = std::env::var("PERMITSYNC_AUTH_REFRESH_URL")
            .ok()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| format!("{}/api/auth/refresh/", ingest_api_base.trim_end_matches('/')));

        Ok(Self {
            drive_api_base: env_or("PERMITSYNC_DRIVE_API_BASE", DEFAULT_DRIVE_API_BASE),
            drive_token: require_env("PERMITSYNC_DRIVE_TOKEN")?,
            drive_id: require_env("PERMITSYNC_DRIVE_ID")?,
            ingest_api_base,
            auth_refresh_url,
            jwt_token: require_env("PERMITSYNC_JWT_TOKEN")?,
            refresh_token: require_env("PERMITSYNC_REFRESH_TOKEN")?,
            group_id: require_env("PERMITSYNC_GROUP_ID")?,
            scenario_id: env_or("PERMITSYNC_SCENARIO_ID", DEFAULT_SCENARIO_ID),
            language: env_or("PERMITSYNC_LANGUAGE", DEFAULT_LANGUAGE),
            registry_url: env_or("PERMITSYNC_REGISTRY_URL", DEFAULT_REGISTRY_URL),
            state_dir: PathBuf::from(env_or("PERMITSYNC_STATE_DIR", DEFAULT_STATE_DIR)),
            recent_days: read_u64_env("PERMITSYNC_RECENT_DAYS", DEFAULT_RECENT_DAYS),
            max_uploads: read_u64_env("PERMITSYNC_MAX_UPLOADS", DEFAULT_MAX_UPLOADS) as usize,
            delay_secs: read_u64_env("PERMITSYNC_DELAY_SECS", DEFAULT_DELAY_SECS),
            workers: read_u64_env("PERMITSYNC_WORKERS", DEFAULT_WORKERS).max(1) as usize,
        })
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir.join("uploaded_reports.json")
    }

    pub fn history_path(&self) -> PathBuf {
        self.state_dir.join("upload_history.json")
    }

    pub fn tracking_csv_path(&self) -> PathBuf {
        self.state_dir.join("permit_tracking.csv")
    }

    pub fn driver_options(&self) -> DriverOptions {
        DriverOptions {
            scenario_id: self.scenario_id.clone(),
            language: self.language.clone(),
            group_id: self.group_id.clone(),
            recent_days: self.recent_days,
            max_uploads: self.max_uploads,
            delay_between_items: Duration::from_secs(self.delay_secs),
            workers: self.workers,
            ..DriverOptions::default()
        }
    }
}

fn require_env(name: &str) -> Result<String, SetupFailure> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| SetupFailure(format!("{name} must be set")))
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    parse_u64(std::env::var(name).ok().as_deref(), default)
}

fn parse_u64(value: Option<&str>, default: u64) -> u64 {
    value
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_u64_falls_back_on_missing_or_invalid_values() {
        assert_eq!(parse_u64(None, 7), 7);
        assert_eq!(parse_u64(Some("not a number"), 7), 7);
        assert_eq!(parse_u64(Some("12"), 7), 12);
    }
}
