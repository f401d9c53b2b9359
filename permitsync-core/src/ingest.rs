use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::drive::{ApiErrorClass, classify_api_status};

/// The ingestion backend runs a slow server-side analysis; a generous
/// client timeout keeps the connection open through it.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(600);
const LIST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

impl IngestError {
    pub fn classification(&self) -> ApiErrorClass {
        match self {
            IngestError::Api { status, .. } => classify_api_status(*status),
            IngestError::Request(err) if err.is_timeout() || err.is_connect() => {
                ApiErrorClass::Transient
            }
            _ => ApiErrorClass::Permanent,
        }
    }

    /// Gateway-timeout-class outcomes. The backend is known to keep
    /// processing after the connection drops, so callers treat these as
    /// probable asynchronous success rather than failure.
    pub fn is_gateway_pending(&self) -> bool {
        match self {
            IngestError::Api { status, .. } => {
                matches!(*status, StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT)
            }
            IngestError::Request(err) => err.is_timeout(),
            IngestError::Url(_) => false,
        }
    }

    pub fn is_auth_rejected(&self) -> bool {
        matches!(self, IngestError::Api { status, .. } if *status == StatusCode::UNAUTHORIZED)
    }
}

#[derive(Clone)]
pub struct IngestClient {
    http: Client,
    submit_url: Url,
    reports_url: Url,
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub file_name: String,
    pub content: Vec<u8>,
    pub scenario_id: String,
    pub language: String,
    pub group_id: String,
    pub additional_context: String,
    pub save_to_report: bool,
}

impl IngestClient {
    pub fn new(base_url: &str) -> Result<Self, IngestError> {
        let base = Url::parse(base_url)?;
        Ok(Self {
            http: Client::new(),
            submit_url: base.join("/api/reports/upload-file/")?,
            reports_url: base.join("/api/reports/construction-reports/")?,
        })
    }

    pub async fn submit(
        &self,
        token: &str,
        request: SubmitRequest,
    ) -> Result<SubmitResponse, IngestError> {
        let file_part = Part::bytes(request.content)
            .file_name(request.file_name)
            .mime_str("application/pdf")?;
        let form = Form::new()
            .part("file", file_part)
            .text("scenario_id", request.scenario_id)
            .text("language", request.language)
            .text(
                "save_to_report",
                if request.save_to_report { "true" } else { "false" },
            )
            .text("group_id", request.group_id)
            .text("additional_context", request.additional_context);

        let response = self
            .http
            .post(self.submit_url.clone())
            .header("Authorization", format!("Bearer {token}"))
            .multipart(form)
            .timeout(SUBMIT_TIMEOUT)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn list_reports(
        &self,
        token: &str,
        group_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<ReportPage, IngestError> {
        let mut url = self.reports_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("group_id", group_id);
            pairs.append_pair("page", &page.to_string());
            pairs.append_pair("page_size", &page_size.to_string());
        }
        let response = self
            .http
            .get(url)
            .header("Authorization", format!("Bearer {token}"))
            .timeout(LIST_TIMEOUT)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, IngestError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(IngestError::Api { status, body })
        }
    }
}

/// Submit response. A backend-side analysis error still carries a
/// `construction_project` when the business record was created, so the
/// caller inspects both rather than trusting `success` alone.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub report_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub construction_project: Option<ProjectRecord>,
}

#[derive(Debug, Deserialize)]
pub struct ProjectRecord {
    #[serde(default)]
    pub project_code: Option<String>,
    #[serde(default)]
    pub monitoring_report_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReportPage {
    #[serde(default)]
    pub results: Vec<ReportRecord>,
    #[serde(default)]
    pub next: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportRecord {
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub original_filename: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub parse_status: Option<String>,
}

impl ReportRecord {
    pub fn filename(&self) -> &str {
        self.file_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .or(self.original_filename.as_deref())
            .unwrap_or("")
    }

    pub fn parse_state(&self) -> &str {
        self.parse_status
            .as_deref()
            .or(self.status.as_deref())
            .unwrap_or("")
    }
}
