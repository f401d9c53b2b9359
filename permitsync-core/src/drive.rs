use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
pub const PDF_MIME: &str = "application/pdf";

const PAGE_SIZE: u32 = 1000;
const LIST_FIELDS: &str = "nextPageToken, files(id, name, size, modifiedTime, webViewLink)";

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    Permission,
    RateLimit,
    Transient,
    Permanent,
}

impl DriveError {
    pub fn classification(&self) -> ApiErrorClass {
        match self {
            DriveError::Api { status, .. } => classify_api_status(*status),
            DriveError::Request(err) if err.is_timeout() || err.is_connect() => {
                ApiErrorClass::Transient
            }
            _ => ApiErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            ApiErrorClass::RateLimit | ApiErrorClass::Transient
        )
    }

    pub fn is_permission_denied(&self) -> bool {
        self.classification() == ApiErrorClass::Permission
    }
}

pub(crate) fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if status == StatusCode::UNAUTHORIZED {
        ApiErrorClass::Auth
    } else if status == StatusCode::FORBIDDEN {
        ApiErrorClass::Permission
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT)
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// Filter expression for a file listing call. `trashed = false` is always
/// appended; everything else is optional.
#[derive(Debug, Clone, Default)]
pub struct FileQuery {
    pub parent: Option<String>,
    pub mime_type: Option<String>,
    pub modified_after: Option<String>,
}

impl FileQuery {
    pub fn folders_modified_after(timestamp: impl Into<String>) -> Self {
        Self {
            parent: None,
            mime_type: Some(FOLDER_MIME.to_string()),
            modified_after: Some(timestamp.into()),
        }
    }

    pub fn folders() -> Self {
        Self {
            parent: None,
            mime_type: Some(FOLDER_MIME.to_string()),
            modified_after: None,
        }
    }

    pub fn pdfs_in(parent: impl Into<String>) -> Self {
        Self {
            parent: Some(parent.into()),
            mime_type: Some(PDF_MIME.to_string()),
            modified_after: None,
        }
    }

    pub fn to_expression(&self) -> String {
        let mut parts = Vec::new();
        if let Some(parent) = &self.parent {
            parts.push(format!("'{parent}' in parents"));
        }
        if let Some(mime) = &self.mime_type {
            parts.push(format!("mimeType = '{mime}'"));
        }
        if let Some(threshold) = &self.modified_after {
            parts.push(format!("modifiedTime >= '{threshold}'"));
        }
        parts.push("trashed = false".to_string());
        parts.join(" and ")
    }
}

#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    token: String,
    drive_id: String,
}

impl DriveClient {
    pub fn new(
        base_url: &str,
        token: impl Into<String>,
        drive_id: impl Into<String>,
    ) -> Result<Self, DriveError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
            drive_id: drive_id.into(),
        })
    }

    pub async fn list_files(
        &self,
        query: &FileQuery,
        page_token: Option<&str>,
    ) -> Result<FileListPage, DriveError> {
        let mut url = self.endpoint("/drive/v3/files")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("q", &query.to_expression());
            pairs.append_pair("corpora", "drive");
            pairs.append_pair("driveId", &self.drive_id);
            pairs.append_pair("includeItemsFromAllDrives", "true");
            pairs.append_pair("supportsAllDrives", "true");
            pairs.append_pair("pageSize", &PAGE_SIZE.to_string());
            pairs.append_pair("fields", LIST_FIELDS);
            if let Some(token) = page_token {
                pairs.append_pair("pageToken", token);
            }
        }
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Drains pagination: follows the continuation token until absent.
    pub async fn list_files_all(&self, query: &FileQuery) -> Result<Vec<FileMeta>, DriveError> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self.list_files(query, page_token.as_deref()).await?;
            files.extend(page.files);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(files)
    }

    pub async fn download(&self, file_id: &str) -> Result<Vec<u8>, DriveError> {
        let mut url = self.endpoint(&format!("/drive/v3/files/{file_id}"))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("alt", "media");
            pairs.append_pair("supportsAllDrives", "true");
        }
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        if response.status().is_success() {
            Ok(response.bytes().await?.to_vec())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DriveError::Api { status, body })
        }
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, DriveError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DriveError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DriveError::Api { status, body })
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileMeta {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default, rename = "modifiedTime")]
    pub modified_time: Option<String>,
    #[serde(default, rename = "webViewLink")]
    pub web_view_link: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FileListPage {
    #[serde(default)]
    pub files: Vec<FileMeta>,
    #[serde(default, rename = "nextPageToken")]
    pub next_page_token: Option<String>,
}
