use serde::{Deserialize, Serialize};

// =============================================================================
// API Request/Response Models
// =============================================================================

/// `POST /merge` のリクエストボディ
/// - 未知のフィールドや型違いはデシリアライズの段階で拒否する
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeRequest {
    pub urls: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorCode {
    InvalidInput,
    DownloadFailed,
    NoValidAudio,
    FileTooLarge,
    ProcessingFailed,
    InternalError,
}

// =============================================================================
// Fixed Messages
// =============================================================================

pub const MSG_REQUEST_MUST_BE_JSON: &str = "Request must be JSON";
pub const MSG_NON_EMPTY_URL_LIST: &str = "Request must contain a non-empty list of URLs";
pub const MSG_NO_VALID_AUDIO: &str = "No valid audio files were found";

pub fn download_failed_message(url: &str) -> String {
    format!("Failed to download file from {}", url)
}

pub const MERGED_FILE_NAME: &str = "merged.mp3";
pub const MERGED_MIME_TYPE: &str = "audio/mpeg";

// =============================================================================
// Validation
// =============================================================================

impl MergeRequest {
    /// リクエスト内容を検証し、処理対象の URL 一覧を返す
    pub fn validate(self, max_urls: usize) -> Result<Vec<String>, String> {
        if self.urls.is_empty() {
            return Err(MSG_NON_EMPTY_URL_LIST.to_string());
        }

        if self.urls.len() > max_urls {
            return Err(format!(
                "Too many URLs: {} (maximum is {})",
                self.urls.len(),
                max_urls
            ));
        }

        for url in &self.urls {
            if url.trim().is_empty() {
                return Err(MSG_NON_EMPTY_URL_LIST.to_string());
            }

            match reqwest::Url::parse(url) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
                _ => return Err(format!("Invalid URL: {}", url)),
            }
        }

        Ok(self.urls)
    }
}
