use std::fmt;

use serde::{Deserialize, Serialize};

// ── HTTP payloads ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CaptionRequest {
    pub url: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub max_images: Option<usize>,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CaptionFileRequest {
    pub path: String,
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CaptionFilesRequest {
    pub paths: Vec<String>,
    #[serde(default)]
    pub prompt: Option<String>,
}

// ── Extraction ───────────────────────────────────────────────────────────────

/// Which part of the page images are collected from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Page,
    Article,
}

/// One `<img>` reference found on a page, before anything is downloaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageDescriptor {
    pub url: String,
    pub alt_text: String,
    pub title: String,
    /// Only filled in for article-scoped extraction.
    pub nearby_caption: String,
    /// 1-based position among all image elements in the scanned region.
    pub sequence_index: usize,
}

// ── Pipeline output ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CaptionRecord {
    pub image_url: String,
    pub caption: String,
    #[serde(rename = "alt")]
    pub alt_text: String,
    pub title: String,
    pub width: u32,
    pub height: u32,
    #[serde(rename = "index")]
    pub sequence_index: usize,
    #[serde(rename = "original_caption", skip_serializing_if = "Option::is_none")]
    pub nearby_caption: Option<String>,
}

/// Why a single image did not make it into the results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    #[serde(rename = "download failed")]
    DownloadFailed,
    #[serde(rename = "too small")]
    TooSmall,
    #[serde(rename = "decode error")]
    DecodeError,
    #[serde(rename = "captioning error")]
    CaptioningError,
    #[serde(rename = "read failed")]
    ReadFailed,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::DownloadFailed => "download failed",
            FailureReason::TooSmall => "too small",
            FailureReason::DecodeError => "decode error",
            FailureReason::CaptioningError => "captioning error",
            FailureReason::ReadFailed => "read failed",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    #[serde(rename = "index")]
    pub sequence_index: usize,
    #[serde(rename = "url")]
    pub image_url: String,
    #[serde(rename = "error")]
    pub error_reason: FailureReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    pub source_url: String,
    pub page_title: String,
    pub total_images_found: usize,
    pub images_processed: usize,
    pub images_failed: usize,
    pub results: Vec<CaptionRecord>,
    pub errors: Vec<FailureRecord>,
}

// ── Local file mode ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct FileCaptionRecord {
    pub image_path: String,
    pub prompt: Option<String>,
    pub caption: String,
    pub width: u32,
    pub height: u32,
    #[serde(rename = "index")]
    pub sequence_index: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileBatchSummary {
    pub results: Vec<FileCaptionRecord>,
    pub errors: Vec<FailureRecord>,
}
