//! Remote input: download a document by URL.

use crate::error::PipelineError;
use std::path::Path;
use tracing::info;

/// Extension used when the URL path does not name one.
pub const FALLBACK_EXTENSION: &str = "pdf";

/// A downloaded file and the extension its URL suggests.
#[derive(Debug, Clone)]
pub struct Download {
    pub bytes: Vec<u8>,
    pub extension: String,
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Lower-cased extension of the last URL path segment.
pub fn extension_from_url(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    extension_of(last)
}

/// Lower-cased extension of a file name or path.
pub fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(|e| e.to_ascii_lowercase())
}

/// Fetch `url` into memory.
pub async fn download(url: &str, timeout_secs: u64) -> Result<Download, PipelineError> {
    info!("Downloading document from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| PipelineError::Internal(format!("HTTP client: {e}")))?;

    let failed = |e: reqwest::Error| {
        if e.is_timeout() {
            PipelineError::Timeout {
                stage: "download",
                secs: timeout_secs,
            }
        } else {
            PipelineError::StorageUnavailable(format!("download of {url} failed: {e}"))
        }
    };

    let response = client.get(url).send().await.map_err(failed)?;
    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(PipelineError::ArtifactNotFound {
            key: url.to_string(),
        });
    }
    if !status.is_success() {
        return Err(PipelineError::StorageUnavailable(format!(
            "download of {url} failed: HTTP {status}"
        )));
    }

    let bytes = response.bytes().await.map_err(failed)?.to_vec();
    let extension = extension_from_url(url).unwrap_or_else(|| FALLBACK_EXTENSION.to_string());
    info!("Downloaded {} bytes (.{})", bytes.len(), extension);
    Ok(Download { bytes, extension })
}
