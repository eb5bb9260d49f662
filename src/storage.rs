use crate::config::Config;
use crate::errors::AppError;
use chrono::Utc;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Path prefix repayment spreadsheets live under; the pipeline trigger
/// ignores objects outside it.
pub const REPAYMENTS_PREFIX: &str = "repayments/";

/// File store for uploaded repayment spreadsheets.
///
/// Uploads land in a local directory served under `public_base_url`; the
/// pipeline fetches files back either from that directory or, for URLs that
/// point elsewhere (e.g. an external bucket fronting the same prefix), over
/// HTTP.
#[derive(Clone)]
pub struct FileStore {
    client: reqwest::Client,
    upload_dir: PathBuf,
    public_base_url: String,
}

/// A saved upload: its object name and the URL it is reachable under.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub object_name: String,
    pub url: String,
}

impl FileStore {
    pub fn new(config: &Config) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                AppError::StorageError(format!("Failed to create download client: {}", e))
            })?;

        Ok(Self {
            client,
            upload_dir: PathBuf::from(&config.upload_dir),
            public_base_url: config.public_base_url.clone(),
        })
    }

    /// Save an uploaded spreadsheet under the repayments prefix with a
    /// timestamp-prefixed name, creating directories as needed.
    pub async fn save_repayment_sheet(
        &self,
        original_name: &str,
        bytes: &[u8],
    ) -> Result<StoredFile, AppError> {
        let object_name = format!(
            "{}{}_{}",
            REPAYMENTS_PREFIX,
            Utc::now().timestamp_millis(),
            sanitize_file_name(original_name)
        );

        let path = self.upload_dir.join(&object_name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AppError::StorageError(format!("Failed to create upload dir: {}", e))
            })?;
        }

        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| AppError::StorageError(format!("Failed to write upload: {}", e)))?;

        tracing::info!("Stored upload {} ({} bytes)", object_name, bytes.len());

        let url = self.url_for(&object_name);
        Ok(StoredFile { object_name, url })
    }

    /// Public URL for a stored object.
    pub fn url_for(&self, object_name: &str) -> String {
        format!("{}/{}", self.public_base_url, object_name)
    }

    /// Fetch the bytes of an uploaded file by URL. URLs under our own base
    /// resolve to the local store; anything else is downloaded over HTTP.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, AppError> {
        if let Some(object_name) = url.strip_prefix(&format!("{}/", self.public_base_url)) {
            // Event URLs are caller-supplied; an object path with parent or
            // root segments must never resolve outside the upload dir.
            let relative = Path::new(object_name);
            if relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
            {
                return Err(AppError::StorageError(format!(
                    "Refusing object path {}",
                    object_name
                )));
            }

            let path = self.upload_dir.join(relative);
            return tokio::fs::read(&path).await.map_err(|e| {
                AppError::StorageError(format!("Failed to read {}: {}", path.display(), e))
            });
        }

        tracing::debug!("Downloading spreadsheet from {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::StorageError(format!("Download failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::StorageError(format!(
                "Download of {} returned HTTP {}",
                url,
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AppError::StorageError(format!("Download body failed: {}", e)))?;
        Ok(bytes.to_vec())
    }
}

/// Keep file names shell- and URL-safe; anything unusual becomes '_'.
fn sanitize_file_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload");

    base.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
