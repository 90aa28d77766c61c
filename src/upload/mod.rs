//! Media uploads to the backend
//!
//! Images and recordings are posted as multipart forms authenticated with
//! the device API key. Uploads are never retried here; callers decide.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{AppError, Result};

/// Header carrying the device API key
pub const API_KEY_HEADER: &str = "api-key";

const IMAGE_ENDPOINT: &str = "camera/upload-image/";
const VIDEO_ENDPOINT: &str = "camera/upload-video/";

/// Destination for captured media
#[async_trait]
pub trait MediaUploader: Send + Sync {
    async fn upload_image(&self, path: &Path) -> Result<()>;
    async fn upload_video(&self, path: &Path) -> Result<()>;
}

/// Uploads to the backend REST API
pub struct HttpUploader {
    client: reqwest::Client,
    api_uri: String,
    api_key: String,
    device_id: String,
}

impl HttpUploader {
    pub fn new(
        client: reqwest::Client,
        api_uri: impl Into<String>,
        api_key: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_uri: api_uri.into(),
            api_key: api_key.into(),
            device_id: device_id.into(),
        }
    }
}

#[async_trait]
impl MediaUploader for HttpUploader {
    async fn upload_image(&self, path: &Path) -> Result<()> {
        let uri = format!("{}{}", self.api_uri, IMAGE_ENDPOINT);
        upload_image(&self.client, &uri, path, &self.api_key).await
    }

    async fn upload_video(&self, path: &Path) -> Result<()> {
        let uri = format!("{}{}", self.api_uri, VIDEO_ENDPOINT);
        upload_video(&self.client, &uri, path, &self.device_id, &self.api_key).await
    }
}

/// POST an image file as multipart `file`
pub async fn upload_image(
    client: &reqwest::Client,
    uri: &str,
    path: &Path,
    api_key: &str,
) -> Result<()> {
    let form = Form::new().part("file", file_part(path, "image/jpeg").await?);
    post_form(client, uri, form, api_key).await
}

/// POST a recording as multipart `file` plus the owning device id
pub async fn upload_video(
    client: &reqwest::Client,
    uri: &str,
    path: &Path,
    device_id: &str,
    api_key: &str,
) -> Result<()> {
    let form = Form::new()
        .text("uuid", device_id.to_string())
        .part("file", file_part(path, "video/webm").await?);
    post_form(client, uri, form, api_key).await
}

/// Check that `path` is an absolute path to an existing regular file
pub async fn verify_path(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(AppError::UploadFailed(format!(
            "{} is not an absolute path",
            path.display()
        )));
    }
    let metadata = tokio::fs::metadata(path).await.map_err(|e| {
        AppError::UploadFailed(format!("Failed to verify {}: {}", path.display(), e))
    })?;
    if !metadata.is_file() {
        return Err(AppError::UploadFailed(format!(
            "{} exists but is not a file",
            path.display()
        )));
    }
    Ok(())
}

async fn file_part(path: &Path, mime: &str) -> Result<Part> {
    verify_path(path).await?;
    let data = tokio::fs::read(path).await?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload".to_string());

    Part::bytes(data)
        .file_name(file_name)
        .mime_str(mime)
        .map_err(|e| AppError::UploadFailed(format!("Invalid content type {}: {}", mime, e)))
}

async fn post_form(client: &reqwest::Client, uri: &str, form: Form, api_key: &str) -> Result<()> {
    client
        .post(uri)
        .header(API_KEY_HEADER, api_key)
        .multipart(form)
        .send()
        .await
        .map_err(|e| AppError::UploadFailed(format!("Failed to post to {}: {}", uri, e)))?
        .error_for_status()
        .map_err(|e| AppError::UploadFailed(format!("Upload rejected by {}: {}", uri, e)))?;
    Ok(())
}

/// Kind of media being uploaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

/// Upload in the background, logging the outcome
pub fn spawn_upload(
    uploader: Arc<dyn MediaUploader>,
    kind: MediaKind,
    path: PathBuf,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let result = match kind {
            MediaKind::Image => uploader.upload_image(&path).await,
            MediaKind::Video => uploader.upload_video(&path).await,
        };
        match &result {
            Ok(()) => info!("Uploaded {}", path.display()),
            Err(e) => warn!("Upload of {} failed: {}", path.display(), e),
        }
        result
    })
}
