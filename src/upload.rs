use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_json::json;

use crate::config::constants;
use crate::error::{NetworkError, UploadError};
use crate::settings::SettingsStore;
use crate::telemetry::timestamp_now;
use crate::transport::{HttpTransport, MultipartUpload};

pub const START_JOB_ENDPOINT: &str = "print-jobs/remote/start-job";
pub const NEW_IMAGE_ENDPOINT: &str = "images/print/predict/new-image";
pub const FIRST_LAYER_ENDPOINT: &str = "print-jobs/remote/first-layer-upload";
pub const END_JOB_ENDPOINT: &str = "print-jobs/remote/end-job";
pub const BUCKET_FILE_ENDPOINT: &str = "print-jobs/printer/gcode/uploadfile";
pub const EDGE_DOWNLOAD_ENDPOINT: &str = "printers/upload-from-edge/download-request";

/// Outbound transfers to the cloud.
///
/// Start-job and image uploads make a single attempt; the caller logs and
/// drops failures. First-layer and end-job uploads retry with exponential
/// backoff and surface the final error to the job tracker.
pub struct UploadPipeline {
    transport: Arc<dyn HttpTransport>,
    settings: Arc<SettingsStore>,
    api_url: String,
    transfer_timeout: Duration,
}

impl UploadPipeline {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        settings: Arc<SettingsStore>,
        api_url: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            settings,
            api_url: api_url.into(),
            transfer_timeout: constants::TRANSFER_TIMEOUT,
        }
    }

    /// Override the per-attempt limit on G-code, CSV and user file transfers.
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    /// Send the job's G-code when a print starts. Single attempt.
    pub async fn start_job(&self, job_id: &str, gcode_path: &Path) -> Result<(), UploadError> {
        debug!("Posting gcode for {}", job_id);
        let bytes = read_file(gcode_path).await?;
        let gcode_name = file_name(gcode_path);
        let upload = MultipartUpload {
            metadata: Some(json!({
                "name": file_stem(gcode_path),
                "long_name": job_id,
                "gcode_file": gcode_name,
                "start_time": timestamp_now(),
            })),
            file_field: "gcode_obj".to_string(),
            file_name: job_id.to_string(),
            mime: "text/plain".to_string(),
            bytes,
        };
        self.post_once(START_JOB_ENDPOINT, &upload, Some(self.transfer_timeout))
            .await
    }

    /// Send one captured frame with the sample metadata. Single attempt, short timeout.
    pub async fn new_image(
        &self,
        png: Vec<u8>,
        image_count: u64,
        sample_metadata: serde_json::Value,
    ) -> Result<(), UploadError> {
        let image_name = format!("image_{}.png", image_count);
        let mut metadata = json!({
            "name": image_name,
            "img_file": image_name,
        });
        merge_json(&mut metadata, sample_metadata);
        let upload = MultipartUpload {
            metadata: Some(metadata),
            file_field: "image_obj".to_string(),
            file_name: image_name,
            mime: "image/png".to_string(),
            bytes: png,
        };
        self.post_once(
            NEW_IMAGE_ENDPOINT,
            &upload,
            Some(constants::SHORT_REQUEST_TIMEOUT),
        )
        .await
    }

    /// Send the first-layer slice of the print log. Retried.
    pub async fn first_layer(
        &self,
        job_id: &str,
        gcode_path: &Path,
        csv_path: &Path,
    ) -> Result<(), UploadError> {
        let bytes = read_file(csv_path).await?;
        let csv_name = file_name(csv_path);
        let upload = MultipartUpload {
            metadata: Some(json!({
                "name": file_stem(gcode_path),
                "long_name": job_id,
                "first_layer_csv_file": csv_name,
            })),
            file_field: "csv_obj".to_string(),
            file_name: csv_name,
            mime: "text/csv".to_string(),
            bytes,
        };
        self.post_with_retry(FIRST_LAYER_ENDPOINT, &upload).await
    }

    /// Notify the cloud that a job finished, with the full print log. Retried.
    pub async fn end_job(
        &self,
        job_id: &str,
        gcode_path: &Path,
        csv_path: &Path,
    ) -> Result<(), UploadError> {
        let bytes = read_file(csv_path).await?;
        let csv_name = file_name(csv_path);
        let upload = MultipartUpload {
            metadata: Some(json!({
                "name": file_stem(gcode_path),
                "long_name": job_id,
                "csv_file": csv_name,
                "end_time": timestamp_now(),
            })),
            file_field: "csv_obj".to_string(),
            file_name: csv_name,
            mime: "text/csv".to_string(),
            bytes,
        };
        self.post_with_retry(END_JOB_ENDPOINT, &upload).await
    }

    /// Download a file the user pointed the printer at. Retried.
    pub async fn download_from_url(&self, url: &str) -> Result<Vec<u8>, UploadError> {
        retry(url, move || async move {
            let response = self
                .transport
                .get(url, None, Some(self.transfer_timeout))
                .await
                .map_err(|e| transport_error(url, e))?;
            if !response.is_success() {
                return Err(UploadError::Rejected {
                    endpoint: url.to_string(),
                    status: response.status,
                });
            }
            Ok(response.body)
        })
        .await
    }

    /// Fetch a file stored in the cloud bucket.
    pub async fn fetch_bucket_file(&self, bucket_file: &str) -> Result<Vec<u8>, UploadError> {
        let url = self.endpoint(BUCKET_FILE_ENDPOINT);
        let token = self.settings.auth_token();
        let response = self
            .transport
            .post_form(
                &url,
                &token,
                &[("bucket_file", bucket_file)],
                Some(self.transfer_timeout),
            )
            .await
            .map_err(|e| transport_error(&url, e))?;
        if !response.is_success() {
            return Err(UploadError::Rejected {
                endpoint: url,
                status: response.status,
            });
        }
        Ok(response.body)
    }

    /// Push a local file to the cloud so the user can download it.
    pub async fn upload_for_download(&self, path: &Path) -> Result<(), UploadError> {
        let bytes = read_file(path).await?;
        let name = file_name(path);
        let upload = MultipartUpload {
            metadata: None,
            file_field: "file".to_string(),
            mime: content_type_for(&name).to_string(),
            file_name: name,
            bytes,
        };
        self.post_once(EDGE_DOWNLOAD_ENDPOINT, &upload, Some(self.transfer_timeout))
            .await
    }

    async fn post_once(
        &self,
        endpoint: &str,
        upload: &MultipartUpload,
        timeout: Option<Duration>,
    ) -> Result<(), UploadError> {
        let url = self.endpoint(endpoint);
        let token = self.settings.auth_token();
        let response = self
            .transport
            .post_multipart(&url, &token, upload, timeout)
            .await
            .map_err(|e| transport_error(&url, e))?;
        if response.is_success() {
            Ok(())
        } else {
            Err(UploadError::Rejected {
                endpoint: url,
                status: response.status,
            })
        }
    }

    async fn post_with_retry(
        &self,
        endpoint: &str,
        upload: &MultipartUpload,
    ) -> Result<(), UploadError> {
        let timeout = Some(self.transfer_timeout);
        retry(endpoint, move || self.post_once(endpoint, upload, timeout)).await?;
        info!("Uploaded {} to {}", upload.file_name, endpoint);
        Ok(())
    }
}

/// Run `attempt` up to [`constants::DURABLE_UPLOAD_ATTEMPTS`] times, sleeping
/// `2^n` seconds after the n-th failure.
async fn retry<T, F, Fut>(label: &str, mut attempt: F) -> Result<T, UploadError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, UploadError>>,
{
    let attempts = constants::DURABLE_UPLOAD_ATTEMPTS;
    let mut last_error = String::new();
    for n in 0..attempts {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_error = e.to_string();
                if n + 1 < attempts {
                    let delay = Duration::from_secs(2u64.pow(n));
                    warn!(
                        "{} failed (attempt {}): {}. Retrying in {:?}",
                        label,
                        n + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    error!("{} failed after {} attempts: {}", label, attempts, last_error);
    Err(UploadError::Exhausted {
        endpoint: label.to_string(),
        attempts,
        last_error,
    })
}

async fn read_file(path: &Path) -> Result<Vec<u8>, UploadError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| UploadError::FileRead {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

fn transport_error(endpoint: &str, err: NetworkError) -> UploadError {
    UploadError::Transport {
        endpoint: endpoint.to_string(),
        reason: err.to_string(),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Models are sent as binary, everything else as text.
pub fn content_type_for(file_name: &str) -> &'static str {
    let lower = file_name.to_lowercase();
    if lower.ends_with(".stl") || lower.ends_with(".obj") || lower.ends_with(".3mf") {
        "application/octet-stream"
    } else {
        "text/plain"
    }
}

/// Shallow-merge the keys of `extra` into `base` when both are objects.
pub fn merge_json(base: &mut serde_json::Value, extra: serde_json::Value) {
    if let (Some(base), serde_json::Value::Object(extra)) = (base.as_object_mut(), extra) {
        base.extend(extra);
    }
}
