//! HTTP client abstraction for testability.
//!
//! Every outbound request the agent makes goes through [`HttpTransport`], so
//! the upload pipeline, snapshot fetcher and signaling relay can be exercised
//! against scripted mocks.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::multipart;

use crate::config::constants;
use crate::error::NetworkError;

/// Status and body of a completed HTTP exchange.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// A multipart upload: JSON metadata in the `data` field plus one file part.
///
/// Kept as plain data so retried uploads can rebuild the form per attempt.
#[derive(Debug, Clone)]
pub struct MultipartUpload {
    /// JSON metadata, sent as the `data` text field. `None` omits the field.
    pub metadata: Option<serde_json::Value>,
    pub file_field: String,
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// Trait for asynchronous HTTP operations.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// GET `url`, optionally with an auth token.
    async fn get(
        &self,
        url: &str,
        auth_token: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<HttpResponse, NetworkError>;

    /// POST a JSON body.
    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<HttpResponse, NetworkError>;

    /// POST url-encoded form fields with an auth token.
    async fn post_form(
        &self,
        url: &str,
        auth_token: &str,
        fields: &[(&str, &str)],
        timeout: Option<Duration>,
    ) -> Result<HttpResponse, NetworkError>;

    /// POST a multipart upload with an auth token.
    async fn post_multipart(
        &self,
        url: &str,
        auth_token: &str,
        upload: &MultipartUpload,
        timeout: Option<Duration>,
    ) -> Result<HttpResponse, NetworkError>;
}

/// Authorization header value for a cloud token.
pub fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

/// Real HTTP transport implementation using reqwest.
///
/// Requests that pass no timeout of their own still end after the client's
/// default request timeout.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, NetworkError> {
        Self::with_timeouts(constants::CONNECT_TIMEOUT, constants::REQUEST_TIMEOUT)
    }

    pub fn with_timeouts(
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, NetworkError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("layerlink/", env!("CARGO_PKG_VERSION")))
            .tcp_keepalive(Duration::from_secs(30))
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| NetworkError::RequestFailed {
                url: String::new(),
                reason: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            request_timeout,
        })
    }

    async fn send(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
        timeout: Option<Duration>,
    ) -> Result<HttpResponse, NetworkError> {
        let request = match timeout {
            Some(t) => request.timeout(t),
            None => request,
        };

        let response = request.send().await.map_err(|e| {
            warn!("HTTP request to {} failed: {}", url, e);
            if e.is_timeout() {
                NetworkError::Timeout {
                    url: url.to_string(),
                    timeout_seconds: timeout.unwrap_or(self.request_timeout).as_secs(),
                }
            } else {
                NetworkError::RequestFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        debug!("HTTP {} from {}", status, url);

        let body = response
            .bytes()
            .await
            .map_err(|e| NetworkError::InvalidBody {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(
        &self,
        url: &str,
        auth_token: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<HttpResponse, NetworkError> {
        let mut request = self.client.get(url);
        if let Some(token) = auth_token {
            request = request.header("Authorization", bearer(token));
        }
        self.send(url, request, timeout).await
    }

    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<HttpResponse, NetworkError> {
        let request = self.client.post(url).json(body);
        self.send(url, request, timeout).await
    }

    async fn post_form(
        &self,
        url: &str,
        auth_token: &str,
        fields: &[(&str, &str)],
        timeout: Option<Duration>,
    ) -> Result<HttpResponse, NetworkError> {
        let request = self
            .client
            .post(url)
            .header("Authorization", bearer(auth_token))
            .form(fields);
        self.send(url, request, timeout).await
    }

    async fn post_multipart(
        &self,
        url: &str,
        auth_token: &str,
        upload: &MultipartUpload,
        timeout: Option<Duration>,
    ) -> Result<HttpResponse, NetworkError> {
        let part = multipart::Part::bytes(upload.bytes.clone())
            .file_name(upload.file_name.clone())
            .mime_str(&upload.mime)
            .map_err(|e| NetworkError::RequestFailed {
                url: url.to_string(),
                reason: format!("invalid mime type '{}': {}", upload.mime, e),
            })?;

        let mut form = multipart::Form::new();
        if let Some(metadata) = &upload.metadata {
            form = form.text("data", metadata.to_string());
        }
        let form = form.part(upload.file_field.clone(), part);

        let request = self
            .client
            .post(url)
            .header("Authorization", bearer(auth_token))
            .multipart(form);
        self.send(url, request, timeout).await
    }
}


#[cfg(test)]
mod tests {
    use super::mock::silent_server;
    use super::*;

    fn csv_upload() -> MultipartUpload {
        MultipartUpload {
            metadata: Some(serde_json::json!({"name": "part"})),
            file_field: "csv_obj".to_string(),
            file_name: "print_log.csv".to_string(),
            mime: "text/csv".to_string(),
            bytes: b"count\n0\n".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_unanswered_request_hits_client_timeout() {
        let addr = silent_server().await;
        let transport =
            ReqwestTransport::with_timeouts(Duration::from_millis(200), Duration::from_millis(300))
                .unwrap();
        let url = format!("http://{}/printers/ping", addr);

        let result = tokio::time::timeout(Duration::from_secs(5), transport.get(&url, None, None))
            .await
            .expect("request outlived the client timeout");

        assert!(matches!(result, Err(NetworkError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_per_request_timeout_wins_over_client_default() {
        let addr = silent_server().await;
        let transport = ReqwestTransport::new().unwrap();
        let url = format!("http://{}/print-jobs/remote/end-job", addr);

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            transport.post_multipart(&url, "tok", &csv_upload(), Some(Duration::from_millis(200))),
        )
        .await
        .expect("request outlived its own timeout");

        assert!(matches!(result, Err(NetworkError::Timeout { .. })));
        assert!(started.elapsed() < constants::REQUEST_TIMEOUT);
    }
}
