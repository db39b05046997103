//! User-facing operations behind the `test-token` and `snapshot` commands.

use std::sync::Arc;

use base64::Engine;
use log::{info, warn};

use crate::config::constants;
use crate::settings::SettingsStore;
use crate::transport::HttpTransport;

pub const PING_ENDPOINT: &str = "printers/ping";

/// Outcome of a user action, worded for display.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub success: bool,
    pub text: String,
    /// The captured frame, snapshot only.
    pub image: Option<Vec<u8>>,
}

impl StatusReport {
    pub fn image_base64(&self) -> Option<String> {
        self.image
            .as_ref()
            .map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    fn failure(text: impl Into<String>) -> Self {
        Self {
            success: false,
            text: text.into(),
            image: None,
        }
    }
}

/// Check `token` against the cloud and keep it if the cloud accepts it.
pub async fn test_auth_token(
    transport: &Arc<dyn HttpTransport>,
    settings: &SettingsStore,
    api_url: &str,
    token: &str,
) -> StatusReport {
    let token = token.trim();
    if token.is_empty() {
        return StatusReport::failure("Please enter a token.");
    }

    let url = format!("{}{}", api_url, PING_ENDPOINT);
    let response = match transport
        .get(&url, Some(token), Some(constants::SHORT_REQUEST_TIMEOUT))
        .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!("Token check failed: {}", e);
            return StatusReport::failure(
                "Error. Please check the printer host's internet connection",
            );
        }
    };

    match response.status {
        200 => {
            if let Err(e) = settings.update(|s| s.auth_token = token.to_string()) {
                warn!("Token is valid but could not be saved: {}", e);
            }
            info!("Auth token accepted");
            StatusReport {
                success: true,
                text: "All is tickety boo! Your token is valid.".to_string(),
                image: None,
            }
        }
        401 => StatusReport::failure("Whoopsie. That token is invalid."),
        status => {
            warn!("Token check answered HTTP {}", status);
            StatusReport::failure("Oh no! An unknown error occurred.")
        }
    }
}

/// Grab one raw frame from `url`, remembering it as the snapshot source.
pub async fn take_snapshot(
    transport: &Arc<dyn HttpTransport>,
    settings: &SettingsStore,
    url: &str,
) -> StatusReport {
    let url = url.trim();
    if url.is_empty() {
        return StatusReport::failure("Please enter a URL.");
    }
    if let Err(e) = settings.update(|s| s.snapshot_url = url.to_string()) {
        warn!("Could not save snapshot URL: {}", e);
    }

    match transport
        .get(url, None, Some(constants::SHORT_REQUEST_TIMEOUT))
        .await
    {
        Ok(response) if response.status == 200 => StatusReport {
            success: true,
            text: "Image captured successfully.".to_string(),
            image: Some(response.body),
        },
        Ok(response) => {
            StatusReport::failure(format!("Error: received status code {}", response.status))
        }
        Err(e) => StatusReport::failure(format!("Error when sending request: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use crate::transport::mock::MockTransport;

    const API: &str = "https://cloud.example/api/v1/";

    fn store(dir: &tempfile::TempDir) -> SettingsStore {
        SettingsStore::in_memory(dir.path().join("settings.json"), Settings::default())
    }

    #[tokio::test]
    async fn test_empty_token_is_not_sent() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockTransport::ok());
        let transport: Arc<dyn HttpTransport> = mock.clone();

        let report = test_auth_token(&transport, &store(&dir), API, "  ").await;

        assert_eq!(report, StatusReport::failure("Please enter a token."));
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_valid_token_is_saved() {
        let dir = tempfile::tempdir().unwrap();
        let settings = store(&dir);
        let mock = Arc::new(MockTransport::ok());
        let transport: Arc<dyn HttpTransport> = mock.clone();

        let report = test_auth_token(&transport, &settings, API, "abc").await;

        assert!(report.success);
        assert_eq!(report.text, "All is tickety boo! Your token is valid.");
        assert_eq!(settings.auth_token(), "abc");
        let call = &mock.calls_to(PING_ENDPOINT)[0];
        assert_eq!(call.url, "https://cloud.example/api/v1/printers/ping");
        assert_eq!(call.auth.as_deref(), Some("Bearer abc"));
    }

    #[tokio::test]
    async fn test_token_check_failures() {
        let dir = tempfile::tempdir().unwrap();
        let settings = store(&dir);
        let mock = Arc::new(MockTransport::ok());
        mock.push_status(401, b"");
        mock.push_status(503, b"");
        mock.push_error();
        let transport: Arc<dyn HttpTransport> = mock.clone();

        let texts = [
            test_auth_token(&transport, &settings, API, "bad").await.text,
            test_auth_token(&transport, &settings, API, "bad").await.text,
            test_auth_token(&transport, &settings, API, "bad").await.text,
        ];

        assert_eq!(
            texts,
            [
                "Whoopsie. That token is invalid.",
                "Oh no! An unknown error occurred.",
                "Error. Please check the printer host's internet connection",
            ]
        );
        assert_eq!(settings.auth_token(), "");
    }

    #[tokio::test]
    async fn test_snapshot_reports() {
        let dir = tempfile::tempdir().unwrap();
        let settings = store(&dir);
        let mock = Arc::new(MockTransport::new(200, b"jpeg"));
        mock.push_status(404, b"");
        let transport: Arc<dyn HttpTransport> = mock.clone();

        assert_eq!(
            take_snapshot(&transport, &settings, "").await.text,
            "Please enter a URL."
        );

        let url = "http://cam.local/snap";
        let missing = take_snapshot(&transport, &settings, url).await;
        assert_eq!(missing.text, "Error: received status code 404");
        assert!(missing.image.is_none());

        let ok = take_snapshot(&transport, &settings, url).await;
        assert!(ok.success);
        assert_eq!(ok.image.as_deref(), Some(&b"jpeg"[..]));
        assert_eq!(ok.image_base64().as_deref(), Some("anBlZw=="));
        assert_eq!(settings.get().snapshot_url, url);
    }
}
