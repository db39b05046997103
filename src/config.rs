use std::path::PathBuf;

use crate::error::ConfigError;

/// Process configuration for the layerlink agent loaded from environment variables.
///
/// These are the values an operator sets once per installation. Anything the
/// user edits at runtime (token, camera URLs, image transforms) lives in the
/// [`SettingsStore`](crate::settings::SettingsStore) instead.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the cloud service, always ending with `/`.
    ///
    /// Environment variable: `CLOUD_URL`
    pub cloud_url: String,

    /// Moonraker API URL for printer control.
    ///
    /// This should point to the Moonraker API endpoint (typically on port 7125).
    /// Environment variable: `MOONRAKER_API_URL`
    pub moonraker_api_url: String,

    /// Directory Moonraker stores G-code files in.
    ///
    /// Environment variable: `GCODE_DIR`
    pub gcode_dir: PathBuf,

    /// Root for per-job working directories.
    ///
    /// Environment variable: `DATA_DIR`
    pub data_dir: PathBuf,

    /// JSON file holding the user-editable settings.
    ///
    /// Environment variable: `SETTINGS_FILE`
    pub settings_file: PathBuf,

    /// Number of concurrent file transfers dispatched from cloud commands.
    ///
    /// Environment variable: `UPLOAD_WORKERS`
    pub upload_workers: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is present but cannot be parsed:
    /// - `CLOUD_URL`: Cloud service URL (default: "https://os.matta.ai/")
    /// - `MOONRAKER_API_URL`: Moonraker API URL (default: "http://localhost:7125")
    /// - `GCODE_DIR`: G-code directory (default: "~/printer_data/gcodes")
    /// - `DATA_DIR`: Job data directory (default: "~/.matta")
    /// - `SETTINGS_FILE`: Settings file (default: "<DATA_DIR>/settings.json")
    /// - `UPLOAD_WORKERS`: File transfer concurrency (default: "4")
    pub fn load() -> Result<Self, ConfigError> {
        let home = home_dir();

        let cloud_url = normalize_base_url(
            &std::env::var("CLOUD_URL").unwrap_or_else(|_| constants::DEFAULT_CLOUD_URL.to_string()),
        );

        let moonraker_api_url = std::env::var("MOONRAKER_API_URL")
            .unwrap_or_else(|_| "http://localhost:7125".to_string())
            .trim_end_matches('/')
            .to_string();

        let gcode_dir = std::env::var("GCODE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join("printer_data").join("gcodes"));

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".matta"));

        let settings_file = std::env::var("SETTINGS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("settings.json"));

        let upload_workers_raw =
            std::env::var("UPLOAD_WORKERS").unwrap_or_else(|_| "4".to_string());
        let upload_workers = upload_workers_raw
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "UPLOAD_WORKERS".to_string(),
                value: upload_workers_raw.clone(),
                reason: "must be a positive integer".to_string(),
            })?;

        Ok(Config {
            cloud_url,
            moonraker_api_url,
            gcode_dir,
            data_dir,
            settings_file,
            upload_workers,
        })
    }

    /// Cloud REST API base, e.g. `https://os.matta.ai/api/v1/`.
    pub fn api_url(&self) -> String {
        api_url(&self.cloud_url)
    }

    /// Websocket endpoint the sync channel connects to, without the token.
    pub fn websocket_url(&self) -> String {
        websocket_url(&self.cloud_url)
    }
}

/// Make sure a base URL ends with a slash so relative paths can be appended.
pub fn normalize_base_url(url: &str) -> String {
    let url = url.trim();
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{}/", url)
    }
}

pub fn api_url(cloud_url: &str) -> String {
    format!("{}api/v1/", normalize_base_url(cloud_url))
}

/// `http` becomes `ws` and `https` becomes `wss`.
pub fn websocket_url(cloud_url: &str) -> String {
    let base = normalize_base_url(cloud_url);
    let base = match base.strip_prefix("http") {
        Some(rest) => format!("ws{}", rest),
        None => base,
    };
    format!("{}api/v1/ws/printer", base)
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Application constants used throughout the system.
pub mod constants {
    use std::time::Duration;

    pub const DEFAULT_CLOUD_URL: &str = "https://os.matta.ai/";

    /// Target period of the sampling loop.
    pub const SAMPLING_PERIOD: Duration = Duration::from_millis(1250);

    /// How often the sampling loop wakes up to check its timer and the host.
    pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// Sync send interval while a remote viewer is online.
    pub const ONLINE_SEND_INTERVAL: Duration = Duration::from_millis(1250);

    /// Sync send interval while nobody is watching.
    pub const OFFLINE_SEND_INTERVAL: Duration = Duration::from_secs(30);

    /// Pause between websocket reconnect attempts.
    pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

    /// Timeout for snapshot fetches, image uploads and WebRTC signaling.
    pub const SHORT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// TCP connect limit for HTTP requests, and for the whole websocket handshake.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Whole-request limit for any HTTP request that sets none of its own.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

    /// Per-attempt limit for G-code, CSV and user file transfers.
    pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

    /// Attempts made by retried (durable) uploads and file downloads.
    pub const DURABLE_UPLOAD_ATTEMPTS: u32 = 3;

    /// Consecutive snapshot failures that open the breaker (more than three).
    pub const SNAPSHOT_FAILURE_LIMIT: u32 = 4;

    /// How long a failing snapshot URL stays on the denylist.
    pub const SNAPSHOT_COOLDOWN: Duration = Duration::from_secs(120);

    /// Failed finalize uploads before a job is force-reset.
    pub const FINALIZE_FAILURE_LIMIT: u32 = 3;

    /// Lines past the first layer end before the first-layer CSV is sent.
    pub const FIRST_LAYER_LINE_BUFFER: u64 = 8;

    /// Number of terminal command echoes kept for the sync packet.
    pub const TERMINAL_BUFFER_CAPACITY: usize = 100;

    /// Public STUN server handed to the camera streamer.
    pub const STUN_SERVER: &str = "stun:stun.l.google.com:19302";
}
