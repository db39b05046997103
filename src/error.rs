use std::fmt;

/// Custom error types for the layerlink agent.
///
/// Each subsystem gets its own error enum so callers can decide which
/// failures are retried, which are logged and dropped, and which force a
/// reconnect or a job reset.

/// Main error type for agent operations.
#[derive(Debug)]
pub enum AgentError {
    /// Errors raised by the cloud upload pipeline.
    Upload(UploadError),

    /// Low level HTTP transport errors.
    Network(NetworkError),

    /// Errors from the host printer runtime or file manager.
    Host(HostError),

    /// Errors on the realtime sync connection.
    Sync(SyncError),

    /// Configuration and settings errors.
    Config(ConfigError),

    /// Local job storage errors (working directory, CSV log).
    Storage(StorageError),
}

/// Errors specific to cloud uploads.
#[derive(Debug)]
pub enum UploadError {
    /// The local file to upload could not be read.
    FileRead { path: String, reason: String },

    /// The request never produced a response.
    Transport { endpoint: String, reason: String },

    /// The cloud answered with a non-2xx status.
    Rejected { endpoint: String, status: u16 },

    /// Every attempt of a retried upload failed.
    Exhausted {
        endpoint: String,
        attempts: u32,
        last_error: String,
    },
}

/// Errors related to network connectivity and communication.
#[derive(Debug)]
pub enum NetworkError {
    /// Generic network request failed.
    RequestFailed { url: String, reason: String },

    /// Network timeout occurred.
    Timeout { url: String, timeout_seconds: u64 },

    /// The response body could not be read or decoded.
    InvalidBody { url: String, reason: String },
}

/// Errors from the host printer runtime and file manager.
#[derive(Debug)]
pub enum HostError {
    /// Failed to connect to the printer API.
    ConnectionFailed { api_url: String, reason: String },

    /// Printer API returned an error response.
    ApiError {
        endpoint: String,
        status: u16,
        message: String,
    },

    /// Printer is in an invalid state for the requested operation.
    InvalidState {
        requested_action: String,
        current_state: String,
    },

    /// The printer API answered with a payload we could not interpret.
    InvalidResponse { endpoint: String, reason: String },
}

/// Errors on the realtime sync connection.
#[derive(Debug)]
pub enum SyncError {
    /// No auth token is configured, so there is nothing to connect with.
    MissingToken,

    /// The websocket handshake failed.
    ConnectFailed { url: String, reason: String },

    /// Reading or writing a frame failed.
    Socket { reason: String },

    /// The cloud closed the connection.
    Closed,
}

/// Errors related to configuration and settings persistence.
#[derive(Debug)]
pub enum ConfigError {
    /// Settings file could not be read.
    FileReadError { path: String, reason: String },

    /// Settings file could not be written.
    FileWriteError { path: String, reason: String },

    /// Invalid configuration values provided.
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Errors touching the per-job working directory.
#[derive(Debug)]
pub enum StorageError {
    /// Creating, writing or removing a path failed.
    Io { path: String, reason: String },

    /// The CSV writer rejected a row.
    Csv { path: String, reason: String },
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Upload(e) => write!(f, "Upload error: {}", e),
            AgentError::Network(e) => write!(f, "Network error: {}", e),
            AgentError::Host(e) => write!(f, "Host error: {}", e),
            AgentError::Sync(e) => write!(f, "Sync error: {}", e),
            AgentError::Config(e) => write!(f, "Configuration error: {}", e),
            AgentError::Storage(e) => write!(f, "Storage error: {}", e),
        }
    }
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadError::FileRead { path, reason } => {
                write!(f, "Failed to read upload file '{}': {}", path, reason)
            }
            UploadError::Transport { endpoint, reason } => {
                write!(f, "Upload to '{}' failed: {}", endpoint, reason)
            }
            UploadError::Rejected { endpoint, status } => {
                write!(f, "Upload to '{}' rejected with HTTP {}", endpoint, status)
            }
            UploadError::Exhausted {
                endpoint,
                attempts,
                last_error,
            } => {
                write!(
                    f,
                    "Upload to '{}' failed after {} attempts: {}",
                    endpoint, attempts, last_error
                )
            }
        }
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::RequestFailed { url, reason } => {
                write!(f, "Network request to '{}' failed: {}", url, reason)
            }
            NetworkError::Timeout {
                url,
                timeout_seconds,
            } => {
                write!(
                    f,
                    "Request to '{}' timed out after {} seconds",
                    url, timeout_seconds
                )
            }
            NetworkError::InvalidBody { url, reason } => {
                write!(f, "Invalid response body from '{}': {}", url, reason)
            }
        }
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::ConnectionFailed { api_url, reason } => {
                write!(
                    f,
                    "Failed to connect to printer at '{}': {}",
                    api_url, reason
                )
            }
            HostError::ApiError {
                endpoint,
                status,
                message,
            } => {
                write!(
                    f,
                    "Printer API error at '{}' (HTTP {}): {}",
                    endpoint, status, message
                )
            }
            HostError::InvalidState {
                requested_action,
                current_state,
            } => {
                write!(
                    f,
                    "Cannot {} printer in state '{}'",
                    requested_action, current_state
                )
            }
            HostError::InvalidResponse { endpoint, reason } => {
                write!(f, "Unexpected response from '{}': {}", endpoint, reason)
            }
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::MissingToken => write!(f, "No auth token configured"),
            SyncError::ConnectFailed { url, reason } => {
                write!(f, "Failed to connect websocket '{}': {}", url, reason)
            }
            SyncError::Socket { reason } => write!(f, "Websocket failure: {}", reason),
            SyncError::Closed => write!(f, "Websocket closed by peer"),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileReadError { path, reason } => {
                write!(f, "Failed to read settings file '{}': {}", path, reason)
            }
            ConfigError::FileWriteError { path, reason } => {
                write!(f, "Failed to write settings file '{}': {}", path, reason)
            }
            ConfigError::InvalidValue {
                field,
                value,
                reason,
            } => {
                write!(
                    f,
                    "Invalid value '{}' for field '{}': {}",
                    value, field, reason
                )
            }
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io { path, reason } => write!(f, "I/O on '{}' failed: {}", path, reason),
            StorageError::Csv { path, reason } => {
                write!(f, "CSV write to '{}' failed: {}", path, reason)
            }
        }
    }
}

impl std::error::Error for AgentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AgentError::Upload(e) => Some(e),
            AgentError::Network(e) => Some(e),
            AgentError::Host(e) => Some(e),
            AgentError::Sync(e) => Some(e),
            AgentError::Config(e) => Some(e),
            AgentError::Storage(e) => Some(e),
        }
    }
}

impl std::error::Error for UploadError {}
impl std::error::Error for NetworkError {}
impl std::error::Error for HostError {}
impl std::error::Error for SyncError {}
impl std::error::Error for ConfigError {}
impl std::error::Error for StorageError {}

impl From<UploadError> for AgentError {
    fn from(err: UploadError) -> Self {
        AgentError::Upload(err)
    }
}

impl From<NetworkError> for AgentError {
    fn from(err: NetworkError) -> Self {
        AgentError::Network(err)
    }
}

impl From<HostError> for AgentError {
    fn from(err: HostError) -> Self {
        AgentError::Host(err)
    }
}

impl From<SyncError> for AgentError {
    fn from(err: SyncError) -> Self {
        AgentError::Sync(err)
    }
}

impl From<ConfigError> for AgentError {
    fn from(err: ConfigError) -> Self {
        AgentError::Config(err)
    }
}

impl From<StorageError> for AgentError {
    fn from(err: StorageError) -> Self {
        AgentError::Storage(err)
    }
}

impl StorageError {
    pub(crate) fn io(path: &std::path::Path, err: std::io::Error) -> Self {
        StorageError::Io {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }
}
