//! LayerLink - edge agent streaming 3D-printer telemetry to the cloud.
//!
//! The agent runs next to a printer-control host and keeps two loops going
//! for the life of the process: a sampling loop that records telemetry rows,
//! camera frames and job uploads while a print runs, and a sync loop that
//! holds a websocket to the cloud for live state and remote commands.
//!
//! # Core Components
//!
//! * [`config`] - Environment configuration and tuning constants
//! * [`settings`] - User-editable settings persisted as JSON
//! * [`printer_state`] - Shared printer state fed by the communication log
//! * [`job`] - Job lifecycle state machine and per-job working directory
//! * [`sampler`] - Drift-compensated sampling loop
//! * [`first_layer`] - First-layer end detection over G-code
//! * [`image_fetcher`] - Camera snapshots with a bad-URL circuit breaker
//! * [`upload`] - Multipart uploads to the cloud, with retries where durable
//! * [`sync`] - Websocket sync channel and inbound message handling
//! * [`dispatcher`] - Printer commands and the file-transfer worker pool
//! * [`moonraker`] - Moonraker (Klipper) host adapter
//! * [`error`] - Error types shared across the crate
//!
//! # Quick Start
//!
//! ```no_run
//! use layerlink::*;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let settings = SettingsStore::load(&config.settings_file)?;
//! println!("syncing as {} with {}", settings.get().auth_token, config.websocket_url());
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod breaker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod first_layer;
pub mod gcode;
pub mod host;
pub mod image_fetcher;
pub mod job;
pub mod moonraker;
pub mod packet;
pub mod printer_state;
pub mod sampler;
pub mod settings;
pub mod sync;
pub mod system;
pub mod telemetry;
pub mod transport;
pub mod upload;
pub mod webrtc;

// Re-export commonly used types for convenience
pub use breaker::CircuitBreaker;
pub use config::Config;
pub use dispatcher::{CommandDispatcher, PrinterCommand, WorkerPool};
pub use error::AgentError;
pub use first_layer::FirstLayer;
pub use host::{FileManager, HostStatus, PrinterHost};
pub use image_fetcher::SnapshotFetcher;
pub use job::{Job, JobLifecycleTracker, JobPhase};
pub use moonraker::MoonrakerHost;
pub use printer_state::{PrinterState, SharedPrinterState};
pub use sampler::SampleCollector;
pub use settings::{Settings, SettingsStore};
pub use sync::SyncChannel;
pub use telemetry::TelemetrySample;
pub use transport::{HttpTransport, ReqwestTransport};
pub use upload::UploadPipeline;
