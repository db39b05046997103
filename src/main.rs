use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use tokio::sync::watch;

use layerlink::api;
use layerlink::packet::PacketBuilder;
use layerlink::webrtc::WebrtcRelay;
use layerlink::{
    CommandDispatcher, Config, FileManager, HttpTransport, JobLifecycleTracker, MoonrakerHost,
    PrinterHost, PrinterState, ReqwestTransport, SampleCollector, SettingsStore, SnapshotFetcher,
    SyncChannel, UploadPipeline, WorkerPool,
};

/// LayerLink - 3D printer telemetry and remote control agent.
#[derive(Parser)]
#[command(name = "layerlink", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the sampling and sync loops until Ctrl-C (default)
    Run,
    /// Check an auth token against the cloud and save it if valid
    TestToken { token: String },
    /// Grab one camera frame and save the URL as the snapshot source
    Snapshot {
        url: String,
        /// Write the frame here instead of printing it as base64
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// LayerLink - 3D printer telemetry and remote control agent.
///
/// Runs beside a Moonraker host. While a print is running it records a
/// telemetry row and a camera frame every 1.25 seconds and uploads them with
/// the job's G-code and first-layer data. A websocket to the cloud carries
/// live printer state out and remote commands in.
///
/// # Environment Variables
///
/// All optional:
/// * `CLOUD_URL` - Cloud service base URL (default: "https://os.matta.ai/")
/// * `MOONRAKER_API_URL` - Moonraker API endpoint (default: "http://localhost:7125")
/// * `GCODE_DIR` - Where Moonraker keeps G-code files (default: "~/printer_data/gcodes")
/// * `DATA_DIR` - Per-job working directories (default: "~/.matta")
/// * `SETTINGS_FILE` - Settings JSON (default: "<DATA_DIR>/settings.json")
/// * `UPLOAD_WORKERS` - Concurrent file transfers (default: "4")
/// * `RUST_LOG` - Log level (default: "info")
///
/// # Usage
///
/// ```bash
/// export MOONRAKER_API_URL="http://printer.local:7125"
/// layerlink test-token <TOKEN>
/// layerlink snapshot "http://printer.local/webcam/?action=snapshot" --output frame.jpg
/// layerlink
/// ```
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger to output to stdout, using RUST_LOG env var or info level by default
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Stdout)
        .filter_level(
            std::env::var("RUST_LOG")
                .ok()
                .and_then(|level| level.parse().ok())
                .unwrap_or(log::LevelFilter::Info),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("Failed to load configuration")?;
    let settings = Arc::new(
        SettingsStore::load(&config.settings_file).context("Failed to load settings")?,
    );
    let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new()?);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config, settings, transport).await,
        Command::TestToken { token } => {
            let report =
                api::test_auth_token(&transport, &settings, &config.api_url(), &token).await;
            println!("{}", report.text);
            if !report.success {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Snapshot { url, output } => {
            let report = api::take_snapshot(&transport, &settings, &url).await;
            println!("{}", report.text);
            match (&report.image, output) {
                (Some(image), Some(path)) => {
                    std::fs::write(&path, image)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    info!("Frame written to {}", path.display());
                }
                (Some(_), None) => {
                    if let Some(encoded) = report.image_base64() {
                        println!("{}", encoded);
                    }
                }
                (None, _) => std::process::exit(1),
            }
            Ok(())
        }
    }
}

async fn run(
    config: Config,
    settings: Arc<SettingsStore>,
    transport: Arc<dyn HttpTransport>,
) -> Result<()> {
    info!("LayerLink starting...");
    info!("Using Moonraker API URL: {}", config.moonraker_api_url);
    info!("Using cloud at {}", config.cloud_url);
    if settings.auth_token().is_empty() {
        error!("No auth token set. Run `layerlink test-token <TOKEN>` first.");
    }

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;

    let moonraker = Arc::new(MoonrakerHost::new(
        config.moonraker_api_url.clone(),
        config.gcode_dir.clone(),
    ));
    let host: Arc<dyn PrinterHost> = moonraker.clone();
    let files: Arc<dyn FileManager> = moonraker;
    let state = PrinterState::shared();
    let uploads = Arc::new(UploadPipeline::new(
        transport.clone(),
        settings.clone(),
        config.api_url(),
    ));

    let tracker = JobLifecycleTracker::new(
        state.clone(),
        files.clone(),
        uploads.clone(),
        config.data_dir.clone(),
    );
    let sampler = SampleCollector::new(
        host.clone(),
        state.clone(),
        settings.clone(),
        tracker,
        Arc::new(SnapshotFetcher::new(transport.clone())),
        uploads.clone(),
    );

    let sync = SyncChannel::new(
        config.websocket_url(),
        settings.clone(),
        state.clone(),
        PacketBuilder::new(host.clone(), files.clone(), state, settings.clone()),
        WebrtcRelay::new(transport, settings),
        CommandDispatcher::new(host, files, uploads, WorkerPool::new(config.upload_workers)),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sampling = tokio::spawn(sampler.run(shutdown_rx.clone()));
    let syncing = tokio::spawn(sync.run(shutdown_rx));
    info!("LayerLink initialized successfully. Press Ctrl-C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down...");
    shutdown_tx.send(true)?;

    let (sampling, syncing) = tokio::join!(sampling, syncing);
    sampling.context("Sampling loop panicked")?;
    syncing.context("Sync loop panicked")?;
    info!("LayerLink stopped");
    Ok(())
}
