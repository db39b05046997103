use std::sync::Arc;
use std::time::Duration;

use log::{Level, debug, info, log, warn};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::constants;
use crate::error::AgentError;
use crate::host::{HostStatus, LogLineKind, PrinterHost};
use crate::image_fetcher::SnapshotFetcher;
use crate::job::JobLifecycleTracker;
use crate::printer_state::{PrinterState, SharedPrinterState};
use crate::settings::{Settings, SettingsStore};
use crate::telemetry::{TelemetrySample, timestamp_now};
use crate::upload::UploadPipeline;

/// Fixed-period timer driven by a faster poll, carrying overshoot forward so
/// the average period stays on target.
#[derive(Debug)]
pub struct DriftTimer {
    period: Duration,
    last_fire: Instant,
    slack: Duration,
}

impl DriftTimer {
    pub fn new(period: Duration) -> Self {
        Self::starting_at(period, Instant::now())
    }

    pub fn starting_at(period: Duration, start: Instant) -> Self {
        Self {
            period,
            last_fire: start,
            slack: Duration::ZERO,
        }
    }

    /// Fire if at least `period - slack` has passed since the last fire.
    pub fn poll(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_fire);
        if elapsed < self.period.saturating_sub(self.slack) {
            return false;
        }
        self.slack = elapsed.saturating_sub(self.period);
        self.last_fire = now;
        true
    }

    pub fn slack(&self) -> Duration {
        self.slack
    }
}

/// Collapses a run of identical tick failures into one warning.
#[derive(Debug, Default)]
struct FailureStreak {
    count: u32,
    last: Option<String>,
}

impl FailureStreak {
    /// `Warn` for a new failure, `Debug` while the same one repeats.
    fn fail(&mut self, message: &str) -> Level {
        self.count += 1;
        if self.last.as_deref() == Some(message) {
            Level::Debug
        } else {
            self.last = Some(message.to_string());
            Level::Warn
        }
    }

    /// Failures since the last good tick, resetting the streak.
    fn recover(&mut self) -> u32 {
        self.last = None;
        std::mem::take(&mut self.count)
    }
}

/// The sampling loop: polls the host, drives the job tracker, and while a
/// job is active writes one telemetry row and grabs one frame per period.
pub struct SampleCollector {
    host: Arc<dyn PrinterHost>,
    state: SharedPrinterState,
    settings: Arc<SettingsStore>,
    tracker: JobLifecycleTracker,
    snapshots: Arc<SnapshotFetcher>,
    uploads: Arc<UploadPipeline>,
    timer: DriftTimer,
    failures: FailureStreak,
}

impl SampleCollector {
    pub fn new(
        host: Arc<dyn PrinterHost>,
        state: SharedPrinterState,
        settings: Arc<SettingsStore>,
        tracker: JobLifecycleTracker,
        snapshots: Arc<SnapshotFetcher>,
        uploads: Arc<UploadPipeline>,
    ) -> Self {
        Self {
            host,
            state,
            settings,
            tracker,
            snapshots,
            uploads,
            timer: DriftTimer::new(constants::SAMPLING_PERIOD),
            failures: FailureStreak::default(),
        }
    }

    pub fn tracker(&self) -> &JobLifecycleTracker {
        &self.tracker
    }

    /// Run until `shutdown` flips. A failed tick is logged and the next one
    /// runs as normal; an unchanged failure is only warned about once.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut poll = tokio::time::interval(constants::POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Sampling loop started, period {:?}",
            constants::SAMPLING_PERIOD
        );

        loop {
            tokio::select! {
                _ = poll.tick() => match self.tick().await {
                    Ok(()) => {
                        let failed = self.failures.recover();
                        if failed > 0 {
                            info!("Sampling recovered after {} failed ticks", failed);
                        }
                    }
                    Err(e) => {
                        let message = e.to_string();
                        log!(self.failures.fail(&message), "Sampling tick failed: {}", message);
                    }
                },
                _ = shutdown.changed() => {
                    info!("Sampling loop stopping");
                    break;
                }
            }
        }
    }

    /// One poll: read the log, update the job state machine and sample if
    /// the period has elapsed.
    pub async fn tick(&mut self) -> Result<(), AgentError> {
        if let Err(e) = self.drain_log().await {
            debug!("Could not read communication log: {}", e);
        }

        let status = self.host.status().await?;
        self.tracker.observe(&status).await?;

        if self.timer.poll(Instant::now()) {
            self.sample(&status)?;
        }
        Ok(())
    }

    async fn drain_log(&self) -> Result<(), AgentError> {
        let lines = self.host.poll_log().await?;
        if lines.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        for line in lines {
            match line.kind {
                LogLineKind::Response => {
                    if let Some(update) = state.parse_line(&line.text) {
                        debug!("Printer state update: {:?}", update);
                    }
                }
                LogLineKind::Command => state.record_terminal_command(line.text),
            }
        }
        Ok(())
    }

    fn sample(&mut self, status: &HostStatus) -> Result<(), AgentError> {
        let Some(job) = self.tracker.active_job_mut() else {
            return Ok(());
        };
        let settings = self.settings.get();
        let sample = {
            let state = self.state.lock();
            build_sample(job.sample_count, status, &state, &settings)
        };

        job.append(&sample)?;

        job.image_count += 1;
        let snapshots = self.snapshots.clone();
        let uploads = self.uploads.clone();
        let image_count = job.image_count;
        let metadata = serde_json::to_value(&sample).unwrap_or_default();
        tokio::spawn(async move {
            let Some(png) = snapshots.capture(&settings).await else {
                return;
            };
            if let Err(e) = uploads.new_image(png, image_count, metadata).await {
                warn!("Image {} upload failed: {}", image_count, e);
            }
        });

        if job.first_layer_due(sample.gcode_line) {
            if let Some(slice) = job.take_first_layer_slice()? {
                info!("Job {} passed its first layer, uploading slice", job.id);
                let uploads = self.uploads.clone();
                let id = job.id.clone();
                let gcode_path = job.gcode_path.clone();
                tokio::spawn(async move {
                    if let Err(e) = uploads.first_layer(&id, &gcode_path, &slice).await {
                        warn!("First-layer upload for {} failed: {}", id, e);
                    }
                });
            }
        }
        Ok(())
    }
}

fn build_sample(
    count: u64,
    status: &HostStatus,
    state: &PrinterState,
    settings: &Settings,
) -> TelemetrySample {
    TelemetrySample {
        count,
        timestamp: timestamp_now(),
        flow_rate: state.flow_rate_percent,
        feed_rate: state.feed_rate_percent,
        z_offset: state.z_offset_mm,
        hotend_target: status.temperatures.tool0.target,
        hotend_actual: status.temperatures.tool0.actual,
        bed_target: status.temperatures.bed.target,
        bed_actual: status.temperatures.bed.actual,
        gcode_line: state.gcode_line_number,
        gcode_cmd: state.last_gcode_command.clone(),
        nozzle_tip_coords_x: settings.nozzle_tip_coords_x,
        nozzle_tip_coords_y: settings.nozzle_tip_coords_y,
        flip_h: settings.flip_h,
        flip_v: settings.flip_v,
        rotate: settings.rotate,
    }
}
