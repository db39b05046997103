use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::breaker::CircuitBreaker;
use crate::config::constants;
use crate::error::StorageError;
use crate::first_layer::{self, FirstLayer};
use crate::gcode::GcodeIndex;
use crate::host::{FileManager, HostStatus};
use crate::printer_state::SharedPrinterState;
use crate::telemetry::{CsvLog, TelemetrySample, timestamp_now};
use crate::upload::UploadPipeline;

const PRINT_LOG_NAME: &str = "print_log.csv";
const FIRST_LAYER_LOG_NAME: &str = "first_layer.csv";

/// `part.gcode` started at `2024-01-01T00:00:00.000Z` becomes
/// `part_2024-01-01T00:00:00.000Z`.
pub fn make_job_id(file_name: &str, timestamp: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    format!("{}_{}", stem, timestamp)
}

/// Create `working_dir` and the print log inside it.
///
/// On failure the directory is removed again so no half-made job is left
/// under the data directory.
async fn open_print_log(working_dir: &Path, csv_path: &Path) -> Result<CsvLog, StorageError> {
    tokio::fs::create_dir_all(working_dir)
        .await
        .map_err(|e| StorageError::io(working_dir, e))?;

    match CsvLog::create(csv_path) {
        Ok(log) => Ok(log),
        Err(e) => {
            error!("Could not open print log {}: {}", csv_path.display(), e);
            if let Err(rm) = tokio::fs::remove_dir_all(working_dir).await {
                warn!(
                    "Failed to remove working directory {}: {}",
                    working_dir.display(),
                    rm
                );
            }
            Err(e)
        }
    }
}

/// One print attempt being recorded.
pub struct Job {
    pub id: String,
    pub gcode_path: PathBuf,
    pub working_dir: PathBuf,
    pub csv_path: PathBuf,
    pub first_layer_csv_path: PathBuf,
    pub first_layer_end_line: Option<u64>,
    pub first_layer_uploaded: bool,
    pub image_count: u64,
    pub sample_count: u64,
    pub upload_attempts: u32,
    log: Option<CsvLog>,
    index: GcodeIndex,
}

impl Job {
    /// Append a row to the print log. A closed log drops the row.
    pub fn append(&mut self, sample: &TelemetrySample) -> Result<(), StorageError> {
        match self.log.as_mut() {
            Some(log) => {
                log.append(sample)?;
                self.sample_count += 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// True once the host has read past the first layer plus a safety buffer
    /// and the slice has not been sent yet.
    pub fn first_layer_due(&self, gcode_line: Option<u64>) -> bool {
        match (self.first_layer_end_line, gcode_line) {
            (Some(end), Some(line)) => {
                !self.first_layer_uploaded && line > end + constants::FIRST_LAYER_LINE_BUFFER
            }
            _ => false,
        }
    }

    /// Copy the print log written so far to the first-layer slice and mark
    /// the slice as taken. Only ever succeeds once per job.
    pub fn take_first_layer_slice(&mut self) -> Result<Option<PathBuf>, StorageError> {
        if self.first_layer_uploaded {
            return Ok(None);
        }
        std::fs::copy(&self.csv_path, &self.first_layer_csv_path)
            .map_err(|e| StorageError::io(&self.first_layer_csv_path, e))?;
        self.first_layer_uploaded = true;
        Ok(Some(self.first_layer_csv_path.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Idle,
    Active,
    Finishing,
}

/// Detects job start and finish from host status and owns the job's
/// working directory for its whole life.
///
/// Finishing jobs retry their final upload on every poll until it succeeds
/// or [`constants::FINALIZE_FAILURE_LIMIT`] attempts have failed, after
/// which the job is dropped so the tracker can never get stuck.
pub struct JobLifecycleTracker {
    state: SharedPrinterState,
    files: Arc<dyn FileManager>,
    uploads: Arc<UploadPipeline>,
    data_dir: PathBuf,
    phase: JobPhase,
    job: Option<Job>,
    finalize_breaker: CircuitBreaker<String>,
}

impl JobLifecycleTracker {
    pub fn new(
        state: SharedPrinterState,
        files: Arc<dyn FileManager>,
        uploads: Arc<UploadPipeline>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            state,
            files,
            uploads,
            data_dir: data_dir.into(),
            phase: JobPhase::Idle,
            job: None,
            finalize_breaker: CircuitBreaker::new(
                constants::FINALIZE_FAILURE_LIMIT,
                std::time::Duration::ZERO,
            ),
        }
    }

    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    pub fn job(&self) -> Option<&Job> {
        self.job.as_ref()
    }

    /// The job being recorded, only while it is active.
    pub fn active_job_mut(&mut self) -> Option<&mut Job> {
        match self.phase {
            JobPhase::Active => self.job.as_mut(),
            _ => None,
        }
    }

    /// Feed one host status poll through the state machine.
    pub async fn observe(&mut self, status: &HostStatus) -> Result<(), StorageError> {
        match self.phase {
            JobPhase::Idle => {
                let job_running = self.state.lock().current_job_id.is_some();
                if status.has_job() && !job_running {
                    self.start(status).await?;
                }
            }
            JobPhase::Active => {
                let was_printing = self.state.lock().is_printing;
                if was_printing && !status.has_job() {
                    self.finish();
                    self.finalize().await;
                } else {
                    self.track_position(status);
                }
            }
            JobPhase::Finishing => self.finalize().await,
        }
        Ok(())
    }

    async fn start(&mut self, status: &HostStatus) -> Result<(), StorageError> {
        let Some(file) = status.job_file.as_ref() else {
            debug!("Host reports a job but no file, waiting");
            return Ok(());
        };

        let id = make_job_id(&file.name, &timestamp_now());
        let working_dir = self.data_dir.join(id.replace(':', "-"));
        let gcode_path = self.files.path_on_disk(file.location, &file.path);
        let (index, first_layer) = scan_gcode(&gcode_path).await;

        let csv_path = working_dir.join(PRINT_LOG_NAME);
        let log = open_print_log(&working_dir, &csv_path).await?;

        if first_layer.is_none() {
            info!("Job {}: no first layer found, skipping first-layer upload", id);
        }

        let uploads = self.uploads.clone();
        let upload_id = id.clone();
        let upload_path = gcode_path.clone();
        tokio::spawn(async move {
            if let Err(e) = uploads.start_job(&upload_id, &upload_path).await {
                warn!("Start-job upload for {} failed: {}", upload_id, e);
            }
        });

        {
            let mut state = self.state.lock();
            state.current_job_id = Some(id.clone());
            state.is_printing = true;
            state.just_finished = false;
        }

        info!("Job {} started, recording to {}", id, working_dir.display());
        self.job = Some(Job {
            id,
            gcode_path,
            first_layer_csv_path: working_dir.join(FIRST_LAYER_LOG_NAME),
            csv_path,
            working_dir,
            first_layer_end_line: first_layer.map(|l| l.end_line),
            first_layer_uploaded: false,
            image_count: 0,
            sample_count: 0,
            upload_attempts: 0,
            log: Some(log),
            index,
        });
        self.phase = JobPhase::Active;
        Ok(())
    }

    fn track_position(&mut self, status: &HostStatus) {
        let (Some(job), Some(position)) = (self.job.as_ref(), status.file_position) else {
            return;
        };
        if let Some((line, cmd)) = job.index.locate(position) {
            let mut state = self.state.lock();
            state.gcode_line_number = Some(line);
            state.last_gcode_command = Some(cmd.to_string());
        }
    }

    fn finish(&mut self) {
        if let Some(job) = self.job.as_mut() {
            if let Some(log) = job.log.take() {
                if let Err(e) = log.close() {
                    warn!("Failed to close print log for {}: {}", job.id, e);
                }
            }
            info!("Job {} finished after {} samples", job.id, job.sample_count);
        }
        {
            let mut state = self.state.lock();
            state.is_printing = false;
            state.just_finished = true;
        }
        self.phase = JobPhase::Finishing;
    }

    async fn finalize(&mut self) {
        let Some(job) = self.job.as_mut() else {
            self.phase = JobPhase::Idle;
            return;
        };

        match self
            .uploads
            .end_job(&job.id, &job.gcode_path, &job.csv_path)
            .await
        {
            Ok(()) => {
                info!("Job {} uploaded", job.id);
                let id = job.id.clone();
                self.finalize_breaker.reset(&id);
                self.cleanup();
            }
            Err(e) => {
                job.upload_attempts += 1;
                let id = job.id.clone();
                if self.finalize_breaker.record_failure(&id) {
                    error!(
                        "Giving up on job {} after {} failed uploads: {}",
                        id, job.upload_attempts, e
                    );
                    self.finalize_breaker.reset(&id);
                    self.cleanup();
                } else {
                    warn!("End-job upload for {} failed, will retry: {}", id, e);
                }
            }
        }
    }

    fn cleanup(&mut self) {
        if let Some(job) = self.job.take() {
            match std::fs::remove_dir_all(&job.working_dir) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!("Working directory {} already gone", job.working_dir.display());
                }
                Err(e) => warn!(
                    "Failed to remove working directory {}: {}",
                    job.working_dir.display(),
                    e
                ),
            }
        }
        self.state.lock().clear_job();
        self.phase = JobPhase::Idle;
    }
}

/// Index the job file and locate its first layer off the async runtime.
/// An unreadable file yields an empty index and no first layer.
async fn scan_gcode(path: &Path) -> (GcodeIndex, Option<FirstLayer>) {
    let gcode = match tokio::fs::read_to_string(path).await {
        Ok(gcode) => gcode,
        Err(e) => {
            warn!("Could not read gcode {}: {}", path.display(), e);
            return (GcodeIndex::default(), None);
        }
    };

    tokio::task::spawn_blocking(move || (GcodeIndex::build(&gcode), first_layer::detect(&gcode)))
        .await
        .unwrap_or_else(|e| {
            warn!("Gcode scan task failed: {}", e);
            (GcodeIndex::default(), None)
        })
}

#[cfg(test)]
mod tests {
    use std::fmt::Write as _;

    use super::*;
    use crate::host::mock::MockFiles;
    use crate::host::{FileLocation, JobFile};
    use crate::printer_state::PrinterState;
    use crate::settings::{Settings, SettingsStore};
    use crate::transport::mock::MockTransport;
    use crate::upload::END_JOB_ENDPOINT;

    struct Fixture {
        _dir: tempfile::TempDir,
        data_dir: PathBuf,
        state: SharedPrinterState,
        transport: Arc<MockTransport>,
        tracker: JobLifecycleTracker,
    }

    fn fixture(transport: MockTransport) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let gcode_dir = dir.path().join("gcodes");
        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(&gcode_dir).unwrap();

        let mut gcode = String::from("; sliced\nG28\n");
        for i in 1..=11 {
            writeln!(gcode, "G1 X{} E0.5", i).unwrap();
        }
        gcode.push_str("G1 Z0.4\nG1 X1 E1\n");
        std::fs::write(gcode_dir.join("part.gcode"), gcode).unwrap();

        let transport = Arc::new(transport);
        let settings = Arc::new(SettingsStore::in_memory(
            "unused.json",
            Settings {
                auth_token: "tok".to_string(),
                ..Settings::default()
            },
        ));
        let uploads = Arc::new(UploadPipeline::new(
            transport.clone(),
            settings,
            "https://cloud.example/api/v1/",
        ));
        let state = PrinterState::shared();
        let tracker = JobLifecycleTracker::new(
            state.clone(),
            Arc::new(MockFiles::new(&gcode_dir)),
            uploads,
            &data_dir,
        );
        Fixture {
            _dir: dir,
            data_dir,
            state,
            transport,
            tracker,
        }
    }

    fn printing(printing: bool) -> HostStatus {
        HostStatus {
            connected: true,
            printing,
            job_file: Some(JobFile {
                name: "part.gcode".to_string(),
                path: "part.gcode".to_string(),
                location: FileLocation::Local,
            }),
            ..HostStatus::default()
        }
    }

    #[tokio::test]
    async fn test_unopenable_print_log_leaves_no_directory() {
        let dir = tempfile::tempdir().unwrap();
        let working_dir = dir.path().join("part_2024-01-01T00-00-00.000Z");
        let csv_path = working_dir.join(PRINT_LOG_NAME);
        std::fs::create_dir_all(&csv_path).unwrap();

        assert!(open_print_log(&working_dir, &csv_path).await.is_err());
        assert!(!working_dir.exists());
    }

    #[tokio::test]
    async fn test_print_log_opens_in_fresh_directory() {
        let dir = tempfile::tempdir().unwrap();
        let working_dir = dir.path().join("data").join("job");
        let csv_path = working_dir.join(PRINT_LOG_NAME);

        open_print_log(&working_dir, &csv_path).await.unwrap();
        assert!(csv_path.exists());
    }

    #[tokio::test]
    async fn test_failed_start_stays_idle() {
        let mut fx = fixture(MockTransport::ok());
        std::fs::write(&fx.data_dir, "not a directory").unwrap();

        assert!(fx.tracker.observe(&printing(true)).await.is_err());
        assert_eq!(fx.tracker.phase(), JobPhase::Idle);
        assert!(fx.tracker.job().is_none());
        assert!(fx.state.lock().current_job_id.is_none());
    }

    #[test]
    fn test_job_id() {
        assert_eq!(
            make_job_id("part.gcode", "2024-01-01T00:00:00.000Z"),
            "part_2024-01-01T00:00:00.000Z"
        );
    }

    #[tokio::test]
    async fn test_start_creates_working_dir_and_log() {
        let mut fx = fixture(MockTransport::ok());
        fx.tracker.observe(&printing(true)).await.unwrap();

        assert_eq!(fx.tracker.phase(), JobPhase::Active);
        let job = fx.tracker.job().unwrap();
        assert!(job.id.starts_with("part_"));
        assert!(job.working_dir.starts_with(&fx.data_dir));
        assert!(!job.working_dir.to_string_lossy().contains(':'));
        assert!(job.csv_path.exists());
        // Extrusion on lines 2..12, first Z change on line 13.
        assert_eq!(job.first_layer_end_line, Some(13));
        assert_eq!(fx.state.lock().current_job_id.as_deref(), Some(job.id.as_str()));
    }

    #[tokio::test]
    async fn test_idle_host_does_not_start() {
        let mut fx = fixture(MockTransport::ok());
        fx.tracker.observe(&printing(false)).await.unwrap();
        assert_eq!(fx.tracker.phase(), JobPhase::Idle);
        assert!(fx.tracker.job().is_none());
    }

    #[tokio::test]
    async fn test_position_maps_to_line() {
        let mut fx = fixture(MockTransport::ok());
        fx.tracker.observe(&printing(true)).await.unwrap();

        let mut status = printing(true);
        // Offset of "G28", just past the comment line.
        status.file_position = Some("; sliced\n".len() as u64);
        fx.tracker.observe(&status).await.unwrap();

        let state = fx.state.lock();
        assert_eq!(state.gcode_line_number, Some(1));
        assert_eq!(state.last_gcode_command.as_deref(), Some("G28"));
    }

    #[tokio::test]
    async fn test_finish_uploads_and_cleans_up() {
        let mut fx = fixture(MockTransport::ok());
        fx.tracker.observe(&printing(true)).await.unwrap();
        let dir = fx.tracker.job().unwrap().working_dir.clone();

        fx.tracker.observe(&printing(false)).await.unwrap();

        assert_eq!(fx.tracker.phase(), JobPhase::Idle);
        assert!(!dir.exists());
        assert_eq!(fx.transport.calls_to(END_JOB_ENDPOINT).len(), 1);
        let state = fx.state.lock();
        assert!(state.current_job_id.is_none());
        assert!(state.just_finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_finalize_resets_after_three_polls() {
        let mut fx = fixture(MockTransport::new(500, b""));
        fx.tracker.observe(&printing(true)).await.unwrap();

        fx.tracker.observe(&printing(false)).await.unwrap();
        assert_eq!(fx.tracker.phase(), JobPhase::Finishing);
        fx.tracker.observe(&printing(false)).await.unwrap();
        assert_eq!(fx.tracker.phase(), JobPhase::Finishing);
        assert_eq!(fx.tracker.job().unwrap().upload_attempts, 2);

        fx.tracker.observe(&printing(false)).await.unwrap();
        assert_eq!(fx.tracker.phase(), JobPhase::Idle);
        assert!(fx.tracker.job().is_none());
        assert!(fx.state.lock().current_job_id.is_none());

        let attempts = constants::DURABLE_UPLOAD_ATTEMPTS as usize;
        assert_eq!(fx.transport.calls_to(END_JOB_ENDPOINT).len(), 3 * attempts);
    }

    #[tokio::test]
    async fn test_missing_working_dir_is_not_an_error() {
        let mut fx = fixture(MockTransport::ok());
        fx.tracker.observe(&printing(true)).await.unwrap();
        let dir = fx.tracker.job().unwrap().working_dir.clone();
        std::fs::remove_dir_all(&dir).unwrap();

        fx.tracker.cleanup();

        assert_eq!(fx.tracker.phase(), JobPhase::Idle);
        assert!(fx.tracker.job().is_none());
        assert!(fx.state.lock().current_job_id.is_none());
    }

    #[tokio::test]
    async fn test_first_layer_gate_fires_once() {
        let mut fx = fixture(MockTransport::ok());
        fx.tracker.observe(&printing(true)).await.unwrap();
        let job = fx.tracker.active_job_mut().unwrap();

        assert!(!job.first_layer_due(Some(13 + constants::FIRST_LAYER_LINE_BUFFER)));
        assert!(job.first_layer_due(Some(14 + constants::FIRST_LAYER_LINE_BUFFER)));

        let slice = job.take_first_layer_slice().unwrap().unwrap();
        assert!(slice.ends_with(FIRST_LAYER_LOG_NAME));
        assert!(slice.exists());
        assert!(!job.first_layer_due(Some(100)));
        assert!(job.take_first_layer_slice().unwrap().is_none());
    }
}
