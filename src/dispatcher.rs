use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use log::{info, warn};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::HostError;
use crate::host::{Axis, FileLocation, FileManager, PrinterHost};
use crate::upload::UploadPipeline;

/// A number that may arrive as a JSON number or a numeric string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Numeric {
    Number(f64),
    Text(String),
}

impl Numeric {
    pub fn value(&self) -> Option<f64> {
        match self {
            Numeric::Number(n) => Some(*n),
            Numeric::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum MotionCommand {
    Home {
        #[serde(default)]
        axes: Vec<Axis>,
    },
    Move {
        axes: BTreeMap<Axis, Numeric>,
    },
    Extrude {
        value: Numeric,
    },
    Retract {
        value: Numeric,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum TemperatureCommand {
    Temperature { heater: String, value: Numeric },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ExecuteCommand {
    Pause,
    Resume,
    Cancel,
    Toggle,
    Connect,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum FilesCommand {
    Print {
        file: String,
        loc: Option<String>,
    },
    Select {
        file: String,
        loc: Option<String>,
    },
    Upload {
        url: String,
        file: String,
        loc: Option<String>,
        #[serde(default)]
        print: bool,
    },
    BucketUpload {
        bucket_file: String,
        file: String,
        loc: Option<String>,
        #[serde(default)]
        print: bool,
    },
    Delete {
        #[serde(rename = "type")]
        kind: Option<String>,
        file: Option<String>,
        folder: Option<String>,
        loc: Option<String>,
    },
    NewFolder {
        folder: String,
        loc: Option<String>,
    },
    Download {
        file: String,
        loc: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum GcodeCommand {
    Send { lines: Vec<String> },
}

/// A printer command carried by an inbound sync message.
#[derive(Debug, Clone)]
pub enum PrinterCommand {
    Motion(MotionCommand),
    Temperature(TemperatureCommand),
    Execute(ExecuteCommand),
    Files(FilesCommand),
    Gcode(GcodeCommand),
}

impl PrinterCommand {
    /// Keys that mark a message as a printer command, in dispatch order.
    pub const KEYS: [&'static str; 5] = ["motion", "temperature", "execute", "files", "gcode"];

    /// Decode the first command key present in `message`.
    ///
    /// Returns `Ok(None)` when the message carries no command key.
    pub fn from_message(message: &Value) -> Result<Option<Self>, serde_json::Error> {
        let Some(key) = Self::KEYS.iter().find(|k| message.get(**k).is_some()) else {
            return Ok(None);
        };
        let body = message[*key].clone();
        let command = match *key {
            "motion" => PrinterCommand::Motion(serde_json::from_value(body)?),
            "temperature" => PrinterCommand::Temperature(serde_json::from_value(body)?),
            "execute" => PrinterCommand::Execute(serde_json::from_value(body)?),
            "files" => PrinterCommand::Files(serde_json::from_value(body)?),
            _ => PrinterCommand::Gcode(serde_json::from_value(body)?),
        };
        Ok(Some(command))
    }
}

/// Bounded pool for fire-and-forget file transfers.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Run `job` once a worker is free. The outcome is only logged.
    pub fn submit<F>(&self, label: String, job: F) -> JoinHandle<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            match job.await {
                Ok(()) => info!("{} finished", label),
                Err(e) => warn!("{} failed: {:#}", label, e),
            }
        })
    }
}

/// Turns cloud commands into host and file-manager calls.
///
/// Motion, temperature, execution and local file bookkeeping run inline.
/// Anything that moves file contents over the network goes to the worker
/// pool so the sync loop is never held up by a transfer.
pub struct CommandDispatcher {
    host: Arc<dyn PrinterHost>,
    files: Arc<dyn FileManager>,
    uploads: Arc<UploadPipeline>,
    pool: WorkerPool,
}

impl CommandDispatcher {
    pub fn new(
        host: Arc<dyn PrinterHost>,
        files: Arc<dyn FileManager>,
        uploads: Arc<UploadPipeline>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            host,
            files,
            uploads,
            pool,
        }
    }

    pub async fn dispatch(&self, command: PrinterCommand) -> Result<(), HostError> {
        match command {
            PrinterCommand::Motion(motion) => self.motion(motion).await,
            PrinterCommand::Temperature(TemperatureCommand::Temperature { heater, value }) => {
                let value = numeric("temperature", &value)?;
                self.host.set_temperature(&heater, value).await
            }
            PrinterCommand::Execute(execute) => match execute {
                ExecuteCommand::Pause => self.host.pause_print().await,
                ExecuteCommand::Resume => self.host.resume_print().await,
                ExecuteCommand::Cancel => self.host.cancel_print().await,
                ExecuteCommand::Toggle => self.host.toggle_pause().await,
                ExecuteCommand::Connect => self.host.connect().await,
            },
            PrinterCommand::Files(files) => self.files(files).await,
            PrinterCommand::Gcode(GcodeCommand::Send { lines }) => {
                self.host.send_commands(&lines).await
            }
        }
    }

    async fn motion(&self, motion: MotionCommand) -> Result<(), HostError> {
        match motion {
            MotionCommand::Home { axes } => self.host.home(&axes).await,
            MotionCommand::Move { axes } => {
                let moves = axes
                    .iter()
                    .map(|(axis, distance)| Ok((*axis, numeric("move", distance)?)))
                    .collect::<Result<Vec<_>, HostError>>()?;
                self.host.jog(&moves).await
            }
            MotionCommand::Extrude { value } => {
                self.host.extrude(numeric("extrude", &value)?).await
            }
            MotionCommand::Retract { value } => {
                self.host.extrude(-numeric("retract", &value)?.abs()).await
            }
        }
    }

    async fn files(&self, command: FilesCommand) -> Result<(), HostError> {
        match command {
            FilesCommand::Print { file, loc } => {
                self.host
                    .select_file(&file, FileLocation::from_loc(loc.as_deref()), true)
                    .await
            }
            FilesCommand::Select { file, loc } => {
                self.host
                    .select_file(&file, FileLocation::from_loc(loc.as_deref()), false)
                    .await
            }
            FilesCommand::NewFolder { folder, loc } => {
                self.files
                    .add_folder(FileLocation::from_loc(loc.as_deref()), &folder, true)
                    .await
            }
            FilesCommand::Upload {
                url,
                file,
                loc,
                print,
            } => {
                let location = FileLocation::from_loc(loc.as_deref());
                let (uploads, files, host) = self.handles();
                self.pool.submit(format!("Download of {}", file), async move {
                    let bytes = uploads
                        .download_from_url(&url)
                        .await
                        .with_context(|| format!("downloading {}", url))?;
                    store_and_print(files, host, location, &file, bytes, print).await
                });
                Ok(())
            }
            FilesCommand::BucketUpload {
                bucket_file,
                file,
                loc,
                print,
            } => {
                let location = FileLocation::from_loc(loc.as_deref());
                let (uploads, files, host) = self.handles();
                self.pool.submit(format!("Cloud fetch of {}", file), async move {
                    let bytes = uploads
                        .fetch_bucket_file(&bucket_file)
                        .await
                        .with_context(|| format!("fetching bucket file {}", bucket_file))?;
                    store_and_print(files, host, location, &file, bytes, print).await
                });
                Ok(())
            }
            FilesCommand::Delete {
                kind,
                file,
                folder,
                loc,
            } => {
                let location = FileLocation::from_loc(loc.as_deref());
                let files = self.files.clone();
                if kind.as_deref() == Some("folder") {
                    let folder = folder.ok_or_else(|| missing("delete", "folder"))?;
                    self.pool.submit(format!("Removal of folder {}", folder), async move {
                        Ok(files.remove_folder(location, &folder).await?)
                    });
                } else {
                    let file = file.ok_or_else(|| missing("delete", "file"))?;
                    self.pool.submit(format!("Removal of {}", file), async move {
                        Ok(files.remove_file(location, &file).await?)
                    });
                }
                Ok(())
            }
            FilesCommand::Download { file, loc } => {
                let path = self
                    .files
                    .path_on_disk(FileLocation::from_loc(loc.as_deref()), &file);
                let uploads = self.uploads.clone();
                self.pool.submit(format!("Upload of {} to the cloud", file), async move {
                    Ok(uploads.upload_for_download(&path).await?)
                });
                Ok(())
            }
        }
    }

    fn handles(&self) -> (Arc<UploadPipeline>, Arc<dyn FileManager>, Arc<dyn PrinterHost>) {
        (self.uploads.clone(), self.files.clone(), self.host.clone())
    }
}

async fn store_and_print(
    files: Arc<dyn FileManager>,
    host: Arc<dyn PrinterHost>,
    location: FileLocation,
    file: &str,
    bytes: Vec<u8>,
    print: bool,
) -> anyhow::Result<()> {
    files.add_file(location, file, bytes, true).await?;
    if print {
        host.select_file(file, location, true).await?;
    }
    Ok(())
}

fn numeric(action: &str, value: &Numeric) -> Result<f64, HostError> {
    value.value().ok_or_else(|| HostError::InvalidState {
        requested_action: action.to_string(),
        current_state: format!("non-numeric value {:?}", value),
    })
}

fn missing(action: &str, field: &str) -> HostError {
    HostError::InvalidState {
        requested_action: action.to_string(),
        current_state: format!("message has no '{}'", field),
    }
}
