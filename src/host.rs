//! Interfaces to the collaborators the agent drives: the printer-control
//! runtime and the file-management service.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::HostError;

/// Where a file lives on the printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileLocation {
    Local,
    Sdcard,
}

impl FileLocation {
    /// Cloud commands say `"sd"` for the SD card and anything else for local storage.
    pub fn from_loc(loc: Option<&str>) -> Self {
        match loc {
            Some("sd") => FileLocation::Sdcard,
            _ => FileLocation::Local,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    #[serde(alias = "X")]
    X,
    #[serde(alias = "Y")]
    Y,
    #[serde(alias = "Z")]
    Z,
}

impl Axis {
    pub fn letter(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Heater {
    pub actual: f64,
    pub target: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Temperatures {
    pub tool0: Heater,
    pub bed: Heater,
}

/// The file the host is printing.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFile {
    pub name: String,
    pub path: String,
    pub location: FileLocation,
}

/// Point-in-time view of the host.
#[derive(Debug, Clone, Default)]
pub struct HostStatus {
    /// A printer is attached and talking to the host.
    pub connected: bool,
    /// Human readable state, e.g. "Printing".
    pub state: String,
    pub printing: bool,
    pub paused: bool,
    pub pausing: bool,
    /// Idle and able to accept a job.
    pub operational: bool,
    pub job_file: Option<JobFile>,
    /// Byte position of the host's read cursor in the job file.
    pub file_position: Option<u64>,
    pub temperatures: Temperatures,
    /// Raw host data forwarded to the cloud as-is.
    pub printer_data: serde_json::Value,
}

impl HostStatus {
    /// Printing, paused or pausing all count as having a job.
    pub fn has_job(&self) -> bool {
        self.printing || self.paused || self.pausing
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLineKind {
    /// A command sent to the printer from a terminal or the cloud.
    Command,
    /// A line the printer sent back.
    Response,
}

/// One entry of the host's communication log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub kind: LogLineKind,
    pub text: String,
}

/// The printer-control runtime.
#[async_trait]
pub trait PrinterHost: Send + Sync {
    async fn status(&self) -> Result<HostStatus, HostError>;

    /// Communication-log lines received since the previous call.
    async fn poll_log(&self) -> Result<Vec<LogLine>, HostError>;

    /// Home the given axes, or all axes when empty.
    async fn home(&self, axes: &[Axis]) -> Result<(), HostError>;

    /// Relative move.
    async fn jog(&self, moves: &[(Axis, f64)]) -> Result<(), HostError>;

    /// Extrude (positive) or retract (negative) filament in mm.
    async fn extrude(&self, amount: f64) -> Result<(), HostError>;

    /// Set a heater target. `heater` is `tool0`..`toolN` or `bed`.
    async fn set_temperature(&self, heater: &str, value: f64) -> Result<(), HostError>;

    async fn pause_print(&self) -> Result<(), HostError>;
    async fn resume_print(&self) -> Result<(), HostError>;
    async fn cancel_print(&self) -> Result<(), HostError>;
    async fn toggle_pause(&self) -> Result<(), HostError>;

    /// (Re)connect the host to the printer.
    async fn connect(&self) -> Result<(), HostError>;

    async fn select_file(
        &self,
        path: &str,
        location: FileLocation,
        print_after_select: bool,
    ) -> Result<(), HostError>;

    /// Send raw G-code lines.
    async fn send_commands(&self, lines: &[String]) -> Result<(), HostError>;
}

/// The file-management service.
#[async_trait]
pub trait FileManager: Send + Sync {
    /// Recursive listing, forwarded to the cloud as-is.
    async fn list_files(&self) -> Result<serde_json::Value, HostError>;

    async fn add_file(
        &self,
        location: FileLocation,
        path: &str,
        contents: Vec<u8>,
        allow_overwrite: bool,
    ) -> Result<(), HostError>;

    async fn add_folder(
        &self,
        location: FileLocation,
        path: &str,
        ignore_existing: bool,
    ) -> Result<(), HostError>;

    async fn remove_file(&self, location: FileLocation, path: &str) -> Result<(), HostError>;

    async fn remove_folder(&self, location: FileLocation, path: &str) -> Result<(), HostError>;

    /// Where a stored file lives on the local disk.
    fn path_on_disk(&self, location: FileLocation, path: &str) -> PathBuf;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Recording host and file manager used by unit tests.

    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MockHost {
        pub status: Mutex<HostStatus>,
        pub log: Mutex<VecDeque<LogLine>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl MockHost {
        pub fn set_status(&self, status: HostStatus) {
            *self.status.lock() = status;
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn record(&self, call: String) -> Result<(), HostError> {
            self.calls.lock().push(call);
            Ok(())
        }
    }

    #[async_trait]
    impl PrinterHost for MockHost {
        async fn status(&self) -> Result<HostStatus, HostError> {
            Ok(self.status.lock().clone())
        }

        async fn poll_log(&self) -> Result<Vec<LogLine>, HostError> {
            Ok(self.log.lock().drain(..).collect())
        }

        async fn home(&self, axes: &[Axis]) -> Result<(), HostError> {
            self.record(format!("home {:?}", axes))
        }

        async fn jog(&self, moves: &[(Axis, f64)]) -> Result<(), HostError> {
            self.record(format!("jog {:?}", moves))
        }

        async fn extrude(&self, amount: f64) -> Result<(), HostError> {
            self.record(format!("extrude {}", amount))
        }

        async fn set_temperature(&self, heater: &str, value: f64) -> Result<(), HostError> {
            self.record(format!("temperature {} {}", heater, value))
        }

        async fn pause_print(&self) -> Result<(), HostError> {
            self.record("pause".to_string())
        }

        async fn resume_print(&self) -> Result<(), HostError> {
            self.record("resume".to_string())
        }

        async fn cancel_print(&self) -> Result<(), HostError> {
            self.record("cancel".to_string())
        }

        async fn toggle_pause(&self) -> Result<(), HostError> {
            self.record("toggle".to_string())
        }

        async fn connect(&self) -> Result<(), HostError> {
            self.record("connect".to_string())
        }

        async fn select_file(
            &self,
            path: &str,
            location: FileLocation,
            print_after_select: bool,
        ) -> Result<(), HostError> {
            self.record(format!(
                "select {} {:?} {}",
                path, location, print_after_select
            ))
        }

        async fn send_commands(&self, lines: &[String]) -> Result<(), HostError> {
            self.record(format!("gcode {}", lines.join("|")))
        }
    }

    pub struct MockFiles {
        pub root: PathBuf,
        pub calls: Mutex<Vec<String>>,
    }

    impl MockFiles {
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self {
                root: root.into(),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl FileManager for MockFiles {
        async fn list_files(&self) -> Result<serde_json::Value, HostError> {
            Ok(serde_json::json!([{"path": "part.gcode", "size": 4}]))
        }

        async fn add_file(
            &self,
            location: FileLocation,
            path: &str,
            contents: Vec<u8>,
            allow_overwrite: bool,
        ) -> Result<(), HostError> {
            self.calls.lock().push(format!(
                "add_file {:?} {} {} {}",
                location,
                path,
                String::from_utf8_lossy(&contents),
                allow_overwrite
            ));
            Ok(())
        }

        async fn add_folder(
            &self,
            location: FileLocation,
            path: &str,
            ignore_existing: bool,
        ) -> Result<(), HostError> {
            self.calls
                .lock()
                .push(format!("add_folder {:?} {} {}", location, path, ignore_existing));
            Ok(())
        }

        async fn remove_file(&self, location: FileLocation, path: &str) -> Result<(), HostError> {
            self.calls
                .lock()
                .push(format!("remove_file {:?} {}", location, path));
            Ok(())
        }

        async fn remove_folder(&self, location: FileLocation, path: &str) -> Result<(), HostError> {
            self.calls
                .lock()
                .push(format!("remove_folder {:?} {}", location, path));
            Ok(())
        }

        fn path_on_disk(&self, _location: FileLocation, path: &str) -> PathBuf {
            self.root.join(path)
        }
    }
}
