use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use reqwest::multipart;
use serde_json::Value;

use crate::error::HostError;
use crate::host::{
    Axis, FileLocation, FileManager, Heater, HostStatus, JobFile, LogLine, LogLineKind,
    PrinterHost, Temperatures,
};

const STATUS_QUERY: &str =
    "/printer/objects/query?webhooks&print_stats&extruder&heater_bed&virtual_sdcard";
const GCODE_STORE_COUNT: u32 = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const JOG_FEEDRATE: u32 = 3000;
const EXTRUDE_FEEDRATE: u32 = 300;

/// Moonraker (Klipper) client acting as both the printer host and the file
/// manager.
///
/// Klipper keeps every job file under a single `gcodes` root, so both file
/// locations resolve there.
pub struct MoonrakerHost {
    pub api_url: String,
    gcode_dir: PathBuf,
    client: reqwest::Client,
    /// Timestamp of the newest gcode store entry already handed out.
    log_cursor: Mutex<f64>,
}

impl MoonrakerHost {
    /// Create a client for the Moonraker API at `api_url`
    /// (e.g. "http://printer.local:7125"), with job files stored in `gcode_dir`.
    pub fn new(api_url: impl Into<String>, gcode_dir: impl Into<PathBuf>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            gcode_dir: gcode_dir.into(),
            client: reqwest::Client::new(),
            log_cursor: Mutex::new(0.0),
        }
    }

    async fn send(&self, endpoint: &str, request: reqwest::RequestBuilder) -> Result<Value, HostError> {
        let response = request
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| HostError::ConnectionFailed {
                api_url: self.api_url.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(HostError::ApiError {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| HostError::InvalidResponse {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })
    }

    async fn get(&self, endpoint: &str) -> Result<Value, HostError> {
        let request = self.client.get(format!("{}{}", self.api_url, endpoint));
        self.send(endpoint, request).await
    }

    async fn post(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<Value, HostError> {
        let request = self
            .client
            .post(format!("{}{}", self.api_url, endpoint))
            .query(query);
        self.send(endpoint, request).await
    }

    async fn delete(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<Value, HostError> {
        let request = self
            .client
            .delete(format!("{}{}", self.api_url, endpoint))
            .query(query);
        self.send(endpoint, request).await
    }

    async fn run_script(&self, script: &str) -> Result<(), HostError> {
        debug!("Sending gcode script: {}", script.replace('\n', " | "));
        self.post("/printer/gcode/script", &[("script", script)])
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl PrinterHost for MoonrakerHost {
    async fn status(&self) -> Result<HostStatus, HostError> {
        let body = self.get(STATUS_QUERY).await?;
        HostStatus::from_query(&body).ok_or_else(|| HostError::InvalidResponse {
            endpoint: STATUS_QUERY.to_string(),
            reason: "missing result.status".to_string(),
        })
    }

    async fn poll_log(&self) -> Result<Vec<LogLine>, HostError> {
        let endpoint = format!("/server/gcode_store?count={}", GCODE_STORE_COUNT);
        let body = self.get(&endpoint).await?;
        let mut cursor = self.log_cursor.lock();
        let (lines, newest) = parse_gcode_store(&body, *cursor);
        *cursor = newest;
        Ok(lines)
    }

    async fn home(&self, axes: &[Axis]) -> Result<(), HostError> {
        self.run_script(&home_script(axes)).await
    }

    async fn jog(&self, moves: &[(Axis, f64)]) -> Result<(), HostError> {
        if moves.is_empty() {
            return Ok(());
        }
        self.run_script(&jog_script(moves)).await
    }

    async fn extrude(&self, amount: f64) -> Result<(), HostError> {
        self.run_script(&format!("M83\nG1 E{} F{}", amount, EXTRUDE_FEEDRATE))
            .await
    }

    async fn set_temperature(&self, heater: &str, value: f64) -> Result<(), HostError> {
        let script = temperature_script(heater, value).ok_or_else(|| HostError::InvalidState {
            requested_action: format!("set temperature of '{}'", heater),
            current_state: "unknown heater".to_string(),
        })?;
        self.run_script(&script).await
    }

    async fn pause_print(&self) -> Result<(), HostError> {
        self.post("/printer/print/pause", &[]).await.map(|_| ())
    }

    async fn resume_print(&self) -> Result<(), HostError> {
        self.post("/printer/print/resume", &[]).await.map(|_| ())
    }

    async fn cancel_print(&self) -> Result<(), HostError> {
        self.post("/printer/print/cancel", &[]).await.map(|_| ())
    }

    async fn toggle_pause(&self) -> Result<(), HostError> {
        let status = self.status().await?;
        if status.paused {
            self.resume_print().await
        } else if status.printing {
            self.pause_print().await
        } else {
            Err(HostError::InvalidState {
                requested_action: "toggle pause".to_string(),
                current_state: status.state,
            })
        }
    }

    async fn connect(&self) -> Result<(), HostError> {
        info!("Restarting printer firmware connection");
        self.post("/printer/firmware_restart", &[]).await.map(|_| ())
    }

    async fn select_file(
        &self,
        path: &str,
        _location: FileLocation,
        print_after_select: bool,
    ) -> Result<(), HostError> {
        if print_after_select {
            self.post("/printer/print/start", &[("filename", path)])
                .await
                .map(|_| ())
        } else {
            self.run_script(&format!("M23 {}", path)).await
        }
    }

    async fn send_commands(&self, lines: &[String]) -> Result<(), HostError> {
        if lines.is_empty() {
            return Ok(());
        }
        self.run_script(&lines.join("\n")).await
    }
}

#[async_trait]
impl FileManager for MoonrakerHost {
    async fn list_files(&self) -> Result<Value, HostError> {
        let body = self.get("/server/files/list?root=gcodes").await?;
        Ok(body.get("result").cloned().unwrap_or(Value::Array(Vec::new())))
    }

    async fn add_file(
        &self,
        location: FileLocation,
        path: &str,
        contents: Vec<u8>,
        allow_overwrite: bool,
    ) -> Result<(), HostError> {
        if !allow_overwrite && self.path_on_disk(location, path).exists() {
            return Err(HostError::InvalidState {
                requested_action: format!("add file '{}'", path),
                current_state: "file already exists".to_string(),
            });
        }

        let (dir, name) = split_path(path);
        let part = multipart::Part::bytes(contents).file_name(name);
        let form = multipart::Form::new()
            .text("root", "gcodes")
            .text("path", dir)
            .part("file", part);

        let endpoint = "/server/files/upload";
        let request = self
            .client
            .post(format!("{}{}", self.api_url, endpoint))
            .multipart(form);
        self.send(endpoint, request).await?;
        info!("Stored {} on the printer", path);
        Ok(())
    }

    async fn add_folder(
        &self,
        location: FileLocation,
        path: &str,
        ignore_existing: bool,
    ) -> Result<(), HostError> {
        if ignore_existing && self.path_on_disk(location, path).is_dir() {
            return Ok(());
        }
        let target = format!("gcodes/{}", path.trim_start_matches('/'));
        self.post("/server/files/directory", &[("path", target.as_str())])
            .await
            .map(|_| ())
    }

    async fn remove_file(&self, _location: FileLocation, path: &str) -> Result<(), HostError> {
        let endpoint = format!("/server/files/gcodes/{}", path.trim_start_matches('/'));
        self.delete(&endpoint, &[]).await.map(|_| ())
    }

    async fn remove_folder(&self, _location: FileLocation, path: &str) -> Result<(), HostError> {
        let target = format!("gcodes/{}", path.trim_start_matches('/'));
        self.delete("/server/files/directory", &[("path", target.as_str()), ("force", "true")])
            .await
            .map(|_| ())
    }

    fn path_on_disk(&self, _location: FileLocation, path: &str) -> PathBuf {
        self.gcode_dir.join(path.trim_start_matches('/'))
    }
}

impl HostStatus {
    /// Build a status from a Moonraker `objects/query` response.
    ///
    /// Returns `None` when the body has no `result.status` object.
    pub fn from_query(body: &Value) -> Option<Self> {
        let status = body.get("result")?.get("status")?;

        let connected = status["webhooks"]["state"].as_str() == Some("ready");
        let print_state = status["print_stats"]["state"].as_str().unwrap_or("standby");
        let printing = connected && print_state == "printing";
        let paused = connected && print_state == "paused";

        let state = if !connected {
            "Offline"
        } else {
            match print_state {
                "printing" => "Printing",
                "paused" => "Paused",
                "error" => "Error",
                _ => "Operational",
            }
        };

        let job_file = status["print_stats"]["filename"]
            .as_str()
            .filter(|f| !f.is_empty())
            .map(|path| JobFile {
                name: Path::new(path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.to_string()),
                path: path.to_string(),
                location: FileLocation::Local,
            });

        Some(Self {
            connected,
            state: state.to_string(),
            printing,
            paused,
            pausing: false,
            operational: connected && !printing && !paused && print_state != "error",
            job_file,
            file_position: status["virtual_sdcard"]["file_position"].as_u64(),
            temperatures: Temperatures {
                tool0: heater(&status["extruder"]),
                bed: heater(&status["heater_bed"]),
            },
            printer_data: status.clone(),
        })
    }
}

fn heater(object: &Value) -> Heater {
    Heater {
        actual: object["temperature"].as_f64().unwrap_or(0.0),
        target: object["target"].as_f64().unwrap_or(0.0),
    }
}

/// New gcode store entries strictly after `cursor`, and the new cursor.
fn parse_gcode_store(body: &Value, cursor: f64) -> (Vec<LogLine>, f64) {
    let mut newest = cursor;
    let entries = body["result"]["gcode_store"]
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default();

    let lines = entries
        .iter()
        .filter_map(|entry| {
            let time = entry["time"].as_f64()?;
            if time <= cursor {
                return None;
            }
            newest = newest.max(time);
            let kind = match entry["type"].as_str()? {
                "command" => LogLineKind::Command,
                _ => LogLineKind::Response,
            };
            Some(LogLine {
                kind,
                text: entry["message"].as_str()?.to_string(),
            })
        })
        .collect();
    (lines, newest)
}

fn home_script(axes: &[Axis]) -> String {
    let mut script = "G28".to_string();
    for axis in axes {
        script.push(' ');
        script.push(axis.letter());
    }
    script
}

fn jog_script(moves: &[(Axis, f64)]) -> String {
    let axes = moves
        .iter()
        .map(|(axis, distance)| format!("{}{}", axis.letter(), distance))
        .collect::<Vec<_>>()
        .join(" ");
    format!("G91\nG1 {} F{}\nG90", axes, JOG_FEEDRATE)
}

fn temperature_script(heater: &str, value: f64) -> Option<String> {
    if heater == "bed" {
        return Some(format!("M140 S{}", value));
    }
    let tool: u32 = heater.strip_prefix("tool")?.parse().ok()?;
    Some(format!("M104 T{} S{}", tool, value))
}

/// Split `a/b/c.gcode` into (`a/b`, `c.gcode`).
fn split_path(path: &str) -> (String, String) {
    let path = path.trim_start_matches('/');
    match path.rsplit_once('/') {
        Some((dir, name)) => (dir.to_string(), name.to_string()),
        None => (String::new(), path.to_string()),
    }
}
