use std::collections::VecDeque;
use std::sync::{Arc, LazyLock};

use log::debug;
use parking_lot::Mutex;
use regex::Regex;

use crate::config::constants;

static FLOW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Flow: (-?\d+)%").expect("flow pattern"));
static FEED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Feed: (-?\d+)%").expect("feed pattern"));
static Z_OFFSET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Probe Z Offset: (-?\d+(?:\.\d+)?)").expect("z offset pattern"));

/// The one live mirror of machine parameters shared by both loops.
pub type SharedPrinterState = Arc<Mutex<PrinterState>>;

/// Machine parameters the host does not report directly, plus the identity
/// of the job being recorded.
///
/// Rates and offset come from the communication log, the job fields are
/// written by the lifecycle tracker.
#[derive(Debug, Clone)]
pub struct PrinterState {
    pub flow_rate_percent: i64,
    pub feed_rate_percent: i64,
    pub z_offset_mm: f64,
    pub current_job_id: Option<String>,
    pub is_printing: bool,
    pub just_finished: bool,
    pub gcode_line_number: Option<u64>,
    pub last_gcode_command: Option<String>,
    terminal_cmds: VecDeque<String>,
}

/// Which field a log line updated.
#[derive(Debug, Clone, PartialEq)]
pub enum LineUpdate {
    FlowRate(i64),
    FeedRate(i64),
    ZOffset(f64),
}

impl Default for PrinterState {
    fn default() -> Self {
        Self {
            flow_rate_percent: 100,
            feed_rate_percent: 100,
            z_offset_mm: 0.0,
            current_job_id: None,
            is_printing: false,
            just_finished: false,
            gcode_line_number: None,
            last_gcode_command: None,
            terminal_cmds: VecDeque::new(),
        }
    }
}

impl PrinterState {
    pub fn shared() -> SharedPrinterState {
        Arc::new(Mutex::new(Self::default()))
    }

    /// Parse one communication-log line and apply at most one update.
    ///
    /// Lines that do not match, carry a malformed number, or report a
    /// non-positive flow/feed rate leave the state untouched.
    pub fn parse_line(&mut self, line: &str) -> Option<LineUpdate> {
        let update = if line.contains("Flow") {
            capture::<i64>(&FLOW_RE, line).map(LineUpdate::FlowRate)
        } else if line.contains("Feed") {
            capture::<i64>(&FEED_RE, line).map(LineUpdate::FeedRate)
        } else if line.contains("Probe Z Offset") {
            capture::<f64>(&Z_OFFSET_RE, line).map(LineUpdate::ZOffset)
        } else {
            None
        }?;

        match update {
            LineUpdate::FlowRate(rate) if rate > 0 => self.flow_rate_percent = rate,
            LineUpdate::FeedRate(rate) if rate > 0 => self.feed_rate_percent = rate,
            LineUpdate::ZOffset(offset) => self.z_offset_mm = offset,
            _ => {
                debug!("Ignoring non-positive rate in line: {}", line.trim());
                return None;
            }
        }
        Some(update)
    }

    /// Remember a command typed by a user so it can be echoed to the cloud.
    pub fn record_terminal_command(&mut self, cmd: impl Into<String>) {
        if self.terminal_cmds.len() >= constants::TERMINAL_BUFFER_CAPACITY {
            self.terminal_cmds.pop_front();
        }
        self.terminal_cmds.push_back(cmd.into());
    }

    pub fn terminal_commands(&self) -> Vec<String> {
        self.terminal_cmds.iter().cloned().collect()
    }

    pub fn has_job(&self) -> bool {
        self.current_job_id.is_some()
    }

    /// Clear every job-scoped field after a job ends or is force-reset.
    pub fn clear_job(&mut self) {
        self.current_job_id = None;
        self.is_printing = false;
        self.gcode_line_number = None;
        self.last_gcode_command = None;
    }
}

fn capture<T: std::str::FromStr>(re: &Regex, line: &str) -> Option<T> {
    re.captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
