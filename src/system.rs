use serde_json::{Value, json};

/// Memory figures in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    pub used: u64,
    pub total: u64,
}

impl MemoryUsage {
    /// Used share of total memory, in percent with one decimal.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.used as f64 / self.total as f64 * 1000.0).round() / 10.0
    }
}

/// Parse `MemTotal` and `MemAvailable` out of `/proc/meminfo` text.
pub fn parse_meminfo(meminfo: &str) -> Option<MemoryUsage> {
    let field = |name: &str| -> Option<u64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse::<u64>()
            .ok()
            .map(|kb| kb * 1024)
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    Some(MemoryUsage {
        used: total.saturating_sub(available),
        total,
    })
}

/// Human-readable size: `1.5GB`, `512.25MB`, `12KB`, or plain bytes.
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let value = bytes as f64;
    let (scaled, unit) = if value > KB * KB * KB {
        (value / (KB * KB * KB), "GB")
    } else if value > KB * KB {
        (value / (KB * KB), "MB")
    } else if value > KB {
        (value / KB, "KB")
    } else {
        return bytes.to_string();
    };
    format!("{}{}", (scaled * 100.0).round() / 100.0, unit)
}

fn memory_usage() -> Option<MemoryUsage> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&meminfo)
}

/// The `system` block of every outbound packet.
pub fn system_info() -> Value {
    let memory = match memory_usage() {
        Some(mem) => json!([format_bytes(mem.used), format_bytes(mem.total), mem.percent()]),
        None => json!([0, 0, 0]),
    };
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "os": std::env::consts::OS,
        "memory": memory,
    })
}
