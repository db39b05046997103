use std::sync::LazyLock;

use log::{debug, info};
use regex::Regex;

use crate::gcode::significant_lines;

static EXTRUSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"E-?\d*\.?\d+").expect("extrusion pattern"));
static Z_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Z(-?\d*\.?\d+)").expect("z pattern"));

/// Number of extrusion lines ahead compared when looking for dense extrusion.
const EXTRUSION_WINDOW: usize = 8;

/// Thresholds tried in order, from tightest to loosest.
const THRESHOLDS: std::ops::Range<u64> = 10..20;

/// Location of the first printed layer in a G-code program.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FirstLayer {
    /// Line where sustained extrusion begins.
    pub start_line: u64,
    /// First Z change after `start_line`.
    pub end_line: u64,
}

/// Find where the first printed layer ends.
///
/// Sustained extrusion is assumed to start where nine extrusion lines fall
/// within `threshold` significant lines of each other; the first Z move after
/// that point ends the layer. Thresholds from 10 to 19 are tried in order.
///
/// Returns `None` when no threshold produces a start line or no Z move follows
/// it. The job then runs without a first-layer upload.
pub fn detect(gcode: &str) -> Option<FirstLayer> {
    let mut extrusion_lines = Vec::new();
    let mut z_changes = Vec::new();

    for line in significant_lines(gcode) {
        if EXTRUSION_RE.is_match(line.code) {
            extrusion_lines.push(line.index);
        }
        if let Some(z) = Z_RE
            .captures(line.code)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
        {
            z_changes.push((line.index, z));
        }
    }

    debug!(
        "First layer scan: {} extrusion lines, {} Z changes",
        extrusion_lines.len(),
        z_changes.len()
    );

    let start_line = THRESHOLDS
        .clone()
        .find_map(|threshold| dense_extrusion_start(&extrusion_lines, threshold))?;

    let end_line = z_changes
        .iter()
        .map(|(index, _)| *index)
        .find(|index| *index > start_line)?;

    info!(
        "First layer spans lines {} to {}",
        start_line, end_line
    );

    Some(FirstLayer {
        start_line,
        end_line,
    })
}

fn dense_extrusion_start(extrusion_lines: &[u64], threshold: u64) -> Option<u64> {
    extrusion_lines
        .windows(EXTRUSION_WINDOW + 1)
        .find(|w| w[EXTRUSION_WINDOW] - w[0] < threshold)
        .map(|w| w[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program(lines: &[&str]) -> String {
        lines.join("\n")
    }

    #[test]
    fn test_dense_extrusion_then_z_change() {
        let mut lines: Vec<String> = (1..=11).map(|i| format!("G1 X{} Y{} E0.5", i, i)).collect();
        lines.push("G1 Z0.4".to_string());
        let gcode = lines.join("\n");

        let layer = detect(&gcode).unwrap();
        assert_eq!(layer.start_line, 1);
        assert_eq!(layer.end_line, 12);
    }

    #[test]
    fn test_comments_do_not_count_towards_indices() {
        let mut lines = vec!["; generated".to_string(), "".to_string(), "G28".to_string()];
        lines.push("G1 Z0.2".to_string());
        for i in 0..9 {
            lines.push(format!("G1 X{} E1 ; extrude", i));
        }
        lines.push(";LAYER:1".to_string());
        lines.push("G1 Z0.4".to_string());
        let gcode = lines.join("\n");

        // G28=1, Z0.2=2, extrusion=3..=11, Z0.4=12
        let layer = detect(&gcode).unwrap();
        assert_eq!(layer.start_line, 3);
        assert_eq!(layer.end_line, 12);
    }

    #[test]
    fn test_sparse_extrusion_uses_looser_threshold() {
        // Extrusion every other line: nine extrusions span 16 lines.
        let mut lines = Vec::new();
        for i in 0..9 {
            lines.push(format!("G1 X{} E1", i));
            lines.push("G0 X0".to_string());
        }
        lines.push("G1 Z0.6".to_string());
        let layer = detect(&lines.join("\n")).unwrap();
        assert_eq!(layer.start_line, 1);
        assert_eq!(layer.end_line, 19);
    }

    #[test]
    fn test_no_dense_extrusion_yields_none() {
        let gcode = program(&["G28", "G1 Z0.2", "G1 X1 E1", "G1 X2 E1", "G1 Z0.4"]);
        assert_eq!(detect(&gcode), None);
    }

    #[test]
    fn test_no_z_change_after_start_yields_none() {
        let mut lines = vec!["G1 Z0.2".to_string()];
        lines.extend((0..10).map(|i| format!("G1 X{} E1", i)));
        assert_eq!(detect(&lines.join("\n")), None);
    }

    #[test]
    fn test_negative_and_decimal_z_values() {
        let mut lines: Vec<String> = (0..9).map(|i| format!("G1 X{} E.5", i)).collect();
        lines.push("G1 Z-.25".to_string());
        let layer = detect(&lines.join("\n")).unwrap();
        assert_eq!(layer.end_line, 10);
    }
}
