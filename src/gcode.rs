//! Line numbering shared by the first-layer detector and the sampling loop.
//!
//! Only significant lines count: comment-only and blank lines are skipped and
//! the rest are numbered from 1. The host reports a byte position into the
//! file, which [`GcodeIndex`] maps back onto the same numbering.

/// A non-comment, non-blank G-code line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignificantLine<'a> {
    /// 1-based index among significant lines.
    pub index: u64,
    /// Byte offset of the start of the line in the file.
    pub offset: usize,
    /// The command with any trailing `;` comment removed.
    pub code: &'a str,
}

/// Iterate the significant lines of a G-code program.
pub fn significant_lines(gcode: &str) -> impl Iterator<Item = SignificantLine<'_>> {
    let mut offset = 0usize;
    let mut index = 0u64;
    gcode.split_inclusive('\n').filter_map(move |raw| {
        let start = offset;
        offset += raw.len();
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with(';') {
            return None;
        }
        index += 1;
        Some(SignificantLine {
            index,
            offset: start,
            code: strip_comment(trimmed),
        })
    })
}

fn strip_comment(line: &str) -> &str {
    match line.find(';') {
        Some(pos) => line[..pos].trim_end(),
        None => line,
    }
}

/// Maps host-reported file positions to significant line numbers.
#[derive(Debug, Clone, Default)]
pub struct GcodeIndex {
    offsets: Vec<usize>,
    commands: Vec<String>,
}

impl GcodeIndex {
    pub fn build(gcode: &str) -> Self {
        let mut index = Self::default();
        for line in significant_lines(gcode) {
            index.offsets.push(line.offset);
            index.commands.push(line.code.to_string());
        }
        index
    }

    /// Line number and command of the last significant line starting at or
    /// before `position`.
    pub fn locate(&self, position: u64) -> Option<(u64, &str)> {
        let position = usize::try_from(position).unwrap_or(usize::MAX);
        let count = self.offsets.partition_point(|&o| o <= position);
        if count == 0 {
            return None;
        }
        Some((count as u64, self.commands[count - 1].as_str()))
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROGRAM: &str = "; header\nG28\n\nG1 Z0.2 F3000 ; lift\n   ; indented comment\nG1 X10 E1.5\n";

    #[test]
    fn test_skips_comments_and_blanks() {
        let lines: Vec<_> = significant_lines(PROGRAM).collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].index, 1);
        assert_eq!(lines[0].code, "G28");
        assert_eq!(lines[1].code, "G1 Z0.2 F3000");
        assert_eq!(lines[2].index, 3);
        assert_eq!(&PROGRAM[lines[2].offset..lines[2].offset + 3], "G1 ");
    }

    #[test]
    fn test_index_locates_positions() {
        let index = GcodeIndex::build(PROGRAM);
        assert_eq!(index.len(), 3);
        assert_eq!(index.locate(0), None);

        let g28 = PROGRAM.find("G28").unwrap() as u64;
        assert_eq!(index.locate(g28), Some((1, "G28")));
        assert_eq!(index.locate(g28 + 2), Some((1, "G28")));

        let last = PROGRAM.rfind("G1").unwrap() as u64;
        assert_eq!(index.locate(last), Some((3, "G1 X10 E1.5")));
        assert_eq!(index.locate(u64::MAX), Some((3, "G1 X10 E1.5")));
    }

    #[test]
    fn test_empty_program() {
        let index = GcodeIndex::build("; nothing here\n\n");
        assert!(index.is_empty());
        assert_eq!(index.locate(100), None);
    }
}
