//! JSON-lines loading for events and upstream forecast bounds.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::io::BufRead;
use std::path::Path;

/// Parse one JSON record per line. Blank lines and `#` comments are skipped.
pub fn read_jsonl<T: DeserializeOwned>(reader: impl BufRead) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", idx + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let record = serde_json::from_str(trimmed)
            .with_context(|| format!("invalid record on line {}", idx + 1))?;
        out.push(record);
    }
    Ok(out)
}

pub fn read_jsonl_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    read_jsonl(std::io::BufReader::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventKind};

    #[test]
    fn test_read_jsonl_skips_blank_and_comment_lines() {
        let input = "\
# exported 2025-08-18
{\"timestamp\":\"2025-08-18T10:00:00Z\",\"event_type\":\"login\",\"user\":\"ALICE\"}

{\"timestamp\":\"2025-08-18T10:05:00Z\",\"user\":\"ALICE\",\"execution_time\":12}
";
        let events: Vec<Event> = read_jsonl(input.as_bytes()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Login);
        assert_eq!(events[1].kind, EventKind::Query);
    }

    #[test]
    fn test_read_jsonl_reports_line_number() {
        let input = "{\"timestamp\":\"2025-08-18T10:00:00Z\"}\nnot json\n";
        let err = read_jsonl::<Event>(input.as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
    }
}
