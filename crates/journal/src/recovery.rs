use std::fs::{self, OpenOptions};
use std::path::Path;

use ljr_common::JournalError;
use tracing::warn;

use crate::reader::{JournalLine, JournalReader, ReadResult};

/// What a journal held after recovery.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub headers: usize,
    pub schemas: usize,
    pub frames: usize,
    pub property_changes: usize,
    /// Bytes of an unterminated final line that were cut off.
    pub truncated_bytes: u64,
}

/// Scan a journal and cut off a torn final line. Complete lines are never
/// rewritten; a complete line that does not parse is reported as
/// `Corrupted` and the file is left as is.
pub fn recover(path: &Path) -> Result<RecoveryReport, JournalError> {
    let mut reader = JournalReader::open(path)?;
    let mut report = RecoveryReport::default();

    let valid_len = loop {
        match reader.read_line()? {
            ReadResult::Line(JournalLine::Header(_)) => report.headers += 1,
            ReadResult::Line(JournalLine::Prop(_)) if reader.lines_read() == 2 => {
                report.schemas += 1
            }
            ReadResult::Line(JournalLine::Prop(_)) => report.property_changes += 1,
            ReadResult::Line(JournalLine::Frame(_)) => report.frames += 1,
            ReadResult::Eof => break reader.offset(),
            ReadResult::Torn { offset } => break offset,
        }
    };
    drop(reader);

    let file_len = fs::metadata(path)?.len();
    if valid_len < file_len {
        warn!(
            path = %path.display(),
            bytes = file_len - valid_len,
            "truncating torn journal tail"
        );
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| JournalError::file_unavailable(path, e))?;
        file.set_len(valid_len)
            .map_err(|e| JournalError::file_unavailable(path, e))?;
        report.truncated_bytes = file_len - valid_len;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const HEADER: &str = r#"{"header":{"prot_version":1,"devicetype":1,"protocol":1,"timestamp":1}}"#;
    const SCHEMA: &str = r#"{"prop":[{"id":1,"val":true}]}"#;

    #[test]
    fn test_clean_journal_untouched() {
        let tmp = NamedTempFile::new().unwrap();
        let content = format!("{HEADER}\n{SCHEMA}\n{{\"frame\":{{\"ts\":1}}}}\n{{\"prop\":[{{\"id\":1}}]}}\n");
        fs::write(tmp.path(), &content).unwrap();

        let report = recover(tmp.path()).unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                headers: 1,
                schemas: 1,
                frames: 1,
                property_changes: 1,
                truncated_bytes: 0,
            }
        );
        assert_eq!(fs::read_to_string(tmp.path()).unwrap(), content);
    }

    #[test]
    fn test_torn_tail_truncated() {
        let tmp = NamedTempFile::new().unwrap();
        let complete = format!("{HEADER}\n{SCHEMA}\n");
        fs::write(tmp.path(), format!("{complete}{{\"frame\":{{\"ts\":7,\"sta")).unwrap();

        let report = recover(tmp.path()).unwrap();
        assert_eq!(report.frames, 0);
        assert_eq!(report.truncated_bytes, 21);
        assert_eq!(fs::read_to_string(tmp.path()).unwrap(), complete);
    }

    #[test]
    fn test_empty_journal() {
        let tmp = NamedTempFile::new().unwrap();
        let report = recover(tmp.path()).unwrap();
        assert_eq!(report, RecoveryReport::default());
    }
}
