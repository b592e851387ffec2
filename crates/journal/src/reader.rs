use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use ljr_common::{JournalError, PropertyId, Timestamp};
use serde::Deserialize;

/// `header` line payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HeaderRecord {
    pub prot_version: u32,
    pub devicetype: u32,
    pub protocol: u32,
    pub timestamp: u64,
}

/// One property entry of a schema, property-change or `states` list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PropertyRecord {
    pub id: PropertyId,
    pub signed: Option<bool>,
    pub limits: Option<Vec<serde_json::Value>>,
    #[serde(rename = "enum")]
    pub labels: Option<BTreeMap<String, u64>>,
    pub val: Option<serde_json::Value>,
}

/// `[channel, distance, amplitude, flag]`. Scaled values are `None` when
/// they were not finite.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct EchoRecord(pub u32, pub Option<f64>, pub Option<f64>, pub u32);

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FrameRecord {
    pub ts: Timestamp,
    pub states: Option<Vec<PropertyRecord>>,
    pub echoes: Option<Vec<EchoRecord>>,
}

/// One journal line. The schema line and property-change lines share the
/// `prop` shape; the schema is always the second line of a journal.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub enum JournalLine {
    #[serde(rename = "header")]
    Header(HeaderRecord),
    #[serde(rename = "prop")]
    Prop(Vec<PropertyRecord>),
    #[serde(rename = "frame")]
    Frame(FrameRecord),
}

/// Outcome of reading one physical line.
#[derive(Debug)]
pub enum ReadResult {
    Line(JournalLine),
    /// Clean end of the journal.
    Eof,
    /// Trailing bytes without a line terminator, left by an interrupted write.
    Torn { offset: u64 },
}

/// Forward-only journal reader.
pub struct JournalReader {
    reader: BufReader<File>,
    buf: Vec<u8>,
    offset: u64,
    line: usize,
}

impl JournalReader {
    pub fn open(path: &Path) -> Result<Self, JournalError> {
        let file = File::open(path).map_err(|e| JournalError::file_unavailable(path, e))?;
        Ok(Self {
            reader: BufReader::new(file),
            buf: Vec::new(),
            offset: 0,
            line: 0,
        })
    }

    /// Byte offset just past the last complete line read.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of complete lines read so far.
    pub fn lines_read(&self) -> usize {
        self.line
    }

    pub fn read_line(&mut self) -> Result<ReadResult, JournalError> {
        self.buf.clear();
        let n = self.reader.read_until(b'\n', &mut self.buf)?;
        if n == 0 {
            return Ok(ReadResult::Eof);
        }
        if self.buf.last() != Some(&b'\n') {
            return Ok(ReadResult::Torn {
                offset: self.offset,
            });
        }

        self.offset += n as u64;
        self.line += 1;
        let line = self.line;
        // Frames may repeat a key when one feed fires twice at the same
        // timestamp; going through `Value` keeps the last occurrence.
        serde_json::from_slice::<serde_json::Value>(&self.buf[..n - 1])
            .and_then(serde_json::from_value)
            .map(ReadResult::Line)
            .map_err(|e| JournalError::Corrupted {
                line,
                reason: e.to_string(),
            })
    }

    /// Read every complete line, stopping at the end or at a torn tail.
    pub fn scan_all(&mut self) -> Result<Vec<JournalLine>, JournalError> {
        let mut lines = Vec::new();
        while let ReadResult::Line(line) = self.read_line()? {
            lines.push(line);
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn journal(content: &str) -> NamedTempFile {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(content.as_bytes()).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    #[test]
    fn test_reads_all_line_shapes() {
        let tmp = journal(concat!(
            r#"{"header":{"prot_version":1,"devicetype":9,"protocol":2,"timestamp":5}}"#, "\n",
            r#"{"prop":[{"id":1,"signed":true,"limits":[-5,5],"val":-1},{"id":3,"enum":{"on":1},"val":1}]}"#, "\n",
            r#"{"frame":{"ts":5,"states":[{"id":10,"val":1.5}],"echoes":[[0,100.0,1.0,1]]}}"#, "\n",
            r#"{"prop":[{"id":4}]}"#, "\n",
        ));

        let mut reader = JournalReader::open(tmp.path()).unwrap();
        let lines = reader.scan_all().unwrap();
        assert_eq!(lines.len(), 4);
        assert_eq!(reader.lines_read(), 4);

        assert!(matches!(&lines[0], JournalLine::Header(h) if h.devicetype == 9));
        match &lines[1] {
            JournalLine::Prop(props) => {
                assert_eq!(props[0].signed, Some(true));
                assert_eq!(props[1].labels.as_ref().unwrap()["on"], 1);
            }
            other => panic!("expected schema, got {other:?}"),
        }
        match &lines[2] {
            JournalLine::Frame(frame) => {
                assert_eq!(frame.ts, 5);
                assert_eq!(frame.echoes.as_ref().unwrap()[0], EchoRecord(0, Some(100.0), Some(1.0), 1));
            }
            other => panic!("expected frame, got {other:?}"),
        }
        assert!(matches!(&lines[3], JournalLine::Prop(p) if p[0].val.is_none()));
    }

    #[test]
    fn test_detects_torn_tail() {
        let tmp = journal("{\"prop\":[]}\n{\"frame\":{\"ts\":");
        let mut reader = JournalReader::open(tmp.path()).unwrap();

        assert!(matches!(reader.read_line().unwrap(), ReadResult::Line(_)));
        match reader.read_line().unwrap() {
            ReadResult::Torn { offset } => assert_eq!(offset, 12),
            other => panic!("expected torn tail, got {other:?}"),
        }
    }

    #[test]
    fn test_repeated_frame_key_keeps_last() {
        let tmp = journal(concat!(
            r#"{"frame":{"ts":3,"states":[{"id":1,"val":1}],"states":[{"id":1,"val":2}]}}"#, "\n",
        ));
        let mut reader = JournalReader::open(tmp.path()).unwrap();
        match reader.scan_all().unwrap().remove(0) {
            JournalLine::Frame(frame) => {
                let states = frame.states.unwrap();
                assert_eq!(states[0].val, Some(serde_json::json!(2)));
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn test_garbage_line_is_corrupted() {
        let tmp = journal("{\"prop\":[]}\nnot json\n");
        let mut reader = JournalReader::open(tmp.path()).unwrap();
        let err = reader.scan_all().unwrap_err();
        assert!(matches!(err, JournalError::Corrupted { line: 2, .. }));
    }
}
