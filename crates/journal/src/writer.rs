use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use ljr_common::JournalError;
use tracing::warn;

use crate::frame::LineSink;

/// Storage under a journal: appendable bytes that can be cut back to a
/// known length.
pub trait JournalFile: Write {
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
    fn sync_data(&mut self) -> io::Result<()>;
}

impl JournalFile for File {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync_data(&mut self) -> io::Result<()> {
        File::sync_data(self)
    }
}

/// Append-only journal. Every line is a complete JSON document, handed to
/// the OS in one piece as soon as it is written.
///
/// The file only ever holds whole lines: when a write fails part way, the
/// bytes that reached the file are cut off again before the error is
/// returned, so later lines start on a clean line boundary.
pub struct JournalWriter<F: JournalFile = File> {
    path: PathBuf,
    file: F,
    line: Vec<u8>,
    sync_each_line: bool,
    lines: u64,
    /// Length of the file after the last complete line.
    committed: u64,
    /// A partial line may still be in the file.
    torn: bool,
}

impl JournalWriter<File> {
    /// Create a new journal. Fails with `AlreadyExists` rather than touching
    /// a file that is already there.
    pub fn create(path: &Path, sync_each_line: bool) -> Result<Self, JournalError> {
        let file = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => JournalError::AlreadyExists {
                    path: path.to_path_buf(),
                },
                _ => JournalError::file_unavailable(path, e),
            })?;
        Ok(Self::from_file(path, file, sync_each_line))
    }
}

impl<F: JournalFile> JournalWriter<F> {
    /// Journal over an already opened, empty `file`.
    pub fn from_file(path: impl Into<PathBuf>, file: F, sync_each_line: bool) -> Self {
        Self {
            path: path.into(),
            file,
            line: Vec::with_capacity(4096),
            sync_each_line,
            lines: 0,
            committed: 0,
            torn: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of lines written through this writer.
    pub fn lines_written(&self) -> u64 {
        self.lines
    }

    /// Bytes of complete lines in the journal.
    pub fn committed_len(&self) -> u64 {
        self.committed
    }

    /// Append one line. On failure the line is dropped and the file is left
    /// ending at the previous line.
    pub fn append_line(&mut self, line: &[u8]) -> Result<(), JournalError> {
        if self.torn {
            self.cut_partial_line()
                .map_err(|e| JournalError::file_unavailable(&self.path, e))?;
        }

        self.line.clear();
        self.line.extend_from_slice(line);
        self.line.push(b'\n');

        if let Err(e) = self.write_pending() {
            self.torn = true;
            if let Err(cut) = self.cut_partial_line() {
                warn!(path = %self.path.display(), error = %cut, "could not cut off partial journal line");
            }
            return Err(JournalError::file_unavailable(&self.path, e));
        }
        self.committed += self.line.len() as u64;
        self.lines += 1;
        Ok(())
    }

    /// Push written lines to stable storage.
    pub fn sync(&mut self) -> Result<(), JournalError> {
        self.file
            .flush()
            .and_then(|()| self.file.sync_data())
            .map_err(|e| JournalError::file_unavailable(&self.path, e))
    }

    /// Flush and release the file.
    pub fn close(mut self) -> Result<(), JournalError> {
        if self.torn {
            self.cut_partial_line()
                .map_err(|e| JournalError::file_unavailable(&self.path, e))?;
        }
        if self.sync_each_line {
            self.sync()
        } else {
            self.file
                .flush()
                .map_err(|e| JournalError::file_unavailable(&self.path, e))
        }
    }

    fn write_pending(&mut self) -> io::Result<()> {
        self.file.write_all(&self.line)?;
        self.file.flush()?;
        if self.sync_each_line {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn cut_partial_line(&mut self) -> io::Result<()> {
        self.file.truncate_to(self.committed)?;
        self.torn = false;
        Ok(())
    }
}

impl<F: JournalFile> LineSink for JournalWriter<F> {
    fn write_line(&mut self, line: &[u8]) -> Result<(), JournalError> {
        self.append_line(line)
    }
}
