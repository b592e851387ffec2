use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Local, Utc};
use ljr_common::{JournalError, PropertyId, PropertyRegistry, PropertyValue, SensorEvent, SessionInfo};
use tracing::{debug, info, warn};

use crate::config::RecorderConfig;
use crate::frame::Framer;
use crate::naming::resolve_journal_path;
use crate::serializer;
use crate::writer::JournalWriter;

struct Session {
    writer: JournalWriter,
    framer: Framer,
}

/// Owns at most one recording session.
///
/// Dropping a recorder ends its session, so the last open frame is flushed
/// rather than lost.
pub struct Recorder {
    config: RecorderConfig,
    session: Option<Session>,
}

impl Recorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    /// Path of the active journal.
    pub fn path(&self) -> Option<&Path> {
        self.session.as_ref().map(|s| s.writer.path())
    }

    /// Create the journal and write its header and schema lines. Returns the
    /// path actually used.
    pub fn start(
        &mut self,
        requested: Option<&Path>,
        info: &SessionInfo,
        registry: &dyn PropertyRegistry,
    ) -> Result<PathBuf, JournalError> {
        if self.session.is_some() {
            return Err(JournalError::SessionAlreadyActive);
        }

        let path = resolve_journal_path(
            requested,
            device_name(self.config.device_name_property, info, registry),
            Local::now().naive_local(),
            &self.config.extension,
        );
        let mut writer = JournalWriter::create(&path, self.config.sync_each_line)?;
        let mut framer = Framer::new();

        let protocol_version = self.config.protocol_version;
        let timestamp = u64::try_from(Utc::now().timestamp()).unwrap_or(0);
        let mut catalogued = 0;
        let started = framer
            .write_document(&mut writer, |b| {
                serializer::write_header(b, info, protocol_version, timestamp)
            })
            .and_then(|()| {
                framer.write_document(&mut writer, |b| {
                    catalogued = serializer::write_schema(b, registry)?;
                    Ok(())
                })
            });

        if let Err(err) = started {
            drop(writer);
            if let Err(rm) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %rm, "could not remove partial journal");
            }
            return Err(err);
        }

        info!(path = %path.display(), properties = catalogued, "recording started");
        self.session = Some(Session { writer, framer });
        Ok(path)
    }

    /// Feed one sensor event into the active session.
    pub fn record(&mut self, event: SensorEvent<'_>) -> Result<(), JournalError> {
        let session = self.session.as_mut().ok_or(JournalError::SessionNotActive)?;
        if let SensorEvent::PropertyChanged(property) = &event {
            if !property.persist {
                debug!(id = property.id, kind = %property.kind(), "ignoring change of unpersisted property");
                return Ok(());
            }
        }
        let name = event.name();
        let result = session.framer.handle(event, &mut session.writer);
        if let Err(err) = &result {
            warn!(event = name, error = %err, "journal line not written");
        }
        result
    }

    /// End the session: flush the open frame and release the file. Does
    /// nothing when no session is active.
    pub fn stop(&mut self) -> Result<(), JournalError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        let flushed = session.framer.finish(&mut session.writer);
        let lines = session.writer.lines_written();
        let path = session.writer.path().to_path_buf();
        let closed = session.writer.close();
        info!(path = %path.display(), lines, "recording stopped");
        flushed.and(closed)
    }
}

/// Device name for default journal names: the registry's device-name text
/// property when configured and set, else the session's.
fn device_name<'a>(
    property: Option<PropertyId>,
    info: &'a SessionInfo,
    registry: &'a dyn PropertyRegistry,
) -> Option<&'a str> {
    property
        .and_then(|id| registry.find(id))
        .and_then(|p| match &p.value {
            PropertyValue::Text(values) => values.first().map(String::as_str),
            _ => None,
        })
        .filter(|name| !name.is_empty())
        .or(info.device_name.as_deref())
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "journal not closed cleanly");
        }
    }
}
