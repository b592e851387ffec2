use ljr_common::{JournalError, Property, SensorEvent, Timestamp};
use ljr_json::JsonBuilder;
use tracing::debug;

use crate::serializer::{self, EchoSnapshot};

/// Destination for complete journal lines.
pub trait LineSink {
    /// Persist one complete JSON document as one line.
    fn write_line(&mut self, line: &[u8]) -> Result<(), JournalError>;
}

/// Framing state. `Open` carries the timestamp the frame was opened with,
/// which never changes while the frame stays open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Open(Timestamp),
}

/// Turns the event stream into framed journal lines.
///
/// At most one frame is open at a time. State and echo updates sharing the
/// open frame's timestamp are appended to it; any other timestamp closes it
/// and opens a new one. A property change always closes the open frame and
/// is written as its own line, after which the next data update opens a
/// fresh frame even if its timestamp repeats.
pub struct Framer {
    builder: JsonBuilder,
    state: FrameState,
    echoes: EchoSnapshot,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    pub fn new() -> Self {
        Self {
            builder: JsonBuilder::with_capacity(4096),
            state: FrameState::Idle,
            echoes: EchoSnapshot::default(),
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Timestamp of the open frame, `None` when no frame is open.
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        match self.state {
            FrameState::Open(ts) => Some(ts),
            FrameState::Idle => None,
        }
    }

    /// Nesting depth of the document under construction.
    pub fn depth(&self) -> usize {
        self.builder.depth()
    }

    /// Apply one event.
    pub fn handle(
        &mut self,
        event: SensorEvent<'_>,
        sink: &mut dyn LineSink,
    ) -> Result<(), JournalError> {
        match event {
            SensorEvent::StatesUpdated(states) => {
                let ts = states.timestamp();
                let entered = self.enter_frame(ts, sink);
                if self.state != FrameState::Open(ts) {
                    return entered;
                }
                let appended =
                    append(&mut self.builder, |b| serializer::write_states(b, states.properties()));
                entered.and(appended)
            }
            SensorEvent::EchoesUpdated(provider) => {
                // Copy under the provider's lock, emit after releasing it.
                self.echoes.copy_from(provider)?;
                let ts = self.echoes.timestamp;
                let entered = self.enter_frame(ts, sink);
                if self.state != FrameState::Open(ts) {
                    return entered;
                }
                let appended = append(&mut self.builder, |b| serializer::write_echoes(b, &self.echoes));
                entered.and(appended)
            }
            SensorEvent::PropertyChanged(property) => self.property_changed(property, sink),
        }
    }

    /// Close and flush the open frame, if any.
    pub fn finish(&mut self, sink: &mut dyn LineSink) -> Result<(), JournalError> {
        self.close_frame(sink)
    }

    /// Write a standalone top-level document as one line. Only valid while
    /// no frame is open.
    pub fn write_document(
        &mut self,
        sink: &mut dyn LineSink,
        build: impl FnOnce(&mut JsonBuilder) -> Result<(), JournalError>,
    ) -> Result<(), JournalError> {
        if self.state != FrameState::Idle {
            return Err(JournalError::MalformedDocument {
                reason: "standalone document while a frame is open",
            });
        }
        self.builder.reset();
        if let Err(err) = build(&mut self.builder) {
            self.builder.reset();
            return Err(err);
        }
        self.flush(sink)
    }

    fn property_changed(
        &mut self,
        property: &Property,
        sink: &mut dyn LineSink,
    ) -> Result<(), JournalError> {
        // The change is written even when the open frame could not be.
        let closed = self.close_frame(sink);
        self.write_document(sink, |b| {
            b.begin_object()?;
            b.key("prop")?;
            b.begin_array()?;
            serializer::write_update(b, property)?;
            b.end_array()?;
            b.end_object()
        })?;
        debug!(id = property.id, "property change written");
        closed
    }

    /// Make `ts` the open frame. A failure to flush the previous frame is
    /// returned only after the new frame has been opened.
    fn enter_frame(&mut self, ts: Timestamp, sink: &mut dyn LineSink) -> Result<(), JournalError> {
        match self.state {
            FrameState::Open(open) if open == ts => Ok(()),
            FrameState::Open(_) => {
                let closed = self.close_frame(sink);
                self.open_frame(ts)?;
                closed
            }
            FrameState::Idle => self.open_frame(ts),
        }
    }

    fn open_frame(&mut self, ts: Timestamp) -> Result<(), JournalError> {
        self.builder.reset();
        if let Err(err) = begin_frame(&mut self.builder, ts) {
            self.builder.reset();
            return Err(err);
        }
        self.state = FrameState::Open(ts);
        Ok(())
    }

    fn close_frame(&mut self, sink: &mut dyn LineSink) -> Result<(), JournalError> {
        let FrameState::Open(ts) = self.state else {
            return Ok(());
        };
        self.state = FrameState::Idle;

        let closed = self
            .builder
            .end_object()
            .and_then(|()| self.builder.end_object());
        if let Err(err) = closed {
            self.builder.reset();
            return Err(err);
        }
        self.flush(sink)?;
        debug!(ts, "frame written");
        Ok(())
    }

    /// Hand the finished document to the sink and reset the builder. An
    /// incomplete document is discarded rather than written.
    fn flush(&mut self, sink: &mut dyn LineSink) -> Result<(), JournalError> {
        if !self.builder.is_complete() {
            self.builder.reset();
            return Err(JournalError::MalformedDocument {
                reason: "flush of an incomplete document",
            });
        }
        let written = sink.write_line(self.builder.as_bytes());
        self.builder.reset();
        written
    }
}

/// `{"frame":{"ts":ts` with both objects left open.
fn begin_frame(b: &mut JsonBuilder, ts: Timestamp) -> Result<(), JournalError> {
    b.begin_object()?;
    b.key("frame")?;
    b.begin_object()?;
    b.key("ts")?;
    b.u64(ts.into())
}

/// Run `write` against the open frame. On failure the frame is restored to
/// what it held before, so it can still be closed cleanly.
fn append(
    builder: &mut JsonBuilder,
    write: impl FnOnce(&mut JsonBuilder) -> Result<(), JournalError>,
) -> Result<(), JournalError> {
    let mark = builder.mark();
    let result = write(builder);
    if result.is_err() {
        builder.rewind(mark);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use ljr_common::{
        Echo, EchoGuard, EchoProvider, EchoSet, PropertySet, PropertyValue, SharedEchoes,
        StateSnapshot,
    };
    use serde_json::{json, Value};

    #[derive(Default)]
    struct MemorySink {
        lines: Vec<Value>,
        fail_next: bool,
    }

    impl LineSink for MemorySink {
        fn write_line(&mut self, line: &[u8]) -> Result<(), JournalError> {
            if self.fail_next {
                self.fail_next = false;
                return Err(JournalError::Io(std::io::Error::other("disk full")));
            }
            self.lines.push(serde_json::from_slice(line).unwrap());
            Ok(())
        }
    }

    struct PoisonedEchoes;

    impl EchoProvider for PoisonedEchoes {
        fn lock(&self) -> Result<EchoGuard<'_>, JournalError> {
            Err(JournalError::ProviderPoisoned)
        }
    }

    fn states(ts: Timestamp, value: f64) -> StateSnapshot {
        StateSnapshot {
            timestamp: ts,
            states: PropertySet::new(vec![Property::new(
                100,
                true,
                PropertyValue::Float { values: vec![value], limits: (0.0, 100.0) },
            )]),
        }
    }

    fn echoes(ts: Timestamp) -> SharedEchoes {
        SharedEchoes::new(EchoSet {
            timestamp: ts,
            echoes: vec![Echo { channel_index: 0, distance: 1000, amplitude: 20, flag: 1 }],
            distance_scale: 10.0,
            amplitude_scale: 2.0,
        })
    }

    fn frame_keys(line: &Value) -> Vec<String> {
        line["frame"].as_object().unwrap().keys().cloned().collect()
    }

    #[test]
    fn test_same_timestamp_coalesces() {
        let mut framer = Framer::new();
        let mut sink = MemorySink::default();
        let s = states(5, 1.0);
        let e = echoes(5);

        framer.handle(SensorEvent::StatesUpdated(&s), &mut sink).unwrap();
        framer.handle(SensorEvent::EchoesUpdated(&e), &mut sink).unwrap();
        assert!(sink.lines.is_empty());
        framer.finish(&mut sink).unwrap();

        assert_eq!(sink.lines.len(), 1);
        assert_eq!(
            sink.lines[0],
            json!({"frame": {"ts": 5, "states": [{"id": 100, "val": 1.0}], "echoes": [[0, 100.0, 10.0, 1]]}})
        );
    }

    #[test]
    fn test_echoes_first_then_states() {
        let mut framer = Framer::new();
        let mut sink = MemorySink::default();
        let e = echoes(8);
        let s = states(8, 2.0);

        framer.handle(SensorEvent::EchoesUpdated(&e), &mut sink).unwrap();
        framer.handle(SensorEvent::StatesUpdated(&s), &mut sink).unwrap();
        framer.finish(&mut sink).unwrap();

        assert_eq!(sink.lines.len(), 1);
        let mut keys = frame_keys(&sink.lines[0]);
        keys.sort();
        assert_eq!(keys, vec!["echoes", "states", "ts"]);
    }

    #[test]
    fn test_new_timestamp_closes_frame() {
        let mut framer = Framer::new();
        let mut sink = MemorySink::default();

        framer.handle(SensorEvent::StatesUpdated(&states(5, 1.0)), &mut sink).unwrap();
        framer.handle(SensorEvent::StatesUpdated(&states(6, 2.0)), &mut sink).unwrap();
        assert_eq!(sink.lines.len(), 1);
        assert_eq!(sink.lines[0]["frame"]["ts"], 5);
        assert_eq!(framer.state(), FrameState::Open(6));

        framer.finish(&mut sink).unwrap();
        assert_eq!(sink.lines.len(), 2);
        assert_eq!(sink.lines[1]["frame"]["ts"], 6);
        assert_eq!(framer.state(), FrameState::Idle);
    }

    #[test]
    fn test_property_change_interrupts_framing() {
        let mut framer = Framer::new();
        let mut sink = MemorySink::default();
        let prop = Property::new(7, true, PropertyValue::Bitfield(vec![3]));

        framer.handle(SensorEvent::StatesUpdated(&states(5, 1.0)), &mut sink).unwrap();
        framer.handle(SensorEvent::PropertyChanged(&prop), &mut sink).unwrap();
        assert_eq!(framer.last_timestamp(), None);
        framer.handle(SensorEvent::StatesUpdated(&states(5, 1.5)), &mut sink).unwrap();
        framer.finish(&mut sink).unwrap();

        assert_eq!(sink.lines.len(), 3);
        assert_eq!(frame_keys(&sink.lines[0]), vec!["states", "ts"]);
        assert_eq!(sink.lines[1], json!({"prop": [{"id": 7, "val": 3}]}));
        assert_eq!(sink.lines[2]["frame"]["ts"], 5);
        assert_eq!(sink.lines[2]["frame"]["states"][0]["val"], 1.5);
    }

    #[test]
    fn test_zero_timestamp_opens_a_frame() {
        let mut framer = Framer::new();
        let mut sink = MemorySink::default();

        framer.handle(SensorEvent::StatesUpdated(&states(0, 1.0)), &mut sink).unwrap();
        assert_eq!(framer.state(), FrameState::Open(0));
        framer.handle(SensorEvent::EchoesUpdated(&echoes(0)), &mut sink).unwrap();
        framer.finish(&mut sink).unwrap();

        assert_eq!(sink.lines.len(), 1);
        assert_eq!(sink.lines[0]["frame"]["ts"], 0);
        assert!(sink.lines[0]["frame"]["echoes"].is_array());
    }

    #[test]
    fn test_at_most_one_open_frame() {
        let mut framer = Framer::new();
        let mut sink = MemorySink::default();
        for ts in [1, 1, 2, 3, 3, 4] {
            framer.handle(SensorEvent::StatesUpdated(&states(ts, 0.0)), &mut sink).unwrap();
            assert_eq!(framer.depth(), 2);
        }
        framer.finish(&mut sink).unwrap();
        assert_eq!(framer.depth(), 0);
        assert_eq!(sink.lines.len(), 4);
    }

    #[test]
    fn test_finish_twice_is_noop() {
        let mut framer = Framer::new();
        let mut sink = MemorySink::default();
        framer.handle(SensorEvent::StatesUpdated(&states(1, 0.0)), &mut sink).unwrap();
        framer.finish(&mut sink).unwrap();
        framer.finish(&mut sink).unwrap();
        assert_eq!(sink.lines.len(), 1);
    }

    #[test]
    fn test_poisoned_provider_keeps_open_frame_intact() {
        let mut framer = Framer::new();
        let mut sink = MemorySink::default();

        framer.handle(SensorEvent::StatesUpdated(&states(4, 9.0)), &mut sink).unwrap();
        let err = framer
            .handle(SensorEvent::EchoesUpdated(&PoisonedEchoes), &mut sink)
            .unwrap_err();
        assert!(matches!(err, JournalError::ProviderPoisoned));
        assert_eq!(framer.state(), FrameState::Open(4));

        framer.finish(&mut sink).unwrap();
        assert_eq!(sink.lines.len(), 1);
        assert_eq!(frame_keys(&sink.lines[0]), vec!["states", "ts"]);
    }

    #[test]
    fn test_failed_flush_drops_only_that_line() {
        let mut framer = Framer::new();
        let mut sink = MemorySink::default();

        framer.handle(SensorEvent::StatesUpdated(&states(1, 0.0)), &mut sink).unwrap();
        sink.fail_next = true;
        let err = framer
            .handle(SensorEvent::StatesUpdated(&states(2, 2.5)), &mut sink)
            .unwrap_err();
        assert!(matches!(err, JournalError::Io(_)));
        assert_eq!(framer.state(), FrameState::Open(2));

        framer.handle(SensorEvent::StatesUpdated(&states(3, 3.5)), &mut sink).unwrap();
        framer.finish(&mut sink).unwrap();
        assert_eq!(sink.lines.len(), 2);
        assert_eq!(sink.lines[0]["frame"]["ts"], 2);
        assert_eq!(sink.lines[0]["frame"]["states"][0]["val"], 2.5);
        assert_eq!(sink.lines[1]["frame"]["ts"], 3);
    }

    #[test]
    fn test_failed_flush_keeps_incoming_echoes() {
        let mut framer = Framer::new();
        let mut sink = MemorySink::default();

        framer.handle(SensorEvent::StatesUpdated(&states(1, 0.0)), &mut sink).unwrap();
        sink.fail_next = true;
        framer
            .handle(SensorEvent::EchoesUpdated(&echoes(2)), &mut sink)
            .unwrap_err();
        framer.finish(&mut sink).unwrap();

        assert_eq!(sink.lines.len(), 1);
        assert_eq!(
            sink.lines[0],
            json!({"frame": {"ts": 2, "echoes": [[0, 100.0, 10.0, 1]]}})
        );
    }

    #[test]
    fn test_property_change_written_after_failed_flush() {
        let mut framer = Framer::new();
        let mut sink = MemorySink::default();
        let prop = Property::new(7, true, PropertyValue::Text(vec!["eco".into()]));

        framer.handle(SensorEvent::StatesUpdated(&states(1, 0.0)), &mut sink).unwrap();
        sink.fail_next = true;
        let err = framer
            .handle(SensorEvent::PropertyChanged(&prop), &mut sink)
            .unwrap_err();
        assert!(matches!(err, JournalError::Io(_)));
        assert_eq!(framer.state(), FrameState::Idle);

        framer.finish(&mut sink).unwrap();
        assert_eq!(sink.lines, vec![json!({"prop": [{"id": 7, "val": "eco"}]})]);
    }

    #[test]
    fn test_document_rejected_while_frame_open() {
        let mut framer = Framer::new();
        let mut sink = MemorySink::default();
        framer.handle(SensorEvent::StatesUpdated(&states(1, 0.0)), &mut sink).unwrap();

        let err = framer
            .write_document(&mut sink, |b| {
                b.begin_object()?;
                b.end_object()
            })
            .unwrap_err();
        assert!(matches!(err, JournalError::MalformedDocument { .. }));
        assert_eq!(framer.state(), FrameState::Open(1));
    }

    #[test]
    fn test_unbalanced_document_is_not_written() {
        let mut framer = Framer::new();
        let mut sink = MemorySink::default();
        let err = framer
            .write_document(&mut sink, |b| {
                b.begin_object()?;
                b.key("prop")?;
                b.begin_array()
            })
            .unwrap_err();
        assert!(matches!(err, JournalError::MalformedDocument { .. }));
        assert!(sink.lines.is_empty());
    }
}
