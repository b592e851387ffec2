//! Line-delimited telemetry journal: one self-contained JSON document per
//! line, written forward-only while a sensor session runs.

pub mod config;
pub mod frame;
pub mod naming;
pub mod reader;
pub mod recorder;
pub mod recovery;
pub mod serializer;
pub mod writer;

pub use config::RecorderConfig;
pub use frame::{FrameState, Framer, LineSink};
pub use recorder::Recorder;
pub use writer::JournalWriter;
