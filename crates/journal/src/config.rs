use ljr_common::{PropertyId, LJR_EXTENSION, LJR_PROT_VERSION};
use serde::Deserialize;

/// Recorder settings, typically read from the `[recorder]` table of a
/// scenario file.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Extension appended to journal paths that lack it.
    pub extension: String,
    /// Fsync after every line instead of only flushing to the OS.
    pub sync_each_line: bool,
    /// Value written as `prot_version` in the header line.
    pub protocol_version: u32,
    /// Registry text property holding the device name used for default
    /// journal names. Falls back to the session's device name.
    pub device_name_property: Option<PropertyId>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            extension: LJR_EXTENSION.to_string(),
            sync_each_line: false,
            protocol_version: LJR_PROT_VERSION,
            device_name_property: None,
        }
    }
}
