use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Stable integer identifier of a sensor property.
pub type PropertyId = u32;

/// Sensor-side 32-bit timestamp keying a data frame.
pub type Timestamp = u32;

/// Version of the line format written into every journal header.
pub const LJR_PROT_VERSION: u32 = 1;

/// File extension appended to journal paths that lack it.
pub const LJR_EXTENSION: &str = "ljr";

// ---------------------------------------------------------------------------
// Property model
// ---------------------------------------------------------------------------

/// Value-kind tag of a property. The set is closed: anything else coming
/// from outside the type system is an `UnsupportedPropertyType` fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    Bitfield,
    Boolean,
    Enumerated,
    Float,
    Integer,
    Text,
    Buffer,
}

impl PropertyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyKind::Bitfield => "bitfield",
            PropertyKind::Boolean => "boolean",
            PropertyKind::Enumerated => "enumerated",
            PropertyKind::Float => "float",
            PropertyKind::Integer => "integer",
            PropertyKind::Text => "text",
            PropertyKind::Buffer => "buffer",
        }
    }
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PropertyKind {
    type Err = JournalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bitfield" => Ok(PropertyKind::Bitfield),
            "boolean" | "bool" => Ok(PropertyKind::Boolean),
            "enumerated" | "enum" => Ok(PropertyKind::Enumerated),
            "float" => Ok(PropertyKind::Float),
            "integer" | "int" => Ok(PropertyKind::Integer),
            "text" => Ok(PropertyKind::Text),
            "buffer" => Ok(PropertyKind::Buffer),
            _ => Err(JournalError::UnsupportedPropertyType {
                kind: s.to_string(),
            }),
        }
    }
}

/// Integer storage; signed-ness decides how values and limits are rendered.
#[derive(Clone, Debug, PartialEq)]
pub enum IntegerValues {
    Signed { values: Vec<i64>, limits: (i64, i64) },
    Unsigned { values: Vec<u64>, limits: (u64, u64) },
}

impl IntegerValues {
    pub fn is_signed(&self) -> bool {
        matches!(self, IntegerValues::Signed { .. })
    }

    pub fn len(&self) -> usize {
        match self {
            IntegerValues::Signed { values, .. } => values.len(),
            IntegerValues::Unsigned { values, .. } => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stored values of a property, one payload shape per kind.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    Bitfield(Vec<u64>),
    Boolean(Vec<bool>),
    /// Underlying values plus the ordered (label, value) table.
    Enumerated {
        values: Vec<u64>,
        labels: Vec<(String, u64)>,
    },
    Float {
        values: Vec<f64>,
        limits: (f64, f64),
    },
    Integer(IntegerValues),
    Text(Vec<String>),
    Buffer(Vec<String>),
}

impl PropertyValue {
    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyValue::Bitfield(_) => PropertyKind::Bitfield,
            PropertyValue::Boolean(_) => PropertyKind::Boolean,
            PropertyValue::Enumerated { .. } => PropertyKind::Enumerated,
            PropertyValue::Float { .. } => PropertyKind::Float,
            PropertyValue::Integer(_) => PropertyKind::Integer,
            PropertyValue::Text(_) => PropertyKind::Text,
            PropertyValue::Buffer(_) => PropertyKind::Buffer,
        }
    }

    /// Cardinality: number of stored values.
    pub fn count(&self) -> usize {
        match self {
            PropertyValue::Bitfield(v) => v.len(),
            PropertyValue::Boolean(v) => v.len(),
            PropertyValue::Enumerated { values, .. } => values.len(),
            PropertyValue::Float { values, .. } => values.len(),
            PropertyValue::Integer(ints) => ints.len(),
            PropertyValue::Text(v) => v.len(),
            PropertyValue::Buffer(v) => v.len(),
        }
    }
}

/// A typed, named sensor property as exposed by the registry.
#[derive(Clone, Debug, PartialEq)]
pub struct Property {
    pub id: PropertyId,
    /// Included in the journal's schema and value streams when set.
    pub persist: bool,
    pub value: PropertyValue,
}

impl Property {
    pub fn new(id: PropertyId, persist: bool, value: PropertyValue) -> Self {
        Self { id, persist, value }
    }

    pub fn kind(&self) -> PropertyKind {
        self.value.kind()
    }

    pub fn count(&self) -> usize {
        self.value.count()
    }
}

// ---------------------------------------------------------------------------
// Property registry boundary
// ---------------------------------------------------------------------------

/// Read-only view of the sensor's property registry.
pub trait PropertyRegistry {
    fn properties(&self) -> &[Property];

    fn find(&self, id: PropertyId) -> Option<&Property> {
        self.properties().iter().find(|p| p.id == id)
    }

    /// Properties flagged for inclusion in the journal, in registry order.
    fn persisted(&self) -> Vec<&Property> {
        self.properties().iter().filter(|p| p.persist).collect()
    }
}

/// Plain in-memory registry.
#[derive(Clone, Debug, Default)]
pub struct PropertySet {
    properties: Vec<Property>,
}

impl PropertySet {
    pub fn new(properties: Vec<Property>) -> Self {
        Self { properties }
    }

    pub fn insert(&mut self, property: Property) {
        match self.properties.iter_mut().find(|p| p.id == property.id) {
            Some(existing) => *existing = property,
            None => self.properties.push(property),
        }
    }

    pub fn find_mut(&mut self, id: PropertyId) -> Option<&mut Property> {
        self.properties.iter_mut().find(|p| p.id == id)
    }
}

impl PropertyRegistry for PropertySet {
    fn properties(&self) -> &[Property] {
        &self.properties
    }
}

// ---------------------------------------------------------------------------
// Result providers
// ---------------------------------------------------------------------------

/// Latest decoded sensor states.
pub trait StateProvider {
    fn timestamp(&self) -> Timestamp;
    fn properties(&self) -> &[Property];
}

/// States snapshot keyed by the timestamp they were decoded at.
#[derive(Clone, Debug, Default)]
pub struct StateSnapshot {
    pub timestamp: Timestamp,
    pub states: PropertySet,
}

impl StateProvider for StateSnapshot {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    fn properties(&self) -> &[Property] {
        self.states.properties()
    }
}

/// One reflected-signal measurement, in raw device units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Echo {
    pub channel_index: u32,
    pub distance: i32,
    pub amplitude: u32,
    pub flag: u16,
}

/// Provider-owned echo storage. Scales are divisors applied to raw
/// distance and amplitude at serialization time.
#[derive(Clone, Debug, PartialEq)]
pub struct EchoSet {
    pub timestamp: Timestamp,
    pub echoes: Vec<Echo>,
    pub distance_scale: f64,
    pub amplitude_scale: f64,
}

impl Default for EchoSet {
    fn default() -> Self {
        Self {
            timestamp: 0,
            echoes: Vec::new(),
            distance_scale: 1.0,
            amplitude_scale: 1.0,
        }
    }
}

/// Scoped read access to an echo provider's storage. The provider's lock is
/// held for as long as the guard lives and released when it is dropped.
pub struct EchoGuard<'a> {
    inner: MutexGuard<'a, EchoSet>,
}

impl<'a> EchoGuard<'a> {
    pub fn new(inner: MutexGuard<'a, EchoSet>) -> Self {
        Self { inner }
    }
}

impl Deref for EchoGuard<'_> {
    type Target = EchoSet;

    fn deref(&self) -> &EchoSet {
        &self.inner
    }
}

/// Latest echoes, shared with an acquisition thread.
pub trait EchoProvider {
    fn lock(&self) -> Result<EchoGuard<'_>, JournalError>;
}

/// Mutex-protected echo storage written by an acquisition thread.
#[derive(Debug, Default)]
pub struct SharedEchoes {
    inner: Mutex<EchoSet>,
}

impl SharedEchoes {
    pub fn new(set: EchoSet) -> Self {
        Self {
            inner: Mutex::new(set),
        }
    }

    /// Replace the stored echoes with a freshly decoded set.
    pub fn publish(&self, set: EchoSet) -> Result<(), JournalError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| JournalError::ProviderPoisoned)?;
        *inner = set;
        Ok(())
    }
}

impl EchoProvider for SharedEchoes {
    fn lock(&self) -> Result<EchoGuard<'_>, JournalError> {
        self.inner
            .lock()
            .map(EchoGuard::new)
            .map_err(|_| JournalError::ProviderPoisoned)
    }
}

// ---------------------------------------------------------------------------
// Events and session metadata
// ---------------------------------------------------------------------------

/// The three notifications a recording session reacts to.
pub enum SensorEvent<'a> {
    StatesUpdated(&'a dyn StateProvider),
    EchoesUpdated(&'a dyn EchoProvider),
    PropertyChanged(&'a Property),
}

impl SensorEvent<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            SensorEvent::StatesUpdated(_) => "states",
            SensorEvent::EchoesUpdated(_) => "echoes",
            SensorEvent::PropertyChanged(_) => "property",
        }
    }
}

impl fmt::Debug for SensorEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorEvent::StatesUpdated(p) => write!(f, "StatesUpdated(ts={})", p.timestamp()),
            SensorEvent::EchoesUpdated(_) => write!(f, "EchoesUpdated"),
            SensorEvent::PropertyChanged(p) => write!(f, "PropertyChanged(id={})", p.id),
        }
    }
}

/// Device metadata written into the journal header.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub device_type: u32,
    /// Connection protocol code.
    pub protocol: u32,
    #[serde(default)]
    pub device_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal file already exists: {}", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("a recording session is already active")]
    SessionAlreadyActive,

    #[error("no recording session is active")]
    SessionNotActive,

    #[error("journal file {} unavailable: {source}", path.display())]
    FileUnavailable {
        path: PathBuf,
        code: Option<i32>,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported property type: {kind}")]
    UnsupportedPropertyType { kind: String },

    #[error("malformed JSON document: {reason}")]
    MalformedDocument { reason: &'static str },

    #[error("echo provider lock poisoned")]
    ProviderPoisoned,

    #[error("corrupted journal line {line}: {reason}")]
    Corrupted { line: usize, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl JournalError {
    /// Wrap an OS-level failure on the journal file, keeping its error code.
    pub fn file_unavailable(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        JournalError::FileUnavailable {
            path: path.into(),
            code: source.raw_os_error(),
            source,
        }
    }
}
