use ljr_common::{
    Echo, EchoProvider, IntegerValues, JournalError, Property, PropertyRegistry, PropertyValue,
    SessionInfo, Timestamp,
};
use ljr_json::JsonBuilder;

/// Echoes copied out of a provider so that JSON emission never happens under
/// the provider's lock. Reused between frames to avoid reallocating.
#[derive(Debug, Clone)]
pub struct EchoSnapshot {
    pub timestamp: Timestamp,
    pub echoes: Vec<Echo>,
    pub distance_scale: f64,
    pub amplitude_scale: f64,
}

impl Default for EchoSnapshot {
    fn default() -> Self {
        Self {
            timestamp: 0,
            echoes: Vec::new(),
            distance_scale: 1.0,
            amplitude_scale: 1.0,
        }
    }
}

impl EchoSnapshot {
    /// Copy the provider's current echoes. The guard is dropped before this
    /// returns, on the error path as well.
    pub fn copy_from(&mut self, provider: &dyn EchoProvider) -> Result<(), JournalError> {
        let guard = provider.lock()?;
        self.timestamp = guard.timestamp;
        self.distance_scale = guard.distance_scale;
        self.amplitude_scale = guard.amplitude_scale;
        self.echoes.clear();
        self.echoes.extend_from_slice(&guard.echoes);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Session start lines
// ---------------------------------------------------------------------------

/// `{"header":{"prot_version":..,"devicetype":..,"protocol":..,"timestamp":..}}`
pub fn write_header(
    b: &mut JsonBuilder,
    info: &SessionInfo,
    protocol_version: u32,
    timestamp: u64,
) -> Result<(), JournalError> {
    b.begin_object()?;
    b.key("header")?;
    b.begin_object()?;
    b.key("prot_version")?;
    b.u64(protocol_version.into())?;
    b.key("devicetype")?;
    b.u64(info.device_type.into())?;
    b.key("protocol")?;
    b.u64(info.protocol.into())?;
    b.key("timestamp")?;
    b.u64(timestamp)?;
    b.end_object()?;
    b.end_object()
}

/// The property catalogue: every persisted property with at least one value,
/// with its type metadata and current values. Returns the number of entries.
pub fn write_schema(
    b: &mut JsonBuilder,
    registry: &dyn PropertyRegistry,
) -> Result<usize, JournalError> {
    let mut written = 0;
    b.begin_object()?;
    b.key("prop")?;
    b.begin_array()?;
    for property in registry.persisted() {
        if property.count() == 0 {
            continue;
        }
        write_schema_entry(b, property)?;
        written += 1;
    }
    b.end_array()?;
    b.end_object()?;
    Ok(written)
}

fn write_schema_entry(b: &mut JsonBuilder, property: &Property) -> Result<(), JournalError> {
    b.begin_object()?;
    b.key("id")?;
    b.u64(property.id.into())?;

    match &property.value {
        PropertyValue::Float { limits, .. } => {
            b.key("limits")?;
            b.begin_array()?;
            b.f64(limits.0)?;
            b.f64(limits.1)?;
            b.end_array()?;
        }
        PropertyValue::Integer(ints) => {
            b.key("signed")?;
            b.bool(ints.is_signed())?;
            b.key("limits")?;
            b.begin_array()?;
            match ints {
                IntegerValues::Signed { limits, .. } => {
                    b.i64(limits.0)?;
                    b.i64(limits.1)?;
                }
                IntegerValues::Unsigned { limits, .. } => {
                    b.u64(limits.0)?;
                    b.u64(limits.1)?;
                }
            }
            b.end_array()?;
        }
        PropertyValue::Enumerated { labels, .. } => {
            b.key("enum")?;
            b.begin_object()?;
            for (label, value) in labels {
                b.key(label)?;
                b.u64(*value)?;
            }
            b.end_object()?;
        }
        PropertyValue::Bitfield(_)
        | PropertyValue::Boolean(_)
        | PropertyValue::Text(_)
        | PropertyValue::Buffer(_) => {}
    }

    write_values(b, property)?;
    b.end_object()
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// `{"id":..,"val":..}` for a value update.
pub fn write_update(b: &mut JsonBuilder, property: &Property) -> Result<(), JournalError> {
    b.begin_object()?;
    b.key("id")?;
    b.u64(property.id.into())?;
    write_values(b, property)?;
    b.end_object()
}

/// `"val": v` where `v` is a scalar for a single value and an array
/// otherwise. Nothing at all is written for a property without values.
pub fn write_values(b: &mut JsonBuilder, property: &Property) -> Result<(), JournalError> {
    let count = property.count();
    if count == 0 {
        return Ok(());
    }

    b.key("val")?;
    if count > 1 {
        b.begin_array()?;
    }

    match &property.value {
        PropertyValue::Bitfield(values) => emit_all(b, values, |b, v| b.u64(*v))?,
        PropertyValue::Boolean(values) => emit_all(b, values, |b, v| b.bool(*v))?,
        PropertyValue::Enumerated { values, .. } => emit_all(b, values, |b, v| b.u64(*v))?,
        PropertyValue::Float { values, .. } => emit_all(b, values, |b, v| b.f64(*v))?,
        PropertyValue::Integer(IntegerValues::Signed { values, .. }) => {
            emit_all(b, values, |b, v| b.i64(*v))?
        }
        PropertyValue::Integer(IntegerValues::Unsigned { values, .. }) => {
            emit_all(b, values, |b, v| b.u64(*v))?
        }
        PropertyValue::Text(values) | PropertyValue::Buffer(values) => {
            emit_all(b, values, |b, v| b.string(v))?
        }
    }

    if count > 1 {
        b.end_array()?;
    }
    Ok(())
}

fn emit_all<T>(
    b: &mut JsonBuilder,
    values: &[T],
    mut emit: impl FnMut(&mut JsonBuilder, &T) -> Result<(), JournalError>,
) -> Result<(), JournalError> {
    for value in values {
        emit(b, value)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Frame payloads
// ---------------------------------------------------------------------------

/// `"states":[{"id":..,"val":..},...]` for persisted states holding values.
pub fn write_states(b: &mut JsonBuilder, states: &[Property]) -> Result<(), JournalError> {
    b.key("states")?;
    b.begin_array()?;
    for state in states.iter().filter(|s| s.persist && s.count() > 0) {
        write_update(b, state)?;
    }
    b.end_array()
}

/// `"echoes":[[channel, distance, amplitude, flag],...]` with distance and
/// amplitude divided by their scales.
pub fn write_echoes(b: &mut JsonBuilder, snapshot: &EchoSnapshot) -> Result<(), JournalError> {
    b.key("echoes")?;
    b.begin_array()?;
    for echo in &snapshot.echoes {
        b.begin_array()?;
        b.u64(echo.channel_index.into())?;
        b.f64(f64::from(echo.distance) / snapshot.distance_scale)?;
        b.f64(f64::from(echo.amplitude) / snapshot.amplitude_scale)?;
        b.u64(echo.flag.into())?;
        b.end_array()?;
    }
    b.end_array()
}
