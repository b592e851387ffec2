use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use ljr_common::{
    Echo, EchoSet, IntegerValues, Property, PropertyId, PropertyKind, PropertySet, PropertyValue,
    SensorEvent, SharedEchoes, StateSnapshot, Timestamp,
};
use ljr_journal::Recorder;

use crate::scenario::{PropertySpec, StateUpdate};

/// In-memory stand-in for a connected sensor: configuration registry, latest
/// states and latest echoes.
pub struct SimulatedSensor {
    pub registry: PropertySet,
    pub states: StateSnapshot,
    pub echoes: Arc<SharedEchoes>,
}

impl SimulatedSensor {
    pub fn from_specs(specs: &[PropertySpec]) -> anyhow::Result<Self> {
        let mut registry = PropertySet::default();
        let mut states = PropertySet::default();
        for spec in specs {
            let property = build_property(spec)
                .with_context(|| format!("property {}", spec.id))?;
            if spec.state {
                states.insert(property);
            } else {
                registry.insert(property);
            }
        }
        Ok(Self {
            registry,
            states: StateSnapshot {
                timestamp: 0,
                states,
            },
            echoes: Arc::new(SharedEchoes::default()),
        })
    }

    /// Apply state values decoded at `ts` and notify the recorder.
    pub fn update_states(
        &mut self,
        ts: Timestamp,
        updates: &[StateUpdate],
        recorder: &mut Recorder,
    ) -> anyhow::Result<()> {
        for update in updates {
            let state = self
                .states
                .states
                .find_mut(update.id)
                .ok_or_else(|| anyhow!("unknown state {}", update.id))?;
            state.value = with_values(&state.value, &update.values)
                .with_context(|| format!("state {}", update.id))?;
        }
        self.states.timestamp = ts;
        recorder.record(SensorEvent::StatesUpdated(&self.states))?;
        Ok(())
    }

    /// Publish a new echo set and notify the recorder.
    pub fn update_echoes(
        &mut self,
        set: EchoSet,
        recorder: &mut Recorder,
    ) -> anyhow::Result<()> {
        self.echoes.publish(set)?;
        recorder.record(SensorEvent::EchoesUpdated(self.echoes.as_ref()))?;
        Ok(())
    }

    /// A configuration property was changed.
    pub fn set_property(
        &mut self,
        id: PropertyId,
        values: &[toml::Value],
        recorder: &mut Recorder,
    ) -> anyhow::Result<()> {
        let property = self
            .registry
            .find_mut(id)
            .ok_or_else(|| anyhow!("unknown property {id}"))?;
        property.value = with_values(&property.value, values)
            .with_context(|| format!("property {id}"))?;
        recorder.record(SensorEvent::PropertyChanged(property))?;
        Ok(())
    }
}

/// Scenario echo rows are `[channel, distance, amplitude, flag]`.
pub fn echo_rows(rows: &[[i64; 4]]) -> anyhow::Result<Vec<Echo>> {
    rows.iter()
        .map(|&[channel, distance, amplitude, flag]| -> anyhow::Result<Echo> {
            Ok(Echo {
                channel_index: u32::try_from(channel)?,
                distance: i32::try_from(distance)?,
                amplitude: u32::try_from(amplitude)?,
                flag: u16::try_from(flag)?,
            })
        })
        .collect()
}

fn build_property(spec: &PropertySpec) -> anyhow::Result<Property> {
    let kind: PropertyKind = spec.kind.parse()?;
    let template = match kind {
        PropertyKind::Bitfield => PropertyValue::Bitfield(Vec::new()),
        PropertyKind::Boolean => PropertyValue::Boolean(Vec::new()),
        PropertyKind::Enumerated => PropertyValue::Enumerated {
            values: Vec::new(),
            labels: spec.labels.clone(),
        },
        PropertyKind::Float => {
            let limits = match spec.limits.as_deref() {
                Some([min, max]) => (as_f64(min)?, as_f64(max)?),
                Some(_) => bail!("limits must have two entries"),
                None => (f64::MIN, f64::MAX),
            };
            PropertyValue::Float {
                values: Vec::new(),
                limits,
            }
        }
        PropertyKind::Integer => {
            let limits = spec.limits.as_deref();
            if spec.signed {
                let limits = match limits {
                    Some([min, max]) => (as_i64(min)?, as_i64(max)?),
                    Some(_) => bail!("limits must have two entries"),
                    None => (i64::MIN, i64::MAX),
                };
                PropertyValue::Integer(IntegerValues::Signed {
                    values: Vec::new(),
                    limits,
                })
            } else {
                let limits = match limits {
                    Some([min, max]) => (as_u64(min)?, as_u64(max)?),
                    Some(_) => bail!("limits must have two entries"),
                    None => (0, u64::MAX),
                };
                PropertyValue::Integer(IntegerValues::Unsigned {
                    values: Vec::new(),
                    limits,
                })
            }
        }
        PropertyKind::Text => PropertyValue::Text(Vec::new()),
        PropertyKind::Buffer => PropertyValue::Buffer(Vec::new()),
    };

    Ok(Property::new(
        spec.id,
        spec.persist,
        with_values(&template, &spec.values)?,
    ))
}

/// Same kind and metadata as `current`, holding `values`.
fn with_values(current: &PropertyValue, values: &[toml::Value]) -> anyhow::Result<PropertyValue> {
    Ok(match current {
        PropertyValue::Bitfield(_) => PropertyValue::Bitfield(convert(values, as_u64)?),
        PropertyValue::Boolean(_) => PropertyValue::Boolean(convert(values, |v| {
            v.as_bool().ok_or_else(|| anyhow!("expected a boolean, got {v}"))
        })?),
        PropertyValue::Enumerated { labels, .. } => PropertyValue::Enumerated {
            values: convert(values, |v| match v.as_str() {
                Some(label) => labels
                    .iter()
                    .find(|(l, _)| l == label)
                    .map(|(_, value)| *value)
                    .ok_or_else(|| anyhow!("unknown enum label {label}")),
                None => as_u64(v),
            })?,
            labels: labels.clone(),
        },
        PropertyValue::Float { limits, .. } => PropertyValue::Float {
            values: convert(values, as_f64)?,
            limits: *limits,
        },
        PropertyValue::Integer(IntegerValues::Signed { limits, .. }) => {
            PropertyValue::Integer(IntegerValues::Signed {
                values: convert(values, as_i64)?,
                limits: *limits,
            })
        }
        PropertyValue::Integer(IntegerValues::Unsigned { limits, .. }) => {
            PropertyValue::Integer(IntegerValues::Unsigned {
                values: convert(values, as_u64)?,
                limits: *limits,
            })
        }
        PropertyValue::Text(_) => PropertyValue::Text(convert(values, as_string)?),
        PropertyValue::Buffer(_) => PropertyValue::Buffer(convert(values, as_string)?),
    })
}

fn convert<T>(
    values: &[toml::Value],
    f: impl Fn(&toml::Value) -> anyhow::Result<T>,
) -> anyhow::Result<Vec<T>> {
    values.iter().map(f).collect()
}

fn as_f64(v: &toml::Value) -> anyhow::Result<f64> {
    match v {
        toml::Value::Float(f) => Ok(*f),
        toml::Value::Integer(i) => Ok(*i as f64),
        _ => bail!("expected a number, got {v}"),
    }
}

fn as_i64(v: &toml::Value) -> anyhow::Result<i64> {
    v.as_integer()
        .ok_or_else(|| anyhow!("expected an integer, got {v}"))
}

fn as_u64(v: &toml::Value) -> anyhow::Result<u64> {
    Ok(u64::try_from(as_i64(v)?)?)
}

fn as_string(v: &toml::Value) -> anyhow::Result<String> {
    v.as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("expected a string, got {v}"))
}
