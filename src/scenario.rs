use std::path::Path;
use std::time::Duration;

use ljr_common::{EchoSet, PropertyId, SessionInfo, Timestamp};
use ljr_journal::{Recorder, RecorderConfig};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::sensor::{echo_rows, SimulatedSensor};

#[derive(Deserialize)]
pub struct Scenario {
    pub meta: ScenarioMeta,
    #[serde(default)]
    pub recorder: RecorderConfig,
    pub device: SessionInfo,
    #[serde(default)]
    pub properties: Vec<PropertySpec>,
    pub steps: Vec<ScenarioStep>,
}

#[derive(Deserialize)]
pub struct ScenarioMeta {
    pub name: String,
    pub description: Option<String>,
}

/// One property of the simulated sensor.
#[derive(Clone, Debug, Deserialize)]
pub struct PropertySpec {
    pub id: PropertyId,
    pub kind: String,
    #[serde(default = "default_persist")]
    pub persist: bool,
    /// Belongs to the periodic states feed rather than the configuration.
    #[serde(default)]
    pub state: bool,
    #[serde(default)]
    pub signed: bool,
    #[serde(default)]
    pub values: Vec<toml::Value>,
    pub limits: Option<Vec<toml::Value>>,
    #[serde(default)]
    pub labels: Vec<(String, u64)>,
}

fn default_persist() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize)]
pub struct StateUpdate {
    pub id: PropertyId,
    pub values: Vec<toml::Value>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "op")]
pub enum ScenarioStep {
    #[serde(rename = "states")]
    States {
        ts: Timestamp,
        #[serde(default)]
        values: Vec<StateUpdate>,
    },
    #[serde(rename = "echoes")]
    Echoes {
        ts: Timestamp,
        #[serde(default = "unit_scale")]
        distance_scale: f64,
        #[serde(default = "unit_scale")]
        amplitude_scale: f64,
        #[serde(default)]
        echoes: Vec<[i64; 4]>,
    },
    #[serde(rename = "set")]
    Set {
        id: PropertyId,
        values: Vec<toml::Value>,
    },
    #[serde(rename = "sleep_ms")]
    SleepMs { value: u64 },
    #[serde(rename = "repeat")]
    Repeat {
        count: u64,
        steps: Vec<ScenarioStep>,
    },
}

fn unit_scale() -> f64 {
    1.0
}

pub fn load(path: &Path) -> anyhow::Result<Scenario> {
    let toml_content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&toml_content)?)
}

/// Record a scenario from the CLI.
pub async fn run_record_cli(scenario_path: &str, out: Option<&str>) -> anyhow::Result<()> {
    let scenario = load(Path::new(scenario_path))?;

    println!("=== Scenario: {} ===", scenario.meta.name);
    if let Some(ref desc) = scenario.meta.description {
        println!("{desc}");
    }

    let mut sensor = SimulatedSensor::from_specs(&scenario.properties)?;
    let mut recorder = Recorder::new(scenario.recorder.clone());
    let path = recorder.start(out.map(Path::new), &scenario.device, &sensor.registry)?;
    println!("Recording to: {}", path.display());

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted, ending session");
                cancel.cancel();
            }
        })
    };

    let (step_tx, mut step_rx) = mpsc::unbounded_channel::<ScenarioStep>();
    let feed = tokio::spawn(feed_steps(scenario.steps, step_tx, cancel.clone()));

    let mut applied = 0usize;
    let outcome = loop {
        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            step = step_rx.recv() => step,
        };
        let Some(step) = step else {
            break Ok(());
        };
        if let Err(e) = apply_step(&mut sensor, &mut recorder, step) {
            break Err(e);
        }
        applied += 1;
    };

    cancel.cancel();
    let _ = feed.await;
    ctrl_c.abort();

    let stopped = recorder.stop();
    outcome?;
    stopped?;

    println!("Applied {applied} steps.");
    println!("\nScenario complete.");
    Ok(())
}

/// Replay `steps` into the channel, honouring sleeps, until done or cancelled.
async fn feed_steps(
    steps: Vec<ScenarioStep>,
    tx: mpsc::UnboundedSender<ScenarioStep>,
    cancel: CancellationToken,
) {
    let mut pending: Vec<ScenarioStep> = steps.into_iter().rev().collect();
    while let Some(step) = pending.pop() {
        if cancel.is_cancelled() {
            return;
        }
        match step {
            ScenarioStep::SleepMs { value } => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(value)) => {}
                }
            }
            ScenarioStep::Repeat { count, steps } => {
                for _ in 0..count {
                    pending.extend(steps.iter().rev().cloned());
                }
            }
            step => {
                if tx.send(step).is_err() {
                    return;
                }
            }
        }
    }
}

pub fn apply_step(
    sensor: &mut SimulatedSensor,
    recorder: &mut Recorder,
    step: ScenarioStep,
) -> anyhow::Result<()> {
    match step {
        ScenarioStep::States { ts, values } => {
            debug!(ts, count = values.len(), "states");
            sensor.update_states(ts, &values, recorder)
        }
        ScenarioStep::Echoes {
            ts,
            distance_scale,
            amplitude_scale,
            echoes,
        } => {
            debug!(ts, count = echoes.len(), "echoes");
            let set = EchoSet {
                timestamp: ts,
                echoes: echo_rows(&echoes)?,
                distance_scale,
                amplitude_scale,
            };
            sensor.update_echoes(set, recorder)
        }
        ScenarioStep::Set { id, values } => {
            debug!(id, "set");
            sensor.set_property(id, &values, recorder)
        }
        // Handled by the feeder.
        ScenarioStep::SleepMs { .. } | ScenarioStep::Repeat { .. } => Ok(()),
    }
}
