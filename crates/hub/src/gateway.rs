//! Narrow collaborator interfaces between the controllers and the outside
//! world, plus the in-memory entity registry that backs sensor reads.
//!
//! Controllers never talk to MQTT directly.  They read entity state through
//! [`SensorGateway`] and issue binary commands through [`ActuatorGateway`];
//! the runner wires both to the registry and the MQTT client.

use std::collections::HashMap;
use std::fmt;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use time::OffsetDateTime;

use crate::mqtt::command_topic;

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

/// An available entity reading.  Unavailable entities are never represented
/// as a `Reading`; the gateway returns `None` instead.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub state: String,
    pub last_changed: OffsetDateTime,
}

impl Reading {
    pub fn is_on(&self) -> bool {
        self.state.eq_ignore_ascii_case("on")
    }

    /// Numeric value of a sensor state, `None` for non-numeric states.
    pub fn numeric(&self) -> Option<f64> {
        self.state
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    On,
    Off,
}

impl Action {
    pub fn payload(self) -> &'static [u8] {
        match self {
            Action::On => b"ON",
            Action::Off => b"OFF",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::On => write!(f, "ON"),
            Action::Off => write!(f, "OFF"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActuatorCommand {
    pub entity: String,
    pub action: Action,
}

impl ActuatorCommand {
    pub fn new(entity: &str, action: Action) -> Self {
        Self {
            entity: entity.to_string(),
            action,
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway traits
// ---------------------------------------------------------------------------

pub trait SensorGateway {
    /// Current state of `entity`, or `None` when the entity is unknown,
    /// offline, or reporting `unknown`/`unavailable`.
    fn read(&self, entity: &str) -> Option<Reading>;
}

pub trait ActuatorGateway {
    /// Fire-and-forget on/off command.  Duplicates are harmless.
    fn command(&mut self, cmd: ActuatorCommand) -> Result<()>;
}

/// Records every command that passes through to the wrapped gateway so the
/// runner can persist and report what a tick actually sent.
pub struct Journal<'a> {
    inner: &'a mut dyn ActuatorGateway,
    pub sent: Vec<ActuatorCommand>,
}

impl<'a> Journal<'a> {
    pub fn new(inner: &'a mut dyn ActuatorGateway) -> Self {
        Self {
            inner,
            sent: Vec::new(),
        }
    }
}

impl ActuatorGateway for Journal<'_> {
    fn command(&mut self, cmd: ActuatorCommand) -> Result<()> {
        self.inner.command(cmd.clone())?;
        self.sent.push(cmd);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Entity registry (SensorGateway backed by MQTT state topics)
// ---------------------------------------------------------------------------

const UNAVAILABLE: &str = "unavailable";

#[derive(Debug, Clone, Serialize)]
pub struct EntityState {
    pub state: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_changed: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

#[derive(Debug, Default)]
pub struct EntityRegistry {
    entities: HashMap<String, EntityState>,
}

fn is_absent(state: &str) -> bool {
    state.eq_ignore_ascii_case("unavailable") || state.eq_ignore_ascii_case("unknown")
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observed state.  `last_changed` only moves when the state
    /// string actually differs from the previous observation.
    pub fn observe(&mut self, entity: &str, state: &str, now: OffsetDateTime) {
        let state = state.trim();
        match self.entities.get_mut(entity) {
            Some(e) => {
                if e.state != state {
                    e.state = state.to_string();
                    e.last_changed = now;
                }
                e.last_seen = now;
            }
            None => {
                self.entities.insert(
                    entity.to_string(),
                    EntityState {
                        state: state.to_string(),
                        last_changed: now,
                        last_seen: now,
                    },
                );
            }
        }
    }

    /// Mark every known entity unavailable (used when the broker link drops).
    pub fn mark_all_unavailable(&mut self, now: OffsetDateTime) {
        let keys: Vec<String> = self.entities.keys().cloned().collect();
        for k in keys {
            self.observe(&k, UNAVAILABLE, now);
        }
    }

    pub fn get(&self, entity: &str) -> Option<&EntityState> {
        self.entities.get(entity)
    }

    pub fn snapshot(&self) -> HashMap<String, EntityState> {
        self.entities.clone()
    }
}

impl SensorGateway for EntityRegistry {
    fn read(&self, entity: &str) -> Option<Reading> {
        let e = self.entities.get(entity)?;
        if is_absent(&e.state) {
            return None;
        }
        Some(Reading {
            state: e.state.clone(),
            last_changed: e.last_changed,
        })
    }
}

// ---------------------------------------------------------------------------
// MQTT actuators
// ---------------------------------------------------------------------------

/// Publishes `ON`/`OFF` to `cmd/<entity>/set`.  Uses the client's
/// non-blocking queue so a slow broker never stalls a tick.
pub struct MqttActuators {
    client: AsyncClient,
}

impl MqttActuators {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

impl ActuatorGateway for MqttActuators {
    fn command(&mut self, cmd: ActuatorCommand) -> Result<()> {
        self.client
            .try_publish(
                command_topic(&cmd.entity),
                QoS::AtLeastOnce,
                false,
                cmd.action.payload().to_vec(),
            )
            .with_context(|| format!("failed to queue {} for {}", cmd.action, cmd.entity))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
