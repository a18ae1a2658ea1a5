use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::control::{BoxSnapshot, Subsystem};
use crate::gateway::{ActuatorCommand, EntityState};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Read-side copy of the hub for the HTTP API.  The runner owns the real
/// controller state and republishes snapshots here after every job.
pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub boxes: BTreeMap<String, BoxSnapshot>,
    pub entities: HashMap<String, EntityState>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub box_id: Option<String>,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Actuator,
    Operator,
    Fault,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub boxes: Vec<BoxSnapshot>,
    pub entities: HashMap<String, EntityState>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            boxes: BTreeMap::new(),
            entities: HashMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record an actuator command a controller issued.
    pub fn record_command(&mut self, box_id: &str, cmd: &ActuatorCommand) {
        self.push_event(
            EventKind::Actuator,
            Some(box_id),
            format!("{} set {}", cmd.entity, cmd.action),
        );
    }

    /// Record a subsystem failure during a tick.
    pub fn record_fault(&mut self, box_id: &str, subsystem: Subsystem, error: &anyhow::Error) {
        self.push_event(
            EventKind::Fault,
            Some(box_id),
            format!("{subsystem}: {error:#}"),
        );
    }

    /// Record an operator action (phase, master switch, options, pump).
    pub fn record_operator(&mut self, box_id: &str, detail: String) {
        self.push_event(EventKind::Operator, Some(box_id), detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, None, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, None, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            boxes: self.boxes.values().cloned().collect(),
            entities: self.entities.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, box_id: Option<&str>, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            box_id: box_id.map(str::to_string),
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Action;

    #[test]
    fn events_are_capped() {
        let mut st = SystemState::new();
        for i in 0..(MAX_EVENTS + 25) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "event 25");
    }

    #[test]
    fn status_lists_newest_event_first() {
        let mut st = SystemState::new();
        st.record_system("first".into());
        st.record_command("tent-1", &ActuatorCommand::new("switch.fan", Action::On));
        let status = st.to_status();
        assert_eq!(status.events[0].detail, "switch.fan set ON");
        assert_eq!(status.events[0].box_id.as_deref(), Some("tent-1"));
        assert_eq!(status.events[1].detail, "first");
    }

    #[test]
    fn fault_event_names_subsystem() {
        let mut st = SystemState::new();
        st.record_fault("tent-1", Subsystem::Water, &anyhow::anyhow!("queue full"));
        let ev = st.events.back().unwrap();
        assert_eq!(ev.kind, EventKind::Fault);
        assert_eq!(ev.detail, "water: queue full");
    }
}
