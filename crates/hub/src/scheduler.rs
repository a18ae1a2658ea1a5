//! Serialized execution of everything that touches controller state.
//!
//! Periodic ticks, on-demand ticks, entity observations from MQTT and
//! operator commands from the HTTP API are all funnelled through one
//! bounded queue into a single runner task, so no two ticks ever race and
//! no reader sees a half-updated box.
//!
//! ```text
//!  interval ──┐
//!  trigger ───┤                 ┌──▶ GrowBox::tick ──▶ ActuatorGateway
//!  mqtt ──────┼──▶ mpsc ──▶ Runner
//!  http ──────┘                 └──▶ SharedState (snapshots for the API)
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use anyhow::anyhow;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::validate_options;
use crate::control::{BoxSnapshot, ControllerFault, GrowBox};
use crate::db::Db;
use crate::gateway::{Action, ActuatorCommand, ActuatorGateway, EntityRegistry, Journal};
use crate::options::{RawOptions, Settings};
use crate::phase::GrowPhase;
use crate::state::SharedState;
use crate::zone::LocalZone;

/// How often every box is evaluated.
pub const TICK_INTERVAL: Duration = Duration::from_secs(5);

const QUEUE_DEPTH: usize = 256;

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

pub enum Job {
    /// Evaluate one box, or every box when `None`.
    Tick { box_id: Option<String> },
    /// A device reported an entity state.
    Observe { entity: String, state: String },
    /// The broker link dropped; nothing we know is current any more.
    LinkDown,
    Operator {
        box_id: String,
        command: OperatorCommand,
        reply: oneshot::Sender<Result<BoxSnapshot, OperatorError>>,
    },
}

#[derive(Debug, Clone)]
pub enum OperatorCommand {
    Describe,
    SetPhase {
        phase: String,
        started_at: Option<OffsetDateTime>,
    },
    SetMaster(bool),
    UpdateOptions(RawOptions),
    Pump(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperatorError {
    UnknownBox(String),
    UnknownPhase(String),
    Invalid(String),
    NoPump,
    Actuator(String),
    Unavailable,
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorError::UnknownBox(id) => write!(f, "unknown box '{id}'"),
            OperatorError::UnknownPhase(p) => write!(f, "unknown phase '{p}'"),
            OperatorError::Invalid(msg) => write!(f, "{msg}"),
            OperatorError::NoPump => write!(f, "no pump entity configured"),
            OperatorError::Actuator(msg) => write!(f, "actuator command failed: {msg}"),
            OperatorError::Unavailable => write!(f, "controller is not running"),
        }
    }
}

impl std::error::Error for OperatorError {}

// ---------------------------------------------------------------------------
// Scheduler handle
// ---------------------------------------------------------------------------

/// Cloneable handle for enqueueing work onto the runner.
#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::Sender<Job>,
}

impl Scheduler {
    pub fn channel() -> (Self, mpsc::Receiver<Job>) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        (Self { tx }, rx)
    }

    /// Enqueue a full tick every `period`.  The first tick fires immediately.
    pub fn schedule_every(&self, period: Duration) -> JoinHandle<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(Job::Tick { box_id: None }).await.is_err() {
                    break;
                }
            }
        })
    }

    /// Enqueue an out-of-band tick without waiting.  Safe to call from the
    /// runner itself.
    pub fn trigger_now(&self, box_id: Option<&str>) {
        let job = Job::Tick {
            box_id: box_id.map(str::to_string),
        };
        if let Err(e) = self.tx.try_send(job) {
            warn!("scheduler: could not enqueue immediate tick: {e}");
        }
    }

    pub async fn submit(&self, job: Job) -> anyhow::Result<()> {
        self.tx
            .send(job)
            .await
            .map_err(|_| anyhow!("scheduler queue closed"))
    }

    /// Run an operator command on the runner and wait for its result.
    pub async fn operator(
        &self,
        box_id: &str,
        command: OperatorCommand,
    ) -> Result<BoxSnapshot, OperatorError> {
        let (reply, rx) = oneshot::channel();
        let job = Job::Operator {
            box_id: box_id.to_string(),
            command,
            reply,
        };
        self.tx
            .send(job)
            .await
            .map_err(|_| OperatorError::Unavailable)?;
        rx.await.map_err(|_| OperatorError::Unavailable)?
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Sole owner of every box's controller state and of the entity registry.
pub struct Runner {
    boxes: BTreeMap<String, GrowBox>,
    registry: EntityRegistry,
    actuators: Box<dyn ActuatorGateway + Send + Sync>,
    db: Db,
    shared: SharedState,
    scheduler: Scheduler,
    zone: LocalZone,
}

impl Runner {
    pub fn new(
        boxes: Vec<GrowBox>,
        actuators: Box<dyn ActuatorGateway + Send + Sync>,
        db: Db,
        shared: SharedState,
        scheduler: Scheduler,
        zone: LocalZone,
    ) -> Self {
        Self {
            boxes: boxes.into_iter().map(|b| (b.box_id.clone(), b)).collect(),
            registry: EntityRegistry::new(),
            actuators,
            db,
            shared,
            scheduler,
            zone,
        }
    }

    /// Local wall-clock time used for every decision.
    fn now(&self) -> OffsetDateTime {
        self.zone.now()
    }

    /// Process jobs until every sender is gone.  Intended to be
    /// `tokio::spawn`-ed from main.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Job>) {
        info!(
            boxes = self.boxes.len(),
            tick_sec = TICK_INTERVAL.as_secs(),
            "runner started"
        );
        self.publish_all().await;
        {
            let mut st = self.shared.write().await;
            st.record_system(format!("runner started ({} box(es))", self.boxes.len()));
        }

        while let Some(job) = rx.recv().await {
            match job {
                Job::Tick { box_id } => self.tick(box_id.as_deref()).await,
                Job::Observe { entity, state } => self.observe(&entity, &state).await,
                Job::LinkDown => self.link_down().await,
                Job::Operator {
                    box_id,
                    command,
                    reply,
                } => {
                    let result = self.operate(&box_id, command).await;
                    if let Err(e) = &result {
                        warn!(box_id = %box_id, "operator command rejected: {e}");
                    }
                    let _ = reply.send(result);
                }
            }
        }
        info!("runner stopped");
    }

    // ── Ticks ───────────────────────────────────────────────────────────

    async fn tick(&mut self, only: Option<&str>) {
        let now = self.now();

        // Evaluate synchronously; persistence happens afterwards.
        let mut outcomes: Vec<(String, Vec<ActuatorCommand>, Vec<ControllerFault>)> = Vec::new();
        for (id, gb) in self.boxes.iter_mut() {
            if only.is_some_and(|o| o != id.as_str()) {
                continue;
            }
            let mut journal = Journal::new(self.actuators.as_mut());
            let faults = gb.tick(&self.registry, &mut journal, now);
            outcomes.push((id.clone(), journal.sent, faults));
        }

        for (id, sent, _) in &outcomes {
            for cmd in sent {
                if let Err(e) = self.db.insert_command(now, id, cmd).await {
                    error!(box_id = %id, "db: insert_command failed: {e:#}");
                }
            }
        }

        {
            let mut st = self.shared.write().await;
            for (id, sent, faults) in &outcomes {
                for cmd in sent {
                    st.record_command(id, cmd);
                }
                for f in faults {
                    st.record_fault(id, f.subsystem, &f.error);
                }
            }
        }

        match only {
            Some(id) => self.publish(id, now).await,
            None => self.publish_all().await,
        }
    }

    // ── Entity observations ───────────────────────────────────────────

    async fn observe(&mut self, entity: &str, state: &str) {
        if !self.is_referenced(entity) {
            debug!(entity, "ignoring state for an entity no box uses");
            return;
        }
        let now = self.now();
        self.registry.observe(entity, state, now);
        if let Some(e) = self.registry.get(entity).cloned() {
            let mut st = self.shared.write().await;
            st.entities.insert(entity.to_string(), e);
        }
    }

    fn is_referenced(&self, entity: &str) -> bool {
        self.boxes
            .values()
            .any(|gb| gb.settings().entities().any(|e| e == entity))
    }

    async fn link_down(&mut self) {
        let now = self.now();
        self.registry.mark_all_unavailable(now);
        let mut st = self.shared.write().await;
        st.entities = self.registry.snapshot();
    }

    // ── Operator commands ─────────────────────────────────────────────

    async fn operate(
        &mut self,
        box_id: &str,
        command: OperatorCommand,
    ) -> Result<BoxSnapshot, OperatorError> {
        let now = self.now();
        let gb = self
            .boxes
            .get_mut(box_id)
            .ok_or_else(|| OperatorError::UnknownBox(box_id.to_string()))?;

        let (detail, retick) = match command {
            OperatorCommand::Describe => return Ok(gb.snapshot(now)),
            OperatorCommand::SetPhase { phase, started_at } => {
                let parsed = gb
                    .parse_phase(&phase)
                    .ok_or(OperatorError::UnknownPhase(phase))?;
                gb.set_phase(parsed, started_at, now);
                (format!("phase set to {parsed}"), true)
            }
            OperatorCommand::SetMaster(enabled) => {
                gb.set_master(enabled);
                (
                    format!("master switch {}", if enabled { "on" } else { "off" }),
                    true,
                )
            }
            OperatorCommand::UpdateOptions(update) => {
                let change = prepare_options_update(gb, update, &self.zone)?;
                gb.update_options(&change.options);
                if let Some(phase) = change.phase {
                    gb.set_phase(phase, change.started_at, now);
                }
                if let Err(e) = self.db.save_options(box_id, &change.options).await {
                    error!(box_id, "db: save_options failed: {e:#}");
                }
                (format!("options updated ({} key(s))", change.options.len()), true)
            }
            OperatorCommand::Pump(on) => {
                let Some(pump) = gb.settings().pump_entity.clone() else {
                    return Err(OperatorError::NoPump);
                };
                let cmd = ActuatorCommand::new(&pump, if on { Action::On } else { Action::Off });
                self.actuators
                    .command(cmd.clone())
                    .map_err(|e| OperatorError::Actuator(format!("{e:#}")))?;
                if let Err(e) = self.db.insert_command(now, box_id, &cmd).await {
                    error!(box_id, "db: insert_command failed: {e:#}");
                }
                self.shared.write().await.record_command(box_id, &cmd);
                (format!("manual pump {}", cmd.action), false)
            }
        };

        let snapshot = {
            let gb = self
                .boxes
                .get(box_id)
                .ok_or_else(|| OperatorError::UnknownBox(box_id.to_string()))?;
            let st = gb.state();
            if let Err(e) = self
                .db
                .save_box_state(box_id, st.phase.phase.key(), st.phase.started_at, st.master_enabled)
                .await
            {
                error!(box_id, "db: save_box_state failed: {e:#}");
            }
            gb.snapshot(now)
        };

        {
            let mut st = self.shared.write().await;
            st.record_operator(box_id, detail);
            st.boxes.insert(box_id.to_string(), snapshot.clone());
        }

        if retick {
            self.scheduler.trigger_now(Some(box_id));
        }
        Ok(snapshot)
    }

    // ── Snapshots ─────────────────────────────────────────────────────

    async fn publish(&self, box_id: &str, now: OffsetDateTime) {
        if let Some(gb) = self.boxes.get(box_id) {
            let mut st = self.shared.write().await;
            st.boxes.insert(box_id.to_string(), gb.snapshot(now));
        }
    }

    async fn publish_all(&self) {
        let now = self.now();
        let mut st = self.shared.write().await;
        for (id, gb) in &self.boxes {
            st.boxes.insert(id.clone(), gb.snapshot(now));
        }
    }
}

/// Validated, not yet applied, options update.
struct OptionsChange {
    options: RawOptions,
    phase: Option<GrowPhase>,
    started_at: Option<OffsetDateTime>,
}

/// Split `current_phase`/`phase_start_date` out of an options update and
/// validate everything against the options as they would be afterwards.
fn prepare_options_update(
    gb: &GrowBox,
    mut update: RawOptions,
    zone: &LocalZone,
) -> Result<OptionsChange, OperatorError> {
    let mut errors = Vec::new();
    validate_options(&update, &mut errors, "options");
    if !errors.is_empty() {
        return Err(OperatorError::Invalid(errors.join("; ")));
    }

    let phase_name = match update.remove("current_phase") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => {
            return Err(OperatorError::Invalid(format!(
                "current_phase must be a string, got {other}"
            )))
        }
    };
    let started_at = match update.remove("phase_start_date") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => None,
        Some(serde_json::Value::String(s)) => Some(
            zone.parse_timestamp(&s)
                .map_err(|e| OperatorError::Invalid(format!("phase_start_date: {e:#}")))?,
        ),
        Some(other) => {
            return Err(OperatorError::Invalid(format!(
                "phase_start_date must be an ISO 8601 string, got {other}"
            )))
        }
    };

    // Custom phase names may be renamed in the same update.
    let phase = match phase_name {
        Some(name) => {
            let mut next = gb.options().clone();
            next.merge(&update);
            let settings = Settings::resolve(&next);
            Some(
                GrowPhase::parse(&name, &settings)
                    .ok_or(OperatorError::UnknownPhase(name))?,
            )
        }
        None => None,
    };

    // A start date on its own re-anchors the current phase.
    let phase = phase.or_else(|| started_at.map(|_| gb.state().phase.phase));

    Ok(OptionsChange {
        options: update,
        phase,
        started_at,
    })
}

// ===========================================================================
// Tests
// ===========================================================================
