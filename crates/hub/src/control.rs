//! One grow box: its owned controller state, resolved settings, and the
//! fault-isolated control tick.
//!
//! Each tick runs lighting, climate and irrigation in that order.  A
//! subsystem that returns an error is logged and reported as a
//! [`ControllerFault`]; the remaining subsystems still run.

use std::fmt;

use anyhow::Result;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{error, info, info_span, warn};

use crate::gateway::{ActuatorGateway, SensorGateway};
use crate::options::{Options, RawOptions, Settings};
use crate::phase::{GrowPhase, PhaseClock};
use crate::water::{self, WaterStatus};
use crate::{climate, light};

// ---------------------------------------------------------------------------
// Controller state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerState {
    pub phase: PhaseClock,
    pub master_enabled: bool,
    /// Last computed vapour-pressure deficit, kPa.
    pub vpd: f64,
    /// Set while the pump is believed on.
    pub pump_started_at: Option<OffsetDateTime>,
    pub last_pump_stopped_at: OffsetDateTime,
}

impl ControllerState {
    pub fn new(phase: PhaseClock, last_pump_stopped_at: OffsetDateTime) -> Self {
        Self {
            phase,
            master_enabled: true,
            vpd: 0.0,
            pump_started_at: None,
            last_pump_stopped_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Subsystems
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Subsystem {
    Light,
    Climate,
    Water,
}

impl Subsystem {
    /// Evaluation order within a tick.
    pub const ORDER: [Subsystem; 3] = [Subsystem::Light, Subsystem::Climate, Subsystem::Water];

    fn evaluate(
        self,
        state: &mut ControllerState,
        settings: &Settings,
        sensors: &dyn SensorGateway,
        actuators: &mut dyn ActuatorGateway,
        now: OffsetDateTime,
    ) -> Result<()> {
        match self {
            Subsystem::Light => light::evaluate(state, settings, sensors, actuators, now),
            Subsystem::Climate => climate::evaluate(state, settings, sensors, actuators, now),
            Subsystem::Water => water::evaluate(state, settings, sensors, actuators, now),
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subsystem::Light => write!(f, "light"),
            Subsystem::Climate => write!(f, "climate"),
            Subsystem::Water => write!(f, "water"),
        }
    }
}

#[derive(Debug)]
pub struct ControllerFault {
    pub subsystem: Subsystem,
    pub error: anyhow::Error,
}

// ---------------------------------------------------------------------------
// Grow box
// ---------------------------------------------------------------------------

/// Read-only view of a box for the API and status page.
#[derive(Debug, Clone, Serialize)]
pub struct BoxSnapshot {
    pub box_id: String,
    pub name: String,
    pub phase: GrowPhase,
    pub phase_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub phase_started_at: OffsetDateTime,
    pub days_in_phase: i64,
    pub master_enabled: bool,
    pub vpd: f64,
    pub water: WaterStatus,
    pub settings: Settings,
    /// Merged raw options; served by the config endpoint only.
    #[serde(skip)]
    pub options: RawOptions,
}

pub struct GrowBox {
    pub box_id: String,
    pub name: String,
    options: Options,
    settings: Settings,
    state: ControllerState,
}

impl GrowBox {
    pub fn new(box_id: &str, name: &str, options: Options, state: ControllerState) -> Self {
        let settings = {
            let _span = info_span!("box", box_id).entered();
            Settings::resolve(&options)
        };
        Self {
            box_id: box_id.to_string(),
            name: name.to_string(),
            options,
            settings,
            state,
        }
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Run one control cycle.  Does nothing while the master switch is off.
    pub fn tick(
        &mut self,
        sensors: &dyn SensorGateway,
        actuators: &mut dyn ActuatorGateway,
        now: OffsetDateTime,
    ) -> Vec<ControllerFault> {
        if !self.state.master_enabled {
            return Vec::new();
        }

        let _span = info_span!("box", box_id = %self.box_id).entered();
        let mut faults = Vec::new();
        for subsystem in Subsystem::ORDER {
            if let Err(e) = subsystem.evaluate(&mut self.state, &self.settings, sensors, actuators, now)
            {
                error!(controller = %subsystem, "control error: {e:#}");
                faults.push(ControllerFault {
                    subsystem,
                    error: e,
                });
            }
        }
        faults
    }

    /// Resolve a phase name against this box's custom phase names.
    pub fn parse_phase(&self, name: &str) -> Option<GrowPhase> {
        GrowPhase::parse(name, &self.settings)
    }

    pub fn set_phase(
        &mut self,
        phase: GrowPhase,
        started_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) {
        self.state.phase.set_phase(phase, started_at, now);
        info!(
            box_id = %self.box_id,
            %phase,
            started_at = %self.state.phase.started_at,
            "phase set"
        );
    }

    pub fn set_master(&mut self, enabled: bool) {
        self.state.master_enabled = enabled;
        info!(box_id = %self.box_id, enabled, "master switch set");
    }

    /// Merge option updates and re-resolve the effective settings.
    pub fn update_options(&mut self, update: &RawOptions) {
        self.options.merge(update);
        let _span = info_span!("box", box_id = %self.box_id).entered();
        self.settings = Settings::resolve(&self.options);
        if self.state.pump_started_at.is_some() && self.settings.pump_entity.is_none() {
            warn!("pump entity removed while a run was tracked; clearing");
            self.state.pump_started_at = None;
        }
    }

    pub fn snapshot(&self, now: OffsetDateTime) -> BoxSnapshot {
        BoxSnapshot {
            box_id: self.box_id.clone(),
            name: self.name.clone(),
            phase: self.state.phase.phase,
            phase_name: self.state.phase.phase.display_name(&self.settings),
            phase_started_at: self.state.phase.started_at,
            days_in_phase: self.state.phase.days_in_phase(now),
            master_enabled: self.state.master_enabled,
            vpd: (self.state.vpd * 100.0).round() / 100.0,
            water: water::status(&self.state, now),
            settings: self.settings.clone(),
            options: self.options.raw().clone(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::tests::{FakeActuators, FakeSensors};
    use crate::gateway::{Action, ActuatorCommand, EntityRegistry};
    use crate::options::*;
    use serde_json::json;
    use time::macros::datetime;
    use time::Duration;

    const NOW: OffsetDateTime = datetime!(2024-06-02 20:00 UTC);

    fn full_options() -> Options {
        let raw = [
            (LIGHT_ENTITY, "switch.light"),
            (FAN_ENTITY, "switch.fan"),
            (PUMP_ENTITY, "switch.pump"),
            (MOISTURE_SENSOR, "sensor.soil"),
            (TEMP_SENSOR, "sensor.temp"),
            (HUMIDITY_SENSOR, "sensor.rh"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect();
        Options::new(raw)
    }

    fn rested_box() -> GrowBox {
        let state = ControllerState::new(
            PhaseClock::new(GrowPhase::Vegetative, NOW - Duration::days(3)),
            NOW - Duration::hours(1),
        );
        GrowBox::new("tent-1", "Tent 1", full_options(), state)
    }

    /// Every actuator in the wrong state, soil dry, climate hot.
    fn demanding_sensors() -> FakeSensors {
        let long_ago = NOW - Duration::hours(2);
        let mut s = FakeSensors::default();
        s.set("switch.light", "off", long_ago);
        s.set("switch.fan", "off", long_ago);
        s.set("switch.pump", "off", long_ago);
        s.set("sensor.soil", "20", long_ago);
        s.set("sensor.temp", "27", long_ago);
        s.set("sensor.rh", "55", long_ago);
        s
    }

    #[test]
    fn tick_runs_all_subsystems_in_order() {
        let mut gb = rested_box();
        let mut actuators = FakeActuators::default();
        let faults = gb.tick(&demanding_sensors(), &mut actuators, NOW);
        assert!(faults.is_empty());
        assert_eq!(
            actuators.sent,
            vec![
                ActuatorCommand::new("switch.light", Action::On),
                ActuatorCommand::new("switch.fan", Action::On),
                ActuatorCommand::new("switch.pump", Action::On),
            ]
        );
    }

    #[test]
    fn master_off_sends_nothing() {
        let mut gb = rested_box();
        gb.set_master(false);
        let mut actuators = FakeActuators::default();
        let faults = gb.tick(&demanding_sensors(), &mut actuators, NOW);
        assert!(faults.is_empty());
        assert!(actuators.sent.is_empty());
        assert_eq!(gb.state().vpd, 0.0);
    }

    /// Fails commands for one entity only.
    struct FailFor {
        entity: &'static str,
        sent: Vec<ActuatorCommand>,
    }

    impl ActuatorGateway for FailFor {
        fn command(&mut self, cmd: ActuatorCommand) -> Result<()> {
            if cmd.entity == self.entity {
                anyhow::bail!("publish failed");
            }
            self.sent.push(cmd);
            Ok(())
        }
    }

    #[test]
    fn fault_in_one_subsystem_does_not_stop_others() {
        let mut gb = rested_box();
        let mut actuators = FailFor {
            entity: "switch.light",
            sent: Vec::new(),
        };
        let faults = gb.tick(&demanding_sensors(), &mut actuators, NOW);
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].subsystem, Subsystem::Light);
        assert_eq!(
            actuators.sent,
            vec![
                ActuatorCommand::new("switch.fan", Action::On),
                ActuatorCommand::new("switch.pump", Action::On),
            ]
        );
    }

    #[test]
    fn repeated_ticks_settle_to_zero_commands() {
        let mut gb = rested_box();
        let mut reg = EntityRegistry::new();
        let start = NOW - Duration::hours(2);
        for (e, v) in [
            ("switch.light", "off"),
            ("switch.fan", "off"),
            ("switch.pump", "off"),
            ("sensor.soil", "55"),
            ("sensor.temp", "27"),
            ("sensor.rh", "55"),
        ] {
            reg.observe(e, v, start);
        }

        // First tick settles; a device would echo the new states.
        let mut actuators = FakeActuators::default();
        gb.tick(&reg, &mut actuators, NOW);
        assert_eq!(actuators.sent.len(), 2);
        for cmd in &actuators.sent {
            let state = if cmd.action == Action::On { "on" } else { "off" };
            reg.observe(&cmd.entity, state, NOW + Duration::seconds(1));
        }

        for i in 1..=20 {
            let mut actuators = FakeActuators::default();
            gb.tick(&reg, &mut actuators, NOW + Duration::seconds(5 * i));
            assert!(actuators.sent.is_empty(), "tick {i} sent {:?}", actuators.sent);
        }
    }

    #[test]
    fn update_options_reresolves_settings() {
        let mut gb = rested_box();
        let update = [(TARGET_TEMP.to_string(), json!(21.5))].into_iter().collect();
        gb.update_options(&update);
        assert_eq!(gb.settings().target_temp, 21.5);
        assert_eq!(gb.options().raw()[TARGET_TEMP], json!(21.5));
    }

    #[test]
    fn update_options_clearing_pump_drops_tracked_run() {
        let mut gb = rested_box();
        gb.state.pump_started_at = Some(NOW);
        let update = [(PUMP_ENTITY.to_string(), json!(""))].into_iter().collect();
        gb.update_options(&update);
        assert!(gb.settings().pump_entity.is_none());
        assert!(gb.state().pump_started_at.is_none());
    }

    #[test]
    fn snapshot_rounds_vpd_and_counts_days() {
        let mut gb = rested_box();
        gb.state.vpd = 1.23456;
        let snap = gb.snapshot(NOW);
        assert_eq!(snap.vpd, 1.23);
        assert_eq!(snap.days_in_phase, 3);
        assert_eq!(snap.phase_name, "vegetative");
        assert_eq!(snap.water, WaterStatus::Idle);
    }

    #[test]
    fn parse_phase_uses_custom_names() {
        let mut gb = rested_box();
        let update = [(CUSTOM_PHASE_NAMES[0].to_string(), json!("Flush"))]
            .into_iter()
            .collect();
        gb.update_options(&update);
        assert_eq!(gb.parse_phase("Flush"), Some(GrowPhase::Custom1));
        assert_eq!(gb.parse_phase("nope"), None);
    }
}
