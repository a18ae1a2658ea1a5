//! Irrigation: moisture-triggered pump runs with a fixed maximum duration
//! followed by a soak period.
//!
//! ```text
//! Idle ──[moisture < target]──▶ Running ──[pump_duration elapsed]──▶ Cooldown
//!  ▲                                                                    │
//!  └───────────────────────────[soak elapsed]─────────────────────────────┘
//! ```
//!
//! A pump switched on from outside (manually, or by another automation) is
//! adopted as a run and capped the same way.

use anyhow::Result;
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use crate::control::ControllerState;
use crate::gateway::{Action, ActuatorCommand, ActuatorGateway, SensorGateway};
use crate::options::Settings;

/// Minimum idle time after a run before moisture is re-evaluated.
pub const SOAK_SEC: i64 = 900;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum WaterStatus {
    Idle,
    Running {
        #[serde(with = "time::serde::rfc3339")]
        since: OffsetDateTime,
    },
    Cooldown {
        #[serde(with = "time::serde::rfc3339")]
        until: OffsetDateTime,
    },
}

/// Where the irrigation state machine stands at `now`.
pub fn status(state: &ControllerState, now: OffsetDateTime) -> WaterStatus {
    if let Some(since) = state.pump_started_at {
        return WaterStatus::Running { since };
    }
    let until = state.last_pump_stopped_at + Duration::seconds(SOAK_SEC);
    if now < until {
        WaterStatus::Cooldown { until }
    } else {
        WaterStatus::Idle
    }
}

pub fn evaluate(
    state: &mut ControllerState,
    settings: &Settings,
    sensors: &dyn SensorGateway,
    actuators: &mut dyn ActuatorGateway,
    now: OffsetDateTime,
) -> Result<()> {
    let Some(pump) = settings.pump_entity.as_deref() else {
        return Ok(());
    };
    let Some(reading) = sensors.read(pump) else {
        debug!(entity = pump, "water: pump unavailable, skipping");
        return Ok(());
    };

    if reading.is_on() {
        let started = *state.pump_started_at.get_or_insert(now);
        let elapsed = (now - started).as_seconds_f64();
        if elapsed >= settings.pump_duration {
            info!(entity = pump, elapsed, "water: run complete, pump OFF");
            actuators.command(ActuatorCommand::new(pump, Action::Off))?;
            state.last_pump_stopped_at = now;
            state.pump_started_at = None;
        }
        return Ok(());
    }

    state.pump_started_at = None;

    let off_for = (now - state.last_pump_stopped_at).whole_seconds();
    if off_for < SOAK_SEC {
        return Ok(());
    }

    let Some(sensor) = settings.moisture_sensor.as_deref() else {
        return Ok(());
    };
    let Some(moisture) = sensors.read(sensor).and_then(|r| r.numeric()) else {
        debug!(entity = sensor, "water: moisture unavailable, skipping");
        return Ok(());
    };

    if moisture < settings.target_moisture {
        info!(
            entity = pump,
            moisture,
            target = settings.target_moisture,
            "water: moisture low, pump ON"
        );
        actuators.command(ActuatorCommand::new(pump, Action::On))?;
        state.pump_started_at = Some(now);
    }

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
