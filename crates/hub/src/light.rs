//! Lighting: keeps the light on for the current phase's daily hour budget,
//! starting at the configured hour (local time).  Windows may cross
//! midnight.
//!
//! A recent state change on the light is treated as a manual action and
//! left alone.  The grace period is asymmetric: 10 s before the controller
//! will switch a light back on, 15 min before it will switch one back off.

use anyhow::Result;
use time::{Duration, OffsetDateTime, Time};
use tracing::{debug, info};

use crate::control::ControllerState;
use crate::gateway::{Action, ActuatorCommand, ActuatorGateway, SensorGateway};
use crate::options::{PhaseHours, Settings};
use crate::phase::GrowPhase;

/// Grace period after a manual change before forcing the light ON.
const ON_OVERRIDE_SEC: f64 = 10.0;
/// Grace period after a manual change before forcing the light OFF.
const OFF_OVERRIDE_SEC: f64 = 900.0;

/// Used for a custom slot that has no display name configured.
const FALLBACK_HOURS: f64 = 12.0;

/// Daily light budget for `phase`.
pub fn light_hours(phase: GrowPhase, settings: &Settings) -> f64 {
    let hours = &settings.phase_hours;
    match phase {
        GrowPhase::Seedling => hours.seedling,
        GrowPhase::Vegetative => hours.vegetative,
        GrowPhase::Flowering => hours.flowering,
        GrowPhase::Drying => hours.drying,
        GrowPhase::Curing => hours.curing,
        GrowPhase::Custom1 | GrowPhase::Custom2 | GrowPhase::Custom3 => phase
            .custom_slot()
            .map(|i| &settings.custom_phases[i])
            .filter(|c| c.name.is_some())
            .map(|c| c.hours)
            .unwrap_or_else(|| default_hours(phase)),
    }
}

fn default_hours(phase: GrowPhase) -> f64 {
    let table = PhaseHours::default();
    match phase {
        GrowPhase::Seedling => table.seedling,
        GrowPhase::Vegetative => table.vegetative,
        GrowPhase::Flowering => table.flowering,
        GrowPhase::Drying => table.drying,
        GrowPhase::Curing => table.curing,
        _ => FALLBACK_HOURS,
    }
}

/// Start of the lighting window containing (or most recently preceding)
/// `now`.  Before `start_hour` the window began on the previous day.
pub fn window_start(now: OffsetDateTime, start_hour: u8) -> OffsetDateTime {
    let today = now.replace_time(Time::MIDNIGHT) + Duration::hours(i64::from(start_hour));
    if now.hour() < start_hour {
        today - Duration::days(1)
    } else {
        today
    }
}

pub fn is_light_time(now: OffsetDateTime, start_hour: u8, hours: f64) -> bool {
    let elapsed = (now - window_start(now, start_hour)).as_seconds_f64();
    (0.0..hours * 3600.0).contains(&elapsed)
}

pub fn evaluate(
    state: &ControllerState,
    settings: &Settings,
    sensors: &dyn SensorGateway,
    actuators: &mut dyn ActuatorGateway,
    now: OffsetDateTime,
) -> Result<()> {
    let Some(light) = settings.light_entity.as_deref() else {
        return Ok(());
    };

    let phase = state.phase.phase;
    let hours = light_hours(phase, settings);
    let start_hour = settings.light_start_hour;
    let light_time = is_light_time(now, start_hour, hours);

    debug!(
        %phase,
        hours,
        start_hour,
        now = %now.time(),
        light_time,
        "light: evaluated window"
    );

    let Some(reading) = sensors.read(light) else {
        debug!(entity = light, "light: unavailable, skipping");
        return Ok(());
    };

    let is_on = reading.is_on();
    let since_change = (now - reading.last_changed).as_seconds_f64();

    if light_time && !is_on {
        if since_change < ON_OVERRIDE_SEC {
            info!(entity = light, since_change, "light: manual override, not forcing ON");
            return Ok(());
        }
        info!(entity = light, "light: inside window, turning ON");
        actuators.command(ActuatorCommand::new(light, Action::On))?;
    } else if !light_time && is_on {
        if since_change < OFF_OVERRIDE_SEC {
            info!(entity = light, since_change, "light: manual override, not forcing OFF");
            return Ok(());
        }
        info!(entity = light, "light: outside window, turning OFF");
        actuators.command(ActuatorCommand::new(light, Action::Off))?;
    }

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
