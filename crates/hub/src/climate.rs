//! Climate: derives vapour-pressure deficit from temperature and relative
//! humidity, and drives the ventilation fan with a dead band.

use anyhow::Result;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::control::ControllerState;
use crate::gateway::{Action, ActuatorCommand, ActuatorGateway, SensorGateway};
use crate::options::Settings;

/// Below target by this much (°C) before the fan may switch off.
const TEMP_HYSTERESIS: f64 = 1.0;
/// Below the humidity ceiling by this much (%RH) before the fan may switch off.
const HUMIDITY_HYSTERESIS: f64 = 5.0;

/// Saturation vapour pressure in kPa (Tetens), `temp_c` in °C.
pub fn saturation_vapor_pressure(temp_c: f64) -> f64 {
    0.61078 * ((17.27 * temp_c) / (temp_c + 237.3)).exp()
}

/// Vapour-pressure deficit in kPa.
pub fn vpd(temp_c: f64, rh: f64) -> f64 {
    saturation_vapor_pressure(temp_c) * (1.0 - rh / 100.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanDecision {
    On,
    Off,
    Hold,
}

pub fn decide(temp_c: f64, rh: f64, target_temp: f64, max_humidity: f64) -> FanDecision {
    if temp_c > target_temp || rh > max_humidity {
        FanDecision::On
    } else if temp_c < target_temp - TEMP_HYSTERESIS && rh < max_humidity - HUMIDITY_HYSTERESIS {
        FanDecision::Off
    } else {
        FanDecision::Hold
    }
}

pub fn evaluate(
    state: &mut ControllerState,
    settings: &Settings,
    sensors: &dyn SensorGateway,
    actuators: &mut dyn ActuatorGateway,
    _now: OffsetDateTime,
) -> Result<()> {
    let (Some(temp_entity), Some(humidity_entity)) = (
        settings.temp_sensor.as_deref(),
        settings.humidity_sensor.as_deref(),
    ) else {
        return Ok(());
    };

    let temp = sensors.read(temp_entity).and_then(|r| r.numeric());
    let humidity = sensors.read(humidity_entity).and_then(|r| r.numeric());
    let (Some(temp), Some(humidity)) = (temp, humidity) else {
        debug!("climate: temperature or humidity unavailable, skipping");
        return Ok(());
    };

    state.vpd = vpd(temp, humidity);
    debug!(temp, humidity, vpd = state.vpd, "climate: updated vpd");

    let Some(fan) = settings.fan_entity.as_deref() else {
        return Ok(());
    };
    let Some(reading) = sensors.read(fan) else {
        debug!(entity = fan, "climate: fan unavailable, skipping");
        return Ok(());
    };

    let is_on = reading.is_on();
    match decide(temp, humidity, settings.target_temp, settings.max_humidity) {
        FanDecision::On if !is_on => {
            info!(entity = fan, temp, humidity, "climate: above limits, fan ON");
            actuators.command(ActuatorCommand::new(fan, Action::On))?;
        }
        FanDecision::Off if is_on => {
            info!(entity = fan, temp, humidity, "climate: comfortably below limits, fan OFF");
            actuators.command(ActuatorCommand::new(fan, Action::Off))?;
        }
        _ => {}
    }

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
