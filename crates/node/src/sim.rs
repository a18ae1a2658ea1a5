//! Stateful grow-box climate simulator for running without sensors.
//!
//! Models a small enclosed tent:
//! - Air temperature relaxes toward ambient; the light heats, the fan
//!   speeds up exchange with the room
//! - Relative humidity rises with plant transpiration (more under light)
//!   and is vented by the fan
//! - Soil moisture dries slowly and climbs while the pump runs
//! - Gaussian noise on every reported sample

// ---------------------------------------------------------------------------
// Gaussian approximation
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actuator {
    Light,
    Fan,
    Pump,
}

/// One noisy reading of every sensor, rounded to one decimal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub temperature: f64,
    pub humidity: f64,
    pub moisture: f64,
}

pub struct GrowSim {
    // True (noise-free) state
    temperature: f64,
    humidity: f64,
    moisture: f64,

    light: bool,
    fan: bool,
    pump: bool,

    ambient_temp: f64,
    ambient_humidity: f64,

    // Rates, per second
    exchange_still: f64,
    exchange_fan: f64,
    light_heat: f64,
    transpiration: f64,
    transpiration_light: f64,
    soil_drying: f64,
    pump_wetting: f64,

    // Reported noise sigmas
    temp_sigma: f64,
    humidity_sigma: f64,
    moisture_sigma: f64,
}

impl Default for GrowSim {
    fn default() -> Self {
        Self::new(21.0, 45.0)
    }
}

impl GrowSim {
    /// Start at room conditions with soil at a comfortable 45%.
    pub fn new(ambient_temp: f64, ambient_humidity: f64) -> Self {
        Self {
            temperature: ambient_temp,
            humidity: ambient_humidity + 10.0,
            moisture: 45.0,
            light: false,
            fan: false,
            pump: false,
            ambient_temp,
            ambient_humidity,
            exchange_still: 0.002,
            exchange_fan: 0.010,
            light_heat: 0.012,
            transpiration: 0.010,
            transpiration_light: 0.020,
            soil_drying: 0.0015,
            pump_wetting: 0.15,
            temp_sigma: 0.1,
            humidity_sigma: 0.5,
            moisture_sigma: 0.3,
        }
    }

    pub fn set(&mut self, actuator: Actuator, on: bool) {
        match actuator {
            Actuator::Light => self.light = on,
            Actuator::Fan => self.fan = on,
            Actuator::Pump => self.pump = on,
        }
    }

    pub fn all_off(&mut self) {
        self.light = false;
        self.fan = false;
        self.pump = false;
    }

    /// Advance the model by `dt_s` seconds.  Integrates in 1 s steps so long
    /// gaps stay stable.
    pub fn step(&mut self, dt_s: f64) {
        let mut remaining = dt_s.max(0.0);
        while remaining > 0.0 {
            let dt = remaining.min(1.0);
            self.step_once(dt);
            remaining -= dt;
        }
    }

    fn step_once(&mut self, dt: f64) {
        let exchange = self.exchange_still + if self.fan { self.exchange_fan } else { 0.0 };

        let heat = if self.light { self.light_heat } else { 0.0 };
        self.temperature += (exchange * (self.ambient_temp - self.temperature) + heat) * dt;

        let transpiration =
            self.transpiration + if self.light { self.transpiration_light } else { 0.0 };
        self.humidity +=
            (exchange * (self.ambient_humidity - self.humidity) + transpiration) * dt;
        self.humidity = self.humidity.clamp(0.0, 100.0);

        let water = if self.pump { self.pump_wetting } else { 0.0 };
        self.moisture = (self.moisture + (water - self.soil_drying) * dt).clamp(0.0, 100.0);
    }

    pub fn sample(&self) -> Sample {
        let round1 = |v: f64| (v * 10.0).round() / 10.0;
        Sample {
            temperature: round1(gaussian(self.temperature, self.temp_sigma)),
            humidity: round1(gaussian(self.humidity, self.humidity_sigma).clamp(0.0, 100.0)),
            moisture: round1(gaussian(self.moisture, self.moisture_sigma).clamp(0.0, 100.0)),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn mean_of(n: usize, mut f: impl FnMut() -> f64) -> f64 {
        (0..n).map(|_| f()).sum::<f64>() / n as f64
    }

    #[test]
    fn light_warms_the_tent() {
        let mut sim = GrowSim::default();
        sim.set(Actuator::Light, true);
        sim.step(3600.0);
        assert!(sim.temperature > 24.0, "temperature {}", sim.temperature);
    }

    #[test]
    fn fan_cools_a_lit_tent() {
        let mut still = GrowSim::default();
        still.set(Actuator::Light, true);
        still.step(3600.0);

        let mut vented = GrowSim::default();
        vented.set(Actuator::Light, true);
        vented.set(Actuator::Fan, true);
        vented.step(3600.0);

        assert!(vented.temperature < still.temperature);
        assert!(vented.humidity < still.humidity);
    }

    #[test]
    fn temperature_relaxes_to_ambient_when_idle() {
        let mut sim = GrowSim::default();
        sim.set(Actuator::Light, true);
        sim.step(3600.0);
        sim.all_off();
        sim.step(6.0 * 3600.0);
        assert!((sim.temperature - 21.0).abs() < 0.5, "temperature {}", sim.temperature);
    }

    #[test]
    fn soil_dries_and_pump_wets() {
        let mut sim = GrowSim::default();
        sim.step(3600.0);
        let dried = sim.moisture;
        assert!(dried < 45.0);

        sim.set(Actuator::Pump, true);
        sim.step(30.0);
        assert!(sim.moisture > dried + 4.0, "moisture {}", sim.moisture);
    }

    #[test]
    fn values_stay_in_range() {
        let mut sim = GrowSim::default();
        sim.set(Actuator::Pump, true);
        sim.set(Actuator::Light, true);
        sim.step(24.0 * 3600.0);
        let s = sim.sample();
        assert!((0.0..=100.0).contains(&s.humidity));
        assert!((0.0..=100.0).contains(&s.moisture));
    }

    #[test]
    fn samples_are_noisy_around_true_state() {
        let sim = GrowSim::default();
        let first = sim.sample();
        assert!((0..50).any(|_| sim.sample() != first), "samples never varied");
        let mean_t = mean_of(500, || sim.sample().temperature);
        assert!((mean_t - 21.0).abs() < 0.1, "mean temperature {mean_t}");
    }

    #[test]
    fn samples_have_one_decimal() {
        let s = GrowSim::default().sample();
        for v in [s.temperature, s.humidity, s.moisture] {
            assert!(((v * 10.0).round() - v * 10.0).abs() < 1e-9, "{v}");
        }
    }

    #[test]
    fn set_and_all_off() {
        let mut sim = GrowSim::default();
        sim.set(Actuator::Fan, true);
        assert!(sim.fan);
        sim.all_off();
        assert!(!sim.fan && !sim.light && !sim.pump);
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let mean = mean_of(5000, approx_std_normal);
        assert!(mean.abs() < 0.15, "mean {mean}");
    }
}
