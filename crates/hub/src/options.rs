//! Option resolution: raw per-box option values (from `config.toml` or the
//! API) coerced into typed settings with documented defaults.
//!
//! Unset or empty-string values fall back to the default silently.  Values
//! that are present but fail coercion fall back to the default with a
//! warning.  Nothing here returns an error.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

pub type RawOptions = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// Option keys
// ---------------------------------------------------------------------------

pub const LIGHT_ENTITY: &str = "light_entity";
pub const FAN_ENTITY: &str = "fan_entity";
pub const PUMP_ENTITY: &str = "pump_entity";
pub const MOISTURE_SENSOR: &str = "moisture_sensor";
pub const TEMP_SENSOR: &str = "temp_sensor";
pub const HUMIDITY_SENSOR: &str = "humidity_sensor";
pub const CAMERA_ENTITY: &str = "camera_entity";

pub const TARGET_TEMP: &str = "target_temp";
pub const MAX_HUMIDITY: &str = "max_humidity";
pub const PUMP_DURATION: &str = "pump_duration";
pub const TARGET_MOISTURE: &str = "target_moisture";
pub const LIGHT_START_HOUR: &str = "light_start_hour";

pub const PHASE_SEEDLING_HOURS: &str = "phase_seedling_hours";
pub const PHASE_VEGETATIVE_HOURS: &str = "phase_vegetative_hours";
pub const PHASE_FLOWERING_HOURS: &str = "phase_flowering_hours";
pub const PHASE_DRYING_HOURS: &str = "phase_drying_hours";
pub const PHASE_CURING_HOURS: &str = "phase_curing_hours";

pub const CUSTOM_PHASE_NAMES: [&str; 3] = [
    "custom1_phase_name",
    "custom2_phase_name",
    "custom3_phase_name",
];
pub const CUSTOM_PHASE_HOURS: [&str; 3] = [
    "custom1_phase_hours",
    "custom2_phase_hours",
    "custom3_phase_hours",
];

/// Keys holding entity references.
pub const ENTITY_KEYS: &[&str] = &[
    LIGHT_ENTITY,
    FAN_ENTITY,
    PUMP_ENTITY,
    MOISTURE_SENSOR,
    TEMP_SENSOR,
    HUMIDITY_SENSOR,
    CAMERA_ENTITY,
];

/// Every key a box's option table may contain.
pub fn is_known_key(key: &str) -> bool {
    ENTITY_KEYS.contains(&key)
        || [
            TARGET_TEMP,
            MAX_HUMIDITY,
            PUMP_DURATION,
            TARGET_MOISTURE,
            LIGHT_START_HOUR,
            PHASE_SEEDLING_HOURS,
            PHASE_VEGETATIVE_HOURS,
            PHASE_FLOWERING_HOURS,
            PHASE_DRYING_HOURS,
            PHASE_CURING_HOURS,
        ]
        .contains(&key)
        || CUSTOM_PHASE_NAMES.contains(&key)
        || CUSTOM_PHASE_HOURS.contains(&key)
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_TARGET_TEMP: f64 = 24.0;
pub const DEFAULT_MAX_HUMIDITY: f64 = 60.0;
pub const DEFAULT_PUMP_DURATION: f64 = 30.0;
pub const DEFAULT_TARGET_MOISTURE: f64 = 40.0;
pub const DEFAULT_LIGHT_START_HOUR: u8 = 18;

// ---------------------------------------------------------------------------
// Raw option access
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Options {
    raw: RawOptions,
}

impl Options {
    pub fn new(raw: RawOptions) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &RawOptions {
        &self.raw
    }

    /// Merge `update` on top of the current options.  `null` values are
    /// ignored; empty strings are kept so a field can be cleared.
    pub fn merge(&mut self, update: &RawOptions) {
        for (k, v) in update {
            if !v.is_null() {
                self.raw.insert(k.clone(), v.clone());
            }
        }
    }

    fn unset(&self, key: &str) -> Option<&Value> {
        match self.raw.get(key) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(v) => Some(v),
        }
    }

    /// Non-empty string value, `None` when unset.
    pub fn text(&self, key: &str) -> Option<String> {
        match self.unset(key)? {
            Value::String(s) => Some(s.trim().to_string()),
            other => Some(other.to_string()),
        }
    }

    pub fn float(&self, key: &str, default: f64) -> f64 {
        let Some(v) = self.unset(key) else {
            return default;
        };
        let parsed = match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        match parsed.filter(|f| f.is_finite()) {
            Some(f) => f,
            None => {
                warn!(option = key, value = %v, default, "invalid number, using default");
                default
            }
        }
    }

    pub fn int(&self, key: &str, default: i64) -> i64 {
        let Some(v) = self.unset(key) else {
            return default;
        };
        let parsed = match v {
            Value::Number(n) => n.as_i64().or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite() && f.fract() == 0.0)
                    .map(|f| f as i64)
            }),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        match parsed {
            Some(i) => i,
            None => {
                warn!(option = key, value = %v, default, "invalid integer, using default");
                default
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Effective settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseHours {
    pub seedling: f64,
    pub vegetative: f64,
    pub flowering: f64,
    pub drying: f64,
    pub curing: f64,
}

impl Default for PhaseHours {
    fn default() -> Self {
        Self {
            seedling: 18.0,
            vegetative: 18.0,
            flowering: 12.0,
            drying: 0.0,
            curing: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CustomPhase {
    pub name: Option<String>,
    pub hours: f64,
}

/// Fully resolved configuration of one grow box.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub light_entity: Option<String>,
    pub fan_entity: Option<String>,
    pub pump_entity: Option<String>,
    pub moisture_sensor: Option<String>,
    pub temp_sensor: Option<String>,
    pub humidity_sensor: Option<String>,
    pub camera_entity: Option<String>,

    pub target_temp: f64,
    pub max_humidity: f64,
    pub pump_duration: f64,
    pub target_moisture: f64,
    pub light_start_hour: u8,

    pub phase_hours: PhaseHours,
    pub custom_phases: [CustomPhase; 3],
}

impl Default for Settings {
    fn default() -> Self {
        Self::resolve(&Options::default())
    }
}

impl Settings {
    /// Every entity this box refers to.
    pub fn entities(&self) -> impl Iterator<Item = &str> {
        [
            &self.light_entity,
            &self.fan_entity,
            &self.pump_entity,
            &self.moisture_sensor,
            &self.temp_sensor,
            &self.humidity_sensor,
            &self.camera_entity,
        ]
        .into_iter()
        .filter_map(|e| e.as_deref())
    }

    pub fn resolve(opts: &Options) -> Self {
        let defaults = PhaseHours::default();

        let start = opts.int(LIGHT_START_HOUR, DEFAULT_LIGHT_START_HOUR as i64);
        let light_start_hour = match u8::try_from(start) {
            Ok(h) if h <= 23 => h,
            _ => {
                warn!(
                    start_hour = start,
                    "invalid light start hour, using {DEFAULT_LIGHT_START_HOUR}"
                );
                DEFAULT_LIGHT_START_HOUR
            }
        };

        let custom_phases = [0, 1, 2].map(|i| CustomPhase {
            name: opts.text(CUSTOM_PHASE_NAMES[i]),
            hours: opts.float(CUSTOM_PHASE_HOURS[i], 0.0),
        });

        let settings = Self {
            light_entity: opts.text(LIGHT_ENTITY),
            fan_entity: opts.text(FAN_ENTITY),
            pump_entity: opts.text(PUMP_ENTITY),
            moisture_sensor: opts.text(MOISTURE_SENSOR),
            temp_sensor: opts.text(TEMP_SENSOR),
            humidity_sensor: opts.text(HUMIDITY_SENSOR),
            camera_entity: opts.text(CAMERA_ENTITY),

            target_temp: opts.float(TARGET_TEMP, DEFAULT_TARGET_TEMP),
            max_humidity: opts.float(MAX_HUMIDITY, DEFAULT_MAX_HUMIDITY),
            pump_duration: opts.float(PUMP_DURATION, DEFAULT_PUMP_DURATION),
            target_moisture: opts.float(TARGET_MOISTURE, DEFAULT_TARGET_MOISTURE),
            light_start_hour,

            phase_hours: PhaseHours {
                seedling: opts.float(PHASE_SEEDLING_HOURS, defaults.seedling),
                vegetative: opts.float(PHASE_VEGETATIVE_HOURS, defaults.vegetative),
                flowering: opts.float(PHASE_FLOWERING_HOURS, defaults.flowering),
                drying: opts.float(PHASE_DRYING_HOURS, defaults.drying),
                curing: opts.float(PHASE_CURING_HOURS, defaults.curing),
            },
            custom_phases,
        };

        if settings.has_light_fan_conflict() {
            warn!(
                entity = settings.light_entity.as_deref().unwrap_or_default(),
                "light entity is also the fan entity; light and climate control will fight over it"
            );
        }

        settings
    }

    pub fn has_light_fan_conflict(&self) -> bool {
        matches!((&self.light_entity, &self.fan_entity), (Some(l), Some(f)) if l == f)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opts(pairs: &[(&str, Value)]) -> Options {
        Options::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    // -- Coercion ------------------------------------------------------------

    #[test]
    fn float_unset_uses_default() {
        assert_eq!(opts(&[]).float(TARGET_TEMP, 24.0), 24.0);
    }

    #[test]
    fn float_empty_string_uses_default() {
        assert_eq!(opts(&[(TARGET_TEMP, json!(""))]).float(TARGET_TEMP, 24.0), 24.0);
    }

    #[test]
    fn float_numeric_string_parsed() {
        assert_eq!(opts(&[(TARGET_TEMP, json!("26.5"))]).float(TARGET_TEMP, 24.0), 26.5);
    }

    #[test]
    fn float_garbage_uses_default() {
        assert_eq!(opts(&[(TARGET_TEMP, json!("warm"))]).float(TARGET_TEMP, 24.0), 24.0);
        assert_eq!(opts(&[(TARGET_TEMP, json!(true))]).float(TARGET_TEMP, 24.0), 24.0);
    }

    #[test]
    fn int_accepts_integral_float() {
        assert_eq!(opts(&[(LIGHT_START_HOUR, json!(6.0))]).int(LIGHT_START_HOUR, 18), 6);
    }

    #[test]
    fn int_rejects_fractional() {
        assert_eq!(opts(&[(LIGHT_START_HOUR, json!(6.5))]).int(LIGHT_START_HOUR, 18), 18);
        assert_eq!(opts(&[(LIGHT_START_HOUR, json!("6.5"))]).int(LIGHT_START_HOUR, 18), 18);
    }

    #[test]
    fn text_trims_and_treats_blank_as_unset() {
        let o = opts(&[(LIGHT_ENTITY, json!("  switch.light ")), (FAN_ENTITY, json!("   "))]);
        assert_eq!(o.text(LIGHT_ENTITY).as_deref(), Some("switch.light"));
        assert_eq!(o.text(FAN_ENTITY), None);
    }

    // -- Merge ---------------------------------------------------------------

    #[test]
    fn merge_drops_nulls_keeps_empty_strings() {
        let mut o = opts(&[(LIGHT_ENTITY, json!("switch.light")), (FAN_ENTITY, json!("switch.fan"))]);
        let update: RawOptions = [
            (LIGHT_ENTITY.to_string(), json!(null)),
            (FAN_ENTITY.to_string(), json!("")),
        ]
        .into_iter()
        .collect();
        o.merge(&update);
        assert_eq!(o.text(LIGHT_ENTITY).as_deref(), Some("switch.light"));
        assert_eq!(o.raw()[FAN_ENTITY], json!(""));
        assert_eq!(o.text(FAN_ENTITY), None);
    }

    // -- Settings --------------------------------------------------------------

    #[test]
    fn settings_defaults() {
        let s = Settings::default();
        assert_eq!(s.target_temp, 24.0);
        assert_eq!(s.max_humidity, 60.0);
        assert_eq!(s.pump_duration, 30.0);
        assert_eq!(s.target_moisture, 40.0);
        assert_eq!(s.light_start_hour, 18);
        assert_eq!(s.phase_hours, PhaseHours::default());
        assert!(s.light_entity.is_none());
        assert!(s.custom_phases.iter().all(|c| c.name.is_none() && c.hours == 0.0));
    }

    #[test]
    fn settings_start_hour_out_of_range_forced_to_default() {
        assert_eq!(Settings::resolve(&opts(&[(LIGHT_START_HOUR, json!(24))])).light_start_hour, 18);
        assert_eq!(Settings::resolve(&opts(&[(LIGHT_START_HOUR, json!(-1))])).light_start_hour, 18);
        assert_eq!(Settings::resolve(&opts(&[(LIGHT_START_HOUR, json!(0))])).light_start_hour, 0);
        assert_eq!(Settings::resolve(&opts(&[(LIGHT_START_HOUR, json!("23"))])).light_start_hour, 23);
    }

    #[test]
    fn settings_custom_phase_slots() {
        let s = Settings::resolve(&opts(&[
            (CUSTOM_PHASE_NAMES[1], json!("Flush")),
            (CUSTOM_PHASE_HOURS[1], json!(10)),
        ]));
        assert_eq!(s.custom_phases[0], CustomPhase::default());
        assert_eq!(s.custom_phases[1].name.as_deref(), Some("Flush"));
        assert_eq!(s.custom_phases[1].hours, 10.0);
    }

    #[test]
    fn settings_detects_light_fan_conflict() {
        let s = Settings::resolve(&opts(&[
            (LIGHT_ENTITY, json!("switch.shared")),
            (FAN_ENTITY, json!("switch.shared")),
        ]));
        assert!(s.has_light_fan_conflict());

        let s = Settings::resolve(&opts(&[
            (LIGHT_ENTITY, json!("switch.light")),
            (FAN_ENTITY, json!("switch.fan")),
        ]));
        assert!(!s.has_light_fan_conflict());
    }

    #[test]
    fn settings_lists_configured_entities() {
        let s = Settings::resolve(&opts(&[
            (PUMP_ENTITY, json!("switch.pump")),
            (TEMP_SENSOR, json!("sensor.t")),
            (FAN_ENTITY, json!("")),
        ]));
        let mut entities: Vec<&str> = s.entities().collect();
        entities.sort_unstable();
        assert_eq!(entities, vec!["sensor.t", "switch.pump"]);
    }

    #[test]
    fn known_keys() {
        assert!(is_known_key("pump_duration"));
        assert!(is_known_key("custom3_phase_hours"));
        assert!(!is_known_key("pump_durations"));
    }
}
