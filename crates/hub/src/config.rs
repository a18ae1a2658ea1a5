//! TOML config file loading and validation for grow boxes, and restoring
//! each box's controller state from the database at startup.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::control::{ControllerState, GrowBox};
use crate::db::{Db, StoredBoxState};
use crate::mqtt::is_topic_safe;
use crate::options::{self, Options, RawOptions, Settings};
use crate::phase::{GrowPhase, PhaseClock};
use crate::zone::LocalZone;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub boxes: Vec<BoxEntry>,
}

#[derive(Debug, Deserialize)]
pub struct BoxEntry {
    pub box_id: String,
    pub name: String,
    #[serde(default)]
    pub options: RawOptions,
}

/// Phase a box starts in when nothing has been persisted yet.
const DEFAULT_PHASE: GrowPhase = GrowPhase::Vegetative;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate the structure of every box entry.  Returns `Ok(())` or an
    /// error describing every violation found (not just the first one).
    ///
    /// Option values are deliberately not range-checked here; invalid
    /// values degrade to defaults at resolve time.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        let mut seen_ids: HashSet<&str> = HashSet::new();
        for (i, b) in self.boxes.iter().enumerate() {
            let ctx = || {
                if b.box_id.is_empty() {
                    format!("boxes[{i}]")
                } else {
                    format!("box '{}'", b.box_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if b.box_id.trim().is_empty() {
                errors.push(format!("{}: box_id is empty", ctx()));
            } else if !seen_ids.insert(&b.box_id) {
                errors.push(format!("{}: duplicate box_id", ctx()));
            } else if !is_topic_safe(&b.box_id) {
                errors.push(format!("{}: box_id must not contain '/', '+' or '#'", ctx()));
            }

            if b.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            // ── Options ─────────────────────────────────────────
            validate_options(&b.options, &mut errors, &ctx());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

/// Structural checks shared by the config file and API option updates.
pub fn validate_options(opts: &RawOptions, errors: &mut Vec<String>, ctx: &str) {
    for (key, value) in opts {
        if !options::is_known_key(key) && key != "current_phase" && key != "phase_start_date" {
            errors.push(format!("{ctx}: unknown option '{key}'"));
            continue;
        }
        if options::ENTITY_KEYS.contains(&key.as_str()) {
            match value {
                serde_json::Value::Null => {}
                serde_json::Value::String(s) if s.trim().is_empty() => {}
                serde_json::Value::String(s) => {
                    if !is_topic_safe(s.trim()) {
                        errors.push(format!(
                            "{ctx}: {key} '{s}' must not contain '/', '+' or '#'"
                        ));
                    }
                }
                other => errors.push(format!(
                    "{ctx}: {key} must be an entity reference string, got {other}"
                )),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + restore
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Rebuild controller state from what was persisted.  Missing or unparsable
/// values fall back to "vegetative, starting now, master on".  Start dates
/// without an offset are read in `zone`.
pub fn restore_state(
    stored: Option<&StoredBoxState>,
    settings: &Settings,
    zone: &LocalZone,
    now: OffsetDateTime,
) -> ControllerState {
    let phase = match stored {
        Some(s) => GrowPhase::parse(&s.current_phase, settings).unwrap_or_else(|| {
            warn!(phase = %s.current_phase, "unknown persisted phase, using {DEFAULT_PHASE}");
            DEFAULT_PHASE
        }),
        None => DEFAULT_PHASE,
    };

    let started_at = stored
        .and_then(|s| s.phase_start_date.as_deref())
        .and_then(|d| match zone.parse_timestamp(d) {
            Ok(t) => Some(t),
            Err(e) => {
                warn!(date = d, "unparsable phase start date, resetting to now: {e:#}");
                None
            }
        })
        .unwrap_or(now);

    let mut state = ControllerState::new(PhaseClock::new(phase, started_at), now);
    state.master_enabled = stored.map_or(true, |s| s.master_enabled);
    state
}

/// Build every configured box, layering persisted option overrides on top
/// of the file options and restoring the persisted phase clock.
pub async fn restore_boxes(
    config: &Config,
    db: &Db,
    zone: &LocalZone,
    now: OffsetDateTime,
) -> Result<Vec<GrowBox>> {
    let mut boxes = Vec::with_capacity(config.boxes.len());
    for entry in &config.boxes {
        let mut opts = Options::new(entry.options.clone());
        let overrides = db
            .load_options(&entry.box_id)
            .await
            .with_context(|| format!("failed to load options for box '{}'", entry.box_id))?;
        opts.merge(&overrides);

        let stored = db
            .load_box_state(&entry.box_id)
            .await
            .with_context(|| format!("failed to load state for box '{}'", entry.box_id))?;

        let gb_settings = Settings::resolve(&opts);
        let state = restore_state(stored.as_ref(), &gb_settings, zone, now);
        boxes.push(GrowBox::new(&entry.box_id, &entry.name, opts, state));
    }

    info!(boxes = boxes.len(), "boxes restored");
    Ok(boxes)
}

// ===========================================================================
// Tests
// ===========================================================================
