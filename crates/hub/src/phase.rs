//! Grow phases and the phase clock.

use std::fmt;

use serde::Serialize;
use time::OffsetDateTime;

use crate::options::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GrowPhase {
    Seedling,
    Vegetative,
    Flowering,
    Drying,
    Curing,
    Custom1,
    Custom2,
    Custom3,
}

impl GrowPhase {
    pub const ALL: [GrowPhase; 8] = [
        GrowPhase::Seedling,
        GrowPhase::Vegetative,
        GrowPhase::Flowering,
        GrowPhase::Drying,
        GrowPhase::Curing,
        GrowPhase::Custom1,
        GrowPhase::Custom2,
        GrowPhase::Custom3,
    ];

    /// Stable key used for persistence and the API.
    pub fn key(self) -> &'static str {
        match self {
            GrowPhase::Seedling => "seedling",
            GrowPhase::Vegetative => "vegetative",
            GrowPhase::Flowering => "flowering",
            GrowPhase::Drying => "drying",
            GrowPhase::Curing => "curing",
            GrowPhase::Custom1 => "custom1",
            GrowPhase::Custom2 => "custom2",
            GrowPhase::Custom3 => "custom3",
        }
    }

    /// Index into `Settings::custom_phases` for custom slots.
    pub fn custom_slot(self) -> Option<usize> {
        match self {
            GrowPhase::Custom1 => Some(0),
            GrowPhase::Custom2 => Some(1),
            GrowPhase::Custom3 => Some(2),
            _ => None,
        }
    }

    /// Resolve a phase from its key or from a configured custom display name.
    pub fn parse(s: &str, settings: &Settings) -> Option<GrowPhase> {
        let s = s.trim();
        if let Some(p) = Self::ALL.into_iter().find(|p| p.key().eq_ignore_ascii_case(s)) {
            return Some(p);
        }
        settings
            .custom_phases
            .iter()
            .position(|c| c.name.as_deref() == Some(s))
            .map(|i| [GrowPhase::Custom1, GrowPhase::Custom2, GrowPhase::Custom3][i])
    }

    /// Operator-facing name: the custom display name when one is configured.
    pub fn display_name(self, settings: &Settings) -> String {
        self.custom_slot()
            .and_then(|i| settings.custom_phases[i].name.clone())
            .unwrap_or_else(|| self.key().to_string())
    }
}

impl fmt::Display for GrowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Current phase and when it began.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseClock {
    pub phase: GrowPhase,
    pub started_at: OffsetDateTime,
}

impl PhaseClock {
    pub fn new(phase: GrowPhase, started_at: OffsetDateTime) -> Self {
        Self { phase, started_at }
    }

    /// Switch phase.  Entering a different phase restarts the clock at
    /// `started_at` (or `now`); re-selecting the current phase keeps it
    /// unless an explicit start is given.
    pub fn set_phase(
        &mut self,
        phase: GrowPhase,
        started_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) {
        if phase != self.phase {
            self.started_at = started_at.unwrap_or(now);
        } else if let Some(s) = started_at {
            self.started_at = s;
        }
        self.phase = phase;
    }

    pub fn days_in_phase(&self, now: OffsetDateTime) -> i64 {
        (now - self.started_at).whole_days().max(0)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
