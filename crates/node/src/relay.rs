//! Actuator relays driven over GPIO. The `gpio` feature gates the real rppal
//! driver; without it, a mock board only logs and remembers state changes.

use anyhow::Result;
use std::collections::HashMap;
use tracing::{info, warn};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

// ---------------------------------------------------------------------------
// Real GPIO relay board (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct RelayBoard {
    relays: HashMap<String, (OutputPin, bool)>, // entity -> (pin, on)
    active_low: bool,
}

#[cfg(feature = "gpio")]
impl RelayBoard {
    pub(crate) fn new(entity_to_gpio: &[(String, u8)], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut relays = HashMap::new();

        for (entity, pin_num) in entity_to_gpio {
            let pin = gpio.get(*pin_num)?.into_output();
            info!(entity = %entity, gpio = pin_num, "relay registered");
            relays.insert(entity.clone(), (pin, false));
        }

        let mut board = Self { relays, active_low };
        board.all_off();
        Ok(board)
    }

    /// Drive one relay.  Returns false for an entity this board does not own.
    pub(crate) fn set(&mut self, entity: &str, on: bool) -> bool {
        let Some((pin, state)) = self.relays.get_mut(entity) else {
            warn!(entity, "no relay for entity");
            return false;
        };
        // Active-low boards energise on LOW.
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        *state = on;
        info!(entity, "relay {}", if on { "ON" } else { "OFF" });
        true
    }

    pub(crate) fn is_on(&self, entity: &str) -> Option<bool> {
        self.relays.get(entity).map(|(_, on)| *on)
    }

    pub(crate) fn all_off(&mut self) {
        let keys: Vec<String> = self.relays.keys().cloned().collect();
        for k in keys {
            self.set(&k, false);
        }
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct RelayBoard {
    relays: HashMap<String, bool>, // entity -> on
}

#[cfg(not(feature = "gpio"))]
impl RelayBoard {
    pub(crate) fn new(entity_to_gpio: &[(String, u8)], _active_low: bool) -> Result<Self> {
        let mut relays = HashMap::new();
        for (entity, pin_num) in entity_to_gpio {
            info!(entity = %entity, gpio = pin_num, "[mock-gpio] relay registered (not wired)");
            relays.insert(entity.clone(), false);
        }
        Ok(Self { relays })
    }

    pub(crate) fn set(&mut self, entity: &str, on: bool) -> bool {
        let Some(state) = self.relays.get_mut(entity) else {
            warn!(entity, "[mock-gpio] no relay for entity");
            return false;
        };
        *state = on;
        info!(entity, "[mock-gpio] relay {}", if on { "ON" } else { "OFF" });
        true
    }

    pub(crate) fn is_on(&self, entity: &str) -> Option<bool> {
        self.relays.get(entity).copied()
    }

    pub(crate) fn all_off(&mut self) {
        let keys: Vec<String> = self.relays.keys().cloned().collect();
        for k in keys {
            self.set(&k, false);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
