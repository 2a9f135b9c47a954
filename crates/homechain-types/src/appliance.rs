use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound on pins driven by a single multi-value appliance.
pub const MAX_MULTI_VALUE_PINS: usize = 4;

/// Identifies an appliance within a room.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplianceKey {
    pub room_id: u32,
    pub appliance_id: u32,
}

impl ApplianceKey {
    pub fn new(room_id: u32, appliance_id: u32) -> Self {
        Self {
            room_id,
            appliance_id,
        }
    }
}

impl fmt::Display for ApplianceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "room {}/appliance {}", self.room_id, self.appliance_id)
    }
}

/// Pin assignment as returned by the ledger's read interface.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplianceConfig {
    pub primary_pin: u8,
    #[serde(default)]
    pub is_multi_value: bool,
    #[serde(default)]
    pub multi_value_pins: Vec<u8>,
}

/// Cached actuation descriptor for one appliance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplianceDescriptor {
    pub room_id: u32,
    pub appliance_id: u32,
    pub primary_pin: u8,
    pub is_multi_value: bool,
    pub multi_value_pins: Vec<u8>,
    /// Invalidation generation the underlying read was issued under.
    pub cache_version: u64,
}

impl ApplianceDescriptor {
    /// Build a descriptor from a ledger read. Pins beyond
    /// [`MAX_MULTI_VALUE_PINS`] are dropped.
    pub fn from_config(key: ApplianceKey, config: ApplianceConfig, cache_version: u64) -> Self {
        let mut pins = config.multi_value_pins;
        pins.truncate(MAX_MULTI_VALUE_PINS);
        Self {
            room_id: key.room_id,
            appliance_id: key.appliance_id,
            primary_pin: config.primary_pin,
            is_multi_value: config.is_multi_value,
            multi_value_pins: pins,
            cache_version,
        }
    }

    pub fn key(&self) -> ApplianceKey {
        ApplianceKey::new(self.room_id, self.appliance_id)
    }

    /// Number of values a multi-value command for this appliance carries.
    pub fn cardinality(&self) -> usize {
        if self.is_multi_value {
            self.multi_value_pins.len()
        } else {
            0
        }
    }
}
