use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::appliance::ApplianceKey;
use crate::position::Position;

/// Prefix for rendered idempotency keys.
pub const IDEMPOTENCY_PREFIX: &str = "sha256:";

/// Topic namespace for per-room device commands.
pub const TOPIC_PREFIX: &str = "home/room/";

/// Topic a room's actuators subscribe to.
pub fn topic_for_room(room_id: u32) -> String {
    format!("{TOPIC_PREFIX}{room_id}")
}

/// Deterministic identifier of one logical command.
///
/// Derived only from where the triggering event sits in the ledger and which
/// appliance it targets, so redelivered events produce the same key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn derive(emitter: &str, position: Position, key: ApplianceKey) -> Self {
        let mut hasher = Sha256::new();
        // Length-prefix the emitter so no two inputs share an encoding.
        hasher.update((emitter.len() as u64).to_be_bytes());
        hasher.update(emitter.to_ascii_lowercase().as_bytes());
        hasher.update(position.block_height.to_be_bytes());
        hasher.update(position.log_index.to_be_bytes());
        hasher.update(key.room_id.to_be_bytes());
        hasher.update(key.appliance_id.to_be_bytes());
        Self(format!("{IDEMPOTENCY_PREFIX}{}", hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the actuator should do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Actuation {
    Binary { on: bool },
    /// `values[i]` drives `pins[i]`; both have the descriptor's cardinality.
    Multi { pins: Vec<u8>, values: Vec<u32> },
}

/// Command for one appliance, built from a reconciled ledger read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceCommand {
    pub room_id: u32,
    pub appliance_id: u32,
    pub pin: u8,
    pub actuation: Actuation,
    pub idempotency_key: IdempotencyKey,
    pub origin_block_height: u64,
}

impl DeviceCommand {
    pub fn key(&self) -> ApplianceKey {
        ApplianceKey::new(self.room_id, self.appliance_id)
    }

    pub fn topic(&self) -> String {
        topic_for_room(self.room_id)
    }

    /// Wire representation stamped with `timestamp_ms`.
    pub fn to_message(&self, timestamp_ms: u64) -> DeviceMessage {
        let (mode, is_multistate, multistate, multistate_pins) = match &self.actuation {
            Actuation::Binary { on } => (u8::from(*on), false, Multistate::Scalar(0), Vec::new()),
            Actuation::Multi { pins, values } => (
                u8::from(values.iter().any(|v| *v != 0)),
                true,
                Multistate::Values(values.clone()),
                pins.clone(),
            ),
        };
        DeviceMessage {
            pin: self.pin,
            mode,
            is_multistate,
            multistate,
            multistate_pins,
            room_id: self.room_id,
            appliance_id: self.appliance_id,
            idempotency_key: self.idempotency_key.to_string(),
            timestamp: timestamp_ms,
        }
    }
}

/// `multistate` is a bare integer for binary commands and an array otherwise.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Multistate {
    Scalar(u32),
    Values(Vec<u32>),
}

/// JSON payload published on the device bus.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMessage {
    pub pin: u8,
    pub mode: u8,
    pub is_multistate: bool,
    pub multistate: Multistate,
    #[serde(default)]
    pub multistate_pins: Vec<u8>,
    pub room_id: u32,
    pub appliance_id: u32,
    pub idempotency_key: String,
    pub timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn binary_command(on: bool) -> DeviceCommand {
        let key = ApplianceKey::new(0, 2);
        DeviceCommand {
            room_id: 0,
            appliance_id: 2,
            pin: 14,
            actuation: Actuation::Binary { on },
            idempotency_key: IdempotencyKey::derive("0xHome", Position::new(100, 1), key),
            origin_block_height: 100,
        }
    }

    #[test]
    fn idempotency_key_is_stable_and_position_sensitive() {
        let key = ApplianceKey::new(0, 2);
        let a = IdempotencyKey::derive("0xhome", Position::new(100, 1), key);
        let b = IdempotencyKey::derive("0xHOME", Position::new(100, 1), key);
        let c = IdempotencyKey::derive("0xhome", Position::new(100, 2), key);
        let d = IdempotencyKey::derive("0xhome", Position::new(100, 1), ApplianceKey::new(0, 3));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(a.as_str().starts_with(IDEMPOTENCY_PREFIX));
        assert_eq!(a.as_str().len(), IDEMPOTENCY_PREFIX.len() + 64);
    }

    #[test]
    fn binary_command_wire_format() {
        let cmd = binary_command(true);
        assert_eq!(cmd.topic(), "home/room/0");
        let value = serde_json::to_value(cmd.to_message(1_700_000_000_000)).unwrap();
        assert_eq!(
            value,
            json!({
                "pin": 14,
                "mode": 1,
                "isMultistate": false,
                "multistate": 0,
                "multistatePins": [],
                "roomId": 0,
                "applianceId": 2,
                "idempotencyKey": cmd.idempotency_key.to_string(),
                "timestamp": 1_700_000_000_000u64,
            })
        );
    }

    #[test]
    fn multi_command_carries_value_array() {
        let key = ApplianceKey::new(0, 1);
        let cmd = DeviceCommand {
            room_id: 0,
            appliance_id: 1,
            pin: 15,
            actuation: Actuation::Multi {
                pins: vec![15, 16, 17],
                values: vec![75, 200, 50],
            },
            idempotency_key: IdempotencyKey::derive("0xhome", Position::new(7, 0), key),
            origin_block_height: 7,
        };
        let msg = cmd.to_message(5);
        assert_eq!(msg.mode, 1);
        assert!(msg.is_multistate);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["multistate"], json!([75, 200, 50]));
        assert_eq!(value["multistatePins"], json!([15, 16, 17]));

        let back: DeviceMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn all_zero_multi_values_switch_off() {
        let cmd = DeviceCommand {
            actuation: Actuation::Multi {
                pins: vec![15, 16],
                values: vec![0, 0],
            },
            ..binary_command(true)
        };
        assert_eq!(cmd.to_message(0).mode, 0);
    }
}
