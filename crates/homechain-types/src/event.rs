use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::appliance::ApplianceKey;
use crate::position::Position;

/// Raw event as observed on the ledger, before kind filtering and decoding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEvent {
    pub emitter: String,
    #[serde(flatten)]
    pub position: Position,
    pub kind: String,
    #[serde(default)]
    pub fields: serde_json::Value,
}

/// Event kinds the relay acts on. Anything else is skipped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    SingleStateChanged,
    MultiStateChanged,
    ApplianceConfigChanged,
}

impl EventKind {
    pub const SINGLE_STATE_CHANGED: &'static str = "SingleStateChanged";
    pub const MULTI_STATE_CHANGED: &'static str = "MultiStateChanged";
    pub const APPLIANCE_CONFIG_CHANGED: &'static str = "ApplianceConfigChanged";

    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            Self::SINGLE_STATE_CHANGED => Some(Self::SingleStateChanged),
            Self::MULTI_STATE_CHANGED => Some(Self::MultiStateChanged),
            Self::APPLIANCE_CONFIG_CHANGED => Some(Self::ApplianceConfigChanged),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleStateChanged => Self::SINGLE_STATE_CHANGED,
            Self::MultiStateChanged => Self::MULTI_STATE_CHANGED,
            Self::ApplianceConfigChanged => Self::APPLIANCE_CONFIG_CHANGED,
        }
    }
}

/// Typed payload of a known ledger event.
///
/// The embedded `state`/`values` are informational only: commands are always
/// built from an authoritative read taken after the event was observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DomainEvent {
    SingleStateChanged { key: ApplianceKey, state: bool },
    MultiStateChanged { key: ApplianceKey, values: Vec<u32> },
    ApplianceConfigChanged { key: ApplianceKey },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SingleStatePayload {
    room_id: u32,
    appliance_id: u32,
    state: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MultiStatePayload {
    room_id: u32,
    appliance_id: u32,
    #[serde(default)]
    values: Vec<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigPayload {
    room_id: u32,
    appliance_id: u32,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown event kind '{0}'")]
    UnknownKind(String),
    #[error("malformed {kind} payload: {source}")]
    InvalidFields {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl DomainEvent {
    /// Decode the kind-specific payload of a raw ledger event.
    pub fn decode(event: &LedgerEvent) -> Result<Self, DecodeError> {
        let kind = EventKind::parse(&event.kind)
            .ok_or_else(|| DecodeError::UnknownKind(event.kind.clone()))?;
        match kind {
            EventKind::SingleStateChanged => {
                let p: SingleStatePayload = fields(kind, &event.fields)?;
                Ok(Self::SingleStateChanged {
                    key: ApplianceKey::new(p.room_id, p.appliance_id),
                    state: p.state,
                })
            }
            EventKind::MultiStateChanged => {
                let p: MultiStatePayload = fields(kind, &event.fields)?;
                Ok(Self::MultiStateChanged {
                    key: ApplianceKey::new(p.room_id, p.appliance_id),
                    values: p.values,
                })
            }
            EventKind::ApplianceConfigChanged => {
                let p: ConfigPayload = fields(kind, &event.fields)?;
                Ok(Self::ApplianceConfigChanged {
                    key: ApplianceKey::new(p.room_id, p.appliance_id),
                })
            }
        }
    }

    pub fn key(&self) -> ApplianceKey {
        match self {
            Self::SingleStateChanged { key, .. }
            | Self::MultiStateChanged { key, .. }
            | Self::ApplianceConfigChanged { key } => *key,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::SingleStateChanged { .. } => EventKind::SingleStateChanged,
            Self::MultiStateChanged { .. } => EventKind::MultiStateChanged,
            Self::ApplianceConfigChanged { .. } => EventKind::ApplianceConfigChanged,
        }
    }
}

fn fields<T: DeserializeOwned>(kind: EventKind, value: &serde_json::Value) -> Result<T, DecodeError> {
    T::deserialize(value).map_err(|source| DecodeError::InvalidFields {
        kind: kind.as_str(),
        source,
    })
}

/// A decoded event together with where it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedEvent {
    pub emitter: String,
    pub position: Position,
    pub event: DomainEvent,
}

impl ObservedEvent {
    pub fn decode(raw: &LedgerEvent) -> Result<Self, DecodeError> {
        Ok(Self {
            emitter: raw.emitter.clone(),
            position: raw.position,
            event: DomainEvent::decode(raw)?,
        })
    }

    pub fn key(&self) -> ApplianceKey {
        self.event.key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(kind: &str, fields: serde_json::Value) -> LedgerEvent {
        LedgerEvent {
            emitter: "0xhome".into(),
            position: Position::new(12, 4),
            kind: kind.into(),
            fields,
        }
    }

    #[test]
    fn ledger_event_flattens_position() {
        let event: LedgerEvent = serde_json::from_value(json!({
            "emitter": "0xhome",
            "blockHeight": 12,
            "logIndex": 4,
            "kind": "SingleStateChanged",
            "fields": { "roomId": 0, "applianceId": 2, "state": true }
        }))
        .unwrap();
        assert_eq!(event.position, Position::new(12, 4));
    }

    #[test]
    fn decodes_single_state_change() {
        let event = raw(
            "SingleStateChanged",
            json!({ "roomId": 0, "applianceId": 2, "state": true }),
        );
        let decoded = DomainEvent::decode(&event).unwrap();
        assert_eq!(
            decoded,
            DomainEvent::SingleStateChanged {
                key: ApplianceKey::new(0, 2),
                state: true
            }
        );
        assert_eq!(decoded.kind(), EventKind::SingleStateChanged);
    }

    #[test]
    fn decodes_multi_state_and_config_change() {
        let multi = raw(
            "MultiStateChanged",
            json!({ "roomId": 0, "applianceId": 1, "values": [75, 200, 50] }),
        );
        assert_eq!(
            DomainEvent::decode(&multi).unwrap(),
            DomainEvent::MultiStateChanged {
                key: ApplianceKey::new(0, 1),
                values: vec![75, 200, 50]
            }
        );

        let config = raw("ApplianceConfigChanged", json!({ "roomId": 3, "applianceId": 9 }));
        assert_eq!(
            ObservedEvent::decode(&config).unwrap().key(),
            ApplianceKey::new(3, 9)
        );
    }

    #[test]
    fn unknown_kind_is_reported() {
        let event = raw("RoleGranted", json!({}));
        assert!(matches!(
            DomainEvent::decode(&event),
            Err(DecodeError::UnknownKind(kind)) if kind == "RoleGranted"
        ));
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        let event = raw("SingleStateChanged", json!({ "roomId": "kitchen" }));
        let err = DomainEvent::decode(&event).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::InvalidFields {
                kind: "SingleStateChanged",
                ..
            }
        ));
    }
}
