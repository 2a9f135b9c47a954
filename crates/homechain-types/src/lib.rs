//! Value types shared by the homechain relay: ledger positions and events,
//! appliance descriptors, and the device commands published to the bus.

mod appliance;
mod command;
mod event;
mod position;

pub use appliance::{ApplianceConfig, ApplianceDescriptor, ApplianceKey, MAX_MULTI_VALUE_PINS};
pub use command::{
    Actuation, DeviceCommand, DeviceMessage, IDEMPOTENCY_PREFIX, IdempotencyKey, Multistate,
    TOPIC_PREFIX, topic_for_room,
};
pub use event::{DecodeError, DomainEvent, EventKind, LedgerEvent, ObservedEvent};
pub use position::{Cursor, Position};
