//! Builds device commands from authoritative ledger reads.
//!
//! Event payloads only say *that* something changed. The value to actuate is
//! always re-read from the ledger when the event is processed, so a burst of
//! changes collapses into the latest intended state (last writer wins) and
//! intermediate states may never be actuated.

use std::sync::Arc;

use homechain_types::{
    Actuation, ApplianceDescriptor, ApplianceKey, DeviceCommand, DomainEvent, IdempotencyKey,
    ObservedEvent,
};
use thiserror::Error;

use crate::ledger::{LedgerClient, LedgerError};
use crate::retry::Transient;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("authoritative read failed: {0}")]
    Ledger(#[from] LedgerError),
    #[error("{key} is not configured as a multi-value appliance")]
    KindMismatch { key: ApplianceKey },
    #[error("configuration changes do not produce device commands")]
    NotActuating,
}

impl Transient for ReconcileError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Ledger(err) => err.is_transient(),
            Self::KindMismatch { .. } | Self::NotActuating => false,
        }
    }
}

pub struct Reconciler {
    ledger: Arc<dyn LedgerClient>,
}

impl Reconciler {
    pub fn new(ledger: Arc<dyn LedgerClient>) -> Self {
        Self { ledger }
    }

    pub async fn reconcile(
        &self,
        observed: &ObservedEvent,
        descriptor: &ApplianceDescriptor,
    ) -> Result<DeviceCommand, ReconcileError> {
        let key = observed.key();
        let (pin, actuation) = match &observed.event {
            DomainEvent::SingleStateChanged { state, .. } => {
                let on = self.ledger.switch_state(key).await?;
                if on != *state {
                    tracing::debug!(
                        %key,
                        event_state = *state,
                        ledger_state = on,
                        "switch changed again since event; using ledger state"
                    );
                }
                (descriptor.primary_pin, Actuation::Binary { on })
            }
            DomainEvent::MultiStateChanged { .. } => {
                if !descriptor.is_multi_value {
                    return Err(ReconcileError::KindMismatch { key });
                }
                let mut values = self.ledger.multi_state(key).await?;
                let pins = descriptor.multi_value_pins.clone();
                values.resize(pins.len(), 0);
                let pin = pins.first().copied().unwrap_or(descriptor.primary_pin);
                (pin, Actuation::Multi { pins, values })
            }
            DomainEvent::ApplianceConfigChanged { .. } => return Err(ReconcileError::NotActuating),
        };

        Ok(DeviceCommand {
            room_id: key.room_id,
            appliance_id: key.appliance_id,
            pin,
            actuation,
            idempotency_key: IdempotencyKey::derive(&observed.emitter, observed.position, key),
            origin_block_height: observed.position.block_height,
        })
    }
}
