//! Lazily populated cache of appliance pin assignments.
//!
//! Entries never expire on their own; they are only invalidated when the
//! ledger reports a configuration change for the key. Each key has its own
//! slot so resolves of different appliances never contend, while resolves and
//! invalidations of the same appliance are ordered through the slot's
//! generation counter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use homechain_types::{ApplianceDescriptor, ApplianceKey, MAX_MULTI_VALUE_PINS};
use tokio::sync::Mutex as AsyncMutex;

use crate::ledger::{LedgerClient, LedgerError};

#[derive(Default)]
struct Slot {
    /// Bumped by every invalidation; a descriptor is fresh only while its
    /// `cache_version` equals this value.
    generation: AtomicU64,
    entry: AsyncMutex<Option<ApplianceDescriptor>>,
}

impl Slot {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

pub struct DeviceRegistry {
    ledger: Arc<dyn LedgerClient>,
    slots: Mutex<HashMap<ApplianceKey, Arc<Slot>>>,
}

impl DeviceRegistry {
    pub fn new(ledger: Arc<dyn LedgerClient>) -> Self {
        Self {
            ledger,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: ApplianceKey) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(key).or_default().clone()
    }

    /// Cached descriptor if fresh, otherwise an authoritative ledger read.
    ///
    /// A read that races with an invalidation is discarded and issued once more.
    pub async fn resolve(&self, key: ApplianceKey) -> Result<ApplianceDescriptor, LedgerError> {
        let slot = self.slot(key);
        let mut entry = slot.entry.lock().await;
        if let Some(desc) = entry.as_ref() {
            if desc.cache_version == slot.generation() {
                return Ok(desc.clone());
            }
        }

        let mut retried = false;
        loop {
            let generation = slot.generation();
            let config = self.ledger.appliance_config(key).await?;
            if slot.generation() != generation && !retried {
                tracing::debug!(%key, "descriptor invalidated during read, re-reading");
                retried = true;
                continue;
            }
            if config.multi_value_pins.len() > MAX_MULTI_VALUE_PINS {
                tracing::warn!(
                    %key,
                    declared = config.multi_value_pins.len(),
                    max = MAX_MULTI_VALUE_PINS,
                    "appliance declares too many multi-value pins; extra pins ignored"
                );
            }
            let desc = ApplianceDescriptor::from_config(key, config, generation);
            if slot.generation() != generation {
                tracing::warn!(%key, "descriptor invalidated twice during resolve; will re-read on next use");
            }
            tracing::debug!(
                %key,
                primary_pin = desc.primary_pin,
                multi_value = desc.is_multi_value,
                version = generation,
                "descriptor cached"
            );
            *entry = Some(desc.clone());
            return Ok(desc);
        }
    }

    /// Mark the cached descriptor stale. Takes effect immediately, including
    /// for a resolve of the same key that is currently waiting on the ledger.
    pub fn invalidate(&self, key: ApplianceKey) {
        let slot = self.slot(key);
        let generation = slot.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut entry) = slot.entry.try_lock() {
            *entry = None;
        }
        tracing::debug!(%key, generation, "descriptor invalidated");
    }

    /// Fresh cached descriptor, without touching the ledger.
    pub fn cached(&self, key: ApplianceKey) -> Option<ApplianceDescriptor> {
        let slot = self.slot(key);
        let entry = slot.entry.try_lock().ok()?;
        entry
            .as_ref()
            .filter(|desc| desc.cache_version == slot.generation())
            .cloned()
    }
}
