use crate::{CursorStore, StoreResult};
use homechain_types::Cursor;
use std::sync::{Arc, PoisonError, RwLock};

/// In-memory cursor store. Clones share state, so a test can hand one clone
/// to the relay and inspect another.
#[derive(Clone, Debug, Default)]
pub struct MemCursorStore {
    current: Arc<RwLock<Option<Cursor>>>,
    history: Arc<RwLock<Vec<Cursor>>>,
}

impl MemCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cursor(cursor: Cursor) -> Self {
        let store = Self::new();
        *store.current.write().unwrap_or_else(PoisonError::into_inner) = Some(cursor);
        store
    }

    /// Every cursor saved so far, oldest first.
    pub fn history(&self) -> Vec<Cursor> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl CursorStore for MemCursorStore {
    fn load(&self) -> StoreResult<Option<Cursor>> {
        Ok(*self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn save(&self, cursor: &Cursor) -> StoreResult<()> {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(*cursor);
        self.history
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(*cursor);
        Ok(())
    }

    fn clear(&self) -> StoreResult<()> {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}
