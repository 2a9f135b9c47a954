//! Durable cursor storage with filesystem and in-memory backends.

mod fs_store;
mod mem_store;

pub use fs_store::{CURSOR_FILE, FsCursorStore};
pub use mem_store::MemCursorStore;

use homechain_types::Cursor;
use std::{io, path::PathBuf, sync::Arc};

pub type StoreResult<T> = Result<T, StoreError>;
pub type DynCursorStore = Arc<dyn CursorStore>;

/// Singleton record of the last fully processed ledger position.
pub trait CursorStore: Send + Sync {
    /// Returns `None` when no cursor has been persisted yet.
    fn load(&self) -> StoreResult<Option<Cursor>>;
    fn save(&self, cursor: &Cursor) -> StoreResult<()>;
    fn clear(&self) -> StoreResult<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("persisted cursor at {path:?} is malformed: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encode cursor: {0}")]
    Encode(#[from] serde_json::Error),
}

pub(crate) fn io_error(path: impl Into<PathBuf>, err: io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source: err,
    }
}
