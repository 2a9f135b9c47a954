use crate::{CursorStore, StoreError, StoreResult, io_error};
use homechain_types::Cursor;
use std::{
    fmt,
    fs::{self, File},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

/// File name of the persisted cursor inside the state directory.
pub const CURSOR_FILE: &str = "cursor.json";

/// Filesystem-backed cursor stored as `<state_dir>/cursor.json`.
///
/// Writes go to a sibling temp file which is synced and renamed over the
/// cursor, so a crash leaves either the old or the new cursor on disk.
#[derive(Clone)]
pub struct FsCursorStore {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl fmt::Debug for FsCursorStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsCursorStore")
            .field("path", &self.path)
            .finish()
    }
}

impl FsCursorStore {
    pub fn open(state_dir: impl AsRef<Path>) -> StoreResult<Self> {
        let state_dir = state_dir.as_ref();
        fs::create_dir_all(state_dir).map_err(|e| io_error(state_dir, e))?;
        Ok(Self {
            path: state_dir.join(CURSOR_FILE),
            tmp_path: state_dir.join(format!("{CURSOR_FILE}.tmp")),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CursorStore for FsCursorStore {
    fn load(&self) -> StoreResult<Option<Cursor>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(&self.path, err)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                path: self.path.clone(),
                source,
            })
    }

    fn save(&self, cursor: &Cursor) -> StoreResult<()> {
        let bytes = serde_json::to_vec(cursor)?;
        let mut file = File::create(&self.tmp_path).map_err(|e| io_error(&self.tmp_path, e))?;
        file.write_all(&bytes)
            .map_err(|e| io_error(&self.tmp_path, e))?;
        file.sync_all().map_err(|e| io_error(&self.tmp_path, e))?;
        fs::rename(&self.tmp_path, &self.path).map_err(|e| io_error(&self.path, e))?;
        tracing::trace!(cursor = %cursor, "cursor persisted");
        Ok(())
    }

    fn clear(&self) -> StoreResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(&self.path, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homechain_types::Position;
    use tempfile::TempDir;

    #[test]
    fn missing_cursor_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = FsCursorStore::open(dir.path()).unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn save_then_reopen_returns_latest_cursor() {
        let dir = TempDir::new().unwrap();
        {
            let store = FsCursorStore::open(dir.path()).unwrap();
            store.save(&Cursor::from(Position::new(10, 2))).unwrap();
            store.save(&Cursor::from(Position::new(11, 0))).unwrap();
        }
        let reopened = FsCursorStore::open(dir.path()).unwrap();
        assert_eq!(
            reopened.load().unwrap(),
            Some(Cursor::from(Position::new(11, 0)))
        );
        assert!(!dir.path().join("cursor.json.tmp").exists());
    }

    #[test]
    fn corrupt_cursor_is_an_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CURSOR_FILE), b"{\"lastBlockHeight\":\"nope\"}").unwrap();
        let store = FsCursorStore::open(dir.path()).unwrap();
        assert!(matches!(store.load(), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn clear_removes_cursor_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = FsCursorStore::open(dir.path()).unwrap();
        store.save(&Cursor::from(Position::new(1, 1))).unwrap();
        store.clear().unwrap();
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }
}
