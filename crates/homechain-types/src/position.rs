use serde::{Deserialize, Serialize};
use std::fmt;

/// Globally comparable location of an event in the ledger.
///
/// Derived `Ord` compares `(block_height, log_index)` lexicographically, which
/// is the ledger's own emission order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub block_height: u64,
    pub log_index: u32,
}

impl Position {
    pub fn new(block_height: u64, log_index: u32) -> Self {
        Self {
            block_height,
            log_index,
        }
    }

    /// Position covering every event in `block_height`.
    pub fn end_of_block(block_height: u64) -> Self {
        Self::new(block_height, u32::MAX)
    }

    /// Position immediately before the first event of `block_height`.
    ///
    /// Returns `None` for block 0, meaning "nothing processed yet".
    pub fn before_block(block_height: u64) -> Option<Self> {
        block_height.checked_sub(1).map(Self::end_of_block)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block_height, self.log_index)
    }
}

/// Durable pointer to the last fully processed ledger position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Cursor {
    pub last_block_height: u64,
    pub last_log_index: u32,
}

impl Cursor {
    pub fn position(&self) -> Position {
        Position::new(self.last_block_height, self.last_log_index)
    }
}

impl From<Position> for Cursor {
    fn from(pos: Position) -> Self {
        Self {
            last_block_height: pos.block_height,
            last_log_index: pos.log_index,
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.position().fmt(f)
    }
}
