//! Global CLI options.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use homechain_store::FsCursorStore;

/// Options shared by every command. Each can also be set via env vars.
#[derive(Args, Debug, Clone)]
pub struct GlobalOpts {
    /// Directory holding the persisted cursor (env: HOMECHAIN_STATE_DIR)
    #[arg(
        short = 's',
        long,
        global = true,
        env = "HOMECHAIN_STATE_DIR",
        default_value = ".homechain"
    )]
    pub state_dir: PathBuf,
}

impl GlobalOpts {
    pub fn open_store(&self) -> Result<FsCursorStore> {
        FsCursorStore::open(&self.state_dir)
            .with_context(|| format!("open state directory {}", self.state_dir.display()))
    }
}
