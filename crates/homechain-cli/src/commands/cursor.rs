//! `homechain cursor` commands.

use anyhow::Result;
use clap::Args;
use homechain_store::CursorStore;
use homechain_types::{Cursor, Position};

use crate::opts::GlobalOpts;

#[derive(Args, Debug)]
pub struct CursorSetArgs {
    /// Block height of the last fully processed event
    #[arg(long)]
    pub height: u64,

    /// Log index within that block (defaults to the end of the block)
    #[arg(long = "log-index")]
    pub log_index: Option<u32>,
}

pub fn cmd_show(opts: &GlobalOpts) -> Result<()> {
    let store = opts.open_store()?;
    let cursor = store.load()?;
    println!("{}", serde_json::to_string_pretty(&cursor)?);
    Ok(())
}

pub fn cmd_set(opts: &GlobalOpts, args: &CursorSetArgs) -> Result<()> {
    let store = opts.open_store()?;
    let position = match args.log_index {
        Some(index) => Position::new(args.height, index),
        None => Position::end_of_block(args.height),
    };
    let cursor = Cursor::from(position);
    store.save(&cursor)?;
    println!("{}", serde_json::to_string_pretty(&cursor)?);
    Ok(())
}

pub fn cmd_clear(opts: &GlobalOpts) -> Result<()> {
    let store = opts.open_store()?;
    store.clear()?;
    eprintln!("notice: cursor cleared; the next run starts from genesis");
    Ok(())
}
