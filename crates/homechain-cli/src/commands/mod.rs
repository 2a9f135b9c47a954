//! CLI command handlers.

pub mod cursor;
pub mod run;
