mod commands;
mod opts;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use commands::cursor::CursorSetArgs;
use commands::run::RunArgs;
use opts::GlobalOpts;

#[derive(Parser, Debug)]
#[command(name = "homechain", version, about = "Ledger-to-actuator relay")]
struct Cli {
    #[command(flatten)]
    opts: GlobalOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay until Ctrl-C or SIGTERM
    Run(RunArgs),

    /// Inspect or edit the persisted ledger cursor
    #[command(subcommand)]
    Cursor(CursorCommand),
}

#[derive(Subcommand, Debug)]
enum CursorCommand {
    /// Print the persisted cursor as JSON
    Show,

    /// Overwrite the persisted cursor
    Set(CursorSetArgs),

    /// Remove the persisted cursor; the next run starts from genesis
    Clear,
}

fn load_dotenv() -> Result<()> {
    match dotenvy::dotenv() {
        Ok(_) => Ok(()),
        Err(err) if err.not_found() => Ok(()),
        Err(err) => Err(err).context("load .env"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv()?;
    let cli = Cli::parse();
    let opts = &cli.opts;

    match cli.command {
        Command::Run(args) => commands::run::cmd_run(opts, &args).await,
        Command::Cursor(cmd) => match cmd {
            CursorCommand::Show => commands::cursor::cmd_show(opts),
            CursorCommand::Set(args) => commands::cursor::cmd_set(opts, &args),
            CursorCommand::Clear => commands::cursor::cmd_clear(opts),
        },
    }
}
