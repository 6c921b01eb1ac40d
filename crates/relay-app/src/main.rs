//! Relay - chat API gateway over captured provider sessions.
//!
//! This is the main binary:
//! - `relay serve` runs the HTTP API server
//! - `relay login` captures a provider session through the MITM proxy
//! - `relay accounts` and `relay ca` manage stored state

use std::panic;

use clap::Parser;
use relay_app::logging::init_logging;
use relay_app::{commands, AppPaths, Args, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let paths = AppPaths::resolve(args.data_dir.clone())?;

    // Keep the guard alive for the duration of the program.
    let _log_guard = init_logging(&paths.logs_dir(), &args.log_level, args.debug);

    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        tracing::error!("PANIC: {}", panic_info);
        default_hook(panic_info);
    }));

    tracing::debug!("Args: {:?}", args);
    tracing::info!("Data directory: {:?}", paths.root());

    match args.command {
        Command::Serve(serve) => commands::serve(&paths, serve).await,
        Command::Login(login) => commands::login(&paths, login).await,
        Command::Accounts(command) => commands::accounts(&paths, command).await,
        Command::Ca(command) => commands::ca(&paths, command),
    }
}
