//! Relay - chat API gateway over captured provider sessions.
//!
//! This crate provides the `relay` binary's building blocks:
//!
//! - Command-line parsing
//! - Logging initialization with daily file rotation
//! - Data directory layout
//! - Subcommand runners (`serve`, `login`, `accounts`, `ca`)

pub mod cli;
pub mod commands;
pub mod logging;
pub mod paths;

pub use cli::{Args, Command};
pub use paths::AppPaths;
