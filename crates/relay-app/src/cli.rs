//! Command-line arguments.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use relay_proxy::{DEFAULT_CAPTURE_DEADLINE, DEFAULT_PROXY_PORT};
use relay_server::{DEFAULT_HOST, DEFAULT_PORT};

/// Relay - chat API gateway over captured provider sessions
#[derive(Parser, Debug)]
#[command(name = "relay", version, about)]
pub struct Args {
    /// Data directory (database, CA, browser profiles, logs)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Enable debug logging (also mirrors logs to stdout)
    #[arg(long, global = true)]
    pub debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP API server
    Serve(ServeArgs),

    /// Capture a provider session through a browser login
    Login(LoginArgs),

    /// Manage stored accounts
    #[command(subcommand)]
    Accounts(AccountsCommand),

    /// Manage the proxy root certificate
    #[command(subcommand)]
    Ca(CaCommand),
}

#[derive(ClapArgs, Debug)]
pub struct ServeArgs {
    /// Address to bind
    #[arg(long, default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port to bind
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// OpenAI-compatible upstream as `<provider>=<base_url>` (repeatable)
    #[arg(long = "upstream", value_parser = parse_upstream)]
    pub upstreams: Vec<Upstream>,
}

#[derive(ClapArgs, Debug)]
pub struct LoginArgs {
    /// Provider id the captured account belongs to
    #[arg(long)]
    pub provider: String,

    /// Login page opened in the browser (when the adapter supplies none)
    #[arg(long)]
    pub url: Option<String>,

    /// Host suffix whose request cookies are captured (repeatable)
    #[arg(long = "host")]
    pub hosts: Vec<String>,

    /// Cookie name that must be present for the session to count (repeatable)
    #[arg(long = "cookie")]
    pub cookies: Vec<String>,

    /// OpenAI-compatible upstream as `<provider>=<base_url>` (repeatable)
    #[arg(long = "upstream", value_parser = parse_upstream)]
    pub upstreams: Vec<Upstream>,

    /// Identity stored with the account
    #[arg(long)]
    pub email: Option<String>,

    /// Browser binary (default: first Chromium-family browser found)
    #[arg(long)]
    pub browser: Option<PathBuf>,

    /// Capture proxy port
    #[arg(long, default_value_t = DEFAULT_PROXY_PORT)]
    pub proxy_port: u16,

    /// Seconds to wait for a confirmed session
    #[arg(long, default_value_t = DEFAULT_CAPTURE_DEADLINE.as_secs())]
    pub timeout: u64,
}

#[derive(Subcommand, Debug)]
pub enum AccountsCommand {
    /// List stored accounts
    List {
        /// Only accounts of this provider
        #[arg(long)]
        provider: Option<String>,
    },

    /// Delete an account by id
    Delete { id: String },

    /// Reset usage counters on a running server
    ResetUsage {
        /// Base URL of the running server
        #[arg(long, default_value_t = default_server_url())]
        server: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum CaCommand {
    /// Print the root certificate path, generating it if needed
    Path,

    /// Delete and regenerate the root certificate and all leaf certificates
    Regenerate,

    /// Write the root certificate as DER for trust-store import
    Export {
        /// Destination file
        path: PathBuf,
    },
}

/// An OpenAI-compatible upstream registered at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub provider_id: String,
    pub base_url: String,
}

fn parse_upstream(value: &str) -> Result<Upstream, String> {
    let (provider_id, base_url) = value
        .split_once('=')
        .ok_or_else(|| format!("expected <provider>=<base_url>, got `{}`", value))?;
    if provider_id.is_empty() || base_url.is_empty() {
        return Err(format!("expected <provider>=<base_url>, got `{}`", value));
    }
    Ok(Upstream {
        provider_id: provider_id.to_string(),
        base_url: base_url.to_string(),
    })
}

fn default_server_url() -> String {
    format!("http://{}:{}", DEFAULT_HOST, DEFAULT_PORT)
}
