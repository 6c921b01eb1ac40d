//! Subcommand runners.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use relay_core::{
    Account, AdapterRegistry, CookieValidator, CredentialBus, CredentialValidator, LoginTarget,
    OpenAiCompatAdapter, TapRule, TapSource,
};
use relay_proxy::{
    BrowserSpawner, CaManager, CaptureConfig, CaptureOrchestrator, ChromiumBrowser, LoginRequest,
    ProxyConfig, ProxyEngine,
};
use relay_server::{AppState, Server, ServerConfig};
use relay_storage::Database;
use tracing::{info, warn};

use crate::cli::{AccountsCommand, CaCommand, LoginArgs, ServeArgs, Upstream};
use crate::paths::AppPaths;

/// Bus event the login taps publish cookie headers under.
pub const COOKIE_EVENT: &str = "cookies";

fn open_database(paths: &AppPaths) -> anyhow::Result<Database> {
    let db = Database::with_path(paths.db_path())
        .with_context(|| format!("opening database at {:?}", paths.db_path()))?;
    Ok(db)
}

/// Registry holding one OpenAI-compatible adapter per upstream.
pub fn build_registry(upstreams: &[Upstream]) -> AdapterRegistry {
    let registry = AdapterRegistry::new();
    for upstream in upstreams {
        info!(provider = %upstream.provider_id, "Registering OpenAI-compatible upstream");
        registry.register(Arc::new(OpenAiCompatAdapter::new(
            &upstream.provider_id,
            &upstream.base_url,
        )));
    }
    registry
}

/// `relay serve`
pub async fn serve(paths: &AppPaths, args: ServeArgs) -> anyhow::Result<()> {
    let db = open_database(paths)?;
    let registry = Arc::new(build_registry(&args.upstreams));
    if registry.is_empty() {
        warn!("No upstream adapters registered; chat requests will fail");
    }

    let state = AppState::with_database(db, registry)?;
    let config = ServerConfig::with_db_path(paths.db_path())
        .with_host(args.host)
        .with_port(args.port);
    let server = Server::with_state(config, state)?;

    println!("Relay API listening on http://{}", server.addr());
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

/// Capture recipe tapping request cookies on every `--host`.
fn cookie_login_target(args: &LoginArgs) -> anyhow::Result<LoginTarget> {
    let Some(url) = &args.url else {
        bail!("provider {} has no login target; pass --url and --host", args.provider);
    };
    if args.hosts.is_empty() {
        bail!("at least one --host is required to capture {}", args.provider);
    }
    Ok(LoginTarget {
        login_url: url.clone(),
        taps: args
            .hosts
            .iter()
            .map(|host| TapRule::new(host, COOKIE_EVENT, TapSource::RequestCookies))
            .collect(),
    })
}

fn cookie_validator(args: &LoginArgs) -> anyhow::Result<Arc<dyn CredentialValidator>> {
    if args.cookies.is_empty() {
        bail!("provider {} has no validator; pass --cookie", args.provider);
    }
    let mut validator = CookieValidator::new(args.cookies.iter().cloned());
    if let Some(email) = &args.email {
        validator = validator.with_email(email);
    }
    Ok(Arc::new(validator))
}

/// What a login captures and how artifacts are confirmed.
pub struct LoginPlan {
    pub target: LoginTarget,
    pub validator: Arc<dyn CredentialValidator>,
}

impl LoginPlan {
    /// Host suffixes the proxy must track for the taps to see bodies.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = Vec::new();
        for tap in &self.target.taps {
            if !hosts.contains(&tap.host_suffix) {
                hosts.push(tap.host_suffix.clone());
            }
        }
        hosts
    }
}

/// Resolves the provider's adapter and uses its login target and validator.
///
/// Whatever the adapter does not supply comes from the cookie flags.
pub fn login_plan(registry: &AdapterRegistry, args: &LoginArgs) -> anyhow::Result<LoginPlan> {
    let adapter = registry.get(&args.provider);

    let target = match adapter.as_ref().and_then(|a| a.login_target()) {
        Some(target) => {
            info!(provider = %args.provider, "Using adapter login target");
            target
        }
        None => cookie_login_target(args)?,
    };
    let validator = match adapter.as_ref().and_then(|a| a.validator()) {
        Some(validator) => validator,
        None => cookie_validator(args)?,
    };

    Ok(LoginPlan { target, validator })
}

/// `relay login`
pub async fn login(paths: &AppPaths, args: LoginArgs) -> anyhow::Result<()> {
    let db = open_database(paths)?;
    let registry = build_registry(&args.upstreams);
    let plan = login_plan(&registry, &args)?;

    let proxy = ProxyConfig::new(CaManager::new(paths.root()))
        .with_port(args.proxy_port)
        .with_tracked_hosts(plan.hosts());
    let engine = Arc::new(ProxyEngine::new(proxy));

    let browser: Arc<dyn BrowserSpawner> = match &args.browser {
        Some(binary) => Arc::new(ChromiumBrowser::with_binary(binary)),
        None => Arc::new(ChromiumBrowser::new()),
    };
    let capture = CaptureConfig::new(paths.profiles_dir())
        .with_deadline(Duration::from_secs(args.timeout));
    let orchestrator =
        CaptureOrchestrator::new(engine.clone(), CredentialBus::new(), browser, capture);

    let request = LoginRequest::from_target(&args.provider, &plan.target);
    println!("Complete the login in the browser window (timeout {}s)", args.timeout);

    let outcome = orchestrator.login(&request, plan.validator).await;
    engine.stop().await;
    let outcome = outcome.context("capture failed")?;

    let email = args.email.unwrap_or(outcome.email);
    let account = db.save_captured_account(&args.provider, &email, outcome.credential)?;
    println!("Saved account {} ({})", account.id, account.email);
    Ok(())
}

/// One line of `relay accounts list`. Credentials are never printed.
pub fn format_account(account: &Account) -> String {
    format!(
        "{}  {:<12}  {:<32}  {}",
        account.id,
        account.provider_id,
        account.email,
        account.updated_at.format("%Y-%m-%d %H:%M")
    )
}

/// `relay accounts ...`
pub async fn accounts(paths: &AppPaths, command: AccountsCommand) -> anyhow::Result<()> {
    match command {
        AccountsCommand::List { provider } => {
            let db = open_database(paths)?;
            let accounts = db.list_accounts(provider.as_deref())?;
            if accounts.is_empty() {
                println!("No accounts");
            }
            for account in &accounts {
                println!("{}", format_account(account));
            }
        }
        AccountsCommand::Delete { id } => {
            let db = open_database(paths)?;
            if !db.delete_account(&id)? {
                bail!("account {} not found", id);
            }
            println!("Deleted account {}", id);
        }
        AccountsCommand::ResetUsage { server } => {
            // Counters live in the server process.
            let url = format!("{}/api/accounts/usage/reset", server.trim_end_matches('/'));
            reqwest::Client::new()
                .post(&url)
                .send()
                .await
                .with_context(|| format!("contacting {}", server))?
                .error_for_status()?;
            println!("Usage counters reset");
        }
    }
    Ok(())
}

/// `relay ca ...`
pub fn ca(paths: &AppPaths, command: CaCommand) -> anyhow::Result<()> {
    let ca = CaManager::new(paths.root());
    match command {
        CaCommand::Path => {
            let ca_paths = ca.ensure_certificates()?;
            println!("{}", ca_paths.cert_path.display());
        }
        CaCommand::Regenerate => {
            ca.delete()?;
            let ca_paths = ca.ensure_certificates()?;
            info!("Regenerated root certificate");
            println!("{}", ca_paths.cert_path.display());
        }
        CaCommand::Export { path } => {
            ca.ensure_certificates()?;
            std::fs::write(&path, ca.read_cert_der()?)
                .with_context(|| format!("writing {:?}", path))?;
            println!("{}", path.display());
        }
    }
    Ok(())
}
