//! Capture orchestrator: drives a throwaway browser through the proxy until a
//! provider validator confirms a credential.
//!
//! A session owns, for its whole lifetime, a fresh browser profile directory,
//! a set of taps on the proxy and a bus subscription. All three are released
//! on every exit path, including cancellation of the `login` future.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use relay_core::{
    CaptureOutcome, CapturedArtifact, CredentialBus, CredentialValidator, LoginTarget, TapRule,
    ValidationResult,
};
use tokio::process::Child;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;

use crate::browser::{BrowserLaunch, BrowserSpawner};
use crate::error::CaptureError;
use crate::handler::is_tracked_host;
use crate::hooks::HookId;
use crate::proxy::ProxyEngine;
use crate::tap::CaptureTap;

/// Default time allowed for a user to complete a login.
pub const DEFAULT_CAPTURE_DEADLINE: Duration = Duration::from_secs(180);

/// Capture session settings.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Whole-session deadline.
    pub deadline: Duration,
    /// Parent of the per-partition browser profiles.
    pub profiles_root: PathBuf,
}

impl CaptureConfig {
    pub fn new(profiles_root: impl Into<PathBuf>) -> Self {
        Self {
            deadline: DEFAULT_CAPTURE_DEADLINE,
            profiles_root: profiles_root.into(),
        }
    }

    /// Uses `profiles/` under the default Relay data directory.
    pub fn with_default_dir() -> Result<Self, CaptureError> {
        let project_dirs = directories::ProjectDirs::from("com", "relay", "Relay").ok_or_else(|| {
            CaptureError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "Failed to get project dirs",
            ))
        })?;
        Ok(Self::new(project_dirs.data_dir().join("profiles")))
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

/// One login to run.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub provider_id: String,
    pub login_url: String,
    /// Names the browser profile directory.
    pub partition: String,
    pub taps: Vec<TapRule>,
    /// Bus events to validate. Empty means every event the taps publish.
    pub events: Vec<String>,
}

impl LoginRequest {
    /// Builds a request from a provider's capture recipe, partitioned by provider.
    pub fn from_target(provider_id: impl Into<String>, target: &LoginTarget) -> Self {
        let provider_id = provider_id.into();
        Self {
            partition: provider_id.clone(),
            provider_id,
            login_url: target.login_url.clone(),
            taps: target.taps.clone(),
            events: target.events(),
        }
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    fn event_names(&self) -> Vec<String> {
        if !self.events.is_empty() {
            return self.events.clone();
        }
        LoginTarget {
            login_url: self.login_url.clone(),
            taps: self.taps.clone(),
        }
        .events()
    }
}

/// Browser profile directory, recreated empty on creation and removed on drop.
struct ProfileDir {
    path: PathBuf,
}

impl ProfileDir {
    fn create(path: PathBuf) -> io::Result<Self> {
        remove_dir_if_exists(&path)?;
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }
}

impl Drop for ProfileDir {
    fn drop(&mut self) {
        if let Err(e) = remove_dir_if_exists(&self.path) {
            tracing::warn!("Failed to remove browser profile {:?}: {}", self.path, e);
        }
    }
}

fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Removes a session's taps from the proxy when dropped.
struct InstalledTap<'a> {
    engine: &'a ProxyEngine,
    id: HookId,
}

impl Drop for InstalledTap<'_> {
    fn drop(&mut self) {
        self.engine.remove_hook(self.id);
    }
}

/// Directory-safe form of a partition name.
fn partition_dir_name(partition: &str) -> String {
    let name: String = partition
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() {
        "default".to_string()
    } else {
        name
    }
}

/// Runs capture sessions, one at a time, against a shared proxy engine.
pub struct CaptureOrchestrator {
    engine: Arc<ProxyEngine>,
    bus: CredentialBus,
    browser: Arc<dyn BrowserSpawner>,
    config: CaptureConfig,
    active: Mutex<()>,
}

impl std::fmt::Debug for CaptureOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureOrchestrator")
            .field("engine", &self.engine)
            .field("config", &self.config)
            .finish()
    }
}

impl CaptureOrchestrator {
    pub fn new(
        engine: Arc<ProxyEngine>,
        bus: CredentialBus,
        browser: Arc<dyn BrowserSpawner>,
        config: CaptureConfig,
    ) -> Self {
        Self {
            engine,
            bus,
            browser,
            config,
            active: Mutex::new(()),
        }
    }

    pub fn engine(&self) -> &Arc<ProxyEngine> {
        &self.engine
    }

    pub fn bus(&self) -> &CredentialBus {
        &self.bus
    }

    /// Profile directory used for `partition`.
    pub fn profile_path(&self, partition: &str) -> PathBuf {
        self.config.profiles_root.join(partition_dir_name(partition))
    }

    /// Runs one login and returns the confirmed identity.
    ///
    /// Fails with [`CaptureError::Busy`] if another session is running.
    pub async fn login(
        &self,
        request: &LoginRequest,
        validator: Arc<dyn CredentialValidator>,
    ) -> Result<CaptureOutcome, CaptureError> {
        let _active = self.active.try_lock().map_err(|_| CaptureError::Busy)?;

        tracing::info!(provider = %request.provider_id, "Starting capture session");

        let profile = ProfileDir::create(self.profile_path(&request.partition))?;
        let proxy_addr = self.engine.start().await?;

        let tap = CaptureTap::new(self.bus.clone(), request.taps.clone());
        let tracked = &self.engine.config().tracked_hosts;
        for host in tap.hosts() {
            if !is_tracked_host(tracked, &host) {
                tracing::warn!(host = %host, "Tap host is not tracked by the proxy; bodies will not be seen");
            }
        }
        let _tap = InstalledTap {
            engine: &self.engine,
            id: self.engine.add_hook(Arc::new(tap)),
        };

        let events = request.event_names();
        let (subscription, mut artifacts) = self.bus.subscribe(&events);
        tracing::debug!(
            events = ?subscription.event_names().collect::<Vec<_>>(),
            "Listening for captured artifacts"
        );

        let mut child = self.browser.spawn(&BrowserLaunch {
            proxy_addr,
            profile_dir: &profile.path,
            url: &request.login_url,
        })?;

        let outcome = tokio::time::timeout(
            self.config.deadline,
            watch(&mut child, &mut artifacts, &events, validator.as_ref()),
        )
        .await
        .unwrap_or(Err(CaptureError::Timeout(self.config.deadline)));

        // The browser must be gone before its profile is deleted.
        if let Err(e) = child.kill().await {
            tracing::debug!("Browser already exited: {}", e);
        }

        match &outcome {
            Ok(_) => tracing::info!(provider = %request.provider_id, "Capture confirmed"),
            Err(e) => tracing::warn!(provider = %request.provider_id, "Capture failed: {}", e),
        }
        outcome
    }
}

/// Validates artifacts until one is confirmed or the browser exits.
async fn watch(
    child: &mut Child,
    artifacts: &mut UnboundedReceiver<CapturedArtifact>,
    events: &[String],
    validator: &dyn CredentialValidator,
) -> Result<CaptureOutcome, CaptureError> {
    let mut latest: HashMap<String, CapturedArtifact> = HashMap::new();

    loop {
        tokio::select! {
            biased;

            Some(artifact) = artifacts.recv() => {
                match validator.validate(&artifact).await {
                    ValidationResult::Confirmed(outcome) => return Ok(outcome),
                    ValidationResult::Rejected(reason) => {
                        tracing::debug!(event = %artifact.event_name, "Artifact rejected: {}", reason);
                    }
                }
                latest.insert(artifact.event_name.clone(), artifact);
            }

            status = child.wait() => {
                tracing::info!("Browser exited ({:?}), running final validation", status);
                while let Ok(artifact) = artifacts.try_recv() {
                    latest.insert(artifact.event_name.clone(), artifact);
                }
                for event in events {
                    let Some(artifact) = latest.get(event) else { continue };
                    if let ValidationResult::Confirmed(outcome) = validator.validate(artifact).await {
                        return Ok(outcome);
                    }
                }
                return Err(CaptureError::BrowserExited);
            }
        }
    }
}
