//! System browser launching for capture sessions.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::error::CaptureError;

/// Executable names tried, in order, when no browser binary is configured.
const CANDIDATES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chrome",
    "chromium",
    "chromium-browser",
    "microsoft-edge",
    "msedge",
    "brave-browser",
    "brave",
];

#[cfg(target_os = "macos")]
const APP_BUNDLES: &[&str] = &[
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge",
    "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
];

#[cfg(not(target_os = "macos"))]
const APP_BUNDLES: &[&str] = &[];

/// Everything a browser needs to run one capture session.
#[derive(Debug, Clone)]
pub struct BrowserLaunch<'a> {
    pub proxy_addr: SocketAddr,
    pub profile_dir: &'a Path,
    pub url: &'a str,
}

/// Starts a browser process routed through the proxy.
///
/// The returned child must be killed by the caller; it is also killed when
/// dropped.
pub trait BrowserSpawner: Send + Sync {
    fn spawn(&self, launch: &BrowserLaunch<'_>) -> Result<Child, CaptureError>;
}

/// Chromium-family browser (Chrome, Chromium, Edge, Brave).
#[derive(Debug, Clone, Default)]
pub struct ChromiumBrowser {
    binary: Option<PathBuf>,
}

impl ChromiumBrowser {
    /// Uses the first Chromium-family browser found on the system.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses an explicit browser binary.
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: Some(binary.into()),
        }
    }

    /// Finds an installed Chromium-family browser.
    pub fn discover() -> Option<PathBuf> {
        CANDIDATES
            .iter()
            .find_map(|name| which::which(name).ok())
            .or_else(|| {
                APP_BUNDLES
                    .iter()
                    .map(PathBuf::from)
                    .find(|path| path.exists())
            })
    }

    /// Command-line flags for one session.
    pub fn args(launch: &BrowserLaunch<'_>) -> Vec<String> {
        vec![
            format!("--proxy-server=http://{}", launch.proxy_addr),
            format!("--user-data-dir={}", launch.profile_dir.display()),
            "--ignore-certificate-errors".to_string(),
            "--no-first-run".to_string(),
            "--no-default-browser-check".to_string(),
            launch.url.to_string(),
        ]
    }
}

impl BrowserSpawner for ChromiumBrowser {
    fn spawn(&self, launch: &BrowserLaunch<'_>) -> Result<Child, CaptureError> {
        let binary = match &self.binary {
            Some(binary) => binary.clone(),
            None => Self::discover()
                .ok_or_else(|| CaptureError::Spawn("no Chromium-based browser found".into()))?,
        };

        tracing::info!("Launching browser {:?} for {}", binary, launch.url);

        Command::new(&binary)
            .args(Self::args(launch))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CaptureError::Spawn(format!("{}: {}", binary.display(), e)))
    }
}
