//! Chrome/Chromium discovery and launch.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::fetcher::{BrowserFetcher, BrowserFetcherOptions};
use futures::StreamExt;
use tokio::task::{self, JoinHandle};
use tracing::{error, info, trace, warn};

/// Find a Chrome/Chromium executable: `CHROMIUM_PATH` override first, then
/// well-known install paths per platform, then `which`.
pub async fn find_browser_executable() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CHROMIUM_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            info!("using browser from CHROMIUM_PATH: {}", path.display());
            return Ok(path);
        }
        warn!(
            "CHROMIUM_PATH points to non-existent file: {}",
            path.display()
        );
    }

    let paths = if cfg!(target_os = "macos") {
        vec![
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/opt/homebrew/bin/chromium",
        ]
    } else {
        vec![
            "/usr/bin/chromium-browser",
            "/usr/bin/chromium",
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/snap/bin/chromium",
            "/usr/local/bin/chromium",
            "/opt/google/chrome/chrome",
        ]
    };

    for path_str in paths {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("found browser at: {}", path.display());
            return Ok(path);
        }
    }

    for cmd in &[
        "chromium-browser",
        "chromium",
        "google-chrome",
        "google-chrome-stable",
    ] {
        let output = Command::new("which").arg(cmd).output();
        if let Ok(output) = output {
            if output.status.success() {
                let path_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path_str.is_empty() {
                    let path = PathBuf::from(path_str);
                    info!("found browser via 'which': {}", path.display());
                    return Ok(path);
                }
            }
        }
    }

    Err(anyhow::anyhow!("Chrome/Chromium executable not found"))
}

/// Download a managed Chromium when no system browser exists.
async fn download_managed_browser() -> Result<PathBuf> {
    info!("no system browser found, downloading managed Chromium");

    let cache_dir = dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("skitter")
        .join("chromium");
    std::fs::create_dir_all(&cache_dir).context("failed to create browser cache directory")?;

    let fetcher = BrowserFetcher::new(
        BrowserFetcherOptions::builder()
            .with_path(&cache_dir)
            .build()
            .context("failed to build fetcher options")?,
    );
    let revision_info = fetcher.fetch().await.context("failed to fetch browser")?;

    info!(
        "downloaded Chromium to {}",
        revision_info.folder_path.display()
    );
    Ok(revision_info.executable_path)
}

/// Launch one browser instance with an isolated profile directory.
///
/// Returns the browser, the CDP handler task, and the profile directory
/// (cleaned up by the caller when the session closes).
pub async fn launch_browser(
    headless: bool,
    chrome_exe: Option<PathBuf>,
    proxy: Option<&str>,
) -> Result<(Browser, JoinHandle<()>, PathBuf)> {
    let chrome_path = match chrome_exe {
        Some(path) => path,
        None => match find_browser_executable().await {
            Ok(path) => path,
            Err(_) => download_managed_browser().await?,
        },
    };

    // Unique profile per session prevents lock contention when several
    // slots launch at once.
    let user_data_dir = std::env::temp_dir().join(format!(
        "skitter_chrome_{}_{}",
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    ));
    std::fs::create_dir_all(&user_data_dir).context("failed to create user data directory")?;

    let mut config_builder = BrowserConfigBuilder::default()
        .request_timeout(Duration::from_secs(30))
        .window_size(1366, 768)
        .user_data_dir(user_data_dir.clone())
        .chrome_executable(chrome_path);

    if headless {
        config_builder = config_builder.headless_mode(HeadlessMode::default());
    } else {
        config_builder = config_builder.with_head();
    }

    if let Some(proxy) = proxy {
        config_builder = config_builder
            .arg(format!("--proxy-server={proxy}"))
            // The archival proxy re-signs TLS.
            .arg("--ignore-certificate-errors");
    }

    config_builder = config_builder
        .arg("--disable-background-networking")
        .arg("--disable-breakpad")
        .arg("--disable-hang-monitor")
        .arg("--disable-notifications")
        .arg("--disable-prompt-on-repost")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--metrics-recording-only")
        .arg("--mute-audio")
        .arg("--hide-scrollbars");

    let browser_config = config_builder
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))?;

    let (browser, mut handler) = Browser::launch(browser_config)
        .await
        .context("failed to launch browser")?;

    let handler_task = task::spawn(async move {
        while let Some(h) = handler.next().await {
            if let Err(e) = h {
                let msg = e.to_string();
                // Chrome sends CDP events chromiumoxide doesn't recognize;
                // those deserialization failures are noise, not errors.
                let benign = msg.contains("data did not match any variant of untagged enum Message")
                    || msg.contains("Failed to deserialize WS response");
                if benign {
                    trace!("suppressed benign CDP serialization error: {msg}");
                } else {
                    error!("browser handler error: {e:?}");
                }
            }
        }
        trace!("browser handler task completed");
    });

    Ok((browser, handler_task, user_data_dir))
}
