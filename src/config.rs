//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for one worker process and its pool of browser slots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Path to the frontier database file.
    pub db_path: PathBuf,

    /// Max browser instances simultaneously browsing pages; one slot each.
    pub max_browsers: usize,

    /// How long a claim stays valid without release. Claims older than this
    /// are reclaimed by the stale sweep, so a crashed worker's work becomes
    /// claimable again. Default: 180 seconds.
    pub lease_timeout: Duration,

    /// Recoverable failures tolerated per page before it is marked
    /// permanently failed. Default: 2.
    pub max_page_retries: i64,

    /// Idle polling bounds when no site/page is claimable. The slot sleeps
    /// a jittered duration inside these bounds, waking early on shutdown.
    pub min_idle_backoff: Duration,
    pub max_idle_backoff: Duration,

    /// Interval between stale-claim sweeps.
    pub reclaim_interval: Duration,

    pub headless: bool,

    /// Override for the Chrome/Chromium executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chrome_exe: Option<PathBuf>,

    /// HTTP proxy passed to every browser instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,

    /// Seconds allowed for page navigation and for the load to settle.
    pub page_load_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("skitter.sqlite"),
            max_browsers: 1,
            lease_timeout: Duration::from_secs(180),
            max_page_retries: 2,
            min_idle_backoff: Duration::from_millis(500),
            max_idle_backoff: Duration::from_secs(10),
            reclaim_interval: Duration::from_secs(60),
            headless: true,
            chrome_exe: None,
            proxy: None,
            page_load_timeout_secs: 30,
        }
    }
}

impl WorkerConfig {
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    pub fn with_max_browsers(mut self, n: usize) -> Self {
        self.max_browsers = n.max(1);
        self
    }

    pub fn with_lease_timeout(mut self, lease: Duration) -> Self {
        self.lease_timeout = lease;
        self
    }

    pub fn with_max_page_retries(mut self, retries: i64) -> Self {
        self.max_page_retries = retries;
        self
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_documented_values() {
        let config = WorkerConfig::default();
        assert_eq!(config.lease_timeout, Duration::from_secs(180));
        assert_eq!(config.max_page_retries, 2);
        assert_eq!(config.max_browsers, 1);
    }

    #[test]
    fn max_browsers_floor_is_one() {
        let config = WorkerConfig::default().with_max_browsers(0);
        assert_eq!(config.max_browsers, 1);
    }
}
