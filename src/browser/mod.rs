//! Browser session collaborator.
//!
//! The worker pool drives crawling through the narrow [`BrowserSession`]
//! contract: one browse of one page, returning extracted outlinks and
//! capture records, or failing with the recoverable / reached-limit / fatal
//! taxonomy. The production implementation drives headless Chrome over CDP;
//! tests substitute scripted sessions.

mod launch;
mod session;

pub use launch::{find_browser_executable, launch_browser};
pub use session::ChromiumSession;

use async_trait::async_trait;

use crate::config::WorkerConfig;
use crate::error::{CrawlError, Result};
use crate::frontier::CaptureQuery;
use crate::model::{Page, Site};

/// What one browse produced.
#[derive(Debug, Default)]
pub struct BrowseResult {
    /// Raw outlink URLs as found on the page; normalization and dedup
    /// happen in the frontier.
    pub outlinks: Vec<String>,
    pub captures: Vec<CaptureQuery>,
}

/// One browser instance browsing one page at a time.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Browse `page` in the context of `site` (proxy, credentials, behavior
    /// parameters). Fails with `ReachedLimit` when a site/page hard limit is
    /// hit during browsing, `RecoverableBrowse` for transient
    /// navigation/script trouble, `FatalBrowse` when the browser process is
    /// unusable.
    async fn browse(&self, site: &Site, page: &Page) -> Result<BrowseResult>;

    /// Tear down the underlying browser. Idempotent.
    async fn close(&self);
}

/// Creates sessions, letting a worker slot recycle its browser after a
/// fatal failure.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn BrowserSession>>;
}

/// Factory for real Chrome-backed sessions.
pub struct ChromiumSessionFactory {
    config: WorkerConfig,
}

impl ChromiumSessionFactory {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionFactory for ChromiumSessionFactory {
    async fn create(&self) -> Result<Box<dyn BrowserSession>> {
        let session = ChromiumSession::launch(&self.config)
            .await
            .map_err(|e| CrawlError::FatalBrowse(format!("browser launch failed: {e:#}")))?;
        Ok(Box::new(session))
    }
}
