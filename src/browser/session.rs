//! Chrome-backed browse of a single page.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::network::EventResponseReceived;
use chromiumoxide::Page as CdpPage;
use chrono::Utc;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::launch::launch_browser;
use super::{BrowseResult, BrowserSession};
use crate::config::WorkerConfig;
use crate::error::{CrawlError, Result};
use crate::frontier::CaptureQuery;
use crate::model::{Page, Site};
use crate::surt;

/// Collect every anchor href on the page, as absolute URLs.
const OUTLINKS_SCRIPT: &str = r"
    Array.from(document.querySelectorAll('a[href]'))
        .map(a => a.href)
        .filter(h => typeof h === 'string' && h.length > 0)
";

/// Simple built-in behavior: scroll to the bottom so lazy-loaded content and
/// links materialize before extraction.
const SCROLL_BEHAVIOR_SCRIPT: &str = r"
    new Promise(resolve => {
        let scrolls = 0;
        const timer = setInterval(() => {
            window.scrollBy(0, window.innerHeight);
            scrolls += 1;
            if (scrolls >= 20 ||
                window.scrollY + window.innerHeight >= document.body.scrollHeight) {
                clearInterval(timer);
                resolve(true);
            }
        }, 100);
    })
";

/// The archival proxy answers 420 when a site/page hard limit is hit
/// mid-crawl; the worker treats that as the site's clean end, not an error.
const STATUS_REACHED_LIMIT: i64 = 420;

/// Recorded in a capture when no response event for the main document was
/// observed; a real status is never invented.
const STATUS_UNKNOWN: i64 = 0;

async fn with_timeout<F, T>(operation: F, timeout_secs: u64, what: &str) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(Duration::from_secs(timeout_secs), operation).await {
        Ok(result) => result,
        Err(_) => Err(CrawlError::RecoverableBrowse(format!(
            "{what} timeout after {timeout_secs}s"
        ))),
    }
}

/// One headless Chrome instance, browsing one page at a time.
pub struct ChromiumSession {
    browser: Mutex<Option<Browser>>,
    handler_task: Mutex<Option<JoinHandle<()>>>,
    user_data_dir: PathBuf,
    page_load_timeout_secs: u64,
}

impl ChromiumSession {
    /// Launch a browser for this session, honoring the worker's proxy and
    /// executable settings.
    pub async fn launch(config: &WorkerConfig) -> anyhow::Result<Self> {
        let (browser, handler_task, user_data_dir) = launch_browser(
            config.headless,
            config.chrome_exe.clone(),
            config.proxy.as_deref(),
        )
        .await?;

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            handler_task: Mutex::new(Some(handler_task)),
            user_data_dir,
            page_load_timeout_secs: config.page_load_timeout_secs,
        })
    }

    async fn new_tab(&self) -> Result<CdpPage> {
        let guard = self.browser.lock().await;
        let browser = guard
            .as_ref()
            .ok_or_else(|| CrawlError::FatalBrowse("browser already closed".to_string()))?;
        browser
            .new_page("about:blank")
            .await
            .map_err(|e| CrawlError::FatalBrowse(format!("failed to open tab: {e}")))
    }

    async fn browse_in_tab(
        &self,
        tab: &CdpPage,
        site: &Site,
        page: &Page,
    ) -> Result<BrowseResult> {
        // Listen for the main-document response before navigating, so the
        // HTTP status (and the proxy's 420 limit signal) is observable.
        let mut responses = tab
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(|e| CrawlError::RecoverableBrowse(format!("event listener: {e}")))?;

        let timeout_secs = self.page_load_timeout_secs;

        with_timeout(
            async {
                tab.goto(page.url.as_str())
                    .await
                    .map_err(|e| CrawlError::RecoverableBrowse(format!("navigation: {e}")))?;
                Ok(())
            },
            timeout_secs,
            "page navigation",
        )
        .await?;

        with_timeout(
            async {
                tab.wait_for_navigation()
                    .await
                    .map_err(|e| CrawlError::RecoverableBrowse(format!("page load: {e}")))?;
                Ok(())
            },
            timeout_secs,
            "page load",
        )
        .await?;

        // Drain response events briefly to find the main document's status.
        let (status, mimetype) = main_document_response(&mut responses, &page.url).await;
        if status == Some(STATUS_REACHED_LIMIT) {
            return Err(CrawlError::ReachedLimit(format!(
                "proxy signaled limit reached for {}",
                page.url
            )));
        }

        self.run_behavior(tab, site).await;

        let outlinks = self.extract_outlinks(tab).await?;

        let content = tab
            .content()
            .await
            .map_err(|e| CrawlError::RecoverableBrowse(format!("content: {e}")))?;
        let digest = hex::encode(Sha256::digest(content.as_bytes()));

        let canon_surt = surt::canonical_surt(&page.url)?;
        let capture = CaptureQuery {
            url: page.url.clone(),
            canon_surt,
            timestamp: Utc::now(),
            content_digest: digest,
            http_status: status.unwrap_or(STATUS_UNKNOWN),
            mimetype,
        };

        debug!(
            url = %page.url,
            outlinks = outlinks.len(),
            status = ?status,
            "browsed page"
        );

        Ok(BrowseResult {
            outlinks,
            captures: vec![capture],
        })
    }

    /// Run the site's javascript behavior. The built-in scroll behavior runs
    /// unless the site's parameters disable it; behavior failures don't fail
    /// the browse, the page content is still worth keeping.
    async fn run_behavior(&self, tab: &CdpPage, site: &Site) {
        let scroll_enabled = site
            .conf
            .behavior_parameters
            .as_ref()
            .and_then(|p| p.get("scroll"))
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        if !scroll_enabled {
            return;
        }
        if let Err(e) = tokio::time::timeout(
            Duration::from_secs(10),
            tab.evaluate(SCROLL_BEHAVIOR_SCRIPT),
        )
        .await
        {
            debug!(seed = %site.seed, "behavior script timed out: {e}");
        }
    }

    async fn extract_outlinks(&self, tab: &CdpPage) -> Result<Vec<String>> {
        let result = tab
            .evaluate(OUTLINKS_SCRIPT)
            .await
            .map_err(|e| CrawlError::RecoverableBrowse(format!("outlink extraction: {e}")))?;
        let outlinks: Vec<String> = result
            .into_value()
            .map_err(|e| CrawlError::RecoverableBrowse(format!("outlink parse: {e}")))?;
        Ok(outlinks)
    }
}

/// Scan received response events for the main document's status/mimetype.
/// Subresource responses (images, scripts) are skipped by URL match.
async fn main_document_response(
    responses: &mut (impl futures::Stream<Item = std::sync::Arc<EventResponseReceived>> + Unpin),
    url: &str,
) -> (Option<i64>, Option<String>) {
    let scan = async {
        while let Some(event) = responses.next().await {
            if event.response.url == url {
                let mimetype = if event.response.mime_type.is_empty() {
                    None
                } else {
                    Some(event.response.mime_type.clone())
                };
                return (Some(event.response.status), mimetype);
            }
        }
        (None, None)
    };
    tokio::time::timeout(Duration::from_millis(500), scan)
        .await
        .unwrap_or((None, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_response_event_means_status_unknown_not_ok() {
        let mut empty = futures::stream::empty::<std::sync::Arc<EventResponseReceived>>();
        let (status, mimetype) = main_document_response(&mut empty, "http://example.com/").await;
        assert_eq!(status, None);
        assert_eq!(mimetype, None);
        // An unobserved status records as unknown, never as a 200.
        assert_eq!(status.unwrap_or(STATUS_UNKNOWN), STATUS_UNKNOWN);
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn browse(&self, site: &Site, page: &Page) -> Result<BrowseResult> {
        info!(url = %page.url, hops = page.hops_from_seed, "browsing page");

        let tab = self.new_tab().await?;
        let result = self.browse_in_tab(&tab, site, page).await;

        if let Err(e) = tab.close().await {
            debug!("failed to close tab: {e}");
        }
        result
    }

    async fn close(&self) {
        if let Some(mut browser) = self.browser.lock().await.take() {
            if let Err(e) = browser.close().await {
                warn!("browser close failed: {e}");
            }
            let _ = browser.wait().await;
        }
        if let Some(task) = self.handler_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.user_data_dir) {
            debug!(
                "failed to remove profile dir {}: {e}",
                self.user_data_dir.display()
            );
        }
    }
}
