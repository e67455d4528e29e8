//! The worker pool: N concurrent slots, each repeatedly claiming a site and
//! its pages from the frontier, browsing them, and feeding results back.
//!
//! Slots share nothing mutable in-process except the stop flag and the
//! diagnostic state board; all mutual exclusion over crawl state is the
//! frontier's claim protocol. One slot's failure never affects another
//! slot's claims.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::browser::{BrowserSession, SessionFactory};
use crate::config::WorkerConfig;
use crate::error::{CrawlError, Result};
use crate::frontier::Frontier;
use crate::limits;
use crate::model::{Page, PageOutcome, Site, SiteOutcome};
use crate::shutdown::{ShutdownCoordinator, StateBoard};

/// Pool of browser-backed worker slots against one frontier.
pub struct WorkerPool {
    frontier: Frontier,
    sessions: Arc<dyn SessionFactory>,
    config: WorkerConfig,
    shutdown: Arc<ShutdownCoordinator>,
    board: Arc<StateBoard>,
    worker_id: String,
}

impl WorkerPool {
    pub fn new(
        frontier: Frontier,
        sessions: Arc<dyn SessionFactory>,
        config: WorkerConfig,
        shutdown: Arc<ShutdownCoordinator>,
        board: Arc<StateBoard>,
    ) -> Self {
        // Worker identity recorded on every claim row; unique per process.
        let worker_id = format!(
            "{}#{}",
            hostname().unwrap_or_else(|| "unknown".to_string()),
            std::process::id()
        );
        Self {
            frontier,
            sessions,
            config,
            shutdown,
            board,
            worker_id,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run all slots plus the stale-claim sweeper until shutdown is
    /// requested and every slot has wound down.
    pub async fn run(&self) -> Result<()> {
        info!(
            worker_id = %self.worker_id,
            slots = self.config.max_browsers,
            "worker pool starting"
        );

        let sweeper = {
            let frontier = self.frontier.clone();
            let shutdown = Arc::clone(&self.shutdown);
            let lease = self.config.lease_timeout;
            let interval = self.config.reclaim_interval;
            tokio::spawn(async move {
                while !shutdown.sleep_unless_stopped(interval).await {
                    if let Err(e) = frontier.reclaim_stale(lease).await {
                        warn!("stale claim sweep failed: {e}");
                    }
                }
            })
        };

        let mut slots = Vec::with_capacity(self.config.max_browsers);
        for slot_id in 0..self.config.max_browsers {
            let slot = Slot {
                id: slot_id,
                frontier: self.frontier.clone(),
                sessions: Arc::clone(&self.sessions),
                config: self.config.clone(),
                shutdown: Arc::clone(&self.shutdown),
                board: Arc::clone(&self.board),
                worker_id: format!("{}/{}", self.worker_id, slot_id),
            };
            slots.push(tokio::spawn(async move { slot.run().await }));
        }

        for (slot_id, handle) in slots.into_iter().enumerate() {
            match handle.await {
                Ok(()) => debug!(slot_id, "slot exited"),
                Err(e) => error!(slot_id, "slot task panicked: {e}"),
            }
        }

        sweeper.abort();
        let _ = sweeper.await;

        info!(worker_id = %self.worker_id, "worker pool stopped");
        Ok(())
    }
}

fn hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
}

/// One worker slot: owns at most one browser session and at most one site
/// claim at a time.
struct Slot {
    id: usize,
    frontier: Frontier,
    sessions: Arc<dyn SessionFactory>,
    config: WorkerConfig,
    shutdown: Arc<ShutdownCoordinator>,
    board: Arc<StateBoard>,
    worker_id: String,
}

impl Slot {
    async fn run(&self) {
        let mut session: Option<Box<dyn BrowserSession>> = None;
        let mut idle_backoff = self.config.min_idle_backoff;

        loop {
            if self.shutdown.is_requested() {
                break;
            }
            self.board.set(self.id, &self.worker_id, "claiming site");

            let site = match self.frontier.claim_site(&self.worker_id).await {
                Ok(Some(site)) => site,
                Ok(None) => {
                    // Nothing claimable; bounded idle polling with jitter,
                    // waking early on shutdown.
                    self.board.set(self.id, &self.worker_id, "idle");
                    if self.shutdown.sleep_unless_stopped(jitter(idle_backoff)).await {
                        break;
                    }
                    idle_backoff = (idle_backoff * 2).min(self.config.max_idle_backoff);
                    continue;
                }
                Err(e) => {
                    warn!(slot = self.id, "claim_site failed, backing off: {e}");
                    if self.shutdown.sleep_unless_stopped(jitter(idle_backoff)).await {
                        break;
                    }
                    idle_backoff = (idle_backoff * 2).min(self.config.max_idle_backoff);
                    continue;
                }
            };
            idle_backoff = self.config.min_idle_backoff;

            if let Err(e) = self.crawl_site(&site, &mut session).await {
                // Slot-level containment: log and release, never crash the
                // pool or touch other slots' claims.
                warn!(slot = self.id, site_id = site.id, "site crawl error: {e}");
                self.release_site_quietly(&site, SiteOutcome::Abandoned).await;
            }
        }

        self.board.set(self.id, &self.worker_id, "shutting down");
        if let Some(session) = session.take() {
            session.close().await;
        }
        self.board.clear(self.id);
        debug!(slot = self.id, "slot shut down");
    }

    /// Browse pages of one claimed site until it finishes, a limit trips,
    /// or shutdown is requested. Always releases the site claim.
    async fn crawl_site(
        &self,
        site: &Site,
        session: &mut Option<Box<dyn BrowserSession>>,
    ) -> Result<()> {
        // The claim-time snapshot goes stale as pages complete; re-read
        // below after each page so limit checks see current counters.
        let mut site = site.clone();

        loop {
            if self.shutdown.is_requested() {
                self.release_site_quietly(&site, SiteOutcome::Abandoned).await;
                return Ok(());
            }

            if let Some(reason) = limits::should_stop(&site, chrono::Utc::now().timestamp()) {
                info!(site_id = site.id, %reason, "site limit reached");
                self.frontier
                    .release_site(&site, &self.worker_id, SiteOutcome::LimitReached)
                    .await?;
                return Ok(());
            }

            self.board.set(self.id, &self.worker_id, "claiming page");
            let page = match self.frontier.claim_page(&site, &self.worker_id).await? {
                Some(page) => page,
                None => {
                    // No claimable pages. Release; the frontier marks the
                    // site finished only if nothing is in flight elsewhere.
                    self.frontier
                        .release_site(&site, &self.worker_id, SiteOutcome::Completed)
                        .await?;
                    return Ok(());
                }
            };

            self.board.set(
                self.id,
                &self.worker_id,
                format!("browsing {}", page.url),
            );

            match self.browse_page(&site, &page, session).await {
                Ok(()) => {}
                Err(CrawlError::ReachedLimit(msg)) => {
                    // Not an error: partial success for the page, clean
                    // limit-reached end for the site.
                    info!(site_id = site.id, "browser signaled limit: {msg}");
                    self.frontier
                        .release_page(
                            &page,
                            &self.worker_id,
                            PageOutcome::Success,
                            self.config.max_page_retries,
                        )
                        .await?;
                    self.frontier
                        .release_site(&site, &self.worker_id, SiteOutcome::LimitReached)
                        .await?;
                    return Ok(());
                }
                Err(e @ CrawlError::FatalBrowse(_)) => {
                    warn!(slot = self.id, url = %page.url, "fatal browse failure: {e}");
                    self.frontier
                        .release_page(
                            &page,
                            &self.worker_id,
                            PageOutcome::Fatal,
                            self.config.max_page_retries,
                        )
                        .await?;
                    // Restart the browser before claiming further work.
                    if let Some(old) = session.take() {
                        old.close().await;
                    }
                }
                Err(e) => {
                    debug!(url = %page.url, "recoverable browse failure: {e}");
                    self.frontier
                        .release_page(
                            &page,
                            &self.worker_id,
                            PageOutcome::RecoverableFailure,
                            self.config.max_page_retries,
                        )
                        .await?;
                }
            }

            match self.frontier.site(site.id).await? {
                Some(fresh) => site = fresh,
                None => return Ok(()),
            }
        }
    }

    /// Browse one page and write everything back: captures, outlinks, and
    /// the page release. Only store-confirmed changes count as durable.
    async fn browse_page(
        &self,
        site: &Site,
        page: &Page,
        session: &mut Option<Box<dyn BrowserSession>>,
    ) -> Result<()> {
        if session.is_none() {
            *session = Some(self.sessions.create().await?);
        }
        let active = session
            .as_ref()
            .ok_or_else(|| CrawlError::FatalBrowse("no browser session".to_string()))?;

        let result = active.browse(site, page).await?;

        for capture in &result.captures {
            self.frontier.record_capture(capture).await?;
        }
        let added = self
            .frontier
            .enqueue_outlinks(site, page, &result.outlinks)
            .await?;
        debug!(
            url = %page.url,
            outlinks = result.outlinks.len(),
            added,
            "page brozzled"
        );

        self.frontier
            .release_page(
                page,
                &self.worker_id,
                PageOutcome::Success,
                self.config.max_page_retries,
            )
            .await?;
        Ok(())
    }

    async fn release_site_quietly(&self, site: &Site, outcome: SiteOutcome) {
        if let Err(e) = self
            .frontier
            .release_site(site, &self.worker_id, outcome)
            .await
        {
            warn!(site_id = site.id, "failed to release site: {e}");
        }
    }
}

fn jitter(base: Duration) -> Duration {
    let base_ms = base.as_millis().max(1) as u64;
    let jittered = rand::rng().random_range(base_ms / 2..=base_ms);
    Duration::from_millis(jittered)
}
