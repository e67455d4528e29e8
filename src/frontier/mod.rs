//! The frontier: durable store of jobs, sites, and pages, and the
//! authoritative queue of claimable work.
//!
//! All cross-worker mutual exclusion lives here. A claim is a conditional
//! `UPDATE ... WHERE claimed = 0` against SQLite; `rows_affected` is the
//! compare-and-set verdict. Workers never take in-process locks on shared
//! crawl state; the blast radius of a crashed worker is bounded by the
//! lease timeout, enforced by [`Frontier::reclaim_stale`].

mod captures;

pub use captures::CaptureQuery;

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{CrawlError, Result};
use crate::model::{Job, JobConf, Page, PageOutcome, Site, SiteOutcome, SiteStatus};
use crate::surt;

/// Frontier schema. Idempotent; `ensure-tables` and every open run it.
///
/// Page rowids are the insertion sequence: claim ordering and the
/// oldest-unclaimed tie-break both ride on `id`, so no two workers ever
/// observe an ambiguous ordering.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    conf TEXT NOT NULL,
    finished INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sites (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER,
    seed TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'ACTIVE',
    conf TEXT NOT NULL,
    claimed INTEGER NOT NULL DEFAULT 0,
    claimed_by TEXT,
    last_claimed INTEGER NOT NULL DEFAULT 0,
    start_time INTEGER NOT NULL,
    pages_brozzled INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_sites_claimable ON sites(status, claimed);
CREATE INDEX IF NOT EXISTS idx_sites_job ON sites(job_id);

CREATE TABLE IF NOT EXISTS pages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    site_id INTEGER NOT NULL,
    url TEXT NOT NULL,
    canon_surt TEXT NOT NULL,
    hops_from_seed INTEGER NOT NULL DEFAULT 0,
    claimed INTEGER NOT NULL DEFAULT 0,
    claimed_by TEXT,
    last_claimed INTEGER NOT NULL DEFAULT 0,
    brozzled INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    UNIQUE(site_id, canon_surt)
);

CREATE INDEX IF NOT EXISTS idx_pages_claimable
    ON pages(site_id, brozzled, failed, claimed);

CREATE TABLE IF NOT EXISTS captures (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    canon_surt TEXT NOT NULL,
    abbr_canon_surt TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    content_digest TEXT NOT NULL,
    http_status INTEGER NOT NULL,
    mimetype TEXT
);

CREATE INDEX IF NOT EXISTS idx_captures_abbr_canon_surt_timestamp
    ON captures(abbr_canon_surt, timestamp);
"#;

const SITE_COLUMNS: &str = "id, job_id, seed, status, conf, claimed, claimed_by, \
     last_claimed, start_time, pages_brozzled";

const PAGE_COLUMNS: &str = "id, site_id, url, canon_surt, hops_from_seed, claimed, \
     claimed_by, last_claimed, brozzled, retry_count, failed";

type SiteRow = (
    i64,
    Option<i64>,
    String,
    String,
    String,
    i64,
    Option<String>,
    i64,
    i64,
    i64,
);

type PageRow = (
    i64,
    i64,
    String,
    String,
    i64,
    i64,
    Option<String>,
    i64,
    i64,
    i64,
    i64,
);

fn site_from_row(row: SiteRow) -> Result<Site> {
    Ok(Site {
        id: row.0,
        job_id: row.1,
        seed: row.2,
        status: row.3,
        conf: decode_conf(&row.4)?,
        claimed: row.5 != 0,
        claimed_by: row.6,
        last_claimed: row.7,
        start_time: row.8,
        pages_brozzled: row.9,
    })
}

fn page_from_row(row: PageRow) -> Page {
    Page {
        id: row.0,
        site_id: row.1,
        url: row.2,
        canon_surt: row.3,
        hops_from_seed: row.4,
        claimed: row.5 != 0,
        claimed_by: row.6,
        last_claimed: row.7,
        brozzled: row.8 != 0,
        retry_count: row.9,
        failed: row.10 != 0,
    }
}

fn decode_conf(raw: &str) -> Result<JobConf> {
    serde_json::from_str(raw).map_err(|e| CrawlError::Store(sqlx::Error::Decode(e.into())))
}

fn encode_conf(conf: &JobConf) -> Result<String> {
    serde_json::to_string(conf).map_err(|e| CrawlError::Store(sqlx::Error::Encode(e.into())))
}

/// Pending/in-flight page tallies for one site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCounts {
    /// Unclaimed, not brozzled, not failed: claimable right now.
    pub claimable: i64,
    /// Claimed but not yet released: some worker is (or was) on it.
    pub in_flight: i64,
    pub brozzled: i64,
}

/// Shared, durable work queue with atomic claim/release semantics.
#[derive(Clone)]
pub struct Frontier {
    pool: SqlitePool,
}

impl Frontier {
    /// Open the frontier database, creating tables as needed.
    pub async fn open(db_path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let frontier = Self { pool };
        frontier.ensure_tables().await?;
        Ok(frontier)
    }

    /// Idempotent schema provisioning. Safe to run from several processes
    /// starting up at once; `CREATE IF NOT EXISTS` carries the race.
    pub async fn ensure_tables(&self) -> Result<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Job / site creation
    // ------------------------------------------------------------------

    /// Create a job with its seed sites and seed pages.
    pub async fn new_job(
        &self,
        name: &str,
        conf: &JobConf,
        seeds: &[String],
    ) -> Result<Job> {
        let now = Utc::now().timestamp();
        let conf_json = encode_conf(conf)?;

        let job_id = sqlx::query(
            "INSERT INTO jobs (name, conf, finished, created_at) VALUES (?, ?, 0, ?)",
        )
        .bind(name)
        .bind(&conf_json)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        for seed in seeds {
            self.insert_site(Some(job_id), seed, conf).await?;
        }

        info!(job = name, job_id, seeds = seeds.len(), "queued new job");

        Ok(Job {
            id: job_id,
            name: name.to_string(),
            conf: conf.clone(),
            finished: false,
            created_at: Utc::now(),
        })
    }

    /// Create a standalone site (no job) with its seed page.
    pub async fn new_site(&self, seed: &str, conf: &JobConf) -> Result<Site> {
        let site = self.insert_site(None, seed, conf).await?;
        info!(site_id = site.id, seed, "queued new site");
        Ok(site)
    }

    async fn insert_site(&self, job_id: Option<i64>, seed: &str, conf: &JobConf) -> Result<Site> {
        // A seed that does not normalize cannot produce a seed page, so the
        // site is rejected up front.
        let seed_key = surt::canonical_surt(seed)?;
        let now = Utc::now().timestamp();
        let conf_json = encode_conf(conf)?;

        let site_id = sqlx::query(
            "INSERT INTO sites (job_id, seed, status, conf, start_time) \
             VALUES (?, ?, 'ACTIVE', ?, ?)",
        )
        .bind(job_id)
        .bind(seed)
        .bind(&conf_json)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        sqlx::query(
            "INSERT OR IGNORE INTO pages (site_id, url, canon_surt, hops_from_seed) \
             VALUES (?, ?, ?, 0)",
        )
        .bind(site_id)
        .bind(seed)
        .bind(&seed_key)
        .execute(&self.pool)
        .await?;

        self.site(site_id).await?.ok_or_else(|| {
            CrawlError::Store(sqlx::Error::RowNotFound)
        })
    }

    // ------------------------------------------------------------------
    // Claim protocol
    // ------------------------------------------------------------------

    /// Claim one active, unclaimed site for `worker_id`, oldest first.
    ///
    /// The conditional update is the compare-and-set: when two workers race
    /// for the same candidate row, exactly one update matches and the loser
    /// retries with the next candidate. Never returns a site another worker
    /// holds.
    pub async fn claim_site(&self, worker_id: &str) -> Result<Option<Site>> {
        loop {
            let candidate: Option<(i64,)> = sqlx::query_as(
                "SELECT id FROM sites WHERE status = 'ACTIVE' AND claimed = 0 \
                 ORDER BY id LIMIT 1",
            )
            .fetch_optional(&self.pool)
            .await?;

            let Some((site_id,)) = candidate else {
                return Ok(None);
            };

            let now = Utc::now().timestamp();
            let won = sqlx::query(
                "UPDATE sites SET claimed = 1, claimed_by = ?, last_claimed = ? \
                 WHERE id = ? AND claimed = 0 AND status = 'ACTIVE'",
            )
            .bind(worker_id)
            .bind(now)
            .bind(site_id)
            .execute(&self.pool)
            .await?
            .rows_affected()
                == 1;

            if won {
                debug!(worker_id, site_id, "claimed site");
                return self.site(site_id).await;
            }
            // Another worker took it between select and update; next candidate.
        }
    }

    /// Claim the oldest unclaimed, un-brozzled, un-failed page of `site`.
    /// FIFO by insertion order approximates breadth-first crawling.
    pub async fn claim_page(&self, site: &Site, worker_id: &str) -> Result<Option<Page>> {
        loop {
            let candidate: Option<(i64,)> = sqlx::query_as(
                "SELECT id FROM pages \
                 WHERE site_id = ? AND claimed = 0 AND brozzled = 0 AND failed = 0 \
                 ORDER BY id LIMIT 1",
            )
            .bind(site.id)
            .fetch_optional(&self.pool)
            .await?;

            let Some((page_id,)) = candidate else {
                return Ok(None);
            };

            let now = Utc::now().timestamp();
            let won = sqlx::query(
                "UPDATE pages SET claimed = 1, claimed_by = ?, last_claimed = ? \
                 WHERE id = ? AND claimed = 0 AND brozzled = 0 AND failed = 0",
            )
            .bind(worker_id)
            .bind(now)
            .bind(page_id)
            .execute(&self.pool)
            .await?
            .rows_affected()
                == 1;

            if won {
                debug!(worker_id, page_id, site_id = site.id, "claimed page");
                return self.page(page_id).await;
            }
        }
    }

    /// Fold discovered outlinks back into the site's queue.
    ///
    /// Each URL is normalized; candidates that fail to normalize are dropped,
    /// and candidates past the job's hop budget are not enqueued. Insertion
    /// is keyed by `(site_id, canon_surt)` with store-enforced dedup, so
    /// concurrent calls for different pages of one site never double-insert.
    /// Returns the number of pages actually created.
    pub async fn enqueue_outlinks(
        &self,
        site: &Site,
        parent: &Page,
        urls: &[String],
    ) -> Result<usize> {
        let hops = parent.hops_from_seed + 1;
        if hops > i64::from(site.conf.max_hops) {
            debug!(site_id = site.id, hops, "outlinks beyond hop budget, dropped");
            return Ok(0);
        }

        let mut added = 0usize;
        for url in urls {
            let key = match surt::canonical_surt(url) {
                Ok(key) => key,
                Err(e) => {
                    debug!(url, error = %e, "dropping unparseable outlink");
                    continue;
                }
            };

            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO pages (site_id, url, canon_surt, hops_from_seed) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(site.id)
            .bind(url)
            .bind(&key)
            .bind(hops)
            .execute(&self.pool)
            .await?
            .rows_affected();

            added += inserted as usize;
        }

        if added > 0 {
            debug!(site_id = site.id, added, "enqueued outlinks");
        }
        Ok(added)
    }

    // ------------------------------------------------------------------
    // Release
    // ------------------------------------------------------------------

    /// Clear a page's claim and record how the browse ended.
    ///
    /// Recoverable failures increment the retry count; past `max_retries`
    /// the page flips to permanently failed instead of re-queuing.
    ///
    /// Every branch is conditioned on `claimed_by = worker_id`: a worker
    /// whose lease was reclaimed while it was still browsing must not
    /// disturb the claim (or retry state) of whoever holds the page now.
    /// Returns false when the lease was lost and the outcome was discarded.
    pub async fn release_page(
        &self,
        page: &Page,
        worker_id: &str,
        outcome: PageOutcome,
        max_retries: i64,
    ) -> Result<bool> {
        let applied = match outcome {
            PageOutcome::Success => {
                // The page release and the site's brozzled counter commit
                // together or not at all.
                let mut tx = self.pool.begin().await?;
                let rows = sqlx::query(
                    "UPDATE pages SET claimed = 0, claimed_by = NULL, brozzled = 1 \
                     WHERE id = ? AND claimed = 1 AND claimed_by = ?",
                )
                .bind(page.id)
                .bind(worker_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();

                if rows == 1 {
                    sqlx::query(
                        "UPDATE sites SET pages_brozzled = pages_brozzled + 1 WHERE id = ?",
                    )
                    .bind(page.site_id)
                    .execute(&mut *tx)
                    .await?;
                }
                tx.commit().await?;
                rows == 1
            }
            PageOutcome::RecoverableFailure => {
                let retries = page.retry_count + 1;
                let failed = retries > max_retries;
                let rows = sqlx::query(
                    "UPDATE pages SET claimed = 0, claimed_by = NULL, \
                     retry_count = ?, failed = ? \
                     WHERE id = ? AND claimed = 1 AND claimed_by = ?",
                )
                .bind(retries)
                .bind(failed as i64)
                .bind(page.id)
                .bind(worker_id)
                .execute(&self.pool)
                .await?
                .rows_affected();
                if rows == 1 && failed {
                    info!(
                        page_id = page.id,
                        url = %page.url,
                        retries,
                        "retry bound exceeded, marking page permanently failed"
                    );
                }
                rows == 1
            }
            PageOutcome::Fatal => {
                sqlx::query(
                    "UPDATE pages SET claimed = 0, claimed_by = NULL, failed = 1 \
                     WHERE id = ? AND claimed = 1 AND claimed_by = ?",
                )
                .bind(page.id)
                .bind(worker_id)
                .execute(&self.pool)
                .await?
                .rows_affected()
                    == 1
            }
        };

        if !applied {
            info!(
                page_id = page.id,
                worker_id,
                "page lease lost before release, outcome discarded"
            );
        }
        Ok(applied)
    }

    /// Clear a site's claim and settle its status.
    ///
    /// `LimitReached` always ends the site as `FinishedTimeLimit` so a
    /// truncated crawl is distinguishable from a finished one. `Completed`
    /// ends the site only when nothing claimable remains and nothing is
    /// in flight; otherwise it stays active for the next worker.
    ///
    /// Guarded by `claimed_by = worker_id` like [`Frontier::release_page`]:
    /// a stale worker can neither clear the current holder's claim nor flip
    /// the status under them. Returns false when the lease was lost.
    pub async fn release_site(
        &self,
        site: &Site,
        worker_id: &str,
        outcome: SiteOutcome,
    ) -> Result<bool> {
        let status = match outcome {
            SiteOutcome::LimitReached => Some(SiteStatus::FinishedTimeLimit),
            SiteOutcome::Abandoned => None,
            SiteOutcome::Completed => {
                let counts = self.site_page_counts(site.id).await?;
                if counts.claimable == 0 && counts.in_flight == 0 {
                    Some(SiteStatus::Finished)
                } else {
                    None
                }
            }
        };

        let applied = match status {
            Some(status) => {
                let rows = sqlx::query(
                    "UPDATE sites SET claimed = 0, claimed_by = NULL, status = ? \
                     WHERE id = ? AND claimed = 1 AND claimed_by = ?",
                )
                .bind(status.as_str())
                .bind(site.id)
                .bind(worker_id)
                .execute(&self.pool)
                .await?
                .rows_affected();
                if rows == 1 {
                    info!(site_id = site.id, status = status.as_str(), "site released");
                    self.maybe_finish_job(site).await?;
                }
                rows == 1
            }
            None => {
                let rows = sqlx::query(
                    "UPDATE sites SET claimed = 0, claimed_by = NULL \
                     WHERE id = ? AND claimed = 1 AND claimed_by = ?",
                )
                .bind(site.id)
                .bind(worker_id)
                .execute(&self.pool)
                .await?
                .rows_affected();
                if rows == 1 {
                    debug!(site_id = site.id, "site released, still active");
                }
                rows == 1
            }
        };

        if !applied {
            info!(
                site_id = site.id,
                worker_id,
                "site lease lost before release, outcome discarded"
            );
        }
        Ok(applied)
    }

    /// Set the job's completion flag once none of its sites are active.
    async fn maybe_finish_job(&self, site: &Site) -> Result<()> {
        let Some(job_id) = site.job_id else {
            return Ok(());
        };
        let (active,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sites WHERE job_id = ? AND status = 'ACTIVE'",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;

        if active == 0 {
            sqlx::query("UPDATE jobs SET finished = 1 WHERE id = ?")
                .bind(job_id)
                .execute(&self.pool)
                .await?;
            info!(job_id, "job finished");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Crash recovery: clear claims whose lease started more than
    /// `lease_timeout` ago and were never released. Returns
    /// `(sites_reclaimed, pages_reclaimed)`.
    pub async fn reclaim_stale(&self, lease_timeout: Duration) -> Result<(u64, u64)> {
        let cutoff = Utc::now().timestamp() - lease_timeout.as_secs() as i64;

        let sites = sqlx::query(
            "UPDATE sites SET claimed = 0, claimed_by = NULL \
             WHERE claimed = 1 AND last_claimed <= ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let pages = sqlx::query(
            "UPDATE pages SET claimed = 0, claimed_by = NULL \
             WHERE claimed = 1 AND last_claimed <= ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if sites > 0 || pages > 0 {
            info!(sites, pages, "reclaimed stale claims");
        }
        Ok((sites, pages))
    }

    /// Page tallies for a site, used by release and by the page budget.
    pub async fn site_page_counts(&self, site_id: i64) -> Result<PageCounts> {
        let (claimable, in_flight, brozzled): (i64, i64, i64) = sqlx::query_as(
            "SELECT \
               COALESCE(SUM(claimed = 0 AND brozzled = 0 AND failed = 0), 0), \
               COALESCE(SUM(claimed = 1), 0), \
               COALESCE(SUM(brozzled = 1), 0) \
             FROM pages WHERE site_id = ?",
        )
        .bind(site_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(PageCounts {
            claimable,
            in_flight,
            brozzled,
        })
    }

    // ------------------------------------------------------------------
    // Row access
    // ------------------------------------------------------------------

    pub async fn site(&self, site_id: i64) -> Result<Option<Site>> {
        let row: Option<SiteRow> = sqlx::query_as(&format!(
            "SELECT {SITE_COLUMNS} FROM sites WHERE id = ?"
        ))
        .bind(site_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(site_from_row).transpose()
    }

    pub async fn page(&self, page_id: i64) -> Result<Option<Page>> {
        let row: Option<PageRow> = sqlx::query_as(&format!(
            "SELECT {PAGE_COLUMNS} FROM pages WHERE id = ?"
        ))
        .bind(page_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(page_from_row))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
