//! Persisted data model: jobs, sites, pages, captures.
//!
//! The frontier store exclusively owns persisted state. Worker slots hold
//! only transient copies of these rows for the duration of one browse and
//! write back through the frontier before releasing a claim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Site lifecycle. A site leaves `Active` only through `release_site`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteStatus {
    Active,
    /// All pages brozzled, nothing left to claim.
    Finished,
    /// Crawl truncated by a resource limit; distinct from `Finished` so
    /// operators can tell truncated crawls from completed ones.
    FinishedTimeLimit,
    Failed,
}

impl SiteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Finished => "FINISHED",
            Self::FinishedTimeLimit => "FINISHED_TIME_LIMIT",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "FINISHED" => Self::Finished,
            "FINISHED_TIME_LIMIT" => Self::FinishedTimeLimit,
            "FAILED" => Self::Failed,
            _ => Self::Active,
        }
    }
}

/// How a browse of one page ended, from the frontier's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    Success,
    /// Transient failure; the page is re-queued until the retry bound.
    RecoverableFailure,
    /// The page is marked permanently failed.
    Fatal,
}

/// How a worker is done with a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteOutcome {
    /// Normal release; the frontier decides between staying active and
    /// `Finished` based on remaining claimable work.
    Completed,
    /// A resource budget tripped; the site stops cleanly as
    /// `FinishedTimeLimit`.
    LimitReached,
    /// The worker gave up on the site (fatal browser trouble).
    Abandoned,
}

/// A named crawl campaign: seeds plus shared crawl configuration.
/// Immutable once created except for the completion flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub name: String,
    pub conf: JobConf,
    pub finished: bool,
    pub created_at: DateTime<Utc>,
}

/// Crawl configuration shared by a job's sites. Named, validated optional
/// fields rather than an open-ended map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConf {
    /// Seconds of wall time each site may consume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<u64>,
    /// Cap on brozzled pages per site.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u64>,
    /// Discovery depth cap; outlinks past this many hops from the seed are
    /// not enqueued.
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
    #[serde(default)]
    pub ignore_robots: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    /// Parameters for the javascript behavior injected while browsing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub behavior_parameters: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_max_hops() -> u32 {
    3
}

impl Default for JobConf {
    fn default() -> Self {
        Self {
            time_limit: None,
            max_pages: None,
            max_hops: default_max_hops(),
            ignore_robots: false,
            proxy: None,
            behavior_parameters: None,
            username: None,
            password: None,
        }
    }
}

/// One seed origin within a job (or standalone). Carries its own copy of
/// the crawl configuration so a claim needs no join against the job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: i64,
    pub job_id: Option<i64>,
    pub seed: String,
    pub status: String,
    pub conf: JobConf,
    /// Claim relation: set only through the frontier's atomic claim.
    pub claimed: bool,
    pub claimed_by: Option<String>,
    /// Lease start, epoch seconds; staleness is judged against this.
    pub last_claimed: i64,
    /// Epoch seconds when crawling of this site began.
    pub start_time: i64,
    /// Pages brozzled so far, maintained by `release_page`.
    pub pages_brozzled: i64,
}

impl Site {
    pub fn status(&self) -> SiteStatus {
        SiteStatus::parse(&self.status)
    }
}

/// One URL queued for browsing within a site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub id: i64,
    pub site_id: i64,
    pub url: String,
    /// Canonical surt key; `(site_id, canon_surt)` is the dedup key.
    pub canon_surt: String,
    /// Discovery depth: 0 for the seed, parent + 1 for outlinks.
    pub hops_from_seed: i64,
    pub claimed: bool,
    pub claimed_by: Option<String>,
    pub last_claimed: i64,
    /// Completion flag; set exactly once, on successful browse.
    pub brozzled: bool,
    pub retry_count: i64,
    /// Permanently failed: retry bound exceeded or fatal browse.
    pub failed: bool,
}

/// Append-only record of one fetched resource. Never mutated after insert;
/// indexed by `(abbr_canon_surt, timestamp)` for prefix range lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capture {
    pub id: i64,
    pub url: String,
    pub canon_surt: String,
    pub abbr_canon_surt: String,
    pub timestamp: DateTime<Utc>,
    /// Hex sha256 of the response body.
    pub content_digest: String,
    /// HTTP status of the main document; 0 when no status was observed.
    pub http_status: i64,
    pub mimetype: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_status_round_trips() {
        for status in [
            SiteStatus::Active,
            SiteStatus::Finished,
            SiteStatus::FinishedTimeLimit,
            SiteStatus::Failed,
        ] {
            assert_eq!(SiteStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn job_conf_defaults_from_empty_json() {
        let conf: JobConf = serde_json::from_str("{}").unwrap();
        assert_eq!(conf.max_hops, 3);
        assert_eq!(conf.time_limit, None);
        assert!(!conf.ignore_robots);
    }
}
