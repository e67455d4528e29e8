//! Error taxonomy for crawl coordination.
//!
//! The variants map onto how the worker loop reacts: `InvalidUrl` drops a
//! candidate locally, `RecoverableBrowse` re-queues the page with a retry
//! count, `ReachedLimit` ends a site cleanly, `FatalBrowse` fails the page
//! and recycles the slot's browser, `Store` backs off and retries the
//! specific frontier operation, and `ShutdownRequested` exits the loop.

use std::collections::BTreeMap;

use thiserror::Error;

/// Field name → problem description, collected while validating a job spec.
pub type ValidationErrors = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum CrawlError {
    /// URL could not be parsed or normalized; the candidate is dropped,
    /// never enqueued.
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Transient navigation/network/browser error. The page goes back to
    /// the queue with an incremented retry count.
    #[error("recoverable browse failure: {0}")]
    RecoverableBrowse(String),

    /// A site or page hard limit was hit while browsing. Informational
    /// terminal condition for the site, not a failure.
    #[error("reached limit: {0}")]
    ReachedLimit(String),

    /// Browser process unusable. The page is marked failed and the worker
    /// slot restarts its browser before claiming further work.
    #[error("fatal browse failure: {0}")]
    FatalBrowse(String),

    /// A frontier operation could not complete. Callers back off and retry;
    /// a claim is never assumed to have succeeded without store confirmation.
    #[error("store unavailable: {0}")]
    Store(#[from] sqlx::Error),

    /// Cooperative cancellation, not a failure.
    #[error("shutdown requested")]
    ShutdownRequested,

    /// Structural or semantic problems in a job specification file.
    #[error("invalid job spec: {0:?}")]
    InvalidJobSpec(ValidationErrors),
}

impl CrawlError {
    pub fn invalid_url(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// True when the worker slot should tear down and relaunch its browser.
    pub fn is_fatal_browse(&self) -> bool {
        matches!(self, Self::FatalBrowse(_))
    }
}

pub type Result<T, E = CrawlError> = std::result::Result<T, E>;
