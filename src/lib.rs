//! skitter: a fleet coordinator for browser-based crawling.
//!
//! Worker slots claim sites and pages from a shared durable frontier,
//! browse them with headless Chrome, and fold discovered outlinks back into
//! the queue. The frontier's compare-and-set claim protocol guarantees each
//! page is held by at most one worker at a time; per-site resource limits
//! and cooperative shutdown keep the fleet stoppable without losing or
//! double-processing work.

pub mod browser;
pub mod config;
pub mod error;
pub mod frontier;
pub mod job;
pub mod limits;
pub mod model;
pub mod shutdown;
pub mod surt;
pub mod worker;

pub use browser::{BrowseResult, BrowserSession, ChromiumSessionFactory, SessionFactory};
pub use config::WorkerConfig;
pub use error::{CrawlError, ValidationErrors};
pub use frontier::{CaptureQuery, Frontier, PageCounts};
pub use job::JobSpec;
pub use limits::{should_stop, StopReason};
pub use model::{Capture, Job, JobConf, Page, PageOutcome, Site, SiteOutcome, SiteStatus};
pub use shutdown::{ShutdownCoordinator, StateBoard};
pub use surt::canonical_surt;
pub use worker::WorkerPool;
