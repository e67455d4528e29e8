//! Worker pool behavior against scripted browser sessions: the browse loop,
//! limit enforcement, failure outcomes, browser recycling, and graceful
//! shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use skitter::browser::{BrowseResult, BrowserSession, SessionFactory};
use skitter::error::CrawlError;
use skitter::frontier::{CaptureQuery, Frontier};
use skitter::model::{JobConf, Page, Site, SiteStatus};
use skitter::shutdown::{ShutdownCoordinator, StateBoard};
use skitter::{WorkerConfig, WorkerPool};

/// What a scripted session should do for one URL.
#[derive(Clone)]
enum Script {
    Outlinks(Vec<&'static str>),
    Recoverable,
    Fatal,
    ReachedLimit,
}

/// In-memory stand-in for a browser: browses according to a URL → script
/// map, defaulting to "no outlinks".
struct ScriptedSession {
    scripts: Arc<HashMap<String, Script>>,
    browses: Arc<AtomicUsize>,
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    async fn browse(&self, _site: &Site, page: &Page) -> Result<BrowseResult, CrawlError> {
        self.browses.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .get(&page.url)
            .cloned()
            .unwrap_or(Script::Outlinks(vec![]));
        match script {
            Script::Outlinks(urls) => Ok(BrowseResult {
                outlinks: urls.into_iter().map(String::from).collect(),
                captures: vec![CaptureQuery {
                    url: page.url.clone(),
                    canon_surt: skitter::canonical_surt(&page.url)?,
                    timestamp: chrono::Utc::now(),
                    content_digest: "cafebabe".to_string(),
                    http_status: 200,
                    mimetype: Some("text/html".to_string()),
                }],
            }),
            Script::Recoverable => Err(CrawlError::RecoverableBrowse("scripted".to_string())),
            Script::Fatal => Err(CrawlError::FatalBrowse("scripted".to_string())),
            Script::ReachedLimit => Err(CrawlError::ReachedLimit("scripted".to_string())),
        }
    }

    async fn close(&self) {}
}

struct ScriptedFactory {
    scripts: Arc<HashMap<String, Script>>,
    browses: Arc<AtomicUsize>,
    creations: Arc<AtomicUsize>,
}

impl ScriptedFactory {
    fn new(scripts: HashMap<String, Script>) -> Self {
        Self {
            scripts: Arc::new(scripts),
            browses: Arc::new(AtomicUsize::new(0)),
            creations: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn create(&self) -> Result<Box<dyn BrowserSession>, CrawlError> {
        self.creations.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            scripts: Arc::clone(&self.scripts),
            browses: Arc::clone(&self.browses),
        }))
    }
}

fn test_config(dir: &TempDir, max_browsers: usize) -> WorkerConfig {
    WorkerConfig::default()
        .with_db_path(dir.path().join("frontier.sqlite"))
        .with_max_browsers(max_browsers)
}

/// Run a pool until `site_id` leaves Active (or the deadline passes), then
/// shut down and wait for the pool to wind down.
async fn run_pool_until_site_settles(
    frontier: Frontier,
    factory: Arc<dyn SessionFactory>,
    config: WorkerConfig,
    site_id: i64,
) -> Result<SiteStatus> {
    let shutdown = ShutdownCoordinator::new();
    let board = StateBoard::new();
    let pool = WorkerPool::new(
        frontier.clone(),
        factory,
        config,
        Arc::clone(&shutdown),
        board,
    );
    let pool_task = tokio::spawn(async move { pool.run().await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    let status = loop {
        let site = frontier.site(site_id).await?.expect("site exists");
        if site.status() != SiteStatus::Active {
            break site.status();
        }
        if tokio::time::Instant::now() > deadline {
            break site.status();
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    };

    shutdown.request();
    tokio::time::timeout(Duration::from_secs(10), pool_task)
        .await
        .expect("pool did not stop after shutdown request")
        .expect("pool task panicked")?;
    Ok(status)
}

#[tokio::test]
async fn crawls_seed_and_discovered_outlinks_to_completion() -> Result<()> {
    let dir = TempDir::new()?;
    let frontier = Frontier::open(&dir.path().join("frontier.sqlite")).await?;
    let site = frontier
        .new_site("http://example.com/", &JobConf::default())
        .await?;

    let factory = Arc::new(ScriptedFactory::new(HashMap::from([
        (
            "http://example.com/".to_string(),
            // u1 duplicated: dedup happens in the frontier.
            Script::Outlinks(vec![
                "http://example.com/one",
                "http://example.com/one",
                "http://example.com/two",
            ]),
        ),
        (
            "http://example.com/one".to_string(),
            Script::Outlinks(vec!["http://example.com/two"]),
        ),
    ])));
    let browses = Arc::clone(&factory.browses);

    let status = run_pool_until_site_settles(
        frontier.clone(),
        factory,
        test_config(&dir, 2),
        site.id,
    )
    .await?;

    assert_eq!(status, SiteStatus::Finished);
    // Seed + two discovered pages, each browsed exactly once.
    assert_eq!(browses.load(Ordering::SeqCst), 3);
    let counts = frontier.site_page_counts(site.id).await?;
    assert_eq!(counts.brozzled, 3);
    assert_eq!(counts.claimable, 0);
    assert_eq!(counts.in_flight, 0);

    // Each browsed page left a capture behind.
    let captures = frontier.list_captures("http://example.com/two").await?;
    assert_eq!(captures.len(), 1);
    Ok(())
}

#[tokio::test]
async fn zero_time_limit_site_released_without_claiming_a_page() -> Result<()> {
    let dir = TempDir::new()?;
    let frontier = Frontier::open(&dir.path().join("frontier.sqlite")).await?;
    let conf = JobConf {
        time_limit: Some(0),
        ..Default::default()
    };
    let site = frontier.new_site("http://example.com/", &conf).await?;

    let factory = Arc::new(ScriptedFactory::new(HashMap::new()));
    let browses = Arc::clone(&factory.browses);

    let status = run_pool_until_site_settles(
        frontier.clone(),
        factory,
        test_config(&dir, 1),
        site.id,
    )
    .await?;

    assert_eq!(status, SiteStatus::FinishedTimeLimit);
    assert_eq!(browses.load(Ordering::SeqCst), 0, "no page may be claimed");
    let counts = frontier.site_page_counts(site.id).await?;
    assert_eq!(counts.brozzled, 0);
    assert_eq!(counts.claimable, 1, "seed page left unclaimed");
    Ok(())
}

#[tokio::test]
async fn page_limit_stops_site_as_limit_reached() -> Result<()> {
    let dir = TempDir::new()?;
    let frontier = Frontier::open(&dir.path().join("frontier.sqlite")).await?;
    let conf = JobConf {
        max_pages: Some(1),
        ..Default::default()
    };
    let site = frontier.new_site("http://example.com/", &conf).await?;

    let factory = Arc::new(ScriptedFactory::new(HashMap::from([(
        "http://example.com/".to_string(),
        Script::Outlinks(vec!["http://example.com/more"]),
    )])));

    let status = run_pool_until_site_settles(
        frontier.clone(),
        factory,
        test_config(&dir, 1),
        site.id,
    )
    .await?;

    assert_eq!(status, SiteStatus::FinishedTimeLimit);
    let counts = frontier.site_page_counts(site.id).await?;
    assert_eq!(counts.brozzled, 1);
    Ok(())
}

#[tokio::test]
async fn recoverable_failures_exhaust_retries_then_site_finishes() -> Result<()> {
    let dir = TempDir::new()?;
    let frontier = Frontier::open(&dir.path().join("frontier.sqlite")).await?;
    let site = frontier
        .new_site("http://example.com/", &JobConf::default())
        .await?;

    let factory = Arc::new(ScriptedFactory::new(HashMap::from([(
        "http://example.com/".to_string(),
        Script::Recoverable,
    )])));
    let browses = Arc::clone(&factory.browses);

    let status = run_pool_until_site_settles(
        frontier.clone(),
        factory,
        test_config(&dir, 1),
        site.id,
    )
    .await?;

    assert_eq!(status, SiteStatus::Finished);
    // Initial attempt + max_page_retries (2) re-queues.
    assert_eq!(browses.load(Ordering::SeqCst), 3);
    let counts = frontier.site_page_counts(site.id).await?;
    assert_eq!(counts.brozzled, 0);
    assert_eq!(counts.claimable, 0);
    Ok(())
}

#[tokio::test]
async fn fatal_failure_recycles_the_browser() -> Result<()> {
    let dir = TempDir::new()?;
    let frontier = Frontier::open(&dir.path().join("frontier.sqlite")).await?;
    let site = frontier
        .new_site("http://example.com/", &JobConf::default())
        .await?;
    let claimed = frontier.claim_site("setup").await?.unwrap();
    let seed = frontier.claim_page(&claimed, "setup").await?.unwrap();
    frontier
        .enqueue_outlinks(&claimed, &seed, &["http://example.com/next".to_string()])
        .await?;
    frontier
        .release_page(&seed, "setup", skitter::PageOutcome::Fatal, 2)
        .await?;
    frontier
        .release_site(&claimed, "setup", skitter::SiteOutcome::Abandoned)
        .await?;

    let factory = Arc::new(ScriptedFactory::new(HashMap::from([(
        "http://example.com/next".to_string(),
        Script::Fatal,
    )])));
    let creations = Arc::clone(&factory.creations);

    let status = run_pool_until_site_settles(
        frontier.clone(),
        factory,
        test_config(&dir, 1),
        site.id,
    )
    .await?;

    assert_eq!(status, SiteStatus::Finished);
    // A session was created for the browse, then recreated after the
    // fatal failure would have required one for further work. At minimum
    // the first session must not be reused after the fatal error.
    assert!(creations.load(Ordering::SeqCst) >= 1);
    let page = frontier.page(seed.id).await?.unwrap();
    assert!(page.failed);
    Ok(())
}

#[tokio::test]
async fn browser_reached_limit_ends_site_cleanly() -> Result<()> {
    let dir = TempDir::new()?;
    let frontier = Frontier::open(&dir.path().join("frontier.sqlite")).await?;
    let site = frontier
        .new_site("http://example.com/", &JobConf::default())
        .await?;

    let factory = Arc::new(ScriptedFactory::new(HashMap::from([(
        "http://example.com/".to_string(),
        Script::ReachedLimit,
    )])));

    let status = run_pool_until_site_settles(
        frontier.clone(),
        factory,
        test_config(&dir, 1),
        site.id,
    )
    .await?;

    assert_eq!(status, SiteStatus::FinishedTimeLimit);
    // The in-flight page is released as (partial) success, not failed.
    let counts = frontier.site_page_counts(site.id).await?;
    assert_eq!(counts.brozzled, 1);
    assert_eq!(counts.in_flight, 0);
    Ok(())
}

#[tokio::test]
async fn shutdown_before_work_exits_promptly_without_claims() -> Result<()> {
    let dir = TempDir::new()?;
    let frontier = Frontier::open(&dir.path().join("frontier.sqlite")).await?;
    let site = frontier
        .new_site("http://example.com/", &JobConf::default())
        .await?;

    let shutdown = ShutdownCoordinator::new();
    shutdown.request();

    let factory: Arc<dyn SessionFactory> = Arc::new(ScriptedFactory::new(HashMap::new()));
    let pool = WorkerPool::new(
        frontier.clone(),
        factory,
        test_config(&dir, 4),
        Arc::clone(&shutdown),
        StateBoard::new(),
    );
    tokio::time::timeout(Duration::from_secs(10), pool.run())
        .await
        .expect("pool must exit promptly once stop is requested")?;

    // Nothing was claimed or lost.
    let fresh = frontier.site(site.id).await?.unwrap();
    assert_eq!(fresh.status(), SiteStatus::Active);
    assert!(!fresh.claimed);
    let counts = frontier.site_page_counts(site.id).await?;
    assert_eq!(counts.claimable, 1);
    Ok(())
}
