//! skitter command line entry points: run a worker pool, queue jobs and
//! sites, provision tables, browse a single page, look up captures.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use skitter::browser::{ChromiumSessionFactory, SessionFactory};
use skitter::error::CrawlError;
use skitter::frontier::Frontier;
use skitter::job;
use skitter::model::{JobConf, Page, Site};
use skitter::shutdown::{ShutdownCoordinator, StateBoard};
use skitter::worker::WorkerPool;
use skitter::WorkerConfig;

#[derive(Parser)]
#[command(name = "skitter")]
#[command(about = "Distributed browser-based crawler", version)]
struct Cli {
    /// Path to the frontier database
    #[arg(long, global = true, default_value = "skitter.sqlite")]
    db: PathBuf,

    /// Quiet: warnings and errors only
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Verbose: debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker pool against the frontier
    Worker {
        /// Max browser instances simultaneously browsing pages
        #[arg(short = 'n', long, default_value_t = 1)]
        max_browsers: usize,
        /// Chrome/Chromium executable to use
        #[arg(short = 'e', long)]
        chrome_exe: Option<PathBuf>,
        /// HTTP proxy for all browser instances
        #[arg(long)]
        proxy: Option<String>,
    },
    /// Queue a new job from a JSON specification file
    NewJob {
        /// Job specification file
        spec_file: PathBuf,
    },
    /// Queue a new standalone site
    NewSite {
        /// Seed URL
        seed: String,
        /// Time limit in seconds for this site
        #[arg(long)]
        time_limit: Option<u64>,
        /// Cap on pages brozzled for this site
        #[arg(long)]
        max_pages: Option<u64>,
        /// Ignore robots.txt for this site
        #[arg(long)]
        ignore_robots: bool,
        /// HTTP proxy for this site
        #[arg(long)]
        proxy: Option<String>,
        /// JSON object of javascript behavior parameters
        #[arg(long)]
        behavior_parameters: Option<String>,
        /// Username to try if a login form is found
        #[arg(long)]
        username: Option<String>,
        /// Password to try if a login form is found
        #[arg(long)]
        password: Option<String>,
    },
    /// Browse a single page and print its outlinks, without a frontier
    Browse {
        /// Page URL
        url: String,
        /// Chrome/Chromium executable to use
        #[arg(short = 'e', long)]
        chrome_exe: Option<PathBuf>,
        /// HTTP proxy
        #[arg(long)]
        proxy: Option<String>,
        /// JSON object of javascript behavior parameters
        #[arg(long)]
        behavior_parameters: Option<String>,
    },
    /// Create frontier tables if they don't already exist
    EnsureTables,
    /// Look up entries in the captures table by URL
    ListCaptures {
        /// URL to look up
        url: String,
    },
}

fn init_logging(quiet: bool, verbose: bool) {
    let default_level = if quiet {
        "warn"
    } else if verbose {
        "skitter=debug,info"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.quiet, cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Job spec validation problems print per-field, exit 1.
            if let Some(CrawlError::InvalidJobSpec(errors)) = e.downcast_ref::<CrawlError>() {
                eprintln!("skitter: invalid job specification:");
                for (field, problem) in errors {
                    eprintln!("  {field}: {problem}");
                }
            } else {
                error!("{e:#}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Worker {
            max_browsers,
            chrome_exe,
            proxy,
        } => {
            let config = WorkerConfig {
                db_path: cli.db.clone(),
                max_browsers,
                chrome_exe,
                proxy,
                ..WorkerConfig::default()
            };
            run_worker(config).await
        }
        Command::NewJob { spec_file } => {
            let frontier = Frontier::open(&cli.db).await?;
            let created = job::new_job_file(&frontier, &spec_file).await?;
            info!(job = %created.name, job_id = created.id, "job queued");
            Ok(())
        }
        Command::NewSite {
            seed,
            time_limit,
            max_pages,
            ignore_robots,
            proxy,
            behavior_parameters,
            username,
            password,
        } => {
            let behavior_parameters = behavior_parameters
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("--behavior-parameters must be a json object")?;
            let conf = JobConf {
                time_limit,
                max_pages,
                ignore_robots,
                proxy,
                behavior_parameters,
                username,
                password,
                ..JobConf::default()
            };
            let frontier = Frontier::open(&cli.db).await?;
            let site = frontier.new_site(&seed, &conf).await?;
            info!(site_id = site.id, seed = %site.seed, "site queued");
            Ok(())
        }
        Command::Browse {
            url,
            chrome_exe,
            proxy,
            behavior_parameters,
        } => browse_one_page(url, chrome_exe, proxy, behavior_parameters).await,
        Command::EnsureTables => {
            let frontier = Frontier::open(&cli.db).await?;
            frontier.ensure_tables().await?;
            info!("frontier tables ready");
            Ok(())
        }
        Command::ListCaptures { url } => {
            let frontier = Frontier::open(&cli.db).await?;
            let captures = frontier.list_captures(&url).await?;
            for capture in captures {
                println!("{}", serde_json::to_string_pretty(&capture)?);
            }
            Ok(())
        }
    }
}

async fn run_worker(config: WorkerConfig) -> Result<()> {
    let frontier = Frontier::open(&config.db_path).await?;
    let shutdown = ShutdownCoordinator::new();
    let board = StateBoard::new();

    spawn_signal_handlers(Arc::clone(&shutdown), Arc::clone(&board))?;

    let sessions: Arc<dyn SessionFactory> =
        Arc::new(ChromiumSessionFactory::new(config.clone()));
    let pool = WorkerPool::new(frontier, sessions, config, shutdown, board);
    pool.run().await?;

    info!("skitter worker is all done, exiting");
    Ok(())
}

/// SIGTERM/SIGINT request shutdown (first signal wins); SIGQUIT dumps the
/// state of every live worker slot without touching the stop flag.
fn spawn_signal_handlers(
    shutdown: Arc<ShutdownCoordinator>,
    board: Arc<StateBoard>,
) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigquit = signal(SignalKind::quit()).context("installing SIGQUIT handler")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("caught SIGTERM");
                    shutdown.request();
                }
                _ = sigint.recv() => {
                    info!("caught SIGINT");
                    shutdown.request();
                }
                _ = sigquit.recv() => {
                    board.dump();
                }
            }
        }
    });
    Ok(())
}

/// One-shot browse: throwaway site and page, outlinks printed sorted.
async fn browse_one_page(
    url: String,
    chrome_exe: Option<PathBuf>,
    proxy: Option<String>,
    behavior_parameters: Option<String>,
) -> Result<()> {
    let behavior_parameters = behavior_parameters
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .context("--behavior-parameters must be a json object")?;

    let conf = JobConf {
        proxy: proxy.clone(),
        behavior_parameters,
        ..JobConf::default()
    };
    let site = Site {
        id: -1,
        job_id: None,
        seed: url.clone(),
        status: "ACTIVE".to_string(),
        conf,
        claimed: false,
        claimed_by: None,
        last_claimed: 0,
        start_time: chrono::Utc::now().timestamp(),
        pages_brozzled: 0,
    };
    let page = Page {
        id: -1,
        site_id: -1,
        url,
        canon_surt: skitter::canonical_surt(&site.seed)?,
        hops_from_seed: 0,
        claimed: false,
        claimed_by: None,
        last_claimed: 0,
        brozzled: false,
        retry_count: 0,
        failed: false,
    };

    let config = WorkerConfig {
        chrome_exe,
        proxy,
        ..WorkerConfig::default()
    };
    let factory = ChromiumSessionFactory::new(config);
    let session = factory.create().await?;

    let result = match session.browse(&site, &page).await {
        Ok(result) => result,
        Err(CrawlError::ReachedLimit(msg)) => {
            error!("reached limit: {msg}");
            session.close().await;
            return Ok(());
        }
        Err(e) => {
            session.close().await;
            return Err(e.into());
        }
    };
    session.close().await;

    let mut outlinks = result.outlinks;
    outlinks.sort();
    outlinks.dedup();
    info!("{} outlinks:", outlinks.len());
    for outlink in outlinks {
        println!("{outlink}");
    }
    Ok(())
}
