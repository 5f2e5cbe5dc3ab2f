use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use wikisink::dispatch::Dispatcher;
use wikisink::markup::WikitextParser;
use wikisink::queue::{JobQueue, RetryPolicy, SqliteQueue};
use wikisink::run::{RunConfig, RunController, RunSummary};
use wikisink::stats::RunCounters;
use wikisink::store::{MemoryStore, Neo4jSettings, Neo4jStore, RecordStore};
use wikisink::transform::{PageTransformer, TransformOptions};
use wikisink::worker::{self, WorkerConfig};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "wikisink")]
#[command(about = "Stream a Wikipedia dump into Neo4j")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    ingest: IngestArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Process queued articles and write them to Neo4j
    Work(WorkArgs),
}

#[derive(Args)]
struct StoreArgs {
    /// Target database name
    #[arg(long, default_value = wikisink::config::DEFAULT_DB)]
    db: String,

    /// Neo4j Bolt URI
    #[arg(long, default_value = wikisink::config::DEFAULT_BOLT_URI)]
    bolt_uri: String,

    /// Neo4j user (empty when auth is disabled)
    #[arg(long, default_value = "")]
    user: String,

    /// Neo4j password
    #[arg(long, default_value = "")]
    password: String,

    /// Path of the job queue database
    #[arg(long, default_value = wikisink::config::DEFAULT_QUEUE_PATH)]
    queue: PathBuf,
}

impl StoreArgs {
    fn settings(&self) -> Neo4jSettings {
        Neo4jSettings {
            uri: self.bolt_uri.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            database: self.db.clone(),
        }
    }
}

#[derive(Args)]
struct IngestArgs {
    /// Path to the Wikipedia dump (.xml or .xml.bz2)
    input: Option<PathBuf>,

    /// Enqueue pages for `wikisink work` instead of writing directly
    #[arg(long)]
    worker: bool,

    /// Store the plain text instead of the structured document
    #[arg(long)]
    plaintext: bool,

    /// Drop redirect pages
    #[arg(long)]
    skip_redirects: bool,

    /// Drop disambiguation pages
    #[arg(long)]
    skip_disambig: bool,

    /// Keep only articles whose infobox has this media type (repeatable)
    #[arg(long = "media", value_name = "TYPE")]
    media: Vec<String>,

    /// Log every skipped page at info level
    #[arg(long)]
    verbose_skip: bool,

    /// Stop after this many articles
    #[arg(long)]
    limit: Option<u64>,

    /// Transform into an in-memory store; no database needed
    #[arg(long)]
    dry_run: bool,

    #[command(flatten)]
    store: StoreArgs,
}

#[derive(Args)]
struct WorkArgs {
    /// Jobs processed concurrently
    #[arg(long, default_value_t = wikisink::config::WORKER_CONCURRENCY)]
    concurrency: usize,

    /// Exit once no job is waiting, retries included, instead of polling
    #[arg(long)]
    exit_when_empty: bool,

    /// Log every skipped page at info level
    #[arg(long)]
    verbose_skip: bool,

    #[command(flatten)]
    store: StoreArgs,
}

fn transform_options(args: &IngestArgs) -> TransformOptions {
    let media_filter = if args.media.is_empty() {
        None
    } else {
        Some(
            args.media
                .iter()
                .map(|m| m.trim().to_lowercase())
                .collect::<HashSet<_>>(),
        )
    };
    TransformOptions {
        skip_redirects: args.skip_redirects,
        skip_disambiguation: args.skip_disambig,
        media_filter,
        plain_text_mode: args.plaintext,
        custom_transform: None,
        verbose_skip: args.verbose_skip,
    }
}

fn print_summary(summary: &RunSummary, dry_run: bool) {
    println!();
    println!("=== Summary ===");
    println!("Total time:           {:.2}s", summary.elapsed.as_secs_f64());
    println!("Final state:          {:?}", summary.state);
    println!();
    println!("Articles seen:        {}", summary.pages_seen);
    println!("Articles dispatched:  {}", summary.counts.processed);
    println!("Redirects skipped:    {}", summary.counts.redirect_skips);
    println!("Disambigs skipped:    {}", summary.counts.disambiguation_skips);
    println!("Dispatch failures:    {}", summary.counts.dispatch_failures);
    if let Some(pending) = summary.pending_jobs {
        println!("Jobs still queued:    {pending}");
    }
    match summary.stored_total {
        Some(total) if dry_run => println!("Stored (in memory):   {total}"),
        Some(total) => println!("Stored in database:   {total}"),
        None => println!("Stored in database:   unknown"),
    }
    if let Some(err) = &summary.stream_error {
        println!();
        println!("Input ended early: {err}");
    }
}

async fn ingest_into<S: RecordStore>(
    input: &Path,
    args: &IngestArgs,
    store: impl std::future::Future<Output = Result<S>>,
) -> Result<RunSummary> {
    let transformer = PageTransformer::new(WikitextParser::new(), transform_options(args));
    let config = RunConfig {
        limit: args.limit,
        show_progress: true,
        ..RunConfig::default()
    };
    let controller = RunController::new(config);

    if args.worker {
        let queue_path = args.store.queue.clone();
        let connect = async move {
            let store = store.await?;
            let queue = SqliteQueue::open(&queue_path).await?;
            Ok::<_, anyhow::Error>(Dispatcher::queued(store, queue, RetryPolicy::default()))
        };
        controller.run(input, &transformer, connect).await
    } else {
        let connect =
            async move { Ok::<_, anyhow::Error>(Dispatcher::<S, SqliteQueue>::direct(store.await?)) };
        controller.run(input, &transformer, connect).await
    }
}

fn run_ingest(input: &Path, args: IngestArgs) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let summary = rt.block_on(async {
        if args.dry_run {
            info!("Dry run, records stay in memory");
            ingest_into(input, &args, async { Ok(MemoryStore::new()) }).await
        } else {
            let settings = args.store.settings();
            ingest_into(input, &args, async move { Neo4jStore::connect(&settings).await }).await
        }
    })?;

    print_summary(&summary, args.dry_run);
    Ok(())
}

fn run_work(args: WorkArgs) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.concurrency.max(1))
        .thread_name("wikisink-worker")
        .enable_all()
        .build()?;

    rt.block_on(async {
        let start = Instant::now();
        let queue = SqliteQueue::open(&args.store.queue).await?;
        queue.recover_active().await?;
        info!(pending = queue.pending().await?, "Queue opened");

        let store = Arc::new(Neo4jStore::connect(&args.store.settings()).await?);
        let queue = Arc::new(queue);
        let transformer = Arc::new(PageTransformer::new(
            WikitextParser::new(),
            TransformOptions {
                verbose_skip: args.verbose_skip,
                ..TransformOptions::default()
            },
        ));
        let counters = Arc::new(RunCounters::new());
        let config = WorkerConfig {
            concurrency: args.concurrency,
            exit_when_empty: args.exit_when_empty,
            ..WorkerConfig::default()
        };

        let report = worker::run_worker(
            Arc::clone(&queue),
            Arc::clone(&store),
            transformer,
            Arc::clone(&counters),
            config,
        )
        .await?;
        let failed_jobs = queue.failed().await?;

        let stored_total = store.count().await.ok();
        match Arc::try_unwrap(store) {
            Ok(store) => store.close().await?,
            Err(_) => warn!("Store still shared at shutdown"),
        }
        match Arc::try_unwrap(queue) {
            Ok(queue) => {
                if let Err(e) = queue.close().await {
                    warn!(error = %format!("{e:#}"), "Failed to close queue");
                }
            }
            Err(_) => warn!("Queue still shared at shutdown"),
        }

        let counts = counters.snapshot();
        println!();
        println!("=== Summary ===");
        println!("Total time:           {:.2}s", start.elapsed().as_secs_f64());
        println!();
        println!("Jobs stored:          {}", report.stored);
        println!("Jobs skipped:         {}", report.skipped);
        println!("Retries scheduled:    {}", report.retried);
        println!("Jobs given up:        {}", report.failed);
        println!("Failed jobs in queue: {failed_jobs}");
        println!("Redirects skipped:    {}", counts.redirect_skips);
        println!("Disambigs skipped:    {}", counts.disambiguation_skips);
        match stored_total {
            Some(total) => println!("Stored in database:   {total}"),
            None => println!("Stored in database:   unknown"),
        }
        Ok::<(), anyhow::Error>(())
    })
}

/// Directives in `RUST_LOG` syntax win; without any, the `-v` count picks the level.
fn log_filter(verbose: u8, directives: &str) -> EnvFilter {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .parse_lossy(directives)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = log_filter(cli.verbose, &std::env::var("RUST_LOG").unwrap_or_default());
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
    }

    let result = match cli.command {
        Some(Commands::Work(args)) => run_work(args),
        None => {
            let Some(input) = cli.ingest.input.clone() else {
                // Printing help cannot meaningfully fail here
                let _ = Cli::command().print_help();
                return ExitCode::from(2);
            };
            run_ingest(&input, cli.ingest)
        }
    };

    match result {
        Ok(()) => {
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
