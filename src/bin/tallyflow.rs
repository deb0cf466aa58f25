//! tallyflow - time-bucket metrics CLI
//!
//! ## Usage
//!
//! ```bash
//! tallyflow show --hours 2 --record-type items
//! tallyflow verify --start "2024-11-19 13:00" --end "2024-11-19 15:00"
//! tallyflow update --force --concurrency 20
//! tallyflow delete-all --dry-run
//! ```
//!
//! ## Environment Variables
//!
//! - TALLYFLOW_ACCOUNT_ID - Account whose metrics are processed (required)
//! - TALLYFLOW_DB_PATH - SQLite database path (default: data/tallyflow.db)
//! - TALLYFLOW_API_URL - GraphQL endpoint for records (optional, default: local SQLite mirror)
//! - TALLYFLOW_API_KEY - API key sent as x-api-key (required with TALLYFLOW_API_URL)
//! - TALLYFLOW_CONCURRENCY - Upsert workers (default: 10, max 50)
//! - TALLYFLOW_PAGE_SIZE - Records per page (default: 1000)
//! - TALLYFLOW_UPSERT_MODE - update-else-create | native (default: update-else-create)
//! - TALLYFLOW_CREATE_CONFLICT_RETRIES - Update retries after a lost create race (default: 2)
//! - TALLYFLOW_RESOLUTIONS - Bucket sizes in minutes (default: 1,5,15,60)
//! - RUST_LOG - Logging level (optional, default: info)
//!
//! ## Exit codes
//!
//! - 0: success
//! - 1: `verify` found differing buckets, or `delete-all` ran without `--yes`
//! - 2: error, including any record type that `verify` or `update` could not
//!   process (the per-type summary is still printed)

use clap::{Args, Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use tallyflow::buckets::BucketCounter;
use tallyflow::config::TallyConfig;
use tallyflow::record_source::{GraphqlRecordQuery, RecordPageQuery, RecordSource, SqliteRecordQuery};
use tallyflow::record_types::RecordTypeRegistry;
use tallyflow::store::{query_range, SqliteStoreFactory, StoreFactory};
use tallyflow::time_window::{self, TimeWindow};
use tallyflow::updater::{AggregationUpdater, UpdateOptions};
use tallyflow::verifier::ConsistencyVerifier;

type BoxError = Box<dyn std::error::Error>;

#[derive(Parser, Debug)]
#[command(name = "tallyflow", version, about = "Time-bucket metrics aggregation")]
struct Cli {
    /// Log at debug level and run counting self-checks
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print stored buckets for the window
    Show {
        #[command(flatten)]
        window: WindowArgs,
        /// Only buckets of this size in minutes
        #[arg(long)]
        size: Option<u32>,
    },
    /// Compare recomputed buckets with stored ones without writing
    Verify {
        #[command(flatten)]
        window: WindowArgs,
    },
    /// Recompute buckets and upsert the ones that changed
    Update {
        #[command(flatten)]
        window: WindowArgs,
        /// Upsert every computed bucket, even unchanged ones
        #[arg(long)]
        force: bool,
        /// Parallel upsert workers (default: TALLYFLOW_CONCURRENCY)
        #[arg(short, long)]
        concurrency: Option<usize>,
    },
    /// Delete every stored bucket of the account
    DeleteAll {
        /// Only count the rows that would be deleted
        #[arg(long)]
        dry_run: bool,
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Args, Debug)]
struct WindowArgs {
    /// Window of the last N hours (takes precedence over --start/--end)
    #[arg(long)]
    hours: Option<f64>,
    /// Window start, e.g. "2024-11-19 13:00", "2 hours ago", "yesterday"
    #[arg(long)]
    start: Option<String>,
    /// Window end (requires --start)
    #[arg(long)]
    end: Option<String>,
    /// Record type name or "all"
    #[arg(short = 't', long, default_value = "all")]
    record_type: String,
}

impl WindowArgs {
    fn resolve(&self) -> Result<TimeWindow, time_window::TimeWindowError> {
        time_window::resolve(self.hours, self.start.as_deref(), self.end.as_deref())
    }
}

struct Context {
    config: TallyConfig,
    registry: RecordTypeRegistry,
    stores: Arc<dyn StoreFactory>,
}

impl Context {
    fn record_source(&self) -> Result<RecordSource, BoxError> {
        let query: Arc<dyn RecordPageQuery> = match &self.config.api {
            Some(api) => Arc::new(GraphqlRecordQuery::new(&api.url, &api.api_key)?),
            None => Arc::new(SqliteRecordQuery::new(&self.config.db_path)?),
        };
        log::info!("📥 Records from {}", query.backend_type());
        Ok(RecordSource::new(query).with_page_size(self.config.page_size))
    }

    fn counter(&self) -> BucketCounter {
        BucketCounter::new(self.config.resolutions.clone())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "debug".to_string()
    } else {
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .target(env_logger::Target::Stderr)
        .try_init()
        .ok();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            log::error!("❌ {}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, BoxError> {
    let config = TallyConfig::from_env()?;
    log::info!("🚀 tallyflow for account {}", config.account_id);
    log::info!("💾 Metrics store: {}", config.db_path.display());

    let ctx = Context {
        stores: Arc::new(SqliteStoreFactory::new(&config.db_path)),
        registry: RecordTypeRegistry::default(),
        config,
    };

    match cli.command {
        Command::Show { window, size } => show(&ctx, &window, size).await,
        Command::Verify { window } => verify(&ctx, &window).await,
        Command::Update {
            window,
            force,
            concurrency,
        } => {
            let options = UpdateOptions {
                force,
                concurrency: concurrency.unwrap_or(ctx.config.concurrency),
                verbose: cli.verbose,
            };
            update(&ctx, &window, options).await
        }
        Command::DeleteAll { dry_run, yes } => delete_all(&ctx, dry_run, yes).await,
    }
}

async fn show(ctx: &Context, args: &WindowArgs, size: Option<u32>) -> Result<ExitCode, BoxError> {
    let window = args.resolve()?;
    let specs = ctx.registry.select(&args.record_type)?;
    let store = ctx.stores.connect()?;

    println!("Window: {} ({} minutes)", window, window.duration().num_minutes());
    for spec in specs {
        let mut buckets = query_range(store.as_ref(), &ctx.config.account_id, &spec.name, &window).await?;
        buckets.retain(|bucket| size.map_or(true, |size| bucket.size_minutes == size));
        if buckets.is_empty() {
            continue;
        }
        buckets.sort_by(|a, b| {
            a.size_minutes
                .cmp(&b.size_minutes)
                .then(a.bucket_start.cmp(&b.bucket_start))
        });

        println!();
        println!("{} ({} buckets)", spec.name, buckets.len());
        for bucket in &buckets {
            println!(
                "  {:>3}m  {}  {:>8}{}",
                bucket.size_minutes,
                bucket.bucket_start.format("%Y-%m-%d %H:%M"),
                bucket.count,
                if bucket.complete { "" } else { "  (in progress)" }
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn verify(ctx: &Context, args: &WindowArgs) -> Result<ExitCode, BoxError> {
    let window = args.resolve()?;
    let verifier = ConsistencyVerifier::new(ctx.record_source()?, ctx.counter(), Arc::clone(&ctx.stores));
    let results = verifier
        .verify_all(&ctx.registry, &args.record_type, &ctx.config.account_id, &window)
        .await?;

    let (mut mismatched, mut failed_types) = (0, 0);
    println!("Verification over {}", window);
    for entry in &results {
        let report = match &entry.result {
            Ok(report) => report,
            Err(e) => {
                failed_types += 1;
                println!("  {:<24} failed: {}", entry.record_type, e);
                continue;
            }
        };
        let mismatches: Vec<_> = report.mismatches().collect();
        mismatched += mismatches.len();
        println!(
            "  {:<24} {:>5} buckets  {:>4} mismatches{}",
            report.record_type,
            report.diffs.len(),
            mismatches.len(),
            if report.fetch_warnings.is_empty() { "" } else { "  (partial fetch)" }
        );
        for diff in mismatches {
            println!(
                "    {}  computed={} stored={} delta={:+}",
                diff.key, diff.computed, diff.stored, diff.delta
            );
        }
    }

    if failed_types > 0 {
        println!("❌ {} record types could not be verified", failed_types);
    }
    if mismatched > 0 {
        println!("❌ {} mismatched buckets", mismatched);
    } else if failed_types == 0 {
        println!("✅ All buckets consistent");
    }

    Ok(ExitCode::from(tallyflow::verifier::exit_code(&results)))
}

async fn update(ctx: &Context, args: &WindowArgs, options: UpdateOptions) -> Result<ExitCode, BoxError> {
    let window = args.resolve()?;
    let updater = AggregationUpdater::new(
        ctx.record_source()?,
        ctx.counter(),
        Arc::clone(&ctx.stores),
        ctx.config.upsert_strategy,
    );
    let results = updater
        .update_all(&ctx.registry, &args.record_type, &ctx.config.account_id, &window, options)
        .await?;

    let (mut updated, mut skipped, mut errors, mut failed_types) = (0, 0, 0, 0);
    println!("Update over {}", window);
    for entry in &results {
        match &entry.result {
            Ok(summary) => {
                updated += summary.updated;
                skipped += summary.skipped;
                errors += summary.errors;
                println!("  {}", summary);
            }
            Err(e) => {
                failed_types += 1;
                println!("  {}: failed: {}", entry.record_type, e);
            }
        }
    }
    println!(
        "Total: {} updated, {} skipped, {} errors, {} record types failed",
        updated, skipped, errors, failed_types
    );

    Ok(ExitCode::from(tallyflow::updater::exit_code(&results)))
}

async fn delete_all(ctx: &Context, dry_run: bool, yes: bool) -> Result<ExitCode, BoxError> {
    let store = ctx.stores.connect()?;
    let account_id = &ctx.config.account_id;

    if dry_run {
        let count = store.delete_all(account_id, true).await?;
        println!("Would delete {} buckets for account {}", count, account_id);
        return Ok(ExitCode::SUCCESS);
    }

    if !yes {
        let count = store.delete_all(account_id, true).await?;
        println!(
            "Refusing to delete {} buckets for account {} without --yes",
            count, account_id
        );
        return Ok(ExitCode::from(1));
    }

    let deleted = store.delete_all(account_id, false).await?;
    println!("Deleted {} buckets for account {}", deleted, account_id);
    Ok(ExitCode::SUCCESS)
}
