//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use drover_core::app::{RecordOutcome, ResetOutcome};
use drover_core::config::{CONFIG_FILE_NAME, DroverConfig, init_config, load_config};
use drover_core::domain::ItemId;
use drover_core::ports::{NoopEnricher, SystemClock, UlidGenerator};
use drover_core::{App, AppBuilder};
use drover_libsql::LibsqlRecordStore;
use tracing::info;

use crate::collaborators::{FsArtifactSink, HttpSource, HttpSubItems, http_client};
use crate::seed;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// drover: N workers draining one shared backlog.
#[derive(Parser)]
#[command(
    name = "drover",
    version,
    about = "Claim-check workers over a shared SQLite backlog.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (missing file = defaults).
    #[arg(long, default_value = CONFIG_FILE_NAME, global = true)]
    pub config: PathBuf,

    /// Database path; overrides `[store] path`.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Start the worker pool.
    Run {
        /// Worker count; overrides `[worker] count`.
        #[arg(short, long)]
        workers: Option<usize>,

        /// Exit once nothing is pending or claimed.
        #[arg(long)]
        drain: bool,

        /// Only claim items of this category.
        #[arg(long)]
        category: Option<String>,
    },

    /// Claim, process and record one item, then exit.
    Process {
        /// Item id (`item-<ulid>` or bare ULID).
        id: ItemId,
    },

    /// Print backlog counts.
    Status {
        #[arg(long)]
        category: Option<String>,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Put items back to pending.
    Reset {
        /// Item id (`item-<ulid>` or bare ULID).
        #[arg(required_unless_present = "all_failed")]
        id: Option<ItemId>,

        /// Also reset an item that is already done.
        #[arg(long, conflicts_with = "all_failed")]
        force: bool,

        /// Reset every failed item.
        #[arg(long, conflicts_with = "id")]
        all_failed: bool,

        /// With --all-failed: only this category.
        #[arg(long, requires = "all_failed")]
        category: Option<String>,
    },

    /// Show one item with its sub-items.
    Inspect {
        id: ItemId,
    },

    /// Insert items from a JSONL file.
    Seed {
        file: PathBuf,
    },

    /// Write a default config file.
    InitConfig {
        path: Option<PathBuf>,
    },
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "drover=info",
        1 => "drover=debug",
        _ => "drover=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

pub(crate) async fn run(cli: Cli) -> Result<()> {
    if let Command::InitConfig { path } = &cli.command {
        let path = path.as_deref().unwrap_or(&cli.config);
        init_config(path).wrap_err_with(|| format!("writing {}", path.display()))?;
        println!("wrote {}", path.display());
        return Ok(());
    }

    let mut config =
        load_config(&cli.config).wrap_err_with(|| format!("loading {}", cli.config.display()))?;
    if let Some(db) = cli.db {
        config.store.path = db;
    }

    match cli.command {
        Command::Run {
            workers,
            drain,
            category,
        } => {
            if let Some(workers) = workers {
                config.worker.count = workers;
            }
            if category.is_some() {
                config.claim.category = category;
            }
            cmd_run(config, drain).await
        }
        Command::Process { id } => cmd_process(config, id).await,
        Command::Status { category, json } => cmd_status(config, category, json).await,
        Command::Reset {
            id,
            force,
            all_failed,
            category,
        } => cmd_reset(config, id, force, all_failed, category).await,
        Command::Inspect { id } => cmd_inspect(config, id).await,
        Command::Seed { file } => cmd_seed(config, &file).await,
        Command::InitConfig { .. } => Ok(()),
    }
}

/// Open the store and wire the HTTP collaborators.
async fn build_app(config: DroverConfig) -> Result<App> {
    let store = LibsqlRecordStore::open_with_config(&config.store)
        .await
        .wrap_err_with(|| format!("opening {}", config.store.path.display()))?;
    let client = http_client(&config.http).wrap_err("building HTTP client")?;
    let token = config.http.auth_token();
    let sink = FsArtifactSink::new(&config.http.output_dir);

    let app = AppBuilder::new(config)
        .store(Arc::new(store))
        .source(Arc::new(HttpSource::new(client.clone(), token.clone())))
        .sub_items(Arc::new(HttpSubItems::new(client, token)))
        .enricher(Arc::new(NoopEnricher))
        .sink(Arc::new(sink))
        .build()?;
    Ok(app)
}

async fn cmd_run(config: DroverConfig, drain: bool) -> Result<()> {
    let app = build_app(config).await?;
    let category = app.config().claim.category.clone();
    info!(
        workers = app.config().worker.count,
        db = %app.config().store.path.display(),
        category = category.as_deref().unwrap_or("*"),
        drain,
        "starting workers"
    );

    let supervisor = app.supervisor();
    let report = if drain {
        supervisor
            .run_until_drained(&app.operator(), category.as_deref())
            .await?
    } else {
        supervisor.run_until_signal().await
    };

    let stats = report.stats;
    println!(
        "claimed {} (reclaimed {}), done {}, failed {}, conflicts {}, store errors {}, panics {}",
        stats.claimed,
        stats.reclaimed,
        stats.done,
        stats.failed,
        stats.conflicts,
        stats.store_errors,
        stats.panics,
    );
    if report.crashes > 0 || !report.aborted.is_empty() {
        println!(
            "crashes {}, restarts {}, aborted workers {:?}",
            report.crashes, report.restarts, report.aborted
        );
    }
    Ok(())
}

async fn cmd_process(config: DroverConfig, id: ItemId) -> Result<()> {
    let app = build_app(config).await?;
    let mut worker = app.worker_as(0, format!("cli@{}", std::process::id()));
    match worker.process_id(id).await? {
        RecordOutcome::Recorded(status) => println!("{id}: {status}"),
        RecordOutcome::Conflict { observed } => {
            let status = observed.map(|item| item.status.to_string());
            println!(
                "{id}: claim superseded, outcome discarded (now {})",
                status.as_deref().unwrap_or("missing")
            );
        }
    }
    Ok(())
}

async fn cmd_status(config: DroverConfig, category: Option<String>, json: bool) -> Result<()> {
    let app = build_app(config).await?;
    let report = app.operator().status(category.as_deref()).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{report}");
    }
    Ok(())
}

async fn cmd_reset(
    config: DroverConfig,
    id: Option<ItemId>,
    force: bool,
    all_failed: bool,
    category: Option<String>,
) -> Result<()> {
    let app = build_app(config).await?;
    let operator = app.operator();

    if all_failed {
        let n = operator.reset_failed(category.as_deref()).await?;
        println!("reset {n} failed item(s)");
        return Ok(());
    }

    let Some(id) = id else {
        return Ok(());
    };
    match operator.reset(id, force).await? {
        ResetOutcome::Reset { previous, attempts } => {
            println!("{id}: {previous} -> pending (attempts so far: {attempts})");
        }
        ResetOutcome::AlreadyPending => println!("{id}: already pending"),
    }
    Ok(())
}

async fn cmd_inspect(config: DroverConfig, id: ItemId) -> Result<()> {
    let app = build_app(config).await?;
    let detail = app.operator().inspect(id).await?;
    println!("{}", serde_json::to_string_pretty(&detail)?);
    Ok(())
}

async fn cmd_seed(config: DroverConfig, file: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .wrap_err_with(|| format!("reading {}", file.display()))?;
    let items = seed::parse(&content, &UlidGenerator::new(SystemClock))?;

    let app = build_app(config).await?;
    let summary = seed::insert_all(app.store().as_ref(), items).await?;
    println!(
        "seeded {} item(s), skipped {} duplicate(s)",
        summary.inserted, summary.duplicates
    );
    Ok(())
}
