use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};

use usagewatch::attribution::contribution::ForecastBound;
use usagewatch::config::Config;
use usagewatch::event::ingest::read_jsonl_file;
use usagewatch::event::Event;
use usagewatch::pipeline::{BucketRange, Pipeline};
use usagewatch::scheduler::Scheduler;
use usagewatch::storage::{self, derived, events, schema};

#[derive(Parser)]
#[command(
    name = "usagewatch",
    about = "Usage baselining, anomaly scoring, and cost attribution for warehouse telemetry",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, env = "USAGEWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append usage events from a JSON-lines file to the event log
    Ingest {
        /// JSON-lines file, one event per line
        file: PathBuf,
    },

    /// Manage upstream forecast bounds
    Forecast {
        #[command(subcommand)]
        action: ForecastAction,
    },

    /// Recompute every materialization for a range of closed days
    Recompute {
        /// First day (YYYY-MM-DD); without it the whole event log is recomputed
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Last day, inclusive (defaults to --from, or the last logged day)
        #[arg(long)]
        to: Option<NaiveDate>,
    },

    /// Start the daemon (read API + scheduled recomputes)
    Serve {
        /// Bind address (overrides [api] bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Inspect the recompute schedule
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Print rows of a materialization
    Show {
        /// Materialization name, e.g. user_behavior_profile
        view: String,

        /// First day (YYYY-MM-DD)
        #[arg(long)]
        from: NaiveDate,

        /// Last day, inclusive (defaults to --from)
        #[arg(long)]
        to: Option<NaiveDate>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ForecastAction {
    /// Import bounds from a JSON-lines file, replacing existing (date, metric) rows
    Import {
        /// JSON-lines file, one bound per line
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

fn init_tracing(config: &Config, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json || config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn cell(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::resolve(cli.config.as_deref())?;
    init_tracing(&config, cli.log_json);

    match cli.command {
        Commands::Ingest { file } => {
            let pool = storage::open_pool(&config.storage.db_path)?;
            let batch: Vec<Event> = read_jsonl_file(&file)?;
            let written = events::append_events(&pool, &batch)?;
            println!("Ingested {} event(s) from {}.", written, file.display());
        }
        Commands::Forecast { action } => match action {
            ForecastAction::Import { file } => {
                let pool = storage::open_pool(&config.storage.db_path)?;
                let bounds: Vec<ForecastBound> = read_jsonl_file(&file)?;
                let written = events::import_forecast_bounds(&pool, &bounds)?;
                println!("Imported {} forecast bound(s).", written);
            }
        },
        Commands::Recompute { from, to } => {
            let pool = storage::open_pool(&config.storage.db_path)?;
            let range = match (from, events::event_day_range(&pool)?) {
                (Some(from), _) => BucketRange::new(from, to.unwrap_or(from))?,
                (None, Some((first, last))) => BucketRange::new(first, to.unwrap_or(last))?,
                (None, None) => bail!("the event log is empty; nothing to recompute"),
            };
            let source = Arc::new(events::SqliteEventSource::new(pool.clone()));
            let summary = Pipeline::new(pool, source, &config).recompute(range).await?;

            println!("Run {} ({} .. {})", summary.run_id, range.start, range.end);
            println!("{:<12} | {:<8} | {:>6} | {:>8} | {:>6} | Detail", "Bucket", "Status", "Rows", "Excluded", "Guards");
            println!("{:-<12}-|-{:-<8}-|-{:-<6}-|-{:-<8}-|-{:-<6}-|-{:-<30}", "", "", "", "", "", "");
            for b in &summary.buckets {
                println!(
                    "{:<12} | {:<8} | {:>6} | {:>8} | {:>6} | {}",
                    b.bucket,
                    b.status,
                    b.rows_written,
                    b.excluded_events,
                    b.degenerate_baselines + b.zero_denominator_attributions,
                    b.error.as_deref().unwrap_or("")
                );
            }
            if let Some(failed) = summary.first_failure() {
                bail!("recompute halted at bucket {}", failed.bucket);
            }
        }
        Commands::Serve { bind } => {
            let mut config = config;
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, "Starting usagewatch daemon");
            usagewatch::serve(config).await?;
        }
        Commands::Schedule { action } => match action {
            ScheduleAction::DryRun { hours } => {
                let scheduler = Scheduler::new(&config.schedule)?;
                let preview = scheduler.preview(Utc::now(), hours);
                if preview.is_empty() {
                    println!("No runs scheduled in next {} hours.", hours);
                } else {
                    println!("Upcoming runs (next {} hours):", hours);
                    for run in preview {
                        println!("{} : recompute {} .. {}", run.at.to_rfc3339(), run.range.start, run.range.end);
                    }
                }
            }
        },
        Commands::Show { view, from, to, json } => {
            let Some(view) = schema::public_view(&view) else {
                bail!("unknown materialization '{}'", view);
            };
            let range = BucketRange::new(from, to.unwrap_or(from))?;
            let pool = storage::open_pool(&config.storage.db_path)?;
            let conn = pool.get()?;
            let rows = derived::read_view(&conn, view, range.start, range.end)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                let columns: Vec<&str> = view.column_names().collect();
                println!("{}", columns.join(" | "));
                for row in &rows {
                    let cells: Vec<String> = columns.iter().map(|c| cell(&row[*c])).collect();
                    println!("{}", cells.join(" | "));
                }
                println!("({} row(s))", rows.len());
            }
        }
    }

    Ok(())
}
