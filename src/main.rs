use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use proxysift::config::{Config, LoggingConfig, CONFIG_ENV};
use proxysift::ingest::LatencyIngester;
use proxysift::logfile::RotatingFile;
use proxysift::measure::{self, MeasureMode};
use proxysift::proxy::{ProxyCandidateSelector, SelectorMode};
use proxysift::scheduler::RetestScheduler;
use proxysift::speed::SpeedSelector;
use proxysift::CandidateStore;

/// Exit status for a run stopped by Ctrl-C or SIGTERM.
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(
    name = "proxysift",
    about = "Keep a tested pool of proxy candidates and publish the best per location",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, env = CONFIG_ENV, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one full pass: collect, latency test, speed test, publish
    Run,

    /// Preview the links the next latency run would measure
    Due {
        /// Treat these links as newly discovered
        #[arg(long = "link")]
        links: Vec<String>,
    },

    /// Merge an existing xray-knife CSV report into the store
    Ingest {
        /// Which measurement produced the report
        #[arg(long, value_enum)]
        mode: MeasureMode,

        /// CSV report path
        #[arg(long)]
        file: PathBuf,
    },

    /// List the links a local proxy would be started with
    Candidates {
        /// Override the configured selector
        #[arg(long, value_enum)]
        mode: Option<SelectorMode>,

        /// Override the configured link limit
        #[arg(long)]
        max_links: Option<u32>,
    },

    /// Show pool occupancy per location
    Status {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load_validated(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = init_tracing(&config.logging) {
        eprintln!("error: {e:#}");
        return ExitCode::FAILURE;
    }

    match execute(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if proxysift::cancel::is_cancelled(&e) => {
            eprintln!("cancelled: {e}");
            ExitCode::from(EXIT_CANCELLED)
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .with_context(|| format!("invalid log level: {}", logging.level))?;

    let writer = match &logging.file {
        Some(path) => {
            let rotate = &logging.rotate;
            let (max_bytes, backups) = if rotate.enabled {
                (rotate.max_bytes, rotate.backup_count)
            } else {
                (0, 0)
            };
            BoxMakeWriter::new(Mutex::new(RotatingFile::open(path, max_bytes, backups)?))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn execute(command: Commands, config: Config) -> Result<()> {
    match command {
        Commands::Run => {
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                warn!("shutdown signal received, cancelling run");
                trigger.cancel();
            });

            match proxysift::run(config, cancel).await {
                Ok(report) => {
                    println!("{}", serde_json::to_string_pretty(&report.best)?);
                    println!("{}", report.stats.summary_json());
                }
                Err(failure) => {
                    println!("{}", failure.stats.summary_json());
                    return Err(failure.error);
                }
            }
        }
        Commands::Due { links } => {
            let store = open_store(&config.database.path)?;
            let new_links = links.into_iter().collect();
            let due = RetestScheduler::from_config(&config.database).links_to_test(
                &store,
                &new_links,
                Utc::now(),
                &CancellationToken::new(),
            )?;
            for link in &due {
                println!("{link}");
            }
            info!(count = due.len(), "links due for testing");
        }
        Commands::Ingest { mode, file } => {
            let store = open_store(&config.database.path)?;
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read report: {}", file.display()))?;
            let records = measure::csv::parse(&text)?;

            match mode {
                MeasureMode::Latency => {
                    let results = measure::parse_latency_records(&records);
                    let summary = LatencyIngester::from_config(&config.database).ingest(
                        &store,
                        &results,
                        Utc::now(),
                        &CancellationToken::new(),
                    )?;
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                }
                MeasureMode::Speed => {
                    let results = measure::parse_speed_records(&records);
                    let selector = SpeedSelector::from_config(&config.speed_test);
                    let pool = selector.candidates(&store)?;
                    let selection = selector.reduce(&store, &pool, &results, Utc::now())?;
                    println!("{}", serde_json::to_string_pretty(&selection)?);
                }
            }
            store.close();
        }
        Commands::Candidates { mode, max_links } => {
            let store = open_store(&config.database.path)?;
            let selector = ProxyCandidateSelector::new(
                mode.unwrap_or(config.proxy.selector),
                max_links.unwrap_or(config.proxy.max_links),
            );
            for link in selector.select(&store)? {
                println!("{link}");
            }
        }
        Commands::Status { json } => {
            let store = open_store(&config.database.path)?;
            let locations = store.location_summary()?;
            let counts = store.status_counts()?;
            if json {
                let output = serde_json::json!({ "statuses": counts, "locations": locations });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("{:<16} | {:>6} | {:>12} | {:>6}", "Location", "Active", "Speed passed", "Failed");
                println!("{:-<16}-|-{:->6}-|-{:->12}-|-{:->6}", "", "", "", "");
                for loc in &locations {
                    println!(
                        "{:<16} | {:>6} | {:>12} | {:>6}",
                        loc.location, loc.active, loc.speed_passed, loc.failed
                    );
                }
                println!();
                for (status, count) in &counts {
                    println!("{status:<16} : {count}");
                }
            }
        }
    }

    Ok(())
}

fn open_store(path: &Path) -> Result<CandidateStore> {
    CandidateStore::open(path).with_context(|| format!("failed to open store: {}", path.display()))
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
