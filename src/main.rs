use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use bandwatch::config::{AppConfig, LoggingConfig};
use bandwatch::results::{ResultFilter, ResultRecorder};
use bandwatch::scheduler::history::RunStatus;
use bandwatch::scheduler::{cron, DispatchRequest, NewSchedule, ScheduleRegistry};
use bandwatch::throughput::provider::LIBRESPEED;
use bandwatch::throughput::report;

#[derive(Parser)]
#[command(
    name = "bandwatch",
    about = "Scheduled network speed tests with pluggable providers",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (overrides BANDWATCH_CONFIG and /etc/bandwatch/bandwatch.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + scheduler)
    Serve {
        /// Bind address, overrides server.bind
        #[arg(long, env = "BANDWATCH_BIND")]
        bind: Option<String>,
    },

    /// Run a single speed test now and record it
    SpeedTest {
        /// Provider to run
        #[arg(long, default_value = LIBRESPEED)]
        provider: String,

        /// Target host for self-hosted providers
        #[arg(long)]
        host: Option<String>,

        /// Target port for self-hosted providers
        #[arg(long)]
        port: Option<u16>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Manage scheduled tests
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Show recorded results, newest first
    Results {
        #[arg(long, default_value = "20")]
        limit: u32,

        /// Only results from this provider
        #[arg(long)]
        provider: Option<String>,

        /// Only results from this schedule
        #[arg(long)]
        schedule: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// List registered providers and whether their tools are installed
    Providers,
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List all schedules
    List,

    /// Add a new schedule
    Add {
        /// Schedule name
        #[arg(long)]
        name: String,

        /// Cron expression (5-field)
        #[arg(long)]
        cron: String,

        /// Provider to run
        #[arg(long, default_value = LIBRESPEED)]
        provider: String,

        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        /// Results to keep for this schedule (0 keeps all)
        #[arg(long, default_value = "0")]
        limit: i64,

        /// Create the schedule disabled
        #[arg(long)]
        inactive: bool,
    },

    /// Remove a schedule
    Remove {
        /// Schedule id
        id: String,
    },

    /// Enable a schedule
    Enable { id: String },

    /// Disable a schedule
    Disable { id: String },

    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },

    /// Explain a cron expression in words
    Describe { expression: String },
}

fn init_tracing(cfg: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));
    if cfg.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "starting bandwatch daemon");

            let shutdown = CancellationToken::new();
            let token = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown signal received");
                    token.cancel();
                }
            });
            bandwatch::serve(config, shutdown).await?;
        }
        Commands::SpeedTest {
            provider,
            host,
            port,
            json,
        } => {
            let (pool, dispatcher) = bandwatch::open_core(&config)?;
            let mut req = DispatchRequest::manual(&provider);
            req.host_endpoint = host;
            req.host_port = port.map(|p| p.to_string());

            tracing::info!(provider = %req.key(), "running speed test");
            let entry = dispatcher.try_dispatch(req)?.wait().await?;
            let result_id = match (entry.status, entry.result_id) {
                (RunStatus::Success, Some(id)) => id,
                _ => bail!(
                    "speed test {}: {}",
                    entry.status.as_str(),
                    entry.error.unwrap_or_default()
                ),
            };

            let stored = ResultRecorder::new(pool).get(result_id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stored)?);
            } else {
                println!("{}", report::format_summary(&provider, &stored.result));
            }
        }
        Commands::Schedule { action } => {
            run_schedule_action(&config, action)?;
        }
        Commands::Results {
            limit,
            provider,
            schedule,
            json,
        } => {
            let pool = bandwatch::storage::open_pool(&config.storage.database_path.to_string_lossy())?;
            let filter = ResultFilter {
                providers: provider.into_iter().collect(),
                schedule_ids: schedule.into_iter().collect(),
                limit,
                ..Default::default()
            };
            let results = ResultRecorder::new(pool).query(&filter)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else if results.is_empty() {
                println!("No results recorded.");
            } else {
                for r in &results {
                    println!(
                        "{} #{:<6} {}",
                        r.result.timestamp.format("%Y-%m-%d %H:%M"),
                        r.id,
                        report::format_summary(&r.provider_name, &r.result)
                    );
                }
            }
        }
        Commands::Providers => {
            let (_pool, dispatcher) = bandwatch::open_core(&config)?;
            let registry = dispatcher.providers();
            println!("{:<12} | {:<10} | {:<9} | Description", "Name", "Installed", "Needs host");
            println!("{:-<12}-|-{:-<10}-|-{:-<9}-|-{:-<40}", "", "", "", "");
            for name in registry.names() {
                let provider = registry.get(&name)?;
                let meta = provider.meta();
                println!(
                    "{:<12} | {:<10} | {:<9} | {}",
                    meta.name,
                    if provider.is_available() { "yes" } else { "no" },
                    if meta.requires_host { "yes" } else { "no" },
                    meta.description
                );
                if !provider.is_available() {
                    println!("{:<12} | {:<10} | {:<9} |   -> {}", "", "", "", meta.install_hint);
                }
            }
        }
    }

    Ok(())
}

fn run_schedule_action(config: &AppConfig, action: ScheduleAction) -> Result<()> {
    if let ScheduleAction::Describe { expression } = &action {
        println!("{}", cron::describe(expression)?);
        return Ok(());
    }

    let (pool, _dispatcher) = bandwatch::open_core(config)?;
    let registry = ScheduleRegistry::new(pool);

    match action {
        ScheduleAction::List => {
            let list = registry.list()?;
            if list.is_empty() {
                println!("No schedules found.");
            } else {
                println!(
                    "{:<36} | {:<20} | {:<15} | {:<10} | Active",
                    "ID", "Name", "Cron", "Provider"
                );
                println!("{:-<36}-|-{:-<20}-|-{:-<15}-|-{:-<10}-|-{:-<6}", "", "", "", "", "");
                for s in list {
                    println!(
                        "{:<36} | {:<20} | {:<15} | {:<10} | {}",
                        s.id, s.name, s.cron_expression, s.provider_name, s.is_active
                    );
                }
            }
        }
        ScheduleAction::Add {
            name,
            cron,
            provider,
            host,
            port,
            limit,
            inactive,
        } => {
            let schedule = registry.create(NewSchedule {
                name,
                cron_expression: cron,
                provider_id: None,
                provider_name: Some(provider),
                host_endpoint: host,
                host_port: port.map(|p| p.to_string()),
                is_active: !inactive,
                result_limit: limit,
            })?;
            println!("Schedule '{}' added ({}).", schedule.name, schedule.id);
        }
        ScheduleAction::Remove { id } => {
            registry.delete(&id)?;
            println!("Schedule '{}' removed.", id);
        }
        ScheduleAction::Enable { id } => {
            let s = registry.set_active(&id, true)?;
            println!("Schedule '{}' enabled.", s.name);
        }
        ScheduleAction::Disable { id } => {
            let s = registry.set_active(&id, false)?;
            println!("Schedule '{}' disabled.", s.name);
        }
        ScheduleAction::DryRun { hours } => {
            let preview = registry
                .preview_next_runs(hours, Utc::now())
                .context("failed to compute preview")?;
            if preview.is_empty() {
                println!("No runs scheduled in next {} hours.", hours);
            } else {
                println!("Upcoming runs (next {} hours):", hours);
                for run in preview {
                    println!(
                        "{} : {} ({})",
                        run.at.format("%Y-%m-%d %H:%M"),
                        run.schedule_name,
                        run.provider_name
                    );
                }
            }
        }
        ScheduleAction::Describe { .. } => {}
    }

    Ok(())
}
