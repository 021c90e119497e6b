use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use pdca_client::HttpRemoteClient;
use pdca_core::Stage;
use pdca_sched::{
    parse_attempts, parse_ceiling, Coordinator, RunConfig, SchedulerError,
    ENV_MAX_SUBMIT_ATTEMPTS, ENV_SIMULTANEOUS_BATCHES,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod shutdown;

const EXIT_FAILED_BATCHES: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "pdca-cli")]
#[command(about = "Batch match & augment runner for the PDCA enrichment service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Match and augment every batch of the input file, resuming from existing output.
    Run {
        #[command(flatten)]
        overrides: Overrides,
        /// Reconcile record ids once every batch finished.
        #[arg(long)]
        reconcile: bool,
    },
    /// Rewrite batch-local record ids into dataset-global ones.
    Reconcile {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Count (or list) the distinct identifiers in the match and augment output.
    Unique {
        #[command(flatten)]
        overrides: Overrides,
        #[arg(long)]
        list: bool,
    },
    /// Join reconciled match rows with their augment rows into one CSV.
    Merge {
        #[command(flatten)]
        overrides: Overrides,
        /// Destination CSV file.
        #[arg(long, default_value = "merged.csv")]
        to: PathBuf,
        /// Comma-separated column order; defaults to every key, sorted.
        #[arg(long, value_delimiter = ',')]
        columns: Option<Vec<String>>,
    },
    /// Query the service health endpoint.
    Health {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Query the remaining service credits.
    Credits {
        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Flags that take precedence over the `PDCA_*` environment.
#[derive(Debug, Default, Args)]
struct Overrides {
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long)]
    input: Option<PathBuf>,
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    batch_size: Option<usize>,
    /// Ceiling per stage; `-1` or `unlimited` removes it.
    #[arg(long, allow_hyphen_values = true)]
    simultaneous_batches: Option<String>,
    #[arg(long)]
    match_schema: Option<u32>,
    #[arg(long)]
    augment_schema: Option<u32>,
    #[arg(long)]
    poll_interval_secs: Option<u64>,
    /// Rejections tolerated per batch; `0` or `unlimited` retries forever.
    #[arg(long)]
    max_submit_attempts: Option<String>,
    #[arg(long)]
    match_params: Option<PathBuf>,
}

impl Overrides {
    fn resolve(self) -> Result<RunConfig> {
        let mut config = RunConfig::from_env()?;
        if let Some(v) = self.base_url {
            config.base_url = v;
        }
        if let Some(v) = self.input {
            config.input_file = v;
        }
        if let Some(v) = self.output {
            config.output_dir = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.simultaneous_batches {
            config.simultaneous_batches = parse_ceiling(ENV_SIMULTANEOUS_BATCHES, &v)?;
        }
        if let Some(v) = self.match_schema {
            config.match_schema = v;
        }
        if let Some(v) = self.augment_schema {
            config.augment_schema = v;
        }
        if let Some(v) = self.poll_interval_secs {
            config.poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = self.max_submit_attempts {
            config.max_submit_attempts = parse_attempts(ENV_MAX_SUBMIT_ATTEMPTS, &v)?;
        }
        if let Some(v) = self.match_params {
            config.match_params_file = Some(v);
        }
        config.validate()?;
        Ok(config)
    }
}

fn coordinator(config: RunConfig) -> Result<Coordinator> {
    let client = HttpRemoteClient::new(config.http_client_config())?;
    Ok(Coordinator::new(config, Arc::new(client))?)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match execute(cli).await {
        Ok(code) => code,
        Err(err) => {
            if let Some(SchedulerError::Interrupted { pending }) = err.downcast_ref::<SchedulerError>() {
                warn!(pending, "run interrupted; rerun the same command to resume");
                return ExitCode::from(shutdown::EXIT_INTERRUPTED);
            }
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<ExitCode> {
    let command = cli.command.unwrap_or(Commands::Run {
        overrides: Overrides::default(),
        reconcile: false,
    });

    match command {
        Commands::Run {
            overrides,
            reconcile,
        } => {
            let coordinator = coordinator(overrides.resolve()?)?;
            let token = shutdown::register_handlers();
            let summary = coordinator.run(token).await?;
            println!(
                "run complete: run_id={} batches={} finished={} failed={} output={}",
                summary.run_id,
                summary.number_of_batches,
                summary.finished_batches,
                summary.failed_batches.len(),
                summary.output_dir
            );

            if reconcile {
                let match_failed = summary
                    .failed_batches
                    .iter()
                    .any(|f| f.stage == Stage::Match);
                if match_failed {
                    warn!("skipping reconciliation: some batches never finished matching");
                } else {
                    let reconciled = coordinator.reconcile().await?;
                    println!(
                        "reconciled: rewritten={} unshifted={} rows_shifted={}",
                        reconciled.files_rewritten, reconciled.files_unshifted, reconciled.rows_shifted
                    );
                }
            }

            if summary.has_failures() {
                return Ok(ExitCode::from(EXIT_FAILED_BATCHES));
            }
        }
        Commands::Reconcile { overrides } => {
            let coordinator = coordinator(overrides.resolve()?)?;
            let reconciled = coordinator.reconcile().await?;
            println!(
                "reconciled: rewritten={} unshifted={} rows_shifted={}",
                reconciled.files_rewritten, reconciled.files_unshifted, reconciled.rows_shifted
            );
        }
        Commands::Unique { overrides, list } => {
            let coordinator = coordinator(overrides.resolve()?)?;
            let (matched, augmented) = coordinator.unique_identifiers().await?;
            println!("matched identifiers: {}", matched.len());
            println!("augmented identifiers: {}", augmented.len());
            if list {
                for id in matched.union(&augmented) {
                    let tag = match (matched.contains(id), augmented.contains(id)) {
                        (true, true) => "both",
                        (true, false) => "match",
                        _ => "augment",
                    };
                    println!("{id}\t{tag}");
                }
            }
        }
        Commands::Merge {
            overrides,
            to,
            columns,
        } => {
            let coordinator = coordinator(overrides.resolve()?)?;
            let rows = coordinator.merge(&to, columns).await?;
            println!("merged {rows} rows into {}", to.display());
        }
        Commands::Health { overrides } => {
            let client = HttpRemoteClient::new(overrides.resolve()?.http_client_config())?;
            let health = client.health().await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
        Commands::Credits { overrides } => {
            let client = HttpRemoteClient::new(overrides.resolve()?.http_client_config())?;
            info!(base_url = client.base_url(), "querying credits");
            let credits = client.credits().await?;
            println!("{}", serde_json::to_string_pretty(&credits)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}
