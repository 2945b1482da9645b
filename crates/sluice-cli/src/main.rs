mod backend;
mod sink;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use sluice_client::ReqwestUpstream;
use sluice_core::checkpoint::{CheckpointPolicy, CheckpointStore};
use sluice_core::chess::{self, CALLBACK_API_URL, ChessConfig, OFFICIAL_API_URL};
use sluice_core::config::{DEFAULT_CONCURRENCY, EngineConfig};
use sluice_core::range::MonthRange;
use sluice_core::error::AppError;
use sluice_core::runner::{PipelineRunner, RunReport, TracingRunReporter};
use sluice_core::throttle::{ThrottleConfig, ThrottledUpstream};
use sluice_core::traits::CheckpointBackend;

use crate::backend::StateBackend;
use crate::sink::JsonLinesSink;

#[derive(Parser)]
#[command(name = "sluice", version, about = "Incremental chess.com data extraction")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where checkpoints live.
#[derive(Args)]
struct StateArgs {
    /// Pipeline identity scoping the checkpoints
    #[arg(long, env = "SLUICE_PIPELINE", default_value = "chess_pipeline")]
    pipeline_name: String,

    /// Directory for file checkpoints (ignored when DATABASE_URL is set)
    #[arg(long, env = "SLUICE_STATE_DIR", default_value = ".sluice")]
    state_dir: PathBuf,
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    /// Persist a page only after its records were written
    CommitOnYield,
    /// Persist a page as soon as its fetch is submitted
    MarkOnSubmit,
}

impl From<PolicyArg> for CheckpointPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::CommitOnYield => CheckpointPolicy::CommitOnYield,
            PolicyArg::MarkOnSubmit => CheckpointPolicy::MarkOnSubmit,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Extract the selected resources and write records as JSON lines
    Run {
        #[command(flatten)]
        state: StateArgs,

        /// Comma-separated player usernames
        #[arg(short, long, value_delimiter = ',', required = true)]
        players: Vec<String>,

        /// First archive month to fetch, inclusive (YYYY/MM)
        #[arg(long)]
        start_month: Option<String>,

        /// Last archive month to fetch, inclusive (YYYY/MM)
        #[arg(long)]
        end_month: Option<String>,

        /// Comma-separated resources to run (defaults to the selected set)
        #[arg(short, long, value_delimiter = ',')]
        resources: Vec<String>,

        /// Maximum concurrent page fetches per resource
        #[arg(short = 'k', long, default_value_t = DEFAULT_CONCURRENCY)]
        concurrency: usize,

        /// Attempts per request before giving up
        #[arg(long, default_value_t = 10)]
        max_attempts: u32,

        /// Delay before the first retry, in milliseconds
        #[arg(long, default_value_t = 1000)]
        initial_delay_ms: u64,

        /// Multiplier applied to the delay after each retry
        #[arg(long, default_value_t = 1.1)]
        backoff_factor: f64,

        /// When processed pages become durable
        #[arg(long, value_enum, default_value_t = PolicyArg::CommitOnYield)]
        checkpoint_policy: PolicyArg,

        /// Write one <resource>.jsonl file per resource here instead of stdout
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Base URL of the public API
        #[arg(long, env = "SLUICE_API_URL", default_value = OFFICIAL_API_URL)]
        api_url: String,

        /// Base URL of the callback API used for online status
        #[arg(long, env = "SLUICE_CALLBACK_URL", default_value = CALLBACK_API_URL)]
        callback_url: String,

        /// Bearer token sent with every request
        #[arg(long, env = "SLUICE_API_TOKEN", hide_env_values = true)]
        api_token: Option<String>,

        /// Minimum delay between requests to the same host, in milliseconds
        #[arg(long, default_value_t = 0)]
        throttle_ms: u64,

        /// Per-request timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },

    /// Forget every processed item of one resource
    Reset {
        #[command(flatten)]
        state: StateArgs,

        /// Resource whose checkpoints are cleared
        #[arg(short, long)]
        resource: String,
    },

    /// List the checkpoint scopes of a pipeline
    State {
        #[command(flatten)]
        state: StateArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Logs go to stderr so stdout carries only records
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sluice=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            state,
            players,
            start_month,
            end_month,
            resources,
            concurrency,
            max_attempts,
            initial_delay_ms,
            backoff_factor,
            checkpoint_policy,
            output_dir,
            api_url,
            callback_url,
            api_token,
            throttle_ms,
            timeout_secs,
        } => {
            let chess_config = ChessConfig::new(players)
                .with_months(start_month.as_deref(), end_month.as_deref())
                .with_api_url(api_url)
                .with_callback_url(callback_url);
            let engine = EngineConfig::default()
                .with_concurrency(concurrency)
                .with_retry_params(
                    max_attempts,
                    Duration::from_millis(initial_delay_ms),
                    backoff_factor,
                )
                .with_checkpoint_policy(checkpoint_policy.into());

            let mut client = ReqwestUpstream::with_timeout(Duration::from_secs(timeout_secs))
                .context("Failed to create HTTP client")?;
            if let Some(token) = api_token {
                client = client.with_bearer_token(token);
            }
            let throttle = ThrottleConfig::new(Duration::from_millis(throttle_ms))
                .with_jitter(Duration::from_millis(throttle_ms / 2));
            let upstream = ThrottledUpstream::new(client, throttle);

            let sink = match output_dir {
                Some(dir) => JsonLinesSink::to_dir(dir),
                None => JsonLinesSink::stdout(),
            };

            cmd_run(&state, chess_config, &resources, engine, upstream, sink).await?;
        }
        Commands::Reset { state, resource } => {
            cmd_reset(&state, &resource).await?;
        }
        Commands::State { state } => {
            cmd_state(&state).await?;
        }
    }

    Ok(())
}

async fn cmd_run(
    state: &StateArgs,
    chess_config: ChessConfig,
    resources: &[String],
    engine: EngineConfig,
    upstream: ThrottledUpstream<ReqwestUpstream>,
    mut sink: JsonLinesSink,
) -> Result<()> {
    // Fail on bad input before touching the network or the state store
    engine.validate()?;
    MonthRange::parse(
        chess_config.start_month.as_deref(),
        chess_config.end_month.as_deref(),
    )?;
    let source = chess::compose(chess_config)?;
    let source = if resources.is_empty() {
        source.selected()
    } else {
        source.select(resources)?
    };

    let backend = StateBackend::open(&state.state_dir)
        .await
        .context("Failed to open checkpoint storage")?;
    tracing::info!(
        pipeline = %state.pipeline_name,
        backend = %backend.describe(),
        resources = %source.names().join(","),
        "Starting extraction"
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, stopping after the current page");
                cancel.cancel();
            }
        }
    });

    let mut runner = PipelineRunner::new(upstream, backend, &state.pipeline_name, engine);
    let result = runner
        .run(&source, &mut sink, &cancel, &TracingRunReporter)
        .await;
    let finished = sink.finish().await;

    let report = settle_run(result, finished)?;
    tracing::info!(
        run_id = %report.run_id,
        records = report.records_emitted(),
        written = sink.written(),
        tasks = report.tasks_submitted(),
        "Extraction complete"
    );

    Ok(())
}

/// The run's own failure takes precedence over a failure to flush output.
fn settle_run(
    result: Result<RunReport, AppError>,
    finished: Result<(), AppError>,
) -> Result<RunReport> {
    match (result, finished) {
        (Ok(report), Ok(())) => Ok(report),
        (Ok(_), Err(e)) => Err(e).context("Failed to flush output"),
        (Err(e), finished) => {
            if let Err(flush_err) = finished {
                tracing::error!(error = %flush_err, "Failed to flush output after run failure");
            }
            Err(e).context("Extraction run failed")
        }
    }
}

async fn cmd_reset(state: &StateArgs, resource: &str) -> Result<()> {
    let known = chess::compose(ChessConfig::new(Vec::<String>::new()))?;
    if known.resource(resource).is_none() {
        anyhow::bail!(
            "Unknown resource '{resource}'; available: {}",
            known.names().join(", ")
        );
    }

    let backend = StateBackend::open(&state.state_dir).await?;
    let mut store = CheckpointStore::new(
        backend,
        state.pipeline_name.as_str(),
        CheckpointPolicy::default(),
    );
    let removed = store.reset(resource).await?;

    println!(
        "Cleared {removed} checkpoint(s) for {resource} in pipeline {}",
        state.pipeline_name
    );
    Ok(())
}

async fn cmd_state(state: &StateArgs) -> Result<()> {
    let backend = StateBackend::open(&state.state_dir).await?;
    let scopes = backend.scopes(&state.pipeline_name).await?;

    if scopes.is_empty() {
        println!("No checkpoints for pipeline {}", state.pipeline_name);
        return Ok(());
    }

    println!(
        "Checkpoints for pipeline {} ({}):\n",
        state.pipeline_name,
        backend.describe()
    );
    for scope in &scopes {
        let updated = scope
            .last_updated
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<24} {:>8} entries  (updated {updated})",
            scope.resource, scope.entries
        );
    }

    Ok(())
}
