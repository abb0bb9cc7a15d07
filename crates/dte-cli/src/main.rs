use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use dte_client::ReqwestExecutor;
use dte_core::job::{HttpMethod, JobStatus, JobTarget, Priority, SubmitJobRequest};
use dte_core::traits::{Executor, ResultStore};
use dte_core::{Engine, EngineConfig, InMemoryJobQueue, InMemoryResultStore, JobQueue};
use dte_db::{Database, DatabaseConfig, PgJobQueue, PgResultStore};

#[derive(Parser)]
#[command(name = "dte", version, about = "Distributed task execution engine")]
struct Cli {
    /// Directory that file downloads are written under
    #[arg(long, global = true, env = "DTE_DOWNLOAD_DIR", default_value = "downloads")]
    download_dir: PathBuf,

    /// Allow targets on private or loopback addresses
    #[arg(long, global = true, default_value_t = false)]
    allow_private: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a job to the broker
    Submit(TargetArgs),

    /// Show a job's status and attempt history
    Status {
        /// Job ID
        job_id: Uuid,
    },

    /// Cancel a job that has not finished yet
    Cancel {
        /// Job ID
        job_id: Uuid,
    },

    /// List recent jobs
    Jobs {
        /// Only show jobs with this status
        #[arg(short, long, value_parser = JobStatus::from_str)]
        status: Option<JobStatus>,

        /// Number of jobs to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Also print the job count per status
        #[arg(long, default_value_t = false)]
        counts: bool,
    },

    /// Print queue depth, worker and proxy counts, and the circuit state
    Health,

    /// Run a worker pool against the broker until Ctrl+C
    Worker {
        /// Number of concurrent workers (overrides WORKER_CONCURRENCY)
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Seconds between health log lines
        #[arg(long, default_value_t = 30)]
        health_interval: u64,
    },

    /// Execute one job in-process without a broker and print the outcome
    Run(TargetArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum TargetKind {
    Fetch,
    Api,
    Download,
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Target URL
    #[arg(short, long)]
    url: String,

    /// What to do with the target
    #[arg(short, long, value_enum, default_value_t = TargetKind::Fetch)]
    kind: TargetKind,

    /// HTTP method for API calls
    #[arg(short, long, default_value = "GET", value_parser = HttpMethod::from_str)]
    method: HttpMethod,

    /// JSON request body for API calls
    #[arg(short, long)]
    body: Option<String>,

    /// Relative path the download is written to
    #[arg(short, long)]
    destination: Option<PathBuf>,

    /// Extra request header, as "Name: value" (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Dispatch priority: low, normal, high or critical
    #[arg(short, long, default_value = "normal", value_parser = Priority::from_str)]
    priority: Priority,

    /// Retries after the first attempt (defaults to MAX_RETRIES)
    #[arg(long)]
    max_retries: Option<u32>,

    /// Opaque JSON object carried with the job
    #[arg(long)]
    payload: Option<String>,
}

impl TargetArgs {
    fn into_request(self) -> Result<SubmitJobRequest> {
        let headers = parse_headers(&self.headers)?;
        let target = match self.kind {
            TargetKind::Fetch => JobTarget::HttpFetch {
                url: self.url,
                headers,
            },
            TargetKind::Api => {
                let body = self
                    .body
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()
                    .context("Invalid JSON in --body")?;
                JobTarget::ApiCall {
                    url: self.url,
                    method: self.method,
                    body,
                    headers,
                }
            }
            TargetKind::Download => {
                let Some(destination) = self.destination else {
                    bail!("--destination is required for downloads");
                };
                JobTarget::file_download(self.url, destination)
            }
        };

        let mut request = SubmitJobRequest::new(target).with_priority(self.priority);
        if let Some(max) = self.max_retries {
            request = request.with_max_retries(max);
        }
        if let Some(raw) = self.payload {
            let payload = serde_json::from_str(&raw).context("Invalid JSON in --payload")?;
            request = request.with_payload(payload);
        }
        Ok(request)
    }
}

/// Parse `Name: value` header flags.
fn parse_headers(raw: &[String]) -> Result<BTreeMap<String, String>> {
    raw.iter()
        .map(|h| {
            let (name, value) = h
                .split_once(':')
                .with_context(|| format!("Header '{h}' must look like 'Name: value'"))?;
            Ok((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config = EngineConfig::from_env()?;

    // RUST_LOG wins over LOG_LEVEL when both are set
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut executor = ReqwestExecutor::from_config(&config)?.with_download_root(cli.download_dir.clone());
    if cli.allow_private {
        executor = executor.allow_private_urls();
    }
    tracing::debug!(
        download_dir = %executor.download_root().display(),
        ssrf_protection = !cli.allow_private,
        "Executor ready"
    );

    match cli.command {
        Commands::Submit(target) => {
            let request = target.into_request()?;
            let engine = connect_engine(config, executor).await?;
            let job_id = engine.submit_job(request).await?;
            println!("{job_id}");
        }
        Commands::Status { job_id } => {
            let engine = connect_engine(config, executor).await?;
            let record = engine.get_job_status(job_id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Cancel { job_id } => {
            let engine = connect_engine(config, executor).await?;
            if engine.cancel_job(job_id).await? {
                println!("Cancelled {job_id}");
            } else {
                println!("Job {job_id} had already finished");
            }
        }
        Commands::Jobs {
            status,
            limit,
            counts,
        } => {
            let engine = connect_engine(config, executor).await?;
            cmd_jobs(engine.store(), status, limit, counts).await?;
        }
        Commands::Health => {
            let engine = connect_engine(config, executor).await?;
            println!("{}", serde_json::to_string_pretty(&engine.health().await)?);
        }
        Commands::Worker {
            concurrency,
            health_interval,
        } => {
            let mut config = config;
            if let Some(n) = concurrency {
                if n == 0 {
                    bail!("--concurrency must be at least 1");
                }
                config.worker.concurrency = n;
            }
            let engine = connect_engine(config, executor).await?;
            cmd_worker(&engine, Duration::from_secs(health_interval.max(1))).await?;
        }
        Commands::Run(target) => {
            let request = target.into_request()?;
            let queue = InMemoryJobQueue::new(config.worker.visibility_timeout);
            let engine = Engine::new(config, queue, InMemoryResultStore::new(), executor);
            cmd_run(&engine, request).await?;
        }
    }

    Ok(())
}

/// Connect to the Postgres broker, migrate, and build an engine on top of it.
async fn connect_engine(
    config: EngineConfig,
    executor: ReqwestExecutor,
) -> Result<Engine<PgJobQueue, PgResultStore, ReqwestExecutor>> {
    tracing::debug!(broker = config.broker_endpoint(), "Connecting to broker");
    let db = Database::connect(&DatabaseConfig::from(&config))
        .await
        .with_context(|| format!("Failed to reach broker at {}", config.broker_endpoint()))?;
    db.migrate().await?;

    let queue = db.job_queue(config.worker.visibility_timeout);
    Ok(Engine::new(config, queue, db.result_store(), executor))
}

async fn cmd_jobs<S: ResultStore>(
    store: &S,
    status: Option<JobStatus>,
    limit: usize,
    counts: bool,
) -> Result<()> {
    if counts {
        for (status, n) in store.count_by_status().await? {
            println!("  {:<14} {n}", status.as_str());
        }
        println!();
    }

    let jobs = store.list_jobs(status, limit).await?;
    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }

    for job in &jobs {
        println!(
            "  {} [{}] {} {} (attempts: {}/{})",
            job.id,
            job.status,
            job.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            job.target.url(),
            job.attempt_count,
            job.max_attempts(),
        );
    }
    println!("\nTotal: {} jobs", jobs.len());

    Ok(())
}

async fn cmd_worker<Q, S, E>(engine: &Engine<Q, S, E>, health_interval: Duration) -> Result<()>
where
    Q: JobQueue,
    S: ResultStore,
    E: Executor,
{
    let cancel_token = CancellationToken::new();
    let pool = engine.start(cancel_token.clone());
    tracing::info!(workers = pool.size(), "Worker pool running, press Ctrl+C to stop");

    let mut ticker = tokio::time::interval(health_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            () = shutdown_signal() => break,
            _ = ticker.tick() => {
                let health = engine.health().await;
                tracing::info!(
                    queue_depth = ?health.queue_depth,
                    active_workers = health.active_workers,
                    available_proxies = health.available_proxies,
                    circuit = %health.circuit_state,
                    degraded = health.degraded,
                    "Health"
                );
            }
        }
    }

    pool.shutdown();
    pool.wait().await;
    tracing::info!("All workers stopped");
    Ok(())
}

async fn cmd_run<Q, S, E>(engine: &Engine<Q, S, E>, request: SubmitJobRequest) -> Result<()>
where
    Q: JobQueue,
    S: ResultStore,
    E: Executor,
{
    let cancel_token = CancellationToken::new();
    let pool = engine.start(cancel_token.clone());
    let job_id = engine.submit_job(request).await?;
    tracing::info!(%job_id, "Running job in-process");

    let outcome = tokio::select! {
        () = shutdown_signal() => None,
        record = wait_for_terminal(engine, job_id) => Some(record?),
    };

    pool.shutdown();
    pool.wait().await;

    let Some(record) = outcome else {
        bail!("Interrupted before job {job_id} finished");
    };
    println!("{}", serde_json::to_string_pretty(&record)?);
    if record.status() == JobStatus::DeadLettered {
        bail!(
            "Job {job_id} dead-lettered: {}",
            record.job.error_detail.as_deref().unwrap_or("no detail")
        );
    }
    Ok(())
}

async fn wait_for_terminal<Q, S, E>(
    engine: &Engine<Q, S, E>,
    job_id: Uuid,
) -> Result<dte_core::JobRecord>
where
    Q: JobQueue,
    S: ResultStore,
    E: Executor,
{
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        ticker.tick().await;
        let record = engine.get_job_status(job_id).await?;
        if record.status().is_terminal() {
            return Ok(record);
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
