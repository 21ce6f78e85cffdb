use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use pypln_lite::broker::Broker;
use pypln_lite::config::{
    interval_from_secs, BrokerConfig, Configuration, DeliveryMode, ManagerConfig, PipelineConfig,
    StoreConfig,
};
use pypln_lite::manager::{Manager, ManagerServer};
use pypln_lite::pipeline::{Pipeline, RunReport, WorkerStage};
use pypln_lite::protocol::{job_error_topic, job_finished_topic, Broadcast};
use pypln_lite::shutdown::install_shutdown_handler;
use pypln_lite::store::{DocumentStore, FileStore};
use pypln_lite::transport::tcp::{TcpBroadcastSource, TcpManagerClient};
use pypln_lite::transport::{ManagerClient, Subscription};
use pypln_lite::worker::{builtin, WorkerRegistry};

#[derive(Parser, Debug)]
#[command(name = "pypln-lite")]
#[command(version)]
#[command(about = "Distributed NLP job execution: manager, brokers and pipelines")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the manager (job queue and broadcast hub)
    Manager(ManagerArgs),

    /// Start a broker that runs jobs on this host
    Broker(BrokerArgs),

    /// Store files and run extractor → tokenizer → (pos, freqdist) on them
    Pipeline(PipelineArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Run a built-in worker over stdin/stdout
    #[command(hide = true)]
    Worker {
        /// Worker name
        name: String,

        /// PALAVRAS tagger script used by the `pos` worker
        #[arg(long, default_value = builtin::DEFAULT_PALAVRAS)]
        palavras: PathBuf,
    },
}

// =============================================================================
// Manager Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ManagerArgs {
    /// Interface to listen on
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port for request/reply traffic
    #[arg(long, default_value = "5555")]
    api_port: u16,

    /// Port for broadcasts
    #[arg(long, default_value = "5556")]
    broadcast_port: u16,

    /// Store directory handed to brokers (must be reachable from every broker host)
    #[arg(long, default_value = "pypln-data")]
    store: PathBuf,

    /// Seconds between two broker monitoring snapshots
    #[arg(long, default_value = "60")]
    monitoring_interval: f64,

    /// Maximum number of jobs held by the manager
    #[arg(long, default_value = "10000")]
    max_jobs: usize,

    /// Hand out a job again when its broker does not report back in time
    #[arg(long)]
    at_least_once: bool,

    /// Seconds before an unreported job is handed out again
    #[arg(long, default_value = "300")]
    redeliver_after: f64,
}

// =============================================================================
// Broker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct BrokerArgs {
    #[command(flatten)]
    manager: ManagerAddrs,

    /// Maximum concurrent workers (default: number of CPUs)
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Milliseconds between two polls for jobs
    #[arg(long, default_value = "50", value_parser = clap::value_parser!(u64).range(1..))]
    poll_interval_ms: u64,

    /// Milliseconds a worker gets to exit after SIGTERM
    #[arg(long, default_value = "500")]
    kill_grace_ms: u64,

    /// JSON file with extra worker definitions
    #[arg(long)]
    workers: Option<PathBuf>,

    /// PALAVRAS tagger script for the `pos` worker
    #[arg(long)]
    palavras: Option<PathBuf>,
}

// =============================================================================
// Client Arguments (shared by job and pipeline commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ManagerAddrs {
    /// Manager request/reply address
    #[arg(long, default_value = "127.0.0.1:5555")]
    api: String,

    /// Manager broadcast address
    #[arg(long, default_value = "127.0.0.1:5556")]
    broadcast: String,
}

#[derive(Parser, Debug)]
struct ClientArgs {
    #[command(flatten)]
    manager: ManagerAddrs,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Parser, Debug)]
struct PipelineArgs {
    #[command(flatten)]
    client: ClientArgs,

    /// Milliseconds to wait for a broadcast per poll
    #[arg(long, default_value = "100")]
    poll_timeout_ms: u64,

    /// Files to analyze
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Queue a job on the manager
    Submit {
        /// Worker to run
        #[arg(long)]
        worker: String,

        /// Document (or blob) id to run it on
        #[arg(long)]
        document: String,

        /// Wait for the job's completion broadcast
        #[arg(long)]
        wait: bool,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSubmitOutput {
    job_id: String,
    worker: String,
    document: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<String>,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

// =============================================================================
// Server Implementations
// =============================================================================

async fn run_manager(args: ManagerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let api_addr: SocketAddr = format!("{}:{}", args.host, args.api_port).parse()?;
    let broadcast_addr: SocketAddr = format!("{}:{}", args.host, args.broadcast_port).parse()?;

    interval_from_secs("--monitoring-interval", args.monitoring_interval)?;
    let delivery = if args.at_least_once {
        DeliveryMode::AtLeastOnce {
            redeliver_after: interval_from_secs("--redeliver-after", args.redeliver_after)?,
        }
    } else {
        DeliveryMode::AtMostOnce
    };

    let mut config = ManagerConfig::new(api_addr, broadcast_addr)
        .with_configuration(Configuration {
            store: StoreConfig {
                path: args.store,
                ..StoreConfig::default()
            },
            monitoring_interval: args.monitoring_interval,
        })
        .with_delivery(delivery);
    config.max_jobs = args.max_jobs;

    tracing::info!(
        api_addr = %config.api_addr,
        broadcast_addr = %config.broadcast_addr,
        store = %config.configuration.store.path.display(),
        delivery = ?config.delivery,
        "Starting pypln-lite manager"
    );

    let shutdown = install_shutdown_handler()?;
    let (handle, manager_task) = Manager::spawn(config.clone(), shutdown.clone());
    let server = ManagerServer::bind(config.api_addr, config.broadcast_addr, handle).await?;
    server.run(shutdown).await?;
    manager_task.await?;

    Ok(())
}

async fn run_broker(args: BrokerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let mut config = BrokerConfig::default().with_poll_interval_ms(args.poll_interval_ms);
    if let Some(max_concurrency) = args.max_concurrency {
        config = config.with_max_concurrency(max_concurrency);
    }
    config.kill_grace_ms = args.kill_grace_ms;

    let exe = std::env::current_exe()?;
    let mut registry = WorkerRegistry::builtin(&exe);
    if let Some(palavras) = &args.palavras {
        registry.register(builtin::pos_spec(&exe, palavras));
    }
    if let Some(path) = &args.workers {
        registry.extend(WorkerRegistry::from_json_file(path)?);
    }

    let api = TcpManagerClient::connect(&args.manager.api).await?;
    let cluster_ip = api.local_ip();
    let mut broker = Broker::new(config, ManagerClient::new(api), registry).with_cluster_ip(cluster_ip);

    match TcpBroadcastSource::connect(&args.manager.broadcast).await {
        Ok(source) => broker = broker.with_broadcasts(source),
        Err(e) => tracing::warn!(error = %e, "No broadcast connection, relying on polling"),
    }

    let shutdown = install_shutdown_handler()?;
    broker.run(shutdown).await?;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn run_pipeline(args: PipelineArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let api = TcpManagerClient::connect(&args.client.manager.api).await?;
    // Subscribed before any job exists, so no completion can be missed.
    let source = TcpBroadcastSource::connect(&args.client.manager.broadcast).await?;
    let client = ManagerClient::new(api);

    let configuration = client.get_configuration().await?;
    let store = FileStore::open(&configuration.store).await?;

    let mut documents = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let contents = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let id = store.put_blob(contents, &name).await?;
        tracing::info!(file = %path.display(), blob_id = %id, "Stored file");
        documents.push(id);
    }

    let template = WorkerStage::new(builtin::EXTRACTOR).then([WorkerStage::new(builtin::TOKENIZER)
        .then([WorkerStage::new(builtin::POS), WorkerStage::new(builtin::FREQDIST)])]);
    let config = PipelineConfig {
        poll_timeout_ms: args.poll_timeout_ms,
    };
    let mut pipeline = Pipeline::new(client, source, template, config);

    let shutdown = install_shutdown_handler()?;
    let report = pipeline.run(documents, &shutdown).await?;
    pipeline.close().await;

    print_report(&report, &args.client.output)?;
    if !report.is_success() {
        return Err(format!("{} stage(s) failed", report.failed.len()).into());
    }
    Ok(())
}

fn print_report(report: &RunReport, output_format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
        OutputFormat::Table => {
            println!("{:<38} {:<12} {:<10} DOCUMENT", "JOB ID", "WORKER", "STATUS");
            println!("{}", "-".repeat(94));
            let rows = report
                .finished
                .iter()
                .map(|run| (run, "finished"))
                .chain(report.failed.iter().map(|run| (run, "failed")));
            for (run, status) in rows {
                println!(
                    "{:<38} {:<12} {:<10} {}",
                    run.job_id, run.worker, status, run.document
                );
            }
            println!();
            println!(
                "{} finished, {} failed, {} skipped",
                report.finished.len(),
                report.failed.len(),
                report.skipped
            );
        }
    }
    Ok(())
}

async fn handle_job_submit(
    client: &ClientArgs,
    worker: String,
    document: String,
    wait: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let api = ManagerClient::new(TcpManagerClient::connect(&client.manager.api).await?);
    let mut subscription = if wait {
        Some(Subscription::new(
            TcpBroadcastSource::connect(&client.manager.broadcast).await?,
        ))
    } else {
        None
    };

    let job_id = api.add_job(&worker, &document).await?;

    let status = match subscription.as_mut() {
        Some(subscription) => {
            subscription.subscribe(job_finished_topic(&job_id));
            subscription.subscribe(job_error_topic(&job_id));
            let shutdown = install_shutdown_handler()?;
            let status = loop {
                let message = tokio::select! {
                    _ = shutdown.cancelled() => break "interrupted",
                    message = subscription.poll(Duration::from_secs(1)) => message?,
                };
                match message.as_deref().map(Broadcast::parse) {
                    Some(Broadcast::JobFinished(_)) => break "finished",
                    Some(Broadcast::JobError(_)) => break "failed",
                    _ => {}
                }
            };
            subscription.close().await;
            Some(status.to_string())
        }
        None => None,
    };
    api.close().await;

    match client.output {
        OutputFormat::Json => {
            let output = JobSubmitOutput {
                job_id: job_id.to_string(),
                worker,
                document,
                status: status.clone(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID: {}", job_id);
            if let Some(status) = &status {
                println!("Status: {}", status);
            }
        }
    }

    if status.as_deref() == Some("failed") {
        std::process::exit(1);
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Manager(manager_args) => {
            run_manager(manager_args).await?;
        }
        Commands::Broker(broker_args) => {
            run_broker(broker_args).await?;
        }
        Commands::Pipeline(pipeline_args) => {
            run_pipeline(pipeline_args).await?;
        }
        Commands::Job { client, command } => match command {
            JobCommands::Submit {
                worker,
                document,
                wait,
            } => {
                handle_job_submit(&client, worker, document, wait).await?;
            }
        },
        Commands::Worker { name, palavras } => {
            // stdout carries the worker's result; nothing else may write there.
            builtin::run_stdio(&name, &palavras).await?;
        }
    }

    Ok(())
}
