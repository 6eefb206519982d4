//! Kiln CLI: runs the orchestrator server and talks to it.

mod args;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kiln_client::KilnClient;
use kiln_compute_k8s::KubeClusterBackend;
use kiln_core::prelude::*;
use kiln_fs::FileSystemOutputs;
use kiln_runner::prelude::*;
use kiln_server::KilnServer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(version)]
#[command(about = "Batch GPU jobs on Kubernetes", long_about = None)]
struct Cli {
    /// URL of the kiln server
    #[arg(long, global = true, env = "KILN_SERVER", default_value = "http://localhost:8000")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator and its HTTP API
    Serve(ServeArgs),

    /// List the models the server knows about
    Models,

    /// Render the manifest of a job locally without submitting it
    Render {
        /// Path to the model catalog
        #[arg(long, env = "KILN_REGISTRY", default_value = "deploy/models.yaml")]
        registry: PathBuf,

        #[command(flatten)]
        job: JobArgs,
    },

    /// Submit a job
    Submit {
        #[command(flatten)]
        job: JobArgs,

        /// Block until the job is terminal and print its record
        #[arg(long)]
        wait: bool,
    },

    /// Show the phase of a job
    Status { id: String },

    /// Show where the output of a job is
    Output { id: String },

    /// Show the log tail of a job
    Logs { id: String },

    /// Cancel a job
    Cancel { id: String },
}

#[derive(clap::Args)]
struct JobArgs {
    /// Model id, e.g. `chatterbox`
    model: String,

    /// Job id; generated when omitted
    #[arg(long)]
    id: Option<String>,

    /// Parameter as `name=value`, repeatable
    #[arg(short, long = "param")]
    params: Vec<String>,

    /// Input file as `slot=path`, repeatable
    #[arg(short, long = "input")]
    inputs: Vec<String>,
}

impl JobArgs {
    fn into_request(self) -> Result<JobRequest> {
        args::build_request(self.model, self.id, &self.params, &self.inputs)
    }
}

#[derive(clap::Args)]
struct ServeArgs {
    #[arg(long, env = "KILN_BIND", default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, env = "KILN_PORT", default_value = "8000")]
    port: u16,

    /// Path to the model catalog
    #[arg(long, env = "KILN_REGISTRY", default_value = "deploy/models.yaml")]
    registry: PathBuf,

    /// Namespace the job pods are created in
    #[arg(long, env = "KILN_NAMESPACE", default_value = defaults::NAMESPACE)]
    namespace: String,

    /// Where outputs copied out of pods are stored
    #[arg(long, env = "KILN_RESULTS_DIR", default_value = "./results")]
    results_dir: PathBuf,

    /// JSON file keeping finished jobs across restarts [default: <results-dir>/jobs.json]
    #[arg(long, env = "KILN_HISTORY")]
    history: Option<PathBuf>,

    /// Mount point of the shared volume inside job pods
    #[arg(long, env = "KILN_SHARED_MOUNT", default_value = "/data")]
    shared_mount: PathBuf,

    /// Where the shared volume is mounted on this host
    #[arg(long, env = "KILN_SHARED_LOCAL")]
    shared_local: Option<PathBuf>,

    /// Number of jobs allowed on the GPUs at once
    #[arg(long, env = "KILN_CAPACITY", default_value_t = defaults::CAPACITY)]
    capacity: usize,

    /// Seconds between status queries
    #[arg(long, env = "KILN_POLL_INTERVAL", default_value_t = defaults::POLL_INTERVAL_SECS)]
    poll_interval: u64,

    /// Seconds a job may wait for a free slot
    #[arg(long, env = "KILN_ADMISSION_TIMEOUT", default_value_t = defaults::ADMISSION_TIMEOUT_SECS)]
    admission_timeout: u64,

    /// Wall-clock limit of a job in seconds, 0 disables it
    #[arg(long, env = "KILN_MAX_RUNTIME", default_value_t = defaults::MAX_RUNTIME_SECS)]
    max_runtime: u64,
}

impl ServeArgs {
    fn config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            capacity: self.capacity,
            poll_interval: Duration::from_secs(self.poll_interval.max(1)),
            admission_timeout: Duration::from_secs(self.admission_timeout),
            max_runtime: (self.max_runtime > 0).then(|| Duration::from_secs(self.max_runtime)),
            ..OrchestratorConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let client = KilnClient::new(&cli.server);

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Models => {
            for model in client.models().await? {
                let d = &model.descriptor;
                let state = match (d.enabled, model.available) {
                    (false, _) => "disabled",
                    (true, false) => "unavailable",
                    (true, true) => "available",
                };
                println!("{:<20} {:<12} {}", d.id, state, d.name);
            }
            Ok(())
        }
        Commands::Render { registry, job } => {
            let registry = ModelRegistry::load(&registry)?;
            let request = job.into_request()?;
            let descriptor = registry.resolve(&request.model)?;
            let job_id = request
                .id
                .clone()
                .unwrap_or_else(|| generate_job_id(&descriptor.id));
            let manifest = render(&descriptor, &request, &job_id)?;
            println!("{}", manifest.body);
            Ok(())
        }
        Commands::Submit { job, wait } => {
            let id = client.submit(&job.into_request()?).await?;
            if wait {
                let record = client.wait(&id, Duration::from_secs(2)).await?;
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                println!("{id}");
            }
            Ok(())
        }
        Commands::Status { id } => {
            println!("{}", client.status(&id).await?);
            Ok(())
        }
        Commands::Output { id } => {
            match client.output(&id).await? {
                OutputStatus::Ready { path } => println!("{}", path.display()),
                OutputStatus::Pending { phase } => println!("pending ({phase})"),
            }
            Ok(())
        }
        Commands::Logs { id } => {
            match client.logs(&id).await? {
                Some(logs) => println!("{logs}"),
                None => println!("no logs available"),
            }
            Ok(())
        }
        Commands::Cancel { id } => {
            match client.cancel(&id).await? {
                CancelAck::Cancelling => println!("cancelling {id}"),
                CancelAck::AlreadyTerminal { phase } => println!("{id} already {phase}"),
            }
            Ok(())
        }
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let registry = ModelRegistry::load(&args.registry)
        .with_context(|| format!("loading {}", args.registry.display()))?;
    info!(models = registry.len(), enabled = ?registry.enabled(), "Registry loaded");

    let cluster = KubeClusterBackend::try_default(args.namespace.clone()).await?;

    let history = args
        .history
        .clone()
        .unwrap_or_else(|| args.results_dir.join("jobs.json"));
    let mut store = FileSystemOutputs::new(&args.results_dir).with_history(history);
    if let Some(local) = &args.shared_local {
        store = store.with_mount(&args.shared_mount, local);
    }

    let orchestrator = Orchestrator::new(Arc::new(registry), cluster, store, args.config());
    orchestrator.init().await?;
    orchestrator.restore().await?;

    let reconciled = orchestrator.reconcile().await?;
    if !reconciled.adopted.is_empty() {
        info!(jobs = ?reconciled.adopted, "Resumed jobs left running by a previous run");
    }
    if !reconciled.deleted.is_empty() {
        info!(count = reconciled.deleted.len(), "Removed leftover job pods");
    }

    let app = KilnServer::default().build(orchestrator.clone());
    let addr = format!("{}:{}", args.bind, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // Running pods stay up and are adopted by the next start.
    let unfinished = orchestrator
        .jobs()
        .iter()
        .filter(|r| !r.is_terminal())
        .count();
    if unfinished > 0 {
        warn!(count = unfinished, "Exiting with unfinished jobs");
    }
    orchestrator.save_history().await?;
    Ok(())
}
