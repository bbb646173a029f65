use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use chrono::Utc;
use hostwarden::claim::kube::DEFAULT_ANNOTATION_PREFIX;
use hostwarden::claim::{ClaimStore, KubeClaimStore, KubeResourceKind, KubeStoreConfig, MemoryClaimStore};
use hostwarden::config::{BackoffConfig, ClaimConfig, SupervisorConfig, WorkerConfig};
use hostwarden::inventory::Inventory;
use hostwarden::remote::TransportConnector;
use hostwarden::shutdown::install_shutdown_handler;
use hostwarden::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "hostwarden")]
#[command(version)]
#[command(about = "Claim an external host from a worker pool and supervise a command on it")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Claim a host and supervise the command on it until shutdown
    Run(RunArgs),

    /// List the claims currently in the store
    Claims(ClaimsArgs),
}

// =============================================================================
// Store Arguments (shared by run and claims)
// =============================================================================

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StoreKind {
    /// Annotations on a Kubernetes object
    Kube,
    /// In-process map; only useful for a single worker
    Memory,
}

#[derive(Parser, Debug)]
struct StoreArgs {
    /// Where claims are kept
    #[arg(long, env = "HOSTWARDEN_STORE", value_enum, default_value = "kube")]
    store: StoreKind,

    /// Kind of the object holding the claims (rc, rs, deploy, cm)
    #[arg(long, env = "HOSTWARDEN_KUBE_KIND", default_value = "rs")]
    kube_kind: String,

    /// Name of the object holding the claims
    #[arg(long, env = "HOSTWARDEN_KUBE_NAME")]
    kube_name: Option<String>,

    /// Namespace of the object (default: the service account's namespace)
    #[arg(long, env = "HOSTWARDEN_KUBE_NAMESPACE")]
    kube_namespace: Option<String>,

    /// API server URL (default: in-cluster service address)
    #[arg(long, env = "HOSTWARDEN_KUBE_API_SERVER")]
    kube_api_server: Option<String>,

    /// Annotation key prefix for claims
    #[arg(long, env = "HOSTWARDEN_ANNOTATION_PREFIX", default_value = DEFAULT_ANNOTATION_PREFIX)]
    annotation_prefix: String,
}

impl StoreArgs {
    async fn open(&self) -> Result<Arc<dyn ClaimStore>, Box<dyn std::error::Error>> {
        match self.store {
            StoreKind::Memory => {
                tracing::warn!("Using in-memory claim store; claims are not shared with other workers");
                Ok(Arc::new(MemoryClaimStore::new()))
            }
            StoreKind::Kube => {
                let kind: KubeResourceKind = self.kube_kind.parse()?;
                let name = self
                    .kube_name
                    .clone()
                    .ok_or("--kube-name is required with --store kube")?;
                let mut config = KubeStoreConfig::in_cluster(kind, name);
                if let Some(namespace) = &self.kube_namespace {
                    config.namespace = namespace.clone();
                }
                if let Some(api_server) = &self.kube_api_server {
                    config.api_server = api_server.clone();
                }
                config.annotation_prefix = self.annotation_prefix.clone();

                tracing::info!(
                    api_server = %config.api_server,
                    namespace = %config.namespace,
                    name = %config.name,
                    "Using Kubernetes claim store"
                );
                Ok(Arc::new(KubeClaimStore::connect(config).await?))
            }
        }
    }
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Ansible INI inventory listing the hosts
    #[arg(long, short = 'i', env = "HOSTWARDEN_INVENTORY")]
    inventory: PathBuf,

    /// Inventory group to claim hosts from
    #[arg(long, short = 'g', env = "HOSTWARDEN_GROUP")]
    group: String,

    /// Command to run on the claimed host
    #[arg(long, short = 'c', env = "HOSTWARDEN_COMMAND")]
    command: String,

    /// Worker identity (default: $HOSTNAME, i.e. the pod name)
    #[arg(long, env = "HOSTWARDEN_WORKER_ID")]
    worker_id: Option<String>,

    #[command(flatten)]
    store: StoreArgs,

    /// Age after which a claim is considered abandoned
    #[arg(long, env = "HOSTWARDEN_STALE_AFTER_MS", default_value = "60000")]
    stale_after_ms: u64,

    /// Interval between claim heartbeats
    #[arg(long, env = "HOSTWARDEN_HEARTBEAT_INTERVAL_MS", default_value = "10000")]
    heartbeat_interval_ms: u64,

    /// Re-take this worker's own live claim immediately after a restart
    #[arg(long, env = "HOSTWARDEN_SELF_CLAIM_FAST_PATH")]
    self_claim_fast_path: bool,

    /// Base delay before retrying when no host is available
    #[arg(long, env = "HOSTWARDEN_ACQUIRE_RETRY_MS", default_value = "5000")]
    acquire_retry_ms: u64,

    /// First reconnect delay
    #[arg(long, env = "HOSTWARDEN_BACKOFF_INITIAL_MS", default_value = "1000")]
    backoff_initial_ms: u64,

    /// Reconnect delay ceiling
    #[arg(long, env = "HOSTWARDEN_BACKOFF_MAX_MS", default_value = "60000")]
    backoff_max_ms: u64,

    /// Reconnect delay growth factor
    #[arg(long, env = "HOSTWARDEN_BACKOFF_MULTIPLIER", default_value = "2.0")]
    backoff_multiplier: f64,

    /// A run lasting at least this long resets the reconnect delay
    #[arg(long, env = "HOSTWARDEN_BACKOFF_RESET_AFTER_MS", default_value = "60000")]
    backoff_reset_after_ms: u64,

    /// Bound on opening a session to the host
    #[arg(long, env = "HOSTWARDEN_CONNECT_TIMEOUT_MS", default_value = "10000")]
    connect_timeout_ms: u64,

    /// Bound on releasing the claim during shutdown
    #[arg(long, env = "HOSTWARDEN_RELEASE_TIMEOUT_MS", default_value = "5000")]
    release_timeout_ms: u64,

    /// Give a host up after this many consecutive connect/disconnect failures
    #[arg(long, env = "HOSTWARDEN_MAX_CONSECUTIVE_FAILURES")]
    max_consecutive_failures: Option<u32>,

    /// Forward this process's stdin to the remote command
    #[arg(long, env = "HOSTWARDEN_FORWARD_STDIN")]
    forward_stdin: bool,

    /// Port for the /health and /status endpoint (optional)
    #[arg(long, env = "HOSTWARDEN_STATUS_PORT")]
    status_port: Option<u16>,
}

impl RunArgs {
    fn worker_config(&self) -> WorkerConfig {
        let mut config = WorkerConfig {
            claim: ClaimConfig {
                stale_after_ms: self.stale_after_ms,
                heartbeat_interval_ms: self.heartbeat_interval_ms,
                self_claim_fast_path: self.self_claim_fast_path,
                acquire_retry_ms: self.acquire_retry_ms,
            },
            backoff: BackoffConfig {
                initial_ms: self.backoff_initial_ms,
                max_ms: self.backoff_max_ms,
                multiplier: self.backoff_multiplier,
                reset_after_ms: self.backoff_reset_after_ms,
            },
            supervisor: SupervisorConfig {
                command: self.command.clone(),
                connect_timeout_ms: self.connect_timeout_ms,
                release_timeout_ms: self.release_timeout_ms,
                max_consecutive_failures: self.max_consecutive_failures,
                forward_stdin: self.forward_stdin,
            },
            ..WorkerConfig::default()
        };
        if let Some(worker_id) = &self.worker_id {
            config.worker_id = worker_id.clone();
        }
        if let Some(port) = self.status_port {
            config = config.with_status_addr(SocketAddr::from(([0, 0, 0, 0], port)));
        }
        config
    }
}

// =============================================================================
// Claims Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClaimsArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Age after which a claim is reported as stale
    #[arg(long, env = "HOSTWARDEN_STALE_AFTER_MS", default_value = "60000")]
    stale_after_ms: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct ClaimListItem {
    host: String,
    owner_id: String,
    state: String,
    last_heartbeat_ms: i64,
    age_ms: u64,
    stale: bool,
}

// =============================================================================
// Commands
// =============================================================================

async fn run_worker(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.worker_config();
    config.validate()?;

    let inventory = Arc::new(Inventory::load(&args.inventory, &args.group).await?);
    let store = args.store.open().await?;
    let connector = Arc::new(TransportConnector::new(config.supervisor.connect_timeout()));
    let shutdown = install_shutdown_handler();

    let worker = Worker::new(config, inventory, store, connector);
    worker.run(shutdown).await?;
    Ok(())
}

async fn list_claims(args: ClaimsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = args.store.open().await?;
    let stale_after = std::time::Duration::from_millis(args.stale_after_ms);
    let now = Utc::now();

    let mut claims: Vec<ClaimListItem> = store
        .read_all()
        .await?
        .into_iter()
        .map(|(host, claim)| ClaimListItem {
            owner_id: claim.owner_id.clone(),
            state: claim.state.to_string(),
            last_heartbeat_ms: claim.last_heartbeat.timestamp_millis(),
            age_ms: claim.age(now).as_millis() as u64,
            stale: claim.is_stale(now, stale_after),
            host,
        })
        .collect();
    claims.sort_by(|a, b| a.host.cmp(&b.host));

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&claims)?);
        }
        OutputFormat::Table => {
            if claims.is_empty() {
                println!("No claims found.");
            } else {
                println!(
                    "{:<24} {:<32} {:<10} {:>10} STALE",
                    "HOST", "OWNER", "STATE", "AGE (s)"
                );
                println!("{}", "-".repeat(84));
                for claim in &claims {
                    println!(
                        "{:<24} {:<32} {:<10} {:>10} {}",
                        claim.host,
                        claim.owner_id,
                        claim.state,
                        claim.age_ms / 1000,
                        if claim.stale { "yes" } else { "no" }
                    );
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the remote command's output.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Run(run_args) => {
            run_worker(run_args).await?;
        }
        Commands::Claims(claims_args) => {
            list_claims(claims_args).await?;
        }
    }

    Ok(())
}
