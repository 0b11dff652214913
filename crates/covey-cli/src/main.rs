//! # covey-cli
//!
//! Binary entry point for the Covey harness.
//!
//! This crate provides:
//! - CLI argument parsing using `clap`
//! - Configuration loading and tracing initialization
//! - The `up` smoke flow (build, report, tear down)
//! - The `run` flow (build, optional data upload, job, tear down)

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use covey_core::{
    ClusterBuilder, HarnessConfig, JobPoller, Sandbox, cluster_name, teardown,
};
use covey_remote::RemoteHost;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

// Unix-specific process management for process group leadership
#[cfg(unix)]
mod process_management {
    use nix::unistd::{Pid, setpgid};
    use tracing::debug;

    /// Makes the driver a process group leader so local worker children
    /// die with it; remote and external nodes still need explicit teardown.
    pub fn setup_process_group() {
        let pid = Pid::this();
        if let Err(e) = setpgid(pid, pid) {
            // EPERM means we already lead a group (started from a shell).
            if e != nix::errno::Errno::EPERM {
                debug!("Could not set process group ({}), continuing anyway", e);
            }
        }
        debug!("Process group initialized: PID {}", pid);
    }
}

#[cfg(not(unix))]
mod process_management {
    /// No-op on non-Unix platforms.
    pub fn setup_process_group() {}
}

/// Covey - cluster lifecycle and asynchronous job coordination harness
#[derive(Parser, Debug)]
#[command(name = "covey", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, default_value = "covey.yml", global = true)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the configured cluster, report its view, and tear it down
    Up {
        /// Leave the partially built node list behind on failure
        #[arg(long)]
        no_cleanup: bool,
    },
    /// Build the cluster, run a job to completion, and tear it down
    Run {
        /// Job endpoint to submit (e.g. Ingest, Train)
        #[arg(long)]
        endpoint: String,

        /// Job parameter as key=value; repeatable
        #[arg(long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,

        /// Local file to upload to the coordinator before submitting
        #[arg(long)]
        data: Option<PathBuf>,

        /// Overall job window in seconds
        #[arg(long, default_value_t = 600)]
        job_timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    process_management::setup_process_group();

    let config = if cli.config.exists() {
        HarnessConfig::load(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        info!(config = %cli.config.display(), "No config file, using defaults");
        HarnessConfig::default()
    };

    match cli.command {
        Commands::Up { no_cleanup } => up(config, no_cleanup).await,
        Commands::Run {
            endpoint,
            args,
            data,
            job_timeout_secs,
        } => run_job(config, &endpoint, &args, data, job_timeout_secs).await,
    }
}

/// Connects every configured remote host. A connect failure is fatal
/// before any node is spawned.
async fn connect_hosts(config: &HarnessConfig) -> Result<Vec<Arc<RemoteHost>>> {
    let mut hosts = Vec::new();
    for host in &config.hosts {
        info!(addr = %host.addr, user = %host.user, "Connecting remote host");
        let connected = RemoteHost::connect(&host.user, &host.addr)
            .await
            .with_context(|| format!("connecting {}@{}", host.user, host.addr))?;
        hosts.push(Arc::new(connected));
    }
    Ok(hosts)
}

async fn build_cluster(
    config: &HarnessConfig,
    no_cleanup: bool,
) -> Result<(covey_core::Cluster, Sandbox)> {
    let sandbox = Sandbox::create(&config.sandbox_dir)?;
    let hosts = connect_hosts(config).await?;
    let name = cluster_name();

    let cluster = ClusterBuilder::from_config(name, config, hosts)
        .keep_partial(no_cleanup || config.keep_partial)
        .build(&sandbox)
        .await
        .map_err(|failure| anyhow::anyhow!("{failure}"))?;

    Ok((cluster, sandbox))
}

async fn up(config: HarnessConfig, no_cleanup: bool) -> Result<()> {
    let (mut cluster, _sandbox) = build_cluster(&config, no_cleanup).await?;

    let client = cluster
        .coordinator_client()
        .context("built cluster has no coordinator")?;
    let status = client.cloud_status().await?;
    info!(
        cloud = %status.cloud_name,
        size = status.cloud_size,
        consensus = status.consensus,
        "Cluster view"
    );
    for node in cluster.nodes() {
        info!(node = node.id(), addr = %node.addr(), state = node.state().as_str(), "Member");
    }

    teardown(&mut cluster, Duration::from_secs(30)).await?;
    info!("Run verdict: clean");
    Ok(())
}

async fn run_job(
    config: HarnessConfig,
    endpoint: &str,
    raw_args: &[String],
    data: Option<PathBuf>,
    job_timeout_secs: u64,
) -> Result<()> {
    let params = parse_job_args(raw_args)?;
    let (mut cluster, _sandbox) = build_cluster(&config, false).await?;

    let job_result = drive_job(&cluster, endpoint, &params, data, job_timeout_secs).await;
    let teardown_result = teardown(&mut cluster, Duration::from_secs(30)).await;

    // The job outcome and the teardown verdict are both reported; a clean
    // job does not excuse a dirty teardown, nor the other way around.
    match (&job_result, &teardown_result) {
        (Err(e), _) => error!(error = %e, "Job failed"),
        (Ok(payload), _) => info!(payload = %payload, "Job payload"),
    }
    if let Err(e) = &teardown_result {
        warn!(error = %e, "Teardown reported faults");
    }

    job_result.map(|_| ())?;
    teardown_result?;
    info!("Run verdict: clean");
    Ok(())
}

async fn drive_job(
    cluster: &covey_core::Cluster,
    endpoint: &str,
    params: &[(String, String)],
    data: Option<PathBuf>,
    job_timeout_secs: u64,
) -> Result<serde_json::Value> {
    let client = cluster
        .coordinator_client()
        .context("built cluster has no coordinator")?;

    if let Some(path) = data {
        info!(file = %path.display(), "Uploading data to coordinator");
        client.upload_file(&path).await?;
    }

    let poller = JobPoller::new(
        &client,
        Duration::from_secs(job_timeout_secs),
        Duration::from_secs(1),
    );
    let done = poller.run(endpoint, params).await?;
    Ok(serde_json::to_value(&done.extra)?)
}

fn parse_job_args(raw: &[String]) -> Result<Vec<(String, String)>> {
    let mut params = Vec::new();
    for arg in raw {
        match arg.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                params.push((key.to_string(), value.to_string()));
            }
            _ => bail!("job argument `{arg}` is not of the form KEY=VALUE"),
        }
    }
    Ok(params)
}
