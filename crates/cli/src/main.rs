//! nodesnap CLI
//!
//! Captures node configuration snapshots, either in-process or by deploying
//! a one-shot agent Job into the cluster.

mod commands;
mod output;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// nodesnap CLI
#[derive(Parser)]
#[command(name = "nodesnap")]
#[command(author, version, about = "Node configuration snapshots for Kubernetes clusters", long_about = None)]
pub struct Cli {
    /// Path to kubeconfig file (uses default if not specified)
    #[arg(long, env = "KUBECONFIG", global = true)]
    pub kubeconfig: Option<String>,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture a snapshot of a node's configuration
    Snapshot(SnapshotArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SnapshotArgs {
    /// Destination: '-' for stdout, a file path, or cm://<namespace>/<name>
    #[arg(long, short, default_value = "-")]
    pub output: String,

    /// Output format
    #[arg(long, short, default_value = "json")]
    pub format: output::OutputFormat,

    /// Collect on a cluster node through a one-shot Job instead of locally
    #[arg(long)]
    pub deploy_agent: bool,

    /// Namespace for the agent Job and its access objects (agent cm:// output must use it)
    #[arg(long, short, env = "NODESNAP_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Agent container image
    #[arg(long, env = "NODESNAP_IMAGE", default_value = "ghcr.io/nodesnap/nodesnap-agent:latest")]
    pub image: String,

    /// Image pull secret for the agent image (repeatable)
    #[arg(long = "image-pull-secret")]
    pub image_pull_secrets: Vec<String>,

    /// Name of the agent Job
    #[arg(long, default_value = "nodesnap")]
    pub job_name: String,

    /// Name of the agent ServiceAccount
    #[arg(long, default_value = "nodesnap")]
    pub service_account_name: String,

    /// Node selector key=value (repeatable)
    #[arg(long = "node-selector")]
    pub node_selectors: Vec<String>,

    /// Toleration key=value:effect or key:effect (repeatable, default tolerates all taints)
    #[arg(long = "toleration")]
    pub tolerations: Vec<String>,

    /// Timeout in seconds (collection locally, Job completion with --deploy-agent)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Seconds to wait for the agent pod to start
    #[arg(long, default_value_t = 60)]
    pub ready_timeout: u64,

    /// Keep the ServiceAccount and RBAC objects after the run
    #[arg(long)]
    pub retain_access: bool,

    /// Run the agent without host namespaces, host mounts or privileges
    #[arg(long)]
    pub unprivileged: bool,

    /// Run the agent with debug logging
    #[arg(long)]
    pub debug: bool,

    /// Node to describe in local mode (defaults to NODE_NAME)
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    // Execute command
    match cli.command {
        Commands::Snapshot(args) => {
            commands::snapshot::run(&args, cli.kubeconfig.as_deref()).await?;
        }
    }

    Ok(())
}
