//! Snapshot command: local collection or agent Job

use anyhow::{bail, Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use snapshot_lib::agent::artifact::{write_config_map, ResultArtifact};
use snapshot_lib::agent::{
    parse_node_selectors, parse_tolerations, AgentConfig, AgentRunner, CleanupPolicy, KubeAgent,
};
use snapshot_lib::collector::{
    CollectorRegistry, CollectorSettings, CoordinatorConfig, LocalCollector,
};
use snapshot_lib::output::{to_bytes, write_local};
use snapshot_lib::{CancelScope, OutputDestination, Snapshot, SnapshotMetrics};
use std::time::Duration;
use tracing::{debug, warn};

use crate::output::{print_error, print_info, print_success, render_snapshot_table, OutputFormat};
use crate::SnapshotArgs;

/// Collection timeout when running locally
const LOCAL_TIMEOUT_SECS: u64 = 60;

/// Job completion timeout with --deploy-agent
const AGENT_TIMEOUT_SECS: u64 = 300;

/// Run the snapshot command
pub async fn run(args: &SnapshotArgs, kubeconfig: Option<&str>) -> Result<()> {
    let destination = OutputDestination::parse(&args.output)?;
    if args.format == OutputFormat::Table && destination != OutputDestination::Stdout {
        bail!("table output can only be printed to stdout");
    }

    if args.deploy_agent {
        run_agent(args, destination, kubeconfig).await
    } else {
        run_local(args, destination, kubeconfig).await
    }
}

async fn kube_client(kubeconfig: Option<&str>) -> Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("failed to read kubeconfig {}", path))?;
            let config =
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await?;
            Ok(Client::try_from(config)?)
        }
        None => Client::try_default()
            .await
            .context("failed to create Kubernetes client"),
    }
}

/// Translate CLI flags into an agent deployment
pub fn agent_config(args: &SnapshotArgs, destination: OutputDestination) -> Result<AgentConfig> {
    let config = AgentConfig {
        namespace: args.namespace.clone(),
        image: args.image.clone(),
        image_pull_secrets: args.image_pull_secrets.clone(),
        job_name: args.job_name.clone(),
        service_account_name: args.service_account_name.clone(),
        node_selector: parse_node_selectors(&args.node_selectors)?,
        tolerations: parse_tolerations(&args.tolerations)?,
        timeout: Duration::from_secs(args.timeout.unwrap_or(AGENT_TIMEOUT_SECS)),
        ready_timeout: Duration::from_secs(args.ready_timeout),
        cleanup: if args.retain_access {
            CleanupPolicy::RetainAccess
        } else {
            CleanupPolicy::RemoveAll
        },
        output: destination,
        format: args.format.serialization(),
        privileged: !args.unprivileged,
        debug: args.debug,
    };
    config.validate()?;
    Ok(config)
}

async fn run_agent(
    args: &SnapshotArgs,
    destination: OutputDestination,
    kubeconfig: Option<&str>,
) -> Result<()> {
    let config = agent_config(args, destination)?;
    let client = kube_client(kubeconfig).await?;
    let runner = AgentRunner::new(KubeAgent::new(client, config.clone()), config);

    print_info(&format!(
        "Deploying agent job {}/{}",
        runner.config().namespace,
        runner.config().job_name
    ));

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let mut sink = std::io::stderr();

    let result = if args.format == OutputFormat::Table {
        runner.run(&mut sink, shutdown).await
    } else {
        runner.run_and_deliver(&mut sink, shutdown).await
    };

    let artifact = match result {
        Ok(artifact) => artifact,
        Err(e) => {
            print_error(&e.to_string());
            return Err(e.into());
        }
    };

    if args.format == OutputFormat::Table {
        let snapshot: Snapshot = serde_json::from_str(&artifact.content)
            .context("agent returned a snapshot that is not valid JSON")?;
        print!("{}", render_snapshot_table(&snapshot));
    } else if let OutputDestination::ConfigMap { namespace, name } = &runner.config().output {
        print_success(&format!("Snapshot stored in ConfigMap {}/{}", namespace, name));
    }
    debug!(timestamp = %artifact.timestamp, "Agent snapshot retrieved");
    Ok(())
}

async fn run_local(
    args: &SnapshotArgs,
    destination: OutputDestination,
    kubeconfig: Option<&str>,
) -> Result<()> {
    let settings = CollectorSettings {
        node_name: args.node_name.clone(),
        ..Default::default()
    };
    let timeout = Duration::from_secs(args.timeout.unwrap_or(LOCAL_TIMEOUT_SECS));
    let mut config = CoordinatorConfig {
        timeout,
        ..Default::default()
    };
    if let Some(node_name) = &args.node_name {
        config.node_name = node_name.clone();
    }

    let metrics = SnapshotMetrics::new().context("failed to register metrics")?;
    let coordinator =
        LocalCollector::new(CollectorRegistry::with_defaults(&settings), metrics, config);

    let scope = CancelScope::new();
    let deadline = scope.deadline(timeout);
    let measure = coordinator.measure(Some(&deadline));
    tokio::pin!(measure);
    let result = tokio::select! {
        result = &mut measure => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling collection");
            scope.cancel();
            measure.await
        }
    };
    let snapshot = result.context("snapshot collection failed")?;

    if args.format == OutputFormat::Table {
        print!("{}", render_snapshot_table(&snapshot));
        return Ok(());
    }

    let format = args.format.serialization();
    let bytes = to_bytes(&snapshot, format)?;
    match &destination {
        OutputDestination::ConfigMap { namespace, name } => {
            let artifact = ResultArtifact::new(String::from_utf8(bytes)?, format);
            write_config_map(kube_client(kubeconfig).await?, namespace, name, &artifact).await?;
            print_success(&format!("Snapshot stored in ConfigMap {}/{}", namespace, name));
        }
        _ => write_local(&destination, &bytes)
            .with_context(|| format!("failed to write {}", destination))?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Cli, Commands};
    use clap::Parser;

    fn snapshot_args(extra: &[&str]) -> SnapshotArgs {
        let mut argv = vec!["nodesnap", "snapshot"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Snapshot(args) => args,
        }
    }

    #[test]
    fn test_agent_config_defaults() {
        let args = snapshot_args(&["--deploy-agent"]);
        let config = agent_config(&args, OutputDestination::Stdout).unwrap();

        assert_eq!(config.job_name, "nodesnap");
        assert_eq!(config.timeout, Duration::from_secs(AGENT_TIMEOUT_SECS));
        assert_eq!(config.ready_timeout, Duration::from_secs(60));
        assert_eq!(config.cleanup, CleanupPolicy::RemoveAll);
        assert!(config.privileged);
        assert_eq!(config.tolerations, vec![snapshot_lib::agent::tolerate_all()]);
    }

    #[test]
    fn test_agent_config_from_flags() {
        let args = snapshot_args(&[
            "--deploy-agent",
            "--namespace",
            "gpu-operator",
            "--node-selector",
            "nodeGroup=gpu",
            "--toleration",
            "gpu=true:NoSchedule",
            "--timeout",
            "120",
            "--retain-access",
            "--unprivileged",
            "--format",
            "flat",
        ]);
        let destination = OutputDestination::parse("cm://gpu-operator/node-a").unwrap();
        let config = agent_config(&args, destination.clone()).unwrap();

        assert_eq!(config.namespace, "gpu-operator");
        assert_eq!(config.node_selector["nodeGroup"], "gpu");
        assert_eq!(config.tolerations[0].key.as_deref(), Some("gpu"));
        assert_eq!(config.timeout, Duration::from_secs(120));
        assert_eq!(config.cleanup, CleanupPolicy::RetainAccess);
        assert!(!config.privileged);
        assert_eq!(config.format, snapshot_lib::OutputFormat::Flat);
        assert_eq!(config.output, destination);
    }

    #[test]
    fn test_agent_config_rejects_configmap_in_other_namespace() {
        let args = snapshot_args(&["--deploy-agent", "--namespace", "ops"]);
        let destination = OutputDestination::parse("cm://other/snap").unwrap();

        let err = agent_config(&args, destination).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("other"), "{}", message);
        assert!(message.contains("ops"), "{}", message);

        let same = OutputDestination::parse("cm://ops/snap").unwrap();
        assert!(agent_config(&args, same).is_ok());
    }

    #[test]
    fn test_agent_config_rejects_bad_toleration() {
        let args = snapshot_args(&["--deploy-agent", "--toleration", "gpu=true"]);
        assert!(agent_config(&args, OutputDestination::Stdout).is_err());
    }
}
