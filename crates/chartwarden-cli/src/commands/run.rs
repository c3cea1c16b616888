//! Run command - the operator process

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chartwarden_core::resource::DEFAULT_HELM_VERSION;
use chartwarden_kube::{
    Clients, HelmCli, KubeAnnotator, KubeStatusClient, Operator, OperatorConfig, Reconciler,
    ReconcilerConfig, ReleaseCache, StatusTracker, ValuesComposer, WorkQueue,
};
use chartwarden_source::{ChartCache, ChartSourceTracker, Mirrors, TrackerConfig, shutdown};
use clap::Args;
use kube::Client;
use kube::config::{KubeConfigOptions, Kubeconfig};
use miette::{IntoDiagnostic, Result};
use tracing::{info, warn};

use crate::error::CliError;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to a kubeconfig; in-cluster or default config otherwise
    #[arg(long, env = "CHARTWARDEN_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Only watch HelmReleases in this namespace
    #[arg(long, env = "CHARTWARDEN_ALLOW_NAMESPACE")]
    pub allow_namespace: Option<String>,

    /// Concurrent reconciliation workers
    #[arg(long, default_value_t = 1, env = "CHARTWARDEN_WORKERS")]
    pub workers: usize,

    /// Period of the full resync (refresh mirrors, requeue all releases)
    #[arg(long, default_value = "3m", value_parser = humantime::parse_duration, env = "CHARTWARDEN_CHARTS_SYNC_INTERVAL")]
    pub charts_sync_interval: Duration,

    /// Period of the release status poller
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration, env = "CHARTWARDEN_STATUS_UPDATE_INTERVAL")]
    pub status_update_interval: Duration,

    /// Log the differences found by dry-run comparisons
    #[arg(long, env = "CHARTWARDEN_LOG_RELEASE_DIFFS")]
    pub log_release_diffs: bool,

    /// Run `helm dependency update` on git charts
    #[arg(
        long,
        default_value_t = true,
        num_args = 0..=1,
        default_missing_value = "true",
        action = clap::ArgAction::Set,
        env = "CHARTWARDEN_UPDATE_CHART_DEPS"
    )]
    pub update_chart_deps: bool,

    /// Timeout of every git operation
    #[arg(long, default_value = "20s", value_parser = humantime::parse_duration, env = "CHARTWARDEN_GIT_TIMEOUT")]
    pub git_timeout: Duration,

    /// How often each mirror polls its remote
    #[arg(long, default_value = "5m", value_parser = humantime::parse_duration, env = "CHARTWARDEN_GIT_POLL_INTERVAL")]
    pub git_poll_interval: Duration,

    /// Ref used when a git chart source names none
    #[arg(long, default_value = "master", env = "CHARTWARDEN_GIT_DEFAULT_REF")]
    pub git_default_ref: String,

    /// Directory holding the git mirrors
    #[arg(long, default_value = "/tmp/chartwarden/mirrors", env = "CHARTWARDEN_GIT_MIRROR_DIR")]
    pub git_mirror_dir: PathBuf,

    /// Directory for charts downloaded from chart repositories
    #[arg(long, default_value = "/tmp/chartwarden/cache", env = "CHARTWARDEN_CHART_CACHE_DIR")]
    pub chart_cache_dir: PathBuf,

    /// Timeout of chart repository and external values downloads
    #[arg(long, default_value = "1m", value_parser = humantime::parse_duration, env = "CHARTWARDEN_HTTP_TIMEOUT")]
    pub http_timeout: Duration,

    /// Helm versions to register clients for
    #[arg(long, value_delimiter = ',', default_value = "v3", env = "CHARTWARDEN_ENABLED_HELM_VERSIONS")]
    pub enabled_helm_versions: Vec<String>,

    /// Path of the helm executable
    #[arg(long, default_value = "helm", env = "CHARTWARDEN_HELM_BINARY")]
    pub helm_binary: PathBuf,
}

/// Run the operator until SIGINT or SIGTERM
pub async fn run(args: RunArgs) -> Result<()> {
    let clients = Arc::new(helm_clients(&args)?);
    let client = kube_client(args.kubeconfig.as_deref()).await?;
    let (trigger, shutdown) = shutdown::channel();

    let cache = Arc::new(ReleaseCache::new());
    let queue = Arc::new(WorkQueue::default());
    let mirrors = Arc::new(Mirrors::new(&args.git_mirror_dir, shutdown.clone()));
    let tracker = Arc::new(ChartSourceTracker::new(
        mirrors,
        TrackerConfig {
            poll_interval: args.git_poll_interval,
            timeout: args.git_timeout,
            default_ref: args.git_default_ref.clone(),
        },
        cache.clone(),
        queue.clone(),
    ));

    let charts = Arc::new(ChartCache::new(&args.chart_cache_dir, args.http_timeout).into_diagnostic()?);
    let status = StatusTracker::new(Arc::new(KubeStatusClient::new(client.clone())));
    let annotator = Arc::new(KubeAnnotator::new(client.clone()).await.into_diagnostic()?);
    let http = reqwest::Client::builder()
        .timeout(args.http_timeout)
        .build()
        .into_diagnostic()?;
    let values = Arc::new(ValuesComposer::new(Arc::new(client.clone()), http));

    let reconciler = Reconciler::new(clients, tracker.clone(), charts, status, annotator, values)
        .with_config(ReconcilerConfig {
            update_deps: args.update_chart_deps,
            log_diffs: args.log_release_diffs,
            default_helm_version: DEFAULT_HELM_VERSION.to_string(),
        });

    let operator = Arc::new(Operator::new(
        Arc::new(reconciler),
        tracker,
        queue,
        cache,
        OperatorConfig {
            workers: args.workers,
            resync_interval: args.charts_sync_interval,
            status_interval: args.status_update_interval,
            namespace: args.allow_namespace.clone(),
        },
    ));

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        trigger.trigger();
    });

    operator.run(client, shutdown).await;
    Ok(())
}

/// Register a client for each enabled helm version
fn helm_clients(args: &RunArgs) -> Result<Clients, CliError> {
    let clients = Clients::new();
    for version in &args.enabled_helm_versions {
        let version = version.trim();
        if version != DEFAULT_HELM_VERSION {
            warn!(version, "unsupported helm version, no client registered");
            continue;
        }

        let mut helm = HelmCli::new(&args.helm_binary);
        if let Some(path) = &args.kubeconfig {
            helm = helm.with_kubeconfig(path);
        }
        clients.add(Arc::new(helm));
        info!(version, binary = %args.helm_binary.display(), "registered helm client");
    }

    if clients.versions().is_empty() {
        return Err(CliError::config_with_help(
            format!("no supported helm version in {:?}", args.enabled_helm_versions),
            format!("enable at least '{}'", DEFAULT_HELM_VERSION),
        ));
    }
    Ok(clients)
}

async fn kube_client(kubeconfig: Option<&Path>) -> Result<Client, CliError> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(CliError::kube)?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(CliError::kube)?
        }
        None => kube::Config::infer().await.map_err(CliError::kube)?,
    };
    Client::try_from(config).map_err(CliError::kube)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {},
                    _ = sigint.recv() => {},
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "cannot register signal handlers, falling back to ctrl-c");
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
