//! Client backed by the `helm` v3 executable

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chartwarden_core::{ChartInfo, Release, ReleaseStatus, Values};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::{
    GetOptions, HelmClient, HistoryOptions, RollbackOptions, UninstallOptions, UpgradeOptions,
};
use crate::error::{KubeError, Result};

/// Bound on commands that do not carry their own timeout
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Extra time granted on top of a command's own `--timeout`
const TIMEOUT_GRACE: Duration = Duration::from_secs(30);

/// Drives releases by invoking `helm` and parsing its JSON output
#[derive(Debug, Clone)]
pub struct HelmCli {
    binary: PathBuf,
    kubeconfig: Option<PathBuf>,
    call_timeout: Duration,
}

impl HelmCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            kubeconfig: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Pass an explicit kubeconfig to every invocation
    pub fn with_kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    async fn run(&self, command: &str, args: Vec<OsString>, limit: Duration) -> Result<Vec<u8>> {
        debug!(command, "running helm");
        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd.env("KUBECONFIG", kubeconfig);
        }

        let output = match tokio::time::timeout(limit, cmd.output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(KubeError::Timeout {
                    command: command.to_string(),
                    seconds: limit.as_secs(),
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr
                .trim()
                .trim_start_matches("Error: ")
                .to_string();
            return Err(KubeError::Helm {
                command: command.to_string(),
                message: if message.is_empty() {
                    format!("exited with {}", output.status)
                } else {
                    message
                },
            });
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl HelmClient for HelmCli {
    fn version(&self) -> &str {
        "v3"
    }

    async fn get(&self, name: &str, opts: &GetOptions) -> Result<Option<Release>> {
        let mut args = args(&["status", name, "--namespace", &opts.namespace, "--output", "json"]);
        if let Some(version) = opts.version {
            args.push("--revision".into());
            args.push(version.to_string().into());
        }

        match self.run("status", args, self.call_timeout).await {
            Ok(out) => parse_release(&out).map(Some),
            Err(e) if is_release_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn upgrade_from_path(
        &self,
        chart_path: &Path,
        name: &str,
        values: &Values,
        opts: &UpgradeOptions,
    ) -> Result<Release> {
        let values_file = tempfile::Builder::new()
            .prefix("chartwarden-values-")
            .suffix(".yaml")
            .tempfile()?;
        tokio::fs::write(values_file.path(), values.to_yaml()?).await?;

        let args = upgrade_args(chart_path, name, values_file.path(), opts);
        let out = self.run("upgrade", args, opts.timeout + TIMEOUT_GRACE).await?;
        parse_release(&out)
    }

    async fn rollback(&self, name: &str, opts: &RollbackOptions) -> Result<Release> {
        self.run("rollback", rollback_args(name, opts), opts.timeout + TIMEOUT_GRACE)
            .await?;

        let get = GetOptions {
            namespace: opts.namespace.clone(),
            version: None,
        };
        self.get(name, &get).await?.ok_or_else(|| KubeError::Helm {
            command: "rollback".to_string(),
            message: format!("release '{}' not found after rollback", name),
        })
    }

    async fn uninstall(&self, name: &str, opts: &UninstallOptions) -> Result<()> {
        let mut args = args(&["uninstall", name, "--namespace", &opts.namespace]);
        args.push("--timeout".into());
        args.push(format_timeout(opts.timeout).into());
        if opts.keep_history {
            args.push("--keep-history".into());
        }
        self.run("uninstall", args, opts.timeout + TIMEOUT_GRACE)
            .await
            .map(|_| ())
    }

    async fn history(&self, name: &str, opts: &HistoryOptions) -> Result<Vec<Release>> {
        let mut args = args(&["history", name, "--namespace", &opts.namespace, "--output", "json"]);
        if opts.max > 0 {
            args.push("--max".into());
            args.push(opts.max.to_string().into());
        }

        match self.run("history", args, self.call_timeout).await {
            Ok(out) => parse_history(&out, name, &opts.namespace),
            Err(e) if is_release_not_found(&e) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn dependency_update(&self, chart_path: &Path) -> Result<()> {
        let mut args = args(&["dependency", "update"]);
        args.push(chart_path.as_os_str().to_owned());
        self.run("dependency update", args, self.call_timeout)
            .await
            .map(|_| ())
    }
}

fn args(parts: &[&str]) -> Vec<OsString> {
    parts.iter().map(OsString::from).collect()
}

fn format_timeout(timeout: Duration) -> String {
    format!("{}s", timeout.as_secs())
}

fn upgrade_args(
    chart_path: &Path,
    name: &str,
    values_file: &Path,
    opts: &UpgradeOptions,
) -> Vec<OsString> {
    let mut out = args(&["upgrade", name]);
    out.push(chart_path.as_os_str().to_owned());
    out.extend(args(&["--namespace", &opts.namespace, "--output", "json"]));
    out.push("--values".into());
    out.push(values_file.as_os_str().to_owned());
    out.push("--timeout".into());
    out.push(format_timeout(opts.timeout).into());
    if opts.max_history > 0 {
        out.push("--history-max".into());
        out.push(opts.max_history.to_string().into());
    }

    let flags = [
        (opts.install, "--install"),
        (opts.dry_run, "--dry-run"),
        (opts.force, "--force"),
        (opts.reset_values, "--reset-values"),
        (opts.reuse_values, "--reuse-values"),
        (opts.wait, "--wait"),
        (opts.skip_crds, "--skip-crds"),
    ];
    out.extend(
        flags
            .iter()
            .filter(|(set, _)| *set)
            .map(|(_, flag)| OsString::from(flag)),
    );
    out
}

fn rollback_args(name: &str, opts: &RollbackOptions) -> Vec<OsString> {
    let mut out = args(&["rollback", name]);
    if let Some(version) = opts.version {
        out.push(version.to_string().into());
    }
    out.extend(args(&["--namespace", &opts.namespace]));
    out.push("--timeout".into());
    out.push(format_timeout(opts.timeout).into());

    let flags = [
        (opts.wait, "--wait"),
        (opts.disable_hooks, "--no-hooks"),
        (opts.recreate, "--recreate-pods"),
        (opts.force, "--force"),
    ];
    out.extend(
        flags
            .iter()
            .filter(|(set, _)| *set)
            .map(|(_, flag)| OsString::from(flag)),
    );
    out
}

fn is_release_not_found(err: &KubeError) -> bool {
    matches!(err, KubeError::Helm { message, .. } if message.contains("not found"))
}

#[derive(Debug, Deserialize)]
struct ReleaseJson {
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    version: u32,
    #[serde(default)]
    info: Option<InfoJson>,
    #[serde(default)]
    chart: Option<ChartJson>,
    #[serde(default)]
    config: Option<serde_json::Value>,
    #[serde(default)]
    manifest: String,
}

#[derive(Debug, Deserialize)]
struct InfoJson {
    #[serde(default)]
    status: String,
    #[serde(default)]
    last_deployed: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChartJson {
    #[serde(default)]
    metadata: Option<ChartMetadataJson>,
}

#[derive(Debug, Deserialize)]
struct ChartMetadataJson {
    name: String,
    #[serde(default)]
    version: String,
    #[serde(default, rename = "appVersion")]
    app_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryJson {
    revision: u32,
    #[serde(default)]
    updated: Option<String>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    chart: String,
    #[serde(default)]
    app_version: Option<String>,
}

fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn parse_release(out: &[u8]) -> Result<Release> {
    let raw: ReleaseJson = serde_json::from_slice(out)?;

    let values = match raw.config {
        Some(config) if !config.is_null() => Values::from_json_value(config)?,
        _ => Values::new(),
    };
    let chart = raw
        .chart
        .and_then(|c| c.metadata)
        .map(|m| ChartInfo {
            name: m.name,
            version: m.version,
            app_version: m.app_version.filter(|v| !v.is_empty()),
        })
        .unwrap_or_default();
    let (status, updated_at) = match &raw.info {
        Some(info) => (
            info.status.parse().unwrap_or(ReleaseStatus::Unknown),
            parse_time(info.last_deployed.as_deref()),
        ),
        None => (ReleaseStatus::Unknown, None),
    };

    Ok(Release {
        name: raw.name,
        namespace: raw.namespace,
        revision: raw.version,
        status,
        chart,
        values,
        manifest: raw.manifest,
        updated_at,
    })
}

fn parse_history(out: &[u8], name: &str, namespace: &str) -> Result<Vec<Release>> {
    let entries: Vec<HistoryJson> = serde_json::from_slice(out)?;
    let mut releases: Vec<Release> = entries
        .into_iter()
        .map(|entry| {
            let (chart_name, version) = split_chart_ref(&entry.chart);
            Release {
                name: name.to_string(),
                namespace: namespace.to_string(),
                revision: entry.revision,
                status: entry.status.parse().unwrap_or(ReleaseStatus::Unknown),
                chart: ChartInfo {
                    name: chart_name.to_string(),
                    version: version.to_string(),
                    app_version: entry.app_version.filter(|v| !v.is_empty()),
                },
                values: Values::new(),
                manifest: String::new(),
                updated_at: parse_time(entry.updated.as_deref()),
            }
        })
        .collect();

    releases.sort_by(|a, b| b.revision.cmp(&a.revision));
    Ok(releases)
}

/// Split `name-version` as printed by `helm history`
///
/// The version starts at the first dash followed by a digit.
fn split_chart_ref(chart: &str) -> (&str, &str) {
    let bytes = chart.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'-' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit) {
            return (&chart[..i], &chart[i + 1..]);
        }
    }
    (chart, "")
}
