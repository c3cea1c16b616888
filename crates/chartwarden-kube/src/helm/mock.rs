//! In-memory package-manager client for testing
//!
//! Releases live in memory with their full history, so reconciler tests
//! can assert both on the resulting release state and on which calls
//! were issued.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chartwarden_core::{ChartInfo, Release, ReleaseStatus, Values};
use serde::Deserialize;

use super::{
    GetOptions, HelmClient, HistoryOptions, RollbackOptions, UninstallOptions, UpgradeOptions,
};
use crate::error::{KubeError, Result};

/// How the next non-dry-run upgrade fails
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeFailure {
    /// Rejected before any state change, no revision is recorded
    BeforeRevision(String),
    /// Fails after recording a new, failed revision
    AfterRevision(String),
}

/// Counts of operations performed for testing assertions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OperationCounts {
    pub gets: usize,
    pub histories: usize,
    pub dry_runs: usize,
    pub upgrades: usize,
    pub rollbacks: usize,
    pub uninstalls: usize,
    pub dependency_updates: usize,
}

impl OperationCounts {
    /// Calls that change release state
    pub fn mutations(&self) -> usize {
        self.upgrades + self.rollbacks + self.uninstalls
    }
}

#[derive(Default)]
struct MockState {
    /// (namespace, name) -> history, oldest first
    releases: HashMap<(String, String), Vec<Release>>,
    upgrade_failure: Option<UpgradeFailure>,
    rollback_failure: Option<String>,
    dependency_failure: Option<String>,
    /// Manifest returned by every later upgrade or dry-run
    manifest: String,
}

/// In-memory client for testing
#[derive(Clone)]
pub struct MockHelmClient {
    state: Arc<RwLock<MockState>>,
    operations: Arc<RwLock<OperationCounts>>,
}

impl MockHelmClient {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MockState::default())),
            operations: Arc::new(RwLock::new(OperationCounts::default())),
        }
    }

    /// Create with pre-populated release revisions
    pub fn with_releases(releases: Vec<Release>) -> Self {
        let client = Self::new();
        {
            let mut state = client.state.write().unwrap();
            for release in releases {
                let history = state
                    .releases
                    .entry((release.namespace.clone(), release.name.clone()))
                    .or_default();
                history.push(release);
                history.sort_by_key(|r| r.revision);
            }
        }
        client
    }

    /// Make the next non-dry-run upgrade fail
    pub fn fail_next_upgrade(&self, failure: UpgradeFailure) {
        self.state.write().unwrap().upgrade_failure = Some(failure);
    }

    pub fn fail_next_rollback(&self, message: &str) {
        self.state.write().unwrap().rollback_failure = Some(message.to_string());
    }

    pub fn fail_dependency_update(&self, message: &str) {
        self.state.write().unwrap().dependency_failure = Some(message.to_string());
    }

    /// Render `manifest` from now on, e.g. to mimic a chart generating secrets
    pub fn render_manifest(&self, manifest: &str) {
        self.state.write().unwrap().manifest = manifest.to_string();
    }

    /// History of a release, oldest first
    pub fn history_of(&self, namespace: &str, name: &str) -> Vec<Release> {
        self.state
            .read()
            .unwrap()
            .releases
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn latest(&self, namespace: &str, name: &str) -> Option<Release> {
        self.history_of(namespace, name).pop()
    }

    /// Get operation counts for assertions
    pub fn operation_counts(&self) -> OperationCounts {
        self.operations.read().unwrap().clone()
    }

    pub fn reset_counts(&self) {
        *self.operations.write().unwrap() = OperationCounts::default();
    }

    fn count(&self, f: impl FnOnce(&mut OperationCounts)) {
        f(&mut self.operations.write().unwrap());
    }
}

impl Default for MockHelmClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartYaml {
    name: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    app_version: Option<String>,
}

/// Chart identity from `Chart.yaml`, or the directory name
fn read_chart(chart_path: &Path) -> ChartInfo {
    let parsed = std::fs::read_to_string(chart_path.join("Chart.yaml"))
        .ok()
        .and_then(|raw| serde_yaml::from_str::<ChartYaml>(&raw).ok());
    match parsed {
        Some(chart) => ChartInfo {
            name: chart.name,
            version: chart.version,
            app_version: chart.app_version,
        },
        None => ChartInfo {
            name: chart_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            version: "0.0.0".to_string(),
            app_version: None,
        },
    }
}

fn not_found(command: &str, name: &str) -> KubeError {
    KubeError::Helm {
        command: command.to_string(),
        message: format!("release: not found ({})", name),
    }
}

#[async_trait]
impl HelmClient for MockHelmClient {
    fn version(&self) -> &str {
        "v3"
    }

    async fn get(&self, name: &str, opts: &GetOptions) -> Result<Option<Release>> {
        self.count(|ops| ops.gets += 1);
        let history = self.history_of(&opts.namespace, name);
        Ok(match opts.version {
            Some(version) => history.into_iter().find(|r| r.revision == version),
            None => history.into_iter().last(),
        })
    }

    async fn upgrade_from_path(
        &self,
        chart_path: &Path,
        name: &str,
        values: &Values,
        opts: &UpgradeOptions,
    ) -> Result<Release> {
        let chart = read_chart(chart_path);
        let mut state = self.state.write().unwrap();
        let key = (opts.namespace.clone(), name.to_string());
        let latest = state.releases.get(&key).and_then(|h| h.last()).cloned();

        if latest.is_none() && !opts.install {
            return Err(not_found("upgrade", name));
        }

        let mut release = Release {
            name: name.to_string(),
            namespace: opts.namespace.clone(),
            revision: latest.as_ref().map_or(1, |r| r.revision + 1),
            status: ReleaseStatus::Deployed,
            chart,
            values: values.clone(),
            manifest: state.manifest.clone(),
            updated_at: None,
        };

        if opts.dry_run {
            self.count(|ops| ops.dry_runs += 1);
            release.status = ReleaseStatus::PendingUpgrade;
            return Ok(release);
        }
        self.count(|ops| ops.upgrades += 1);

        let failure = state.upgrade_failure.take();
        let history = state.releases.entry(key).or_default();
        match failure {
            Some(UpgradeFailure::BeforeRevision(message)) => Err(KubeError::Helm {
                command: "upgrade".to_string(),
                message,
            }),
            Some(UpgradeFailure::AfterRevision(message)) => {
                release.status = ReleaseStatus::Failed;
                history.push(release);
                Err(KubeError::Helm {
                    command: "upgrade".to_string(),
                    message,
                })
            }
            None => {
                for previous in history.iter_mut() {
                    if previous.status == ReleaseStatus::Deployed {
                        previous.status = ReleaseStatus::Superseded;
                    }
                }
                history.push(release.clone());
                if opts.max_history > 0 {
                    let excess = history.len().saturating_sub(opts.max_history as usize);
                    history.drain(..excess);
                }
                Ok(release)
            }
        }
    }

    async fn rollback(&self, name: &str, opts: &RollbackOptions) -> Result<Release> {
        self.count(|ops| ops.rollbacks += 1);
        let mut state = self.state.write().unwrap();
        if let Some(message) = state.rollback_failure.take() {
            return Err(KubeError::Helm {
                command: "rollback".to_string(),
                message,
            });
        }

        let history = state
            .releases
            .get_mut(&(opts.namespace.clone(), name.to_string()))
            .filter(|h| !h.is_empty())
            .ok_or_else(|| not_found("rollback", name))?;
        let current_revision = history.last().map_or(0, |r| r.revision);
        let target_revision = opts
            .version
            .unwrap_or_else(|| current_revision.saturating_sub(1));
        let target = history
            .iter()
            .find(|r| r.revision == target_revision)
            .cloned()
            .ok_or_else(|| KubeError::Helm {
                command: "rollback".to_string(),
                message: format!("release has no {} version", target_revision),
            })?;

        if let Some(current) = history.last_mut() {
            current.status = ReleaseStatus::Superseded;
        }
        let release = Release {
            revision: current_revision + 1,
            status: ReleaseStatus::Deployed,
            ..target
        };
        history.push(release.clone());
        Ok(release)
    }

    async fn uninstall(&self, name: &str, opts: &UninstallOptions) -> Result<()> {
        self.count(|ops| ops.uninstalls += 1);
        let mut state = self.state.write().unwrap();
        let key = (opts.namespace.clone(), name.to_string());
        if opts.keep_history {
            let latest = state
                .releases
                .get_mut(&key)
                .and_then(|h| h.last_mut())
                .ok_or_else(|| not_found("uninstall", name))?;
            latest.status = ReleaseStatus::Uninstalled;
            return Ok(());
        }
        state
            .releases
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| not_found("uninstall", name))
    }

    async fn history(&self, name: &str, opts: &HistoryOptions) -> Result<Vec<Release>> {
        self.count(|ops| ops.histories += 1);
        let mut history = self.history_of(&opts.namespace, name);
        history.reverse();
        if opts.max > 0 {
            history.truncate(opts.max as usize);
        }
        Ok(history)
    }

    async fn dependency_update(&self, _chart_path: &Path) -> Result<()> {
        self.count(|ops| ops.dependency_updates += 1);
        match self.state.read().unwrap().dependency_failure.clone() {
            Some(message) => Err(KubeError::Helm {
                command: "dependency update".to_string(),
                message,
            }),
            None => Ok(()),
        }
    }
}
