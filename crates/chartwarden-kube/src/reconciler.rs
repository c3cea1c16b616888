//! Release reconciliation
//!
//! One call to [`Reconciler::sync`] brings one HelmRelease closer to its
//! declared state: the chart is prepared, values are composed, an action is
//! determined from the live release and the resource's status, and the
//! action is executed against the package manager. Status is recorded
//! before and after every step.
//!
//! Callers must never run two reconciliations of the same resource at once;
//! the work queue guarantees this.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chartwarden_core::{
    ChartSourceRef, Condition, ConditionStatus, ConditionType, HelmRelease, Phase, PhaseUpdate,
    Release, ReleaseStatus, Values, reason,
};
use chartwarden_source::{ChartCache, ChartSourceTracker, Export, ResolvedChart, SourceError};
use tracing::{debug, info, warn};

use crate::annotator::{Annotator, Ownership};
use crate::diff::ReleaseDiff;
use crate::error::{KubeError, Result};
use crate::helm::{
    Clients, GetOptions, HelmClient, HistoryOptions, RollbackOptions, UninstallOptions,
    UpgradeOptions,
};
use crate::metrics::{Observer, ReleaseAction, ReleaseObservation, TracingObserver};
use crate::status::{StatusTracker, has_rolled_back, has_synced};
use crate::values::ValuesComposer;

/// Where git charts come from
#[async_trait]
pub trait ChartSources: Send + Sync {
    async fn resolve(&self, hr: &HelmRelease) -> chartwarden_source::Result<ResolvedChart>;

    /// Forget the release's source; returns whether one was tracked
    async fn delete(&self, hr: &HelmRelease) -> bool;
}

#[async_trait]
impl ChartSources for ChartSourceTracker {
    async fn resolve(&self, hr: &HelmRelease) -> chartwarden_source::Result<ResolvedChart> {
        ChartSourceTracker::resolve(self, hr).await
    }

    async fn delete(&self, hr: &HelmRelease) -> bool {
        ChartSourceTracker::delete(self, hr).await
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Run `dependency update` on git charts
    pub update_deps: bool,
    /// Log the diff found by a dry-run comparison
    pub log_diffs: bool,
    /// Client version used when a resource names none
    pub default_helm_version: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            update_deps: true,
            log_diffs: false,
            default_helm_version: chartwarden_core::resource::DEFAULT_HELM_VERSION.to_string(),
        }
    }
}

/// A chart ready to hand to the package manager
struct PreparedChart {
    path: PathBuf,
    revision: String,
    /// Keeps the git export alive until the action is done
    _export: Option<Arc<Export>>,
}

/// Outcome of action determination
#[derive(Debug)]
enum Decision {
    Install,
    Upgrade,
    Rollback,
    /// Dry-run and compare against `baseline`, the live release when `None`
    DryRunCompare { baseline: Option<Release> },
    /// Nothing to do, or a policy forbids acting
    Skip(Option<KubeError>),
}

/// Executes release actions for HelmRelease resources
pub struct Reconciler {
    clients: Arc<Clients>,
    sources: Arc<dyn ChartSources>,
    charts: Arc<ChartCache>,
    status: StatusTracker,
    annotator: Arc<dyn Annotator>,
    values: Arc<ValuesComposer>,
    observer: Arc<dyn Observer>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        clients: Arc<Clients>,
        sources: Arc<dyn ChartSources>,
        charts: Arc<ChartCache>,
        status: StatusTracker,
        annotator: Arc<dyn Annotator>,
        values: Arc<ValuesComposer>,
    ) -> Self {
        Self {
            clients,
            sources,
            charts,
            status,
            annotator,
            values,
            observer: Arc::new(TracingObserver),
            config: ReconcilerConfig::default(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn status(&self) -> &StatusTracker {
        &self.status
    }

    pub fn clients(&self) -> &Clients {
        &self.clients
    }

    /// Client serving the resource's version tag
    pub fn client_for(&self, hr: &HelmRelease) -> Result<Arc<dyn HelmClient>> {
        let version = hr.helm_version(&self.config.default_helm_version);
        self.clients.load(version).ok_or_else(|| KubeError::NoClient {
            version: version.to_string(),
        })
    }

    /// Reconcile the release declared by `hr`
    ///
    /// Returns the action taken. Policy errors (ownership, release state)
    /// and execution failures are returned after being recorded in status.
    pub async fn sync(&self, hr: &HelmRelease) -> Result<ReleaseAction> {
        // Decisions read the status as it was when the cycle started
        let rolled_back = has_rolled_back(hr);
        let synced = has_synced(hr);
        let mut current = hr.clone();

        let client = match self.client_for(hr) {
            Ok(client) => client,
            Err(e) => {
                self.note_condition(&mut current, ConditionType::Released, reason::RELEASE_STATE_BLOCKED, &e)
                    .await;
                return Err(e);
            }
        };

        let chart = self.prepare_chart(&mut current, client.as_ref()).await?;

        let values = match self.values.compose(&current, &chart.path).await {
            Ok(values) => values,
            Err(e) => {
                self.note_phase(
                    &mut current,
                    PhaseUpdate::new(Phase::Failed).with_reason(reason::VALUES_COMPOSE_FAILED, e.to_string()),
                )
                .await;
                return Err(e);
            }
        };

        let live = client
            .get(
                &hr.release_name(),
                &GetOptions {
                    namespace: hr.target_namespace(),
                    version: None,
                },
            )
            .await?;

        let decision = self
            .determine_action(hr, client.as_ref(), live.as_ref(), &chart.revision, synced, rolled_back)
            .await?;
        debug!(release = %hr.key(), decision = ?decision, "determined release action");

        let result = self
            .execute(&mut current, client.as_ref(), decision, live.as_ref(), &chart, &values)
            .await;

        if let Err(e) = self
            .status
            .set_observed_generation(&current, hr.generation())
            .await
        {
            warn!(release = %hr.key(), error = %e, "failed to record observed generation");
        }

        result
    }

    /// Remove the release of a deleted resource and forget its chart source
    ///
    /// Only deployed and failed releases are uninstalled; an already
    /// uninstalled release is left alone. The chart source is released
    /// whatever the outcome.
    pub async fn delete(&self, hr: &HelmRelease) -> Result<()> {
        let result = self.uninstall(hr).await;
        if self.sources.delete(hr).await {
            debug!(release = %hr.key(), "released chart source");
        }
        result
    }

    // ========== Chart preparation ==========

    async fn prepare_chart(&self, hr: &mut HelmRelease, client: &dyn HelmClient) -> Result<PreparedChart> {
        let chart_source = hr.spec.chart.clone();
        let source = match chart_source.source() {
            Ok(source) => source,
            Err(e) => {
                let e = KubeError::from(e);
                self.note_phase(
                    hr,
                    PhaseUpdate::new(Phase::ChartFetchFailed).with_reason(reason::CHART_SOURCE_INVALID, e.to_string()),
                )
                .await;
                return Err(e);
            }
        };

        let (chart, fetched) = match source {
            ChartSourceRef::Git(git) => {
                let resolved = match self.sources.resolve(hr).await {
                    Ok(resolved) => resolved,
                    Err(e) => {
                        if e.is_not_ready() {
                            debug!(release = %hr.key(), error = %e, "chart source not ready");
                        }
                        let e = KubeError::from(e);
                        self.note_phase(
                            hr,
                            PhaseUpdate::new(Phase::ChartFetchFailed)
                                .with_reason(reason::GIT_REPO_NOT_READY, e.to_string()),
                        )
                        .await;
                        return Err(e);
                    }
                };

                let path = resolved.chart_path(&git.path);
                if !tokio::fs::try_exists(path.join("Chart.yaml")).await? {
                    let e = KubeError::Source(SourceError::Unavailable {
                        remote: git.git.clone(),
                        message: format!("no chart found at path '{}' in {}", git.path, resolved.revision),
                    });
                    self.note_phase(
                        hr,
                        PhaseUpdate::new(Phase::ChartFetchFailed)
                            .with_reason(reason::CHART_SOURCE_INVALID, e.to_string()),
                    )
                    .await;
                    return Err(e);
                }

                if self.config.update_deps && !git.skip_dep_update {
                    if let Err(e) = client.dependency_update(&path).await {
                        self.note_phase(
                            hr,
                            PhaseUpdate::new(Phase::ChartFetchFailed)
                                .with_reason(reason::UPDATE_DEPENDENCY_FAILED, e.to_string()),
                        )
                        .await;
                        return Err(e);
                    }
                }

                let chart = PreparedChart {
                    path,
                    revision: resolved.revision.clone(),
                    _export: Some(resolved.export),
                };
                (chart, PhaseUpdate::new(Phase::ChartFetched))
            }
            ChartSourceRef::Repository(repo) => {
                let fetched = match self.charts.ensure_fetched(repo).await {
                    Ok(fetched) => fetched,
                    Err(e) => {
                        let e = KubeError::from(e);
                        self.note_phase(
                            hr,
                            PhaseUpdate::new(Phase::ChartFetchFailed)
                                .with_reason(reason::REPO_FETCH_FAILED, e.to_string()),
                        )
                        .await;
                        return Err(e);
                    }
                };
                if !fetched.cached {
                    info!(release = %hr.key(), chart = %repo.name, version = %repo.version, "chart downloaded");
                }

                let chart = PreparedChart {
                    path: fetched.path,
                    revision: repo.version.clone(),
                    _export: None,
                };
                let update = PhaseUpdate::new(Phase::ChartFetched).with_reason(
                    reason::REPO_CHART_IN_CACHE,
                    format!("Chart '{}-{}' is available in the local cache.", repo.name, repo.version),
                );
                (chart, update)
            }
        };

        let status = hr.status_or_default();
        let already_fetched = status
            .condition(ConditionType::ChartFetched)
            .is_some_and(Condition::is_true)
            && status.last_attempted_revision.as_deref() == Some(chart.revision.as_str());
        if !already_fetched {
            *hr = self.status.set_phase(hr, fetched).await?;
        }

        Ok(chart)
    }

    // ========== Action determination ==========

    async fn determine_action(
        &self,
        hr: &HelmRelease,
        client: &dyn HelmClient,
        live: Option<&Release>,
        revision: &str,
        synced: bool,
        rolled_back: bool,
    ) -> Result<Decision> {
        let release_name = hr.release_name();

        let Some(live) = live.filter(|r| r.status != ReleaseStatus::Uninstalled) else {
            return Ok(Decision::Install);
        };

        let ownership = self.annotator.ownership(live).await?;
        if !ownership.permits(hr) {
            let owner = match ownership {
                Ownership::Claimed(owner) => owner,
                Ownership::Unclaimed => String::new(),
            };
            return Ok(Decision::Skip(Some(KubeError::NotOwned {
                release: release_name,
                owner,
            })));
        }

        if live.status.is_pending() {
            return Ok(Decision::Skip(Some(KubeError::ReleaseBlocked {
                release: release_name,
                status: live.status,
                operation: "upgraded",
            })));
        }

        if live.status == ReleaseStatus::Failed {
            if hr.spec.rollback.enable {
                return Ok(Decision::Rollback);
            }
            if !synced {
                return Ok(Decision::Upgrade);
            }
            return Ok(Decision::Skip(Some(KubeError::RollbackRequired {
                release: release_name,
            })));
        }

        if !synced {
            return Ok(Decision::Upgrade);
        }

        if rolled_back {
            let status = hr.status_or_default();
            let revision_changed = status.last_attempted_revision.as_deref() != Some(revision);
            let may_retry = hr.spec.rollback.retry && status.rollback_count < hr.spec.rollback.max_retries();
            if revision_changed || may_retry {
                return Ok(Decision::Upgrade);
            }

            let history = client
                .history(
                    &release_name,
                    &HistoryOptions {
                        namespace: hr.target_namespace(),
                        max: hr.max_history(),
                    },
                )
                .await?;
            let baseline = history
                .into_iter()
                .find(|r| matches!(r.status, ReleaseStatus::Failed | ReleaseStatus::Superseded));
            return Ok(Decision::DryRunCompare { baseline });
        }

        Ok(Decision::DryRunCompare { baseline: None })
    }

    // ========== Execution ==========

    async fn execute(
        &self,
        hr: &mut HelmRelease,
        client: &dyn HelmClient,
        decision: Decision,
        live: Option<&Release>,
        chart: &PreparedChart,
        values: &Values,
    ) -> Result<ReleaseAction> {
        match decision {
            Decision::Install => self.install(hr, client, chart, values).await,
            Decision::Upgrade => {
                let before = live.map_or(0, |r| r.revision);
                self.upgrade(hr, client, chart, values, before).await
            }
            Decision::Rollback => self.rollback(hr, client).await,
            Decision::DryRunCompare { baseline } => {
                let Some(live) = live else {
                    return self.install(hr, client, chart, values).await;
                };
                let started = Instant::now();
                let dry_run = client
                    .upgrade_from_path(&chart.path, &hr.release_name(), values, &self.upgrade_options(hr, true))
                    .await;
                self.observe(hr, ReleaseAction::DryRunCompare, true, dry_run.is_ok(), started);
                let desired = dry_run?;

                let diff = ReleaseDiff::between(baseline.as_ref().unwrap_or(live), &desired);
                if self.config.log_diffs {
                    for part in [&diff.values, &diff.chart, &diff.manifest].into_iter().flatten() {
                        debug!(release = %hr.key(), diff = %part, "release diff");
                    }
                }
                if diff.is_empty() {
                    debug!(release = %hr.key(), "no changes found, skipping upgrade");
                    return Ok(ReleaseAction::Skip);
                }

                info!(release = %hr.key(), changes = %diff.summary(), "dry-run found changes");
                self.upgrade(hr, client, chart, values, live.revision).await
            }
            Decision::Skip(None) => Ok(ReleaseAction::Skip),
            Decision::Skip(Some(e)) => {
                let reason = match e {
                    KubeError::NotOwned { .. } => reason::RELEASE_NOT_OWNED,
                    _ => reason::RELEASE_STATE_BLOCKED,
                };
                warn!(release = %hr.key(), error = %e, "skipping release");
                self.note_condition(hr, ConditionType::Released, reason, &e).await;
                Err(e)
            }
        }
    }

    async fn install(
        &self,
        hr: &mut HelmRelease,
        client: &dyn HelmClient,
        chart: &PreparedChart,
        values: &Values,
    ) -> Result<ReleaseAction> {
        let release_name = hr.release_name();
        *hr = self
            .status
            .set_phase(hr, PhaseUpdate::new(Phase::Installing).with_revision(&chart.revision))
            .await?;
        info!(release = %hr.key(), revision = %chart.revision, "installing release");

        let mut opts = self.upgrade_options(hr, false);
        opts.install = true;
        let started = Instant::now();
        let result = client
            .upgrade_from_path(&chart.path, &release_name, values, &opts)
            .await;
        self.observe(hr, ReleaseAction::Install, false, result.is_ok(), started);

        match result {
            Ok(release) => {
                self.succeeded(hr, &release, chart, values).await?;
                Ok(ReleaseAction::Install)
            }
            Err(e) => {
                warn!(release = %hr.key(), error = %e, "install failed");
                self.note_phase(
                    hr,
                    PhaseUpdate::new(Phase::Failed).with_reason(reason::INSTALL_FAILED, e.to_string()),
                )
                .await;
                self.clean_failed_install(hr, client).await;
                Err(e)
            }
        }
    }

    /// Remove a failed first install so the next attempt starts clean
    async fn clean_failed_install(&self, hr: &HelmRelease, client: &dyn HelmClient) {
        let release_name = hr.release_name();
        let namespace = hr.target_namespace();
        let history = match client
            .history(
                &release_name,
                &HistoryOptions {
                    namespace: namespace.clone(),
                    max: 2,
                },
            )
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!(release = %hr.key(), error = %e, "failed to read history after failed install");
                return;
            }
        };

        if let [only] = history.as_slice() {
            if only.status == ReleaseStatus::Failed {
                info!(release = %hr.key(), "removing failed first install");
                let opts = UninstallOptions {
                    namespace,
                    timeout: hr.timeout(),
                    keep_history: false,
                };
                if let Err(e) = client.uninstall(&release_name, &opts).await {
                    warn!(release = %hr.key(), error = %e, "failed to remove failed install");
                }
            }
        }
    }

    async fn upgrade(
        &self,
        hr: &mut HelmRelease,
        client: &dyn HelmClient,
        chart: &PreparedChart,
        values: &Values,
        before: u32,
    ) -> Result<ReleaseAction> {
        let release_name = hr.release_name();
        *hr = self
            .status
            .set_phase(hr, PhaseUpdate::new(Phase::Upgrading).with_revision(&chart.revision))
            .await?;
        info!(release = %hr.key(), revision = %chart.revision, "upgrading release");

        let started = Instant::now();
        let result = client
            .upgrade_from_path(&chart.path, &release_name, values, &self.upgrade_options(hr, false))
            .await;
        self.observe(hr, ReleaseAction::Upgrade, false, result.is_ok(), started);

        let err = match result {
            Ok(release) => {
                self.succeeded(hr, &release, chart, values).await?;
                return Ok(ReleaseAction::Upgrade);
            }
            Err(e) => e,
        };

        warn!(release = %hr.key(), error = %err, "upgrade failed");
        self.note_phase(
            hr,
            PhaseUpdate::new(Phase::Failed).with_reason(reason::UPGRADE_FAILED, err.to_string()),
        )
        .await;

        if !hr.spec.rollback.enable {
            return Err(err);
        }

        // Roll back only when the failed attempt left a revision behind;
        // otherwise there is nothing of ours to undo.
        let after = client
            .get(
                &release_name,
                &GetOptions {
                    namespace: hr.target_namespace(),
                    version: None,
                },
            )
            .await;
        match after {
            Ok(Some(release)) if release.revision > before => {
                if let Err(e) = self.rollback(hr, client).await {
                    warn!(release = %hr.key(), error = %e, "rollback after failed upgrade failed");
                }
            }
            Ok(_) => {
                debug!(release = %hr.key(), "failed upgrade created no revision, not rolling back");
            }
            Err(e) => {
                warn!(release = %hr.key(), error = %e, "cannot read release after failed upgrade");
            }
        }

        Err(err)
    }

    async fn rollback(&self, hr: &mut HelmRelease, client: &dyn HelmClient) -> Result<ReleaseAction> {
        let release_name = hr.release_name();
        *hr = self
            .status
            .set_phase(hr, PhaseUpdate::new(Phase::RollingBack))
            .await?;
        info!(release = %hr.key(), "rolling back release");

        let rollback = &hr.spec.rollback;
        let opts = RollbackOptions {
            namespace: hr.target_namespace(),
            version: None,
            timeout: rollback.timeout(),
            wait: rollback.wait,
            disable_hooks: rollback.disable_hooks,
            recreate: rollback.recreate,
            force: rollback.force,
        };

        let started = Instant::now();
        let result = client.rollback(&release_name, &opts).await;
        self.observe(hr, ReleaseAction::Rollback, false, result.is_ok(), started);

        match result {
            Ok(release) => {
                self.annotate(hr, &release).await;
                *hr = self
                    .status
                    .set_phase(hr, PhaseUpdate::new(Phase::RolledBack))
                    .await?;
                self.note_release_status(hr, &release).await;
                Ok(ReleaseAction::Rollback)
            }
            Err(e) => {
                warn!(release = %hr.key(), error = %e, "rollback failed");
                self.note_phase(
                    hr,
                    PhaseUpdate::new(Phase::RollbackFailed).with_reason(reason::ROLLBACK_FAILED, e.to_string()),
                )
                .await;
                Err(e)
            }
        }
    }

    /// Bookkeeping after a successful install or upgrade
    async fn succeeded(
        &self,
        hr: &mut HelmRelease,
        release: &Release,
        chart: &PreparedChart,
        values: &Values,
    ) -> Result<()> {
        self.annotate(hr, release).await;
        *hr = self
            .status
            .set_phase(hr, PhaseUpdate::new(Phase::Succeeded).with_revision(&chart.revision))
            .await?;
        *hr = self.status.set_values_checksum(hr, &values.checksum()?).await?;
        self.note_release_status(hr, release).await;
        info!(
            release = %hr.key(),
            revision = %chart.revision,
            version = release.revision,
            "release succeeded"
        );
        Ok(())
    }

    // ========== Deletion ==========

    async fn uninstall(&self, hr: &HelmRelease) -> Result<()> {
        let client = self.client_for(hr)?;
        let release_name = hr.release_name();
        let namespace = hr.target_namespace();

        let live = client
            .get(
                &release_name,
                &GetOptions {
                    namespace: namespace.clone(),
                    version: None,
                },
            )
            .await?;
        let Some(live) = live else {
            debug!(release = %hr.key(), "no release to uninstall");
            return Ok(());
        };

        if live.status == ReleaseStatus::Uninstalled {
            return Ok(());
        }
        if !live.status.allows_uninstall() {
            return Err(KubeError::ReleaseBlocked {
                release: release_name,
                status: live.status,
                operation: "uninstalled",
            });
        }
        if let Ownership::Claimed(owner) = self.annotator.ownership(&live).await? {
            if owner != hr.resource_id() {
                return Err(KubeError::NotOwned {
                    release: release_name,
                    owner,
                });
            }
        }

        info!(release = %hr.key(), "uninstalling release");
        let opts = UninstallOptions {
            namespace,
            timeout: hr.timeout(),
            keep_history: false,
        };
        let started = Instant::now();
        let result = client.uninstall(&release_name, &opts).await;
        self.observe(hr, ReleaseAction::Uninstall, false, result.is_ok(), started);
        result
    }

    // ========== Helpers ==========

    fn upgrade_options(&self, hr: &HelmRelease, dry_run: bool) -> UpgradeOptions {
        UpgradeOptions {
            namespace: hr.target_namespace(),
            timeout: hr.timeout(),
            install: false,
            dry_run,
            force: hr.spec.force_upgrade,
            reset_values: hr.reset_values(),
            reuse_values: false,
            wait: hr.spec.wait || hr.spec.rollback.enable,
            skip_crds: hr.spec.skip_crds,
            max_history: hr.max_history(),
        }
    }

    async fn annotate(&self, hr: &HelmRelease, release: &Release) {
        match self.annotator.annotate(release, &hr.resource_id()).await {
            Ok(count) => debug!(release = %hr.key(), objects = count, "annotated release objects"),
            Err(e) => warn!(release = %hr.key(), error = %e, "failed to annotate release objects"),
        }
    }

    fn observe(&self, hr: &HelmRelease, action: ReleaseAction, dry_run: bool, success: bool, started: Instant) {
        self.observer.observe(ReleaseObservation {
            action,
            dry_run,
            success,
            namespace: hr.target_namespace(),
            release_name: hr.release_name(),
            duration: started.elapsed(),
        });
    }

    /// Record a phase on a failure path; a failed write is only logged
    async fn note_phase(&self, hr: &mut HelmRelease, update: PhaseUpdate) {
        match self.status.set_phase(hr, update).await {
            Ok(updated) => *hr = updated,
            Err(e) => warn!(release = %hr.key(), error = %e, "failed to record phase"),
        }
    }

    async fn note_condition(&self, hr: &mut HelmRelease, type_: ConditionType, reason: &str, err: &KubeError) {
        let condition = Condition::new(type_, ConditionStatus::False, reason, err.to_string());
        match self.status.set_condition(hr, condition).await {
            Ok(updated) => *hr = updated,
            Err(e) => warn!(release = %hr.key(), error = %e, "failed to record condition"),
        }
    }

    async fn note_release_status(&self, hr: &mut HelmRelease, release: &Release) {
        match self
            .status
            .set_release_status(hr, &release.name, &release.status.to_string())
            .await
        {
            Ok(updated) => *hr = updated,
            Err(e) => warn!(release = %hr.key(), error = %e, "failed to record release status"),
        }
    }
}
