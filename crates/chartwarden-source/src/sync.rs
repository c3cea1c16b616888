//! Per-release tracking of git chart sources
//!
//! The tracker keeps one [`SourceRef`] per release: which mirror and ref the
//! release's chart was last resolved from, the last commit seen on that ref
//! and the exported working copy. Mirror change signals re-run the same
//! resolution for every release on the mirror and queue a reconciliation only
//! when commits touched the release's chart path.
//!
//! Locking is two-level. The map lock guards membership and is held only to
//! look up or insert an entry; each entry has its own async lock held while
//! resolving, so a slow export never blocks unrelated releases.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chartwarden_core::{ChartSourceRef, GitChartSource, HelmRelease};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, SourceError};
use crate::git::{Export, GitRepo, Mirror, MirrorStatus, Mirrors};
use crate::shutdown::Shutdown;

/// Read access to the release resources known to the operator
pub trait ReleaseLister: Send + Sync {
    fn list(&self) -> Vec<Arc<HelmRelease>>;
}

/// Add-only view of the reconciliation queue
pub trait ReleaseQueue: Send + Sync {
    /// Queue the release with the given `namespace/name` key
    fn enqueue(&self, key: &str);
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// How often each mirror polls its remote
    pub poll_interval: Duration,
    /// Bound on every git call
    pub timeout: Duration,
    /// Ref used when a source names none
    pub default_ref: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5 * 60),
            timeout: Duration::from_secs(20),
            default_ref: "master".to_string(),
        }
    }
}

/// An exported chart source at a specific commit
#[derive(Debug, Clone)]
pub struct ResolvedChart {
    pub export: Arc<Export>,
    /// Commit the export is checked out at
    pub revision: String,
}

impl ResolvedChart {
    /// Absolute path of the chart inside the export
    pub fn chart_path(&self, path: &str) -> PathBuf {
        self.export.dir().join(path.trim_start_matches("./").trim_start_matches('/'))
    }
}

#[derive(Debug, Default)]
struct SourceRef {
    mirror: String,
    remote: String,
    git_ref: String,
    /// Last commit seen on `git_ref`, relevant or not
    head: String,
    export: Option<Arc<Export>>,
}

impl SourceRef {
    fn matches(&self, remote: &str, git_ref: &str) -> bool {
        self.mirror == remote && self.remote == remote && self.git_ref == git_ref
    }
}

/// Keeps exported charts of git-sourced releases in step with their mirrors
pub struct ChartSourceTracker {
    mirrors: Arc<Mirrors>,
    config: TrackerConfig,
    sources: RwLock<HashMap<String, Arc<Mutex<SourceRef>>>>,
    lister: Arc<dyn ReleaseLister>,
    queue: Arc<dyn ReleaseQueue>,
}

impl ChartSourceTracker {
    pub fn new(
        mirrors: Arc<Mirrors>,
        config: TrackerConfig,
        lister: Arc<dyn ReleaseLister>,
        queue: Arc<dyn ReleaseQueue>,
    ) -> Self {
        Self {
            mirrors,
            config,
            sources: RwLock::new(HashMap::new()),
            lister,
            queue,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Export of the release's chart source and the commit it is at
    ///
    /// Returns a not-ready error while the mirror is being created or has
    /// not synced successfully; the change signal of the mirror will queue
    /// the release again.
    pub async fn resolve(&self, hr: &HelmRelease) -> Result<ResolvedChart> {
        let git = git_source(hr)?;

        let Some(mirror) = self.mirrors.get(&git.git) else {
            self.maybe_mirror(&git.git);
            return Err(SourceError::NotReady {
                remote: git.git.clone(),
                status: MirrorStatus::NotReady.to_string(),
            });
        };

        let (resolved, _) = self.sync(hr, git, &mirror).await?;
        Ok(resolved)
    }

    /// Process mirror change signals until `shutdown` fires
    pub async fn run(&self, mut shutdown: Shutdown) {
        info!("starting sync of git chart sources");
        let changes = self.mirrors.changes();

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                changed = changes.recv() => {
                    for id in changed {
                        self.process_mirror_change(&id).await;
                    }
                }
            }
        }

        self.mirrors.stop_all().await;
        info!("stopped sync of git chart sources");
    }

    /// Forget the release's source; stops the mirror once nothing uses it
    ///
    /// Returns whether a source was tracked for the release.
    pub async fn delete(&self, hr: &HelmRelease) -> bool {
        let id = hr.resource_id();
        let removed = self.write_sources().remove(&id);

        let mirror = match &removed {
            Some(entry) => Some(entry.lock().await.mirror.clone()).filter(|m| !m.is_empty()),
            None => None,
        }
        .or_else(|| mirror_name(hr).map(String::from));

        if let Some(mirror) = mirror {
            let in_use = self
                .lister
                .list()
                .iter()
                .any(|other| other.resource_id() != id && mirror_name(other) == Some(mirror.as_str()));
            if !in_use {
                self.mirrors.stop(&mirror).await;
            }
        }

        removed.is_some()
    }

    /// Sync every mirror with its upstream now
    pub async fn sync_mirrors(&self) {
        info!("starting sync of git mirrors");
        for err in self.mirrors.refresh_all(self.config.timeout).await {
            warn!(error = %err, "failed syncing git mirror");
        }
        info!("finished syncing git mirrors");
    }

    async fn process_mirror_change(&self, id: &str) {
        let releases = self.releases_for_mirror(id);

        let Some(mirror) = self.mirrors.get(id) else {
            // The signal raced the mirror's removal
            if !releases.is_empty() {
                warn!(mirror = %id, "no existing git mirror found, requesting a new one");
                self.maybe_mirror(id);
            }
            return;
        };

        for hr in releases {
            let Ok(git) = git_source(&hr) else {
                continue;
            };
            match self.sync(&hr, git, &mirror).await {
                Ok((_, true)) => {
                    debug!(release = %hr.key(), mirror = %id, "chart source changed, queueing release");
                    self.queue.enqueue(&hr.key());
                }
                Ok((_, false)) => {}
                Err(e) => {
                    debug!(release = %hr.key(), mirror = %id, error = %e, "failed to sync chart source");
                }
            }
        }
    }

    /// Bring the release's source up to date with the mirror
    ///
    /// The flag is true when a new export was produced: first resolution,
    /// a changed source or new commits below the chart path.
    async fn sync(
        &self,
        hr: &HelmRelease,
        git: &GitChartSource,
        mirror: &Mirror,
    ) -> Result<(ResolvedChart, bool)> {
        let status = mirror.status();
        let repo = match mirror.repo() {
            Some(repo) if status.is_ready() => repo,
            _ => {
                return Err(SourceError::NotReady {
                    remote: git.git.clone(),
                    status: status.to_string(),
                });
            }
        };

        let entry = self.entry(&hr.resource_id());
        let mut source = entry.lock().await;

        // Read under the entry lock so a concurrent sync of the same release
        // cannot record an older head after a newer export.
        let git_ref = git.ref_or(&self.config.default_ref);
        let head = repo
            .revision(git_ref)
            .await
            .map_err(|e| unavailable(&git.git, e))?;

        self.advance(hr, git, &repo, &mut source, head).await
    }

    /// Move `source` to `head`, exporting when the chart path changed
    async fn advance(
        &self,
        hr: &HelmRelease,
        git: &GitChartSource,
        repo: &GitRepo,
        source: &mut SourceRef,
        head: String,
    ) -> Result<(ResolvedChart, bool)> {
        let git_ref = git.ref_or(&self.config.default_ref);

        if source.matches(&git.git, git_ref) {
            if let Some(export) = source.export.clone() {
                if source.head == head {
                    return Ok((resolved(export), false));
                }

                if repo.is_ancestor(&head, &source.head).await.unwrap_or(false) {
                    debug!(release = %hr.key(), head = %head, current = %source.head, "ignoring stale head");
                    return Ok((resolved(export), false));
                }

                let relevant = match repo.commits_between(&source.head, &head, &git.path).await {
                    Ok(commits) => !commits.is_empty(),
                    Err(e) => {
                        debug!(release = %hr.key(), error = %e, "cannot compare commits, exporting again");
                        true
                    }
                };
                if !relevant {
                    source.head = head;
                    return Ok((resolved(export), false));
                }
            }
        }

        let export = Arc::new(
            repo.export(&head)
                .await
                .map_err(|e| unavailable(&git.git, e))?,
        );

        source.mirror = git.git.clone();
        source.remote = git.git.clone();
        source.git_ref = git_ref.to_string();
        source.head = head;
        // The superseded export is removed once its last reader drops it
        source.export = Some(export.clone());

        Ok((resolved(export), true))
    }

    fn entry(&self, id: &str) -> Arc<Mutex<SourceRef>> {
        if let Some(entry) = self.read_sources().get(id) {
            return entry.clone();
        }
        self.write_sources()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SourceRef::default())))
            .clone()
    }

    fn maybe_mirror(&self, remote: &str) -> bool {
        self.mirrors
            .ensure(remote, self.config.poll_interval, self.config.timeout)
    }

    fn releases_for_mirror(&self, mirror: &str) -> Vec<Arc<HelmRelease>> {
        self.lister
            .list()
            .into_iter()
            .filter(|hr| mirror_name(hr) == Some(mirror))
            .collect()
    }

    fn read_sources(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Mutex<SourceRef>>>> {
        match self.sources.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_sources(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Mutex<SourceRef>>>> {
        match self.sources.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn resolved(export: Arc<Export>) -> ResolvedChart {
    let revision = export.commit().to_string();
    ResolvedChart { export, revision }
}

fn git_source(hr: &HelmRelease) -> Result<&GitChartSource> {
    match hr.spec.chart.source() {
        Ok(ChartSourceRef::Git(git)) => Ok(git),
        Ok(ChartSourceRef::Repository(_)) => Err(SourceError::InvalidSource {
            message: format!("{} does not use a git chart source", hr.key()),
        }),
        Err(e) => Err(SourceError::InvalidSource {
            message: e.to_string(),
        }),
    }
}

/// Mirrors are keyed by remote URL
fn mirror_name(hr: &HelmRelease) -> Option<&str> {
    hr.spec.chart.git.as_ref().map(|git| git.git.as_str())
}

fn unavailable(remote: &str, err: SourceError) -> SourceError {
    SourceError::Unavailable {
        remote: remote.to_string(),
        message: err.to_string(),
    }
}
