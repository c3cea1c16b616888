//! Operator wiring: resource watch, workers and periodic loops
//!
//! Watch events and chart source changes feed the [`WorkQueue`]; workers
//! pull keys off it and hand the resource to the [`Reconciler`]. Two
//! periodic loops run alongside: a full resync (refresh mirrors, requeue
//! everything) and the release status poller.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chartwarden_core::{HelmRelease, split_key};
use chartwarden_source::{ChartSourceTracker, ReleaseLister, Shutdown};
use futures::StreamExt;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, ResourceExt};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::helm::GetOptions;
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;

#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Concurrent reconciliation workers
    pub workers: usize,
    /// Period of the full resync
    pub resync_interval: Duration,
    /// Period of the release status poller
    pub status_interval: Duration,
    /// Watch a single namespace; all namespaces when `None`
    pub namespace: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            resync_interval: Duration::from_secs(3 * 60),
            status_interval: Duration::from_secs(30),
            namespace: None,
        }
    }
}

#[derive(Default)]
struct CacheState {
    releases: HashMap<String, Arc<HelmRelease>>,
    /// Last seen copy of deleted resources, until their release is removed
    tombstones: HashMap<String, Arc<HelmRelease>>,
}

/// Last seen copy of every watched resource
#[derive(Default)]
pub struct ReleaseCache {
    state: RwLock<CacheState>,
}

impl ReleaseCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CacheState> {
        match self.state.read() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CacheState> {
        match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Store `hr`; returns true when it is new or its generation moved
    pub fn apply(&self, hr: HelmRelease) -> bool {
        let key = hr.key();
        let generation = hr.generation();
        let mut state = self.write();
        state.tombstones.remove(&key);
        let previous = state.releases.insert(key, Arc::new(hr));
        previous.is_none_or(|p| p.generation() != generation)
    }

    /// Move a resource to the tombstones; returns false if it was unknown
    pub fn delete(&self, hr: HelmRelease) -> bool {
        let key = hr.key();
        let mut state = self.write();
        let known = state.releases.remove(&key).is_some();
        state.tombstones.insert(key, Arc::new(hr));
        known
    }

    pub fn get(&self, key: &str) -> Option<Arc<HelmRelease>> {
        self.read().releases.get(key).cloned()
    }

    pub fn tombstone(&self, key: &str) -> Option<Arc<HelmRelease>> {
        self.read().tombstones.get(key).cloned()
    }

    pub fn forget_tombstone(&self, key: &str) {
        self.write().tombstones.remove(key);
    }

    /// Keys of live resources, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.read().releases.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl ReleaseLister for ReleaseCache {
    fn list(&self) -> Vec<Arc<HelmRelease>> {
        self.read().releases.values().cloned().collect()
    }
}

/// Runs the control loop
pub struct Operator {
    reconciler: Arc<Reconciler>,
    tracker: Arc<ChartSourceTracker>,
    queue: Arc<WorkQueue>,
    cache: Arc<ReleaseCache>,
    config: OperatorConfig,
}

impl Operator {
    /// `tracker` must have been built on `cache` and `queue`
    pub fn new(
        reconciler: Arc<Reconciler>,
        tracker: Arc<ChartSourceTracker>,
        queue: Arc<WorkQueue>,
        cache: Arc<ReleaseCache>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            reconciler,
            tracker,
            queue,
            cache,
            config,
        }
    }

    /// Run until `shutdown` fires
    ///
    /// On shutdown the queue stops handing out keys; workers finish the
    /// release they hold, bounded by the package-manager timeouts.
    pub async fn run(self: Arc<Self>, client: Client, shutdown: Shutdown) {
        info!(
            workers = self.config.workers,
            namespace = self.config.namespace.as_deref().unwrap_or("*"),
            "starting operator"
        );
        let mut tasks = JoinSet::new();

        let tracker = self.tracker.clone();
        let stop = shutdown.clone();
        tasks.spawn(async move { tracker.run(stop).await });

        let this = self.clone();
        let stop = shutdown.clone();
        tasks.spawn(async move { this.watch(client, stop).await });

        for id in 0..self.config.workers.max(1) {
            let this = self.clone();
            tasks.spawn(async move { this.worker(id).await });
        }

        let this = self.clone();
        let stop = shutdown.clone();
        tasks.spawn(async move { this.resync_loop(stop).await });

        let this = self.clone();
        let stop = shutdown.clone();
        tasks.spawn(async move { this.status_loop(stop).await });

        let mut stop = shutdown;
        stop.wait().await;
        info!("shutting down operator");
        self.queue.shut_down();

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "operator task failed");
            }
        }
        info!("operator stopped");
    }

    // ========== Watch ==========

    async fn watch(&self, client: Client, mut shutdown: Shutdown) {
        let api: Api<HelmRelease> = match &self.config.namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        let mut stream = Box::pin(watcher(api, watcher::Config::default()).default_backoff());
        let mut relist = None;

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                event = stream.next() => match event {
                    Some(Ok(event)) => self.handle_event(event, &mut relist),
                    Some(Err(e)) => warn!(error = %e, "HelmRelease watch failed"),
                    None => break,
                },
            }
        }
        debug!("stopped watching HelmReleases");
    }

    /// Update the cache from a watch event and queue what needs work
    ///
    /// `relist` collects the keys seen during an initial listing so that
    /// resources deleted while the watch was down are treated as deleted.
    fn handle_event(&self, event: watcher::Event<HelmRelease>, relist: &mut Option<HashSet<String>>) {
        match event {
            watcher::Event::Init => {
                *relist = Some(HashSet::new());
            }
            watcher::Event::InitApply(hr) => {
                if let Some(seen) = relist.as_mut() {
                    seen.insert(hr.key());
                }
                self.apply(hr);
            }
            watcher::Event::InitDone => {
                let Some(seen) = relist.take() else {
                    return;
                };
                for key in self.cache.keys() {
                    if seen.contains(&key) {
                        continue;
                    }
                    if let Some(hr) = self.cache.get(&key) {
                        info!(release = %key, "HelmRelease disappeared while not watching");
                        self.cache.delete((*hr).clone());
                        self.queue.add(&key);
                    }
                }
            }
            watcher::Event::Apply(hr) => self.apply(hr),
            watcher::Event::Delete(hr) => {
                let key = hr.key();
                info!(release = %key, "HelmRelease deleted");
                self.cache.delete(hr);
                self.queue.add(&key);
            }
        }
    }

    fn apply(&self, hr: HelmRelease) {
        let key = hr.key();
        if self.cache.apply(hr) {
            debug!(release = %key, "HelmRelease changed");
            self.queue.add(&key);
        }
    }

    // ========== Workers ==========

    async fn worker(&self, id: usize) {
        debug!(worker = id, "worker started");
        while let Some(key) = self.queue.get().await {
            match self.process(&key).await {
                Ok(()) => self.queue.forget(&key),
                Err(e) if e.is_not_ready() => {
                    // The mirror's change signal queues the release again
                    debug!(release = %key, error = %e, "chart source not ready");
                    self.queue.forget(&key);
                }
                Err(e) => {
                    warn!(
                        release = %key,
                        error = %e,
                        requeues = self.queue.num_requeues(&key),
                        "failed to reconcile release"
                    );
                    self.queue.add_rate_limited(&key);
                }
            }
            self.queue.done(&key);
        }
        debug!(worker = id, "worker stopped");
    }

    /// Reconcile or remove the release behind `key`
    pub async fn process(&self, key: &str) -> Result<()> {
        if let Some(cached) = self.cache.get(key) {
            let hr = match self
                .reconciler
                .status()
                .fetch(&cached.resource_namespace(), &cached.name_any())
                .await
            {
                Ok(hr) => hr,
                Err(e) if e.is_not_found() => {
                    debug!(release = %key, "HelmRelease gone, waiting for its delete event");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let action = self.reconciler.sync(&hr).await?;
            info!(release = %key, action = %action, "release reconciled");
            return Ok(());
        }

        if let Some(hr) = self.cache.tombstone(key) {
            match self.reconciler.delete(&hr).await {
                Ok(()) => {}
                Err(e) if e.is_policy() => {
                    warn!(release = %key, error = %e, "leaving release of deleted HelmRelease in place");
                }
                Err(e) => return Err(e),
            }
            self.cache.forget_tombstone(key);
            return Ok(());
        }

        if split_key(key).is_none() {
            warn!(release = %key, "ignoring malformed queue key");
        }
        Ok(())
    }

    // ========== Periodic loops ==========

    async fn resync_loop(&self, mut shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(self.config.resync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => self.resync().await,
            }
        }
    }

    /// Refresh every mirror and queue every known release
    pub async fn resync(&self) {
        self.tracker.sync_mirrors().await;
        let keys = self.cache.keys();
        info!(releases = keys.len(), "requeueing all releases");
        for key in keys {
            self.queue.add(&key);
        }
    }

    async fn status_loop(&self, mut shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(self.config.status_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => self.poll_release_status().await,
            }
        }
    }

    /// Mirror each release's state, as the package manager reports it, into status
    pub async fn poll_release_status(&self) {
        for hr in self.cache.list() {
            let client = match self.reconciler.client_for(&hr) {
                Ok(client) => client,
                Err(e) => {
                    debug!(release = %hr.key(), error = %e, "skipping release status");
                    continue;
                }
            };
            let opts = GetOptions {
                namespace: hr.target_namespace(),
                version: None,
            };
            let release = match client.get(&hr.release_name(), &opts).await {
                Ok(Some(release)) => release,
                Ok(None) => continue,
                Err(e) => {
                    warn!(release = %hr.key(), error = %e, "failed to query release status");
                    continue;
                }
            };

            if let Err(e) = self
                .reconciler
                .status()
                .set_release_status(&hr, &release.name, &release.status.to_string())
                .await
            {
                warn!(release = %hr.key(), error = %e, "failed to update release status");
            }
        }
    }
}
