//! Long-lived mirrors of remote git repositories
//!
//! Each mirror runs its own task that syncs on a poll interval or when a
//! refresh is requested. Both triggers go through [`Mirror::sync`], which
//! serialises on the mirror's fetch lock, so the clone is never raced.
//!
//! Changed mirrors are reported on a coalescing feed: publishers add the
//! mirror id to a pending set and never block; the single consumer drains
//! the whole set at once. A change can be merged with another but never lost.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::future::join_all;
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::repo::GitRepo;
use crate::error::{Result, SourceError};
use crate::shutdown::Shutdown;

/// Point-in-time state of a mirror
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorStatus {
    /// Not cloned yet
    NotReady,
    Ready,
    /// The last sync failed; retried on the next tick
    Error(String),
}

impl MirrorStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, MirrorStatus::Ready)
    }
}

impl fmt::Display for MirrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorStatus::NotReady => write!(f, "not-ready"),
            MirrorStatus::Ready => write!(f, "ready"),
            MirrorStatus::Error(message) => write!(f, "error: {}", message),
        }
    }
}

/// One mirrored remote
#[derive(Debug)]
pub struct Mirror {
    remote: String,
    dir: PathBuf,
    timeout: Duration,
    state: RwLock<MirrorState>,
    fetch_lock: tokio::sync::Mutex<()>,
    refresh: Notify,
}

#[derive(Debug)]
struct MirrorState {
    status: MirrorStatus,
    repo: Option<GitRepo>,
    fingerprint: Option<String>,
}

impl Mirror {
    fn new(remote: &str, dir: PathBuf, timeout: Duration) -> Self {
        Self {
            remote: remote.to_string(),
            dir,
            timeout,
            state: RwLock::new(MirrorState {
                status: MirrorStatus::NotReady,
                repo: None,
                fingerprint: None,
            }),
            fetch_lock: tokio::sync::Mutex::new(()),
            refresh: Notify::new(),
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn status(&self) -> MirrorStatus {
        match self.state.read() {
            Ok(state) => state.status.clone(),
            Err(poisoned) => poisoned.into_inner().status.clone(),
        }
    }

    /// The local clone, once one exists
    pub fn repo(&self) -> Option<GitRepo> {
        match self.state.read() {
            Ok(state) => state.repo.clone(),
            Err(poisoned) => poisoned.into_inner().repo.clone(),
        }
    }

    /// Ask the mirror's task to sync as soon as possible
    pub fn request_refresh(&self) {
        self.refresh.notify_one();
    }

    /// Clone or fetch, returning whether any ref moved
    ///
    /// The first successful clone always counts as a change.
    pub async fn sync(&self) -> Result<bool> {
        let _guard = self.fetch_lock.lock().await;
        let result = self.sync_locked().await;
        match &result {
            Ok(_) => self.set_status(MirrorStatus::Ready),
            Err(e) => self.set_status(MirrorStatus::Error(e.to_string())),
        }
        result
    }

    async fn sync_locked(&self) -> Result<bool> {
        let repo = match self.repo() {
            Some(repo) => {
                repo.fetch().await?;
                repo
            }
            None => {
                // A clone interrupted earlier leaves a partial directory behind
                if tokio::fs::try_exists(&self.dir).await? {
                    tokio::fs::remove_dir_all(&self.dir).await?;
                }
                let repo = GitRepo::clone_mirror(&self.remote, &self.dir, self.timeout).await?;
                self.with_state(|state| state.repo = Some(repo.clone()));
                repo
            }
        };

        let fingerprint = repo.refs_fingerprint().await?;
        Ok(self.with_state(|state| {
            let changed = state.fingerprint.as_deref() != Some(fingerprint.as_str());
            state.fingerprint = Some(fingerprint);
            changed
        }))
    }

    fn set_status(&self, status: MirrorStatus) {
        self.with_state(|state| state.status = status);
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MirrorState) -> T) -> T {
        match self.state.write() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[derive(Debug, Default)]
struct ChangeFeed {
    pending: Mutex<HashSet<String>>,
    notify: Notify,
}

impl ChangeFeed {
    fn publish(&self, id: &str) {
        match self.pending.lock() {
            Ok(mut pending) => {
                pending.insert(id.to_string());
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(id.to_string());
            }
        }
        self.notify.notify_one();
    }

    fn take(&self) -> HashSet<String> {
        match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

/// Consumer side of the mirror change feed
///
/// Meant for a single consumer: concurrent receivers split the changes
/// between them.
#[derive(Debug, Clone)]
pub struct ChangeReceiver {
    feed: Arc<ChangeFeed>,
}

impl ChangeReceiver {
    /// Wait for the next non-empty set of changed mirror ids
    pub async fn recv(&self) -> HashSet<String> {
        loop {
            let changed = self.feed.take();
            if !changed.is_empty() {
                return changed;
            }
            self.feed.notify.notified().await;
        }
    }

    /// Drain whatever is pending without waiting
    pub fn try_recv(&self) -> Option<HashSet<String>> {
        let changed = self.feed.take();
        (!changed.is_empty()).then_some(changed)
    }
}

struct MirrorEntry {
    mirror: Arc<Mirror>,
    task: JoinHandle<()>,
}

/// Registry of mirrors keyed by remote URL
pub struct Mirrors {
    base_dir: PathBuf,
    mirrors: Mutex<HashMap<String, MirrorEntry>>,
    changes: Arc<ChangeFeed>,
    shutdown: Shutdown,
}

impl Mirrors {
    /// Mirrors are cloned below `base_dir`; tasks end when `shutdown` fires
    pub fn new(base_dir: impl Into<PathBuf>, shutdown: Shutdown) -> Self {
        Self {
            base_dir: base_dir.into(),
            mirrors: Mutex::new(HashMap::new()),
            changes: Arc::new(ChangeFeed::default()),
            shutdown,
        }
    }

    /// Start mirroring `remote` unless it already is; returns whether it existed
    ///
    /// Must be called from within a Tokio runtime.
    pub fn ensure(&self, remote: &str, poll_interval: Duration, timeout: Duration) -> bool {
        let mut mirrors = self.lock();
        if mirrors.contains_key(remote) {
            return true;
        }

        let mirror = Arc::new(Mirror::new(remote, self.mirror_dir(remote), timeout));
        let task = tokio::spawn(poll_loop(
            mirror.clone(),
            poll_interval,
            self.changes.clone(),
            self.shutdown.clone(),
        ));
        info!(remote = %remote, "started mirroring new remote");
        mirrors.insert(remote.to_string(), MirrorEntry { mirror, task });
        false
    }

    pub fn get(&self, id: &str) -> Option<Arc<Mirror>> {
        self.lock().get(id).map(|entry| entry.mirror.clone())
    }

    /// Ids of all running mirrors
    pub fn ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Stop a mirror and delete its clone
    pub async fn stop(&self, id: &str) {
        let Some(entry) = self.lock().remove(id) else {
            return;
        };
        entry.task.abort();
        if let Err(e) = tokio::fs::remove_dir_all(&entry.mirror.dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(mirror = %id, error = %e, "failed to remove mirror directory");
            }
        }
        info!(mirror = %id, "stopped mirroring remote");
    }

    pub async fn stop_all(&self) {
        for id in self.ids() {
            self.stop(&id).await;
        }
    }

    /// Sync every mirror now, each bounded by `timeout`
    ///
    /// Changed mirrors are published on the change feed; failures are
    /// returned, never fatal.
    pub async fn refresh_all(&self, timeout: Duration) -> Vec<SourceError> {
        let mirrors: Vec<Arc<Mirror>> = self
            .lock()
            .values()
            .map(|entry| entry.mirror.clone())
            .collect();

        let results = join_all(mirrors.iter().map(|mirror| async move {
            match tokio::time::timeout(timeout, mirror.sync()).await {
                Ok(result) => result,
                Err(_) => {
                    let err = SourceError::Timeout {
                        command: "refresh".to_string(),
                        seconds: timeout.as_secs(),
                    };
                    mirror.set_status(MirrorStatus::Error(err.to_string()));
                    Err(err)
                }
            }
        }))
        .await;

        let mut errors = Vec::new();
        for (mirror, result) in mirrors.iter().zip(results) {
            match result {
                Ok(true) => self.changes.publish(mirror.remote()),
                Ok(false) => {}
                Err(e) => errors.push(e),
            }
        }
        errors
    }

    /// Feed of changed mirror ids
    pub fn changes(&self) -> ChangeReceiver {
        ChangeReceiver {
            feed: self.changes.clone(),
        }
    }

    fn mirror_dir(&self, remote: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(remote.as_bytes());
        let digest = hex::encode(hasher.finalize());
        self.base_dir.join(&digest[..16])
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MirrorEntry>> {
        match self.mirrors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for Mirrors {
    fn drop(&mut self) {
        for entry in self.lock().values() {
            entry.task.abort();
        }
    }
}

async fn poll_loop(
    mirror: Arc<Mirror>,
    poll_interval: Duration,
    changes: Arc<ChangeFeed>,
    mut shutdown: Shutdown,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                debug!(mirror = %mirror.remote(), "mirror loop stopped");
                return;
            }
            _ = ticker.tick() => {}
            _ = mirror.refresh.notified() => {}
        }

        match mirror.sync().await {
            Ok(true) => {
                debug!(mirror = %mirror.remote(), "mirror refs changed");
                changes.publish(mirror.remote());
            }
            Ok(false) => {}
            Err(e) => {
                warn!(mirror = %mirror.remote(), error = %e, "failed to sync git mirror");
            }
        }
    }
}
