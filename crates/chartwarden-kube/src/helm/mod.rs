//! Package-manager clients
//!
//! The reconciler drives releases through the [`HelmClient`] capability.
//! Implementations are registered in [`Clients`] under a version tag and
//! selected per release through `spec.helmVersion`.

mod cli;
mod mock;

pub use cli::HelmCli;
pub use mock::{MockHelmClient, OperationCounts, UpgradeFailure};

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chartwarden_core::{Release, Values};

use crate::error::Result;

/// Options for looking up a release
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub namespace: String,
    /// Specific revision; the latest when unset
    pub version: Option<u32>,
}

/// Options for `upgrade --install`
#[derive(Debug, Clone, Default)]
pub struct UpgradeOptions {
    pub namespace: String,
    pub timeout: Duration,
    /// Install when the release does not exist yet
    pub install: bool,
    pub dry_run: bool,
    pub force: bool,
    pub reset_values: bool,
    pub reuse_values: bool,
    pub wait: bool,
    pub skip_crds: bool,
    /// Revisions kept in the history; 0 keeps all
    pub max_history: u32,
}

#[derive(Debug, Clone, Default)]
pub struct RollbackOptions {
    pub namespace: String,
    /// Target revision; the previous one when unset
    pub version: Option<u32>,
    pub timeout: Duration,
    pub wait: bool,
    pub disable_hooks: bool,
    pub recreate: bool,
    pub force: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UninstallOptions {
    pub namespace: String,
    pub timeout: Duration,
    pub keep_history: bool,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryOptions {
    pub namespace: String,
    /// Maximum number of entries; 0 returns the whole history
    pub max: u32,
}

/// Capability to manage releases through a package manager
///
/// Implementations must be Send + Sync for use across async tasks.
#[async_trait]
pub trait HelmClient: Send + Sync {
    /// Version tag this client serves (e.g. `v3`)
    fn version(&self) -> &str;

    /// Latest (or requested) revision of a release; `None` when it does not exist
    async fn get(&self, name: &str, opts: &GetOptions) -> Result<Option<Release>>;

    /// Upgrade a release from a chart directory, installing it when allowed
    async fn upgrade_from_path(
        &self,
        chart_path: &Path,
        name: &str,
        values: &Values,
        opts: &UpgradeOptions,
    ) -> Result<Release>;

    /// Roll a release back and return the new revision
    async fn rollback(&self, name: &str, opts: &RollbackOptions) -> Result<Release>;

    async fn uninstall(&self, name: &str, opts: &UninstallOptions) -> Result<()>;

    /// Release history, newest revision first
    async fn history(&self, name: &str, opts: &HistoryOptions) -> Result<Vec<Release>>;

    /// Fetch the chart's declared dependencies into its `charts/` directory
    async fn dependency_update(&self, chart_path: &Path) -> Result<()>;
}

/// Registry of clients keyed by version tag
#[derive(Default)]
pub struct Clients {
    clients: RwLock<HashMap<String, Arc<dyn HelmClient>>>,
}

impl std::fmt::Debug for Clients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clients")
            .field("versions", &self.versions())
            .finish()
    }
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `client` under its version tag, replacing any previous one
    pub fn add(&self, client: Arc<dyn HelmClient>) {
        let version = client.version().to_string();
        match self.clients.write() {
            Ok(mut clients) => {
                clients.insert(version, client);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(version, client);
            }
        }
    }

    pub fn load(&self, version: &str) -> Option<Arc<dyn HelmClient>> {
        match self.clients.read() {
            Ok(clients) => clients.get(version).cloned(),
            Err(poisoned) => poisoned.into_inner().get(version).cloned(),
        }
    }

    /// Registered version tags, sorted
    pub fn versions(&self) -> Vec<String> {
        let mut versions: Vec<String> = match self.clients.read() {
            Ok(clients) => clients.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        };
        versions.sort();
        versions
    }
}
