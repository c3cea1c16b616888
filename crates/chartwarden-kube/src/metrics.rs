//! Release observations for external telemetry
//!
//! The reconciler times every sync and uninstall and hands the result to an
//! [`Observer`]. Observers are side effects only: they never influence the
//! outcome of a reconciliation.

use std::fmt;
use std::sync::RwLock;
use std::time::Duration;

use tracing::info;

/// Histogram bucket bounds, in seconds, for exporters
pub const DURATION_BUCKETS: [f64; 8] = [1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 180.0, 300.0];

/// What the reconciler did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReleaseAction {
    Install,
    Upgrade,
    DryRunCompare,
    Rollback,
    Uninstall,
    Skip,
}

impl fmt::Display for ReleaseAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Install => "install",
            Self::Upgrade => "upgrade",
            Self::DryRunCompare => "dry-run-compare",
            Self::Rollback => "rollback",
            Self::Uninstall => "uninstall",
            Self::Skip => "skip",
        };
        write!(f, "{}", s)
    }
}

/// One timed package-manager action
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseObservation {
    pub action: ReleaseAction,
    pub dry_run: bool,
    pub success: bool,
    pub namespace: String,
    pub release_name: String,
    pub duration: Duration,
}

impl ReleaseObservation {
    /// Upper bound of the histogram bucket this observation falls in
    pub fn bucket(&self) -> Option<f64> {
        bucket_for(self.duration)
    }
}

/// Smallest bucket bound at or above `duration`; `None` past the last bucket
pub fn bucket_for(duration: Duration) -> Option<f64> {
    let seconds = duration.as_secs_f64();
    DURATION_BUCKETS.iter().copied().find(|bound| seconds <= *bound)
}

/// Receives release observations
pub trait Observer: Send + Sync {
    fn observe(&self, observation: ReleaseObservation);
}

/// Emits each observation as a `tracing` event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn observe(&self, o: ReleaseObservation) {
        info!(
            target: "chartwarden::metrics",
            action = %o.action,
            dry_run = o.dry_run,
            success = o.success,
            namespace = %o.namespace,
            release = %o.release_name,
            duration_seconds = o.duration.as_secs_f64(),
            bucket = ?o.bucket(),
            "release action observed"
        );
    }
}

/// Keeps observations in memory
#[derive(Debug, Default)]
pub struct MemoryObserver {
    observations: RwLock<Vec<ReleaseObservation>>,
}

impl MemoryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observations(&self) -> Vec<ReleaseObservation> {
        match self.observations.read() {
            Ok(o) => o.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Observer for MemoryObserver {
    fn observe(&self, observation: ReleaseObservation) {
        match self.observations.write() {
            Ok(mut o) => o.push(observation),
            Err(poisoned) => poisoned.into_inner().push(observation),
        }
    }
}
