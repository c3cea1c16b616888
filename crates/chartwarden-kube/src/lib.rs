//! Chartwarden Kube - the cluster side of chartwarden
//!
//! This crate provides:
//! - **Package-manager clients**: a version-keyed registry over the `helm` binary, plus an in-memory mock
//! - **Status Tracker**: conflict-safe writes of conditions, phase and revisions on `HelmRelease` resources
//! - **Release Reconciler**: decides and executes install, upgrade, rollback or nothing per resource
//! - **Values composition**: ConfigMaps, Secrets, URLs and chart files merged under inline values
//! - **Annotator**: marks rendered objects with the owning resource and reads ownership back
//! - **Operator**: resource watch, deduplicating work queue and periodic resync

pub mod annotator;
pub mod diff;
pub mod error;
pub mod helm;
pub mod metrics;
pub mod operator;
pub mod queue;
pub mod reconciler;
pub mod status;
pub mod values;

pub use annotator::{
    ANTECEDENT_ANNOTATION, Annotator, KubeAnnotator, ManifestObject, MockAnnotator, Ownership,
    manifest_objects,
};
pub use diff::ReleaseDiff;
pub use error::{KubeError, Result};
pub use helm::{
    Clients, GetOptions, HelmCli, HelmClient, HistoryOptions, MockHelmClient, OperationCounts,
    RollbackOptions, UninstallOptions, UpgradeFailure, UpgradeOptions,
};
pub use metrics::{MemoryObserver, Observer, ReleaseAction, ReleaseObservation, TracingObserver};
pub use operator::{Operator, OperatorConfig, ReleaseCache};
pub use queue::{RateLimit, WorkQueue};
pub use reconciler::{ChartSources, Reconciler, ReconcilerConfig};
pub use status::{
    KubeStatusClient, MockStatusClient, RetryPolicy, StatusClient, StatusTracker, has_rolled_back,
    has_synced,
};
pub use values::{MockValuesReader, ValuesComposer, ValuesSourceReader};
