//! Chartwarden Core - shared types for the chartwarden operator
//!
//! This crate provides the foundational types used throughout chartwarden:
//! - `HelmRelease`: The custom resource declaring a desired release
//! - `Condition` / `Phase`: Status bookkeeping on the resource
//! - `Values`: Configuration values with deep merge support
//! - `Release`: Snapshot of a release as reported by the package manager

pub mod condition;
pub mod error;
pub mod release;
pub mod resource;
pub mod values;

pub use condition::{Condition, ConditionStatus, ConditionType, Phase, PhaseUpdate, reason};
pub use error::{CoreError, Result};
pub use release::{ChartInfo, Release, ReleaseStatus};
pub use resource::{
    ChartFileRef, ChartSource, ChartSourceRef, ExternalSourceRef, GitChartSource, HelmRelease,
    HelmReleaseSpec, HelmReleaseStatus, KeyRef, RepoChartSource, Rollback, ValuesFromSource,
    ValuesSourceRef, split_key,
};
pub use values::Values;
