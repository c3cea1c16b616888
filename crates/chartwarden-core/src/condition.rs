//! Conditions and phases recorded on a `HelmRelease`
//!
//! Every phase maps to exactly one condition. Condition writes follow the
//! usual Kubernetes rules: `lastUpdateTime` moves on every write while
//! `lastTransitionTime` only moves when the status flips.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::resource::HelmReleaseStatus;

/// Well-known condition reasons
pub mod reason {
    pub const GIT_REPO_NOT_READY: &str = "GitRepoNotReady";
    pub const GIT_REPO_CLONED: &str = "GitRepoCloned";
    pub const REPO_FETCH_FAILED: &str = "RepoFetchFailed";
    pub const REPO_CHART_IN_CACHE: &str = "RepoChartInCache";
    pub const CHART_SOURCE_INVALID: &str = "ChartSourceInvalid";
    pub const UPDATE_DEPENDENCY_FAILED: &str = "UpdateDependencyFailed";
    pub const VALUES_COMPOSE_FAILED: &str = "ValuesComposeFailed";
    pub const INSTALL_RUNNING: &str = "HelmInstallRunning";
    pub const UPGRADE_RUNNING: &str = "HelmUpgradeRunning";
    pub const INSTALL_FAILED: &str = "HelmInstallFailed";
    pub const UPGRADE_FAILED: &str = "HelmUpgradeFailed";
    pub const ROLLBACK_RUNNING: &str = "HelmRollbackRunning";
    pub const ROLLBACK_SUCCEEDED: &str = "HelmRollbackSucceeded";
    pub const ROLLBACK_FAILED: &str = "HelmRollbackFailed";
    pub const SUCCESS: &str = "HelmSuccess";
    pub const RELEASE_NOT_OWNED: &str = "ReleaseNotOwned";
    pub const RELEASE_STATE_BLOCKED: &str = "ReleaseStateBlocked";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ConditionType {
    ChartFetched,
    Released,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A typed, timestamped fact about a release resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,

    pub status: ConditionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn new(
        type_: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_,
            status,
            reason: Some(reason.into()),
            message: Some(message.into()),
            last_update_time: None,
            last_transition_time: None,
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Lifecycle phase of a release resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Phase {
    ChartFetched,
    ChartFetchFailed,
    Installing,
    Upgrading,
    Succeeded,
    Failed,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ChartFetched => "ChartFetched",
            Self::ChartFetchFailed => "ChartFetchFailed",
            Self::Installing => "Installing",
            Self::Upgrading => "Upgrading",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::RollingBack => "RollingBack",
            Self::RolledBack => "RolledBack",
            Self::RollbackFailed => "RollbackFailed",
        };
        write!(f, "{}", s)
    }
}

impl Phase {
    /// The condition a phase implies, with its default reason and message
    pub fn condition(self, release_name: &str, namespace: &str) -> Condition {
        use ConditionStatus::*;
        use ConditionType::*;

        let (type_, status, reason, message) = match self {
            Self::ChartFetched => (
                ChartFetched,
                True,
                reason::GIT_REPO_CLONED,
                format!("Chart fetched for Helm release '{}' in '{}'.", release_name, namespace),
            ),
            Self::ChartFetchFailed => (
                ChartFetched,
                False,
                reason::GIT_REPO_NOT_READY,
                format!("Chart fetch failed for Helm release '{}' in '{}'.", release_name, namespace),
            ),
            Self::Installing => (
                Released,
                Unknown,
                reason::INSTALL_RUNNING,
                format!("Running installation for Helm release '{}' in '{}'.", release_name, namespace),
            ),
            Self::Upgrading => (
                Released,
                Unknown,
                reason::UPGRADE_RUNNING,
                format!("Running upgrade for Helm release '{}' in '{}'.", release_name, namespace),
            ),
            Self::Succeeded => (
                Released,
                True,
                reason::SUCCESS,
                format!("Release was successful for Helm release '{}' in '{}'.", release_name, namespace),
            ),
            Self::Failed => (
                Released,
                False,
                reason::UPGRADE_FAILED,
                format!("Release failed for Helm release '{}' in '{}'.", release_name, namespace),
            ),
            Self::RollingBack => (
                RolledBack,
                Unknown,
                reason::ROLLBACK_RUNNING,
                format!("Rolling back Helm release '{}' in '{}'.", release_name, namespace),
            ),
            Self::RolledBack => (
                RolledBack,
                True,
                reason::ROLLBACK_SUCCEEDED,
                format!("Rolled back Helm release '{}' in '{}'.", release_name, namespace),
            ),
            Self::RollbackFailed => (
                RolledBack,
                False,
                reason::ROLLBACK_FAILED,
                format!("Rollback failed for Helm release '{}' in '{}'.", release_name, namespace),
            ),
        };

        Condition::new(type_, status, reason, message)
    }
}

/// A phase transition plus the optional details recorded with it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseUpdate {
    pub phase: Phase,
    pub revision: Option<String>,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl PhaseUpdate {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            revision: None,
            reason: None,
            message: None,
        }
    }

    /// Chart revision recorded with `Installing`, `Upgrading` and `Succeeded`
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    /// Replace the default reason and message of the phase's condition
    pub fn with_reason(mut self, reason: impl Into<String>, message: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self.message = Some(message.into());
        self
    }
}

impl HelmReleaseStatus {
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Record a condition, keeping at most one per type
    ///
    /// `Released=True` drops any `RolledBack` condition and resets the
    /// rollback counter; `RolledBack=True` increments it.
    pub fn set_condition(&mut self, mut condition: Condition, now: DateTime<Utc>) {
        condition.last_update_time = Some(now);

        match self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                condition.last_transition_time = if existing.status == condition.status {
                    existing.last_transition_time.or(Some(now))
                } else {
                    Some(now)
                };
                *existing = condition.clone();
            }
            None => {
                condition.last_transition_time = Some(now);
                self.conditions.push(condition.clone());
            }
        }

        match (condition.type_, condition.status) {
            (ConditionType::Released, ConditionStatus::True) => {
                self.conditions.retain(|c| c.type_ != ConditionType::RolledBack);
                self.rollback_count = 0;
            }
            (ConditionType::RolledBack, ConditionStatus::True) => {
                self.rollback_count += 1;
            }
            _ => {}
        }
    }

    /// Move to a new phase and record the condition it implies
    pub fn apply_phase(
        &mut self,
        update: &PhaseUpdate,
        release_name: &str,
        namespace: &str,
        now: DateTime<Utc>,
    ) {
        let mut condition = update.phase.condition(release_name, namespace);
        if let Some(reason) = &update.reason {
            condition.reason = Some(reason.clone());
        }
        if let Some(message) = &update.message {
            condition.message = Some(message.clone());
        }

        self.phase = Some(update.phase);
        if let Some(revision) = &update.revision {
            match update.phase {
                Phase::Installing | Phase::Upgrading => {
                    self.last_attempted_revision = Some(revision.clone());
                }
                Phase::Succeeded => {
                    self.revision = Some(revision.clone());
                }
                _ => {}
            }
        }
        self.set_condition(condition, now);
    }

    /// Advance the observed generation; never moves backwards
    ///
    /// Returns whether anything changed.
    pub fn set_observed_generation(&mut self, generation: i64) -> bool {
        match self.observed_generation {
            Some(observed) if observed >= generation => false,
            _ => {
                self.observed_generation = Some(generation);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn released(status: ConditionStatus) -> Condition {
        Condition::new(ConditionType::Released, status, reason::SUCCESS, "")
    }

    #[test]
    fn test_repeated_condition_keeps_transition_time() {
        let mut status = HelmReleaseStatus::default();
        status.set_condition(released(ConditionStatus::True), at(0));
        status.set_condition(released(ConditionStatus::True), at(10));
        status.set_condition(released(ConditionStatus::True), at(20));

        assert_eq!(status.conditions.len(), 1);
        let cond = status.condition(ConditionType::Released).unwrap();
        assert_eq!(cond.last_transition_time, Some(at(0)));
        assert_eq!(cond.last_update_time, Some(at(20)));
    }

    #[test]
    fn test_status_flip_moves_transition_time() {
        let mut status = HelmReleaseStatus::default();
        status.set_condition(released(ConditionStatus::Unknown), at(0));
        status.set_condition(released(ConditionStatus::False), at(5));

        let cond = status.condition(ConditionType::Released).unwrap();
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.last_transition_time, Some(at(5)));
    }

    #[test]
    fn test_rolled_back_increments_count() {
        let mut status = HelmReleaseStatus::default();
        status.apply_phase(&PhaseUpdate::new(Phase::RolledBack), "r", "ns", at(0));
        status.apply_phase(&PhaseUpdate::new(Phase::RolledBack), "r", "ns", at(1));
        assert_eq!(status.rollback_count, 2);

        status.apply_phase(&PhaseUpdate::new(Phase::RollbackFailed), "r", "ns", at(2));
        assert_eq!(status.rollback_count, 2);
    }

    #[test]
    fn test_released_true_forgives_rollbacks() {
        let mut status = HelmReleaseStatus::default();
        status.apply_phase(&PhaseUpdate::new(Phase::RolledBack), "r", "ns", at(0));
        assert!(status.condition(ConditionType::RolledBack).is_some());

        status.apply_phase(
            &PhaseUpdate::new(Phase::Succeeded).with_revision("abc123"),
            "r",
            "ns",
            at(1),
        );
        assert_eq!(status.rollback_count, 0);
        assert!(status.condition(ConditionType::RolledBack).is_none());
        assert_eq!(status.revision.as_deref(), Some("abc123"));
        assert_eq!(status.phase, Some(Phase::Succeeded));
    }

    #[test]
    fn test_revision_bookkeeping_per_phase() {
        let mut status = HelmReleaseStatus::default();
        status.apply_phase(
            &PhaseUpdate::new(Phase::Upgrading).with_revision("def456"),
            "r",
            "ns",
            at(0),
        );
        assert_eq!(status.last_attempted_revision.as_deref(), Some("def456"));
        assert_eq!(status.revision, None);

        status.apply_phase(
            &PhaseUpdate::new(Phase::Failed).with_revision("def456"),
            "r",
            "ns",
            at(1),
        );
        assert_eq!(status.revision, None);
    }

    #[test]
    fn test_phase_reason_override() {
        let mut status = HelmReleaseStatus::default();
        status.apply_phase(
            &PhaseUpdate::new(Phase::Failed).with_reason(reason::INSTALL_FAILED, "boom"),
            "r",
            "ns",
            at(0),
        );
        let cond = status.condition(ConditionType::Released).unwrap();
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.reason.as_deref(), Some(reason::INSTALL_FAILED));
        assert_eq!(cond.message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_phase_condition_message() {
        let cond = Phase::Installing.condition("flux-podinfo", "apps");
        assert_eq!(cond.type_, ConditionType::Released);
        assert_eq!(cond.status, ConditionStatus::Unknown);
        insta::assert_snapshot!(
            cond.message.unwrap(),
            @"Running installation for Helm release 'flux-podinfo' in 'apps'."
        );
    }

    #[test]
    fn test_observed_generation_only_moves_forward() {
        let mut status = HelmReleaseStatus::default();
        assert!(status.set_observed_generation(2));
        assert!(!status.set_observed_generation(1));
        assert!(!status.set_observed_generation(2));
        assert_eq!(status.observed_generation, Some(2));
    }

    #[test]
    fn test_condition_serialization() {
        let mut status = HelmReleaseStatus::default();
        status.set_condition(released(ConditionStatus::True), at(0));
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["conditions"][0]["type"], "Released");
        assert_eq!(json["conditions"][0]["status"], "True");
        assert!(json["conditions"][0]["lastTransitionTime"].is_string());
    }
}
