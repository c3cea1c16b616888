//! Release snapshots returned by the package manager

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::values::Values;

/// A release as reported by the package manager
///
/// Snapshots are read-only values; the operator never mutates them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    /// Release name
    pub name: String,

    /// Kubernetes namespace
    pub namespace: String,

    /// Revision number
    pub revision: u32,

    /// Current status
    pub status: ReleaseStatus,

    /// Chart identity at deploy time
    pub chart: ChartInfo,

    /// Values supplied for this release
    #[serde(default)]
    pub values: Values,

    /// Rendered manifest
    #[serde(default)]
    pub manifest: String,

    /// Last update timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Chart metadata recorded with a release
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartInfo {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
}

/// Release status
///
/// Note: This enum is non-exhaustive - new variants may be added in future versions.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum ReleaseStatus {
    #[default]
    Unknown,
    Deployed,
    Uninstalled,
    Superseded,
    Failed,
    Uninstalling,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
}

impl std::fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Deployed => "deployed",
            Self::Uninstalled => "uninstalled",
            Self::Superseded => "superseded",
            Self::Failed => "failed",
            Self::Uninstalling => "uninstalling",
            Self::PendingInstall => "pending-install",
            Self::PendingUpgrade => "pending-upgrade",
            Self::PendingRollback => "pending-rollback",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ReleaseStatus {
    type Err = std::convert::Infallible;

    /// Unrecognised values map to `Unknown`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "deployed" => Self::Deployed,
            "uninstalled" => Self::Uninstalled,
            "superseded" => Self::Superseded,
            "failed" => Self::Failed,
            "uninstalling" => Self::Uninstalling,
            "pending-install" => Self::PendingInstall,
            "pending-upgrade" => Self::PendingUpgrade,
            "pending-rollback" => Self::PendingRollback,
            _ => Self::Unknown,
        })
    }
}

impl ReleaseStatus {
    /// An operation is mid-flight
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::PendingInstall | Self::PendingUpgrade | Self::PendingRollback | Self::Uninstalling
        )
    }

    /// Only deployed and failed releases are removed on resource deletion
    pub fn allows_uninstall(&self) -> bool {
        matches!(self, Self::Deployed | Self::Failed)
    }
}

impl Release {
    /// Canonical YAML of the supplied values, used for diffing
    pub fn values_yaml(&self) -> String {
        self.values.to_yaml().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            ReleaseStatus::Deployed,
            ReleaseStatus::Failed,
            ReleaseStatus::PendingUpgrade,
        ] {
            assert_eq!(status.to_string().parse::<ReleaseStatus>().unwrap(), status);
        }
        assert_eq!("bogus".parse::<ReleaseStatus>().unwrap(), ReleaseStatus::Unknown);
    }

    #[test]
    fn test_pending_states() {
        assert!(ReleaseStatus::PendingInstall.is_pending());
        assert!(ReleaseStatus::PendingRollback.is_pending());
        assert!(!ReleaseStatus::Deployed.is_pending());
        assert!(!ReleaseStatus::Failed.is_pending());
    }

    #[test]
    fn test_allows_uninstall() {
        assert!(ReleaseStatus::Deployed.allows_uninstall());
        assert!(ReleaseStatus::Failed.allows_uninstall());
        assert!(!ReleaseStatus::Uninstalled.allows_uninstall());
        assert!(!ReleaseStatus::PendingInstall.allows_uninstall());
    }

    #[test]
    fn test_deserialize_status_kebab_case() {
        let status: ReleaseStatus = serde_json::from_str("\"pending-install\"").unwrap();
        assert_eq!(status, ReleaseStatus::PendingInstall);
    }
}
