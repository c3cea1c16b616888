//! Error types for chartwarden-kube

use chartwarden_core::{CoreError, ReleaseStatus};
use chartwarden_source::SourceError;
use thiserror::Error;

/// Result type for chartwarden-kube operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Errors that can occur while reconciling releases
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KubeError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// Chart source error (mirrors, exports, chart repositories)
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Invalid resource definition
    #[error(transparent)]
    Core(#[from] CoreError),

    // =========================================================================
    // Policy errors, terminal for the current cycle
    // =========================================================================
    /// No package-manager client is registered for the version tag
    #[error("no Helm client registered for version '{version}'")]
    NoClient { version: String },

    /// The release is owned by a different resource
    #[error("release '{release}' does not belong to this HelmRelease (owned by '{owner}')")]
    NotOwned { release: String, owner: String },

    /// The release state forbids the requested operation
    #[error("release '{release}' is in state '{status}' which prevents it from being {operation}")]
    ReleaseBlocked {
        release: String,
        status: ReleaseStatus,
        operation: &'static str,
    },

    /// A failed release must be rolled back before it can be upgraded
    #[error("release '{release}' requires a rollback before it can be upgraded")]
    RollbackRequired { release: String },

    // =========================================================================
    // Execution errors
    // =========================================================================
    /// Package-manager command failed
    #[error("helm {command} failed: {message}")]
    Helm { command: String, message: String },

    /// Package-manager command exceeded its timeout
    #[error("helm {command} timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    /// Composing values from `valuesFrom` failed
    #[error("failed to compose values: {message}")]
    Values { message: String },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for KubeError {
    fn from(e: serde_json::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for KubeError {
    fn from(e: serde_yaml::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl KubeError {
    /// Check if this is a Kubernetes 404 Not Found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, KubeError::Api(kube::Error::Api(resp)) if resp.code == 404)
    }

    /// Check if this is a conflict error (409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, KubeError::Api(kube::Error::Api(resp)) if resp.code == 409)
    }

    /// The chart source is not available yet; a change signal will follow
    pub fn is_not_ready(&self) -> bool {
        matches!(self, KubeError::Source(e) if e.is_not_ready())
    }

    /// Ownership, release state or resource definition problems
    pub fn is_policy(&self) -> bool {
        matches!(
            self,
            KubeError::NoClient { .. }
                | KubeError::NotOwned { .. }
                | KubeError::ReleaseBlocked { .. }
                | KubeError::RollbackRequired { .. }
                | KubeError::Core(_)
        )
    }

    /// Network, timeout and conflict errors worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        match self {
            KubeError::Api(kube::Error::Api(resp)) => {
                resp.code == 409 || resp.code == 429 || resp.code >= 500
            }
            KubeError::Api(_) | KubeError::Timeout { .. } => true,
            KubeError::Source(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Build an API error response, as returned by the server
#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> KubeError {
    KubeError::Api(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} error", reason),
        reason: reason.to_string(),
        code,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(api_error(409, "Conflict").is_conflict());
        assert!(api_error(409, "Conflict").is_transient());
        assert!(api_error(404, "NotFound").is_not_found());
        assert!(!api_error(404, "NotFound").is_transient());

        let not_owned = KubeError::NotOwned {
            release: "flux-app".to_string(),
            owner: "other:helmrelease/app".to_string(),
        };
        assert!(not_owned.is_policy());
        assert!(!not_owned.is_transient());

        let not_ready = KubeError::from(SourceError::NotReady {
            remote: "https://example.com/repo.git".to_string(),
            status: "not-ready".to_string(),
        });
        assert!(not_ready.is_not_ready());
        assert!(!not_ready.is_policy());
    }

    #[test]
    fn test_blocked_message() {
        let err = KubeError::ReleaseBlocked {
            release: "flux-app".to_string(),
            status: ReleaseStatus::PendingUpgrade,
            operation: "upgraded",
        };
        assert_eq!(
            err.to_string(),
            "release 'flux-app' is in state 'pending-upgrade' which prevents it from being upgraded"
        );
    }
}
