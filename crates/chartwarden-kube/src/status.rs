//! Status bookkeeping on HelmRelease resources
//!
//! Every write is a read-modify-write against the resource's
//! `resourceVersion`. A conflict means another writer (the status poller,
//! a second worker after a restart) got there first: the tracker re-reads
//! the resource, re-applies the same mutation and tries again with
//! exponential backoff. The final error is returned to the caller.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chartwarden_core::{
    Condition, ConditionStatus, ConditionType, HelmRelease, HelmReleaseStatus, PhaseUpdate,
};
use chrono::Utc;
use kube::Api;
use kube::api::PostParams;
use kube::ResourceExt;
use tracing::debug;

use crate::error::{KubeError, Result};

/// Read and write access to HelmRelease resources and their status
#[async_trait]
pub trait StatusClient: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<HelmRelease>;

    /// Replace the status subresource; fails with a conflict when
    /// `metadata.resourceVersion` is stale
    async fn update_status(&self, hr: &HelmRelease) -> Result<HelmRelease>;
}

/// [`StatusClient`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStatusClient {
    client: kube::Client,
}

impl KubeStatusClient {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusClient for KubeStatusClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<HelmRelease> {
        let api: Api<HelmRelease> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn update_status(&self, hr: &HelmRelease) -> Result<HelmRelease> {
        let api: Api<HelmRelease> = Api::namespaced(self.client.clone(), &hr.resource_namespace());
        let data = serde_json::to_vec(hr)?;
        Ok(api
            .replace_status(&hr.name_any(), &PostParams::default(), data)
            .await?)
    }
}

/// Bounded exponential backoff for conflicting writes
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

/// Records phases, conditions and bookkeeping fields on release resources
#[derive(Clone)]
pub struct StatusTracker {
    client: Arc<dyn StatusClient>,
    retry: RetryPolicy,
}

impl StatusTracker {
    pub fn new(client: Arc<dyn StatusClient>) -> Self {
        Self {
            client,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Current copy of a resource from the API server
    pub async fn fetch(&self, namespace: &str, name: &str) -> Result<HelmRelease> {
        self.client.get(namespace, name).await
    }

    /// Record a condition
    pub async fn set_condition(&self, hr: &HelmRelease, condition: Condition) -> Result<HelmRelease> {
        self.update(hr, |status| {
            status.set_condition(condition.clone(), Utc::now());
            true
        })
        .await
    }

    /// Move to a phase, recording its condition and revision
    pub async fn set_phase(&self, hr: &HelmRelease, update: PhaseUpdate) -> Result<HelmRelease> {
        let release_name = hr.release_name();
        let namespace = hr.target_namespace();
        self.update(hr, |status| {
            status.apply_phase(&update, &release_name, &namespace, Utc::now());
            true
        })
        .await
    }

    /// Advance `observedGeneration`; never moves it backwards
    pub async fn set_observed_generation(
        &self,
        hr: &HelmRelease,
        generation: i64,
    ) -> Result<HelmRelease> {
        self.update(hr, |status| status.set_observed_generation(generation))
            .await
    }

    pub async fn set_values_checksum(&self, hr: &HelmRelease, checksum: &str) -> Result<HelmRelease> {
        self.update(hr, |status| {
            if checksum.is_empty() || status.values_checksum.as_deref() == Some(checksum) {
                return false;
            }
            status.values_checksum = Some(checksum.to_string());
            true
        })
        .await
    }

    /// Mirror the package manager's view of the release
    pub async fn set_release_status(
        &self,
        hr: &HelmRelease,
        release_name: &str,
        release_status: &str,
    ) -> Result<HelmRelease> {
        self.update(hr, |status| {
            if status.release_name.as_deref() == Some(release_name)
                && status.release_status.as_deref() == Some(release_status)
            {
                return false;
            }
            status.release_name = Some(release_name.to_string());
            status.release_status = Some(release_status.to_string());
            true
        })
        .await
    }

    /// Apply `mutate` to the status and persist it
    ///
    /// `mutate` returns false when nothing changed, which skips the write.
    /// The first attempt works on `hr` as given; later attempts on a fresh read.
    async fn update<F>(&self, hr: &HelmRelease, mut mutate: F) -> Result<HelmRelease>
    where
        F: FnMut(&mut HelmReleaseStatus) -> bool + Send,
    {
        let namespace = hr.resource_namespace();
        let name = hr.name_any();
        let mut current = hr.clone();
        let mut backoff = self.retry.initial_backoff;
        let attempts = self.retry.attempts.max(1);

        for attempt in 1..=attempts {
            if attempt > 1 {
                current = self.client.get(&namespace, &name).await?;
            }

            let mut status = current.status_or_default();
            if !mutate(&mut status) {
                return Ok(current);
            }
            let mut next = current.clone();
            next.status = Some(status);

            match self.client.update_status(&next).await {
                Ok(updated) => return Ok(updated),
                Err(e) if e.is_conflict() && attempt < attempts => {
                    debug!(
                        release = %format!("{}/{}", namespace, name),
                        attempt,
                        "status update conflicted, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }

        Err(KubeError::Serialization(format!(
            "status update for {}/{} gave up without an attempt",
            namespace, name
        )))
    }
}

/// The current generation has been processed
pub fn has_synced(hr: &HelmRelease) -> bool {
    hr.status
        .as_ref()
        .and_then(|s| s.observed_generation)
        .is_some_and(|observed| observed >= hr.generation())
}

/// The current generation was rolled back and nothing newer was fetched since
///
/// A `ChartFetched=True` written after the rollback's last update means a
/// new chart revision arrived, so the rollback no longer describes the
/// state of the release.
pub fn has_rolled_back(hr: &HelmRelease) -> bool {
    if !has_synced(hr) {
        return false;
    }
    let Some(status) = hr.status.as_ref() else {
        return false;
    };
    let Some(rolled_back) = status.condition(ConditionType::RolledBack) else {
        return false;
    };

    if let Some(fetched) = status.condition(ConditionType::ChartFetched) {
        if fetched.status == ConditionStatus::True
            && rolled_back.last_update_time < fetched.last_update_time
        {
            return false;
        }
    }

    rolled_back.status == ConditionStatus::True
}

/// Counts of operations performed for testing assertions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatusOperationCounts {
    pub gets: usize,
    pub updates: usize,
    pub conflicts: usize,
}

/// In-memory [`StatusClient`] enforcing resource versions
#[derive(Clone, Default)]
pub struct MockStatusClient {
    store: Arc<RwLock<HashMap<(String, String), HelmRelease>>>,
    /// Concurrent writes to simulate before the next update
    pending_conflicts: Arc<RwLock<usize>>,
    operations: Arc<RwLock<StatusOperationCounts>>,
}

impl MockStatusClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `hr`, assigning a resource version when it has none
    pub fn insert(&self, mut hr: HelmRelease) -> HelmRelease {
        if hr.metadata.resource_version.is_none() {
            hr.metadata.resource_version = Some("1".to_string());
        }
        let key = (hr.resource_namespace(), hr.name_any());
        self.store.write().unwrap().insert(key, hr.clone());
        hr
    }

    pub fn stored(&self, namespace: &str, name: &str) -> Option<HelmRelease> {
        self.store
            .read()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Bump the stored version `count` times before the next updates land
    pub fn simulate_conflicts(&self, count: usize) {
        *self.pending_conflicts.write().unwrap() = count;
    }

    pub fn operation_counts(&self) -> StatusOperationCounts {
        self.operations.read().unwrap().clone()
    }
}

fn bump_version(hr: &mut HelmRelease) {
    let next = hr
        .metadata
        .resource_version
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    hr.metadata.resource_version = Some(next.to_string());
}

fn conflict(name: &str) -> KubeError {
    KubeError::Api(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!(
            "Operation cannot be fulfilled on helmreleases.chartwarden.io \"{}\": the object has been modified",
            name
        ),
        reason: "Conflict".to_string(),
        code: 409,
    }))
}

fn not_found(name: &str) -> KubeError {
    KubeError::Api(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("helmreleases.chartwarden.io \"{}\" not found", name),
        reason: "NotFound".to_string(),
        code: 404,
    }))
}

#[async_trait]
impl StatusClient for MockStatusClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<HelmRelease> {
        self.operations.write().unwrap().gets += 1;
        self.stored(namespace, name).ok_or_else(|| not_found(name))
    }

    async fn update_status(&self, hr: &HelmRelease) -> Result<HelmRelease> {
        self.operations.write().unwrap().updates += 1;
        let name = hr.name_any();
        let key = (hr.resource_namespace(), name.clone());
        let mut store = self.store.write().unwrap();
        let stored = store.get_mut(&key).ok_or_else(|| not_found(&name))?;

        {
            let mut pending = self.pending_conflicts.write().unwrap();
            if *pending > 0 {
                *pending -= 1;
                bump_version(stored);
            }
        }

        if stored.metadata.resource_version != hr.metadata.resource_version {
            self.operations.write().unwrap().conflicts += 1;
            return Err(conflict(&name));
        }

        stored.status = hr.status.clone();
        bump_version(stored);
        Ok(stored.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartwarden_core::{reason, Phase};
    use chrono::TimeZone;

    fn release(generation: i64) -> HelmRelease {
        let mut hr = HelmRelease::new("app", Default::default());
        hr.metadata.namespace = Some("flux".to_string());
        hr.metadata.generation = Some(generation);
        hr
    }

    fn tracker(client: &MockStatusClient) -> StatusTracker {
        StatusTracker::new(Arc::new(client.clone())).with_retry(RetryPolicy {
            attempts: 5,
            initial_backoff: Duration::from_millis(1),
        })
    }

    #[tokio::test]
    async fn test_set_phase_persists_condition() {
        let client = MockStatusClient::new();
        let hr = client.insert(release(1));
        let tracker = tracker(&client);

        let updated = tracker
            .set_phase(&hr, PhaseUpdate::new(Phase::Installing).with_revision("abc123"))
            .await
            .unwrap();
        let status = updated.status.unwrap();
        assert_eq!(status.phase, Some(Phase::Installing));
        assert_eq!(status.last_attempted_revision.as_deref(), Some("abc123"));
        let released = status.condition(ConditionType::Released).unwrap();
        assert_eq!(released.status, ConditionStatus::Unknown);

        let stored = client.stored("flux", "app").unwrap();
        assert_eq!(stored.metadata.resource_version.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_conflict_is_retried_on_fresh_copy() {
        let client = MockStatusClient::new();
        let hr = client.insert(release(1));
        let tracker = tracker(&client);

        client.simulate_conflicts(2);
        let updated = tracker.set_observed_generation(&hr, 1).await.unwrap();
        assert_eq!(updated.status.unwrap().observed_generation, Some(1));

        let counts = client.operation_counts();
        assert_eq!(counts.conflicts, 2);
        assert_eq!(counts.updates, 3);
        assert_eq!(counts.gets, 2);
    }

    #[tokio::test]
    async fn test_conflict_exhaustion_is_surfaced() {
        let client = MockStatusClient::new();
        let hr = client.insert(release(1));
        let tracker = tracker(&client);

        client.simulate_conflicts(10);
        let err = tracker.set_observed_generation(&hr, 1).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(client.operation_counts().updates, 5);
    }

    #[tokio::test]
    async fn test_unchanged_status_is_not_written() {
        let client = MockStatusClient::new();
        let hr = client.insert(release(2));
        let tracker = tracker(&client);

        let hr = tracker.set_observed_generation(&hr, 2).await.unwrap();
        let hr = tracker.set_observed_generation(&hr, 1).await.unwrap();
        tracker.set_values_checksum(&hr, "").await.unwrap();
        assert_eq!(client.operation_counts().updates, 1);
        assert_eq!(hr.status.unwrap().observed_generation, Some(2));
    }

    #[tokio::test]
    async fn test_rollback_count_through_tracker() {
        let client = MockStatusClient::new();
        let hr = client.insert(release(1));
        let tracker = tracker(&client);

        let hr = tracker
            .set_phase(&hr, PhaseUpdate::new(Phase::RolledBack))
            .await
            .unwrap();
        let hr = tracker
            .set_phase(&hr, PhaseUpdate::new(Phase::RolledBack))
            .await
            .unwrap();
        assert_eq!(hr.status.as_ref().unwrap().rollback_count, 2);

        let hr = tracker
            .set_phase(&hr, PhaseUpdate::new(Phase::Succeeded).with_revision("abc"))
            .await
            .unwrap();
        let status = hr.status.unwrap();
        assert_eq!(status.rollback_count, 0);
        assert!(status.condition(ConditionType::RolledBack).is_none());
        assert_eq!(status.revision.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_release_status_mirrored_once() {
        let client = MockStatusClient::new();
        let hr = client.insert(release(1));
        let tracker = tracker(&client);

        let hr = tracker
            .set_release_status(&hr, "flux-app", "deployed")
            .await
            .unwrap();
        tracker
            .set_release_status(&hr, "flux-app", "deployed")
            .await
            .unwrap();
        assert_eq!(client.operation_counts().updates, 1);
    }

    fn at(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_has_synced() {
        let mut hr = release(3);
        assert!(!has_synced(&hr));

        hr.status = Some(HelmReleaseStatus {
            observed_generation: Some(2),
            ..Default::default()
        });
        assert!(!has_synced(&hr));

        hr.status.as_mut().unwrap().observed_generation = Some(3);
        assert!(has_synced(&hr));
    }

    #[test]
    fn test_has_rolled_back() {
        let mut hr = release(1);
        let mut status = HelmReleaseStatus {
            observed_generation: Some(1),
            ..Default::default()
        };
        status.set_condition(
            Condition::new(ConditionType::ChartFetched, ConditionStatus::True, reason::GIT_REPO_CLONED, ""),
            at(0),
        );
        status.apply_phase(&PhaseUpdate::new(Phase::RolledBack), "flux-app", "flux", at(10));
        hr.status = Some(status.clone());
        assert!(has_rolled_back(&hr));

        // A newer successful fetch invalidates the rollback
        status.set_condition(
            Condition::new(ConditionType::ChartFetched, ConditionStatus::True, reason::GIT_REPO_CLONED, ""),
            at(20),
        );
        hr.status = Some(status.clone());
        assert!(!has_rolled_back(&hr));

        // Not for a generation that has not been processed yet
        status.apply_phase(&PhaseUpdate::new(Phase::RolledBack), "flux-app", "flux", at(30));
        hr.status = Some(status);
        assert!(has_rolled_back(&hr));
        hr.metadata.generation = Some(2);
        assert!(!has_rolled_back(&hr));
    }
}
