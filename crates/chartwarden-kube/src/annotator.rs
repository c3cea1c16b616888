//! Ownership marker on the objects of a release
//!
//! After each successful install, upgrade or rollback every object in the
//! release manifest is annotated with the owning resource's identity.
//! Before touching an existing release the reconciler reads the marker back
//! to make sure two HelmReleases never fight over one release name.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chartwarden_core::{HelmRelease, Release};
use kube::{
    Client, ResourceExt,
    api::{Api, DynamicObject, Patch, PatchParams},
    core::GroupVersionKind,
    discovery::{ApiCapabilities, ApiResource, Discovery, Scope},
};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::Result;

/// Annotation carrying the owning resource's identity
pub const ANTECEDENT_ANNOTATION: &str = "chartwarden.io/antecedent";

/// Who a release belongs to, according to its objects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    /// No marker found; the release may be adopted
    Unclaimed,
    /// Marked with this identity
    Claimed(String),
}

impl Ownership {
    /// Whether `hr` may manage the release
    pub fn permits(&self, hr: &HelmRelease) -> bool {
        match self {
            Ownership::Unclaimed => true,
            Ownership::Claimed(owner) => *owner == hr.resource_id(),
        }
    }
}

/// Reads and writes the ownership marker
#[async_trait]
pub trait Annotator: Send + Sync {
    /// Marker found on the first object of the manifest that exists
    async fn ownership(&self, release: &Release) -> Result<Ownership>;

    /// Mark every object of the manifest; returns how many were patched
    async fn annotate(&self, release: &Release, resource_id: &str) -> Result<usize>;
}

/// Reference to one object of a rendered manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestObject {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
}

impl ManifestObject {
    fn gvk(&self) -> GroupVersionKind {
        let (group, version) = match self.api_version.rsplit_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), self.api_version.clone()),
        };
        GroupVersionKind {
            group,
            version,
            kind: self.kind.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawObject {
    #[serde(default)]
    api_version: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    metadata: RawMetadata,
    #[serde(default)]
    items: Vec<RawObject>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: Option<String>,
}

/// Objects of a multi-document manifest; `List` kinds are expanded
///
/// Documents that do not parse or carry no kind or name are skipped.
pub fn manifest_objects(manifest: &str) -> Vec<ManifestObject> {
    let mut objects = Vec::new();

    for doc in manifest.split("\n---") {
        let doc = doc.trim().trim_start_matches("---").trim();
        if doc.lines().all(|l| l.trim().is_empty() || l.trim().starts_with('#')) {
            continue;
        }
        match serde_yaml::from_str::<RawObject>(doc) {
            Ok(raw) => collect(raw, &mut objects),
            Err(e) => debug!(error = %e, "skipping unparsable manifest document"),
        }
    }

    objects
}

fn collect(raw: RawObject, objects: &mut Vec<ManifestObject>) {
    if raw.kind.ends_with("List") {
        for item in raw.items {
            collect(item, objects);
        }
        return;
    }
    if raw.kind.is_empty() || raw.metadata.name.is_empty() {
        return;
    }
    objects.push(ManifestObject {
        api_version: raw.api_version,
        kind: raw.kind,
        name: raw.metadata.name,
        namespace: raw.metadata.namespace.filter(|ns| !ns.is_empty()),
    });
}

/// [`Annotator`] using merge patches through the Kubernetes API
pub struct KubeAnnotator {
    client: Client,
    discovery: RwLock<Discovery>,
}

impl KubeAnnotator {
    pub async fn new(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone()).run().await?;
        Ok(Self {
            client,
            discovery: RwLock::new(discovery),
        })
    }

    /// Refresh discovery cache (call after CRD changes)
    async fn refresh_discovery(&self) -> Result<()> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        *self.discovery.write().await = discovery;
        Ok(())
    }

    async fn resolve(&self, gvk: &GroupVersionKind) -> Option<(ApiResource, ApiCapabilities)> {
        if let Some(found) = self.discovery.read().await.resolve_gvk(gvk) {
            return Some(found);
        }
        // The chart may have just installed the CRD for this kind
        if let Err(e) = self.refresh_discovery().await {
            warn!(error = %e, "failed to refresh API discovery");
            return None;
        }
        self.discovery.read().await.resolve_gvk(gvk)
    }

    async fn api_for(&self, object: &ManifestObject, release_namespace: &str) -> Option<Api<DynamicObject>> {
        let gvk = object.gvk();
        let Some((resource, capabilities)) = self.resolve(&gvk).await else {
            debug!(kind = %object.kind, name = %object.name, "unknown resource type, skipping");
            return None;
        };
        Some(if capabilities.scope == Scope::Namespaced {
            let namespace = object.namespace.as_deref().unwrap_or(release_namespace);
            Api::namespaced_with(self.client.clone(), namespace, &resource)
        } else {
            Api::all_with(self.client.clone(), &resource)
        })
    }
}

#[async_trait]
impl Annotator for KubeAnnotator {
    async fn ownership(&self, release: &Release) -> Result<Ownership> {
        for object in manifest_objects(&release.manifest) {
            let Some(api) = self.api_for(&object, &release.namespace).await else {
                continue;
            };
            match api.get_opt(&object.name).await {
                Ok(Some(found)) => {
                    return Ok(match found.annotations().get(ANTECEDENT_ANNOTATION) {
                        Some(owner) if !owner.is_empty() => Ownership::Claimed(owner.clone()),
                        _ => Ownership::Unclaimed,
                    });
                }
                Ok(None) => continue,
                Err(e) => {
                    debug!(kind = %object.kind, name = %object.name, error = %e, "cannot read object");
                    continue;
                }
            }
        }
        Ok(Ownership::Unclaimed)
    }

    async fn annotate(&self, release: &Release, resource_id: &str) -> Result<usize> {
        let patch = serde_json::json!({
            "metadata": { "annotations": { ANTECEDENT_ANNOTATION: resource_id } }
        });
        let params = PatchParams::default();
        let mut patched = 0;

        for object in manifest_objects(&release.manifest) {
            let Some(api) = self.api_for(&object, &release.namespace).await else {
                continue;
            };
            match api.patch(&object.name, &params, &Patch::Merge(&patch)).await {
                Ok(_) => patched += 1,
                Err(e) => warn!(
                    release = %release.name,
                    kind = %object.kind,
                    name = %object.name,
                    error = %e,
                    "failed to annotate release object"
                ),
            }
        }

        Ok(patched)
    }
}

/// In-memory [`Annotator`] keyed by release name
#[derive(Default)]
pub struct MockAnnotator {
    owners: std::sync::RwLock<BTreeMap<String, String>>,
    annotations: std::sync::RwLock<usize>,
}

impl MockAnnotator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend the objects of `release` are marked with `owner`
    pub fn set_owner(&self, release: &str, owner: &str) {
        self.owners
            .write()
            .unwrap()
            .insert(release.to_string(), owner.to_string());
    }

    pub fn owner(&self, release: &str) -> Option<String> {
        self.owners.read().unwrap().get(release).cloned()
    }

    /// Number of `annotate` calls
    pub fn annotate_calls(&self) -> usize {
        *self.annotations.read().unwrap()
    }
}

#[async_trait]
impl Annotator for MockAnnotator {
    async fn ownership(&self, release: &Release) -> Result<Ownership> {
        Ok(match self.owner(&release.name) {
            Some(owner) => Ownership::Claimed(owner),
            None => Ownership::Unclaimed,
        })
    }

    async fn annotate(&self, release: &Release, resource_id: &str) -> Result<usize> {
        *self.annotations.write().unwrap() += 1;
        self.set_owner(&release.name, resource_id);
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"---
# Source: app/templates/service.yaml
apiVersion: v1
kind: Service
metadata:
  name: app
---
# Source: app/templates/deployment.yaml
apiVersion: apps/v1
kind: Deployment
metadata:
  name: app
  namespace: other
spec:
  replicas: 1
---
# Source: app/templates/empty.yaml
---
apiVersion: v1
kind: ConfigMapList
items:
  - apiVersion: v1
    kind: ConfigMap
    metadata:
      name: first
  - apiVersion: v1
    kind: ConfigMap
    metadata:
      name: second
"#;

    #[test]
    fn test_manifest_objects() {
        let objects = manifest_objects(MANIFEST);
        let names: Vec<_> = objects
            .iter()
            .map(|o| format!("{}/{}", o.kind, o.name))
            .collect();
        assert_eq!(
            names,
            vec!["Service/app", "Deployment/app", "ConfigMap/first", "ConfigMap/second"]
        );
        assert_eq!(objects[0].namespace, None);
        assert_eq!(objects[1].namespace.as_deref(), Some("other"));
    }

    #[test]
    fn test_gvk_from_api_version() {
        let object = ManifestObject {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            name: "app".to_string(),
            namespace: None,
        };
        let gvk = object.gvk();
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.version, "v1");

        let core = ManifestObject {
            api_version: "v1".to_string(),
            ..object
        };
        assert_eq!(core.gvk().group, "");
    }

    #[test]
    fn test_ownership_permits() {
        let mut hr = HelmRelease::new("app", Default::default());
        hr.metadata.namespace = Some("flux".to_string());

        assert!(Ownership::Unclaimed.permits(&hr));
        assert!(Ownership::Claimed("flux:helmrelease/app".to_string()).permits(&hr));
        assert!(!Ownership::Claimed("other:helmrelease/app".to_string()).permits(&hr));
    }

    #[tokio::test]
    async fn test_mock_annotator_claims_release() {
        let annotator = MockAnnotator::new();
        let release = Release {
            name: "flux-app".to_string(),
            namespace: "flux".to_string(),
            revision: 1,
            status: Default::default(),
            chart: Default::default(),
            values: Default::default(),
            manifest: String::new(),
            updated_at: None,
        };

        assert_eq!(annotator.ownership(&release).await.unwrap(), Ownership::Unclaimed);
        annotator.annotate(&release, "flux:helmrelease/app").await.unwrap();
        assert_eq!(
            annotator.ownership(&release).await.unwrap(),
            Ownership::Claimed("flux:helmrelease/app".to_string())
        );
    }
}
