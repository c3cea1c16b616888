//! The `HelmRelease` custom resource
//!
//! A `HelmRelease` declares a chart source (a path inside a git repository or
//! a chart in a chart repository), the namespace and name of the release it
//! manages, override values and the rollout policy. Status is written back by
//! the operator through the status subresource.

use std::time::Duration;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use schemars::r#gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::condition::Phase;
use crate::error::{CoreError, Result};
use crate::values::Values;

/// API group of the resource
pub const GROUP: &str = "chartwarden.io";

/// Namespace assumed when a resource carries none
pub const DEFAULT_NAMESPACE: &str = "default";

/// Seconds allowed for a single package-manager operation
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Release history entries kept per release
pub const DEFAULT_MAX_HISTORY: u32 = 10;

/// Rollback attempts allowed before an upgrade stops being retried
pub const DEFAULT_ROLLBACK_MAX_RETRIES: i64 = 5;

/// Package-manager client used when the resource names none
pub const DEFAULT_HELM_VERSION: &str = "v3";

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "chartwarden.io",
    version = "v1",
    kind = "HelmRelease",
    namespaced,
    status = "HelmReleaseStatus",
    shortname = "hr",
    printcolumn = r#"{"name":"Release","type":"string","jsonPath":".status.releaseName"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.releaseStatus"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseSpec {
    /// Explicit release name; derived from namespace and resource name otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,

    /// Namespace the release is installed into; defaults to the resource namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,

    /// Package-manager client version tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_version: Option<String>,

    /// Timeout in seconds for install, upgrade and uninstall
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Reset values to the chart defaults on upgrade instead of reusing the last ones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_values: Option<bool>,

    /// Skip installing CRDs shipped with the chart
    #[serde(default, rename = "skipCRDs")]
    pub skip_crds: bool,

    /// Wait for resources to become ready
    #[serde(default)]
    pub wait: bool,

    /// Force resource updates through replacement on upgrade
    #[serde(default)]
    pub force_upgrade: bool,

    /// Revisions kept in the release history
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_history: Option<u32>,

    pub chart: ChartSource,

    #[serde(default)]
    pub rollback: Rollback,

    /// Sources merged, in order, underneath `values`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values_from: Vec<ValuesFromSource>,

    #[serde(default, skip_serializing_if = "Values::is_empty")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub values: Values,
}

/// Chart location; exactly one of the two must be set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChartSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitChartSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<RepoChartSource>,
}

/// A chart stored at a path inside a git repository
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitChartSource {
    /// Remote URL of the repository
    pub git: String,

    /// Branch, tag or commit; the operator's default ref when unset
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,

    /// Path of the chart relative to the repository root
    pub path: String,

    /// Do not run a dependency update on the exported chart
    #[serde(default)]
    pub skip_dep_update: bool,
}

/// A versioned chart in a chart repository
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepoChartSource {
    /// Base URL of the chart repository
    pub repository: String,

    /// Chart name
    pub name: String,

    /// Exact chart version
    pub version: String,
}

/// Borrowed view of the configured chart source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartSourceRef<'a> {
    Git(&'a GitChartSource),
    Repository(&'a RepoChartSource),
}

/// Rollback policy applied when an upgrade fails
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Rollback {
    #[serde(default)]
    pub enable: bool,

    /// Keep retrying the upgrade after a rollback, up to `maxRetries` times
    #[serde(default)]
    pub retry: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<i64>,

    #[serde(default)]
    pub force: bool,

    #[serde(default)]
    pub recreate: bool,

    #[serde(default)]
    pub disable_hooks: bool,

    /// Timeout in seconds for the rollback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    #[serde(default)]
    pub wait: bool,
}

/// One entry of `valuesFrom`; exactly one reference must be set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValuesFromSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_key_ref: Option<KeyRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<KeyRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_source_ref: Option<ExternalSourceRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_file_ref: Option<ChartFileRef>,
}

/// Key of a ConfigMap or Secret holding a values document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeyRef {
    pub name: String,

    /// Defaults to the namespace of the HelmRelease
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Defaults to `values.yaml`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSourceRef {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChartFileRef {
    /// Path relative to the chart root
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
}

/// Borrowed view of a `valuesFrom` entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValuesSourceRef<'a> {
    ConfigMap(&'a KeyRef),
    Secret(&'a KeyRef),
    External(&'a ExternalSourceRef),
    ChartFile(&'a ChartFileRef),
}

/// Observed state written by the operator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseStatus {
    /// Most recent generation the operator finished processing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,

    /// Status of the release as reported by the package manager
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_status: Option<String>,

    /// Chart revision of the last successful release
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    /// Chart revision of the last install or upgrade attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempted_revision: Option<String>,

    #[serde(default)]
    pub rollback_count: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values_checksum: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ChartSource {
    /// Resolve which source is configured
    pub fn source(&self) -> Result<ChartSourceRef<'_>> {
        match (&self.git, &self.repository) {
            (Some(git), None) => Ok(ChartSourceRef::Git(git)),
            (None, Some(repo)) => Ok(ChartSourceRef::Repository(repo)),
            (None, None) => Err(CoreError::InvalidChartSource {
                message: "one of chart.git or chart.repository must be set".to_string(),
            }),
            (Some(_), Some(_)) => Err(CoreError::InvalidChartSource {
                message: "chart.git and chart.repository are mutually exclusive".to_string(),
            }),
        }
    }
}

impl GitChartSource {
    /// The configured ref, or `default` when none is set
    pub fn ref_or<'a>(&'a self, default: &'a str) -> &'a str {
        match self.git_ref.as_deref() {
            Some(r) if !r.is_empty() => r,
            _ => default,
        }
    }
}

impl RepoChartSource {
    /// Repository URL with a trailing slash, so relative chart URLs join correctly
    pub fn clean_repo_url(&self) -> String {
        let mut url = self.repository.trim().to_string();
        if !url.ends_with('/') {
            url.push('/');
        }
        url
    }
}

impl Rollback {
    pub fn max_retries(&self) -> i64 {
        self.max_retries.unwrap_or(DEFAULT_ROLLBACK_MAX_RETRIES)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }
}

impl ValuesFromSource {
    pub fn source(&self) -> Result<ValuesSourceRef<'_>> {
        let mut refs = Vec::with_capacity(1);
        if let Some(r) = &self.config_map_key_ref {
            refs.push(ValuesSourceRef::ConfigMap(r));
        }
        if let Some(r) = &self.secret_key_ref {
            refs.push(ValuesSourceRef::Secret(r));
        }
        if let Some(r) = &self.external_source_ref {
            refs.push(ValuesSourceRef::External(r));
        }
        if let Some(r) = &self.chart_file_ref {
            refs.push(ValuesSourceRef::ChartFile(r));
        }

        match refs.as_slice() {
            [single] => Ok(*single),
            [] => Err(CoreError::InvalidValuesSource {
                message: "valuesFrom entry sets no reference".to_string(),
            }),
            _ => Err(CoreError::InvalidValuesSource {
                message: "valuesFrom entry sets more than one reference".to_string(),
            }),
        }
    }
}

impl KeyRef {
    /// Key inside the ConfigMap or Secret
    pub fn key_or_default(&self) -> &str {
        self.key.as_deref().unwrap_or("values.yaml")
    }

    pub fn is_optional(&self) -> bool {
        self.optional.unwrap_or(false)
    }
}

impl HelmRelease {
    /// Namespace of the resource itself
    pub fn resource_namespace(&self) -> String {
        self.namespace()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string())
    }

    /// Namespace the release is installed into
    pub fn target_namespace(&self) -> String {
        match self.spec.target_namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns.to_string(),
            _ => self.resource_namespace(),
        }
    }

    /// Name of the managed release
    ///
    /// The explicit `releaseName` wins. Otherwise the name is
    /// `{targetNamespace}-{name}`, prefixed by the resource namespace when
    /// that differs from the target namespace.
    pub fn release_name(&self) -> String {
        if let Some(name) = self.spec.release_name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }

        let namespace = self.resource_namespace();
        let target = self.target_namespace();
        let name = self.name_any();
        if namespace != target {
            format!("{}-{}-{}", namespace, target, name)
        } else {
            format!("{}-{}", target, name)
        }
    }

    /// Fully qualified identity, written as the ownership marker on managed objects
    pub fn resource_id(&self) -> String {
        format!("{}:helmrelease/{}", self.resource_namespace(), self.name_any())
    }

    /// Queue key (`namespace/name`)
    pub fn key(&self) -> String {
        format!("{}/{}", self.resource_namespace(), self.name_any())
    }

    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.spec.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }

    pub fn max_history(&self) -> u32 {
        self.spec.max_history.unwrap_or(DEFAULT_MAX_HISTORY)
    }

    pub fn reset_values(&self) -> bool {
        self.spec.reset_values.unwrap_or(false)
    }

    /// Client version tag, falling back to `default`
    pub fn helm_version<'a>(&'a self, default: &'a str) -> &'a str {
        match self.spec.helm_version.as_deref() {
            Some(v) if !v.is_empty() => v,
            _ => default,
        }
    }

    /// Current status, or an empty one
    pub fn status_or_default(&self) -> HelmReleaseStatus {
        self.status.clone().unwrap_or_default()
    }
}

/// Split a `namespace/name` queue key
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    let (namespace, name) = key.split_once('/')?;
    if namespace.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some((namespace, name))
}

fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn release(namespace: &str, name: &str, spec: HelmReleaseSpec) -> HelmRelease {
        let mut hr = HelmRelease::new(name, spec);
        hr.metadata.namespace = Some(namespace.to_string());
        hr
    }

    fn git_spec() -> HelmReleaseSpec {
        HelmReleaseSpec {
            chart: ChartSource {
                git: Some(GitChartSource {
                    git: "ssh://git@example.com/org/charts".to_string(),
                    git_ref: None,
                    path: "charts/app".to_string(),
                    skip_dep_update: false,
                }),
                repository: None,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_release_name_same_namespace() {
        let hr = release("prod", "podinfo", git_spec());
        assert_eq!(hr.target_namespace(), "prod");
        assert_eq!(hr.release_name(), "prod-podinfo");
    }

    #[test]
    fn test_release_name_other_target_namespace() {
        let mut spec = git_spec();
        spec.target_namespace = Some("apps".to_string());
        let hr = release("flux", "podinfo", spec);
        assert_eq!(hr.target_namespace(), "apps");
        assert_eq!(hr.release_name(), "flux-apps-podinfo");
    }

    #[test]
    fn test_release_name_explicit() {
        let mut spec = git_spec();
        spec.release_name = Some("my-release".to_string());
        spec.target_namespace = Some("apps".to_string());
        let hr = release("flux", "podinfo", spec);
        assert_eq!(hr.release_name(), "my-release");
    }

    #[test]
    fn test_missing_namespace_defaults() {
        let hr = HelmRelease::new("podinfo", git_spec());
        assert_eq!(hr.resource_namespace(), "default");
        assert_eq!(hr.release_name(), "default-podinfo");
        assert_eq!(hr.key(), "default/podinfo");
    }

    #[test]
    fn test_resource_id() {
        let hr = release("flux", "podinfo", git_spec());
        insta::assert_snapshot!(hr.resource_id(), @"flux:helmrelease/podinfo");
    }

    #[test]
    fn test_chart_source_exclusive() {
        let mut spec = git_spec();
        assert!(matches!(spec.chart.source(), Ok(ChartSourceRef::Git(_))));

        spec.chart.repository = Some(RepoChartSource {
            repository: "https://charts.example.com".to_string(),
            name: "app".to_string(),
            version: "1.0.0".to_string(),
        });
        assert!(spec.chart.source().is_err());

        spec.chart.git = None;
        assert!(matches!(
            spec.chart.source(),
            Ok(ChartSourceRef::Repository(_))
        ));

        spec.chart.repository = None;
        assert!(spec.chart.source().is_err());
    }

    #[test]
    fn test_clean_repo_url() {
        let repo = RepoChartSource {
            repository: "https://charts.example.com/stable".to_string(),
            name: "app".to_string(),
            version: "1.0.0".to_string(),
        };
        assert_eq!(repo.clean_repo_url(), "https://charts.example.com/stable/");
    }

    #[test]
    fn test_git_ref_default() {
        let mut git = GitChartSource::default();
        assert_eq!(git.ref_or("master"), "master");
        git.git_ref = Some("v1.2.0".to_string());
        assert_eq!(git.ref_or("master"), "v1.2.0");
    }

    #[test]
    fn test_defaults() {
        let hr = release("flux", "podinfo", git_spec());
        assert_eq!(hr.timeout(), Duration::from_secs(300));
        assert_eq!(hr.max_history(), 10);
        assert!(!hr.reset_values());
        assert_eq!(hr.helm_version("v3"), "v3");
        assert_eq!(hr.spec.rollback.max_retries(), 5);
        assert_eq!(hr.generation(), 0);
    }

    #[test]
    fn test_values_from_requires_single_reference() {
        let entry = ValuesFromSource {
            chart_file_ref: Some(ChartFileRef {
                path: "values-prod.yaml".to_string(),
                optional: None,
            }),
            ..Default::default()
        };
        assert!(matches!(entry.source(), Ok(ValuesSourceRef::ChartFile(_))));

        let empty = ValuesFromSource::default();
        assert!(empty.source().is_err());

        let both = ValuesFromSource {
            external_source_ref: Some(ExternalSourceRef {
                url: "https://example.com/values.yaml".to_string(),
                optional: None,
            }),
            ..entry
        };
        assert!(both.source().is_err());
    }

    #[test]
    fn test_deserialize_manifest() {
        let yaml = r#"
apiVersion: chartwarden.io/v1
kind: HelmRelease
metadata:
  name: podinfo
  namespace: flux
  generation: 3
spec:
  targetNamespace: apps
  chart:
    git:
      git: https://github.com/org/charts
      ref: main
      path: charts/podinfo
  rollback:
    enable: true
    maxRetries: 2
  valuesFrom:
    - secretKeyRef:
        name: podinfo-values
  values:
    replicaCount: 2
"#;
        let hr: HelmRelease = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(hr.generation(), 3);
        assert_eq!(hr.release_name(), "flux-apps-podinfo");
        assert_eq!(hr.spec.rollback.max_retries(), 2);
        assert_eq!(
            hr.spec.values_from[0].source().unwrap(),
            ValuesSourceRef::Secret(&KeyRef {
                name: "podinfo-values".to_string(),
                ..Default::default()
            })
        );
        assert_eq!(
            hr.spec.values.get("replicaCount"),
            Some(&serde_json::json!(2))
        );
        match hr.spec.chart.source().unwrap() {
            ChartSourceRef::Git(git) => assert_eq!(git.ref_or("master"), "main"),
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn test_crd_schema() {
        let crd = HelmRelease::crd();
        assert_eq!(crd.spec.group, GROUP);
        assert_eq!(crd.spec.names.kind, "HelmRelease");
        let yaml = serde_yaml::to_string(&crd).unwrap();
        assert!(yaml.contains("x-kubernetes-preserve-unknown-fields: true"));
    }

    #[test]
    fn test_split_key() {
        assert_eq!(split_key("flux/podinfo"), Some(("flux", "podinfo")));
        assert_eq!(split_key("podinfo"), None);
        assert_eq!(split_key("/podinfo"), None);
        assert_eq!(split_key("a/b/c"), None);
    }
}
