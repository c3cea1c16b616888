//! Composition of release values from `valuesFrom` and `spec.values`
//!
//! Sources are merged in declaration order, `spec.values` last. A missing
//! or unparsable source is skipped when marked optional and fails the
//! composition otherwise.

use std::collections::BTreeMap;
use std::path::{Component, Path};

use async_trait::async_trait;
use chartwarden_core::{ExternalSourceRef, HelmRelease, KeyRef, Values, ValuesSourceRef};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Api, Client};
use tracing::{debug, info};
use url::Url;

use crate::error::{KubeError, Result};

/// Read access to ConfigMap and Secret data
#[async_trait]
pub trait ValuesSourceReader: Send + Sync {
    /// Data of a ConfigMap; `None` when it does not exist
    async fn config_map(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>>;

    /// Decoded data of a Secret; `None` when it does not exist
    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>>;
}

#[async_trait]
impl ValuesSourceReader for Client {
    async fn config_map(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>> {
        let api: Api<ConfigMap> = Api::namespaced(self.clone(), namespace);
        Ok(api.get_opt(name).await?.map(|cm| cm.data.unwrap_or_default()))
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>> {
        let api: Api<Secret> = Api::namespaced(self.clone(), namespace);
        let Some(secret) = api.get_opt(name).await? else {
            return Ok(None);
        };

        let mut data: BTreeMap<String, String> = secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).into_owned()))
            .collect();
        data.extend(secret.string_data.unwrap_or_default());
        Ok(Some(data))
    }
}

/// Builds the values handed to the package manager
pub struct ValuesComposer {
    reader: std::sync::Arc<dyn ValuesSourceReader>,
    http: reqwest::Client,
}

impl ValuesComposer {
    pub fn new(reader: std::sync::Arc<dyn ValuesSourceReader>, http: reqwest::Client) -> Self {
        Self { reader, http }
    }

    /// Merge every `valuesFrom` source in order, then `spec.values`
    ///
    /// `chart_path` is the chart root used to resolve `chartFileRef` paths.
    pub async fn compose(&self, hr: &HelmRelease, chart_path: &Path) -> Result<Values> {
        let mut result = Values::new();
        let namespace = hr.resource_namespace();

        for (index, from) in hr.spec.values_from.iter().enumerate() {
            let source = from.source()?;
            let (optional, fetched) = match source {
                ValuesSourceRef::ConfigMap(key_ref) => (
                    key_ref.is_optional(),
                    self.from_key_ref(key_ref, &namespace, "ConfigMap").await,
                ),
                ValuesSourceRef::Secret(key_ref) => (
                    key_ref.is_optional(),
                    self.from_key_ref(key_ref, &namespace, "Secret").await,
                ),
                ValuesSourceRef::External(external) => (
                    external.optional.unwrap_or(false),
                    self.from_external(external).await,
                ),
                ValuesSourceRef::ChartFile(file) => (
                    file.optional.unwrap_or(false),
                    from_chart_file(chart_path, &file.path).await,
                ),
            };

            match fetched {
                Ok(values) => result.merge(values),
                Err(e) if optional => {
                    info!(
                        release = %hr.key(),
                        index,
                        error = %e,
                        "skipping optional values source"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        result.merge(hr.spec.values.clone());
        Ok(result)
    }

    async fn from_key_ref(&self, key_ref: &KeyRef, default_namespace: &str, kind: &str) -> Result<Values> {
        let namespace = key_ref
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(default_namespace);
        let key = key_ref.key_or_default();

        let data = match kind {
            "Secret" => self.reader.secret(namespace, &key_ref.name).await?,
            _ => self.reader.config_map(namespace, &key_ref.name).await?,
        };
        let data = data.ok_or_else(|| values_error(format!("{} {}/{} not found", kind, namespace, key_ref.name)))?;
        let raw = data.get(key).ok_or_else(|| {
            values_error(format!("{} {}/{} has no key '{}'", kind, namespace, key_ref.name, key))
        })?;

        debug!(kind, namespace, name = %key_ref.name, key, "loaded values");
        parse(raw, &format!("{} {}/{}", kind, namespace, key_ref.name))
    }

    async fn from_external(&self, external: &ExternalSourceRef) -> Result<Values> {
        let url = Url::parse(&external.url)
            .map_err(|e| values_error(format!("invalid URL '{}': {}", external.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(values_error(format!(
                "unsupported URL scheme '{}' in '{}'",
                url.scheme(),
                external.url
            )));
        }

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| values_error(format!("fetching {}: {}", external.url, e)))?;
        if !response.status().is_success() {
            return Err(values_error(format!(
                "fetching {}: HTTP {}",
                external.url,
                response.status()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| values_error(format!("reading {}: {}", external.url, e)))?;

        parse(&body, &external.url)
    }
}

async fn from_chart_file(chart_path: &Path, relative: &str) -> Result<Values> {
    let relative = Path::new(relative);
    let escapes = relative
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    if escapes {
        return Err(values_error(format!(
            "chart file '{}' must be relative to the chart root",
            relative.display()
        )));
    }

    let path = chart_path.join(relative);
    let raw = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| values_error(format!("reading {}: {}", path.display(), e)))?;
    parse(&raw, &relative.display().to_string())
}

fn parse(raw: &str, origin: &str) -> Result<Values> {
    Values::from_yaml(raw).map_err(|e| values_error(format!("parsing {}: {}", origin, e)))
}

fn values_error(message: String) -> KubeError {
    KubeError::Values { message }
}

/// In-memory [`ValuesSourceReader`] for tests
#[derive(Default)]
pub struct MockValuesReader {
    config_maps: std::sync::RwLock<BTreeMap<(String, String), BTreeMap<String, String>>>,
    secrets: std::sync::RwLock<BTreeMap<(String, String), BTreeMap<String, String>>>,
}

impl MockValuesReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_config_map(&self, namespace: &str, name: &str, key: &str, value: &str) {
        self.config_maps
            .write()
            .unwrap()
            .entry((namespace.to_string(), name.to_string()))
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    pub fn add_secret(&self, namespace: &str, name: &str, key: &str, value: &str) {
        self.secrets
            .write()
            .unwrap()
            .entry((namespace.to_string(), name.to_string()))
            .or_default()
            .insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl ValuesSourceReader for MockValuesReader {
    async fn config_map(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self
            .config_maps
            .read()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self
            .secrets
            .read()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}
