//! Charts from HTTP chart repositories
//!
//! Charts are fetched once per name and version into a local cache
//! directory and extracted next to their archive. Later requests for the
//! same chart are served from disk without touching the network.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chartwarden_core::RepoChartSource;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Result, SourceError};

/// Repository index (`index.yaml`)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartIndex {
    #[serde(default)]
    pub api_version: String,

    #[serde(default)]
    pub entries: HashMap<String, Vec<ChartEntry>>,
}

/// One chart version in the index
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartEntry {
    pub name: String,

    pub version: String,

    #[serde(default)]
    pub app_version: Option<String>,

    /// URLs of the chart archive, absolute or relative to the repository
    #[serde(default)]
    pub urls: Vec<String>,

    /// SHA256 digest of the archive
    #[serde(default)]
    pub digest: Option<String>,
}

impl ChartIndex {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_yaml::from_slice(bytes).map_err(|e| SourceError::IndexParseError {
            message: e.to_string(),
        })
    }

    /// Get a specific version of a chart
    pub fn get_version(&self, name: &str, version: &str) -> Option<&ChartEntry> {
        self.entries.get(name)?.iter().find(|e| e.version == version)
    }
}

/// A chart ready on local disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedChart {
    /// Chart root directory
    pub path: PathBuf,
    /// Served from the cache without a download
    pub cached: bool,
}

/// Local cache of repository charts
pub struct ChartCache {
    dir: PathBuf,
    client: reqwest::Client,
    /// `{name}-{version}` -> lock held while that chart is fetched
    fetch_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChartCache {
    /// Cache rooted at `dir`; each HTTP request is bounded by `timeout`
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("chartwarden/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            dir: dir.into(),
            client,
            fetch_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Make sure the chart is downloaded and extracted, returning its path
    pub async fn ensure_fetched(&self, source: &RepoChartSource) -> Result<FetchedChart> {
        validate_component("name", &source.name)?;
        validate_component("version", &source.version)?;

        let base = format!("{}-{}", source.name, source.version);
        let archive = self.dir.join(format!("{}.tgz", base));
        let extracted = self.dir.join(&base);
        let chart_path = extracted.join(&source.name);

        // Releases of the same chart version share files on disk
        let lock = self.fetch_lock(&base);
        let _guard = lock.lock().await;

        if tokio::fs::try_exists(chart_path.join("Chart.yaml")).await? {
            return Ok(FetchedChart {
                path: chart_path,
                cached: true,
            });
        }

        tokio::fs::create_dir_all(&self.dir).await?;

        let cached = tokio::fs::try_exists(&archive).await?;
        if !cached {
            let data = self.download(source).await?;
            tokio::fs::write(&archive, &data).await?;
            info!(chart = %source.name, version = %source.version, "downloaded chart");
        } else {
            debug!(chart = %source.name, version = %source.version, "using cached chart archive");
        }

        let target = extracted.clone();
        let archive_path = archive.clone();
        tokio::task::spawn_blocking(move || extract_chart_archive(&archive_path, &target))
            .await
            .map_err(|e| SourceError::Io(std::io::Error::other(e)))??;

        if !tokio::fs::try_exists(chart_path.join("Chart.yaml")).await? {
            return Err(SourceError::Unavailable {
                remote: source.clean_repo_url(),
                message: format!("archive {} has no chart named {}", base, source.name),
            });
        }

        Ok(FetchedChart {
            path: chart_path,
            cached,
        })
    }

    fn fetch_lock(&self, base: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.fetch_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(base.to_string()).or_default().clone()
    }

    async fn download(&self, source: &RepoChartSource) -> Result<Vec<u8>> {
        let repo_url = source.clean_repo_url();
        let base = url::Url::parse(&repo_url).map_err(|e| SourceError::InvalidSource {
            message: format!("repository URL {}: {}", repo_url, e),
        })?;

        let index_url = join_url(&base, "index.yaml")?;
        let index = ChartIndex::from_bytes(&self.get_bytes(index_url).await?)?;

        let entry = index
            .get_version(&source.name, &source.version)
            .ok_or_else(|| SourceError::VersionNotFound {
                name: source.name.clone(),
                version: source.version.clone(),
                repo: repo_url.clone(),
            })?;
        let url = entry.urls.first().ok_or_else(|| SourceError::Unavailable {
            remote: repo_url.clone(),
            message: format!("no download URL for {}@{}", entry.name, entry.version),
        })?;

        let data = self.get_bytes(join_url(&base, url)?).await?;

        if let Some(expected) = &entry.digest {
            let actual = compute_digest(&data);
            if !digest_matches(expected, &actual) {
                return Err(SourceError::IntegrityCheckFailed {
                    name: entry.name.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        Ok(data)
    }

    async fn get_bytes(&self, url: url::Url) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

fn join_url(base: &url::Url, path: &str) -> Result<url::Url> {
    base.join(path).map_err(|e| SourceError::InvalidSource {
        message: format!("chart URL {}: {}", path, e),
    })
}

/// Reject values that would escape the cache directory
fn validate_component(field: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.contains('/') || value.contains('\\') || value.contains("..") {
        return Err(SourceError::InvalidSource {
            message: format!("invalid chart {} '{}'", field, value),
        });
    }
    Ok(())
}

/// Compute SHA256 digest of data
fn compute_digest(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Check if two digests match, ignoring case and a `sha256:` prefix
fn digest_matches(expected: &str, actual: &str) -> bool {
    let normalize = |d: &str| {
        d.trim()
            .to_lowercase()
            .trim_start_matches("sha256:")
            .trim_start_matches("sha256-")
            .to_string()
    };
    normalize(expected) == normalize(actual)
}

/// Extract a chart archive (tar.gz), replacing any earlier extraction
fn extract_chart_archive(archive: &Path, dest: &Path) -> Result<()> {
    use flate2::read::GzDecoder;
    use tar::Archive;

    let mut partial = dest.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);
    if partial.exists() {
        std::fs::remove_dir_all(&partial)?;
    }
    std::fs::create_dir_all(&partial)?;

    let file = std::fs::File::open(archive)?;
    Archive::new(GzDecoder::new(file)).unpack(&partial)?;

    if dest.exists() {
        std::fs::remove_dir_all(dest)?;
    }
    std::fs::rename(&partial, dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chart_archive(name: &str, version: &str) -> Vec<u8> {
        use flate2::Compression;
        use flate2::write::GzEncoder;

        let chart_yaml = format!("apiVersion: v2\nname: {}\nversion: {}\n", name, version);
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_size(chart_yaml.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(
                &mut header,
                format!("{}/Chart.yaml", name),
                chart_yaml.as_bytes(),
            )
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn index_yaml(digest: &str) -> String {
        format!(
            "apiVersion: v1\nentries:\n  podinfo:\n    - name: podinfo\n      version: 6.0.0\n      urls:\n        - charts/podinfo-6.0.0.tgz\n      digest: \"{}\"\n",
            digest
        )
    }

    fn source(server: &MockServer, version: &str) -> RepoChartSource {
        RepoChartSource {
            repository: format!("{}/stable", server.uri()),
            name: "podinfo".to_string(),
            version: version.to_string(),
        }
    }

    #[test]
    fn test_digest_matches() {
        assert!(digest_matches("sha256:ABC123", "abc123"));
        assert!(digest_matches("abc123", "sha256-abc123"));
        assert!(!digest_matches("abc123", "def456"));
    }

    #[test]
    fn test_index_get_version() {
        let index = ChartIndex::from_bytes(index_yaml("abc").as_bytes()).unwrap();
        let entry = index.get_version("podinfo", "6.0.0").unwrap();
        assert_eq!(entry.urls, vec!["charts/podinfo-6.0.0.tgz"]);
        assert!(index.get_version("podinfo", "5.0.0").is_none());
        assert!(index.get_version("other", "6.0.0").is_none());
    }

    #[test]
    fn test_rejects_path_components() {
        assert!(validate_component("name", "../etc").is_err());
        assert!(validate_component("name", "a/b").is_err());
        assert!(validate_component("version", "").is_err());
        assert!(validate_component("version", "1.2.3").is_ok());
    }

    #[tokio::test]
    async fn test_fetch_then_serve_from_cache() {
        let server = MockServer::start().await;
        let archive = chart_archive("podinfo", "6.0.0");

        Mock::given(method("GET"))
            .and(path("/stable/index.yaml"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(index_yaml(&compute_digest(&archive))),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/stable/charts/podinfo-6.0.0.tgz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(archive))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = ChartCache::new(dir.path(), Duration::from_secs(10)).unwrap();

        let first = cache.ensure_fetched(&source(&server, "6.0.0")).await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.path, dir.path().join("podinfo-6.0.0").join("podinfo"));
        assert!(first.path.join("Chart.yaml").exists());

        let second = cache.ensure_fetched(&source(&server, "6.0.0")).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.path, first.path);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_of_one_chart_download_once() {
        let server = MockServer::start().await;
        let archive = chart_archive("podinfo", "6.0.0");
        Mock::given(method("GET"))
            .and(path("/stable/index.yaml"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(index_yaml(&compute_digest(&archive))),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/stable/charts/podinfo-6.0.0.tgz"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(archive)
                    .set_delay(Duration::from_millis(200)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = ChartCache::new(dir.path(), Duration::from_secs(10)).unwrap();
        let chart = source(&server, "6.0.0");

        let (a, b) = tokio::join!(cache.ensure_fetched(&chart), cache.ensure_fetched(&chart));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.path, b.path);
        assert!(a.cached != b.cached);
    }

    #[tokio::test]
    async fn test_different_charts_fetch_independently() {
        let server = MockServer::start().await;
        let slow = chart_archive("podinfo", "6.0.0");
        let fast = chart_archive("redis", "1.0.0");
        let index = format!(
            "apiVersion: v1\nentries:\n  podinfo:\n    - name: podinfo\n      version: 6.0.0\n      urls:\n        - charts/podinfo-6.0.0.tgz\n      digest: \"{}\"\n  redis:\n    - name: redis\n      version: 1.0.0\n      urls:\n        - charts/redis-1.0.0.tgz\n      digest: \"{}\"\n",
            compute_digest(&slow),
            compute_digest(&fast)
        );
        Mock::given(method("GET"))
            .and(path("/stable/index.yaml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(index))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/stable/charts/podinfo-6.0.0.tgz"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(slow)
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/stable/charts/redis-1.0.0.tgz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(fast))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = ChartCache::new(dir.path(), Duration::from_secs(10)).unwrap();
        let podinfo = source(&server, "6.0.0");
        let redis = RepoChartSource {
            name: "redis".to_string(),
            ..source(&server, "1.0.0")
        };

        let (slow, fast) = tokio::join!(cache.ensure_fetched(&podinfo), async {
            // Let the slow download take its lock first
            tokio::time::sleep(Duration::from_millis(100)).await;
            tokio::time::timeout(Duration::from_secs(2), cache.ensure_fetched(&redis)).await
        });

        let fast = fast.expect("fetch of another chart waited on a slow download").unwrap();
        assert!(!fast.cached);
        assert!(fast.path.join("Chart.yaml").exists());
        assert!(!slow.unwrap().cached);
    }

    #[test]
    fn test_fetch_lock_per_chart_version() {
        let cache = ChartCache::new("/nonexistent", Duration::from_secs(1)).unwrap();
        let a = cache.fetch_lock("podinfo-6.0.0");
        assert!(Arc::ptr_eq(&a, &cache.fetch_lock("podinfo-6.0.0")));
        assert!(!Arc::ptr_eq(&a, &cache.fetch_lock("podinfo-6.1.0")));
        assert!(!Arc::ptr_eq(&a, &cache.fetch_lock("redis-6.0.0")));
    }

    #[tokio::test]
    async fn test_digest_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/stable/index.yaml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(index_yaml("sha256:0000")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/stable/charts/podinfo-6.0.0.tgz"))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(chart_archive("podinfo", "6.0.0")),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = ChartCache::new(dir.path(), Duration::from_secs(10)).unwrap();
        let err = cache
            .ensure_fetched(&source(&server, "6.0.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::IntegrityCheckFailed { .. }));
        assert!(!dir.path().join("podinfo-6.0.0.tgz").exists());
    }

    #[tokio::test]
    async fn test_unknown_version() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/stable/index.yaml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(index_yaml("abc")))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = ChartCache::new(dir.path(), Duration::from_secs(10)).unwrap();
        let err = cache
            .ensure_fetched(&source(&server, "7.0.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::VersionNotFound { ref version, .. } if version == "7.0.0"));
    }

    #[tokio::test]
    async fn test_missing_index_is_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/stable/index.yaml"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = ChartCache::new(dir.path(), Duration::from_secs(10)).unwrap();
        let err = cache
            .ensure_fetched(&source(&server, "6.0.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::HttpError { status: 404, .. }));
    }
}
