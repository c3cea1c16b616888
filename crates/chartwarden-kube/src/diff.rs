//! Comparison of a live release against a dry-run of the desired state

use chartwarden_core::{ChartInfo, Release};
use similar::TextDiff;

/// Differences between the live release and a dry-run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseDiff {
    /// Unified diff of the supplied values
    pub values: Option<String>,
    /// Unified diff of the chart metadata
    pub chart: Option<String>,
    /// Unified diff of the rendered manifest, informational only
    pub manifest: Option<String>,
}

impl ReleaseDiff {
    /// Compare `live` with the dry-run result `desired`
    pub fn between(live: &Release, desired: &Release) -> Self {
        let values = (live.values != desired.values)
            .then(|| unified(&live.values_yaml(), &desired.values_yaml(), "values"));
        let chart = (live.chart != desired.chart)
            .then(|| unified(&chart_text(&live.chart), &chart_text(&desired.chart), "chart"));
        let manifest = (!desired.manifest.is_empty() && live.manifest != desired.manifest)
            .then(|| unified(&live.manifest, &desired.manifest, "manifest"));

        Self {
            values,
            chart,
            manifest,
        }
    }

    /// Whether an upgrade is unnecessary
    ///
    /// Only values and chart count. Rendered manifests vary between
    /// renders of the same input (generated secrets, timestamps).
    pub fn is_empty(&self) -> bool {
        self.values.is_none() && self.chart.is_none()
    }

    /// Which of values and chart differ, e.g. `values, chart`
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if self.values.is_some() {
            parts.push("values");
        }
        if self.chart.is_some() {
            parts.push("chart");
        }

        if parts.is_empty() {
            "No changes".to_string()
        } else {
            parts.join(", ")
        }
    }
}

fn chart_text(chart: &ChartInfo) -> String {
    format!(
        "name: {}\nversion: {}\nappVersion: {}\n",
        chart.name,
        chart.version,
        chart.app_version.as_deref().unwrap_or("")
    )
}

fn unified(old: &str, new: &str, what: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(&format!("live {}", what), &format!("desired {}", what))
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartwarden_core::{ReleaseStatus, Values};

    fn release(version: &str, values: &str, manifest: &str) -> Release {
        Release {
            name: "flux-app".to_string(),
            namespace: "flux".to_string(),
            revision: 1,
            status: ReleaseStatus::Deployed,
            chart: ChartInfo {
                name: "app".to_string(),
                version: version.to_string(),
                app_version: None,
            },
            values: Values::from_yaml(values).unwrap(),
            manifest: manifest.to_string(),
            updated_at: None,
        }
    }

    #[test]
    fn test_identical_releases_have_no_diff() {
        let live = release("1.0.0", "replicas: 1\n", "kind: Service\n");
        let diff = ReleaseDiff::between(&live, &live.clone());
        assert!(diff.is_empty());
        assert_eq!(diff.summary(), "No changes");
    }

    #[test]
    fn test_values_diff() {
        let live = release("1.0.0", "replicas: 1\nimage: app\n", "");
        let desired = release("1.0.0", "replicas: 2\nimage: app\n", "");

        let diff = ReleaseDiff::between(&live, &desired);
        assert!(diff.chart.is_none());
        let values = diff.values.unwrap();
        assert!(values.contains("--- live values"));
        assert!(values.contains("-replicas: 1"));
        assert!(values.contains("+replicas: 2"));
    }

    #[test]
    fn test_chart_diff() {
        let live = release("1.0.0", "", "");
        let desired = release("1.1.0", "", "");

        let diff = ReleaseDiff::between(&live, &desired);
        assert!(diff.values.is_none());
        assert!(diff.chart.unwrap().contains("+version: 1.1.0"));
        assert_eq!(
            ReleaseDiff::between(&live, &desired).summary(),
            "chart"
        );
    }

    #[test]
    fn test_manifest_diff_ignored_when_dry_run_renders_nothing() {
        let live = release("1.0.0", "", "kind: Service\n");
        let desired = release("1.0.0", "", "");
        let diff = ReleaseDiff::between(&live, &desired);
        assert!(diff.is_empty());
        assert!(diff.manifest.is_none());
    }

    #[test]
    fn test_manifest_only_diff_is_not_a_change() {
        let live = release("1.0.0", "replicas: 1\n", "password: YWJj\n");
        let desired = release("1.0.0", "replicas: 1\n", "password: eHl6\n");

        let diff = ReleaseDiff::between(&live, &desired);
        assert!(diff.is_empty());
        assert_eq!(diff.summary(), "No changes");
        assert!(diff.manifest.unwrap().contains("+password: eHl6"));
    }

    #[test]
    fn test_manifest_diff_kept_alongside_values_diff() {
        let live = release("1.0.0", "replicas: 1\n", "replicas: 1\n");
        let desired = release("1.0.0", "replicas: 2\n", "replicas: 2\n");

        let diff = ReleaseDiff::between(&live, &desired);
        assert!(!diff.is_empty());
        assert_eq!(diff.summary(), "values");
        assert!(diff.manifest.is_some());
    }
}
