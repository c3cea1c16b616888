//! Git operations on a local mirror
//!
//! Everything shells out to the `git` executable with a per-call timeout.
//! Prompts are disabled so an unauthenticated remote fails instead of hanging.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use tempfile::TempDir;
use tokio::process::Command;

use crate::error::{Result, SourceError};

/// A bare mirror clone on local disk
#[derive(Debug, Clone)]
pub struct GitRepo {
    dir: PathBuf,
    timeout: Duration,
}

/// A checked-out working copy of a mirror at one commit
///
/// The directory is removed when the export is dropped, so holders keep it
/// alive by keeping the value (usually behind an `Arc`).
#[derive(Debug)]
pub struct Export {
    dir: TempDir,
    commit: String,
}

impl Export {
    /// Take ownership of an already populated directory
    pub fn adopt(dir: TempDir, commit: impl Into<String>) -> Self {
        Self {
            dir,
            commit: commit.into(),
        }
    }

    /// Root of the working copy
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Commit the working copy is checked out at
    pub fn commit(&self) -> &str {
        &self.commit
    }
}

impl GitRepo {
    /// Handle on an existing mirror directory
    pub fn open(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            timeout,
        }
    }

    /// Create a mirror of `remote` in `dir`
    pub async fn clone_mirror(remote: &str, dir: &Path, timeout: Duration) -> Result<Self> {
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let target = dir.to_string_lossy();
        run_git(
            None,
            &["clone", "--mirror", "--quiet", remote, target.as_ref()],
            timeout,
        )
        .await?;
        Ok(Self::open(dir, timeout))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fetch all refs from upstream, pruning deleted ones
    pub async fn fetch(&self) -> Result<()> {
        self.git(&["fetch", "--prune", "--quiet", "origin"]).await?;
        Ok(())
    }

    /// Every ref with its target, one per line; changes whenever upstream moved
    pub async fn refs_fingerprint(&self) -> Result<String> {
        self.git(&["for-each-ref", "--format=%(objectname) %(refname)"])
            .await
    }

    /// Resolve a branch, tag or commit to a full commit hash
    pub async fn revision(&self, git_ref: &str) -> Result<String> {
        let spec = format!("{}^{{commit}}", git_ref);
        let out = self.git(&["rev-parse", "--verify", "--quiet", &spec]).await?;
        Ok(out.trim().to_string())
    }

    /// Commits reachable from `to` but not `from` that touch `path`
    pub async fn commits_between(&self, from: &str, to: &str, path: &str) -> Result<Vec<String>> {
        let range = format!("{}..{}", from, to);
        let path = normalize_path(path);
        let out = self.git(&["rev-list", &range, "--", path]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Whether `commit` is reachable from `of` (a commit is its own ancestor)
    pub async fn is_ancestor(&self, commit: &str, of: &str) -> Result<bool> {
        let range = format!("{}..{}", of, commit);
        let out = self.git(&["rev-list", "--count", &range]).await?;
        Ok(out.trim() == "0")
    }

    /// Check out `commit` into a fresh temporary directory
    pub async fn export(&self, commit: &str) -> Result<Export> {
        let dir = tempfile::Builder::new()
            .prefix("chartwarden-export-")
            .tempdir()?;
        let source = self.dir.to_string_lossy();
        let target = dir.path().to_string_lossy();
        run_git(
            None,
            &["clone", "--quiet", "--no-checkout", source.as_ref(), target.as_ref()],
            self.timeout,
        )
        .await?;
        run_git(
            Some(dir.path()),
            &["checkout", "--quiet", "--detach", commit],
            self.timeout,
        )
        .await?;

        Ok(Export {
            dir,
            commit: commit.to_string(),
        })
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        run_git(Some(&self.dir), args, self.timeout).await
    }
}

/// Strip leading `./` and `/` so the path is relative to the repository root
fn normalize_path(path: &str) -> &str {
    let trimmed = path.trim().trim_start_matches("./").trim_start_matches('/');
    if trimmed.is_empty() { "." } else { trimmed }
}

async fn run_git(cwd: Option<&Path>, args: &[&str], timeout: Duration) -> Result<String> {
    let command = args.first().copied().unwrap_or("git").to_string();

    let mut cmd = Command::new("git");
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(output) => output.map_err(|e| SourceError::Git {
            command: command.clone(),
            message: e.to_string(),
        })?,
        Err(_) => {
            return Err(SourceError::Timeout {
                command,
                seconds: timeout.as_secs(),
            });
        }
    };

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(SourceError::Git {
            command,
            message: format_git_error(&output),
        })
    }
}

/// Formats a git error with both stdout and stderr
fn format_git_error(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

    match (stderr.is_empty(), stdout.is_empty()) {
        (true, true) => format!(
            "command failed with exit code {}",
            output.status.code().unwrap_or(-1)
        ),
        (true, false) => stdout,
        (false, true) => stderr,
        (false, false) => format!("{}\n{}", stderr, stdout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testutil::Upstream;

    const TIMEOUT: Duration = Duration::from_secs(20);

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("./charts/app"), "charts/app");
        assert_eq!(normalize_path("/charts/app"), "charts/app");
        assert_eq!(normalize_path(""), ".");
        assert_eq!(normalize_path("./"), ".");
    }

    #[tokio::test]
    async fn test_mirror_revision_and_export() {
        let Some(upstream) = Upstream::new() else {
            return;
        };
        upstream.commit_file("charts/app/Chart.yaml", "name: app\nversion: 0.1.0\n");
        let head = upstream.head();

        let dir = tempfile::tempdir().unwrap();
        let mirror_dir = dir.path().join("mirror");
        let repo = GitRepo::clone_mirror(&upstream.url(), &mirror_dir, TIMEOUT)
            .await
            .unwrap();

        assert_eq!(repo.revision("master").await.unwrap(), head);
        assert!(repo.revision("does-not-exist").await.is_err());

        let export = repo.export(&head).await.unwrap();
        let chart = std::fs::read_to_string(export.dir().join("charts/app/Chart.yaml")).unwrap();
        assert!(chart.contains("name: app"));
        assert_eq!(export.commit(), head);

        let export_dir = export.dir().to_path_buf();
        drop(export);
        assert!(!export_dir.exists());
    }

    #[tokio::test]
    async fn test_is_ancestor() {
        let Some(upstream) = Upstream::new() else {
            return;
        };
        upstream.commit_file("charts/app/Chart.yaml", "name: app\nversion: 0.1.0\n");
        let older = upstream.head();
        upstream.commit_file("charts/app/values.yaml", "replicas: 2\n");
        let newer = upstream.head();

        let dir = tempfile::tempdir().unwrap();
        let repo = GitRepo::clone_mirror(&upstream.url(), &dir.path().join("mirror"), TIMEOUT)
            .await
            .unwrap();

        assert!(repo.is_ancestor(&older, &newer).await.unwrap());
        assert!(repo.is_ancestor(&newer, &newer).await.unwrap());
        assert!(!repo.is_ancestor(&newer, &older).await.unwrap());
    }

    #[tokio::test]
    async fn test_commits_between_filters_by_path() {
        let Some(upstream) = Upstream::new() else {
            return;
        };
        upstream.commit_file("charts/app/values.yaml", "replicas: 1\n");
        let first = upstream.head();

        let dir = tempfile::tempdir().unwrap();
        let repo = GitRepo::clone_mirror(&upstream.url(), &dir.path().join("m"), TIMEOUT)
            .await
            .unwrap();

        upstream.commit_file("docs/README.md", "docs\n");
        repo.fetch().await.unwrap();
        let second = repo.revision("master").await.unwrap();
        assert!(
            repo.commits_between(&first, &second, "charts/app")
                .await
                .unwrap()
                .is_empty()
        );

        upstream.commit_file("charts/app/values.yaml", "replicas: 2\n");
        repo.fetch().await.unwrap();
        let third = repo.revision("master").await.unwrap();
        let commits = repo
            .commits_between(&first, &third, "./charts/app")
            .await
            .unwrap();
        assert_eq!(commits, vec![third]);
    }

    #[tokio::test]
    async fn test_refs_fingerprint_tracks_upstream() {
        let Some(upstream) = Upstream::new() else {
            return;
        };
        upstream.commit_file("a.txt", "a\n");

        let dir = tempfile::tempdir().unwrap();
        let repo = GitRepo::clone_mirror(&upstream.url(), &dir.path().join("m"), TIMEOUT)
            .await
            .unwrap();
        let before = repo.refs_fingerprint().await.unwrap();

        repo.fetch().await.unwrap();
        assert_eq!(repo.refs_fingerprint().await.unwrap(), before);

        upstream.commit_file("a.txt", "b\n");
        repo.fetch().await.unwrap();
        assert_ne!(repo.refs_fingerprint().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_clone_of_missing_remote_fails() {
        if !crate::git::testutil::git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = GitRepo::clone_mirror(
            &missing.to_string_lossy(),
            &dir.path().join("m"),
            TIMEOUT,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SourceError::Git { ref command, .. } if command == "clone"));
    }
}
