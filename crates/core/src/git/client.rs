//! Local Git repository operations via `git2` and the `git` binary.
//!
//! Patches are applied with `git apply` (no three-way fallback); commits are
//! created with `git2` so the author identity never depends on user config.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use git2::{IndexAddOption, Repository, Signature};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::errors::GitError;

/// Upper bound for a single `git apply` invocation.
pub const APPLY_TIMEOUT: Duration = Duration::from_secs(60);

/// Author and committer used for pipeline commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

impl Default for CommitIdentity {
    fn default() -> Self {
        Self {
            name: "Ariadne".to_string(),
            email: "ariadne@localhost".to_string(),
        }
    }
}

/// How `git apply` is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// `--check`: report whether the patch applies, touch nothing.
    Check,
    Apply,
    /// `--reverse`: undo a previously applied patch.
    Reverse,
}

/// Result of staging and committing the working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(String),
    /// The staged tree equals HEAD's tree.
    NothingToCommit,
}

/// Git client bound to one working tree.
///
/// Only the path is held; the repository is opened per operation so the
/// client can be shared across tasks.
#[derive(Debug, Clone)]
pub struct GitClient {
    repo_path: PathBuf,
}

impl GitClient {
    /// Bind to an existing Git repository at `repo_path`.
    pub fn new<P: AsRef<Path>>(repo_path: P) -> Result<Self, GitError> {
        let path = repo_path.as_ref();
        Repository::open(path)
            .map_err(|_| GitError::RepositoryNotFound(path.display().to_string()))?;
        debug!(path = %path.display(), "git repository found");
        Ok(Self {
            repo_path: path.to_path_buf(),
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn open(&self) -> Result<Repository, GitError> {
        Repository::open(&self.repo_path)
            .map_err(|_| GitError::RepositoryNotFound(self.repo_path.display().to_string()))
    }

    /// Apply a patch file to the working tree.
    pub async fn apply_patch_file(&self, patch: &Path) -> Result<(), GitError> {
        apply_patch(&self.repo_path, patch, ApplyMode::Apply).await
    }

    /// Undo [`apply_patch_file`](Self::apply_patch_file).
    pub async fn revert_patch_file(&self, patch: &Path) -> Result<(), GitError> {
        apply_patch(&self.repo_path, patch, ApplyMode::Reverse).await
    }

    /// Stage every change (additions and deletions) and commit it.
    #[instrument(skip(self, message), fields(repo = %self.repo_path.display()))]
    pub fn commit_all(
        &self,
        message: &str,
        identity: &CommitIdentity,
    ) -> Result<CommitOutcome, GitError> {
        let repo = self.open()?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        let tree_oid = index.write_tree()?;
        let tree = repo.find_tree(tree_oid)?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(_) => None,
        };
        let unchanged = match &parent {
            Some(commit) => commit.tree_id() == tree_oid,
            None => tree.is_empty(),
        };
        if unchanged {
            info!("nothing to commit");
            return Ok(CommitOutcome::NothingToCommit);
        }

        let signature = Signature::now(&identity.name, &identity.email)?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let oid = repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;
        info!(sha = %oid, "created commit");
        Ok(CommitOutcome::Committed(oid.to_string()))
    }
}

/// Run `git apply [--check|--reverse] <patch>` inside `workdir`.
///
/// Works in plain directories too; `git apply` falls back to patch mode
/// outside a repository.
#[instrument(skip(patch), fields(workdir = %workdir.display()))]
pub async fn apply_patch(workdir: &Path, patch: &Path, mode: ApplyMode) -> Result<(), GitError> {
    let mut cmd = Command::new("git");
    cmd.current_dir(workdir).arg("apply");
    match mode {
        ApplyMode::Check => {
            cmd.arg("--check");
        }
        ApplyMode::Reverse => {
            cmd.arg("--reverse");
        }
        ApplyMode::Apply => {}
    }
    cmd.arg("--whitespace=nowarn")
        .arg(patch)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(GitError::IoError)?;
    let output = match tokio::time::timeout(APPLY_TIMEOUT, child.wait_with_output()).await {
        Ok(result) => result.map_err(GitError::IoError)?,
        Err(_) => {
            return Err(GitError::ApplyFailed(format!(
                "git apply timed out after {}s",
                APPLY_TIMEOUT.as_secs()
            )))
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        warn!(%stderr, ?mode, "git apply failed");
        return Err(GitError::ApplyFailed(stderr));
    }
    debug!(?mode, "git apply succeeded");
    Ok(())
}

/// Whether the `git` binary can be executed.
pub fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(dir: &Path) -> GitClient {
        Repository::init(dir).unwrap();
        GitClient::new(dir).unwrap()
    }

    #[test]
    fn test_commit_all_and_nothing_to_commit() {
        let dir = tempfile::tempdir().unwrap();
        let client = init_repo(dir.path());
        let identity = CommitIdentity::default();

        assert_eq!(
            client.commit_all("empty", &identity).unwrap(),
            CommitOutcome::NothingToCommit
        );

        std::fs::write(dir.path().join("hello.txt"), "hello world\n").unwrap();
        let sha = match client.commit_all("initial commit", &identity).unwrap() {
            CommitOutcome::Committed(sha) => sha,
            other => panic!("expected commit, got {:?}", other),
        };
        let repo = Repository::open(dir.path()).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(head.id().to_string(), sha);
        assert_eq!(head.author().name(), Some("Ariadne"));
        assert_eq!(head.author().email(), Some("ariadne@localhost"));

        assert_eq!(
            client.commit_all("again", &identity).unwrap(),
            CommitOutcome::NothingToCommit
        );
    }

    #[test]
    fn test_commit_all_stages_deletions() {
        let dir = tempfile::tempdir().unwrap();
        let client = init_repo(dir.path());
        let identity = CommitIdentity::default();
        std::fs::write(dir.path().join("a.txt"), "a\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), "b\n").unwrap();
        client.commit_all("init", &identity).unwrap();

        std::fs::remove_file(dir.path().join("b.txt")).unwrap();
        assert!(matches!(
            client.commit_all("remove b", &identity).unwrap(),
            CommitOutcome::Committed(_)
        ));

        let repo = Repository::open(dir.path()).unwrap();
        let tree = repo.head().unwrap().peel_to_tree().unwrap();
        assert!(tree.get_name("a.txt").is_some());
        assert!(tree.get_name("b.txt").is_none());
    }

    #[test]
    fn test_repo_not_found() {
        assert!(matches!(
            GitClient::new("/nonexistent/ariadne-repo"),
            Err(GitError::RepositoryNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_apply_patch_check_and_apply() {
        if !git_available() {
            eprintln!("skipping: git binary not found");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "one\ntwo\n").unwrap();
        let patch = dir.path().join("change.diff");
        std::fs::write(
            &patch,
            concat!(
                "diff --git a/f.txt b/f.txt\n--- a/f.txt\n+++ b/f.txt\n@@ -1,2 +1,2 @@\n",
                " one\n-two\n+TWO\n",
            ),
        )
        .unwrap();

        apply_patch(dir.path(), &patch, ApplyMode::Check).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("f.txt")).unwrap(), "one\ntwo\n");

        apply_patch(dir.path(), &patch, ApplyMode::Apply).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("f.txt")).unwrap(), "one\nTWO\n");

        // Applying again no longer matches.
        let err = apply_patch(dir.path(), &patch, ApplyMode::Check).await.unwrap_err();
        assert!(matches!(err, GitError::ApplyFailed(_)));

        apply_patch(dir.path(), &patch, ApplyMode::Reverse).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("f.txt")).unwrap(), "one\ntwo\n");
    }
}
