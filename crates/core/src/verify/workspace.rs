//! Throwaway copies of the repository with one patch applied.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

use crate::errors::PipelineError;
use crate::git::{self, ApplyMode};

/// Scratch directory holding `repo/` (the copy) and `changes.diff`.
///
/// Removed when dropped, on every path out of verification.
#[derive(Debug)]
pub struct ScratchWorkspace {
    dir: TempDir,
    repo: PathBuf,
}

impl ScratchWorkspace {
    /// Copy `source` (minus `exclude` globs) and apply `patch` to the copy.
    ///
    /// Any failure, including a patch that does not apply cleanly, is a
    /// [`PipelineError::WorkspaceSetup`].
    pub async fn prepare(
        source: &Path,
        exclude: &[String],
        patch: &str,
    ) -> Result<Self, PipelineError> {
        let setup = |detail: String| PipelineError::WorkspaceSetup(detail);

        let dir = tempfile::Builder::new()
            .prefix("ariadne-verify-")
            .tempdir()
            .map_err(|e| setup(format!("cannot create scratch directory: {}", e)))?;
        let repo = dir.path().join("repo");

        copy_tree(source, &repo, exclude)
            .map_err(|e| setup(format!("cannot copy {}: {}", source.display(), e)))?;

        let patch_file = dir.path().join("changes.diff");
        fs::write(&patch_file, patch).map_err(|e| setup(format!("cannot write patch: {}", e)))?;

        git::apply_patch(&repo, &patch_file, ApplyMode::Check)
            .await
            .map_err(|e| setup(format!("patch does not apply: {}", e)))?;
        git::apply_patch(&repo, &patch_file, ApplyMode::Apply)
            .await
            .map_err(|e| setup(format!("patch failed to apply: {}", e)))?;

        debug!(path = %repo.display(), "scratch workspace ready");
        Ok(Self { dir, repo })
    }

    /// Root of the patched copy.
    pub fn repo(&self) -> &Path {
        &self.repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Whether `rel` (forward-slash relative path) or its file name matches one
/// of the exclude globs.
pub fn is_excluded(rel: &str, name: &str, exclude: &[String]) -> bool {
    exclude.iter().any(|pattern| {
        glob_match::glob_match(pattern, name) || glob_match::glob_match(pattern, rel)
    })
}

/// Recursively copy `src` into `dst`, skipping excluded entries.
pub fn copy_tree(src: &Path, dst: &Path, exclude: &[String]) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    copy_dir(src, dst, "", exclude)
}

fn copy_dir(src: &Path, dst: &Path, prefix: &str, exclude: &[String]) -> io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", prefix, name)
        };
        if is_excluded(&rel, &name, exclude) {
            continue;
        }

        let from = entry.path();
        let to = dst.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            fs::create_dir_all(&to)?;
            copy_dir(&from, &to, &rel, exclude)?;
        } else if file_type.is_symlink() {
            copy_symlink(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    let target = fs::read_link(from)?;
    std::os::unix::fs::symlink(target, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    if from.is_file() {
        fs::copy(from, to)?;
    }
    Ok(())
}

/// Every file under `root` as a forward-slash relative path, sorted.
pub fn list_files(root: &Path, exclude: &[String]) -> io::Result<Vec<String>> {
    let mut files = Vec::new();
    collect_files(root, "", exclude, &mut files)?;
    files.sort();
    Ok(files)
}

fn collect_files(
    dir: &Path,
    prefix: &str,
    exclude: &[String],
    out: &mut Vec<String>,
) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", prefix, name)
        };
        if is_excluded(&rel, &name, exclude) {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&entry.path(), &rel, exclude, out)?;
        } else {
            out.push(rel);
        }
    }
    Ok(())
}
