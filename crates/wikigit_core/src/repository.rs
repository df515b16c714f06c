use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use git2::{ErrorCode, Repository};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::reconcile::CommitRecord;
use crate::revision::DOCUMENT_EXTENSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryState {
    Absent,
    /// Directory exists but holds no git metadata.
    Uninitialized,
    Initialized,
}

impl RepositoryState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
        }
    }
}

pub fn repository_dir(output_root: &Path, domain: &str) -> PathBuf {
    output_root.join(domain)
}

pub fn repository_state(dir: &Path) -> RepositoryState {
    if !dir.is_dir() {
        return RepositoryState::Absent;
    }
    // `open` does not walk up into parent repositories.
    if Repository::open(dir).is_ok() {
        RepositoryState::Initialized
    } else {
        RepositoryState::Uninitialized
    }
}

/// Bring `dir` to the initialized state and open it. Existing files are left alone.
pub fn ensure_initialized(dir: &Path) -> Result<Repository> {
    let state = repository_state(dir);
    match state {
        RepositoryState::Initialized => Repository::open(dir)
            .with_context(|| format!("failed to open repository {}", dir.display())),
        RepositoryState::Absent | RepositoryState::Uninitialized => {
            if state == RepositoryState::Absent {
                fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
            let repo = Repository::init(dir)
                .with_context(|| format!("failed to initialize repository {}", dir.display()))?;
            info!(path = %dir.display(), from = state.as_str(), "initialized repository");
            Ok(repo)
        }
    }
}

/// Remove the repository directory entirely and start over with an empty repository.
pub fn reset_repository(dir: &Path) -> Result<Repository> {
    if dir.exists() {
        fs::remove_dir_all(dir)
            .with_context(|| format!("failed to remove {}", dir.display()))?;
    }
    ensure_initialized(dir)
}

/// Committer time and raw message of up to `depth` commits reachable from HEAD.
pub fn read_commit_log(repo: &Repository, depth: usize) -> Result<Vec<CommitRecord>> {
    match repo.head() {
        Ok(_) => {}
        Err(error) if matches!(error.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
            return Ok(Vec::new());
        }
        Err(error) => return Err(error).context("failed to resolve HEAD"),
    }

    let mut walk = repo.revwalk().context("failed to start revision walk")?;
    walk.push_head().context("failed to walk from HEAD")?;

    let mut records = Vec::new();
    for oid in walk.take(depth) {
        let oid = oid.context("failed to walk commit history")?;
        let commit = repo
            .find_commit(oid)
            .with_context(|| format!("failed to read commit {oid}"))?;
        records.push(CommitRecord {
            timestamp: commit.committer().when().seconds(),
            message: String::from_utf8_lossy(commit.message_raw_bytes()).into_owned(),
        });
    }
    debug!(commits = records.len(), depth, "read commit log");
    Ok(records)
}

/// Contents of the root-level document files a run is not going to update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiblingSnapshot {
    files: Vec<(String, Vec<u8>)>,
}

impl SiblingSnapshot {
    pub fn capture(dir: &Path, updating: &[String]) -> Result<Self> {
        if !dir.is_dir() {
            return Ok(Self::default());
        }

        let suffix = format!(".{DOCUMENT_EXTENSION}");
        let mut files = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
            let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if name == suffix || !name.ends_with(&suffix) {
                continue;
            }
            if updating.iter().any(|updated| updated == name) {
                continue;
            }
            let content = fs::read(entry.path())
                .with_context(|| format!("failed to read {}", entry.path().display()))?;
            files.push((name.to_string(), content));
        }
        debug!(siblings = files.len(), "captured sibling documents");
        Ok(Self { files })
    }

    /// Write back every captured file that no longer exists and return their names.
    /// Present files are untouched.
    pub fn restore_missing(&self, dir: &Path) -> Result<Vec<String>> {
        let mut restored = Vec::new();
        for (name, content) in &self.files {
            let path = dir.join(name);
            if path.exists() {
                continue;
            }
            fs::write(&path, content)
                .with_context(|| format!("failed to restore {}", path.display()))?;
            debug!(file = %name, "restored sibling document");
            restored.push(name.clone());
        }
        Ok(restored)
    }
}
