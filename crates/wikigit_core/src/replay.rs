use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use git2::{Commit, ErrorCode, Oid, Repository, Signature, Time};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::revision::{CommitCandidate, DELETED_USER};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayFailure {
    pub document: String,
    pub timestamp: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct ReplayReport {
    pub applied: Vec<Oid>,
    pub failures: Vec<ReplayFailure>,
}

/// Turns commit candidates into commits on HEAD, one file write and one commit each.
pub struct CommitReplayer<'r> {
    repo: &'r Repository,
    email_domain: String,
}

impl<'r> CommitReplayer<'r> {
    pub fn new(repo: &'r Repository, email_domain: &str) -> Self {
        Self {
            repo,
            email_domain: email_domain.to_string(),
        }
    }

    /// Apply the queue in order. A failed candidate is recorded and skipped.
    pub fn replay_queue(&self, queue: &[CommitCandidate]) -> ReplayReport {
        let mut report = ReplayReport::default();
        for candidate in queue {
            match self.apply(candidate) {
                Ok(oid) => report.applied.push(oid),
                Err(failure) => {
                    error!(
                        document = %candidate.document_name,
                        timestamp = %candidate.timestamp.to_rfc3339(),
                        "failed to commit revision: {failure:#}"
                    );
                    report.failures.push(ReplayFailure {
                        document: candidate.document_name.clone(),
                        timestamp: candidate.timestamp.to_rfc3339(),
                        error: format!("{failure:#}"),
                    });
                }
            }
        }
        report
    }

    /// Commit one candidate. On failure the index and the document file are put back
    /// to their state before the call, so nothing leaks into the next commit.
    pub fn apply(&self, candidate: &CommitCandidate) -> Result<Oid> {
        let workdir = self
            .repo
            .workdir()
            .context("repository has no working directory")?;
        let file_name = candidate.file_name();
        let path = workdir.join(&file_name);
        let previous = if path.is_file() {
            Some(fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?)
        } else {
            None
        };
        fs::write(&path, &candidate.content)
            .with_context(|| format!("failed to write {}", path.display()))?;

        self.commit_file(&file_name, candidate).inspect_err(|_| {
            if let Err(rollback) = self.roll_back(&path, previous.as_deref()) {
                warn!(
                    document = %candidate.document_name,
                    "failed to roll back after commit error: {rollback:#}"
                );
            }
        })
    }

    fn commit_file(&self, file_name: &str, candidate: &CommitCandidate) -> Result<Oid> {
        let mut index = self.repo.index().context("failed to open index")?;
        index
            .add_path(Path::new(file_name))
            .with_context(|| format!("failed to stage {file_name}"))?;
        let tree_oid = index.write_tree().context("failed to write tree")?;
        let tree = self.repo.find_tree(tree_oid)?;

        let name = signature_name(&candidate.author);
        let email = format!("{name}@{}", self.email_domain);
        let signature = Signature::new(&name, &email, &Time::new(candidate.epoch_seconds(), 0))
            .with_context(|| format!("invalid signature for author {name}"))?;

        let parent = self.head_commit()?;
        let parents = parent.iter().collect::<Vec<_>>();
        let oid = self
            .repo
            .commit(
                Some("HEAD"),
                &signature,
                &signature,
                &candidate.message,
                &tree,
                &parents,
            )
            .with_context(|| format!("failed to commit {file_name}"))?;
        // Persist the staged entry only once HEAD points at a commit containing it.
        index.write().context("failed to write index")?;

        debug!(
            document = %candidate.document_name,
            commit = %oid,
            author = %name,
            "committed revision"
        );
        Ok(oid)
    }

    /// Reset the index to HEAD and put the document file back as it was.
    fn roll_back(&self, path: &Path, previous: Option<&[u8]>) -> Result<()> {
        let mut index = self.repo.index().context("failed to open index")?;
        match self.head_commit()? {
            Some(head) => index
                .read_tree(&head.tree().context("failed to read HEAD tree")?)
                .context("failed to reset index to HEAD")?,
            None => index.clear().context("failed to clear index")?,
        }
        index.write().context("failed to write index")?;

        match previous {
            Some(content) => fs::write(path, content)
                .with_context(|| format!("failed to restore {}", path.display()))?,
            None if path.is_file() => fs::remove_file(path)
                .with_context(|| format!("failed to remove {}", path.display()))?,
            None => {}
        }
        Ok(())
    }

    fn head_commit(&self) -> Result<Option<Commit<'r>>> {
        match self.repo.head() {
            Ok(head) => Ok(Some(
                head.peel_to_commit().context("HEAD does not point to a commit")?,
            )),
            Err(error) if matches!(error.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
                Ok(None)
            }
            Err(error) => Err(error).context("failed to resolve HEAD"),
        }
    }
}

/// git refuses angle brackets in identities.
fn signature_name(author: &str) -> String {
    let cleaned = author
        .chars()
        .filter(|ch| !matches!(ch, '<' | '>'))
        .collect::<String>();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        DELETED_USER.to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    use super::{CommitReplayer, signature_name};
    use crate::repository::ensure_initialized;
    use crate::revision::{CommitCandidate, DELETED_USER};

    fn candidate(document: &str, seconds: i64, author: &str, message: &str) -> CommitCandidate {
        CommitCandidate {
            document_name: document.to_string(),
            timestamp: Utc.timestamp_opt(seconds, 0).single().expect("timestamp"),
            author: author.to_string(),
            message: message.to_string(),
            content: format!("{document} body at {seconds}"),
        }
    }

    #[test]
    fn commits_chain_on_head_with_revision_metadata() {
        let temp = tempdir().expect("tempdir");
        let repo = ensure_initialized(temp.path()).expect("initialize");
        let replayer = CommitReplayer::new(&repo, "en.wikipedia.org");

        let report = replayer.replay_queue(&[
            candidate("Fox", 978_307_200, "Alice", "a"),
            candidate("Fox", 978_393_600, "Bob", "b"),
        ]);
        assert_eq!(report.applied.len(), 2);
        assert!(report.failures.is_empty());

        let head = repo
            .head()
            .expect("head")
            .peel_to_commit()
            .expect("head commit");
        assert_eq!(head.id(), report.applied[1]);
        assert_eq!(head.message_raw(), Some("b"));
        assert_eq!(head.author().name(), Some("Bob"));
        assert_eq!(head.author().email(), Some("Bob@en.wikipedia.org"));
        assert_eq!(head.committer().when().seconds(), 978_393_600);
        assert_eq!(head.committer().when().offset_minutes(), 0);
        assert_eq!(head.parent_count(), 1);
        assert_eq!(head.parent(0).expect("parent").id(), report.applied[0]);
        assert_eq!(
            fs::read_to_string(temp.path().join("Fox.wiki")).expect("read"),
            "Fox body at 978393600"
        );
    }

    #[test]
    fn commit_touches_only_the_document_file() {
        let temp = tempdir().expect("tempdir");
        let repo = ensure_initialized(temp.path()).expect("initialize");
        let replayer = CommitReplayer::new(&repo, "en.wikipedia.org");
        replayer
            .apply(&candidate("Wolf", 100, "Alice", "wolf"))
            .expect("apply wolf");
        replayer
            .apply(&candidate("AC/DC", 200, "Alice", "band"))
            .expect("apply band");

        let head = repo
            .head()
            .expect("head")
            .peel_to_commit()
            .expect("head commit");
        let tree = head.tree().expect("tree");
        let names = tree
            .iter()
            .filter_map(|entry| entry.name().map(ToString::to_string))
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["AC_DC.wiki", "Wolf.wiki"]);
    }

    #[test]
    fn failed_candidate_is_recorded_and_loop_continues() {
        let temp = tempdir().expect("tempdir");
        let repo = ensure_initialized(temp.path()).expect("initialize");
        fs::create_dir_all(temp.path().join("Blocked.wiki")).expect("block path");
        let replayer = CommitReplayer::new(&repo, "en.wikipedia.org");

        let report = replayer.replay_queue(&[
            candidate("Fox", 100, "Alice", "a"),
            candidate("Blocked", 200, "Alice", "x"),
            candidate("Fox", 300, "Alice", "c"),
        ]);
        assert_eq!(report.applied.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].document, "Blocked");

        let head = repo
            .head()
            .expect("head")
            .peel_to_commit()
            .expect("head commit");
        assert_eq!(head.message_raw(), Some("c"));
        assert_eq!(head.parent(0).expect("parent").message_raw(), Some("a"));
    }

    #[test]
    fn signature_names_drop_angle_brackets() {
        assert_eq!(signature_name("<script>"), "script");
        assert_eq!(signature_name("<>"), DELETED_USER);
        assert_eq!(signature_name("192.0.2.7"), "192.0.2.7");
    }

    #[test]
    fn failed_commit_leaves_nothing_for_the_next_one() {
        let temp = tempdir().expect("tempdir");
        let repo = ensure_initialized(temp.path()).expect("initialize");
        let replayer = CommitReplayer::new(&repo, "en.wikipedia.org");

        let report = replayer.replay_queue(&[
            candidate("Wolf", 100, "Alice", "bad\0message"),
            candidate("Fox", 200, "Alice", "fox"),
        ]);
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].document, "Wolf");

        let head = repo
            .head()
            .expect("head")
            .peel_to_commit()
            .expect("head commit");
        let names = head
            .tree()
            .expect("tree")
            .iter()
            .filter_map(|entry| entry.name().map(ToString::to_string))
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["Fox.wiki"]);
        assert!(!temp.path().join("Wolf.wiki").exists());
        assert_eq!(repo.index().expect("index").len(), 1);
    }

    #[test]
    fn failed_commit_restores_previous_document_content() {
        let temp = tempdir().expect("tempdir");
        let repo = ensure_initialized(temp.path()).expect("initialize");
        let replayer = CommitReplayer::new(&repo, "en.wikipedia.org");
        replayer
            .apply(&candidate("Fox", 100, "Alice", "a"))
            .expect("apply first");

        replayer
            .apply(&candidate("Fox", 200, "Alice", "bad\0message"))
            .expect_err("nul byte in message");
        assert_eq!(
            fs::read_to_string(temp.path().join("Fox.wiki")).expect("read"),
            "Fox body at 100"
        );

        let next = replayer
            .apply(&candidate("Fox", 300, "Bob", "c"))
            .expect("apply third");
        let head = repo.find_commit(next).expect("commit");
        assert_eq!(head.parent(0).expect("parent").message_raw(), Some("a"));
        let parent_tree = head.parent(0).expect("parent").tree().expect("parent tree");
        let diff = repo
            .diff_tree_to_tree(Some(&parent_tree), Some(&head.tree().expect("tree")), None)
            .expect("diff");
        assert_eq!(diff.deltas().count(), 1);
    }
}
