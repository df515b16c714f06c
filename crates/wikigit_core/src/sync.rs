use std::path::{Path, PathBuf};

use anyhow::Result;
use git2::Repository;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::archive::parse_export_file;
use crate::config::{
    Credentials, DEFAULT_DOMAIN_TEMPLATE, DEFAULT_LANGUAGE, LANGUAGE_PLACEHOLDER, WikigitConfig,
};
use crate::live::{LiveFeed, RevisionFeedApi, collect_feed};
use crate::reconcile::{ExistingHistory, reconcile};
use crate::replay::{CommitReplayer, ReplayFailure};
use crate::repository::{
    SiblingSnapshot, ensure_initialized, read_commit_log, repository_dir, reset_repository,
};
use crate::revision::{CommitCandidate, Revision, document_file_name};
use crate::runtime::normalize_for_display;

/// Everything a run needs, resolved once from flags, config and environment.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub output_root: PathBuf,
    /// Explicit language; archive runs infer one from the export when unset.
    pub language: Option<String>,
    pub domain_template: String,
    pub history_depth: usize,
    pub credentials: Option<Credentials>,
}

impl SyncSettings {
    pub fn from_config(
        config: &WikigitConfig,
        output_root: PathBuf,
        language: Option<String>,
    ) -> Self {
        Self {
            output_root,
            language: language
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            domain_template: config
                .wiki
                .domain
                .clone()
                .unwrap_or_else(|| DEFAULT_DOMAIN_TEMPLATE.to_string()),
            history_depth: config.history_depth(),
            credentials: config.credentials(),
        }
    }

    pub fn live_language(&self) -> &str {
        self.language.as_deref().unwrap_or(DEFAULT_LANGUAGE)
    }

    pub fn domain(&self, language: &str) -> String {
        self.domain_template.replace(LANGUAGE_PLACEHOLDER, language)
    }

    pub fn repository_dir(&self, language: &str) -> PathBuf {
        repository_dir(&self.output_root, &self.domain(language))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveOptions {
    /// Wipe the repository before replaying; sibling documents are carried over.
    pub replace: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Live,
    Archive,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub mode: SyncMode,
    pub repository: String,
    pub language: String,
    pub documents: Vec<String>,
    pub fetched: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub queued: usize,
    pub committed: usize,
    pub failed: Vec<ReplayFailure>,
    pub interrupted: Option<String>,
    pub resume_cursor: Option<String>,
    pub request_count: usize,
    pub siblings_restored: Vec<String>,
}

impl SyncReport {
    fn new(mode: SyncMode, repository: &Path, language: &str) -> Self {
        Self {
            mode,
            repository: normalize_for_display(repository),
            language: language.to_string(),
            documents: Vec::new(),
            fetched: 0,
            rejected: 0,
            duplicates: 0,
            queued: 0,
            committed: 0,
            failed: Vec::new(),
            interrupted: None,
            resume_cursor: None,
            request_count: 0,
            siblings_restored: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.interrupted.is_none() && self.failed.is_empty()
    }
}

/// Live run: fetch one document's history and commit whatever the repository lacks.
pub fn sync_document<A: RevisionFeedApi>(
    settings: &SyncSettings,
    title: &str,
    resume_cursor: Option<String>,
    api: &mut A,
) -> Result<SyncReport> {
    let language = settings.live_language().to_string();
    let domain = settings.domain(&language);
    let dir = settings.repository_dir(&language);
    let repo = ensure_initialized(&dir)?;
    let mut report = SyncReport::new(SyncMode::Live, &dir, &language);
    report.documents.push(title.to_string());

    if let Some(credentials) = &settings.credentials
        && let Err(error) = api.login(&credentials.username, &credentials.password)
    {
        warn!("login failed, continuing anonymously: {error:#}");
    }

    info!(document = %title, %domain, "fetching revision history");
    let collection = collect_feed(LiveFeed::resume(api, title, resume_cursor));
    report.request_count = api.request_count();
    if let Some(error) = collection.interrupted {
        if collection.revisions.is_empty() {
            return Err(error);
        }
        warn!(
            document = %title,
            retrieved = collection.revisions.len(),
            resume_cursor = collection.resume_cursor.as_deref().unwrap_or(""),
            "revision feed interrupted: {error:#}"
        );
        report.interrupted = Some(format!("{error:#}"));
        report.resume_cursor = collection.resume_cursor;
    }

    report.fetched = collection.revisions.len();
    let candidates = accept_revisions(collection.revisions, &mut report);
    let siblings = SiblingSnapshot::capture(&dir, &[document_file_name(title)])?;
    replay_new(&repo, &dir, &domain, settings, candidates, &siblings, &mut report)?;
    Ok(report)
}

/// Archive run: replay every document of an XML export in one chronological pass.
pub fn import_archive(
    settings: &SyncSettings,
    path: &Path,
    options: ArchiveOptions,
) -> Result<SyncReport> {
    let export = parse_export_file(path)?;
    let language = settings
        .language
        .clone()
        .unwrap_or_else(|| export.site.language());
    let domain = settings.domain(&language);
    let dir = settings.repository_dir(&language);
    let mut report = SyncReport::new(SyncMode::Archive, &dir, &language);
    report.documents = export
        .documents
        .iter()
        .filter(|document| !document.revisions.is_empty())
        .map(|document| document.title.clone())
        .collect();
    info!(
        archive = %path.display(),
        documents = report.documents.len(),
        revisions = export.revision_count(),
        %language,
        "parsed archive export"
    );

    let updating = report
        .documents
        .iter()
        .map(|title| document_file_name(title))
        .collect::<Vec<_>>();
    let siblings = SiblingSnapshot::capture(&dir, &updating)?;
    let repo = if options.replace {
        let repo = reset_repository(&dir)?;
        report.siblings_restored = siblings.restore_missing(&dir)?;
        info!(
            path = %dir.display(),
            restored = ?report.siblings_restored,
            "replaced repository"
        );
        repo
    } else {
        ensure_initialized(&dir)?
    };

    let revisions = export.into_revisions();
    report.fetched = revisions.len();
    let candidates = accept_revisions(revisions, &mut report);
    replay_new(&repo, &dir, &domain, settings, candidates, &siblings, &mut report)?;
    Ok(report)
}

fn accept_revisions(revisions: Vec<Revision>, report: &mut SyncReport) -> Vec<CommitCandidate> {
    let mut candidates = Vec::with_capacity(revisions.len());
    for revision in revisions {
        let document = revision.document_name.clone();
        let timestamp = revision.timestamp.clone().unwrap_or_default();
        match revision.accept() {
            Ok(candidate) => candidates.push(candidate),
            Err(reason) => {
                debug!(%document, %timestamp, "skipping revision: {reason}");
                report.rejected += 1;
            }
        }
    }
    candidates
}

fn replay_new(
    repo: &Repository,
    dir: &Path,
    domain: &str,
    settings: &SyncSettings,
    candidates: Vec<CommitCandidate>,
    siblings: &SiblingSnapshot,
    report: &mut SyncReport,
) -> Result<()> {
    let log = read_commit_log(repo, settings.history_depth)?;
    let history = ExistingHistory::from_records(&log);
    let reconciliation = reconcile(candidates, &history);
    report.duplicates = reconciliation.duplicates;
    report.queued = reconciliation.queue.len();

    if reconciliation.is_empty() {
        info!(
            repository = %dir.display(),
            fetched = report.fetched,
            "no new revisions"
        );
        return Ok(());
    }

    let restored = siblings.restore_missing(dir)?;
    if !restored.is_empty() {
        info!(restored = ?restored, "restored sibling documents");
    }
    report.siblings_restored.extend(restored);
    info!(queued = report.queued, "replaying revisions");
    let replay = CommitReplayer::new(repo, domain).replay_queue(&reconciliation.queue);
    report.committed = replay.applied.len();
    report.failed = replay.failures;
    info!(
        committed = report.committed,
        failed = report.failed.len(),
        "replay finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use git2::Repository;
    use tempfile::{TempDir, tempdir};

    use super::{ArchiveOptions, SyncMode, SyncSettings, import_archive, sync_document};
    use crate::archive::tests::FOX_AND_WOLF;
    use crate::config::{Credentials, DEFAULT_DOMAIN_TEMPLATE};
    use crate::live::tests::{MockFeedApi, live_revision};
    use crate::reconcile::HISTORY_DEPTH_LIMIT;

    const T1: &str = "2001-01-01T00:00:00Z";
    const T2: &str = "2001-01-02T00:00:00Z";
    const T3: &str = "2001-01-03T00:00:00Z";
    const T4: &str = "2001-01-04T00:00:00Z";

    fn settings(root: &TempDir) -> SyncSettings {
        SyncSettings {
            output_root: root.path().join("articles"),
            language: None,
            domain_template: DEFAULT_DOMAIN_TEMPLATE.to_string(),
            history_depth: HISTORY_DEPTH_LIMIT,
            credentials: None,
        }
    }

    fn fox_feed(extra: bool) -> MockFeedApi {
        let mut revisions = vec![
            live_revision(T1, "a", "Fox v1"),
            live_revision(T2, "b", "Fox v2"),
            live_revision(T3, "c", "Fox v3"),
        ];
        if extra {
            revisions.push(live_revision(T4, "d", "Fox v4"));
        }
        MockFeedApi::with_pages(vec![("", revisions, None)])
    }

    /// Commit messages from the root commit to HEAD.
    fn history_messages(dir: &Path) -> Vec<String> {
        let repo = Repository::open(dir).expect("open repository");
        let mut walk = repo.revwalk().expect("revwalk");
        walk.push_head().expect("push head");
        let mut messages = walk
            .map(|oid| {
                let commit = repo.find_commit(oid.expect("oid")).expect("commit");
                commit.message_raw().unwrap_or_default().to_string()
            })
            .collect::<Vec<_>>();
        messages.reverse();
        messages
    }

    fn commit_times(dir: &Path) -> Vec<i64> {
        let repo = Repository::open(dir).expect("open repository");
        let mut walk = repo.revwalk().expect("revwalk");
        walk.push_head().expect("push head");
        let mut times = walk
            .map(|oid| {
                repo.find_commit(oid.expect("oid"))
                    .expect("commit")
                    .committer()
                    .when()
                    .seconds()
            })
            .collect::<Vec<_>>();
        times.reverse();
        times
    }

    fn write_archive(root: &TempDir, xml: &str) -> std::path::PathBuf {
        let path = root.path().join("export.xml");
        fs::write(&path, xml).expect("write archive");
        path
    }

    #[test]
    fn three_revisions_become_three_chained_commits() {
        let root = tempdir().expect("tempdir");
        let settings = settings(&root);
        let mut api = fox_feed(false);

        let report = sync_document(&settings, "Fox", None, &mut api).expect("sync");
        assert_eq!(report.mode, SyncMode::Live);
        assert_eq!(report.fetched, 3);
        assert_eq!(report.committed, 3);
        assert!(report.is_success());

        let dir = settings.repository_dir("en");
        assert!(dir.ends_with("articles/en.wikipedia.org"));
        assert_eq!(history_messages(&dir), vec!["a", "b", "c"]);
        assert_eq!(fs::read_to_string(dir.join("Fox.wiki")).expect("read"), "Fox v3");

        let repo = Repository::open(&dir).expect("open");
        let head = repo.head().expect("head").peel_to_commit().expect("commit");
        assert_eq!(head.message_raw(), Some("c"));
        assert_eq!(head.parent(0).expect("parent").message_raw(), Some("b"));
        assert_eq!(head.author().email(), Some("Alice@en.wikipedia.org"));
    }

    #[test]
    fn rerun_with_one_new_revision_adds_one_commit() {
        let root = tempdir().expect("tempdir");
        let settings = settings(&root);
        sync_document(&settings, "Fox", None, &mut fox_feed(false)).expect("first run");

        let report = sync_document(&settings, "Fox", None, &mut fox_feed(true)).expect("rerun");
        assert_eq!(report.fetched, 4);
        assert_eq!(report.duplicates, 3);
        assert_eq!(report.committed, 1);
        assert_eq!(
            history_messages(&settings.repository_dir("en")),
            vec!["a", "b", "c", "d"]
        );
    }

    #[test]
    fn unchanged_source_is_idempotent() {
        let root = tempdir().expect("tempdir");
        let settings = settings(&root);
        sync_document(&settings, "Fox", None, &mut fox_feed(false)).expect("first run");

        let report = sync_document(&settings, "Fox", None, &mut fox_feed(false)).expect("rerun");
        assert_eq!(report.queued, 0);
        assert_eq!(report.committed, 0);
        assert_eq!(history_messages(&settings.repository_dir("en")).len(), 3);
    }

    #[test]
    fn identical_keys_commit_once() {
        let root = tempdir().expect("tempdir");
        let settings = settings(&root);
        let mut api = MockFeedApi::with_pages(vec![(
            "",
            vec![
                live_revision(T1, "", "first"),
                live_revision(T1, "", "same second, same empty comment"),
                live_revision(T2, "", "later"),
            ],
            None,
        )]);

        let report = sync_document(&settings, "Fox", None, &mut api).expect("sync");
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.committed, 2);
        assert_eq!(
            history_messages(&settings.repository_dir("en")),
            vec!["\n", "\n"]
        );
    }

    #[test]
    fn other_documents_survive_a_run() {
        let root = tempdir().expect("tempdir");
        let settings = settings(&root);
        let mut wolf = MockFeedApi::with_pages(vec![(
            "",
            vec![live_revision(T2, "wolf", "Wolf body\n")],
            None,
        )]);
        sync_document(&settings, "Wolf", None, &mut wolf).expect("wolf run");
        let dir = settings.repository_dir("en");
        let before = fs::read(dir.join("Wolf.wiki")).expect("read wolf");

        sync_document(&settings, "Fox", None, &mut fox_feed(false)).expect("fox run");
        assert_eq!(fs::read(dir.join("Wolf.wiki")).expect("read wolf"), before);
        assert_eq!(commit_times(&dir).len(), 4);
    }

    #[test]
    fn invalid_revisions_are_dropped_without_aborting() {
        let root = tempdir().expect("tempdir");
        let settings = settings(&root);
        let mut no_content = live_revision(T2, "hidden", "");
        no_content.texthidden = true;
        let mut api = MockFeedApi::with_pages(vec![(
            "",
            vec![
                live_revision(T1, "a", "Fox v1"),
                no_content,
                live_revision("yesterday", "bad date", "Fox ?"),
                live_revision(T3, "c", "Fox v3"),
            ],
            None,
        )]);

        let report = sync_document(&settings, "Fox", None, &mut api).expect("sync");
        assert_eq!(report.rejected, 2);
        assert_eq!(report.committed, 2);
        assert_eq!(
            history_messages(&settings.repository_dir("en")),
            vec!["a", "c"]
        );
    }

    #[test]
    fn interrupted_feed_commits_prefix_and_reports_cursor() {
        let root = tempdir().expect("tempdir");
        let settings = settings(&root);
        let mut api = MockFeedApi::with_pages(vec![(
            "",
            vec![
                live_revision(T1, "a", "Fox v1"),
                live_revision(T2, "b", "Fox v2"),
            ],
            Some("20010103000000|3"),
        )]);
        api.failing_cursors.push("20010103000000|3".to_string());

        let report = sync_document(&settings, "Fox", None, &mut api).expect("partial sync");
        assert_eq!(report.committed, 2);
        assert!(!report.is_success());
        assert_eq!(report.resume_cursor.as_deref(), Some("20010103000000|3"));
        assert!(
            report
                .interrupted
                .as_deref()
                .is_some_and(|message| message.contains("connection reset"))
        );
        assert_eq!(history_messages(&settings.repository_dir("en")), vec!["a", "b"]);
    }

    #[test]
    fn feed_failing_before_any_revision_is_fatal() {
        let root = tempdir().expect("tempdir");
        let settings = settings(&root);
        let mut api = MockFeedApi::default();
        api.failing_cursors.push(String::new());

        let error = sync_document(&settings, "Fox", None, &mut api).expect_err("must fail");
        assert!(format!("{error:#}").contains("failed to fetch revisions for Fox"));
        let repo = Repository::open(settings.repository_dir("en")).expect("open");
        assert!(repo.head().is_err());
    }

    #[test]
    fn resume_cursor_starts_mid_history() {
        let root = tempdir().expect("tempdir");
        let settings = settings(&root);
        let mut api = MockFeedApi::with_pages(vec![(
            "p2",
            vec![live_revision(T3, "c", "Fox v3")],
            None,
        )]);

        let report =
            sync_document(&settings, "Fox", Some("p2".to_string()), &mut api).expect("sync");
        assert_eq!(api.requested_cursors, vec![Some("p2".to_string())]);
        assert_eq!(report.committed, 1);
    }

    #[test]
    fn failed_login_falls_back_to_anonymous() {
        let root = tempdir().expect("tempdir");
        let mut settings = settings(&root);
        settings.credentials = Some(Credentials {
            username: "Bot@wikigit".to_string(),
            password: "wrong".to_string(),
        });
        let mut api = fox_feed(false);
        api.reject_login = true;

        let report = sync_document(&settings, "Fox", None, &mut api).expect("sync");
        assert_eq!(api.logins, 1);
        assert_eq!(report.committed, 3);
        assert_eq!(report.request_count, 2);
    }

    #[test]
    fn archive_replays_documents_in_global_time_order() {
        let root = tempdir().expect("tempdir");
        let settings = settings(&root);
        let archive = write_archive(&root, FOX_AND_WOLF);

        let report =
            import_archive(&settings, &archive, ArchiveOptions::default()).expect("import");
        assert_eq!(report.mode, SyncMode::Archive);
        assert_eq!(report.language, "en");
        assert_eq!(report.documents, vec!["Fox", "Wolf"]);
        assert_eq!(report.committed, 3);

        let dir = settings.repository_dir("en");
        assert_eq!(
            history_messages(&dir),
            vec!["fox one", "wolf one", "fox & friends"]
        );
        let times = commit_times(&dir);
        assert!(times.windows(2).all(|pair| pair[0] <= pair[1]));

        let repo = Repository::open(&dir).expect("open");
        let head = repo.head().expect("head").peel_to_commit().expect("commit");
        assert_eq!(head.author().name(), Some("192.0.2.7"));
        assert_eq!(head.author().email(), Some("192.0.2.7@en.wikipedia.org"));

        let rerun =
            import_archive(&settings, &archive, ArchiveOptions::default()).expect("reimport");
        assert_eq!(rerun.committed, 0);
        assert_eq!(rerun.duplicates, 3);
    }

    #[test]
    fn archive_language_flag_wins_over_inference() {
        let root = tempdir().expect("tempdir");
        let mut settings = settings(&root);
        settings.language = Some("fr".to_string());
        let archive = write_archive(&root, FOX_AND_WOLF);

        let report =
            import_archive(&settings, &archive, ArchiveOptions::default()).expect("import");
        assert_eq!(report.language, "fr");
        assert!(settings.repository_dir("fr").join("Fox.wiki").exists());
        assert!(!settings.repository_dir("en").exists());
    }

    #[test]
    fn archive_replace_rebuilds_history_and_keeps_siblings() {
        let root = tempdir().expect("tempdir");
        let settings = settings(&root);
        let mut bear = MockFeedApi::with_pages(vec![(
            "",
            vec![live_revision(T4, "bear", "Bear body")],
            None,
        )]);
        sync_document(&settings, "Bear", None, &mut bear).expect("bear run");
        let dir = settings.repository_dir("en");

        let archive = write_archive(&root, FOX_AND_WOLF);
        let report =
            import_archive(&settings, &archive, ArchiveOptions { replace: true }).expect("import");
        assert_eq!(report.siblings_restored, vec!["Bear.wiki"]);
        assert_eq!(
            history_messages(&dir),
            vec!["fox one", "wolf one", "fox & friends"]
        );
        assert_eq!(
            fs::read_to_string(dir.join("Bear.wiki")).expect("read bear"),
            "Bear body"
        );
    }

    #[test]
    fn malformed_archive_fails_without_touching_repository() {
        let root = tempdir().expect("tempdir");
        let settings = settings(&root);
        let archive = write_archive(&root, "<mediawiki><page><title>Fox</title>");

        let error =
            import_archive(&settings, &archive, ArchiveOptions::default()).expect_err("must fail");
        assert!(format!("{error:#}").contains("failed to parse archive"));
        assert!(!settings.output_root.exists());
    }
}
