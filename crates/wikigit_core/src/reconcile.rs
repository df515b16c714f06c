use std::collections::HashSet;

use crate::revision::CommitCandidate;

/// Default number of commits read back from HEAD when building the dedup set.
pub const HISTORY_DEPTH_LIMIT: usize = 10_000;

/// A commit already present in the repository, as read back from git.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub timestamp: i64,
    pub message: String,
}

/// Dedup identity of a commit: committer time in epoch seconds plus the raw message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitKey {
    pub timestamp: i64,
    pub message: String,
}

impl CommitKey {
    pub fn for_candidate(candidate: &CommitCandidate) -> Self {
        Self {
            timestamp: candidate.epoch_seconds(),
            message: candidate.message.clone(),
        }
    }
}

impl From<&CommitRecord> for CommitKey {
    fn from(record: &CommitRecord) -> Self {
        Self {
            timestamp: record.timestamp,
            message: record.message.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExistingHistory {
    keys: HashSet<CommitKey>,
}

impl ExistingHistory {
    pub fn from_records(records: &[CommitRecord]) -> Self {
        Self {
            keys: records.iter().map(CommitKey::from).collect(),
        }
    }

    pub fn contains(&self, key: &CommitKey) -> bool {
        self.keys.contains(key)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    /// New candidates, oldest first.
    pub queue: Vec<CommitCandidate>,
    pub duplicates: usize,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Keep candidates whose key is neither in `history` nor already accepted from this
/// batch, then order them by timestamp. Equal timestamps keep their input order.
pub fn reconcile(candidates: Vec<CommitCandidate>, history: &ExistingHistory) -> Reconciliation {
    let mut accepted = HashSet::new();
    let mut queue = Vec::with_capacity(candidates.len());
    let mut duplicates = 0;

    for candidate in candidates {
        let key = CommitKey::for_candidate(&candidate);
        if history.contains(&key) || accepted.contains(&key) {
            duplicates += 1;
            continue;
        }
        accepted.insert(key);
        queue.push(candidate);
    }

    queue.sort_by_key(|candidate| candidate.timestamp);
    Reconciliation { queue, duplicates }
}
