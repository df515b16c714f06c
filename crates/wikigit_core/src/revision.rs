use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::archive::ArchiveRevision;
use crate::live::LiveRevision;

pub const COMMIT_MESSAGE_LENGTH: usize = 100;
pub const DELETED_USER: &str = "[Deleted user]";
pub const DOCUMENT_EXTENSION: &str = "wiki";

const RESERVED_FILENAME_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// A revision record as delivered by one of the two feeds, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRevision {
    Live(LiveRevision),
    Archive(ArchiveRevision),
}

/// Canonical revision shared by both feeds. Produced fresh per run, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub document_name: String,
    pub timestamp: Option<String>,
    pub author: String,
    pub comment: Option<String>,
    pub content: Option<String>,
}

/// A revision that passed validation and can be replayed as a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitCandidate {
    pub document_name: String,
    pub timestamp: DateTime<Utc>,
    pub author: String,
    pub message: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionRejection {
    MissingTimestamp,
    InvalidTimestamp(String),
    MissingContent,
}

impl fmt::Display for RevisionRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingTimestamp => write!(f, "no date for this revision"),
            Self::InvalidTimestamp(value) => write!(f, "unparseable revision date `{value}`"),
            Self::MissingContent => write!(f, "no valid content for this revision"),
        }
    }
}

impl Revision {
    pub fn from_source(document_name: &str, source: SourceRevision) -> Self {
        match source {
            SourceRevision::Live(revision) => Self::from_live(document_name, revision),
            SourceRevision::Archive(revision) => Self::from_archive(document_name, revision),
        }
    }

    pub fn from_live(document_name: &str, revision: LiveRevision) -> Self {
        let author = if revision.userhidden {
            None
        } else {
            revision.user
        };
        let comment = if revision.commenthidden {
            None
        } else {
            revision.comment
        };
        let slot_content = revision.slots.and_then(|slots| slots.main).and_then(|main| {
            if main.texthidden {
                None
            } else {
                main.content.or(main.legacy_content)
            }
        });
        let content = if revision.texthidden {
            None
        } else {
            slot_content.or(revision.legacy_content)
        };

        Self {
            document_name: document_name.to_string(),
            timestamp: revision.timestamp,
            author: author_or_sentinel(author),
            comment,
            content,
        }
    }

    pub fn from_archive(document_name: &str, revision: ArchiveRevision) -> Self {
        let author = revision
            .contributor
            .and_then(|contributor| contributor.username.or(contributor.ip));
        Self {
            document_name: document_name.to_string(),
            timestamp: revision.timestamp,
            author: author_or_sentinel(author),
            comment: revision.comment,
            content: revision.text,
        }
    }

    /// Enforce the committable invariant: a parseable instant and non-empty content.
    pub fn accept(self) -> Result<CommitCandidate, RevisionRejection> {
        let raw_timestamp = match self.timestamp.as_deref().map(str::trim) {
            Some(value) if !value.is_empty() => value,
            _ => return Err(RevisionRejection::MissingTimestamp),
        };
        let timestamp = parse_timestamp(raw_timestamp)
            .ok_or_else(|| RevisionRejection::InvalidTimestamp(raw_timestamp.to_string()))?;
        let content = match self.content {
            Some(content) if !content.is_empty() => content,
            _ => return Err(RevisionRejection::MissingContent),
        };

        Ok(CommitCandidate {
            message: commit_message(self.comment.as_deref()),
            document_name: self.document_name,
            timestamp,
            author: self.author,
            content,
        })
    }
}

impl CommitCandidate {
    pub fn epoch_seconds(&self) -> i64 {
        self.timestamp.timestamp()
    }

    pub fn file_name(&self) -> String {
        document_file_name(&self.document_name)
    }
}

/// Parse a wiki timestamp. RFC 3339 first; naive forms are read as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// First `COMMIT_MESSAGE_LENGTH` characters of the comment, or a lone newline.
pub fn commit_message(comment: Option<&str>) -> String {
    let truncated = comment
        .unwrap_or("")
        .chars()
        .take(COMMIT_MESSAGE_LENGTH)
        .collect::<String>();
    if truncated.is_empty() {
        "\n".to_string()
    } else {
        truncated
    }
}

pub fn sanitize_document_name(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if RESERVED_FILENAME_CHARS.contains(&ch) {
                '_'
            } else {
                ch
            }
        })
        .collect()
}

pub fn document_file_name(name: &str) -> String {
    format!("{}.{DOCUMENT_EXTENSION}", sanitize_document_name(name))
}

fn author_or_sentinel(author: Option<String>) -> String {
    match author {
        Some(author) if !author.trim().is_empty() => author,
        _ => DELETED_USER.to_string(),
    }
}
