use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result, bail};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::{debug, warn};

use crate::config::DEFAULT_LANGUAGE;
use crate::revision::{Revision, SourceRevision};

const ROOT_ELEMENT: &[u8] = b"mediawiki";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteInfo {
    pub sitename: Option<String>,
    pub dbname: Option<String>,
    pub base: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Contributor {
    pub username: Option<String>,
    pub ip: Option<String>,
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveRevision {
    pub id: Option<String>,
    pub parent_id: Option<String>,
    pub timestamp: Option<String>,
    pub contributor: Option<Contributor>,
    pub comment: Option<String>,
    pub text: Option<String>,
    pub sha1: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveDocument {
    pub title: String,
    pub revisions: Vec<ArchiveRevision>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveExport {
    pub site: SiteInfo,
    pub documents: Vec<ArchiveDocument>,
}

impl SiteInfo {
    /// Wiki language inferred from `dbname` (`frwiki` -> `fr`), then from the `base` URL.
    pub fn language(&self) -> String {
        let dbname = self
            .dbname
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());

        if let Some(dbname) = dbname
            && let Some(stripped) = strip_suffix_ignore_ascii_case(dbname, "wiki")
        {
            if stripped.is_empty() {
                return DEFAULT_LANGUAGE.to_string();
            }
            return stripped.to_string();
        }

        if let Some(language) = self.base.as_deref().and_then(language_from_base_url) {
            return language;
        }

        dbname.unwrap_or(DEFAULT_LANGUAGE).to_string()
    }
}

impl ArchiveExport {
    pub fn revision_count(&self) -> usize {
        self.documents
            .iter()
            .map(|document| document.revisions.len())
            .sum()
    }

    /// Canonical revisions in export order (grouped by document, not by time).
    pub fn into_revisions(self) -> Vec<Revision> {
        let mut revisions = Vec::with_capacity(self.revision_count());
        for document in self.documents {
            if document.revisions.is_empty() {
                warn!(document = %document.title, "no revisions found in export, skipping");
                continue;
            }
            for revision in document.revisions {
                revisions.push(Revision::from_source(
                    &document.title,
                    SourceRevision::Archive(revision),
                ));
            }
        }
        revisions
    }
}

pub fn parse_export_file(path: &Path) -> Result<ArchiveExport> {
    let file =
        File::open(path).with_context(|| format!("failed to open archive {}", path.display()))?;
    parse_export(BufReader::new(file))
        .with_context(|| format!("failed to parse archive {}", path.display()))
}

/// Stream a MediaWiki XML export into documents and revisions.
pub fn parse_export<R: BufRead>(source: R) -> Result<ArchiveExport> {
    let mut reader = Reader::from_reader(source);
    reader.config_mut().trim_text(false);

    let mut export = ArchiveExport::default();
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut text = String::new();
    let mut page: Option<ArchiveDocument> = None;
    let mut revision: Option<ArchiveRevision> = None;
    let mut saw_root = false;
    let mut buf = Vec::new();

    loop {
        let event = match reader.read_event_into(&mut buf) {
            Ok(event) => event,
            Err(error) => {
                return Err(anyhow::Error::new(error))
                    .with_context(|| format!("malformed XML near byte {}", reader.buffer_position()));
            }
        };

        match event {
            Event::Start(element) => {
                let name = element.local_name().as_ref().to_vec();
                if path.is_empty() {
                    if name != ROOT_ELEMENT {
                        bail!(
                            "not a MediaWiki export: root element is <{}>",
                            String::from_utf8_lossy(&name)
                        );
                    }
                    saw_root = true;
                }
                path.push(name);
                text.clear();
                match tail(&path).as_slice() {
                    [.., b"page"] => page = Some(ArchiveDocument::default()),
                    [.., b"page", b"revision"] => revision = Some(ArchiveRevision::default()),
                    [.., b"revision", b"contributor"] => {
                        if let Some(revision) = revision.as_mut() {
                            revision.contributor = Some(Contributor::default());
                        }
                    }
                    _ => {}
                }
            }
            Event::Empty(element) => {
                // Self-closing elements carry no value; `deleted="deleted"` marks suppressed data.
                if is_deleted(&element)? {
                    let name = element.local_name();
                    debug!(
                        element = %String::from_utf8_lossy(name.as_ref()),
                        "suppressed field in export"
                    );
                }
            }
            Event::Text(content) => {
                let unescaped = content
                    .unescape()
                    .context("invalid escape sequence in archive text")?;
                text.push_str(&unescaped);
            }
            Event::CData(content) => {
                text.push_str(&String::from_utf8_lossy(&content));
            }
            Event::End(_) => {
                let value = std::mem::take(&mut text);
                match tail(&path).as_slice() {
                    [.., b"siteinfo", b"sitename"] => export.site.sitename = trimmed(value),
                    [.., b"siteinfo", b"dbname"] => export.site.dbname = trimmed(value),
                    [.., b"siteinfo", b"base"] => export.site.base = trimmed(value),
                    [.., b"page", b"title"] => {
                        if let Some(page) = page.as_mut() {
                            page.title = value.trim().to_string();
                        }
                    }
                    [.., b"revision", field] => {
                        if let Some(revision) = revision.as_mut() {
                            assign_revision_field(revision, field, value);
                        }
                    }
                    [.., b"contributor", field] => {
                        if let Some(contributor) = revision
                            .as_mut()
                            .and_then(|revision| revision.contributor.as_mut())
                        {
                            assign_contributor_field(contributor, field, value);
                        }
                    }
                    [.., b"page", b"revision"] => {
                        if let (Some(page), Some(revision)) = (page.as_mut(), revision.take()) {
                            page.revisions.push(revision);
                        }
                    }
                    [.., b"page"] => {
                        if let Some(page) = page.take() {
                            export.documents.push(page);
                        }
                    }
                    _ => {}
                }
                path.pop();
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        bail!("archive is empty: no <mediawiki> element found");
    }
    if let Some(open) = path.last() {
        bail!(
            "archive ended before <{}> was closed",
            String::from_utf8_lossy(open)
        );
    }

    Ok(export)
}

fn tail(path: &[Vec<u8>]) -> Vec<&[u8]> {
    let start = path.len().saturating_sub(3);
    path[start..].iter().map(Vec::as_slice).collect()
}

fn assign_revision_field(revision: &mut ArchiveRevision, field: &[u8], value: String) {
    match field {
        b"id" => revision.id = trimmed(value),
        b"parentid" => revision.parent_id = trimmed(value),
        b"timestamp" => revision.timestamp = trimmed(value),
        b"comment" => revision.comment = Some(value).filter(|value| !value.is_empty()),
        b"text" => revision.text = Some(value),
        b"sha1" => revision.sha1 = trimmed(value),
        _ => {}
    }
}

fn assign_contributor_field(contributor: &mut Contributor, field: &[u8], value: String) {
    match field {
        b"username" => contributor.username = trimmed(value),
        b"ip" => contributor.ip = trimmed(value),
        b"id" => contributor.id = trimmed(value),
        _ => {}
    }
}

fn is_deleted(element: &BytesStart<'_>) -> Result<bool> {
    let attribute = element
        .try_get_attribute("deleted")
        .context("invalid attribute in archive element")?;
    Ok(attribute.is_some())
}

fn trimmed(value: String) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn strip_suffix_ignore_ascii_case<'a>(value: &'a str, suffix: &str) -> Option<&'a str> {
    let split = value.len().checked_sub(suffix.len())?;
    if !value.is_char_boundary(split) {
        return None;
    }
    let (head, tail) = value.split_at(split);
    tail.eq_ignore_ascii_case(suffix).then_some(head)
}

fn language_from_base_url(base: &str) -> Option<String> {
    let rest = base
        .trim()
        .strip_prefix("https://")
        .or_else(|| base.trim().strip_prefix("http://"))?;
    let host = rest.split(['/', ':']).next()?;
    let language = host.strip_suffix(".wikipedia.org")?;
    if language.is_empty() || language.contains('.') {
        return None;
    }
    Some(language.to_string())
}
