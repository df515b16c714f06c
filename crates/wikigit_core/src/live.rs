use std::collections::VecDeque;
use std::env;
use std::str::FromStr;
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use reqwest::blocking::{Client, Response};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::WikigitConfig;
use crate::revision::{Revision, SourceRevision};

/// Revision record as returned by `prop=revisions` with `formatversion=2`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct LiveRevision {
    pub revid: Option<i64>,
    pub timestamp: Option<String>,
    pub user: Option<String>,
    #[serde(default)]
    pub userhidden: bool,
    pub comment: Option<String>,
    #[serde(default)]
    pub commenthidden: bool,
    pub slots: Option<LiveRevisionSlots>,
    /// Pre-slot API responses carry the body under `*`.
    #[serde(rename = "*")]
    pub legacy_content: Option<String>,
    #[serde(default)]
    pub texthidden: bool,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct LiveRevisionSlots {
    pub main: Option<LiveSlot>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct LiveSlot {
    pub content: Option<String>,
    #[serde(rename = "*")]
    pub legacy_content: Option<String>,
    #[serde(default)]
    pub texthidden: bool,
}

/// One page of a document's history plus the cursor for the next page, if any.
#[derive(Debug, Clone, Default)]
pub struct RevisionPage {
    pub title: String,
    pub revisions: Vec<LiveRevision>,
    pub next_cursor: Option<String>,
}

pub trait RevisionFeedApi {
    /// Fetch the next page of revisions, oldest first, starting at `cursor`.
    fn fetch_revisions(&mut self, title: &str, cursor: Option<&str>) -> Result<RevisionPage>;
    fn login(&mut self, username: &str, password: &str) -> Result<()>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout: Duration,
    /// Minimum spacing between two API calls.
    pub read_interval: Duration,
    pub max_retries: usize,
    pub retry_delay: Duration,
}

impl MediaWikiClientConfig {
    pub fn from_config(config: &WikigitConfig, language: &str) -> Self {
        Self::from_config_with_lookup(config, language, |key| env::var(key).ok())
    }

    fn from_config_with_lookup<F>(config: &WikigitConfig, language: &str, lookup_env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            api_url: config.api_url_with_lookup(language, &lookup_env),
            user_agent: config.user_agent_with_lookup(&lookup_env),
            timeout: Duration::from_millis(env_number(&lookup_env, "WIKI_HTTP_TIMEOUT_MS", 30_000)),
            read_interval: Duration::from_millis(env_number(
                &lookup_env,
                "WIKI_RATE_LIMIT_READ",
                300,
            )),
            max_retries: env_number(&lookup_env, "WIKI_HTTP_RETRIES", 2),
            retry_delay: Duration::from_millis(env_number(
                &lookup_env,
                "WIKI_HTTP_RETRY_DELAY_MS",
                500,
            )),
        }
    }
}

pub struct MediaWikiClient {
    client: Client,
    config: MediaWikiClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .cookie_store(true)
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    pub fn api_url(&self) -> &str {
        &self.config.api_url
    }

    fn endpoint(&self) -> Result<Url> {
        Url::parse(&self.config.api_url)
            .with_context(|| format!("invalid WIKI_API_URL: {}", self.config.api_url))
    }

    /// Read-only query. Transient HTTP failures are retried with doubling delays.
    fn get_json(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let url = self.endpoint()?;
        let pairs = api_pairs(params);
        let mut attempt = 0;
        loop {
            self.throttle();
            let result = self.client.get(url.clone()).query(&pairs).send();
            let transient = match &result {
                Ok(response) => is_transient_status(response.status()),
                Err(error) => error.is_timeout() || error.is_connect(),
            };
            if transient && attempt < self.config.max_retries {
                attempt += 1;
                let delay = backoff(self.config.retry_delay, attempt);
                debug!(attempt, ?delay, "retrying MediaWiki query");
                sleep(delay);
                continue;
            }
            return read_api_payload(result.context("failed to call MediaWiki API")?);
        }
    }

    /// Single-shot form POST; a login token is consumed by the first attempt.
    fn post_form(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let url = self.endpoint()?;
        self.throttle();
        let response = self
            .client
            .post(url)
            .form(&api_pairs(params))
            .send()
            .context("failed to call MediaWiki API")?;
        read_api_payload(response)
    }

    fn throttle(&mut self) {
        if let Some(last) = self.last_request_at {
            let wait = self.config.read_interval.saturating_sub(last.elapsed());
            if !wait.is_zero() {
                sleep(wait);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }
}

fn api_pairs(params: &[(&str, String)]) -> Vec<(String, String)> {
    [("format", "json"), ("formatversion", "2")]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .chain(
            params
                .iter()
                .filter(|(_, value)| !value.is_empty())
                .map(|(key, value)| ((*key).to_string(), value.clone())),
        )
        .collect()
}

fn read_api_payload(response: Response) -> Result<Value> {
    let status = response.status();
    if !status.is_success() {
        bail!("MediaWiki API request failed with HTTP {status}");
    }
    let payload: Value = response
        .json()
        .context("failed to decode MediaWiki API JSON response")?;
    if let Some(error) = payload.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("unknown info");
        bail!("MediaWiki API error [{code}]: {info}");
    }
    Ok(payload)
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

/// `base`, `2 * base`, `4 * base`, ... for attempts 1, 2, 3, ...
fn backoff(base: Duration, attempt: usize) -> Duration {
    let exponent = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(2u32.checked_pow(exponent).unwrap_or(u32::MAX))
}

fn env_number<T, F>(lookup_env: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup_env(key)
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

impl RevisionFeedApi for MediaWikiClient {
    fn fetch_revisions(&mut self, title: &str, cursor: Option<&str>) -> Result<RevisionPage> {
        let mut params = vec![
            ("action", "query".to_string()),
            ("prop", "revisions".to_string()),
            ("titles", title.to_string()),
            ("rvprop", "ids|timestamp|user|comment|content".to_string()),
            ("rvslots", "main".to_string()),
            ("rvlimit", "max".to_string()),
            ("rvdir", "newer".to_string()),
            ("redirects", "1".to_string()),
        ];
        if let Some(cursor) = cursor {
            params.push(("rvcontinue", cursor.to_string()));
        }

        let response = self.get_json(&params)?;
        parse_revision_page(response, title)
    }

    fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let token_response = self.get_json(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
            ("type", "login".to_string()),
        ])?;
        let token_payload: TokenQueryResponse = serde_json::from_value(token_response)
            .context("failed to decode login token response")?;
        let login_token = token_payload
            .query
            .tokens
            .and_then(|tokens| tokens.logintoken)
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki login token"))?;

        let login_response = self.post_form(&[
            ("action", "login".to_string()),
            ("lgname", username.to_string()),
            ("lgpassword", password.to_string()),
            ("lgtoken", login_token),
        ])?;
        let login_payload: LoginResponse =
            serde_json::from_value(login_response).context("failed to decode login response")?;
        match login_payload.login.result.as_deref() {
            Some("Success") => Ok(()),
            other => bail!(
                "MediaWiki login failed: {}",
                login_payload
                    .login
                    .reason
                    .or_else(|| other.map(ToString::to_string))
                    .unwrap_or_else(|| "unknown error".to_string())
            ),
        }
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn parse_revision_page(response: Value, requested_title: &str) -> Result<RevisionPage> {
    let parsed: RevisionQueryResponse = serde_json::from_value(response)
        .context("failed to decode revisions API response")?;
    let page = parsed
        .query
        .pages
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("revisions API response has no page for {requested_title}"))?;
    if page.missing.unwrap_or(false) {
        bail!("document not found: {requested_title}");
    }
    if page.invalid.unwrap_or(false) {
        bail!(
            "invalid document title {requested_title}: {}",
            page.invalidreason.unwrap_or_else(|| "unknown reason".to_string())
        );
    }

    Ok(RevisionPage {
        title: page.title.unwrap_or_else(|| requested_title.to_string()),
        revisions: page.revisions,
        next_cursor: parsed.continuation.and_then(|cont| cont.rvcontinue),
    })
}

/// Lazy, oldest-first revision sequence for one document. A page is fetched only when
/// the previous one has been consumed.
pub struct LiveFeed<'a, A: RevisionFeedApi> {
    api: &'a mut A,
    document_name: String,
    cursor: Option<String>,
    buffer: VecDeque<LiveRevision>,
    pages_fetched: usize,
    exhausted: bool,
}

impl<'a, A: RevisionFeedApi> LiveFeed<'a, A> {
    pub fn new(api: &'a mut A, document_name: &str) -> Self {
        Self::resume(api, document_name, None)
    }

    /// Start from a continuation token handed out by an earlier, interrupted feed.
    pub fn resume(api: &'a mut A, document_name: &str, cursor: Option<String>) -> Self {
        Self {
            api,
            document_name: document_name.to_string(),
            cursor,
            buffer: VecDeque::new(),
            pages_fetched: 0,
            exhausted: false,
        }
    }

    /// Continuation token of the next page that has not been fetched yet.
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }
}

impl<A: RevisionFeedApi> Iterator for LiveFeed<'_, A> {
    type Item = Result<Revision>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(revision) = self.buffer.pop_front() {
                return Some(Ok(Revision::from_source(
                    &self.document_name,
                    SourceRevision::Live(revision),
                )));
            }
            if self.exhausted {
                return None;
            }

            match self
                .api
                .fetch_revisions(&self.document_name, self.cursor.as_deref())
            {
                Ok(page) => {
                    self.pages_fetched += 1;
                    debug!(
                        document = %self.document_name,
                        page = self.pages_fetched,
                        revisions = page.revisions.len(),
                        "retrieved revision page"
                    );
                    self.cursor = page.next_cursor;
                    self.exhausted = self.cursor.is_none();
                    self.buffer.extend(page.revisions);
                }
                Err(error) => {
                    self.exhausted = true;
                    return Some(Err(error.context(format!(
                        "failed to fetch revisions for {}",
                        self.document_name
                    ))));
                }
            }
        }
    }
}

/// Everything a feed yielded before it finished or failed.
#[derive(Debug)]
pub struct FeedCollection {
    pub revisions: Vec<Revision>,
    pub pages: usize,
    pub interrupted: Option<anyhow::Error>,
    /// Cursor of the page that failed; `None` when the feed completed.
    pub resume_cursor: Option<String>,
}

pub fn collect_feed<A: RevisionFeedApi>(mut feed: LiveFeed<'_, A>) -> FeedCollection {
    let mut revisions = Vec::new();
    let mut interrupted = None;
    for item in feed.by_ref() {
        match item {
            Ok(revision) => revisions.push(revision),
            Err(error) => {
                interrupted = Some(error);
                break;
            }
        }
    }

    let resume_cursor = if interrupted.is_some() {
        feed.cursor().map(ToString::to_string)
    } else {
        None
    };
    FeedCollection {
        revisions,
        pages: feed.pages_fetched(),
        interrupted,
        resume_cursor,
    }
}

#[derive(Debug, Deserialize, Default)]
struct RevisionQueryResponse {
    #[serde(default)]
    query: RevisionQueryPayload,
    #[serde(default, rename = "continue")]
    continuation: Option<ContinuationPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct RevisionQueryPayload {
    #[serde(default)]
    pages: Vec<PageQueryItem>,
}

#[derive(Debug, Deserialize, Default)]
struct ContinuationPayload {
    rvcontinue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageQueryItem {
    title: Option<String>,
    missing: Option<bool>,
    invalid: Option<bool>,
    invalidreason: Option<String>,
    #[serde(default)]
    revisions: Vec<LiveRevision>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryResponse {
    #[serde(default)]
    query: TokenQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryPayload {
    tokens: Option<TokenPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenPayload {
    logintoken: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LoginResponse {
    #[serde(default)]
    login: LoginPayload,
}

#[derive(Debug, Deserialize, Default)]
struct LoginPayload {
    result: Option<String>,
    reason: Option<String>,
}
