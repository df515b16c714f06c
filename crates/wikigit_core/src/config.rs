use std::env;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::reconcile::HISTORY_DEPTH_LIMIT;

pub const DEFAULT_USER_AGENT: &str = "wikigit/0.1";
pub const DEFAULT_DOMAIN_TEMPLATE: &str = "{lang}.wikipedia.org";
pub const DEFAULT_LANGUAGE: &str = "en";
pub const LANGUAGE_PLACEHOLDER: &str = "{lang}";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikigitConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub sync: SyncSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    /// Host template; `{lang}` is replaced by the run's language code.
    pub domain: Option<String>,
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct AuthSection {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for AuthSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSection")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SyncSection {
    pub history_depth: Option<usize>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl WikigitConfig {
    /// Wiki host for a language, e.g. `fr.wikipedia.org`.
    pub fn domain(&self, language: &str) -> String {
        self.wiki
            .domain
            .as_deref()
            .unwrap_or(DEFAULT_DOMAIN_TEMPLATE)
            .replace(LANGUAGE_PLACEHOLDER, language)
    }

    /// Resolve the API URL: env WIKI_API_URL > config > derived from the domain.
    pub(crate) fn api_url_with_lookup<F>(&self, language: &str, lookup_env: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = non_empty(lookup_env("WIKI_API_URL")) {
            return value.replace(LANGUAGE_PLACEHOLDER, language);
        }
        if let Some(api_url) = &self.wiki.api_url {
            return api_url.replace(LANGUAGE_PLACEHOLDER, language);
        }
        format!("https://{}/w/api.php", self.domain(language))
    }

    /// Resolve user agent: env WIKI_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub(crate) fn user_agent_with_lookup<F>(&self, lookup_env: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = non_empty(lookup_env("WIKI_USER_AGENT")) {
            return value;
        }
        self.wiki
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    /// Bot credentials: env WIKI_BOT_USER/WIKI_BOT_PASS > `[auth]`. Both halves required.
    pub fn credentials(&self) -> Option<Credentials> {
        self.credentials_with_lookup(|key| env::var(key).ok())
    }

    fn credentials_with_lookup<F>(&self, lookup_env: F) -> Option<Credentials>
    where
        F: Fn(&str) -> Option<String>,
    {
        let username = non_empty(lookup_env("WIKI_BOT_USER"))
            .or_else(|| non_empty(self.auth.username.clone()))?;
        let password = non_empty(lookup_env("WIKI_BOT_PASS"))
            .or_else(|| non_empty(self.auth.password.clone()))?;
        Some(Credentials { username, password })
    }

    pub fn history_depth(&self) -> usize {
        self.sync
            .history_depth
            .filter(|depth| *depth > 0)
            .unwrap_or(HISTORY_DEPTH_LIMIT)
    }
}

/// Load and parse a WikigitConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<WikigitConfig> {
    if !config_path.exists() {
        return Ok(WikigitConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: WikigitConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
