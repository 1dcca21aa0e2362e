use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub mod ingest;
pub mod preview;

pub const FETCH_PROXY_PATH: &str = "/fetch-proxy";
pub const CONFIG_PATH: &str = "/config";
pub const HEALTHZ_PATH: &str = "/healthz";
pub const FILENAME_HEADER: &str = "x-filename";
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
/// Placeholder name older relays sent when no `Content-Disposition` was present.
pub const LEGACY_PLACEHOLDER_FILENAME: &str = "downloaded-file";
pub const DEFAULT_ALLOWED_DOMAINS: [&str; 2] = ["drive.google.com", "docs.google.com"];
pub const RELAY_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";
pub const MAX_RECENT_MESSAGES: usize = 100;
pub const CLIPBOARD_POLL_INTERVAL_MS: u64 = 1_000;
pub const FILES_BUCKET: &str = "files";
pub const MESSAGES_TABLE: &str = "messages";
pub const NOTIFICATIONS_TABLE: &str = "notifications";

static QUOTED_FILENAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"filename="(.+?)""#).expect("filename pattern is valid"));

/// Storage endpoint and public key handed to clients by the relay's `/config` route.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientConfig {
    pub url: String,
    pub key: String,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.url.trim().is_empty() || self.key.trim().is_empty() {
            return Err(CoreError::IncompleteConfig);
        }
        Url::parse(self.url.trim()).map_err(|err| CoreError::InvalidUrl {
            url: self.url.clone(),
            reason: err.to_string(),
        })?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRow {
    pub id: i64,
    #[serde(default)]
    pub title: Option<String>,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("URL parameter is required")]
    MissingUrl,
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("Domain not allowed")]
    DomainNotAllowed { host: String },
    #[error("Invalid Google Drive link format.")]
    InvalidDriveLink,
    #[error("malformed data URL: {0}")]
    MalformedDataUrl(String),
    #[error("File name cannot be empty.")]
    EmptyFileName,
    #[error("storage URL or key is missing from config")]
    IncompleteConfig,
}

/// Hostname suffixes the relay may fetch from. An empty list means the guard is off.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainAllowlist {
    suffixes: Vec<String>,
}

impl DomainAllowlist {
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn new<I, S>(suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let suffixes = suffixes
            .into_iter()
            .map(|s| s.as_ref().trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        Self { suffixes }
    }

    pub fn is_enforced(&self) -> bool {
        !self.suffixes.is_empty()
    }

    pub fn suffixes(&self) -> &[String] {
        &self.suffixes
    }

    pub fn permits(&self, host: &str) -> bool {
        if !self.is_enforced() {
            return true;
        }
        let host = host.to_ascii_lowercase();
        self.suffixes.iter().any(|suffix| host.ends_with(suffix.as_str()))
    }

    /// Parses the untrusted `url` query value and applies the guard.
    ///
    /// Nothing outbound may happen before this returns `Ok`.
    pub fn validate(&self, raw: Option<&str>) -> Result<Url, CoreError> {
        let raw = raw.map(str::trim).filter(|s| !s.is_empty());
        let Some(raw) = raw else {
            return Err(CoreError::MissingUrl);
        };

        let url = Url::parse(raw).map_err(|err| CoreError::InvalidUrl {
            url: raw.to_owned(),
            reason: err.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CoreError::InvalidUrl {
                url: raw.to_owned(),
                reason: format!("unsupported scheme {}", url.scheme()),
            });
        }

        let host = url.host_str().unwrap_or_default();
        if !self.permits(host) {
            return Err(CoreError::DomainNotAllowed {
                host: host.to_owned(),
            });
        }
        Ok(url)
    }
}

pub fn filename_from_content_disposition(value: &str) -> Option<String> {
    QUOTED_FILENAME
        .captures(value)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_owned())
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            other => out.push(other),
        }
    }
    out
}
