//! Naming and decoding rules for content entering the upload queue.

use std::sync::LazyLock;

use base64::Engine;
use bytes::Bytes;
use regex::Regex;

use crate::{CoreError, DEFAULT_CONTENT_TYPE, LEGACY_PLACEHOLDER_FILENAME};

static DRIVE_FILE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:/d/|id=)([\w-]+)").expect("drive id pattern is valid"));
static META_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<meta\b[^>]*>").expect("meta tag pattern is valid"));
static OG_IMAGE_PROPERTY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bproperty\s*=\s*["']og:image["']"#).expect("og property pattern is valid")
});
static CONTENT_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bcontent\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
        .expect("content attribute pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    pub mime: String,
    pub bytes: Bytes,
}

/// Decodes a `data:<mime>;base64,<payload>` URL.
pub fn decode_data_url(input: &str) -> Result<DataUrl, CoreError> {
    let rest = input
        .trim()
        .strip_prefix("data:")
        .ok_or_else(|| CoreError::MalformedDataUrl("missing data: prefix".to_owned()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| CoreError::MalformedDataUrl("missing ',' separator".to_owned()))?;

    let mut params = header.split(';');
    let mime = params.next().unwrap_or_default().trim();
    if !params.any(|p| p.trim().eq_ignore_ascii_case("base64")) {
        return Err(CoreError::MalformedDataUrl(
            "only base64 payloads are supported".to_owned(),
        ));
    }

    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|err| CoreError::MalformedDataUrl(err.to_string()))?;

    Ok(DataUrl {
        mime: if mime.is_empty() {
            DEFAULT_CONTENT_TYPE.to_owned()
        } else {
            mime.to_owned()
        },
        bytes: Bytes::from(bytes),
    })
}

pub fn is_data_url(input: &str) -> bool {
    input.trim_start().starts_with("data:")
}

pub fn pasted_file_name(timestamp_unix_ms: u64) -> String {
    format!("pasted-file-{timestamp_unix_ms}")
}

pub fn is_google_drive_link(url: &str) -> bool {
    url.contains("drive.google.com") || url.contains("docs.google.com")
}

/// Rewrites a Drive share link (`/d/<id>` or `id=<id>`) into its direct-download form.
pub fn drive_download_url(url: &str) -> Result<String, CoreError> {
    let id = DRIVE_FILE_ID
        .captures(url)
        .and_then(|caps| caps.get(1))
        .ok_or(CoreError::InvalidDriveLink)?;
    Ok(format!(
        "https://drive.google.com/uc?export=download&id={}",
        id.as_str()
    ))
}

/// Name for a fetched resource: the relay's hint when it carried one, otherwise the
/// last path segment of the source URL, otherwise `file-<timestamp>`.
pub fn resolve_file_name(hint: Option<&str>, source_url: &str, timestamp_unix_ms: u64) -> String {
    if let Some(hint) = hint.map(str::trim)
        && !hint.is_empty()
        && hint != LEGACY_PLACEHOLDER_FILENAME
    {
        return hint.to_owned();
    }

    let tail = source_url
        .rsplit_once('/')
        .map_or(source_url, |(_, tail)| tail);
    let tail = tail.split('?').next().unwrap_or_default();
    if tail.is_empty() {
        format!("file-{timestamp_unix_ms}")
    } else {
        tail.to_owned()
    }
}

/// Finds `<meta property="og:image" content="...">` in an HTML page.
pub fn og_image_url(html: &str) -> Option<String> {
    META_TAG
        .find_iter(html)
        .map(|tag| tag.as_str())
        .filter(|tag| OG_IMAGE_PROPERTY.is_match(tag))
        .find_map(|tag| {
            let caps = CONTENT_ATTR.captures(tag)?;
            let value = caps.get(1).or_else(|| caps.get(2))?.as_str().trim();
            (!value.is_empty()).then(|| value.to_owned())
        })
}
