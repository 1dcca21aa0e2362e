use std::path::{Path, PathBuf};

use bytes::Bytes;
use copycat_core::{
    CONFIG_PATH, ClientConfig, FETCH_PROXY_PATH, FILENAME_HEADER,
    ingest::{
        decode_data_url, drive_download_url, is_data_url, is_google_drive_link, og_image_url,
        pasted_file_name, resolve_file_name,
    },
};
use reqwest::{Client, header};
use tracing::{debug, info};
use url::Url;

use crate::{
    error::{ClientError, expect_success},
    upload_queue::QueueItem,
};

/// How many HTML pages may be followed through `og:image` before giving up.
const MAX_PAGE_HOPS: usize = 1;

#[derive(Debug, Clone)]
pub struct RelayedFile {
    pub bytes: Bytes,
    pub content_type: Option<String>,
    pub filename_hint: Option<String>,
}

impl RelayedFile {
    fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .and_then(|value| value.split(';').next())
            .is_some_and(|essence| essence.trim().eq_ignore_ascii_case("text/html"))
    }
}

#[derive(Debug, Clone)]
pub struct RelayClient {
    http: Client,
    base: Url,
}

impl RelayClient {
    pub fn new(base: &str) -> Result<Self, ClientError> {
        Self::with_client(Client::new(), base)
    }

    pub fn with_client(http: Client, base: &str) -> Result<Self, ClientError> {
        let base = Url::parse(base.trim()).map_err(|err| copycat_core::CoreError::InvalidUrl {
            url: base.to_owned(),
            reason: err.to_string(),
        })?;
        Ok(Self { http, base })
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        url.set_path(path);
        url.set_query(None);
        url
    }

    pub async fn fetch_config(&self) -> Result<ClientConfig, ClientError> {
        let response = self.http.get(self.endpoint(CONFIG_PATH)).send().await?;
        let response = expect_success(response).await?;
        let config: ClientConfig = response.json().await?;
        config.validate()?;
        Ok(config)
    }

    pub async fn fetch_via_relay(&self, target: &str) -> Result<RelayedFile, ClientError> {
        let mut url = self.endpoint(FETCH_PROXY_PATH);
        url.query_pairs_mut().append_pair("url", target);
        debug!(target, "fetching through relay");

        let response = expect_success(self.http.get(url).send().await?).await?;
        let content_type = header_text(&response, header::CONTENT_TYPE.as_str());
        let filename_hint = header_text(&response, FILENAME_HEADER);
        let bytes = response.bytes().await?;
        Ok(RelayedFile {
            bytes,
            content_type,
            filename_hint,
        })
    }

    /// Turns user input (a pasted data URL, a Drive share link or any other URL)
    /// into a queue item.
    pub async fn ingest_url(&self, input: &str, now_unix_ms: u64) -> Result<QueueItem, ClientError> {
        let mut source = input.trim().to_owned();
        if source.is_empty() {
            return Err(copycat_core::CoreError::MissingUrl.into());
        }

        let mut hops = 0;
        loop {
            if is_data_url(&source) {
                let decoded = decode_data_url(&source)?;
                return Ok(QueueItem::new(
                    decoded.bytes,
                    pasted_file_name(now_unix_ms),
                    Some(decoded.mime),
                ));
            }

            let drive = is_google_drive_link(&source);
            let target = if drive {
                drive_download_url(&source)?
            } else {
                source.clone()
            };

            let fetched = self.fetch_via_relay(&target).await?;
            if fetched.is_html() && !drive {
                let page = String::from_utf8_lossy(&fetched.bytes);
                match og_image_url(&page) {
                    Some(image) if hops < MAX_PAGE_HOPS => {
                        debug!(page = %source, image = %image, "following og:image");
                        hops += 1;
                        source = image;
                        continue;
                    }
                    _ => return Err(ClientError::NoDirectImage),
                }
            }

            let name = resolve_file_name(fetched.filename_hint.as_deref(), &source, now_unix_ms);
            info!(name = %name, bytes = fetched.bytes.len(), "fetched file from url");
            return Ok(QueueItem::new(fetched.bytes, name, fetched.content_type));
        }
    }
}

/// Writes `item` into `dir` under its proposed name and returns the path.
///
/// Only the final component of the name is used, so a name such as
/// `../../etc/passwd` cannot escape `dir`.
pub async fn save_to_dir(item: &QueueItem, dir: &Path) -> Result<PathBuf, ClientError> {
    let name = Path::new(&item.proposed_name)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ClientError::from(copycat_core::CoreError::EmptyFileName))?;
    let path = dir.join(name);
    tokio::fs::write(&path, &item.payload)
        .await
        .map_err(|err| ClientError::Storage(format!("failed to write {}: {err}", path.display())))?;
    Ok(path)
}

fn header_text(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .filter(|value| !value.is_empty())
}
