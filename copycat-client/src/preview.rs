use async_trait::async_trait;
use copycat_core::preview::{PreviewKind, classify, embed_document, office_viewer_url, render_text};
use tracing::{debug, warn};

use crate::error::ClientError;

pub const PREVIEW_UNAVAILABLE: &str = "Preview not available for this file type.";

/// Fetches the full text of a stored file for text previews.
#[async_trait]
pub trait TextFetcher: Send + Sync {
    async fn fetch_text(&self, url: &str) -> Result<String, ClientError>;
}

#[async_trait]
impl TextFetcher for reqwest::Client {
    async fn fetch_text(&self, url: &str) -> Result<String, ClientError> {
        let response = self.get(url).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreviewOutcome {
    /// Open this URL instead of rendering anything locally.
    Redirect(String),
    /// A complete HTML document.
    Document(String),
    Unavailable,
}

/// Chooses and runs a preview strategy per file. Holds no per-file state, so a
/// failed preview has no effect on the next one.
#[derive(Debug, Clone)]
pub struct PreviewDispatcher<F> {
    fetcher: F,
}

impl<F: TextFetcher> PreviewDispatcher<F> {
    pub fn new(fetcher: F) -> Self {
        Self { fetcher }
    }

    pub async fn preview(&self, name: &str, url: &str) -> Result<PreviewOutcome, ClientError> {
        let kind = classify(name);
        debug!(name, ?kind, "previewing file");
        match kind {
            PreviewKind::Office => Ok(PreviewOutcome::Redirect(office_viewer_url(url))),
            PreviewKind::Embed => Ok(PreviewOutcome::Document(embed_document(url))),
            PreviewKind::Unsupported => Ok(PreviewOutcome::Unavailable),
            PreviewKind::Text(flavor) => match self.fetcher.fetch_text(url).await {
                Ok(text) => Ok(PreviewOutcome::Document(render_text(flavor, name, &text))),
                Err(err) => {
                    warn!(name, "preview fetch failed: {err}");
                    Err(ClientError::Preview {
                        name: name.to_owned(),
                        reason: err.to_string(),
                    })
                }
            },
        }
    }
}
