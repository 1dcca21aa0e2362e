use async_trait::async_trait;
use bytes::Bytes;
use copycat_core::{ClientConfig, FILES_BUCKET, FileEntry, MESSAGES_TABLE, MessageRow};
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, header};
use serde::Serialize;
use serde_json::json;
use tracing::debug;
use url::Url;

use super::{MessageStore, ObjectStore, ProgressFn, UploadProgress, UploadRequest};
use crate::error::{ClientError, expect_success};

const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;
const EMPTY_FOLDER_PLACEHOLDER: &str = ".emptyFolderPlaceholder";
const LIST_PAGE_LIMIT: usize = 1_000;

/// Storage and row REST adapter for a hosted Supabase project.
#[derive(Debug, Clone)]
pub struct SupabaseStore {
    http: Client,
    base: Url,
    key: String,
}

#[derive(Serialize)]
struct NewMessage<'a> {
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
}

impl SupabaseStore {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let base = Url::parse(config.url.trim()).map_err(|err| {
            ClientError::Storage(format!("invalid storage url {}: {err}", config.url))
        })?;
        Ok(Self {
            http: Client::new(),
            base,
            key: config.key.trim().to_owned(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::Storage(format!("{} cannot be a base URL", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header("apikey", &self.key).bearer_auth(&self.key)
    }

    fn rows_endpoint(&self) -> Result<Url, ClientError> {
        self.endpoint(&["rest", "v1", MESSAGES_TABLE])
    }
}

#[async_trait]
impl ObjectStore for SupabaseStore {
    async fn list(&self) -> Result<Vec<FileEntry>, ClientError> {
        let url = self.endpoint(&["storage", "v1", "object", "list", FILES_BUCKET])?;
        let body = json!({
            "prefix": "",
            "limit": LIST_PAGE_LIMIT,
            "offset": 0,
            "sortBy": { "column": "created_at", "order": "desc" },
        });
        let response = self.authorized(self.http.post(url)).json(&body).send().await?;
        let mut entries: Vec<FileEntry> = expect_success(response).await?.json().await?;
        entries.retain(|entry| entry.name != EMPTY_FOLDER_PLACEHOLDER);
        Ok(entries)
    }

    async fn upload(
        &self,
        request: UploadRequest,
        progress: ProgressFn,
    ) -> Result<(), ClientError> {
        let url = self.endpoint(&["storage", "v1", "object", FILES_BUCKET, &request.name])?;
        let total = request.payload.len() as u64;
        let content_type = request
            .content_type
            .clone()
            .unwrap_or_else(|| copycat_core::DEFAULT_CONTENT_TYPE.to_owned());

        let chunks: Vec<Bytes> = request
            .payload
            .chunks(UPLOAD_CHUNK_BYTES)
            .map(|chunk| request.payload.slice_ref(chunk))
            .collect();
        let mut loaded = 0_u64;
        let body = futures::stream::iter(chunks).map(move |chunk| {
            loaded += chunk.len() as u64;
            progress(UploadProgress { loaded, total });
            Ok::<_, std::io::Error>(chunk)
        });

        debug!(name = %request.name, bytes = total, "uploading object");
        let response = self
            .authorized(self.http.post(url))
            .header("x-upsert", request.upsert.to_string())
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CONTENT_LENGTH, total)
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await?;
        expect_success(response).await?;
        Ok(())
    }

    async fn remove(&self, names: &[String]) -> Result<(), ClientError> {
        let url = self.endpoint(&["storage", "v1", "object", FILES_BUCKET])?;
        let response = self
            .authorized(self.http.delete(url))
            .json(&json!({ "prefixes": names }))
            .send()
            .await?;
        expect_success(response).await?;
        Ok(())
    }

    fn public_url(&self, name: &str) -> String {
        self.endpoint(&["storage", "v1", "object", "public", FILES_BUCKET, name])
            .map(String::from)
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageStore for SupabaseStore {
    async fn recent_messages(&self, limit: usize) -> Result<Vec<MessageRow>, ClientError> {
        let limit = limit.to_string();
        let response = self
            .authorized(self.http.get(self.rows_endpoint()?))
            .query(&[
                ("select", "*"),
                ("order", "created_at.desc"),
                ("limit", limit.as_str()),
            ])
            .send()
            .await?;
        Ok(expect_success(response).await?.json().await?)
    }

    async fn insert_message(&self, content: &str, title: Option<&str>) -> Result<(), ClientError> {
        let response = self
            .authorized(self.http.post(self.rows_endpoint()?))
            .header("Prefer", "return=minimal")
            .json(&[NewMessage { content, title }])
            .send()
            .await?;
        expect_success(response).await?;
        Ok(())
    }

    async fn delete_message(&self, id: i64) -> Result<(), ClientError> {
        let filter = format!("eq.{id}");
        let response = self
            .authorized(self.http.delete(self.rows_endpoint()?))
            .query(&[("id", filter.as_str())])
            .send()
            .await?;
        expect_success(response).await?;
        Ok(())
    }

    async fn clear_messages(&self) -> Result<(), ClientError> {
        let response = self
            .authorized(self.http.delete(self.rows_endpoint()?))
            .query(&[("id", "neq.0")])
            .send()
            .await?;
        expect_success(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SupabaseStore {
        SupabaseStore::new(&ClientConfig {
            url: "https://project.supabase.co/".to_owned(),
            key: "anon".to_owned(),
        })
        .unwrap()
    }

    #[test]
    fn public_url_escapes_object_name() {
        assert_eq!(
            store().public_url("my report.pdf"),
            "https://project.supabase.co/storage/v1/object/public/files/my%20report.pdf"
        );
    }

    #[test]
    fn rows_endpoint_targets_messages_table() {
        assert_eq!(
            store().rows_endpoint().unwrap().as_str(),
            "https://project.supabase.co/rest/v1/messages"
        );
    }

    #[test]
    fn incomplete_config_is_rejected() {
        let err = SupabaseStore::new(&ClientConfig {
            url: "https://project.supabase.co".to_owned(),
            key: " ".to_owned(),
        })
        .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Core(copycat_core::CoreError::IncompleteConfig)
        ));
    }
}
