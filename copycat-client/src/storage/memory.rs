use std::{
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use copycat_core::{FILES_BUCKET, FileEntry, MessageRow};
use tokio::sync::mpsc;

use super::{MessageStore, ObjectStore, ProgressFn, UploadProgress, UploadRequest};
use crate::{
    error::ClientError,
    realtime::{Channel, ChangeEvent},
};

#[derive(Debug, Clone)]
struct StoredObject {
    name: String,
    payload: Bytes,
    content_type: Option<String>,
    created_at: String,
    seq: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: Vec<StoredObject>,
    messages: Vec<MessageRow>,
    next_message_id: i64,
    next_seq: u64,
    upload_log: Vec<String>,
    listeners: Vec<mpsc::UnboundedSender<ChangeEvent>>,
}

/// In-process store that also emits the change notifications a hosted backend would push.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fail_uploads: AtomicBool,
    upload_delay: Duration,
    message_queries: AtomicUsize,
    file_queries: AtomicUsize,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every upload sleep, so overlapping uploads would be observable.
    #[must_use]
    pub fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = delay;
        self
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    /// Registers a listener that receives a [`ChangeEvent`] for every mutation.
    pub fn change_feed(&self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().listeners.push(tx);
        rx
    }

    pub fn upload_log(&self) -> Vec<String> {
        self.lock().upload_log.clone()
    }

    pub fn max_concurrent_uploads(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn message_queries(&self) -> usize {
        self.message_queries.load(Ordering::SeqCst)
    }

    pub fn file_queries(&self) -> usize {
        self.file_queries.load(Ordering::SeqCst)
    }

    pub fn object(&self, name: &str) -> Option<(Bytes, Option<String>)> {
        self.lock()
            .objects
            .iter()
            .find(|o| o.name == name)
            .map(|o| (o.payload.clone(), o.content_type.clone()))
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(state: &mut MemoryState, channel: Channel) {
        let event = ChangeEvent::now(channel);
        state.listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self) -> Result<Vec<FileEntry>, ClientError> {
        self.file_queries.fetch_add(1, Ordering::SeqCst);
        let mut objects = self.lock().objects.clone();
        objects.sort_by(|a, b| b.seq.cmp(&a.seq));
        Ok(objects
            .into_iter()
            .map(|o| FileEntry {
                name: o.name,
                created_at: Some(o.created_at),
            })
            .collect())
    }

    async fn upload(
        &self,
        request: UploadRequest,
        progress: ProgressFn,
    ) -> Result<(), ClientError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let total = request.payload.len() as u64;
        progress(UploadProgress { loaded: 0, total });
        if !self.upload_delay.is_zero() {
            tokio::time::sleep(self.upload_delay).await;
        } else {
            tokio::task::yield_now().await;
        }
        progress(UploadProgress {
            loaded: total,
            total,
        });

        let result = if self.fail_uploads.load(Ordering::SeqCst) {
            Err(ClientError::Storage(format!(
                "upload of {} to bucket {} rejected",
                request.name, FILES_BUCKET
            )))
        } else {
            let mut state = self.lock();
            let existing = state.objects.iter().position(|o| o.name == request.name);
            match (existing, request.upsert) {
                (Some(_), false) => Err(ClientError::Storage(format!(
                    "{} already exists",
                    request.name
                ))),
                (Some(index), true) => {
                    let object = &mut state.objects[index];
                    object.payload = request.payload;
                    object.content_type = request.content_type;
                    state.upload_log.push(request.name);
                    Self::notify(&mut state, Channel::FileNotifications);
                    Ok(())
                }
                (None, _) => {
                    state.next_seq += 1;
                    let seq = state.next_seq;
                    state.objects.push(StoredObject {
                        name: request.name.clone(),
                        payload: request.payload,
                        content_type: request.content_type,
                        created_at: Utc::now().to_rfc3339(),
                        seq,
                    });
                    state.upload_log.push(request.name);
                    Self::notify(&mut state, Channel::FileNotifications);
                    Ok(())
                }
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn remove(&self, names: &[String]) -> Result<(), ClientError> {
        let mut state = self.lock();
        let before = state.objects.len();
        state.objects.retain(|o| !names.contains(&o.name));
        if state.objects.len() != before {
            Self::notify(&mut state, Channel::FileNotifications);
        }
        Ok(())
    }

    fn public_url(&self, name: &str) -> String {
        format!("memory://{FILES_BUCKET}/{name}")
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn recent_messages(&self, limit: usize) -> Result<Vec<MessageRow>, ClientError> {
        self.message_queries.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        let mut rows = state.messages.clone();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn insert_message(&self, content: &str, title: Option<&str>) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.next_message_id += 1;
        let id = state.next_message_id;
        state.messages.push(MessageRow {
            id,
            title: title.map(str::to_owned),
            content: content.to_owned(),
            created_at: Utc::now().to_rfc3339(),
        });
        Self::notify(&mut state, Channel::Messages);
        Ok(())
    }

    async fn delete_message(&self, id: i64) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.messages.retain(|m| m.id != id);
        Self::notify(&mut state, Channel::Messages);
        Ok(())
    }

    async fn clear_messages(&self) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.messages.clear();
        Self::notify(&mut state, Channel::Messages);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn request(name: &str, body: &'static [u8], upsert: bool) -> UploadRequest {
        UploadRequest {
            name: name.to_owned(),
            payload: Bytes::from_static(body),
            content_type: Some("text/plain".to_owned()),
            upsert,
        }
    }

    #[tokio::test]
    async fn upsert_replaces_and_plain_upload_conflicts() {
        let store = MemoryStore::new();
        let progress: ProgressFn = Arc::new(|_| {});
        store
            .upload(request("a.txt", b"one", true), progress.clone())
            .await
            .unwrap();
        store
            .upload(request("a.txt", b"two", true), progress.clone())
            .await
            .unwrap();
        assert_eq!(store.object("a.txt").unwrap().0, Bytes::from_static(b"two"));
        assert_eq!(store.list().await.unwrap().len(), 1);

        let err = store
            .upload(request("a.txt", b"three", false), progress)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Storage(_)));
    }

    #[tokio::test]
    async fn mutations_are_announced_on_the_matching_channel() {
        let store = MemoryStore::new();
        let mut feed = store.change_feed();

        store.insert_message("hi", None).await.unwrap();
        store
            .upload(request("b.txt", b"x", true), Arc::new(|_| {}))
            .await
            .unwrap();

        assert_eq!(feed.recv().await.unwrap().channel, Channel::Messages);
        assert_eq!(feed.recv().await.unwrap().channel, Channel::FileNotifications);
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let store = MemoryStore::new();
        for name in ["first", "second", "third"] {
            store
                .upload(request(name, b"x", true), Arc::new(|_| {}))
                .await
                .unwrap();
        }
        let names: Vec<String> = store.list().await.unwrap().into_iter().map(|f| f.name).collect();
        assert_eq!(names, ["third", "second", "first"]);
    }
}
