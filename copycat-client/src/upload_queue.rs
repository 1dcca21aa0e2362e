//! FIFO of pending uploads and the rename-then-confirm workflow around its head.
//!
//! Only the head item is ever visible for rename, confirm or cancel. Every
//! mutation is a [`QueueEvent`] matched exhaustively against the current
//! [`WorkflowState`].

use std::{collections::VecDeque, sync::Arc};

use bytes::Bytes;
use copycat_core::{
    CoreError,
    ingest::{decode_data_url, pasted_file_name},
};
use tracing::{info, warn};

use crate::{
    error::ClientError,
    status::StatusSink,
    storage::{ObjectStore, ProgressFn, UploadRequest},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Queued,
    Uploading,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub payload: Bytes,
    pub proposed_name: String,
    pub content_type: Option<String>,
    pub status: ItemStatus,
}

impl QueueItem {
    pub fn new(
        payload: impl Into<Bytes>,
        proposed_name: impl Into<String>,
        content_type: Option<String>,
    ) -> Self {
        Self {
            payload: payload.into(),
            proposed_name: proposed_name.into(),
            content_type,
            status: ItemStatus::Queued,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WorkflowState {
    #[default]
    Empty,
    /// The head is shown for renaming; `remaining` counts items behind it.
    AwaitingRename { head_name: String, remaining: usize },
    Uploading { name: String },
}

#[derive(Debug)]
pub enum QueueEvent {
    Enqueued(QueueItem),
    Confirmed { name: String },
    Cancelled,
    UploadFinished,
}

/// Result of one confirmed upload. Upload failures are reported here, not as `Err`.
#[derive(Debug)]
pub struct UploadReport {
    pub name: String,
    pub item: QueueItem,
    pub error: Option<ClientError>,
}

impl UploadReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Default)]
pub struct UploadQueue {
    pending: VecDeque<QueueItem>,
    state: WorkflowState,
}

impl UploadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn head(&self) -> Option<&QueueItem> {
        self.pending.front()
    }

    /// Items waiting, excluding any upload already in flight.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn enqueue(&mut self, item: QueueItem) -> &WorkflowState {
        // Enqueue is accepted in every state.
        let _ = self.step(QueueEvent::Enqueued(item));
        &self.state
    }

    pub fn enqueue_all(&mut self, items: impl IntoIterator<Item = QueueItem>) -> &WorkflowState {
        for item in items {
            self.enqueue(item);
        }
        &self.state
    }

    /// Decodes a pasted `data:` URL and queues it as `pasted-file-<ms>`.
    ///
    /// A decode failure leaves the queue untouched.
    pub fn enqueue_data_url(
        &mut self,
        text: &str,
        now_unix_ms: u64,
    ) -> Result<&WorkflowState, ClientError> {
        let decoded = decode_data_url(text)?;
        let item = QueueItem::new(
            decoded.bytes,
            pasted_file_name(now_unix_ms),
            Some(decoded.mime),
        );
        Ok(self.enqueue(item))
    }

    /// Takes the head for upload under `name`. Whitespace-only names are rejected
    /// without dequeuing anything.
    pub fn begin_upload(&mut self, name: &str) -> Result<QueueItem, ClientError> {
        self.step(QueueEvent::Confirmed {
            name: name.trim().to_owned(),
        })?
        .ok_or(ClientError::EmptyQueue)
    }

    pub fn finish_upload(&mut self) -> &WorkflowState {
        let _ = self.step(QueueEvent::UploadFinished);
        &self.state
    }

    pub fn cancel(&mut self) -> Result<QueueItem, ClientError> {
        self.step(QueueEvent::Cancelled)?.ok_or(ClientError::EmptyQueue)
    }

    /// Confirms the head under `name`, uploads it with overwrite enabled and
    /// re-evaluates the queue once the store has answered.
    ///
    /// Holding `&mut self` across the upload keeps a second confirm from
    /// starting before this completion has been applied.
    pub async fn confirm_and_upload<O>(
        &mut self,
        store: &O,
        name: &str,
        status: &StatusSink,
    ) -> Result<UploadReport, ClientError>
    where
        O: ObjectStore + ?Sized,
    {
        let mut item = self.begin_upload(name)?;
        let name = name.trim().to_owned();
        status.info(format!("Uploading {name}... 0%"));

        let progress_status = status.clone();
        let progress_name = name.clone();
        let progress: ProgressFn = Arc::new(move |p| {
            progress_status.info(format!("Uploading {progress_name}... {}%", p.percent()));
        });
        let request = UploadRequest {
            name: name.clone(),
            payload: item.payload.clone(),
            content_type: item.content_type.clone(),
            upsert: true,
        };

        let error = match store.upload(request, progress).await {
            Ok(()) => {
                item.status = ItemStatus::Done;
                info!(name = %name, bytes = item.payload.len(), "upload complete");
                status.info(format!("Uploaded {name} successfully!"));
                None
            }
            Err(err) => {
                item.status = ItemStatus::Failed;
                warn!(name = %name, "upload failed: {err}");
                status.error(format!("Failed to upload {name}."));
                Some(err)
            }
        };

        self.finish_upload();
        Ok(UploadReport { name, item, error })
    }

    fn step(&mut self, event: QueueEvent) -> Result<Option<QueueItem>, ClientError> {
        use QueueEvent as E;
        use WorkflowState as S;

        let (next, taken) = match (&self.state, event) {
            (S::Uploading { name }, E::Enqueued(item)) => {
                self.pending.push_back(item);
                (S::Uploading { name: name.clone() }, None)
            }
            (S::Uploading { .. }, E::Confirmed { .. } | E::Cancelled) => {
                return Err(ClientError::UploadInFlight);
            }
            (S::Uploading { .. }, E::UploadFinished) => (Self::settled(&self.pending), None),
            (S::Empty, E::Confirmed { .. } | E::Cancelled) => {
                return Err(ClientError::EmptyQueue);
            }
            (S::Empty | S::AwaitingRename { .. }, E::Enqueued(item)) => {
                self.pending.push_back(item);
                (Self::settled(&self.pending), None)
            }
            (S::Empty | S::AwaitingRename { .. }, E::UploadFinished) => {
                (Self::settled(&self.pending), None)
            }
            (S::AwaitingRename { .. }, E::Confirmed { name }) => {
                if name.is_empty() {
                    return Err(CoreError::EmptyFileName.into());
                }
                let mut item = self.pending.pop_front().ok_or(ClientError::EmptyQueue)?;
                item.status = ItemStatus::Uploading;
                (S::Uploading { name }, Some(item))
            }
            (S::AwaitingRename { .. }, E::Cancelled) => {
                let item = self.pending.pop_front().ok_or(ClientError::EmptyQueue)?;
                (Self::settled(&self.pending), Some(item))
            }
        };

        self.state = next;
        Ok(taken)
    }

    fn settled(pending: &VecDeque<QueueItem>) -> WorkflowState {
        match pending.front() {
            Some(head) => WorkflowState::AwaitingRename {
                head_name: head.proposed_name.clone(),
                remaining: pending.len() - 1,
            },
            None => WorkflowState::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str) -> QueueItem {
        QueueItem::new(Bytes::from_static(b"data"), name, None)
    }

    #[test]
    fn enqueue_exposes_only_the_head() {
        let mut queue = UploadQueue::new();
        assert_eq!(queue.state(), &WorkflowState::Empty);

        queue.enqueue_all([item("a.txt"), item("b.txt")]);
        assert_eq!(
            queue.state(),
            &WorkflowState::AwaitingRename {
                head_name: "a.txt".to_owned(),
                remaining: 1
            }
        );
    }

    #[test]
    fn blank_name_keeps_the_head() {
        let mut queue = UploadQueue::new();
        queue.enqueue(item("a.txt"));

        let err = queue.begin_upload("   ").unwrap_err();
        assert!(matches!(err, ClientError::Core(CoreError::EmptyFileName)));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.head().unwrap().proposed_name, "a.txt");
    }

    #[test]
    fn confirm_and_cancel_are_rejected_while_uploading() {
        let mut queue = UploadQueue::new();
        queue.enqueue_all([item("a.txt"), item("b.txt")]);

        let taken = queue.begin_upload(" renamed.txt ").unwrap();
        assert_eq!(taken.status, ItemStatus::Uploading);
        assert_eq!(
            queue.state(),
            &WorkflowState::Uploading {
                name: "renamed.txt".to_owned()
            }
        );
        assert!(matches!(queue.begin_upload("b.txt"), Err(ClientError::UploadInFlight)));
        assert!(matches!(queue.cancel(), Err(ClientError::UploadInFlight)));

        queue.enqueue(item("c.txt"));
        assert!(matches!(queue.state(), WorkflowState::Uploading { .. }));

        queue.finish_upload();
        assert_eq!(
            queue.state(),
            &WorkflowState::AwaitingRename {
                head_name: "b.txt".to_owned(),
                remaining: 1
            }
        );
    }

    #[test]
    fn empty_queue_rejects_confirm_and_cancel() {
        let mut queue = UploadQueue::new();
        assert!(matches!(queue.cancel(), Err(ClientError::EmptyQueue)));
        assert!(matches!(queue.begin_upload("x"), Err(ClientError::EmptyQueue)));
    }

    #[test]
    fn cancel_drops_head_and_reevaluates() {
        let mut queue = UploadQueue::new();
        queue.enqueue(item("a.txt"));
        let dropped = queue.cancel().unwrap();
        assert_eq!(dropped.proposed_name, "a.txt");
        assert_eq!(queue.state(), &WorkflowState::Empty);
    }
}
