use chrono::{DateTime, Utc};
use copycat_core::MessageRow;

use crate::{
    clipboard::{ClipboardPermission, ClipboardSnapshot},
    realtime::Channel,
    upload_queue::UploadQueue,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileView {
    pub name: String,
    pub url: String,
}

/// Everything the user currently sees. Lists are rebuilt wholesale on every refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionView {
    pub messages: Vec<MessageRow>,
    pub files: Vec<FileView>,
    pub compose: String,
    /// Name proposed for the queue head while it waits for confirmation.
    pub upload_prompt: Option<String>,
    pub search: String,
    /// Id of the highlighted message.
    pub selected: Option<i64>,
}

impl SessionView {
    /// Messages whose title or content contains the search term, ignoring case.
    pub fn visible_messages(&self) -> impl Iterator<Item = &MessageRow> {
        let term = self.search.to_lowercase();
        self.messages
            .iter()
            .filter(move |row| message_matches(row, &term))
    }

    /// Moves the highlight to the next visible message, wrapping at the end.
    pub fn select_next(&mut self) -> Option<i64> {
        let visible: Vec<i64> = self.visible_messages().map(|row| row.id).collect();
        if visible.is_empty() {
            self.selected = None;
            return None;
        }
        let next = match self
            .selected
            .and_then(|id| visible.iter().position(|v| *v == id))
        {
            Some(index) => (index + 1) % visible.len(),
            None => 0,
        };
        self.selected = Some(visible[next]);
        self.selected
    }

    pub(crate) fn drop_stale_selection(&mut self) {
        if let Some(id) = self.selected
            && !self.messages.iter().any(|row| row.id == id)
        {
            self.selected = None;
        }
    }
}

fn message_matches(row: &MessageRow, lowered_term: &str) -> bool {
    lowered_term.is_empty()
        || row.content.to_lowercase().contains(lowered_term)
        || row
            .title
            .as_deref()
            .is_some_and(|title| title.to_lowercase().contains(lowered_term))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSubscription {
    pub channel: Channel,
    /// When the last change event for this channel arrived.
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl SyncSubscription {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            last_seen_at: None,
        }
    }
}

/// Per-session state owned by the coordinator task.
#[derive(Debug)]
pub struct SessionContext {
    pub queue: UploadQueue,
    pub clipboard: ClipboardSnapshot,
    pub permission: ClipboardPermission,
    pub subscriptions: Vec<SyncSubscription>,
    pub view: SessionView,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self {
            queue: UploadQueue::new(),
            clipboard: ClipboardSnapshot::default(),
            permission: ClipboardPermission::Unknown,
            subscriptions: Channel::ALL.into_iter().map(SyncSubscription::new).collect(),
            view: SessionView::default(),
        }
    }
}

impl SessionContext {
    pub fn subscription(&self, channel: Channel) -> Option<&SyncSubscription> {
        self.subscriptions.iter().find(|s| s.channel == channel)
    }

    pub(crate) fn mark_seen(&mut self, channel: Channel, at: DateTime<Utc>) {
        if let Some(subscription) = self.subscriptions.iter_mut().find(|s| s.channel == channel) {
            subscription.last_seen_at = Some(at);
        }
    }
}
