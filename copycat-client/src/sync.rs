//! Keeps the session view in step with the store and the local clipboard.
//!
//! Two inputs drive updates: row-change events pushed by the realtime feed, and
//! a clipboard poll that runs once permission has been granted. Both, along
//! with user commands, are handled on the single task running
//! [`SyncCoordinator::run`], so the session state needs no locking.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use copycat_core::{CLIPBOARD_POLL_INTERVAL_MS, MAX_RECENT_MESSAGES};
use tokio::{
    sync::{mpsc, watch},
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    clipboard::{ClipboardAccess, ClipboardPermission},
    error::ClientError,
    realtime::{ChangeEvent, Channel},
    session::{FileView, SessionContext, SessionView},
    status::StatusSink,
    storage::{MessageStore, ObjectStore, remove_all_files, share_message},
    upload_queue::{QueueItem, UploadReport, WorkflowState},
};

const PERMISSION_DENIED_STATUS: &str = "Clipboard access denied. Automatic paste is off.";

#[derive(Debug)]
pub enum SessionCommand {
    /// The compose field gained focus; asks for clipboard access the first time.
    FocusCompose,
    Enqueue(QueueItem),
    PasteDataUrl(String),
    Confirm(String),
    Cancel,
    Share { content: String, title: String },
    DeleteMessage(i64),
    CopyMessage(i64),
    Search(String),
    SelectNextMessage,
    ClearMessages,
    DeleteFile(String),
    ClearFiles,
    Refresh(Channel),
    Shutdown,
}

pub struct SyncCoordinator<M: ?Sized, O: ?Sized, C> {
    messages: Arc<M>,
    files: Arc<O>,
    clipboard: C,
    context: SessionContext,
    status: StatusSink,
    view_tx: watch::Sender<SessionView>,
    poll_interval: Duration,
}

impl<M, O, C> SyncCoordinator<M, O, C>
where
    M: MessageStore + ?Sized,
    O: ObjectStore + ?Sized,
    C: ClipboardAccess,
{
    pub fn new(messages: Arc<M>, files: Arc<O>, clipboard: C, status: StatusSink) -> Self {
        let (view_tx, _view_rx) = watch::channel(SessionView::default());
        Self {
            messages,
            files,
            clipboard,
            context: SessionContext::default(),
            status,
            view_tx,
            poll_interval: Duration::from_millis(CLIPBOARD_POLL_INTERVAL_MS),
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut SessionContext {
        &mut self.context
    }

    pub fn status(&self) -> &StatusSink {
        &self.status
    }

    pub fn subscribe_view(&self) -> watch::Receiver<SessionView> {
        self.view_tx.subscribe()
    }

    /// Re-queries one list and replaces it wholesale. Returns whether the view changed.
    pub async fn refresh(&mut self, channel: Channel) -> Result<bool, ClientError> {
        let changed = match channel {
            Channel::Messages => {
                let rows = self.messages.recent_messages(MAX_RECENT_MESSAGES).await?;
                let changed = replace_if_changed(&mut self.context.view.messages, rows);
                self.context.view.drop_stale_selection();
                changed
            }
            Channel::FileNotifications => {
                let mut entries = self.files.list().await?;
                entries.sort_by_key(|entry| {
                    std::cmp::Reverse(entry.created_at.as_deref().and_then(parse_timestamp))
                });
                let files = entries
                    .into_iter()
                    .map(|entry| FileView {
                        url: self.files.public_url(&entry.name),
                        name: entry.name,
                    })
                    .collect();
                replace_if_changed(&mut self.context.view.files, files)
            }
        };
        if changed {
            debug!(?channel, "view refreshed");
            self.publish_view();
        }
        Ok(changed)
    }

    pub async fn refresh_all(&mut self) {
        for channel in Channel::ALL {
            if let Err(err) = self.refresh(channel).await {
                warn!(?channel, "refresh failed: {err}");
            }
        }
    }

    pub async fn on_change(&mut self, event: ChangeEvent) {
        self.context.mark_seen(event.channel, event.received_at);
        if let Err(err) = self.refresh(event.channel).await {
            warn!(channel = ?event.channel, "refresh after change failed: {err}");
        }
    }

    /// Called when the compose field gains focus. The first call asks for
    /// clipboard access; later calls do nothing.
    pub fn compose_focused(&mut self) {
        if self.context.permission != ClipboardPermission::Unknown {
            return;
        }
        match self.clipboard.read_text() {
            Ok(text) => {
                info!("clipboard access granted");
                self.context.permission = ClipboardPermission::Granted;
                self.apply_clipboard(&text);
            }
            Err(ClientError::PermissionDenied) => self.deny_clipboard(),
            Err(err) => warn!("clipboard read failed: {err}"),
        }
    }

    /// Returns whether the compose field was updated.
    pub fn poll_clipboard(&mut self) -> bool {
        if self.context.permission != ClipboardPermission::Granted {
            return false;
        }
        match self.clipboard.read_text() {
            Ok(text) => self.apply_clipboard(&text),
            Err(ClientError::PermissionDenied) => {
                self.deny_clipboard();
                false
            }
            Err(err) => {
                debug!("clipboard poll failed: {err}");
                false
            }
        }
    }

    /// Returns `false` once the session should stop.
    pub async fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::FocusCompose => self.compose_focused(),
            SessionCommand::Enqueue(item) => {
                self.context.queue.enqueue(item);
            }
            SessionCommand::PasteDataUrl(text) => {
                if let Err(err) = self.context.queue.enqueue_data_url(&text, now_unix_ms()) {
                    warn!("data URL rejected: {err}");
                    self.status.error("Failed to upload from data URL.");
                }
            }
            SessionCommand::Confirm(name) => {
                let result = self
                    .context
                    .queue
                    .confirm_and_upload(self.files.as_ref(), &name, &self.status)
                    .await;
                match result {
                    Ok(UploadReport { error: None, .. }) => {
                        self.refresh_logged(Channel::FileNotifications).await
                    }
                    Ok(UploadReport { error: Some(_), .. }) => {}
                    Err(err) => self.status.error(err.to_string()),
                }
            }
            SessionCommand::Cancel => {
                if let Err(err) = self.context.queue.cancel() {
                    self.status.error(err.to_string());
                }
            }
            SessionCommand::Share { content, title } => {
                match share_message(self.messages.as_ref(), &content, &title).await {
                    Ok(true) => {
                        self.status.info("Shared!");
                        self.refresh_logged(Channel::Messages).await;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!("share failed: {err}");
                        self.status.error("Failed to share message.");
                    }
                }
            }
            SessionCommand::DeleteMessage(id) => {
                if let Err(err) = self.messages.delete_message(id).await {
                    warn!(id, "delete message failed: {err}");
                    self.status.error("Failed to delete message.");
                } else {
                    self.refresh_logged(Channel::Messages).await;
                }
            }
            SessionCommand::CopyMessage(id) => self.copy_message(id),
            SessionCommand::Search(term) => {
                if self.context.view.search != term {
                    self.context.view.search = term;
                    self.publish_view();
                }
            }
            SessionCommand::SelectNextMessage => {
                let before = self.context.view.selected;
                if self.context.view.select_next() != before {
                    self.publish_view();
                }
            }
            SessionCommand::ClearMessages => match self.messages.clear_messages().await {
                Ok(()) => {
                    self.status.info("All messages have been deleted.");
                    self.refresh_logged(Channel::Messages).await;
                }
                Err(err) => {
                    warn!("clear messages failed: {err}");
                    self.status.error("Failed to reset messages.");
                }
            },
            SessionCommand::DeleteFile(name) => {
                match self.files.remove(std::slice::from_ref(&name)).await {
                    Ok(()) => {
                        self.status.info(format!("Deleted {name}."));
                        self.refresh_logged(Channel::FileNotifications).await;
                    }
                    Err(err) => {
                        warn!(name = %name, "delete file failed: {err}");
                        self.status.error(format!("Failed to delete {name}."));
                    }
                }
            }
            SessionCommand::ClearFiles => match remove_all_files(self.files.as_ref()).await {
                Ok(0) => self.status.info("No files to delete."),
                Ok(count) => {
                    self.status.info(format!("Deleted {count} files."));
                    self.refresh_logged(Channel::FileNotifications).await;
                }
                Err(err) => {
                    warn!("clear files failed: {err}");
                    self.status.error("Failed to delete all files.");
                }
            },
            SessionCommand::Refresh(channel) => self.refresh_logged(channel).await,
            SessionCommand::Shutdown => return false,
        }
        self.sync_upload_prompt();
        true
    }

    /// Drives the session until a shutdown command arrives or the command
    /// channel closes, then hands back the final state.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ChangeEvent>,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> SessionContext {
        self.refresh_all().await;

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut events_open = true;

        loop {
            let polling = self.context.permission == ClipboardPermission::Granted;
            // Pending change events are drained before the next command.
            tokio::select! {
                biased;
                _ = ticker.tick(), if polling => {
                    self.poll_clipboard();
                }
                event = events.recv(), if events_open => {
                    let Some(event) = event else {
                        debug!("change feed closed");
                        events_open = false;
                        continue;
                    };
                    let mut burst = vec![event];
                    while let Ok(next) = events.try_recv() {
                        burst.push(next);
                    }
                    let mut channels = BTreeSet::new();
                    for event in &burst {
                        self.context.mark_seen(event.channel, event.received_at);
                        channels.insert(event.channel);
                    }
                    debug!(events = burst.len(), channels = channels.len(), "coalesced change events");
                    for channel in channels {
                        self.refresh_logged(channel).await;
                    }
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
            }
        }

        info!("session stopped");
        self.context
    }

    async fn refresh_logged(&mut self, channel: Channel) {
        if let Err(err) = self.refresh(channel).await {
            warn!(?channel, "refresh failed: {err}");
        }
    }

    fn sync_upload_prompt(&mut self) {
        let prompt = match self.context.queue.state() {
            WorkflowState::AwaitingRename { head_name, .. } => Some(head_name.clone()),
            WorkflowState::Empty | WorkflowState::Uploading { .. } => None,
        };
        if self.context.view.upload_prompt != prompt {
            self.context.view.upload_prompt = prompt;
            self.publish_view();
        }
    }

    fn copy_message(&mut self, id: i64) {
        let Some(content) = self
            .context
            .view
            .messages
            .iter()
            .find(|row| row.id == id)
            .map(|row| row.content.clone())
        else {
            self.status.error(format!("Message {id} not found."));
            return;
        };
        match self.clipboard.write_text(&content) {
            Ok(()) => {
                // Keep the poll from echoing our own copy into the compose field.
                self.context.clipboard.observe(&content);
                self.status.info("Copied to clipboard!");
            }
            Err(err) => {
                warn!(id, "copy failed: {err}");
                self.status.error("Copy failed.");
            }
        }
    }

    fn apply_clipboard(&mut self, text: &str) -> bool {
        if !self.context.clipboard.observe(text) {
            return false;
        }
        self.context.view.compose = text.to_owned();
        self.publish_view();
        true
    }

    fn deny_clipboard(&mut self) {
        if self.context.permission == ClipboardPermission::Denied {
            return;
        }
        warn!("clipboard access denied, polling disabled");
        self.context.permission = ClipboardPermission::Denied;
        self.status.error(PERMISSION_DENIED_STATUS);
    }

    fn publish_view(&self) {
        self.view_tx.send_replace(self.context.view.clone());
    }
}

fn replace_if_changed<T: PartialEq>(slot: &mut Vec<T>, next: Vec<T>) -> bool {
    if *slot == next {
        return false;
    }
    *slot = next;
    true
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

pub fn now_unix_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
}
