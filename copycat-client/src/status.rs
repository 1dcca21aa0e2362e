use std::sync::Arc;

use tokio::sync::watch;

/// Transient one-line status shown to the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusLine {
    pub text: String,
    pub is_error: bool,
}

/// Publishes the latest status line. Readers only ever see the newest value.
#[derive(Debug, Clone)]
pub struct StatusSink {
    tx: Arc<watch::Sender<StatusLine>>,
}

impl Default for StatusSink {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSink {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StatusLine::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn info(&self, text: impl Into<String>) {
        self.tx.send_replace(StatusLine {
            text: text.into(),
            is_error: false,
        });
    }

    pub fn error(&self, text: impl Into<String>) {
        self.tx.send_replace(StatusLine {
            text: text.into(),
            is_error: true,
        });
    }

    pub fn clear(&self) {
        self.tx.send_replace(StatusLine::default());
    }

    pub fn current(&self) -> StatusLine {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusLine> {
        self.tx.subscribe()
    }
}
