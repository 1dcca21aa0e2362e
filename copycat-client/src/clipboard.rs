use arboard::Clipboard;
use tracing::debug;

use crate::error::ClientError;

/// Clipboard text access for the poll loop and the copy action.
pub trait ClipboardAccess {
    /// Current clipboard text. An empty or non-text clipboard yields an empty string.
    fn read_text(&mut self) -> Result<String, ClientError>;

    fn write_text(&mut self, text: &str) -> Result<(), ClientError>;
}

/// The operating system clipboard, opened on first read.
#[derive(Default)]
pub struct SystemClipboard {
    inner: Option<Clipboard>,
}

impl SystemClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&mut self) -> Result<&mut Clipboard, ClientError> {
        if self.inner.is_none() {
            self.inner = Some(Clipboard::new().map_err(map_clipboard_error)?);
        }
        self.inner
            .as_mut()
            .ok_or_else(|| ClientError::ClipboardUnavailable("clipboard not initialised".to_owned()))
    }
}

impl ClipboardAccess for SystemClipboard {
    fn read_text(&mut self) -> Result<String, ClientError> {
        match self.handle()?.get_text() {
            Ok(text) => Ok(text),
            Err(arboard::Error::ContentNotAvailable) => Ok(String::new()),
            Err(err) => {
                // Drop the handle so the next read reopens it.
                self.inner = None;
                Err(map_clipboard_error(err))
            }
        }
    }

    fn write_text(&mut self, text: &str) -> Result<(), ClientError> {
        if let Err(err) = self.handle()?.set_text(text) {
            self.inner = None;
            return Err(map_clipboard_error(err));
        }
        Ok(())
    }
}

fn map_clipboard_error(err: arboard::Error) -> ClientError {
    match err {
        arboard::Error::ClipboardNotSupported => ClientError::PermissionDenied,
        other => {
            debug!("clipboard access failed: {other}");
            ClientError::ClipboardUnavailable(other.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClipboardPermission {
    #[default]
    Unknown,
    Granted,
    Denied,
}

/// Last clipboard value written into the compose field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClipboardSnapshot {
    last_value: Option<String>,
}

impl ClipboardSnapshot {
    /// Records `text` and reports whether the compose field should take it.
    pub fn observe(&mut self, text: &str) -> bool {
        if text.is_empty() || self.last_value.as_deref() == Some(text) {
            return false;
        }
        self.last_value = Some(text.to_owned());
        true
    }

    pub fn last_value(&self) -> Option<&str> {
        self.last_value.as_deref()
    }
}
