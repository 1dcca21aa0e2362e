use copycat_core::CoreError;
use thiserror::Error;

/// Coarse classification used when deciding how loudly to report a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Forbidden,
    Upstream,
    Transport,
    Permission,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("HTTP error! status: {status} - {message}")]
    Upstream { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("clipboard permission denied")]
    PermissionDenied,
    #[error("clipboard unavailable: {0}")]
    ClipboardUnavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("realtime error: {0}")]
    Realtime(String),
    #[error("no file is waiting for confirmation")]
    EmptyQueue,
    #[error("an upload is already in progress")]
    UploadInFlight,
    #[error("No direct image found on the page.")]
    NoDirectImage,
    #[error("Could not load preview for {name}.")]
    Preview { name: String, reason: String },
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Core(CoreError::DomainNotAllowed { .. }) => ErrorKind::Forbidden,
            ClientError::Upstream { status: 403, .. } => ErrorKind::Forbidden,
            ClientError::Core(_)
            | ClientError::EmptyQueue
            | ClientError::UploadInFlight
            | ClientError::NoDirectImage => ErrorKind::Validation,
            ClientError::Upstream { .. } | ClientError::Storage(_) | ClientError::Preview { .. } => {
                ErrorKind::Upstream
            }
            ClientError::Transport(_)
            | ClientError::Realtime(_)
            | ClientError::ClipboardUnavailable(_) => ErrorKind::Transport,
            ClientError::PermissionDenied => ErrorKind::Permission,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => ClientError::Upstream {
                status: status.as_u16(),
                message: status_reason(status),
            },
            None => ClientError::Transport(err.to_string()),
        }
    }
}

fn status_reason(status: reqwest::StatusCode) -> String {
    status
        .canonical_reason()
        .map(str::to_owned)
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
}

/// Passes 2xx responses through; anything else becomes [`ClientError::Upstream`]
/// carrying the response body, or the reason phrase when the body is blank.
pub(crate) async fn expect_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = if body.trim().is_empty() {
        status_reason(status)
    } else {
        body
    };
    Err(ClientError::Upstream {
        status: status.as_u16(),
        message,
    })
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Realtime(err.to_string())
    }
}
