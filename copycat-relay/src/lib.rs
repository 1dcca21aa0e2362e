use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use copycat_core::{
    CONFIG_PATH, ClientConfig, CoreError, DEFAULT_ALLOWED_DOMAINS, DEFAULT_CONTENT_TYPE,
    DomainAllowlist, FETCH_PROXY_PATH, FILENAME_HEADER, HEALTHZ_PATH, RELAY_USER_AGENT,
    filename_from_content_disposition,
};
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub allowlist: DomainAllowlist,
    /// Deadline for connecting and receiving the upstream headers. The body
    /// stream is not bounded by it. `None` disables the deadline.
    pub fetch_timeout: Option<Duration>,
    pub user_agent: String,
    /// Served verbatim from `/config`.
    pub storage: Option<ClientConfig>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            allowlist: DomainAllowlist::new(DEFAULT_ALLOWED_DOMAINS),
            fetch_timeout: Some(DEFAULT_FETCH_TIMEOUT),
            user_agent: RELAY_USER_AGENT.to_owned(),
            storage: None,
        }
    }
}

#[derive(Debug)]
struct RelayShared {
    config: RelayConfig,
    http: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<RelayShared>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .user_agent(config.user_agent.clone());
        if let Some(timeout) = config.fetch_timeout {
            builder = builder.connect_timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|err| RelayError::ClientBuild(err.to_string()))?;

        Ok(Self {
            inner: Arc::new(RelayShared { config, http }),
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Rejected(#[from] CoreError),
    #[error("{message}")]
    Upstream { status: StatusCode, message: String },
    #[error("Error fetching the URL: {0}")]
    Transport(String),
    #[error("storage configuration is not set on the relay")]
    ConfigUnavailable,
    #[error("failed to build outbound HTTP client: {0}")]
    ClientBuild(String),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Rejected(CoreError::DomainNotAllowed { .. }) => StatusCode::FORBIDDEN,
            RelayError::Rejected(_) => StatusCode::BAD_REQUEST,
            RelayError::Upstream { status, .. } => *status,
            RelayError::Transport(_)
            | RelayError::ConfigUnavailable
            | RelayError::ClientBuild(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

pub struct ProxiedResource {
    pub content_type: String,
    pub filename_hint: Option<String>,
    pub body: BoxStream<'static, Result<Bytes, reqwest::Error>>,
}

impl std::fmt::Debug for ProxiedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxiedResource")
            .field("content_type", &self.content_type)
            .field("filename_hint", &self.filename_hint)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum ProxyOutcome {
    Success(ProxiedResource),
    Failure { status: StatusCode, message: String },
}

impl From<RelayError> for ProxyOutcome {
    fn from(err: RelayError) -> Self {
        ProxyOutcome::Failure {
            status: err.status(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ProxyOutcome {
    fn into_response(self) -> Response {
        match self {
            ProxyOutcome::Success(resource) => {
                let content_type = HeaderValue::from_str(&resource.content_type)
                    .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
                let mut response = Body::from_stream(resource.body).into_response();
                let headers = response.headers_mut();
                headers.insert(header::CONTENT_TYPE, content_type);
                if let Some(name) = resource.filename_hint {
                    match HeaderValue::from_bytes(name.as_bytes()) {
                        Ok(value) => {
                            headers.insert(HeaderName::from_static(FILENAME_HEADER), value);
                        }
                        Err(_) => warn!("dropping filename hint that is not a valid header value"),
                    }
                }
                response
            }
            ProxyOutcome::Failure { status, message } => (status, message).into_response(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FetchProxyQuery {
    pub url: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(FETCH_PROXY_PATH, get(fetch_proxy_handler))
        .route(CONFIG_PATH, get(config_handler))
        .route(HEALTHZ_PATH, get(healthz_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    info!(
        "relay listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .await
        .map_err(|err| err.to_string())
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

async fn config_handler(State(state): State<AppState>) -> Result<Json<ClientConfig>, RelayError> {
    state
        .config()
        .storage
        .clone()
        .map(Json)
        .ok_or(RelayError::ConfigUnavailable)
}

async fn fetch_proxy_handler(
    State(state): State<AppState>,
    Query(query): Query<FetchProxyQuery>,
) -> Response {
    relay_fetch(&state, query.url.as_deref()).await.into_response()
}

/// Validates `raw_url`, fetches it and hands back the upstream stream.
///
/// Every failure is folded into [`ProxyOutcome::Failure`].
pub async fn relay_fetch(state: &AppState, raw_url: Option<&str>) -> ProxyOutcome {
    match fetch_upstream(state, raw_url).await {
        Ok(resource) => ProxyOutcome::Success(resource),
        Err(err) => {
            match &err {
                RelayError::Rejected(reason) => warn!("rejected relay request: {}", reason),
                RelayError::Upstream { status, .. } => {
                    warn!("upstream answered {} for {:?}", status, raw_url)
                }
                other => error!("relay fetch failed for {:?}: {}", raw_url, other),
            }
            err.into()
        }
    }
}

async fn fetch_upstream(
    state: &AppState,
    raw_url: Option<&str>,
) -> Result<ProxiedResource, RelayError> {
    let url = state.config().allowlist.validate(raw_url)?;

    let request = state.inner.http.get(url.clone()).send();
    let sent = match state.config().fetch_timeout {
        Some(limit) => tokio::time::timeout(limit, request).await.map_err(|_| {
            RelayError::Transport(format!(
                "request timed out after {}s without a response",
                limit.as_secs_f32()
            ))
        })?,
        None => request.await,
    };
    let upstream = sent.map_err(|err| RelayError::Transport(describe_transport_error(&err)))?;

    let status = upstream.status();
    if !status.is_success() {
        return Err(RelayError::Upstream {
            status,
            message: status
                .canonical_reason()
                .map(str::to_owned)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
        });
    }

    let headers = upstream.headers();
    let filename_hint = headers
        .get(header::CONTENT_DISPOSITION)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .and_then(|value| filename_from_content_disposition(&value));
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_owned());

    info!(
        "relaying {} (final url {}, type {}, hint {:?})",
        url,
        upstream.url(),
        content_type,
        filename_hint
    );

    let source = url.to_string();
    let body = upstream
        .bytes_stream()
        .inspect_err(move |err| warn!("upstream stream for {} broke: {}", source, err))
        .boxed();

    Ok(ProxiedResource {
        content_type,
        filename_hint,
        body,
    })
}

fn describe_transport_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("request timed out ({err})")
    } else if err.is_redirect() {
        format!("too many redirects ({err})")
    } else {
        let mut message = err.to_string();
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = std::error::Error::source(cause);
        }
        message
    }
}
