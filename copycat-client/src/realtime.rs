//! Row-change subscriptions over the Phoenix channel websocket protocol.
//!
//! The feed only reports *that* a table changed. Consumers re-query the store
//! after receiving an event, so payload contents are ignored.

use std::time::Duration;

use chrono::{DateTime, Utc};
use copycat_core::{ClientConfig, MESSAGES_TABLE, NOTIFICATIONS_TABLE};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::ClientError;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(12);
const BACKOFF_BASE_MS: u64 = 200;
const BACKOFF_MAX_MS: u64 = 30_000;
const PROTOCOL_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    Messages,
    FileNotifications,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Messages, Channel::FileNotifications];

    pub fn table(self) -> &'static str {
        match self {
            Channel::Messages => MESSAGES_TABLE,
            Channel::FileNotifications => NOTIFICATIONS_TABLE,
        }
    }

    /// Row events the subscription asks for.
    pub fn event_filter(self) -> &'static str {
        match self {
            Channel::Messages => "*",
            Channel::FileNotifications => "INSERT",
        }
    }

    pub fn topic(self) -> String {
        format!("realtime:public:{}", self.table())
    }

    fn from_topic(topic: &str) -> Option<Self> {
        Channel::ALL.into_iter().find(|c| c.topic() == topic)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub channel: Channel,
    pub received_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn now(channel: Channel) -> Self {
        Self {
            channel,
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PhoenixFrame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

pub fn join_frame(channel: Channel, reference: u64) -> String {
    let frame = PhoenixFrame {
        topic: channel.topic(),
        event: "phx_join".to_owned(),
        payload: json!({
            "config": {
                "postgres_changes": [{
                    "event": channel.event_filter(),
                    "schema": "public",
                    "table": channel.table(),
                }]
            }
        }),
        reference: Some(reference.to_string()),
    };
    serde_json::to_string(&frame).unwrap_or_default()
}

pub fn heartbeat_frame(reference: u64) -> String {
    let frame = PhoenixFrame {
        topic: "phoenix".to_owned(),
        event: "heartbeat".to_owned(),
        payload: json!({}),
        reference: Some(reference.to_string()),
    };
    serde_json::to_string(&frame).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    Changed(Channel),
    Subscribed(Channel),
    SubscribeFailed { channel: Channel, reason: String },
}

/// Decodes a text frame on one of the watched topics.
///
/// Heartbeat replies, unknown topics and unrecognised events yield `None`.
pub fn decode_frame(text: &str) -> Option<FrameEvent> {
    let frame: PhoenixFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            debug!("ignoring undecodable realtime frame: {err}");
            return None;
        }
    };
    let channel = Channel::from_topic(&frame.topic)?;
    match frame.event.as_str() {
        "postgres_changes" | "INSERT" | "UPDATE" | "DELETE" => Some(FrameEvent::Changed(channel)),
        "phx_reply" | "system" => {
            let status = frame.payload.get("status").and_then(Value::as_str);
            if status == Some("ok") {
                Some(FrameEvent::Subscribed(channel))
            } else {
                Some(FrameEvent::SubscribeFailed {
                    channel,
                    reason: failure_reason(&frame.payload),
                })
            }
        }
        "phx_error" | "phx_close" => Some(FrameEvent::SubscribeFailed {
            channel,
            reason: frame.event.clone(),
        }),
        _ => None,
    }
}

fn failure_reason(payload: &Value) -> String {
    payload
        .pointer("/response/reason")
        .or_else(|| payload.get("message"))
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| payload.to_string())
}

enum SessionEnd {
    ConsumerGone,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct RealtimeFeed {
    config: ClientConfig,
}

impl RealtimeFeed {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn websocket_url(&self) -> Result<Url, ClientError> {
        self.config.validate()?;
        let mut url = Url::parse(self.config.url.trim())
            .map_err(|err| ClientError::Realtime(err.to_string()))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(ClientError::Realtime(format!(
                    "unsupported scheme {other}"
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::Realtime(format!("cannot switch {url} to {scheme}")))?;
        url.set_path("/realtime/v1/websocket");
        url.query_pairs_mut()
            .clear()
            .append_pair("apikey", self.config.key.trim())
            .append_pair("vsn", PROTOCOL_VERSION);
        Ok(url)
    }

    /// Subscribes to `channels` until `events` is closed, reconnecting with backoff.
    pub fn spawn(
        self,
        channels: Vec<Channel>,
        events: mpsc::UnboundedSender<ChangeEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let url = match self.websocket_url() {
                Ok(url) => url,
                Err(err) => {
                    warn!("realtime disabled: {err}");
                    return;
                }
            };

            let mut attempt: u32 = 0;
            loop {
                match run_session(&url, &channels, &events, &mut attempt).await {
                    Ok(SessionEnd::ConsumerGone) => return,
                    Ok(SessionEnd::Disconnected) => info!("realtime connection closed"),
                    Err(err) => warn!(attempt, "realtime session failed: {err}"),
                }
                if events.is_closed() {
                    return;
                }

                attempt = attempt.saturating_add(1);
                let shift = attempt.saturating_sub(1).min(16);
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << shift).min(BACKOFF_MAX_MS);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                    _ = events.closed() => return,
                }
            }
        })
    }
}

async fn run_session(
    url: &Url,
    channels: &[Channel],
    events: &mpsc::UnboundedSender<ChangeEvent>,
    attempt: &mut u32,
) -> Result<SessionEnd, ClientError> {
    let (stream, _) = timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
        .await
        .map_err(|_| ClientError::Realtime(format!("connect timed out after {CONNECT_TIMEOUT:?}")))??;
    *attempt = 0;
    info!(channels = channels.len(), "realtime connected");

    let (mut write, mut read) = stream.split();
    let mut reference: u64 = 0;
    for channel in channels {
        reference += 1;
        write
            .send(Message::Text(join_frame(*channel, reference).into()))
            .await?;
        debug!(topic = %channel.topic(), "sent realtime join");
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                reference += 1;
                write.send(Message::Text(heartbeat_frame(reference).into())).await?;
            }
            _ = events.closed() => return Ok(SessionEnd::ConsumerGone),
            next = read.next() => {
                let Some(message) = next else {
                    return Ok(SessionEnd::Disconnected);
                };
                match message? {
                    Message::Text(text) => match decode_frame(text.as_str()) {
                        Some(FrameEvent::Changed(channel)) => {
                            if events.send(ChangeEvent::now(channel)).is_err() {
                                return Ok(SessionEnd::ConsumerGone);
                            }
                        }
                        Some(FrameEvent::Subscribed(channel)) => {
                            info!(topic = %channel.topic(), "realtime channel subscribed");
                        }
                        Some(FrameEvent::SubscribeFailed { channel, reason }) => {
                            warn!(topic = %channel.topic(), "realtime subscription failed: {reason}");
                        }
                        None => {}
                    },
                    Message::Close(_) => return Ok(SessionEnd::Disconnected),
                    _ => {}
                }
            }
        }
    }
}
