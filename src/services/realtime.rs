//! # Realtime Completion Watcher
//!
//! [`CompletionWatcher`] over a Phoenix-style realtime WebSocket. Each
//! subscription opens its own socket, joins topic `realtime:messages:{id}` for
//! inserts into the conversation's messages, and forwards assistant rows as
//! [`ReplyEvent`]s.
//!
//! ## Reconnects:
//! A dropped socket is reopened after `min(1000 * 2^attempt, 8000)` ms, for at
//! most `max_reconnect_attempts` attempts. When they run out the subscription's
//! channel closes and the controller falls back to `Connecting`.

use crate::conversation::state::ReplyEvent;
use crate::conversation::watcher::{
    CompletionWatcher, ReplySubscription, SubscriptionHandle, SUBSCRIBER_BUFFER,
};
use crate::error::TurnError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const BASE_RECONNECT_DELAY_MS: u64 = 1000;
const MAX_RECONNECT_DELAY_MS: u64 = 8000;

/// Delay before reconnect attempt number `attempt` (zero-based).
pub fn reconnect_delay(attempt: u32) -> Duration {
    let ms = BASE_RECONNECT_DELAY_MS
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(MAX_RECONNECT_DELAY_MS);
    Duration::from_millis(ms)
}

pub fn topic_for(conversation_id: &str) -> String {
    format!("realtime:messages:{}", conversation_id)
}

/// Extract an assistant reply for `conversation_id` from one socket frame.
///
/// Expects a `postgres_changes` event whose `payload.data` carries an `INSERT`
/// and the inserted `record`. Anything else yields `None`.
pub fn parse_reply(raw: &str, conversation_id: &str) -> Option<ReplyEvent> {
    let frame: Value = serde_json::from_str(raw).ok()?;
    if frame.get("event").and_then(Value::as_str) != Some("postgres_changes") {
        return None;
    }

    let data = frame.get("payload")?.get("data")?;
    if data.get("type").and_then(Value::as_str) != Some("INSERT") {
        return None;
    }

    let record = data.get("record")?;
    if record.get("chat_id").and_then(Value::as_str) != Some(conversation_id) {
        return None;
    }
    if record.get("role").and_then(Value::as_str) != Some("assistant") {
        return None;
    }

    let reply_id = match record.get("id")? {
        Value::String(id) => id.clone(),
        Value::Number(id) => id.to_string(),
        _ => return None,
    };
    let text = record.get("text").and_then(Value::as_str)?.trim();
    if text.is_empty() {
        return None;
    }

    Some(ReplyEvent::new(reply_id, text))
}

/// Why one socket session ended.
enum SocketEnd {
    Unsubscribed,
    ReceiverGone,
    Dropped(String),
}

#[derive(Debug, Clone)]
pub struct RealtimeWatcher {
    url: String,
    api_key: Option<String>,
    max_reconnect_attempts: u32,
}

impl RealtimeWatcher {
    pub fn new(url: String, api_key: Option<String>, max_reconnect_attempts: u32) -> Self {
        Self {
            url,
            api_key,
            max_reconnect_attempts,
        }
    }

    fn endpoint(&self) -> String {
        match self.api_key.as_deref() {
            Some(key) if !key.is_empty() => {
                let separator = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{}apikey={}&vsn=1.0.0", self.url, separator, key)
            }
            _ => self.url.clone(),
        }
    }

    /// Open a socket and join the conversation's topic.
    async fn connect(&self, conversation_id: &str) -> Result<Socket, String> {
        let (mut socket, _) = tokio_tungstenite::connect_async(self.endpoint())
            .await
            .map_err(|e| e.to_string())?;

        let join = json!({
            "topic": topic_for(conversation_id),
            "event": "phx_join",
            "payload": {
                "config": {
                    "postgres_changes": [{
                        "event": "INSERT",
                        "schema": "public",
                        "table": "messages",
                        "filter": format!("chat_id=eq.{}", conversation_id)
                    }]
                }
            },
            "ref": "1"
        });
        socket
            .send(Message::Text(join.to_string()))
            .await
            .map_err(|e| e.to_string())?;

        debug!(conversation_id, "Joined realtime topic");
        Ok(socket)
    }

    async fn run(
        self,
        conversation_id: String,
        mut socket: Socket,
        tx: mpsc::Sender<ReplyEvent>,
        handle: SubscriptionHandle,
    ) {
        loop {
            let reason = match pump(socket, &conversation_id, &tx, &handle).await {
                SocketEnd::Unsubscribed | SocketEnd::ReceiverGone => {
                    debug!(%conversation_id, "Realtime subscription ended");
                    return;
                }
                SocketEnd::Dropped(reason) => reason,
            };
            warn!(%conversation_id, %reason, "Realtime socket dropped");

            match self.reconnect(&conversation_id, &handle).await {
                Some(reopened) => socket = reopened,
                // Dropping `tx` closes the subscription
                None => return,
            }
        }
    }

    async fn reconnect(&self, conversation_id: &str, handle: &SubscriptionHandle) -> Option<Socket> {
        for attempt in 0..self.max_reconnect_attempts {
            let delay = reconnect_delay(attempt);
            tokio::select! {
                biased;
                _ = handle.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.connect(conversation_id).await {
                Ok(socket) => {
                    info!(conversation_id, attempt = attempt + 1, "Realtime socket reconnected");
                    return Some(socket);
                }
                Err(err) => {
                    warn!(conversation_id, attempt = attempt + 1, error = %err, "Realtime reconnect failed");
                }
            }
        }

        warn!(
            conversation_id,
            attempts = self.max_reconnect_attempts,
            "Realtime reconnect attempts exhausted"
        );
        None
    }
}

async fn pump(
    socket: Socket,
    conversation_id: &str,
    tx: &mpsc::Sender<ReplyEvent>,
    handle: &SubscriptionHandle,
) -> SocketEnd {
    let (mut write, mut read) = socket.split();
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
        HEARTBEAT_INTERVAL,
    );
    let mut heartbeat_ref: u64 = 1;

    loop {
        tokio::select! {
            biased;
            _ = handle.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return SocketEnd::Unsubscribed;
            }
            _ = tx.closed() => {
                let _ = write.send(Message::Close(None)).await;
                return SocketEnd::ReceiverGone;
            }
            _ = heartbeat.tick() => {
                heartbeat_ref += 1;
                let beat = json!({
                    "topic": "phoenix",
                    "event": "heartbeat",
                    "payload": {},
                    "ref": heartbeat_ref.to_string()
                });
                if let Err(err) = write.send(Message::Text(beat.to_string())).await {
                    return SocketEnd::Dropped(format!("heartbeat failed: {}", err));
                }
            }
            frame = read.next() => {
                let raw = match frame {
                    Some(Ok(Message::Text(text))) => text.to_string(),
                    Some(Ok(Message::Close(_))) | None => {
                        return SocketEnd::Dropped("socket closed".to_string());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => return SocketEnd::Dropped(err.to_string()),
                };

                if let Some(event) = parse_reply(&raw, conversation_id) {
                    debug!(conversation_id, reply_id = %event.reply_id, "Reply received over realtime");
                    if tx.send(event).await.is_err() {
                        return SocketEnd::ReceiverGone;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl CompletionWatcher for RealtimeWatcher {
    async fn subscribe(&self, conversation_id: &str) -> Result<ReplySubscription, TurnError> {
        let socket = self
            .connect(conversation_id)
            .await
            .map_err(TurnError::WatcherUnavailable)?;

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let handle = SubscriptionHandle::new();
        tokio::spawn(self.clone().run(
            conversation_id.to_string(),
            socket,
            tx,
            handle.clone(),
        ));

        info!(conversation_id, "Realtime subscription opened");
        Ok(ReplySubscription::new(rx, handle))
    }
}
