//! Client session adapter: one logical chat window over a live connection.
//!
//! The adapter keeps a socket open against the chat server (announcing its
//! routing identity as the first frame), renders pushed payloads into a
//! local transcript, and reconnects with backoff when the transport drops.
//! Sends always take the reliable path first; the live publish, the local
//! append and the unread marker are gated on confirmed persistence.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use leasy_core::errors::ChatError;
use leasy_core::wire::{ChatPayload, ClientFrame, RoutingIdentity};

use crate::api::{Conversation, ConversationResponse, SendMessageResponse, StoredMessage};
use crate::backoff::Backoff;

/// Configuration for one chat window's session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Base URL of the chat server, e.g. "http://127.0.0.1:8080".
    pub server_url: String,
    pub identity: RoutingIdentity,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
}

impl SessionConfig {
    pub fn new(server_url: impl Into<String>, identity: RoutingIdentity) -> Self {
        Self {
            server_url: server_url.into(),
            identity,
            reconnect_base: Duration::from_secs(5),
            reconnect_cap: Duration::from_secs(60),
        }
    }

    fn ws_url(&self) -> String {
        let base = self
            .server_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{}/ws", base.trim_end_matches('/'))
    }
}

/// Events surfaced to the embedding UI.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    Connected,
    Message(ChatPayload),
    Reconnecting { attempt: u32, delay: Duration },
}

/// A live chat session for one (sender, counterparty, origin) window.
pub struct ChatSession {
    config: SessionConfig,
    http: reqwest::Client,
    outbound_tx: mpsc::Sender<String>,
    events_tx: broadcast::Sender<SessionEvent>,
    transcript: Arc<Mutex<Vec<ChatPayload>>>,
    driver: JoinHandle<()>,
}

impl ChatSession {
    /// Open the session: spawns the connection driver, which announces the
    /// routing identity and keeps reconnecting until the session is dropped.
    pub fn connect(config: SessionConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (events_tx, _) = broadcast::channel(256);
        let transcript = Arc::new(Mutex::new(Vec::new()));

        let driver = tokio::spawn(drive_connection(
            config.clone(),
            outbound_rx,
            events_tx.clone(),
            Arc::clone(&transcript),
        ));

        Self {
            config,
            http: reqwest::Client::new(),
            outbound_tx,
            events_tx,
            transcript,
            driver,
        }
    }

    /// Subscribe to session events (connection state, incoming messages).
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// The locally-consistent message list for this window. The pull path
    /// (`open`/`fetch`) remains the source of truth for ordering.
    pub fn transcript(&self) -> Vec<ChatPayload> {
        self.transcript.lock().clone()
    }

    /// Create-or-fetch the conversation with the counterparty, seed the
    /// transcript from the reliable path, and acknowledge the counterparty's
    /// messages as read.
    pub async fn open(&self) -> Result<Conversation, ChatError> {
        let resp = self
            .http
            .post(format!("{}/chat/create", self.config.server_url))
            .json(&serde_json::json!({
                "host_id": &self.config.identity.sender,
                "applicant_id": &self.config.identity.counterparty,
            }))
            .send()
            .await
            .map_err(|e| ChatError::NetworkError(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ChatError::PersistenceFailed {
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        let body: ConversationResponse = resp
            .json()
            .await
            .map_err(|e| ChatError::NetworkError(e.to_string()))?;

        *self.transcript.lock() = body
            .conversation
            .messages
            .iter()
            .map(StoredMessage::payload)
            .collect();

        // Opening the window acknowledges everything the counterparty sent.
        self.clear_unread().await;

        Ok(body.conversation)
    }

    /// Refresh a conversation from the reliable path.
    pub async fn fetch(&self, conversation_id: &str) -> Result<Conversation, ChatError> {
        let resp = self
            .http
            .get(format!("{}/chat/c/{conversation_id}", self.config.server_url))
            .send()
            .await
            .map_err(|e| ChatError::NetworkError(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ChatError::PersistenceFailed {
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        let body: ConversationResponse = resp
            .json()
            .await
            .map_err(|e| ChatError::NetworkError(e.to_string()))?;
        Ok(body.conversation)
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<StoredMessage, ChatError> {
        self.send(Some(text.into()), None).await
    }

    pub async fn send_file(&self, file: impl Into<String>) -> Result<StoredMessage, ChatError> {
        self.send(None, Some(file.into())).await
    }

    /// Send a message. Persists via the reliable path first; only on
    /// confirmed persistence is the payload published over the live
    /// transport, appended locally and flagged unread for the recipient.
    pub async fn send(
        &self,
        text: Option<String>,
        file: Option<String>,
    ) -> Result<StoredMessage, ChatError> {
        // Guard against accidental contact-info sharing before any network
        // call. Policy, not a security boundary.
        if text.as_deref().is_some_and(|t| t.contains('@')) {
            return Err(ChatError::ContactInfoBlocked);
        }

        let draft = ChatPayload {
            sender: self.config.identity.sender.clone(),
            recipient: self.config.identity.counterparty.clone(),
            text,
            file,
        };
        if !draft.has_content() {
            return Err(ChatError::EmptyMessage);
        }

        // Reliable path first
        let resp = self
            .http
            .post(format!("{}/chat/send", self.config.server_url))
            .json(&serde_json::json!({
                "sender_id": &draft.sender,
                "recipient_id": &draft.recipient,
                "text": &draft.text,
                "file": &draft.file,
            }))
            .send()
            .await
            .map_err(|e| ChatError::NetworkError(e.to_string()))?;

        if resp.status().as_u16() != 201 {
            return Err(ChatError::PersistenceFailed {
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        let body: SendMessageResponse = resp
            .json()
            .await
            .map_err(|e| ChatError::NetworkError(e.to_string()))?;
        let confirmed = body.new_message.payload();

        // Persistence confirmed: publish for the counterparty's benefit.
        // Best-effort; an offline socket means the recipient pulls instead.
        if let Ok(frame) = serde_json::to_string(&ClientFrame::Publish(confirmed.clone())) {
            if self.outbound_tx.try_send(frame).is_err() {
                tracing::debug!("live publish skipped, transport not ready");
            }
        }

        self.transcript.lock().push(confirmed);
        self.raise_unread().await;

        Ok(body.new_message)
    }

    async fn raise_unread(&self) {
        let result = self
            .http
            .put(format!("{}/users/unread/add", self.config.server_url))
            .json(&serde_json::json!({
                "sender_id": &self.config.identity.sender,
                "recipient_id": &self.config.identity.counterparty,
            }))
            .send()
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to raise unread marker");
        }
    }

    async fn clear_unread(&self) {
        let result = self
            .http
            .put(format!("{}/users/unread/remove", self.config.server_url))
            .json(&serde_json::json!({
                "sender_id": &self.config.identity.counterparty,
                "recipient_id": &self.config.identity.sender,
            }))
            .send()
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to clear unread marker");
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        // Closing the window cancels the reconnect loop and the transport.
        self.driver.abort();
    }
}

/// A pushed frame is dropped when it is byte-identical to the immediately
/// preceding one; residual double-delivery guard across reconnects.
fn is_duplicate(last: Option<&str>, frame: &str) -> bool {
    last == Some(frame)
}

/// Connection driver: connect, announce, pump; reconnect with backoff on
/// any failure, forever, until the session is dropped.
async fn drive_connection(
    config: SessionConfig,
    mut outbound_rx: mpsc::Receiver<String>,
    events: broadcast::Sender<SessionEvent>,
    transcript: Arc<Mutex<Vec<ChatPayload>>>,
) {
    let mut backoff = Backoff::new(config.reconnect_base, config.reconnect_cap);
    let mut last_received: Option<String> = None;

    loop {
        match pump_once(
            &config,
            &mut outbound_rx,
            &events,
            &transcript,
            &mut last_received,
            &mut backoff,
        )
        .await
        {
            Ok(()) => return, // session handle dropped, clean exit
            Err(e) => {
                let attempt = backoff.attempt() + 1;
                let delay = backoff.next_delay();
                tracing::info!(
                    error = %e,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "disconnected, trying to reconnect"
                );
                let _ = events.send(SessionEvent::Reconnecting { attempt, delay });
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// One connection lifetime: announce, then pump frames in both directions.
async fn pump_once(
    config: &SessionConfig,
    outbound_rx: &mut mpsc::Receiver<String>,
    events: &broadcast::Sender<SessionEvent>,
    transcript: &Arc<Mutex<Vec<ChatPayload>>>,
    last_received: &mut Option<String>,
    backoff: &mut Backoff,
) -> Result<(), ChatError> {
    let (mut ws, _) = connect_async(config.ws_url())
        .await
        .map_err(|e| ChatError::ConnectFailed(e.to_string()))?;

    let announce = serde_json::to_string(&ClientFrame::Announce(config.identity.clone()))
        .map_err(|e| ChatError::InvalidRequest(e.to_string()))?;
    ws.send(Message::Text(announce))
        .await
        .map_err(|e| ChatError::NetworkError(e.to_string()))?;

    backoff.reset();
    let _ = events.send(SessionEvent::Connected);

    loop {
        tokio::select! {
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if !is_duplicate(last_received.as_deref(), &text) {
                        handle_push(config, &text, transcript, events);
                    }
                    *last_received = Some(text);
                }
                // Pings are answered automatically while the stream is polled
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ChatError::TransportClosed);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(ChatError::NetworkError(e.to_string())),
            },
            out = outbound_rx.recv() => match out {
                Some(raw) => {
                    ws.send(Message::Text(raw))
                        .await
                        .map_err(|e| ChatError::NetworkError(e.to_string()))?;
                }
                None => return Ok(()),
            },
        }
    }
}

fn handle_push(
    config: &SessionConfig,
    raw: &str,
    transcript: &Arc<Mutex<Vec<ChatPayload>>>,
    events: &broadcast::Sender<SessionEvent>,
) {
    match serde_json::from_str::<ChatPayload>(raw) {
        Ok(payload) => {
            // Only payloads from this window's counterparty belong here.
            if payload.sender == config.identity.counterparty {
                transcript.lock().push(payload.clone());
                let _ = events.send(SessionEvent::Message(payload));
            }
        }
        Err(e) => {
            tracing::debug!(error = %e, "ignoring unparseable push");
        }
    }
}
