use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tower_http::cors::CorsLayer;

use leasy_core::ids::ConnectionId;
use leasy_core::wire::{ClientFrame, RoutingIdentity};
use leasy_store::users::UserRepo;
use leasy_store::Database;
use leasy_telemetry::MetricsRecorder;

use crate::handlers::{self, AppState};
use crate::liveness::{self, ProbeOutcome, ProbeTimer};
use crate::registry::ConnectionRegistry;
use crate::router::MessageRouter;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
    pub probe_interval: Duration,
    pub pong_timeout: Duration,
    /// How long a fresh socket may stay silent before its announce is due.
    pub announce_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            max_send_queue: 256,
            probe_interval: liveness::PROBE_INTERVAL,
            pong_timeout: liveness::PONG_TIMEOUT,
            announce_timeout: Duration::from_secs(10),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/chat/create", post(handlers::create_conversation))
        .route(
            "/chat/c/{conversation_id}",
            get(handlers::get_conversation).delete(handlers::delete_conversation),
        )
        .route("/chat/u/{user_id}", get(handlers::list_conversations))
        .route("/chat/send", post(handlers::send_message))
        .route("/users", post(handlers::create_user))
        .route("/users/{user_id}", get(handlers::get_user))
        .route("/users/unread/add", put(handlers::add_unread))
        .route("/users/unread/remove", put(handlers::remove_unread))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(config: ServerConfig, db: Database) -> Result<ServerHandle, std::io::Error> {
    start_inner(config, db, None).await
}

/// Start with a metrics recorder wired into the registry and router.
pub async fn start_with_metrics(
    config: ServerConfig,
    db: Database,
    metrics: Arc<MetricsRecorder>,
) -> Result<ServerHandle, std::io::Error> {
    start_inner(config, db, Some(metrics)).await
}

async fn start_inner(
    config: ServerConfig,
    db: Database,
    metrics: Option<Arc<MetricsRecorder>>,
) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::new(ConnectionRegistry::new(config.max_send_queue));

    let router = match &metrics {
        Some(m) => Arc::new(MessageRouter::with_metrics(
            Arc::clone(&registry),
            Arc::clone(m),
        )),
        None => Arc::new(MessageRouter::new(Arc::clone(&registry))),
    };

    // Reaper for sockets that died without a clean close
    let _reaper = liveness::start_reaper(
        Arc::clone(&registry),
        config.probe_interval,
        config.pong_timeout,
    );

    let state = AppState {
        db,
        registry: Arc::clone(&registry),
        router,
        metrics,
        config: Arc::new(config.clone()),
    };

    let app = build_router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "chat server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server_handle,
        _reaper,
    })
}

/// Handle returned by `start()` — keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _reaper: tokio::task::JoinHandle<()>,
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a new WebSocket connection: handshake, register, pump.
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let identity = match await_announce(&mut socket, state.config.announce_timeout).await {
        Ok(identity) => identity,
        Err(reason) => {
            tracing::warn!(reason = %reason, "closing unannounced socket");
            let _ = socket.send(WsMessage::Close(None)).await;
            return;
        }
    };

    // A routing identity that does not resolve is never registered; such a
    // connection is a no-op until the client reconnects with a valid one.
    let users = UserRepo::new(state.db.clone());
    let resolvable = users.exists(&identity.sender).unwrap_or(false)
        && users.exists(&identity.counterparty).unwrap_or(false);
    if !resolvable {
        tracing::warn!(
            sender = %identity.sender,
            counterparty = %identity.counterparty,
            "announce names unknown identities, closing socket"
        );
        let _ = socket.send(WsMessage::Close(None)).await;
        return;
    }

    let (conn_id, rx) = state.registry.register(identity.clone().into());
    tracing::info!(
        connection_id = %conn_id,
        sender = %identity.sender,
        counterparty = %identity.counterparty,
        origin = %identity.origin,
        "connection registered"
    );
    if let Some(metrics) = &state.metrics {
        metrics.gauge_set("connections.active", &[], state.registry.count() as f64);
    }

    run_socket(socket, conn_id.clone(), rx, &state).await;

    state.registry.unregister(&conn_id);
    if let Some(metrics) = &state.metrics {
        metrics.gauge_set("connections.active", &[], state.registry.count() as f64);
    }
    tracing::info!(connection_id = %conn_id, "connection closed");
}

/// Wait for the typed announce frame that must open every connection.
async fn await_announce(
    socket: &mut WebSocket,
    wait: Duration,
) -> Result<RoutingIdentity, String> {
    let frame = tokio::time::timeout(wait, socket.recv())
        .await
        .map_err(|_| "announce timed out".to_string())?
        .ok_or_else(|| "socket closed before announce".to_string())?
        .map_err(|e| format!("transport error: {e}"))?;

    match frame {
        WsMessage::Text(text) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
            Ok(ClientFrame::Announce(identity)) => Ok(identity),
            Ok(_) => Err("first frame must be an announce".into()),
            Err(e) => Err(format!("malformed announce: {e}")),
        },
        _ => Err("first frame must be an announce".into()),
    }
}

/// Split the socket into reader/writer tasks and pump until either side
/// ends. The writer owns the probe cycle; the reader records pongs and
/// routes published payloads.
async fn run_socket(
    socket: WebSocket,
    conn_id: ConnectionId,
    mut rx: mpsc::Receiver<String>,
    state: &AppState,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let probe_interval = state.config.probe_interval;
    let pong_timeout = state.config.pong_timeout;

    // Writer task: forward pushes from the registry channel + probe cycle
    let writer_cid = conn_id.clone();
    let writer_registry = Arc::clone(&state.registry);
    let writer = tokio::spawn(async move {
        let mut probe = ProbeTimer::new(pong_timeout);
        let mut ping_interval = tokio::time::interval(probe_interval);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            let deadline = probe.deadline();
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                    probe.probe_sent(Instant::now());
                    tracing::trace!(connection_id = %writer_cid, "probe sent");
                }
                _ = tokio::time::sleep_until(
                    deadline.unwrap_or_else(|| Instant::now() + pong_timeout)
                ), if deadline.is_some() => {
                    match probe.resolve(writer_registry.last_pong(&writer_cid)) {
                        ProbeOutcome::Acknowledged => {}
                        ProbeOutcome::TimedOut => {
                            tracing::warn!(connection_id = %writer_cid, "probe timed out, terminating");
                            let _ = ws_tx.send(WsMessage::Close(None)).await;
                            break;
                        }
                    }
                }
            }
        }
    });

    // Reader task: route published payloads, track pongs
    let reader_cid = conn_id.clone();
    let reader_registry = Arc::clone(&state.registry);
    let reader_router = Arc::clone(&state.router);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    match serde_json::from_str::<ClientFrame>(text.as_str()) {
                        Ok(ClientFrame::Publish(payload)) => {
                            reader_router.route(&payload);
                        }
                        Ok(ClientFrame::Announce(_)) => {
                            // Identity is fixed at registration; a repeat
                            // announce on a live socket is ignored.
                            tracing::debug!(connection_id = %reader_cid, "ignoring repeat announce");
                        }
                        Err(e) => {
                            tracing::debug!(connection_id = %reader_cid, error = %e, "unparseable frame");
                        }
                    }
                }
                WsMessage::Pong(_) => {
                    reader_registry.record_pong(&reader_cid);
                }
                WsMessage::Close(_) => break,
                WsMessage::Ping(_) => {} // axum replies automatically
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::in_memory().unwrap()
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let config = ServerConfig {
            port: 0, // Random port
            ..Default::default()
        };

        let handle = start(config, test_db()).await.unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["connections"], 0);
    }

    #[tokio::test]
    async fn rest_flow_end_to_end() {
        let handle = start(
            ServerConfig {
                port: 0,
                ..Default::default()
            },
            test_db(),
        )
        .await
        .unwrap();
        let base = format!("http://127.0.0.1:{}", handle.port);
        let client = reqwest::Client::new();

        // Seed two users
        let host: serde_json::Value = client
            .post(format!("{base}/users"))
            .json(&serde_json::json!({"firstname": "Hanna", "lastname": "Host"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let applicant: serde_json::Value = client
            .post(format!("{base}/users"))
            .json(&serde_json::json!({"firstname": "Arno", "lastname": "Applicant"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let host_id = host["user"]["id"].as_str().unwrap();
        let applicant_id = applicant["user"]["id"].as_str().unwrap();

        // Create the conversation, twice and with flipped roles: same id
        let c1: serde_json::Value = client
            .post(format!("{base}/chat/create"))
            .json(&serde_json::json!({"host_id": host_id, "applicant_id": applicant_id}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let c2: serde_json::Value = client
            .post(format!("{base}/chat/create"))
            .json(&serde_json::json!({"host_id": applicant_id, "applicant_id": host_id}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(c1["conversation"]["id"], c2["conversation"]["id"]);

        // Send a message while the recipient has no live connection
        let resp = client
            .post(format!("{base}/chat/send"))
            .json(&serde_json::json!({
                "sender_id": host_id,
                "recipient_id": applicant_id,
                "text": "hello",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);

        // The recipient's next fetch includes it regardless of push success
        let conv_id = c1["conversation"]["id"].as_str().unwrap();
        let fetched: serde_json::Value = client
            .get(format!("{base}/chat/c/{conv_id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let messages = fetched["conversation"]["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["text"], "hello");
    }

    #[tokio::test]
    async fn empty_message_rejected_via_rest() {
        let handle = start(
            ServerConfig {
                port: 0,
                ..Default::default()
            },
            test_db(),
        )
        .await
        .unwrap();
        let base = format!("http://127.0.0.1:{}", handle.port);
        let client = reqwest::Client::new();

        let host: serde_json::Value = client
            .post(format!("{base}/users"))
            .json(&serde_json::json!({"firstname": "Hanna", "lastname": "Host"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let applicant: serde_json::Value = client
            .post(format!("{base}/users"))
            .json(&serde_json::json!({"firstname": "Arno", "lastname": "Applicant"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let host_id = host["user"]["id"].as_str().unwrap();
        let applicant_id = applicant["user"]["id"].as_str().unwrap();

        client
            .post(format!("{base}/chat/create"))
            .json(&serde_json::json!({"host_id": host_id, "applicant_id": applicant_id}))
            .send()
            .await
            .unwrap();

        let resp = client
            .post(format!("{base}/chat/send"))
            .json(&serde_json::json!({
                "sender_id": host_id,
                "recipient_id": applicant_id,
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[test]
    fn build_router_creates_routes() {
        let db = Database::in_memory().unwrap();
        let registry = Arc::new(ConnectionRegistry::new(32));
        let router = Arc::new(MessageRouter::new(Arc::clone(&registry)));
        let state = AppState {
            db,
            registry,
            router,
            metrics: None,
            config: Arc::new(ServerConfig::default()),
        };

        let _router = build_router(state);
        // If this doesn't panic, the router was built successfully
    }
}
