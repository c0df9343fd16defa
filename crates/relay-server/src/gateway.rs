//! WebSocket gateway and HTTP surface.
//!
//! This module owns the connection lifecycle: handshake authentication,
//! registration in the connection registry and the shared presence/route
//! tables, the per-socket writer task, inbound frame dispatch, heartbeat
//! TTL renewal, and teardown. It also exposes the internal HTTP endpoints
//! the durable chat service calls to trigger fan-out, plus presence query
//! endpoints.
//!
//! Presence and route stores are consulted with a bounded timeout and
//! write failures are swallowed: a degraded store must not take down live
//! connections. Reads on the HTTP query path do propagate, as callers
//! need to distinguish "offline" from "unknown".

use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::fanout::EventFanout;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use relay_core::{
    ConnectionRegistry, Identity, InstanceRouter, PresenceRecord, PresenceStore, RegistryError,
    SocketId, StoreError, UserId,
};
use relay_protocol::{
    close, decode_frame, encode_event, epoch_millis, error_code, ClientFrame, PresenceStatus,
    ServerEvent,
};
use serde::Deserialize;
use serde_json::Value;
use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Upper bound on any single presence/route store call from the socket
/// path.
const STORE_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared server state.
pub struct AppState {
    /// Live local connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Shared presence table.
    pub presence: Arc<dyn PresenceStore>,
    /// Shared route table plus the bus.
    pub router: Arc<InstanceRouter>,
    /// Fan-out engine.
    pub fanout: Arc<EventFanout>,
    /// Handshake token verifier.
    pub verifier: Arc<dyn TokenVerifier>,
    /// Server configuration.
    pub config: Config,
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(state: Arc<AppState>) -> Result<()> {
    let config = state.config.clone();

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/presence/:user_id", get(presence_handler))
        .route("/presence/batch", post(presence_batch_handler))
        .route("/internal/broadcast/message", post(broadcast_message_handler))
        .route(
            "/internal/broadcast/reaction",
            post(broadcast_reaction_handler),
        )
        .with_state(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Relay gateway listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "instance_id": state.router.instance_id(),
        "connections": state.registry.connection_count(),
        "users": state.registry.distinct_user_count(),
    }))
}

/// Presence query for one user.
async fn presence_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    match state.presence.is_online(&user_id).await {
        Ok(online) => Json(serde_json::json!({
            "userId": user_id,
            "status": if online { "online" } else { "offline" },
        }))
        .into_response(),
        Err(e) => store_unavailable(&e),
    }
}

#[derive(Debug, Deserialize)]
struct BatchPresenceRequest {
    user_ids: Vec<UserId>,
}

/// Presence query for a set of users.
async fn presence_batch_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BatchPresenceRequest>,
) -> impl IntoResponse {
    match state.presence.batch_is_online(&request.user_ids).await {
        Ok(statuses) => Json(serde_json::json!({ "statuses": statuses })).into_response(),
        Err(e) => store_unavailable(&e),
    }
}

fn store_unavailable(e: &StoreError) -> axum::response::Response {
    warn!(error = %e, "Presence read failed");
    metrics::record_error("presence_read");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({ "error": "presence store unavailable" })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct BroadcastMessageRequest {
    conversation_id: String,
    message: Value,
    /// Participant list as known to the durable store. When absent the
    /// fan-out falls back to the conversation directory.
    #[serde(default)]
    participants: Option<Vec<UserId>>,
}

/// Internal endpoint: fan a persisted message out to subscribers.
async fn broadcast_message_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BroadcastMessageRequest>,
) -> impl IntoResponse {
    let delivered = state.fanout.broadcast_new_message(
        &request.conversation_id,
        request.message,
        request.participants,
    );
    Json(serde_json::json!({ "delivered": delivered }))
}

#[derive(Debug, Deserialize)]
struct BroadcastReactionRequest {
    conversation_id: String,
    message_id: String,
    reaction: Value,
    #[serde(default)]
    participants: Option<Vec<UserId>>,
}

/// Internal endpoint: fan a reaction out to subscribers.
async fn broadcast_reaction_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BroadcastReactionRequest>,
) -> impl IntoResponse {
    let delivered = state.fanout.broadcast_new_reaction(
        &request.conversation_id,
        &request.message_id,
        request.reaction,
        request.participants,
    );
    Json(serde_json::json!({ "delivered": delivered }))
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// WebSocket upgrade handler.
///
/// The upgrade always succeeds; authentication happens on the socket so
/// the client receives a proper close frame instead of an HTTP error.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.token))
}

/// Handle one WebSocket connection from handshake to teardown.
async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, token: Option<String>) {
    let identity = match verify(&state, token.as_deref()).await {
        Some(identity) => identity,
        None => {
            metrics::record_error("auth");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close::POLICY_VIOLATION,
                    reason: Cow::from("invalid token"),
                })))
                .await;
            return;
        }
    };

    let _metrics_guard = ConnectionMetricsGuard::new();
    let socket_id = SocketId::generate();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    if let Err(e) = state
        .registry
        .register(socket_id.clone(), identity.clone(), tx.clone())
    {
        error!(socket = %socket_id, error = %e, "Registration failed");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close::SERVER_ERROR,
                reason: Cow::from("registration failed"),
            })))
            .await;
        return;
    }

    info!(socket = %socket_id, user = %identity.user_id, "Connected");

    // Shared tables first, then the welcome event: a client that sees
    // itself online must already be visible to the rest of the fleet.
    store_call(
        "set_online",
        state.presence.set_online(PresenceRecord {
            user_id: identity.user_id.clone(),
            socket_id: socket_id.to_string(),
            instance_id: state.router.instance_id().to_string(),
            metadata: None,
        }),
    )
    .await;
    store_call(
        "register_route",
        state
            .router
            .register_route(&identity.user_id, socket_id.as_str()),
    )
    .await;

    let _ = tx.send(ServerEvent::presence(
        identity.user_id.clone(),
        PresenceStatus::Online,
    ));

    let (mut sink, mut stream) = socket.split();

    // Single writer per socket keeps outbound order intact.
    let writer_socket = socket_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match encode_event(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!(socket = %writer_socket, error = %e, "Event encoding failed");
                    metrics::record_error("encode");
                    continue;
                }
            };
            metrics::record_frame("outbound");
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: close::NORMAL,
                reason: Cow::from(""),
            })))
            .await;
    });

    let mut heartbeat = tokio::time::interval(state.config.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let idle_timeout = state.config.idle_timeout();
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        let started = Instant::now();
                        metrics::record_frame("inbound");

                        match decode_frame(&text) {
                            Ok(inbound) => {
                                debug!(socket = %socket_id, kind = %inbound.frame.kind(), "Frame received");
                                if let Some(reply) =
                                    dispatch_frame(&state, &identity, &socket_id, inbound.frame)
                                        .await
                                {
                                    let _ = tx.send(reply);
                                }
                            }
                            Err(e) => {
                                debug!(socket = %socket_id, error = %e, "Malformed frame");
                                metrics::record_error("malformed_frame");
                                let _ = tx.send(ServerEvent::error(
                                    error_code::MALFORMED_FRAME,
                                    e.to_string(),
                                ));
                            }
                        }

                        metrics::record_dispatch_latency(started.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        // Transport-level keepalive also counts as activity.
                        last_activity = Instant::now();
                    }
                    Some(Ok(Message::Binary(_))) => {
                        last_activity = Instant::now();
                        let _ = tx.send(ServerEvent::error(
                            error_code::UNSUPPORTED_TYPE,
                            "binary frames are not supported",
                        ));
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(socket = %socket_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(socket = %socket_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(socket = %socket_id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if last_activity.elapsed() >= idle_timeout {
                    info!(socket = %socket_id, user = %identity.user_id, "Idle timeout");
                    break;
                }
                store_call("refresh", state.presence.refresh(&identity.user_id)).await;
                store_call(
                    "refresh_route",
                    state.router.refresh_route(&identity.user_id),
                )
                .await;
            }
        }
    }

    let session_ms = state
        .registry
        .connected_at(&socket_id)
        .map(|t| epoch_millis().saturating_sub(t))
        .unwrap_or_default();

    // Teardown order mirrors setup: local registry first, then the shared
    // tables. Conditional deletes keep a reconnect that already claimed
    // the user untouched.
    state.registry.deregister(&socket_id);
    store_call(
        "set_offline",
        state
            .presence
            .set_offline(&identity.user_id, socket_id.as_str()),
    )
    .await;
    store_call(
        "remove_route",
        state
            .router
            .remove_route(&identity.user_id, socket_id.as_str()),
    )
    .await;

    // Closing the channel stops the writer, which sends the close frame.
    drop(tx);
    let _ = writer.await;

    info!(socket = %socket_id, user = %identity.user_id, session_ms, "Disconnected");
}

async fn verify(state: &AppState, token: Option<&str>) -> Option<Identity> {
    let token = token?;
    state.verifier.verify(token).await.ok()
}

/// Apply one decoded frame. Returns the immediate reply event, if any.
async fn dispatch_frame(
    state: &AppState,
    identity: &Identity,
    socket_id: &SocketId,
    frame: ClientFrame,
) -> Option<ServerEvent> {
    match frame {
        ClientFrame::Ping => Some(ServerEvent::Pong),

        ClientFrame::Subscribe { conversation_id } => {
            match state.registry.subscribe(socket_id, conversation_id.clone()) {
                Ok(()) => {
                    metrics::record_subscription();
                    // Subscribing is activity: renew visibility and
                    // deliverability alongside the registry mutation.
                    store_call("refresh", state.presence.refresh(&identity.user_id)).await;
                    store_call(
                        "refresh_route",
                        state.router.refresh_route(&identity.user_id),
                    )
                    .await;
                    None
                }
                Err(e @ RegistryError::MaxSubscriptionsReached) => {
                    warn!(socket = %socket_id, conversation = %conversation_id, "Subscription limit");
                    metrics::record_error("subscription_limit");
                    Some(ServerEvent::error(
                        error_code::SUBSCRIPTION_LIMIT,
                        e.to_string(),
                    ))
                }
                Err(e) => {
                    warn!(socket = %socket_id, error = %e, "Subscribe failed");
                    None
                }
            }
        }

        ClientFrame::Unsubscribe { conversation_id } => {
            state.registry.unsubscribe(socket_id, &conversation_id);
            None
        }

        ClientFrame::Typing {
            conversation_id,
            is_typing,
        } => {
            state
                .fanout
                .broadcast_typing(&conversation_id, &identity.user_id, is_typing);
            None
        }

        ClientFrame::Unknown { kind } => {
            debug!(socket = %socket_id, kind = %kind, "Unsupported frame type");
            metrics::record_error("unsupported_type");
            Some(ServerEvent::error(
                error_code::UNSUPPORTED_TYPE,
                format!("Unsupported frame type: {kind}"),
            ))
        }
    }
}

/// Run a store operation with a bounded timeout, swallowing failures.
///
/// Returns `None` when the call failed or timed out.
async fn store_call<T, F>(op: &'static str, fut: F) -> Option<T>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(STORE_TIMEOUT, fut).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(op = op, error = %e, "Store call failed");
            metrics::record_error("store");
            None
        }
        Err(_) => {
            warn!(op = op, "Store call timed out");
            metrics::record_error("store_timeout");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenVerifier;
    use crate::config::AuthConfig;
    use crate::fanout::MemoryDirectory;
    use relay_core::{MemoryBus, MemoryPresenceStore, MemoryRouteStore, RegistryConfig};

    fn test_state(max_subscriptions: usize, presence_ttl: Duration) -> Arc<AppState> {
        let bus = Arc::new(MemoryBus::new());
        let registry = Arc::new(ConnectionRegistry::with_config(RegistryConfig {
            max_subscriptions_per_connection: max_subscriptions,
        }));
        let presence = Arc::new(MemoryPresenceStore::new(bus.clone(), presence_ttl));
        let routes = Arc::new(MemoryRouteStore::new(presence_ttl));
        let router = Arc::new(InstanceRouter::new("i1", routes, bus));
        let fanout = Arc::new(EventFanout::new(
            registry.clone(),
            router.clone(),
            Arc::new(MemoryDirectory::new()),
        ));
        let verifier = Arc::new(StaticTokenVerifier::from_config(&AuthConfig::default()));

        Arc::new(AppState {
            registry,
            presence,
            router,
            fanout,
            verifier,
            config: Config::default(),
        })
    }

    fn connect(state: &AppState, user: &str) -> (SocketId, mpsc::UnboundedReceiver<ServerEvent>) {
        let socket_id = SocketId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        state
            .registry
            .register(socket_id.clone(), Identity::new(user, user), tx)
            .unwrap();
        (socket_id, rx)
    }

    #[tokio::test]
    async fn test_ping_gets_pong() {
        let state = test_state(10, Duration::from_secs(30));
        let (socket_id, _rx) = connect(&state, "alice");
        let identity = Identity::new("alice", "alice");

        let reply = dispatch_frame(&state, &identity, &socket_id, ClientFrame::Ping).await;
        assert_eq!(reply, Some(ServerEvent::Pong));
    }

    #[tokio::test]
    async fn test_subscribe_registers_and_is_silent() {
        let state = test_state(10, Duration::from_secs(30));
        let (socket_id, _rx) = connect(&state, "alice");
        let identity = Identity::new("alice", "alice");

        let reply = dispatch_frame(
            &state,
            &identity,
            &socket_id,
            ClientFrame::Subscribe {
                conversation_id: "c1".into(),
            },
        ).await;
        assert_eq!(reply, None);
        assert!(state.registry.user_subscribed("alice", "c1"));
    }

    #[tokio::test]
    async fn test_subscribe_renews_presence_and_route_ttls() {
        let state = test_state(10, Duration::from_millis(80));
        let (socket_id, _rx) = connect(&state, "alice");
        let identity = Identity::new("alice", "alice");

        state
            .presence
            .set_online(PresenceRecord {
                user_id: "alice".into(),
                socket_id: socket_id.to_string(),
                instance_id: "i1".into(),
                metadata: None,
            })
            .await
            .unwrap();
        state
            .router
            .register_route("alice", socket_id.as_str())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatch_frame(
            &state,
            &identity,
            &socket_id,
            ClientFrame::Subscribe {
                conversation_id: "c1".into(),
            },
        ).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // 100ms elapsed but the subscribe reset both deadlines.
        assert!(state.presence.is_online("alice").await.unwrap());
        assert!(state.router.lookup_route("alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_subscription_limit_produces_error_event() {
        let state = test_state(1, Duration::from_secs(30));
        let (socket_id, _rx) = connect(&state, "alice");
        let identity = Identity::new("alice", "alice");

        dispatch_frame(
            &state,
            &identity,
            &socket_id,
            ClientFrame::Subscribe {
                conversation_id: "c1".into(),
            },
        ).await;
        let reply = dispatch_frame(
            &state,
            &identity,
            &socket_id,
            ClientFrame::Subscribe {
                conversation_id: "c2".into(),
            },
        ).await;

        match reply {
            Some(ServerEvent::Error { code, .. }) => {
                assert_eq!(code, error_code::SUBSCRIPTION_LIMIT);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_frame_produces_error_event() {
        let state = test_state(10, Duration::from_secs(30));
        let (socket_id, _rx) = connect(&state, "alice");
        let identity = Identity::new("alice", "alice");

        let reply = dispatch_frame(
            &state,
            &identity,
            &socket_id,
            ClientFrame::Unknown {
                kind: "teleport".into(),
            },
        ).await;

        match reply {
            Some(ServerEvent::Error { code, message }) => {
                assert_eq!(code, error_code::UNSUPPORTED_TYPE);
                assert!(message.contains("teleport"));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_typing_fans_out_to_other_local_subscriber() {
        let state = test_state(10, Duration::from_secs(30));
        let (alice_socket, mut alice_rx) = connect(&state, "alice");
        let (bob_socket, mut bob_rx) = connect(&state, "bob");
        state.registry.subscribe(&alice_socket, "c1").unwrap();
        state.registry.subscribe(&bob_socket, "c1").unwrap();
        let identity = Identity::new("alice", "alice");

        dispatch_frame(
            &state,
            &identity,
            &alice_socket,
            ClientFrame::Typing {
                conversation_id: "c1".into(),
                is_typing: true,
            },
        ).await;

        assert!(matches!(
            bob_rx.try_recv(),
            Ok(ServerEvent::Typing { .. })
        ));
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_store_call_swallows_errors() {
        let failed: Result<(), StoreError> =
            Err(StoreError::Unavailable("down".into()));
        assert!(store_call("test", async { failed }).await.is_none());
        assert_eq!(store_call("test", async { Ok(7) }).await, Some(7));
    }
}
