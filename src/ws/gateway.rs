//! WebSocket gateway (C12): route registration with lifecycle hooks,
//! upgrade dispatch with per-route auth, room fan-out, and the
//! `pending-auth -> open -> closing -> closed` connection state machine.
//!
//! The room/membership shape is grounded on the teacher's `Room`
//! (`enterprise::realtime::room`) — a named set of members with presence
//! tracking — narrowed to what a plain connection registry needs: no
//! document/CRDT state, no access-level hierarchy, just membership plus
//! broadcast. Upgrade handling itself is plain `axum::extract::ws`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::Message;
use dashmap::DashMap;
use log::{debug, warn};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no route registered for path {0}")]
    NoRoute(String),
    #[error("upgrade rejected: {0}")]
    UpgradeRejected(String),
    #[error("connection {0} not found")]
    ConnectionNotFound(String),
    #[error("room {0} not found")]
    RoomNotFound(String),
    #[error("connection {0} is not open")]
    NotOpen(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    PendingAuth,
    Open,
    Closing,
    Closed,
}

/// Per-connection request context, bound on upgrade and handed to every
/// hook invocation for that connection's lifetime.
#[derive(Debug, Clone, Default)]
pub struct WebSocketContext {
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub user: Option<Value>,
}

/// A message payload as delivered to `on_message`: JSON decoded on a
/// best-effort basis, falling back to raw text or bytes.
#[derive(Debug, Clone)]
pub enum MessagePayload {
    Json(Value),
    Text(String),
    Binary(Vec<u8>),
}

impl MessagePayload {
    fn from_text(text: &str) -> Self {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => MessagePayload::Json(value),
            Err(_) => MessagePayload::Text(text.to_string()),
        }
    }
}

/// Gateway-level events, independent of any one route's hooks, that a
/// caller can subscribe to for cross-cutting concerns (metrics, audit).
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Message {
        connection_id: String,
        route: String,
        payload: MessagePayload,
    },
    Closed {
        connection_id: String,
        route: String,
    },
    Error {
        connection_id: String,
        route: String,
        message: String,
    },
}

/// Lifecycle hooks for a registered route. Every hook defaults to a
/// no-op so a route only needs to implement what it cares about.
/// `auth` returning `Err` rejects the upgrade; every other hook's errors
/// route to `on_error` without closing the socket.
#[async_trait]
pub trait RouteHandlers: Send + Sync {
    async fn auth(&self, _ctx: &WebSocketContext) -> Result<Option<Value>, String> {
        Ok(None)
    }

    async fn before_connect(&self, _ctx: &WebSocketContext) {}

    async fn on_connect(&self, _ctx: &WebSocketContext) {}

    async fn on_message(&self, _ctx: &WebSocketContext, _payload: &MessagePayload) {}

    async fn on_close(&self, _ctx: &WebSocketContext) {}

    async fn on_error(&self, _ctx: &WebSocketContext, _error: &str) {}
}

/// Accepts every connection and runs no hooks. Useful for routes with no
/// lifecycle requirements.
pub struct NoopHandlers;

impl RouteHandlers for NoopHandlers {}

struct Route {
    handlers: Arc<dyn RouteHandlers>,
}

struct Connection {
    route: String,
    state: AsyncMutex<ConnectionState>,
    context: AsyncMutex<WebSocketContext>,
    rooms: AsyncMutex<HashSet<String>>,
    sender: mpsc::UnboundedSender<Message>,
}

/// A room is a named set of member connection ids. Joins/leaves and
/// broadcasts against the same room share one lock, so a broadcast never
/// iterates a membership set that's concurrently being mutated — a
/// socket added mid-broadcast is either seen uniformly or not at all.
struct Room {
    members: AsyncMutex<HashSet<String>>,
}

/// Connection registry, route dispatcher, and room broadcaster.
pub struct Gateway {
    routes: DashMap<String, Route>,
    connections: DashMap<String, Arc<Connection>>,
    rooms: DashMap<String, Arc<Room>>,
    events: broadcast::Sender<GatewayEvent>,
}

impl Gateway {
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(1024);
        Self {
            routes: DashMap::new(),
            connections: DashMap::new(),
            rooms: DashMap::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: GatewayEvent) {
        // No receivers is the common case outside of tests; a dropped
        // channel is not an error here.
        let _ = self.events.send(event);
    }

    /// Bind `path` to a set of lifecycle hooks. Re-registering a path
    /// replaces its previous handlers.
    pub fn register(&self, path: impl Into<String>, handlers: Arc<dyn RouteHandlers>) {
        self.routes.insert(path.into(), Route { handlers });
    }

    /// Handle an HTTP upgrade for `path`: find the route (rejecting if
    /// none is registered), run its `auth` hook, and on success register
    /// the connection in `Open` after running `before_connect`/
    /// `on_connect`. On failure the socket is never registered — the
    /// caller is expected to destroy it without a response body.
    pub async fn upgrade(
        &self,
        path: &str,
        query: HashMap<String, String>,
        headers: HashMap<String, String>,
        sender: mpsc::UnboundedSender<Message>,
        connection_id: impl Into<String>,
    ) -> GatewayResult<String> {
        let route = self
            .routes
            .get(path)
            .map(|r| r.handlers.clone())
            .ok_or_else(|| GatewayError::NoRoute(path.to_string()))?;

        let mut ctx = WebSocketContext {
            path: path.to_string(),
            query,
            headers,
            user: None,
        };

        let user = route
            .auth(&ctx)
            .await
            .map_err(GatewayError::UpgradeRejected)?;
        ctx.user = user;

        let id = connection_id.into();
        let connection = Arc::new(Connection {
            route: path.to_string(),
            state: AsyncMutex::new(ConnectionState::PendingAuth),
            context: AsyncMutex::new(ctx.clone()),
            rooms: AsyncMutex::new(HashSet::new()),
            sender,
        });
        self.connections.insert(id.clone(), connection.clone());

        route.before_connect(&ctx).await;
        *connection.state.lock().await = ConnectionState::Open;
        route.on_connect(&ctx).await;

        debug!("connection {} opened on route {}", id, path);
        Ok(id)
    }

    /// Dispatch an inbound text frame: decode JSON best-effort, invoke
    /// the route's `on_message` hook, and emit a gateway-level event.
    pub async fn handle_text_message(&self, connection_id: &str, text: &str) -> GatewayResult<()> {
        let conn = self.connection(connection_id)?;
        let route = self.route_handlers(&conn.route)?;
        let ctx = conn.context.lock().await.clone();
        let payload = MessagePayload::from_text(text);

        route.on_message(&ctx, &payload).await;
        self.emit(GatewayEvent::Message {
            connection_id: connection_id.to_string(),
            route: conn.route.clone(),
            payload,
        });
        Ok(())
    }

    /// Dispatch an inbound binary frame.
    pub async fn handle_binary_message(&self, connection_id: &str, bytes: Vec<u8>) -> GatewayResult<()> {
        let conn = self.connection(connection_id)?;
        let route = self.route_handlers(&conn.route)?;
        let ctx = conn.context.lock().await.clone();
        let payload = MessagePayload::Binary(bytes);

        route.on_message(&ctx, &payload).await;
        self.emit(GatewayEvent::Message {
            connection_id: connection_id.to_string(),
            route: conn.route.clone(),
            payload,
        });
        Ok(())
    }

    /// Route a non-fatal error to the connection's `on_error` hook. Per
    /// the state machine, errors never close the socket by themselves.
    pub async fn report_error(&self, connection_id: &str, error: impl Into<String>) -> GatewayResult<()> {
        let conn = self.connection(connection_id)?;
        let route = self.route_handlers(&conn.route)?;
        let ctx = conn.context.lock().await.clone();
        let message = error.into();

        route.on_error(&ctx, &message).await;
        self.emit(GatewayEvent::Error {
            connection_id: connection_id.to_string(),
            route: conn.route.clone(),
            message,
        });
        Ok(())
    }

    fn connection(&self, connection_id: &str) -> GatewayResult<Arc<Connection>> {
        self.connections
            .get(connection_id)
            .map(|c| c.clone())
            .ok_or_else(|| GatewayError::ConnectionNotFound(connection_id.to_string()))
    }

    fn route_handlers(&self, path: &str) -> GatewayResult<Arc<dyn RouteHandlers>> {
        self.routes
            .get(path)
            .map(|r| r.handlers.clone())
            .ok_or_else(|| GatewayError::NoRoute(path.to_string()))
    }

    fn room(&self, name: &str) -> Arc<Room> {
        self.rooms
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Room {
                    members: AsyncMutex::new(HashSet::new()),
                })
            })
            .clone()
    }

    /// Create an empty room if it doesn't already exist. Idempotent.
    pub fn create_room(&self, name: &str) {
        self.room(name);
    }

    /// Join `connection_id` to `room_name`. The connection must already
    /// be `Open`.
    pub async fn join_room(&self, room_name: &str, connection_id: &str) -> GatewayResult<()> {
        let conn = self.connection(connection_id)?;
        if *conn.state.lock().await != ConnectionState::Open {
            return Err(GatewayError::NotOpen(connection_id.to_string()));
        }

        let room = self.room(room_name);
        room.members.lock().await.insert(connection_id.to_string());
        conn.rooms.lock().await.insert(room_name.to_string());
        Ok(())
    }

    pub async fn leave_room(&self, room_name: &str, connection_id: &str) -> GatewayResult<()> {
        let room = self
            .rooms
            .get(room_name)
            .map(|r| r.clone())
            .ok_or_else(|| GatewayError::RoomNotFound(room_name.to_string()))?;
        room.members.lock().await.remove(connection_id);

        if let Ok(conn) = self.connection(connection_id) {
            conn.rooms.lock().await.remove(room_name);
        }
        Ok(())
    }

    /// Send `payload` to every member of `room_name` whose connection is
    /// currently `Open`. The whole send pass runs under the room's
    /// membership lock, so joins/leaves racing the broadcast never
    /// produce a partially-consistent delivery set.
    pub async fn broadcast(&self, room_name: &str, payload: Message) -> GatewayResult<usize> {
        let room = self
            .rooms
            .get(room_name)
            .map(|r| r.clone())
            .ok_or_else(|| GatewayError::RoomNotFound(room_name.to_string()))?;

        let members = room.members.lock().await;
        let mut delivered = 0;
        for member_id in members.iter() {
            let Some(conn) = self.connections.get(member_id) else {
                continue;
            };
            if *conn.state.lock().await != ConnectionState::Open {
                continue;
            }
            if conn.sender.send(payload.clone()).is_ok() {
                delivered += 1;
            } else {
                warn!("dropped broadcast to {}: channel closed", member_id);
            }
        }
        Ok(delivered)
    }

    /// Move a connection through `Closing` to `Closed`: invoke the
    /// route's `on_close` hook, drop it from every joined room, then
    /// remove it from the registry.
    pub async fn close(&self, connection_id: &str) -> GatewayResult<()> {
        let conn = self.connection(connection_id)?;
        let route = self.route_handlers(&conn.route)?;
        let ctx = conn.context.lock().await.clone();

        *conn.state.lock().await = ConnectionState::Closing;
        route.on_close(&ctx).await;

        let joined: Vec<String> = conn.rooms.lock().await.iter().cloned().collect();
        for room_name in joined {
            if let Some(room) = self.rooms.get(&room_name) {
                room.members.lock().await.remove(connection_id);
            }
        }

        *conn.state.lock().await = ConnectionState::Closed;
        self.connections.remove(connection_id);
        self.emit(GatewayEvent::Closed {
            connection_id: connection_id.to_string(),
            route: conn.route.clone(),
        });
        Ok(())
    }

    pub async fn state_of(&self, connection_id: &str) -> Option<ConnectionState> {
        let conn = self.connections.get(connection_id)?;
        Some(*conn.state.lock().await)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn gateway_with_route(path: &str, handlers: Arc<dyn RouteHandlers>) -> Gateway {
        let gw = Gateway::new();
        gw.register(path, handlers);
        gw
    }

    async fn upgrade(gw: &Gateway, path: &str, id: &str) -> (GatewayResult<String>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let result = gw
            .upgrade(path, HashMap::new(), HashMap::new(), tx, id)
            .await;
        (result, rx)
    }

    #[tokio::test]
    async fn upgrade_on_unregistered_path_is_rejected() {
        let gw = Gateway::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = gw
            .upgrade("/missing", HashMap::new(), HashMap::new(), tx, "c1")
            .await;
        assert!(matches!(result, Err(GatewayError::NoRoute(_))));
    }

    struct RejectingAuth;
    #[async_trait]
    impl RouteHandlers for RejectingAuth {
        async fn auth(&self, _ctx: &WebSocketContext) -> Result<Option<Value>, String> {
            Err("invalid token".to_string())
        }
    }

    #[tokio::test]
    async fn failed_auth_rejects_the_upgrade_and_never_registers_it() {
        let gw = gateway_with_route("/chat", Arc::new(RejectingAuth));
        let (result, _rx) = upgrade(&gw, "/chat", "c1").await;
        assert!(matches!(result, Err(GatewayError::UpgradeRejected(_))));
        assert_eq!(gw.connection_count(), 0);
    }

    #[tokio::test]
    async fn successful_upgrade_lands_in_open_state() {
        let gw = gateway_with_route("/chat", Arc::new(NoopHandlers));
        let (result, _rx) = upgrade(&gw, "/chat", "c1").await;
        result.unwrap();
        assert_eq!(gw.state_of("c1").await, Some(ConnectionState::Open));
    }

    #[tokio::test]
    async fn join_requires_open_state() {
        let gw = Gateway::new();
        // Connection never goes through upgrade(), so it simply doesn't
        // exist in the registry.
        let result = gw.join_room("lobby", "ghost").await;
        assert!(matches!(result, Err(GatewayError::ConnectionNotFound(_))));
    }

    struct CountingHandlers {
        messages: AtomicUsize,
    }
    #[async_trait]
    impl RouteHandlers for CountingHandlers {
        async fn on_message(&self, _ctx: &WebSocketContext, _payload: &MessagePayload) {
            self.messages.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn text_message_decodes_json_when_possible() {
        let gw = gateway_with_route(
            "/chat",
            Arc::new(CountingHandlers {
                messages: AtomicUsize::new(0),
            }),
        );
        let (result, _rx) = upgrade(&gw, "/chat", "c1").await;
        result.unwrap();

        let mut events = gw.subscribe();
        gw.handle_text_message("c1", r#"{"kind":"ping"}"#).await.unwrap();

        let event = events.recv().await.unwrap();
        match event {
            GatewayEvent::Message { payload, .. } => {
                assert!(matches!(payload, MessagePayload::Json(_)));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn non_json_text_falls_back_to_raw_text() {
        let gw = gateway_with_route("/chat", Arc::new(NoopHandlers));
        let (result, _rx) = upgrade(&gw, "/chat", "c1").await;
        result.unwrap();

        let mut events = gw.subscribe();
        gw.handle_text_message("c1", "not json").await.unwrap();
        let event = events.recv().await.unwrap();
        match event {
            GatewayEvent::Message { payload, .. } => {
                assert!(matches!(payload, MessagePayload::Text(_)));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_only_open_members() {
        let gw = gateway_with_route("/chat", Arc::new(NoopHandlers));
        let (r1, mut rx1) = upgrade(&gw, "/chat", "c1").await;
        r1.unwrap();

        gw.join_room("lobby", "c1").await.unwrap();

        let delivered = gw
            .broadcast("lobby", Message::Text("hi".to_string()))
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert!(rx1.try_recv().is_ok());
    }

    #[tokio::test]
    async fn close_removes_connection_from_its_rooms_and_registry() {
        let gw = gateway_with_route("/chat", Arc::new(NoopHandlers));
        let (result, _rx) = upgrade(&gw, "/chat", "c1").await;
        result.unwrap();
        gw.join_room("lobby", "c1").await.unwrap();

        gw.close("c1").await.unwrap();

        let delivered = gw
            .broadcast("lobby", Message::Text("hi".to_string()))
            .await
            .unwrap();
        assert_eq!(delivered, 0);
        assert_eq!(gw.state_of("c1").await, None);
    }

    #[tokio::test]
    async fn report_error_does_not_close_the_socket() {
        let gw = gateway_with_route("/chat", Arc::new(NoopHandlers));
        let (result, _rx) = upgrade(&gw, "/chat", "c1").await;
        result.unwrap();

        gw.report_error("c1", "decode failure").await.unwrap();
        assert_eq!(gw.state_of("c1").await, Some(ConnectionState::Open));
    }
}
