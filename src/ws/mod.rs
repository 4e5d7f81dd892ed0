//! WebSocket gateway (C12): connection registry, route dispatch with
//! lifecycle hooks, per-route auth, and room fan-out.

pub mod gateway;
pub mod handler;

pub use gateway::{
    ConnectionState, Gateway, GatewayError, GatewayEvent, GatewayResult, MessagePayload,
    NoopHandlers, RouteHandlers, WebSocketContext,
};
pub use handler::{serve_connection, upgrade_handler};
