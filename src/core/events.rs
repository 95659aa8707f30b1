use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use super::context::WebContext;
use super::session::Session;
use super::types::WebSocketResult;

/// What the upgrade-callback chain gets to inspect and mutate before the server
/// answers an incoming handshake.
pub struct UpgradeOffer<'a> {
    /// The session that will enter the active registry if the upgrade is accepted.
    pub session: &'a Arc<Session>,
    /// The parsed upgrade request.
    pub request: &'a WebContext,
    /// Response template; headers and content placed here end up on the wire for
    /// both accepted and rejected upgrades.
    pub response: &'a mut WebContext,
    /// Leave `true` to accept. Set to `false` to reject with `response`.
    pub handle: bool,
}

/// Server-side event surface.
///
/// `on_upgrade` is awaited in registration order while the handshake is held open;
/// an error there is logged and closes the connection. The notification hooks are
/// driven by a per-connection dispatcher task, so they see one connection's events
/// in order and a slow consumer never stalls the message pump.
#[async_trait]
pub trait ServerHandler: Send + Sync {
    async fn on_upgrade(&self, _offer: &mut UpgradeOffer<'_>) -> WebSocketResult<()> {
        Ok(())
    }

    async fn on_client_connected(&self, _client_id: String) {}

    async fn on_client_disconnected(&self, _client_id: String, _reason: String) {}

    async fn on_message(&self, _client_id: String, _text: String) {}

    async fn on_binary_message(&self, _client_id: String, _data: Bytes) {}

    async fn on_passive_expired(&self, _client_id: String) {}
}

/// Client-side event surface, dispatched the same way as the server's.
#[async_trait]
pub trait ClientHandler: Send + Sync {
    async fn on_message(&self, _text: String) {}

    async fn on_binary_message(&self, _data: Bytes) {}

    async fn on_disconnected(&self, _reason: String) {}
}

pub(crate) type ServerHandlers = Arc<RwLock<Vec<Arc<dyn ServerHandler>>>>;
pub(crate) type ClientHandlers = Arc<RwLock<Vec<Arc<dyn ClientHandler>>>>;

pub(crate) fn server_handler_snapshot(handlers: &ServerHandlers) -> Vec<Arc<dyn ServerHandler>> {
    handlers.read().unwrap().clone()
}

pub(crate) fn client_handler_snapshot(handlers: &ClientHandlers) -> Vec<Arc<dyn ClientHandler>> {
    handlers.read().unwrap().clone()
}

/// Passive expiry has no connection to order against; it fans out on detached
/// tasks straight from the expiry worker.
pub(crate) fn notify_passive_expired(handlers: &ServerHandlers, client_id: &str) {
    for handler in server_handler_snapshot(handlers) {
        let id = client_id.to_string();
        tokio::spawn(async move { handler.on_passive_expired(id).await });
    }
}
