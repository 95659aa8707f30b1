//! One accepted connection, from raw stream to retirement: parse the upgrade,
//! resolve identity, run the callback chain, answer, pump, update the registries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::{IdentityOutcome, Registry};
use crate::core::context::WebContext;
use crate::core::events::{server_handler_snapshot, ServerHandlers, UpgradeOffer};
use crate::core::session::Session;
use crate::core::types::{ServerOptions, WebSocketError, WebSocketResult};
use crate::handshake::UpgradeHandler;
use crate::pump::{self, PumpSink};
use crate::transport::CodecFactory;

/// Per-connection notification, queued so handlers observe a connection's life in
/// order: connected first, then its messages, the disconnect last.
enum ConnEvent {
    Connected,
    Message(String),
    Binary(Bytes),
    Disconnected(String),
}

fn spawn_dispatcher(
    handlers: ServerHandlers,
    client_id: String,
) -> mpsc::UnboundedSender<ConnEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel::<ConnEvent>();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            for handler in server_handler_snapshot(&handlers) {
                match &event {
                    ConnEvent::Connected => {
                        handler.on_client_connected(client_id.clone()).await;
                    }
                    ConnEvent::Message(text) => {
                        handler.on_message(client_id.clone(), text.clone()).await;
                    }
                    ConnEvent::Binary(data) => {
                        handler
                            .on_binary_message(client_id.clone(), data.clone())
                            .await;
                    }
                    ConnEvent::Disconnected(reason) => {
                        handler
                            .on_client_disconnected(client_id.clone(), reason.clone())
                            .await;
                    }
                }
            }
        }
    });
    tx
}

struct ServerSink {
    events: mpsc::UnboundedSender<ConnEvent>,
    shutting_down: Arc<AtomicBool>,
}

impl PumpSink for ServerSink {
    fn on_text(&self, text: String) {
        let _ = self.events.send(ConnEvent::Message(text));
    }

    fn on_binary(&self, data: Bytes) {
        let _ = self.events.send(ConnEvent::Binary(data));
    }

    fn on_peer_close(&self, description: String) {
        let _ = self.events.send(ConnEvent::Disconnected(description));
    }

    fn is_closing(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

pub(crate) struct ConnectionFlow {
    pub registry: Arc<Registry>,
    pub handlers: ServerHandlers,
    pub options: ServerOptions,
    pub factory: Arc<dyn CodecFactory>,
    pub cancel: CancellationToken,
    pub shutting_down: Arc<AtomicBool>,
}

impl ConnectionFlow {
    /// Entry point for the accept loop; never lets a connection failure escape.
    pub async fn run(self, stream: TcpStream) {
        match self.drive(stream).await {
            Ok(()) => {}
            Err(WebSocketError::Cancelled) => {
                debug!("connection flow unwound by cancellation");
            }
            Err(err) => {
                warn!(error = %err, "connection flow failed");
            }
        }
    }

    async fn drive(self, stream: TcpStream) -> WebSocketResult<()> {
        let peer = stream.peer_addr().ok();
        let mut handler =
            UpgradeHandler::new(stream, self.factory.clone(), self.options.codec);

        let request = handler.await_context().await?;

        let mut session = Arc::new(Session::new(peer));
        let mut was_passive = false;

        if self.options.remember_disconnected_clients {
            if let Some(user_id) = request.user_id() {
                match self.registry.identify(&session, user_id, peer).await? {
                    IdentityOutcome::Conflict(mut response) => {
                        info!(user_id, "upgrade refused, user id is live on another connection");
                        return handler.reject(&mut response).await;
                    }
                    IdentityOutcome::Reclaimed(parked) => {
                        debug!(user_id, "passive session reclaimed");
                        session = parked;
                        was_passive = true;
                    }
                    IdentityOutcome::Assigned => {}
                }
            }
        }

        let mut response = WebContext::response();
        let mut handle = true;
        for callback in server_handler_snapshot(&self.handlers) {
            let mut offer = UpgradeOffer {
                session: &session,
                request: &request,
                response: &mut response,
                handle,
            };
            let outcome = callback.on_upgrade(&mut offer).await;
            handle = offer.handle;
            if let Err(err) = outcome {
                if was_passive {
                    self.registry.retire(&session).await;
                }
                return Err(err);
            }
        }

        if !handle {
            debug!(client_id = %session.id(), "upgrade callback declined the connection");
            let rejected = handler.reject(&mut response).await;
            if was_passive {
                self.registry.retire(&session).await;
            }
            return rejected;
        }

        // Claim the id before the 101 goes out so a racing duplicate is refused
        // instead of silently replacing this entry.
        if let Err(mut conflict) = self.registry.try_activate(&session) {
            info!(client_id = %session.id(), "upgrade refused, id was claimed concurrently");
            return handler.reject(&mut conflict).await;
        }

        let confirmed_id = session.id();
        let codec = match handler
            .accept(
                &request,
                &response,
                &confirmed_id,
                self.options.send_user_id_to_client,
                self.options.subprotocol.as_deref(),
            )
            .await
        {
            Ok(codec) => codec,
            Err(err) => {
                if was_passive {
                    self.registry.retire(&session).await;
                } else {
                    self.registry.deactivate(&session);
                }
                return Err(err);
            }
        };

        if let Err(err) = session.use_codec(codec.clone()) {
            self.registry.deactivate(&session);
            return Err(err);
        }

        info!(client_id = %confirmed_id, remote = ?session.remote_endpoint(), "client connected");
        let events = spawn_dispatcher(self.handlers.clone(), confirmed_id.clone());
        let _ = events.send(ConnEvent::Connected);
        let sink = ServerSink {
            events,
            shutting_down: self.shutting_down.clone(),
        };

        let pumped = pump::run(&codec, &sink, &self.cancel).await;
        self.registry.retire(&session).await;

        match pumped {
            Ok(exit) => {
                debug!(client_id = %confirmed_id, ?exit, "connection pump finished");
                Ok(())
            }
            Err(err) => {
                // Abrupt peer loss is ordinary churn at this layer.
                debug!(client_id = %confirmed_id, error = %err, "connection pump failed");
                Ok(())
            }
        }
    }
}
