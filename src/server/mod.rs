//! The listening side: owns the accept loop, both registries, the root
//! cancellation token and the event surface.

mod flow;
mod registry;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cancel::{link_into, with_cancel};
use crate::core::events::{notify_passive_expired, ServerHandler, ServerHandlers};
use crate::core::frame::CloseCode;
use crate::core::session::Session;
use crate::core::types::{ServerError, ServerOptions, WebSocketError, WebSocketResult};
use crate::transport::tungstenite::TungsteniteFactory;
use crate::transport::{CodecFactory, CodecState};
use self::flow::ConnectionFlow;
use self::registry::Registry;

/// Embeddable websocket server over a plain TCP listener.
///
/// One task accepts, one task per connection runs the upgrade-and-pump flow, and
/// handlers added with [`add_handler`](Server::add_handler) observe the traffic.
pub struct Server {
    options: ServerOptions,
    registry: Arc<Registry>,
    handlers: ServerHandlers,
    factory: Arc<dyn CodecFactory>,
    root: CancellationToken,
    started: AtomicBool,
    shutting_down: Arc<AtomicBool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        Self::with_factory(options, Arc::new(TungsteniteFactory))
    }

    /// Server with a custom codec factory; tests inject scripted codecs here.
    pub fn with_factory(options: ServerOptions, factory: Arc<dyn CodecFactory>) -> Self {
        let handlers: ServerHandlers = Arc::new(RwLock::new(Vec::new()));
        let expiry_handlers = handlers.clone();
        let registry = Arc::new(Registry::new(
            &options,
            Box::new(move |client_id, _session: Arc<Session>| {
                debug!(%client_id, "passive client expired");
                notify_passive_expired(&expiry_handlers, &client_id);
            }),
        ));
        Self {
            options,
            registry,
            handlers,
            factory,
            root: CancellationToken::new(),
            started: AtomicBool::new(false),
            shutting_down: Arc::new(AtomicBool::new(false)),
            accept_task: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Register an event handler. The upgrade callbacks run in registration order.
    pub fn add_handler(&self, handler: Arc<dyn ServerHandler>) {
        self.handlers.write().unwrap().push(handler);
    }

    /// Bind the listener and spawn the accept loop.
    pub async fn start(&self, cancellation: Option<CancellationToken>) -> WebSocketResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ServerError::AlreadyStarted.into());
        }

        let bind_addr = (self.options.local_ip, self.options.port);
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.started.store(false, Ordering::Release);
                return Err(ServerError::Bind {
                    addr: format!("{}:{}", self.options.local_ip, self.options.port),
                    source,
                }
                .into());
            }
        };
        let local = listener.local_addr().ok();
        *self.local_addr.lock().unwrap() = local;

        link_into(&self.root, cancellation);
        let accept_cancel = self.root.child_token();

        let registry = self.registry.clone();
        let handlers = self.handlers.clone();
        let options = self.options.clone();
        let factory = self.factory.clone();
        let shutting_down = self.shutting_down.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_cancel.cancelled() => {
                        debug!("accept loop cancelled");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "connection accepted");
                            let flow = ConnectionFlow {
                                registry: registry.clone(),
                                handlers: handlers.clone(),
                                options: options.clone(),
                                factory: factory.clone(),
                                cancel: accept_cancel.child_token(),
                                shutting_down: shutting_down.clone(),
                            };
                            tokio::spawn(flow.run(stream));
                        }
                        Err(err) => {
                            warn!(error = %err, "accepting a connection failed");
                        }
                    }
                }
            }
        });
        *self.accept_task.lock().unwrap() = Some(task);

        info!(addr = ?local, "server listening");
        Ok(())
    }

    /// Close every live client with `1001 Server is shutting down`, cancel all
    /// connection tasks and release the listener.
    pub async fn shutdown(&self, cancellation: Option<CancellationToken>) -> WebSocketResult<()> {
        if !self.started.load(Ordering::Acquire) {
            return Err(ServerError::NotStarted.into());
        }
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Err(ServerError::ShutdownInProgress.into());
        }
        info!("server shutting down");

        let sessions = self.registry.active_snapshot();
        with_cancel(cancellation.as_ref(), async {
            for session in sessions {
                if let Some(codec) = session.codec() {
                    if codec.state() == CodecState::Open {
                        if let Err(err) = codec
                            .close(CloseCode::EndpointUnavailable, "Server is shutting down")
                            .await
                        {
                            debug!(client_id = %session.id(), error = %err, "closing a client failed");
                        }
                    }
                }
                self.registry.remove_active(&session.id());
                session.dispose();
            }
            Ok(())
        })
        .await?;

        self.root.cancel();
        let task = self.accept_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }

    /// Send a text frame to one live client.
    pub async fn send_message(
        &self,
        client_id: &str,
        text: &str,
        cancellation: Option<CancellationToken>,
    ) -> WebSocketResult<()> {
        let codec = self.connected_codec(client_id)?;
        with_cancel(cancellation.as_ref(), codec.send_text(text))
            .await
            .map_err(|source| wrap_send(client_id, source))
    }

    /// Send a binary frame to one live client.
    pub async fn send_binary_message(
        &self,
        client_id: &str,
        data: &[u8],
        cancellation: Option<CancellationToken>,
    ) -> WebSocketResult<()> {
        let codec = self.connected_codec(client_id)?;
        with_cancel(cancellation.as_ref(), codec.send_binary(data))
            .await
            .map_err(|source| wrap_send(client_id, source))
    }

    /// Look a live client up by id.
    pub fn get_client_by_id(&self, client_id: &str) -> WebSocketResult<Arc<Session>> {
        self.registry
            .active_get(client_id)
            .ok_or_else(|| {
                ServerError::ClientNotFound {
                    client_id: client_id.to_string(),
                }
                .into()
            })
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.registry.active_ids()
    }

    pub fn client_count(&self) -> usize {
        self.registry.active_len()
    }

    pub fn is_listening(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.shutting_down.load(Ordering::Acquire)
    }

    /// Address the listener actually bound; useful when the options asked for
    /// port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    fn connected_codec(
        &self,
        client_id: &str,
    ) -> WebSocketResult<Arc<dyn crate::transport::FrameCodec>> {
        let session = self.get_client_by_id(client_id)?;
        session.codec().ok_or_else(|| {
            ServerError::ClientNotConnected {
                client_id: client_id.to_string(),
            }
            .into()
        })
    }
}

fn wrap_send(client_id: &str, source: WebSocketError) -> WebSocketError {
    match source {
        WebSocketError::Cancelled => WebSocketError::Cancelled,
        other => ServerError::Send {
            client_id: client_id.to_string(),
            source: Box::new(other),
        }
        .into(),
    }
}
