//! The outbound counterpart: dials TCP, runs the client side of the handshake,
//! then pumps messages on a background task until either side closes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cancel::with_cancel;
use crate::core::context::{WebContext, USER_ID_HEADER};
use crate::core::events::{client_handler_snapshot, ClientHandler, ClientHandlers};
use crate::core::frame::CloseCode;
use crate::core::types::{
    ClientError, CodecConfig, UpgradeError, WebSocketError, WebSocketResult,
};
use crate::handshake::{validate_request_path, validate_upgrade_response, UpgradeHandler};
use crate::pump::{self, PumpSink};
use crate::transport::tungstenite::TungsteniteFactory;
use crate::transport::{CodecFactory, CodecRole, CodecState, FrameCodec};

enum ConnEvent {
    Message(String),
    Binary(Bytes),
    Disconnected(String),
}

fn spawn_dispatcher(handlers: ClientHandlers) -> mpsc::UnboundedSender<ConnEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel::<ConnEvent>();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            for handler in client_handler_snapshot(&handlers) {
                match &event {
                    ConnEvent::Message(text) => handler.on_message(text.clone()).await,
                    ConnEvent::Binary(data) => handler.on_binary_message(data.clone()).await,
                    ConnEvent::Disconnected(reason) => {
                        handler.on_disconnected(reason.clone()).await;
                    }
                }
            }
        }
    });
    tx
}

struct ClientSink {
    events: mpsc::UnboundedSender<ConnEvent>,
    disconnecting: Arc<AtomicBool>,
}

impl PumpSink for ClientSink {
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
        self.disconnecting.load(Ordering::Acquire)
    }
}

/// Websocket client speaking the upgrade directly over a raw TCP connection.
pub struct Client {
    host: String,
    port: u16,
    request_path: String,
    user_id: RwLock<Option<String>>,
    subprotocols: Vec<String>,
    extra_headers: Vec<(String, String)>,
    handlers: ClientHandlers,
    factory: Arc<dyn CodecFactory>,
    codec_config: CodecConfig,
    codec: Mutex<Option<Arc<dyn FrameCodec>>>,
    pump_cancel: Mutex<Option<CancellationToken>>,
    connected: Arc<AtomicBool>,
    disconnecting: Arc<AtomicBool>,
    accepted_subprotocol: RwLock<Option<String>>,
}

impl Client {
    pub fn new(host: impl Into<String>, port: u16, request_path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            request_path: request_path.into(),
            user_id: RwLock::new(None),
            subprotocols: Vec::new(),
            extra_headers: Vec::new(),
            handlers: Arc::new(RwLock::new(Vec::new())),
            factory: Arc::new(TungsteniteFactory),
            codec_config: CodecConfig::default(),
            codec: Mutex::new(None),
            pump_cancel: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            disconnecting: Arc::new(AtomicBool::new(false)),
            accepted_subprotocol: RwLock::new(None),
        }
    }

    /// Identity hint sent as `x-user-id` with the upgrade request.
    pub fn with_user_id(self, user_id: impl Into<String>) -> Self {
        *self.user_id.write().unwrap() = Some(user_id.into());
        self
    }

    /// Subprotocols offered in `Sec-WebSocket-Protocol`.
    pub fn with_subprotocols(mut self, protocols: Vec<String>) -> Self {
        self.subprotocols = protocols;
        self
    }

    /// Extra header carried on the upgrade request.
    pub fn with_extra_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    pub fn with_codec_config(mut self, config: CodecConfig) -> Self {
        self.codec_config = config;
        self
    }

    /// Custom codec factory; tests inject scripted codecs here.
    pub fn with_factory(mut self, factory: Arc<dyn CodecFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn add_handler(&self, handler: Arc<dyn ClientHandler>) {
        self.handlers.write().unwrap().push(handler);
    }

    /// Dial, shake hands, start pumping.
    pub async fn connect(&self, cancellation: Option<CancellationToken>) -> WebSocketResult<()> {
        if self
            .connected
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ClientError::AlreadyConnected.into());
        }
        match with_cancel(cancellation.as_ref(), self.establish()).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.connected.store(false, Ordering::Release);
                Err(wrap_connect(err))
            }
        }
    }

    async fn establish(&self) -> WebSocketResult<()> {
        let path = validate_request_path(&self.request_path)?;
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(UpgradeError::Io)?;
        let mut handler = UpgradeHandler::new(stream, self.factory.clone(), self.codec_config);

        let mut request = WebContext::request(&self.host, self.port, &path);
        for (name, value) in &self.extra_headers {
            request.append_header(name, value.clone());
        }
        if let Some(user_id) = self.user_id.read().unwrap().clone() {
            request.set_header(USER_ID_HEADER, user_id);
        }
        if !self.subprotocols.is_empty() {
            request.set_header("Sec-WebSocket-Protocol", self.subprotocols.join(", "));
        }

        let key = handler.send_upgrade_request(&mut request).await?;
        let response = handler.await_context().await?;
        validate_upgrade_response(&response, &key)?;

        if let Some(confirmed) = response.first_value(USER_ID_HEADER) {
            *self.user_id.write().unwrap() = Some(confirmed.to_string());
        }
        let accepted = response
            .first_value("Sec-WebSocket-Protocol")
            .map(str::to_string);
        *self.accepted_subprotocol.write().unwrap() = accepted.clone();

        let codec = handler.into_codec(CodecRole::Client, accepted).await;
        *self.codec.lock().unwrap() = Some(codec.clone());
        self.disconnecting.store(false, Ordering::Release);

        let cancel = CancellationToken::new();
        *self.pump_cancel.lock().unwrap() = Some(cancel.clone());

        info!(host = %self.host, port = self.port, path = %path, "client connected");
        let handlers = self.handlers.clone();
        let disconnecting = self.disconnecting.clone();
        let connected = self.connected.clone();
        tokio::spawn(async move {
            let sink = ClientSink {
                events: spawn_dispatcher(handlers),
                disconnecting,
            };
            match pump::run(&codec, &sink, &cancel).await {
                Ok(exit) => debug!(?exit, "client pump finished"),
                Err(err) => debug!(error = %err, "client pump failed"),
            }
            connected.store(false, Ordering::Release);
        });
        Ok(())
    }

    /// Close the connection with a normal-closure reason and tear the pump down.
    pub async fn disconnect(
        &self,
        reason: &str,
        cancellation: Option<CancellationToken>,
    ) -> WebSocketResult<()> {
        if self.disconnecting.swap(true, Ordering::AcqRel) {
            return Err(ClientError::AlreadyDisconnecting.into());
        }
        info!(reason, "client disconnecting");

        let codec = self.codec.lock().unwrap().take();
        if let Some(codec) = codec {
            if matches!(
                codec.state(),
                CodecState::Open | CodecState::CloseReceived
            ) {
                if let Err(err) =
                    with_cancel(cancellation.as_ref(), codec.close(CloseCode::Normal, reason))
                        .await
                {
                    debug!(error = %err, "close frame did not go out");
                }
            }
        }

        if let Some(cancel) = self.pump_cancel.lock().unwrap().take() {
            cancel.cancel();
        }
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    pub async fn send_message(
        &self,
        text: &str,
        cancellation: Option<CancellationToken>,
    ) -> WebSocketResult<()> {
        let codec = self.connected_codec()?;
        with_cancel(cancellation.as_ref(), codec.send_text(text))
            .await
            .map_err(wrap_send)
    }

    pub async fn send_binary_message(
        &self,
        data: &[u8],
        cancellation: Option<CancellationToken>,
    ) -> WebSocketResult<()> {
        let codec = self.connected_codec()?;
        with_cancel(cancellation.as_ref(), codec.send_binary(data))
            .await
            .map_err(wrap_send)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// The confirmed identity: the hint given at construction, or whatever the
    /// server disclosed in its `x-user-id` response header.
    pub fn user_id(&self) -> Option<String> {
        self.user_id.read().unwrap().clone()
    }

    /// Subprotocol the server accepted, if any.
    pub fn subprotocol(&self) -> Option<String> {
        self.accepted_subprotocol.read().unwrap().clone()
    }

    fn connected_codec(&self) -> WebSocketResult<Arc<dyn FrameCodec>> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected.into());
        }
        self.codec
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ClientError::CodecNotInitialized.into())
    }
}

fn wrap_connect(source: WebSocketError) -> WebSocketError {
    match source {
        WebSocketError::Cancelled => WebSocketError::Cancelled,
        err @ WebSocketError::Client(_) => err,
        other => ClientError::Connect {
            source: Box::new(other),
        }
        .into(),
    }
}

fn wrap_send(source: WebSocketError) -> WebSocketError {
    match source {
        WebSocketError::Cancelled => WebSocketError::Cancelled,
        err @ WebSocketError::Client(_) => err,
        other => ClientError::Send {
            source: Box::new(other),
        }
        .into(),
    }
}
