//! Reusable test doubles for exercising the upgrade machinery, the pump and both
//! endpoints without real sockets: an in-memory raw stream, a scripted frame codec
//! and channel-backed recording handlers.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;

use crate::core::context::StatusCode;
use crate::core::events::{ClientHandler, ServerHandler, UpgradeOffer};
use crate::core::frame::{CloseCode, Frame};
use crate::core::types::{CodecConfig, WebSocketError, WebSocketResult};
use crate::transport::{CodecFactory, CodecRole, CodecState, FrameCodec, RawStream};

/// In-memory duplex stream usable wherever a TCP stream would be.
pub struct MemoryStream {
    inner: DuplexStream,
}

/// Connected pair of in-memory streams.
pub fn memory_pair() -> (MemoryStream, MemoryStream) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (MemoryStream { inner: a }, MemoryStream { inner: b })
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl RawStream for MemoryStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Frame codec driven entirely by channels: tests push inbound frames and observe
/// everything the code under test sends.
pub struct ScriptedCodec {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    sent: mpsc::UnboundedSender<Frame>,
    state: Mutex<CodecState>,
    subprotocol: Option<String>,
}

/// Test-side handle for a [`ScriptedCodec`].
pub struct ScriptedPeer {
    pub inbound: mpsc::UnboundedSender<Frame>,
    pub sent: mpsc::UnboundedReceiver<Frame>,
}

/// Build a codec plus the peer handle that scripts it.
pub fn scripted_codec(subprotocol: Option<String>) -> (Arc<ScriptedCodec>, ScriptedPeer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    (
        Arc::new(ScriptedCodec {
            incoming: tokio::sync::Mutex::new(inbound_rx),
            sent: sent_tx,
            state: Mutex::new(CodecState::Open),
            subprotocol,
        }),
        ScriptedPeer {
            inbound: inbound_tx,
            sent: sent_rx,
        },
    )
}

#[async_trait]
impl FrameCodec for ScriptedCodec {
    fn state(&self) -> CodecState {
        *self.state.lock().unwrap()
    }

    fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    async fn receive(&self) -> WebSocketResult<Frame> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some(frame @ Frame::Close(_)) => {
                let mut state = self.state.lock().unwrap();
                *state = match *state {
                    CodecState::CloseSent => CodecState::Closed,
                    _ => CodecState::CloseReceived,
                };
                Ok(frame)
            }
            Some(frame) => Ok(frame),
            None => {
                *self.state.lock().unwrap() = CodecState::Closed;
                Err(WebSocketError::transport("read", "scripted stream ended"))
            }
        }
    }

    async fn send_text(&self, text: &str) -> WebSocketResult<()> {
        self.sent
            .send(Frame::Text(Bytes::copy_from_slice(text.as_bytes())))
            .map_err(|_| WebSocketError::transport("write", "peer dropped"))
    }

    async fn send_binary(&self, data: &[u8]) -> WebSocketResult<()> {
        self.sent
            .send(Frame::Binary(Bytes::copy_from_slice(data)))
            .map_err(|_| WebSocketError::transport("write", "peer dropped"))
    }

    async fn close(&self, code: CloseCode, reason: &str) -> WebSocketResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            *state = match *state {
                CodecState::Open => CodecState::CloseSent,
                _ => CodecState::Closed,
            };
        }
        self.sent
            .send(Frame::close(code, reason))
            .map_err(|_| WebSocketError::transport("close", "peer dropped"))
    }
}

/// Factory that hands out pre-armed scripted codecs in order, dropping the streams
/// it is given.
pub struct ScriptedFactory {
    queue: Mutex<Vec<Arc<ScriptedCodec>>>,
}

impl ScriptedFactory {
    pub fn new(codecs: Vec<Arc<ScriptedCodec>>) -> Self {
        let mut queue = codecs;
        queue.reverse();
        Self {
            queue: Mutex::new(queue),
        }
    }

    /// Factory for flows that never reach codec creation.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl CodecFactory for ScriptedFactory {
    async fn create(
        &self,
        _stream: Box<dyn RawStream>,
        _role: CodecRole,
        subprotocol: Option<String>,
        _config: CodecConfig,
    ) -> Arc<dyn FrameCodec> {
        if let Some(codec) = self.queue.lock().unwrap().pop() {
            return codec;
        }
        let (codec, _peer) = scripted_codec(subprotocol);
        codec
    }
}

/// Everything a server fires at its handlers, as owned data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerEvent {
    Connected(String),
    Disconnected { client_id: String, reason: String },
    Message { client_id: String, text: String },
    Binary { client_id: String, data: Bytes },
    PassiveExpired(String),
}

/// Handler that forwards every event into a channel and optionally rejects
/// upgrades with a fixed status and body.
pub struct RecordingServerHandler {
    events: mpsc::UnboundedSender<ServerEvent>,
    reject: Option<(StatusCode, String)>,
}

impl RecordingServerHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                events: tx,
                reject: None,
            }),
            rx,
        )
    }

    /// Recording handler whose upgrade callback turns every offer down.
    pub fn rejecting(
        status: StatusCode,
        body: &str,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                events: tx,
                reject: Some((status, body.to_string())),
            }),
            rx,
        )
    }
}

#[async_trait]
impl ServerHandler for RecordingServerHandler {
    async fn on_upgrade(&self, offer: &mut UpgradeOffer<'_>) -> WebSocketResult<()> {
        if let Some((status, body)) = &self.reject {
            offer.handle = false;
            offer.response.set_status(*status)?;
            offer.response.set_content(body.clone())?;
        }
        Ok(())
    }

    async fn on_client_connected(&self, client_id: String) {
        let _ = self.events.send(ServerEvent::Connected(client_id));
    }

    async fn on_client_disconnected(&self, client_id: String, reason: String) {
        let _ = self
            .events
            .send(ServerEvent::Disconnected { client_id, reason });
    }

    async fn on_message(&self, client_id: String, text: String) {
        let _ = self.events.send(ServerEvent::Message { client_id, text });
    }

    async fn on_binary_message(&self, client_id: String, data: Bytes) {
        let _ = self.events.send(ServerEvent::Binary { client_id, data });
    }

    async fn on_passive_expired(&self, client_id: String) {
        let _ = self.events.send(ServerEvent::PassiveExpired(client_id));
    }
}

/// Client-side counterpart of [`ServerEvent`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    Message(String),
    Binary(Bytes),
    Disconnected(String),
}

/// Handler forwarding client events into a channel.
pub struct RecordingClientHandler {
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl RecordingClientHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { events: tx }), rx)
    }
}

#[async_trait]
impl ClientHandler for RecordingClientHandler {
    async fn on_message(&self, text: String) {
        let _ = self.events.send(ClientEvent::Message(text));
    }

    async fn on_binary_message(&self, data: Bytes) {
        let _ = self.events.send(ClientEvent::Binary(data));
    }

    async fn on_disconnected(&self, reason: String) {
        let _ = self.events.send(ClientEvent::Disconnected(reason));
    }
}
