//! tokio-tungstenite bound to an already-upgraded stream. The handshake happens in
//! this crate; the codec only frames.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as TungCloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame as TungCloseFrame, Role, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::WebSocketStream;

use super::{CodecFactory, CodecRole, CodecState, FrameCodec, RawStream};
use crate::core::frame::{CloseCode, CloseFrame, Frame};
use crate::core::types::{CodecConfig, WebSocketError, WebSocketResult};

type WsStream = WebSocketStream<Box<dyn RawStream>>;

fn map_ws_error(context: &'static str, err: impl ToString) -> WebSocketError {
    WebSocketError::Transport {
        context,
        error: err.to_string(),
    }
}

fn close_to_core(frame: TungCloseFrame) -> CloseFrame {
    CloseFrame {
        code: CloseCode::from_u16(u16::from(frame.code)),
        reason: String::from_utf8_lossy(AsRef::<Bytes>::as_ref(&frame.reason)).into_owned(),
    }
}

fn core_to_close(code: CloseCode, reason: &str) -> TungCloseFrame {
    TungCloseFrame {
        code: TungCloseCode::from(code.as_u16()),
        reason: Utf8Bytes::from(reason.to_string()),
    }
}

impl From<CodecConfig> for WebSocketConfig {
    fn from(cfg: CodecConfig) -> Self {
        WebSocketConfig::default()
            .max_message_size(cfg.max_message_size)
            .max_frame_size(cfg.max_frame_size)
            .write_buffer_size(cfg.write_buffer_size)
    }
}

/// Production codec: a split tungstenite stream with the close handshake tracked so
/// callers can observe open/closing/closed without touching the wire.
pub struct TungsteniteCodec {
    writer: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    reader: tokio::sync::Mutex<SplitStream<WsStream>>,
    state: Mutex<CodecState>,
    subprotocol: Option<String>,
}

impl TungsteniteCodec {
    fn set_state(&self, state: CodecState) {
        *self.state.lock().unwrap() = state;
    }

    fn on_close_received(&self) {
        let mut state = self.state.lock().unwrap();
        *state = match *state {
            CodecState::CloseSent => CodecState::Closed,
            _ => CodecState::CloseReceived,
        };
    }

    /// Advance the close handshake; returns whether a close frame still needs to go
    /// out. Racing closers collapse onto a single frame.
    fn begin_close(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            CodecState::Open => {
                *state = CodecState::CloseSent;
                true
            }
            CodecState::CloseReceived => {
                *state = CodecState::Closed;
                true
            }
            CodecState::CloseSent | CodecState::Closed => false,
        }
    }
}

#[async_trait]
impl FrameCodec for TungsteniteCodec {
    fn state(&self) -> CodecState {
        *self.state.lock().unwrap()
    }

    fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    async fn receive(&self) -> WebSocketResult<Frame> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(Frame::Text(AsRef::<Bytes>::as_ref(&text).clone()))
                }
                Some(Ok(Message::Binary(data))) => return Ok(Frame::Binary(data)),
                // tungstenite answers pings on its own; nothing to surface.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    self.on_close_received();
                    return Ok(Frame::Close(frame.map(close_to_core)));
                }
                Some(Err(err)) => {
                    self.set_state(CodecState::Closed);
                    return Err(map_ws_error("read", err));
                }
                None => {
                    self.set_state(CodecState::Closed);
                    return Err(map_ws_error("read", "stream ended without a close frame"));
                }
            }
        }
    }

    async fn send_text(&self, text: &str) -> WebSocketResult<()> {
        self.writer
            .lock()
            .await
            .send(Message::text(text.to_string()))
            .await
            .map_err(|err| map_ws_error("write", err))
    }

    async fn send_binary(&self, data: &[u8]) -> WebSocketResult<()> {
        self.writer
            .lock()
            .await
            .send(Message::binary(Bytes::copy_from_slice(data)))
            .await
            .map_err(|err| map_ws_error("write", err))
    }

    async fn close(&self, code: CloseCode, reason: &str) -> WebSocketResult<()> {
        if !self.begin_close() {
            return Ok(());
        }
        self.writer
            .lock()
            .await
            .send(Message::Close(Some(core_to_close(code, reason))))
            .await
            .map_err(|err| map_ws_error("close", err))
    }
}

/// Factory wiring accepted or dialed streams into [`TungsteniteCodec`] instances.
#[derive(Clone, Copy, Debug, Default)]
pub struct TungsteniteFactory;

#[async_trait]
impl CodecFactory for TungsteniteFactory {
    async fn create(
        &self,
        stream: Box<dyn RawStream>,
        role: CodecRole,
        subprotocol: Option<String>,
        config: CodecConfig,
    ) -> Arc<dyn FrameCodec> {
        let role = match role {
            CodecRole::Server => Role::Server,
            CodecRole::Client => Role::Client,
        };
        let ws = WebSocketStream::from_raw_socket(stream, role, Some(config.into())).await;
        let (writer, reader) = ws.split();
        Arc::new(TungsteniteCodec {
            writer: tokio::sync::Mutex::new(writer),
            reader: tokio::sync::Mutex::new(reader),
            state: Mutex::new(CodecState::Open),
            subprotocol,
        })
    }
}
