//! Narrow seams between the upgrade machinery and the outside world: a raw duplex
//! byte stream and the frame codec bound to it after a successful handshake. Both
//! are traits so tests can drive the real machinery over in-memory doubles.

pub mod tungstenite;

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::task::noop_waker_ref;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::core::frame::{CloseCode, Frame};
use crate::core::types::{CodecConfig, WebSocketResult};

/// Raw byte stream under one connection.
///
/// The upgrade handler reads and writes it directly during the handshake; once a
/// connection is accepted the stream moves into the codec and is never touched raw
/// again.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Remote address, when the transport has one.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Non-blocking probe: bytes that are ready right now land in `buf`;
    /// `WouldBlock` means the stream is drained at this instant.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>
    where
        Self: Sized,
    {
        let mut cx = Context::from_waker(noop_waker_ref());
        let mut read_buf = ReadBuf::new(buf);
        match Pin::new(self).poll_read(&mut cx, &mut read_buf) {
            Poll::Ready(Ok(())) => Ok(read_buf.filled().len()),
            Poll::Ready(Err(err)) => Err(err),
            Poll::Pending => Err(io::ErrorKind::WouldBlock.into()),
        }
    }
}

impl RawStream for TcpStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

/// Where a codec instance sits in the close handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecState {
    Open,
    CloseSent,
    CloseReceived,
    Closed,
}

/// Which side of the connection the codec frames for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecRole {
    Server,
    Client,
}

/// The frame codec collaborator: message-level send/receive/close over an upgraded
/// stream. Implementations own the stream and serialize their own access to it.
#[async_trait]
pub trait FrameCodec: Send + Sync {
    fn state(&self) -> CodecState;

    /// Subprotocol negotiated during the handshake, if any.
    fn subprotocol(&self) -> Option<&str>;

    /// Next data or close frame. Control frames are handled internally and do not
    /// surface here.
    async fn receive(&self) -> WebSocketResult<Frame>;

    async fn send_text(&self, text: &str) -> WebSocketResult<()>;

    async fn send_binary(&self, data: &[u8]) -> WebSocketResult<()>;

    async fn close(&self, code: CloseCode, reason: &str) -> WebSocketResult<()>;
}

/// Builds a codec over a stream the handshake just finished with. Injected so tests
/// can substitute scripted codecs for the tungstenite-backed production one.
#[async_trait]
pub trait CodecFactory: Send + Sync {
    async fn create(
        &self,
        stream: Box<dyn RawStream>,
        role: CodecRole,
        subprotocol: Option<String>,
        config: CodecConfig,
    ) -> Arc<dyn FrameCodec>;
}
