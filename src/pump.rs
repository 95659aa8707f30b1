//! The receive loop shared by server-side connections and the outbound client:
//! drains one codec until the peer closes, the codec dies, or the owner cancels.

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::frame::{describe_close, CloseCode, Frame};
use crate::core::types::WebSocketResult;
use crate::transport::{CodecState, FrameCodec};

/// Why the pump stopped, when it stopped without an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PumpExit {
    Cancelled,
    PeerClosed,
    CodecClosed,
}

/// Where pumped frames go. Implementations dispatch on detached tasks; these
/// methods must not block.
pub(crate) trait PumpSink: Send + Sync {
    fn on_text(&self, text: String);
    fn on_binary(&self, data: Bytes);
    fn on_peer_close(&self, description: String);
    /// True when this side is already tearing the connection down, in which case a
    /// peer close is not answered a second time.
    fn is_closing(&self) -> bool;
}

pub(crate) async fn run(
    codec: &Arc<dyn FrameCodec>,
    sink: &dyn PumpSink,
    cancel: &CancellationToken,
) -> WebSocketResult<PumpExit> {
    while codec.state() == CodecState::Open {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(PumpExit::Cancelled),
            received = codec.receive() => match received? {
                Frame::Text(data) => {
                    sink.on_text(String::from_utf8_lossy(&data).into_owned());
                }
                Frame::Binary(data) => {
                    sink.on_binary(data);
                }
                Frame::Close(frame) => {
                    if !sink.is_closing() {
                        sink.on_peer_close(describe_close(&frame));
                        if let Err(err) = codec.close(CloseCode::Normal, "Closing").await {
                            debug!(error = %err, "answering the peer close failed");
                        }
                    }
                    return Ok(PumpExit::PeerClosed);
                }
            }
        }
    }
    Ok(PumpExit::CodecClosed)
}
