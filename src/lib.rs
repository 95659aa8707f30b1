//! Embeddable RFC 6455 websocket server and client speaking directly over raw
//! TCP, with no HTTP framework or reverse proxy in front. The handshake lives
//! here; message framing is delegated to a pluggable codec (tokio-tungstenite by
//! default) bound to the stream once the upgrade succeeds.

mod cancel;
pub mod client;
pub(crate) mod core;
pub mod handshake;
mod pump;
pub mod server;
pub mod testing;
pub mod transport;

pub use crate::client::Client;
pub use crate::core::context::{StatusCode, WebContext, USER_ID_HEADER};
pub use crate::core::events::{ClientHandler, ServerHandler, UpgradeOffer};
pub use crate::core::expiring::{ExpiringMap, ExpiryCallback};
pub use crate::core::frame::{describe_close, frame_bytes, CloseCode, CloseFrame, Frame};
pub use crate::core::session::Session;
pub use crate::core::types::{
    ClientError, CodecConfig, ContextError, ServerError, ServerOptions, UpgradeError,
    WebSocketError, WebSocketResult,
};
pub use crate::server::Server;
