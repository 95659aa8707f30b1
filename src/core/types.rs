use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use thiserror::Error;

/// Convenience result alias for websocket operations.
pub type WebSocketResult<T> = Result<T, WebSocketError>;

/// Canonical error surface of the crate.
///
/// The four domain kinds below compose into this root so callers can match on the
/// broad class first and drill into the specific failure when they care.
#[derive(Debug, Error)]
pub enum WebSocketError {
    #[error("upgrade failed: {0}")]
    Upgrade(#[from] UpgradeError),

    #[error("server error: {0}")]
    Server(#[from] ServerError),

    #[error("client error: {0}")]
    Client(#[from] ClientError),

    #[error("context error: {0}")]
    Context(#[from] ContextError),

    #[error("transport error ({context}): {error}")]
    Transport {
        context: &'static str,
        error: String,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl WebSocketError {
    #[inline]
    pub fn transport(context: &'static str, error: impl ToString) -> Self {
        Self::Transport {
            context,
            error: error.to_string(),
        }
    }
}

/// Failures of the HTTP/1.1 upgrade exchange, on either side.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("stream closed before any handshake bytes arrived")]
    StreamClosed,

    #[error("not a websocket upgrade request")]
    NotWebSocket,

    #[error("unsupported Sec-WebSocket-Version {got:?}, only \"13\" is accepted")]
    UnsupportedVersion { got: String },

    #[error("Sec-WebSocket-Key must be base64 of exactly 16 bytes")]
    InvalidKey,

    #[error("no acceptable subprotocol: server offers {server:?}, client listed {client:?}")]
    SubprotocolDeclined { server: String, client: String },

    #[error("request path {path:?} is not a valid websocket resource name")]
    InvalidRequestPath { path: String },

    #[error("expected 101 Switching Protocols, got {start_line:?}")]
    NotSwitchingProtocols { start_line: String },

    #[error("upgrade response lacks {name}: {value} header")]
    MissingUpgradeHeader {
        name: &'static str,
        value: &'static str,
    },

    #[error("Sec-WebSocket-Accept does not match the key sent")]
    AcceptMismatch,

    #[error("handshake I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of server lifecycle and per-client operations.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server is already started")]
    AlreadyStarted,

    #[error("server is not started")]
    NotStarted,

    #[error("server is already shutting down")]
    ShutdownInProgress,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Client not found")]
    ClientNotFound { client_id: String },

    #[error("Client is not connected")]
    ClientNotConnected { client_id: String },

    #[error("client id {id:?} is not a non-empty UUID")]
    InvalidClientId { id: String },

    #[error("a codec is already attached to this session's stream")]
    CodecAlreadyAttached,

    #[error("sending to client {client_id} failed: {source}")]
    Send {
        client_id: String,
        #[source]
        source: Box<WebSocketError>,
    },
}

/// Failures of outbound client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is already connected")]
    AlreadyConnected,

    #[error("client is already disconnecting")]
    AlreadyDisconnecting,

    #[error("client is not connected")]
    NotConnected,

    #[error("no frame codec is initialized for this connection")]
    CodecNotInitialized,

    #[error("connect failed: {source}")]
    Connect {
        #[source]
        source: Box<WebSocketError>,
    },

    #[error("send failed: {source}")]
    Send {
        #[source]
        source: Box<WebSocketError>,
    },
}

/// Failures raised by [`WebContext`](crate::WebContext) accessors and mutators.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("message has no start line")]
    MissingStartLine,

    #[error("required header {name:?} is missing or empty")]
    MissingHeader { name: String },

    #[error("start line carries a non-numeric status token {token:?}")]
    NonNumericStatus { token: String },

    #[error("status code {code} has no known status name")]
    UnknownStatus { code: u16 },

    #[error("status code was already set on this context")]
    StatusAlreadySet,

    #[error("content was already set on this context")]
    ContentAlreadySet,
}

/// Buffer and limit knobs handed to the frame codec when a connection is established.
#[derive(Clone, Copy, Debug)]
pub struct CodecConfig {
    pub max_message_size: Option<usize>,
    pub max_frame_size: Option<usize>,
    pub write_buffer_size: usize,
    /// Advisory keepalive interval for codecs that generate their own pings.
    pub keepalive_interval: Duration,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_message_size: Some(16 * 1024 * 1024),
            max_frame_size: Some(16 * 1024 * 1024),
            write_buffer_size: 128 << 10,
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

/// Configuration for a [`Server`](crate::Server).
#[derive(Clone, Debug)]
pub struct ServerOptions {
    /// Address the listener binds to.
    pub local_ip: IpAddr,
    /// Port the listener binds to; 0 picks an ephemeral port.
    pub port: u16,
    /// Keep disconnected clients in the passive registry for re-identification.
    pub remember_disconnected_clients: bool,
    /// Expire passive entries instead of keeping them forever. Only meaningful
    /// together with `remember_disconnected_clients`.
    pub remove_passive_clients_after_expiration: bool,
    /// Time a passive entry survives before expiry removes it.
    pub passive_client_lifetime: Duration,
    /// Echo the confirmed client id back in the `x-user-id` response header.
    pub send_user_id_to_client: bool,
    /// The single subprotocol this server is willing to speak, if any.
    pub subprotocol: Option<String>,
    /// Limits forwarded to the frame codec.
    pub codec: CodecConfig,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            local_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8010,
            remember_disconnected_clients: false,
            remove_passive_clients_after_expiration: false,
            passive_client_lifetime: Duration::from_secs(60),
            send_user_id_to_client: false,
            subprotocol: None,
            codec: CodecConfig::default(),
        }
    }
}
