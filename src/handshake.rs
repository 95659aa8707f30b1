//! The HTTP/1.1 side of RFC 6455: reading the initial bytes off a raw stream,
//! validating or producing the upgrade exchange, and handing the stream over to a
//! frame codec once both sides agree.

use std::io;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::core::context::{StatusCode, WebContext, USER_ID_HEADER};
use crate::core::types::{CodecConfig, UpgradeError, WebSocketResult};
use crate::transport::{CodecFactory, CodecRole, FrameCodec, RawStream};

/// The fixed GUID every conforming handshake mixes into the accept token.
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `base64(SHA-1(key || GUID))`, the proof the server understood the handshake.
pub fn accept_token(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Fresh `Sec-WebSocket-Key`: 16 random bytes, base64-encoded.
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64.encode(nonce)
}

/// Normalize and validate a websocket resource name: a leading `/` is prepended
/// when missing, and only unreserved characters plus `/` are allowed after it.
pub fn validate_request_path(path: &str) -> Result<String, UpgradeError> {
    let normalized = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    let valid = normalized[1..]
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~' | '/'));
    if !valid {
        return Err(UpgradeError::InvalidRequestPath {
            path: path.to_string(),
        });
    }
    Ok(normalized)
}

/// Outcome of the subprotocol rule: the header value to echo (if any) and the
/// protocol the codec should consider agreed on (if any).
fn negotiate_subprotocol(
    client: &[String],
    server: Option<&str>,
) -> Result<(Option<String>, Option<String>), UpgradeError> {
    match (client.is_empty(), server) {
        (true, None) => Ok((None, None)),
        (true, Some(server)) => Err(UpgradeError::SubprotocolDeclined {
            server: server.to_string(),
            client: String::new(),
        }),
        (false, None) => Ok((Some(client.join(", ")), None)),
        (false, Some(server)) => {
            if client.iter().any(|c| c.eq_ignore_ascii_case(server)) {
                Ok((Some(server.to_string()), Some(server.to_string())))
            } else {
                Err(UpgradeError::SubprotocolDeclined {
                    server: server.to_string(),
                    client: client.join(", "),
                })
            }
        }
    }
}

/// Validate the server's answer to an upgrade request against the key that was
/// sent, the way RFC 6455 §4.1 orders the checks.
pub fn validate_upgrade_response(response: &WebContext, sent_key: &str) -> WebSocketResult<()> {
    let start_line = response.start_line().unwrap_or_default();
    if !start_line.contains("101 Switching Protocols") {
        return Err(UpgradeError::NotSwitchingProtocols {
            start_line: start_line.to_string(),
        }
        .into());
    }
    if !response.header_contains("Upgrade", "websocket") {
        return Err(UpgradeError::MissingUpgradeHeader {
            name: "Upgrade",
            value: "websocket",
        }
        .into());
    }
    if !response.header_contains("Connection", "Upgrade") {
        return Err(UpgradeError::MissingUpgradeHeader {
            name: "Connection",
            value: "Upgrade",
        }
        .into());
    }
    match response.first_value("Sec-WebSocket-Accept") {
        Some(token) if token == accept_token(sent_key) => Ok(()),
        _ => Err(UpgradeError::AcceptMismatch.into()),
    }
}

/// Performs one side of the upgrade over a raw stream, then surrenders the stream
/// to the injected codec factory.
pub struct UpgradeHandler<S: RawStream> {
    stream: S,
    factory: Arc<dyn CodecFactory>,
    config: CodecConfig,
}

impl<S: RawStream> UpgradeHandler<S> {
    pub fn new(stream: S, factory: Arc<dyn CodecFactory>, config: CodecConfig) -> Self {
        Self {
            stream,
            factory,
            config,
        }
    }

    /// Peer address of the underlying stream.
    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.stream.peer_addr()
    }

    /// Read the incoming HTTP message: one awaited read, then whatever else is
    /// already available, accumulated as text.
    pub async fn await_context(&mut self) -> WebSocketResult<WebContext> {
        let mut buf = [0u8; 1024];
        let mut text = String::new();

        let n = self.stream.read(&mut buf).await.map_err(UpgradeError::Io)?;
        if n == 0 {
            return Err(UpgradeError::StreamClosed.into());
        }
        text.push_str(&String::from_utf8_lossy(&buf[..n]));

        loop {
            match self.stream.read_available(&mut buf) {
                Ok(0) => break,
                Ok(n) => text.push_str(&String::from_utf8_lossy(&buf[..n])),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(UpgradeError::Io(err).into()),
            }
        }

        Ok(WebContext::from_text(&text))
    }

    /// Answer a valid upgrade request with `101 Switching Protocols` and bind a
    /// codec to the stream. Headers from `response_template` are carried over;
    /// the handshake headers are added on top.
    pub async fn accept(
        mut self,
        request: &WebContext,
        response_template: &WebContext,
        confirmed_id: &str,
        disclose_id: bool,
        server_protocol: Option<&str>,
    ) -> WebSocketResult<Arc<dyn FrameCodec>> {
        if !request.is_websocket_request() {
            return Err(UpgradeError::NotWebSocket.into());
        }
        let version = request
            .first_value("Sec-WebSocket-Version")
            .unwrap_or_default();
        if version.trim() != "13" {
            return Err(UpgradeError::UnsupportedVersion {
                got: version.to_string(),
            }
            .into());
        }
        let key = request.first_value("Sec-WebSocket-Key").unwrap_or_default();
        if !key.is_empty() {
            let decoded = BASE64.decode(key).map_err(|_| UpgradeError::InvalidKey)?;
            if decoded.len() != 16 {
                return Err(UpgradeError::InvalidKey.into());
            }
        }

        let offered = request.get_all_values("Sec-WebSocket-Protocol");
        let (protocol_header, agreed_protocol) =
            negotiate_subprotocol(&offered, server_protocol)?;

        let mut response = WebContext::response_with(StatusCode::SwitchingProtocols);
        for (name, value) in response_template.headers() {
            response.append_header(name, value);
        }
        response.set_header("Connection", "Upgrade");
        response.set_header("Upgrade", "websocket");
        response.set_header("Sec-WebSocket-Accept", accept_token(key));
        if let Some(header) = &protocol_header {
            response.set_header("Sec-WebSocket-Protocol", header.clone());
        }
        if disclose_id {
            response.set_header(USER_ID_HEADER, confirmed_id);
        }

        let wire = response.emit_response().map_err(|err| {
            debug!(error = %err, "building the 101 response failed");
            err
        })?;
        self.stream
            .write_all(wire.as_bytes())
            .await
            .map_err(UpgradeError::Io)?;
        self.stream.flush().await.map_err(UpgradeError::Io)?;

        Ok(self
            .factory
            .create(
                Box::new(self.stream),
                CodecRole::Server,
                agreed_protocol,
                self.config,
            )
            .await)
    }

    /// Write a non-upgrade response and surrender; the caller drops the stream.
    pub async fn reject(mut self, response: &mut WebContext) -> WebSocketResult<()> {
        if response.status().is_none() {
            response.set_status(StatusCode::BadRequest)?;
        }
        let wire = response.emit_response()?;
        self.stream
            .write_all(wire.as_bytes())
            .await
            .map_err(UpgradeError::Io)?;
        self.stream.flush().await.map_err(UpgradeError::Io)?;
        Ok(())
    }

    /// Client side: decorate the request context with the handshake headers, put
    /// it on the wire, and return the key for later response validation.
    pub async fn send_upgrade_request(
        &mut self,
        request: &mut WebContext,
    ) -> WebSocketResult<String> {
        let path = request.request_path()?;
        validate_request_path(&path)?;

        let key = generate_key();
        request.set_header("Sec-WebSocket-Key", key.clone());
        request.set_header("Upgrade", "websocket");
        request.set_header("Connection", "Upgrade");
        request.set_header("Sec-WebSocket-Version", "13");

        let wire = request.emit_request()?;
        self.stream
            .write_all(wire.as_bytes())
            .await
            .map_err(UpgradeError::Io)?;
        self.stream.flush().await.map_err(UpgradeError::Io)?;
        Ok(key)
    }

    /// Bind a codec to the stream once the handshake is done.
    pub async fn into_codec(
        self,
        role: CodecRole,
        subprotocol: Option<String>,
    ) -> Arc<dyn FrameCodec> {
        self.factory
            .create(Box::new(self.stream), role, subprotocol, self.config)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_pair, ScriptedFactory};

    #[test]
    fn accept_token_matches_the_rfc_example() {
        // RFC 6455 §1.3 worked example.
        assert_eq!(
            accept_token("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn generated_keys_are_unique_16_byte_nonces() {
        let k1 = generate_key();
        let k2 = generate_key();
        assert_ne!(k1, k2);
        assert_eq!(BASE64.decode(&k1).unwrap().len(), 16);
        assert_eq!(BASE64.decode(&k2).unwrap().len(), 16);
    }

    #[test]
    fn path_validation_covers_the_resource_name_grammar() {
        assert_eq!(validate_request_path("/").unwrap(), "/");
        assert_eq!(validate_request_path("live/feed").unwrap(), "/live/feed");
        assert_eq!(validate_request_path("/a-b.c_d~e").unwrap(), "/a-b.c_d~e");
        assert!(validate_request_path("/spaced path").is_err());
        assert!(validate_request_path("/query?x=1").is_err());
    }

    #[test]
    fn subprotocol_rule_covers_all_four_cases() {
        let none: Vec<String> = Vec::new();
        let offered = vec!["chat".to_string(), "Json".to_string()];

        assert_eq!(negotiate_subprotocol(&none, None).unwrap(), (None, None));
        assert!(negotiate_subprotocol(&none, Some("chat")).is_err());
        assert_eq!(
            negotiate_subprotocol(&offered, None).unwrap(),
            (Some("chat, Json".to_string()), None)
        );
        assert_eq!(
            negotiate_subprotocol(&offered, Some("json")).unwrap(),
            (Some("json".to_string()), Some("json".to_string()))
        );
        assert!(negotiate_subprotocol(&offered, Some("graphql")).is_err());
    }

    #[test]
    fn response_validation_checks_line_headers_and_token() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let good = WebContext::from_text(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n",
        );
        assert!(validate_upgrade_response(&good, key).is_ok());

        let wrong_status = WebContext::from_text("HTTP/1.1 409 Conflict\r\n\r\n");
        assert!(validate_upgrade_response(&wrong_status, key).is_err());

        let bad_token = WebContext::from_text(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: bogus\r\n\r\n",
        );
        assert!(matches!(
            validate_upgrade_response(&bad_token, key),
            Err(crate::WebSocketError::Upgrade(
                UpgradeError::AcceptMismatch
            ))
        ));
    }

    #[tokio::test]
    async fn await_context_reads_a_request_off_the_stream() {
        let (server_side, mut client_side) = memory_pair();
        client_side
            .write_all(
                b"GET /live HTTP/1.1\r\n\
                  Host: 127.0.0.1:8010\r\n\
                  Connection: Upgrade\r\n\
                  Upgrade: websocket\r\n\
                  Sec-WebSocket-Version: 13\r\n\r\n",
            )
            .await
            .unwrap();

        let mut handler = UpgradeHandler::new(
            server_side,
            Arc::new(ScriptedFactory::empty()),
            CodecConfig::default(),
        );
        let ctx = handler.await_context().await.unwrap();
        assert!(ctx.is_websocket_request());
        assert_eq!(ctx.request_path().unwrap(), "/live");
        assert_eq!(ctx.port().unwrap(), 8010);
    }

    #[tokio::test]
    async fn await_context_fails_on_an_already_closed_stream() {
        let (server_side, client_side) = memory_pair();
        drop(client_side);

        let mut handler = UpgradeHandler::new(
            server_side,
            Arc::new(ScriptedFactory::empty()),
            CodecConfig::default(),
        );
        assert!(matches!(
            handler.await_context().await,
            Err(crate::WebSocketError::Upgrade(UpgradeError::StreamClosed))
        ));
    }

    #[tokio::test]
    async fn accept_emits_a_conforming_101() {
        let (server_side, mut client_side) = memory_pair();
        client_side
            .write_all(
                b"GET / HTTP/1.1\r\n\
                  Host: 127.0.0.1:8010\r\n\
                  Connection: Upgrade\r\n\
                  Upgrade: websocket\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\r\n",
            )
            .await
            .unwrap();

        let mut handler = UpgradeHandler::new(
            server_side,
            Arc::new(ScriptedFactory::empty()),
            CodecConfig::default(),
        );
        let request = handler.await_context().await.unwrap();
        let template = WebContext::response();
        handler
            .accept(&request, &template, "client-1", true, None)
            .await
            .unwrap();

        let mut buf = vec![0u8; 4096];
        let n = client_side.read(&mut buf).await.unwrap();
        let response = WebContext::from_text(&String::from_utf8_lossy(&buf[..n]));
        assert!(response
            .start_line()
            .unwrap()
            .contains("101 Switching Protocols"));
        assert_eq!(
            response.first_value("Sec-WebSocket-Accept"),
            Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
        );
        assert_eq!(response.first_value(USER_ID_HEADER), Some("client-1"));
    }

    #[tokio::test]
    async fn accept_refuses_wrong_version() {
        let (server_side, mut client_side) = memory_pair();
        client_side
            .write_all(
                b"GET / HTTP/1.1\r\n\
                  Host: h\r\n\
                  Connection: Upgrade\r\n\
                  Upgrade: websocket\r\n\
                  Sec-WebSocket-Version: 12\r\n\r\n",
            )
            .await
            .unwrap();

        let mut handler = UpgradeHandler::new(
            server_side,
            Arc::new(ScriptedFactory::empty()),
            CodecConfig::default(),
        );
        let request = handler.await_context().await.unwrap();
        let template = WebContext::response();
        let result = handler.accept(&request, &template, "id", false, None).await;
        let err = match result {
            Ok(_) => panic!("expected accept to fail"),
            Err(err) => err,
        };
        assert!(matches!(
            err,
            crate::WebSocketError::Upgrade(UpgradeError::UnsupportedVersion { .. })
        ));
    }

    #[tokio::test]
    async fn reject_writes_the_response_with_body() {
        let (server_side, mut client_side) = memory_pair();

        let handler = UpgradeHandler::new(
            server_side,
            Arc::new(ScriptedFactory::empty()),
            CodecConfig::default(),
        );
        let mut response = WebContext::response_with(StatusCode::Conflict);
        response.set_content("User id already in use").unwrap();
        handler.reject(&mut response).await.unwrap();

        let mut buf = vec![0u8; 4096];
        let n = client_side.read(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf[..n]).into_owned();
        assert!(text.starts_with("HTTP/1.1 409 Conflict\r\n"));
        assert!(text.contains("Content-Length: 22\r\n"));
        assert!(text.ends_with("User id already in use"));
    }

    #[tokio::test]
    async fn client_request_and_server_parse_round_trip() {
        let (server_side, client_side) = memory_pair();

        let mut client_handler = UpgradeHandler::new(
            client_side,
            Arc::new(ScriptedFactory::empty()),
            CodecConfig::default(),
        );
        let mut request = WebContext::request("127.0.0.1", 8010, "/live");
        request.set_header(USER_ID_HEADER, "11111111-2222-4333-8444-555555555555");
        let key = client_handler
            .send_upgrade_request(&mut request)
            .await
            .unwrap();

        let mut server_handler = UpgradeHandler::new(
            server_side,
            Arc::new(ScriptedFactory::empty()),
            CodecConfig::default(),
        );
        let seen = server_handler.await_context().await.unwrap();
        assert!(seen.is_websocket_request());
        assert_eq!(seen.host().unwrap(), "127.0.0.1");
        assert_eq!(seen.port().unwrap(), 8010);
        assert_eq!(seen.request_path().unwrap(), "/live");
        assert_eq!(
            seen.user_id(),
            Some("11111111-2222-4333-8444-555555555555")
        );
        assert_eq!(seen.first_value("Sec-WebSocket-Key"), Some(key.as_str()));
    }
}
