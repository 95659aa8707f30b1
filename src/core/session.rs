use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::types::{ServerError, WebSocketResult};
use crate::transport::FrameCodec;

/// Server-side state for one client, live or remembered.
///
/// A session outlives the TCP connection that created it when the server keeps
/// passive clients: on re-identification the same session is wired to a fresh stream
/// and codec while its id, first-seen stamp and properties carry over.
pub struct Session {
    id: RwLock<String>,
    first_seen: DateTime<Utc>,
    last_seen: RwLock<DateTime<Utc>>,
    remote_endpoint: RwLock<Option<SocketAddr>>,
    codec: Mutex<Option<Arc<dyn FrameCodec>>>,
    properties: Mutex<HashMap<String, String>>,
}

impl Session {
    /// New session for a just-accepted stream; gives itself a fresh UUID.
    pub fn new(remote_endpoint: Option<SocketAddr>) -> Self {
        let now = Utc::now();
        Self {
            id: RwLock::new(Uuid::new_v4().to_string()),
            first_seen: now,
            last_seen: RwLock::new(now),
            remote_endpoint: RwLock::new(remote_endpoint),
            codec: Mutex::new(None),
            properties: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> String {
        self.id.read().unwrap().clone()
    }

    /// Replace the generated id with a client-supplied one. Only valid UUIDs are
    /// accepted; used once, before the session enters the active registry.
    pub fn update_id(&self, new_id: &str) -> WebSocketResult<()> {
        if new_id.is_empty() || Uuid::parse_str(new_id).is_err() {
            return Err(ServerError::InvalidClientId {
                id: new_id.to_string(),
            }
            .into());
        }
        *self.id.write().unwrap() = new_id.to_string();
        Ok(())
    }

    pub fn first_seen(&self) -> DateTime<Utc> {
        self.first_seen
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        *self.last_seen.read().unwrap()
    }

    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        *self.remote_endpoint.read().unwrap()
    }

    /// Rebind the session to a newly accepted stream: refreshes the last-seen stamp
    /// and frees the codec slot for the connection about to be upgraded.
    pub fn update_stream(&self, remote_endpoint: Option<SocketAddr>) {
        *self.remote_endpoint.write().unwrap() = remote_endpoint;
        *self.last_seen.write().unwrap() = Utc::now();
        self.codec.lock().unwrap().take();
    }

    /// Attach the frame codec for the current stream. At most once per stream.
    pub fn use_codec(&self, codec: Arc<dyn FrameCodec>) -> WebSocketResult<()> {
        let mut slot = self.codec.lock().unwrap();
        if slot.is_some() {
            return Err(ServerError::CodecAlreadyAttached.into());
        }
        *slot = Some(codec);
        Ok(())
    }

    pub fn codec(&self) -> Option<Arc<dyn FrameCodec>> {
        self.codec.lock().unwrap().clone()
    }

    pub fn set_property(&self, name: impl Into<String>, value: impl Into<String>) {
        self.properties
            .lock()
            .unwrap()
            .insert(name.into(), value.into());
    }

    pub fn property(&self, name: &str) -> Option<String> {
        self.properties.lock().unwrap().get(name).cloned()
    }

    pub fn properties(&self) -> HashMap<String, String> {
        self.properties.lock().unwrap().clone()
    }

    /// Release the stream and codec handles. Idempotent; dropping the last codec
    /// reference closes the underlying socket.
    pub fn dispose(&self) {
        self.codec.lock().unwrap().take();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("remote_endpoint", &self.remote_endpoint())
            .field("first_seen", &self.first_seen)
            .finish()
    }
}
