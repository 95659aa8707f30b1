//! Active and passive session bookkeeping plus the identification critical
//! section that joins them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::core::context::{StatusCode, WebContext};
use crate::core::expiring::{ExpiringMap, ExpiryCallback};
use crate::core::session::Session;
use crate::core::types::{ServerOptions, WebSocketResult};

/// Where disconnected clients go, per the retention options.
pub(crate) enum PassiveStore {
    Disabled,
    Plain(Mutex<HashMap<String, Arc<Session>>>),
    Expiring(ExpiringMap<String, Arc<Session>>),
}

/// What identification decided for a connection carrying a user id.
pub(crate) enum IdentityOutcome {
    /// The requested id was free; the session now carries it.
    Assigned,
    /// A passive session owned the id; it replaces the fresh one.
    Reclaimed(Arc<Session>),
    /// The id is live on another connection; carries the prebuilt 409.
    Conflict(WebContext),
}

pub(crate) struct Registry {
    active: DashMap<String, Arc<Session>>,
    passive: PassiveStore,
    // Serializes every read-modify-write spanning both stores.
    identify_lock: tokio::sync::Mutex<()>,
}

fn conflict_response() -> WebContext {
    let mut response = WebContext::response_with(StatusCode::Conflict);
    response
        .set_content("User id already in use")
        .expect("fresh context has no content");
    response
}

impl Registry {
    pub fn new(
        options: &ServerOptions,
        on_passive_expired: ExpiryCallback<String, Arc<Session>>,
    ) -> Self {
        let passive = if !options.remember_disconnected_clients {
            PassiveStore::Disabled
        } else if options.remove_passive_clients_after_expiration {
            PassiveStore::Expiring(ExpiringMap::new(
                options.passive_client_lifetime,
                on_passive_expired,
            ))
        } else {
            PassiveStore::Plain(Mutex::new(HashMap::new()))
        };
        Self {
            active: DashMap::new(),
            passive,
            identify_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn active_get(&self, client_id: &str) -> Option<Arc<Session>> {
        self.active.get(client_id).map(|entry| entry.value().clone())
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.active.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn active_snapshot(&self) -> Vec<Arc<Session>> {
        self.active.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn passive_contains(&self, client_id: &str) -> bool {
        match &self.passive {
            PassiveStore::Disabled => false,
            PassiveStore::Plain(map) => map.lock().unwrap().contains_key(client_id),
            PassiveStore::Expiring(map) => map.contains_key(&client_id.to_string()),
        }
    }

    pub fn passive_len(&self) -> usize {
        match &self.passive {
            PassiveStore::Disabled => 0,
            PassiveStore::Plain(map) => map.lock().unwrap().len(),
            PassiveStore::Expiring(map) => map.len(),
        }
    }

    fn passive_remove(&self, client_id: &str) -> Option<Arc<Session>> {
        match &self.passive {
            PassiveStore::Disabled => None,
            PassiveStore::Plain(map) => map.lock().unwrap().remove(client_id),
            PassiveStore::Expiring(map) => map.remove(&client_id.to_string()),
        }
    }

    /// Resolve a client-supplied user id against both stores under the monitor:
    /// live id → conflict, parked id → reclaim, unknown id → adopt.
    pub async fn identify(
        &self,
        session: &Arc<Session>,
        user_id: &str,
        peer: Option<SocketAddr>,
    ) -> WebSocketResult<IdentityOutcome> {
        let _guard = self.identify_lock.lock().await;
        if self.active.contains_key(user_id) {
            return Ok(IdentityOutcome::Conflict(conflict_response()));
        }
        if let Some(parked) = self.passive_remove(user_id) {
            parked.update_stream(peer);
            return Ok(IdentityOutcome::Reclaimed(parked));
        }
        session.update_id(user_id)?;
        Ok(IdentityOutcome::Assigned)
    }

    /// Claim the session's id in the active store. Losing a duplicate-id race
    /// returns the prebuilt 409 so the caller can reject before sending its 101.
    pub fn try_activate(&self, session: &Arc<Session>) -> Result<(), WebContext> {
        match self.active.entry(session.id()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(conflict_response()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(session.clone());
                Ok(())
            }
        }
    }

    pub fn remove_active(&self, client_id: &str) -> Option<Arc<Session>> {
        self.active.remove(client_id).map(|(_, session)| session)
    }

    /// Drop a session that never became a connected client: no parking.
    pub fn deactivate(&self, session: &Arc<Session>) {
        self.active.remove(&session.id());
        session.dispose();
    }

    /// Disconnect bookkeeping: drop the live entry, release the session's stream
    /// and codec, and park it when retention is on.
    pub async fn retire(&self, session: &Arc<Session>) {
        let _guard = self.identify_lock.lock().await;
        let id = session.id();
        self.active.remove(&id);
        session.dispose();
        match &self.passive {
            PassiveStore::Disabled => {}
            PassiveStore::Plain(map) => {
                map.lock().unwrap().insert(id, session.clone());
            }
            PassiveStore::Expiring(map) => {
                map.insert(id, session.clone());
            }
        }
    }
}
