use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::server::transport::Socket;
use crate::utils::error::ServerError;

/// Connection-scoped session identifier, shared with the owning socket.
pub type SessionId = Uuid;

/// Observer for session lifecycle transitions.
///
/// Listeners run synchronously after the state mutation and before the
/// triggering call returns, in registration order.
pub trait SessionListener: Send + Sync {
    fn session_bound(&self, _session: &Session, _uid: &str) {}
    fn session_unbound(&self, _session: &Session, _uid: &str) {}
    fn session_closed(&self, _session: &Session, _reason: &str) {}
}

/// Per-connection logical identity with key/value storage.
///
/// Lifecycle: open at connection accept, optionally bound to a uid, closed
/// exactly once on disconnect/error/kick. The transport handle is stored
/// opaquely and only used to disconnect.
pub struct Session {
    pub id: SessionId,
    /// Id of the frontend server that owns the connection.
    pub frontend_id: String,
    uid: Mutex<Option<String>>,
    settings: DashMap<String, Value>,
    socket: Arc<dyn Socket>,
    closed: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn SessionListener>>>,
}

impl Session {
    pub fn new(id: SessionId, frontend_id: impl Into<String>, socket: Arc<dyn Socket>) -> Self {
        Session {
            id,
            frontend_id: frontend_id.into(),
            uid: Mutex::new(None),
            settings: DashMap::new(),
            socket,
            closed: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn uid(&self) -> Option<String> {
        self.uid.lock().unwrap().clone()
    }

    /// Binds the session to an application identity.
    ///
    /// A session holds at most one uid at a time; rebinding requires an
    /// explicit `unbind` first.
    pub fn bind(&self, uid: impl Into<String>) -> Result<(), ServerError> {
        let uid = uid.into();
        {
            let mut cur = self.uid.lock().unwrap();
            if let Some(existing) = cur.as_ref() {
                return Err(ServerError::AlreadyBound(existing.clone()));
            }
            *cur = Some(uid.clone());
        }
        for listener in self.listeners_snapshot() {
            listener.session_bound(self, &uid);
        }
        Ok(())
    }

    /// Clears the uid. A no-op when the session is not bound to `uid`.
    pub fn unbind(&self, uid: &str) {
        {
            let mut cur = self.uid.lock().unwrap();
            match cur.as_deref() {
                Some(bound) if bound == uid => *cur = None,
                _ => return,
            }
        }
        for listener in self.listeners_snapshot() {
            listener.session_unbound(self, uid);
        }
    }

    /// Session-scoped storage, mutable by handlers and by the core.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.settings.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.settings.get(key).map(|v| v.clone())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.settings.remove(key).map(|(_, v)| v)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Transitions to the terminal state.
    ///
    /// Idempotent: concurrent disconnect/error signals collapse to a single
    /// transition and the `closed` notification fires exactly once.
    pub fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(session = %self.id, reason, "session closed");
        for listener in self.listeners_snapshot() {
            listener.session_closed(self, reason);
        }
    }

    // Listeners are invoked with the lock released so a callback may
    // register further listeners.
    fn listeners_snapshot(&self) -> Vec<Arc<dyn SessionListener>> {
        self.listeners.lock().unwrap().clone()
    }

    /// Forcibly disconnects the underlying transport and closes the session.
    pub fn kick(&self, reason: &str) {
        self.close(reason);
        self.socket.disconnect();
    }

    /// Writes raw bytes to the owning socket. Closed sessions accept no
    /// further sends.
    pub fn send(&self, data: Vec<u8>) -> Result<(), ServerError> {
        if self.is_closed() {
            return Err(ServerError::SessionClosed);
        }
        self.socket.send(data)
    }

    /// Read-mostly projection safe to hand to remote calls; never leaks the
    /// live transport handle.
    pub fn export(&self) -> FrontendSession {
        FrontendSession {
            id: self.id,
            frontend_id: self.frontend_id.clone(),
            uid: self.uid(),
            settings: self
                .settings
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("frontend_id", &self.frontend_id)
            .field("uid", &self.uid())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Snapshot of a session as seen by remote servers.
#[derive(Debug, Clone, Serialize)]
pub struct FrontendSession {
    pub id: SessionId,
    pub frontend_id: String,
    pub uid: Option<String>,
    pub settings: HashMap<String, Value>,
}

/// Owns every live session of this process, keyed by connection id.
#[derive(Default)]
pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a new open session for the connection.
    pub fn create(
        &self,
        id: SessionId,
        frontend_id: impl Into<String>,
        socket: Arc<dyn Socket>,
    ) -> Arc<Session> {
        let session = Arc::new(Session::new(id, frontend_id, socket));
        self.sessions.insert(id, session.clone());
        session
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    /// Existing session for the connection id, or a fresh one.
    pub fn get_or_create(
        &self,
        id: SessionId,
        frontend_id: impl Into<String>,
        socket: Arc<dyn Socket>,
    ) -> Arc<Session> {
        self.sessions
            .entry(id)
            .or_insert_with(|| Arc::new(Session::new(id, frontend_id, socket)))
            .clone()
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.remove(&id).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Kicks the connection behind `id`, if still present.
    pub fn kick_by_session_id(&self, id: SessionId, reason: &str) {
        match self.remove(id) {
            Some(session) => session.kick(reason),
            None => warn!(session = %id, "kick requested for unknown session"),
        }
    }

    /// Closes every live session, e.g. during process shutdown.
    pub fn close_all(&self, reason: &str) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                session.kick(reason);
            }
        }
    }
}
