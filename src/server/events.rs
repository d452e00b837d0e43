use std::sync::{Arc, RwLock};

use crate::server::session::Session;

/// Cross-cutting observer for framework-level session events.
///
/// These are the application-visible counterparts of the per-session
/// listener notifications: bind-session, unbind-session, close-session.
pub trait SessionObserver: Send + Sync {
    fn bind_session(&self, _session: &Session) {}
    fn unbind_session(&self, _session: &Session) {}
    fn close_session(&self, _session: &Session) {}
}

/// Process-wide registry of [`SessionObserver`]s, notified synchronously in
/// registration order.
#[derive(Default)]
pub struct EventBus {
    observers: RwLock<Vec<Arc<dyn SessionObserver>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn SessionObserver>) {
        self.observers.write().unwrap().push(observer);
    }

    // Observers are cloned out and the lock released before invocation so
    // a callback may subscribe without deadlocking on the list lock.
    fn snapshot(&self) -> Vec<Arc<dyn SessionObserver>> {
        self.observers.read().unwrap().clone()
    }

    pub fn emit_bind(&self, session: &Session) {
        for observer in self.snapshot() {
            observer.bind_session(session);
        }
    }

    pub fn emit_unbind(&self, session: &Session) {
        for observer in self.snapshot() {
            observer.unbind_session(session);
        }
    }

    pub fn emit_close(&self, session: &Session) {
        for observer in self.snapshot() {
            observer.close_session(session);
        }
    }
}
