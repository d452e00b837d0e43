use futures_util::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;

use crate::server::message::{Message, RouteRecord};
use crate::server::session::Session;
use crate::utils::error::ServerError;

/// Future returned by a filter invocation.
pub type FilterFuture = BoxFuture<'static, Result<(), ServerError>>;

/// Filter invoked before the dispatch branch decision (global scope) or
/// before the local handler (local scope).
///
/// Returning an error stops the chain immediately; neither later filters nor
/// the handler run.
pub trait BeforeFilter: Send + Sync {
    fn filter(&self, route: &RouteRecord, msg: &Message, session: &Arc<Session>) -> FilterFuture;
}

/// Filter invoked after the handler or forward finished, success or failure.
///
/// Receives the original error so it can implement cleanup or response
/// post-processing; the response is observed, not mutated.
pub trait AfterFilter: Send + Sync {
    fn filter(
        &self,
        err: Option<&ServerError>,
        route: &RouteRecord,
        msg: &Message,
        session: &Arc<Session>,
        resp: &Value,
    ) -> FilterFuture;
}

impl<F> BeforeFilter for F
where
    F: Fn(&RouteRecord, &Message, &Arc<Session>) -> FilterFuture + Send + Sync,
{
    fn filter(&self, route: &RouteRecord, msg: &Message, session: &Arc<Session>) -> FilterFuture {
        self(route, msg, session)
    }
}

/// Ordered before/after filter chain executor.
///
/// Insertion order is invocation order; there is no dedup and no priority.
/// Two independently configured instances exist per router: global (every
/// inbound message, forwarded ones included) and local (locally handled
/// messages only).
#[derive(Clone, Default)]
pub struct FilterService {
    befores: Vec<Arc<dyn BeforeFilter>>,
    afters: Vec<Arc<dyn AfterFilter>>,
}

impl FilterService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before(&mut self, filter: Arc<dyn BeforeFilter>) {
        self.befores.push(filter);
    }

    pub fn after(&mut self, filter: Arc<dyn AfterFilter>) {
        self.afters.push(filter);
    }

    /// Runs the before chain in order, stopping at the first error, which is
    /// surfaced to the caller instead of the next filter or the handler.
    pub async fn run_before(
        &self,
        route: &RouteRecord,
        msg: &Message,
        session: &Arc<Session>,
    ) -> Result<(), ServerError> {
        for filter in &self.befores {
            filter.filter(route, msg, session).await?;
        }
        Ok(())
    }

    /// Runs every after-filter in order, regardless of `err`.
    ///
    /// The first filter failure is reported back; the caller decides whether
    /// it replaces the outgoing error (local scope) or is logged and
    /// discarded (global scope).
    pub async fn run_after(
        &self,
        err: Option<&ServerError>,
        route: &RouteRecord,
        msg: &Message,
        session: &Arc<Session>,
        resp: &Value,
    ) -> Result<(), ServerError> {
        let mut failed: Option<ServerError> = None;
        for filter in &self.afters {
            if let Err(e) = filter.filter(err, route, msg, session, resp).await {
                failed.get_or_insert(e);
            }
        }
        match failed {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::session::SessionId;
    use crate::server::transport::Socket;
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use uuid::Uuid;

    struct NullSocket;

    impl Socket for NullSocket {
        fn id(&self) -> SessionId {
            Uuid::nil()
        }
        fn remote_addr(&self) -> SocketAddr {
            "127.0.0.1:9999".parse().unwrap()
        }
        fn send(&self, _data: Vec<u8>) -> Result<(), ServerError> {
            Ok(())
        }
        fn disconnect(&self) {}
    }

    fn session() -> Arc<Session> {
        Arc::new(Session::new(Uuid::new_v4(), "connector-1", Arc::new(NullSocket)))
    }

    fn fixtures() -> (RouteRecord, Message, Arc<Session>) {
        let msg = Message::request(1, "chat.room.say", json!({}));
        (RouteRecord::parse(&msg.route).unwrap(), msg, session())
    }

    struct TraceBefore {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    impl BeforeFilter for TraceBefore {
        fn filter(&self, _r: &RouteRecord, _m: &Message, _s: &Arc<Session>) -> FilterFuture {
            self.log.lock().unwrap().push(self.name);
            let fail = self.fail;
            let name = self.name;
            Box::pin(async move {
                if fail {
                    Err(ServerError::Filter(name.into()))
                } else {
                    Ok(())
                }
            })
        }
    }

    struct TraceAfter {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    impl AfterFilter for TraceAfter {
        fn filter(
            &self,
            _err: Option<&ServerError>,
            _r: &RouteRecord,
            _m: &Message,
            _s: &Arc<Session>,
            _resp: &Value,
        ) -> FilterFuture {
            self.log.lock().unwrap().push(self.name);
            let fail = self.fail;
            let name = self.name;
            Box::pin(async move {
                if fail {
                    Err(ServerError::Filter(name.into()))
                } else {
                    Ok(())
                }
            })
        }
    }

    #[tokio::test]
    async fn before_chain_short_circuits_on_first_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut filters = FilterService::new();
        filters.before(Arc::new(TraceBefore { name: "a", log: log.clone(), fail: false }));
        filters.before(Arc::new(TraceBefore { name: "b", log: log.clone(), fail: true }));
        filters.before(Arc::new(TraceBefore { name: "c", log: log.clone(), fail: false }));

        let (route, msg, session) = fixtures();
        let err = filters.run_before(&route, &msg, &session).await.unwrap_err();
        assert!(matches!(err, ServerError::Filter(name) if name == "b"));
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn after_chain_runs_to_completion_despite_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut filters = FilterService::new();
        filters.after(Arc::new(TraceAfter { name: "x", log: log.clone(), fail: true }));
        filters.after(Arc::new(TraceAfter { name: "y", log: log.clone(), fail: false }));

        let (route, msg, session) = fixtures();
        let handler_err = ServerError::Handler("boom".into());
        let result = filters
            .run_after(Some(&handler_err), &route, &msg, &session, &Value::Null)
            .await;
        assert!(matches!(result, Err(ServerError::Filter(name)) if name == "x"));
        assert_eq!(*log.lock().unwrap(), vec!["x", "y"]);
    }
}
