use futures_util::future::BoxFuture;
use serde_json::Value;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, instrument, warn};

use crate::server::filter::{AfterFilter, BeforeFilter, FilterService};
use crate::server::message::{Message, RouteRecord, RESERVED_METHOD};
use crate::server::registry::ClusterView;
use crate::server::service::{HandlerService, RpcTransport};
use crate::server::session::{Session, SessionManager};
use crate::utils::error::ServerError;

const ST_INITED: u8 = 0;
const ST_STARTED: u8 = 1;
const ST_STOPPED: u8 = 2;

/// What the dispatcher hands back to the connector for one inbound frame.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    pub err: Option<ServerError>,
    pub resp: Option<Value>,
}

/// Result of dispatching a frame. `Kicked` means the session was forcibly
/// disconnected and no response path exists.
#[derive(Debug)]
pub enum Dispatch {
    Reply(DispatchOutcome),
    Kicked,
}

/// Pluggable hook for errors surfaced on the global (filter/forward) or
/// local (filter/handler) path. May rewrite the error and the response.
pub trait ErrorHandler: Send + Sync {
    fn handle(
        &self,
        err: ServerError,
        msg: &Message,
        session: &Arc<Session>,
        resp: Option<Value>,
    ) -> BoxFuture<'static, (Option<ServerError>, Option<Value>)>;
}

/// Routing/dispatch state machine.
///
/// Takes a decoded frame and decides, per request, whether to run local
/// filters and invoke the handler service, or forward the call via RPC to a
/// peer of the route's server type. Global filters run for every message;
/// local filters only on the local-handling branch.
pub struct Router {
    state: AtomicU8,
    cluster: Arc<ClusterView>,
    sessions: Arc<SessionManager>,
    handlers: Arc<dyn HandlerService>,
    rpc: Arc<dyn RpcTransport>,
    global_filters: RwLock<FilterService>,
    local_filters: RwLock<FilterService>,
    global_error_handler: RwLock<Option<Arc<dyn ErrorHandler>>>,
    local_error_handler: RwLock<Option<Arc<dyn ErrorHandler>>>,
}

impl Router {
    pub fn new(
        cluster: Arc<ClusterView>,
        sessions: Arc<SessionManager>,
        handlers: Arc<dyn HandlerService>,
        rpc: Arc<dyn RpcTransport>,
    ) -> Self {
        Router {
            state: AtomicU8::new(ST_INITED),
            cluster,
            sessions,
            handlers,
            rpc,
            global_filters: RwLock::new(FilterService::new()),
            local_filters: RwLock::new(FilterService::new()),
            global_error_handler: RwLock::new(None),
            local_error_handler: RwLock::new(None),
        }
    }

    pub fn start(&self) {
        let _ = self
            .state
            .compare_exchange(ST_INITED, ST_STARTED, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.state.store(ST_STOPPED, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.state.load(Ordering::SeqCst) == ST_STARTED
    }

    /// Appends a before-filter that runs for every inbound message,
    /// including ones forwarded to other nodes.
    pub fn before_global(&self, filter: Arc<dyn BeforeFilter>) {
        self.global_filters.write().unwrap().before(filter);
    }

    /// Appends an after-filter on the global chain; it observes the finished
    /// exchange but cannot block the reply, and its own errors are logged
    /// and discarded.
    pub fn after_global(&self, filter: Arc<dyn AfterFilter>) {
        self.global_filters.write().unwrap().after(filter);
    }

    /// Appends a before-filter that runs only for locally handled messages.
    pub fn before_local(&self, filter: Arc<dyn BeforeFilter>) {
        self.local_filters.write().unwrap().before(filter);
    }

    /// Appends an after-filter on the local chain; its errors propagate into
    /// the final error.
    pub fn after_local(&self, filter: Arc<dyn AfterFilter>) {
        self.local_filters.write().unwrap().after(filter);
    }

    pub fn set_global_error_handler(&self, handler: Arc<dyn ErrorHandler>) {
        *self.global_error_handler.write().unwrap() = Some(handler);
    }

    pub fn set_local_error_handler(&self, handler: Arc<dyn ErrorHandler>) {
        *self.local_error_handler.write().unwrap() = Some(handler);
    }

    /// Dispatches one inbound frame.
    ///
    /// State machine: parse → attack guard → global before-filters →
    /// forward-or-local branch → response assembly; global after-filters run
    /// after the outcome has been handed back.
    #[instrument(skip(self, msg, session), fields(route = %msg.route, session = %session.id))]
    pub async fn dispatch(&self, msg: &Message, session: &Arc<Session>) -> Dispatch {
        if !self.is_started() {
            return Dispatch::Reply(DispatchOutcome {
                err: Some(ServerError::NotStarted),
                resp: None,
            });
        }

        let Some(route) = RouteRecord::parse(&msg.route) else {
            return Dispatch::Reply(DispatchOutcome {
                err: Some(ServerError::InvalidRoute(msg.route.clone())),
                resp: None,
            });
        };

        if route.method == RESERVED_METHOD {
            warn!(session = ?session.export(), ?msg, "attack session");
            self.sessions.kick_by_session_id(session.id, "attack");
            return Dispatch::Kicked;
        }

        let globals = self.global_filters.read().unwrap().clone();
        let locals = self.local_filters.read().unwrap().clone();

        let outcome = match globals.run_before(&route, msg, session).await {
            Err(e) => {
                let (err, resp) = self.handle_error(true, e, msg, session, None).await;
                DispatchOutcome { err, resp }
            }
            Ok(()) => {
                if self.cluster.server_type() != route.server_type {
                    self.do_forward(&route, msg, session).await
                } else {
                    self.do_handle(&locals, &route, msg, session).await
                }
            }
        };

        self.spawn_global_after(globals, route, msg.clone(), session.clone(), &outcome);
        Dispatch::Reply(outcome)
    }

    /// Local-path entry for frames that already landed on this node via RPC
    /// forward. Global filters ran on the relaying frontend; only the local
    /// chain applies here.
    pub async fn handle(&self, msg: &Message, session: &Arc<Session>) -> DispatchOutcome {
        if !self.is_started() {
            return DispatchOutcome {
                err: Some(ServerError::NotStarted),
                resp: None,
            };
        }
        let Some(route) = RouteRecord::parse(&msg.route) else {
            return DispatchOutcome {
                err: Some(ServerError::InvalidRoute(msg.route.clone())),
                resp: None,
            };
        };
        let locals = self.local_filters.read().unwrap().clone();
        self.do_handle(&locals, &route, msg, session).await
    }

    async fn do_forward(
        &self,
        route: &RouteRecord,
        msg: &Message,
        session: &Arc<Session>,
    ) -> DispatchOutcome {
        debug!(target = %route.server_type, "forwarding message");
        match self
            .rpc
            .forward(&route.server_type, session.export(), msg.clone())
            .await
        {
            Ok(resp) => DispatchOutcome {
                err: None,
                resp: Some(resp),
            },
            Err(e) => {
                error!(server = %self.cluster.server_id(), error = %e, "fail to process remote message");
                let (err, resp) = self.handle_error(true, e, msg, session, None).await;
                DispatchOutcome { err, resp }
            }
        }
    }

    async fn do_handle(
        &self,
        locals: &FilterService,
        route: &RouteRecord,
        msg: &Message,
        session: &Arc<Session>,
    ) -> DispatchOutcome {
        let (mut err, mut resp) = match locals.run_before(route, msg, session).await {
            Err(e) => self.handle_error(false, e, msg, session, None).await,
            Ok(()) => match self.handlers.handle(route, &msg.body, session).await {
                Ok(r) => (None, Some(r)),
                Err(e) => self.handle_error(false, e, msg, session, None).await,
            },
        };

        let snapshot = resp.clone().unwrap_or(Value::Null);
        if let Err(e) = locals
            .run_after(err.as_ref(), route, msg, session, &snapshot)
            .await
        {
            err = Some(e);
            resp = resp.or(Some(Value::Null));
        }

        DispatchOutcome { err, resp }
    }

    /// Runs the global after-filters once the outcome is on its way back.
    /// Their failures must never mask the real response.
    fn spawn_global_after(
        &self,
        globals: FilterService,
        route: RouteRecord,
        msg: Message,
        session: Arc<Session>,
        outcome: &DispatchOutcome,
    ) {
        let err = outcome.err.clone();
        let resp = outcome.resp.clone().unwrap_or(Value::Null);
        tokio::spawn(async move {
            if let Err(e) = globals
                .run_after(err.as_ref(), &route, &msg, &session, &resp)
                .await
            {
                warn!(route = %route.route, error = %e, "global after filter failed");
            }
        });
    }

    async fn handle_error(
        &self,
        global: bool,
        err: ServerError,
        msg: &Message,
        session: &Arc<Session>,
        resp: Option<Value>,
    ) -> (Option<ServerError>, Option<Value>) {
        let handler = if global {
            self.global_error_handler.read().unwrap().clone()
        } else {
            self.local_error_handler.read().unwrap().clone()
        };
        match handler {
            Some(handler) => handler.handle(err, msg, session, resp).await,
            None => {
                error!(
                    server = %self.cluster.server_id(),
                    msg = %serde_json::to_string(msg).unwrap_or_default(),
                    session = ?session.export(),
                    error = %err,
                    "no default error handler to resolve unknown exception"
                );
                (Some(err), resp)
            }
        }
    }
}
