use futures_util::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::server::message::{Message, RouteRecord};
use crate::server::session::{FrontendSession, Session, SessionId, SessionManager};
use crate::utils::error::ServerError;

/// Executes application logic for a locally handled request. Opaque to the
/// routing core.
pub trait HandlerService: Send + Sync {
    fn handle(
        &self,
        route: &RouteRecord,
        body: &Value,
        session: &Arc<Session>,
    ) -> BoxFuture<'static, Result<Value, ServerError>>;
}

/// Cross-node call used when a route targets another server type. Wire
/// format and connection pooling are the transport's business.
pub trait RpcTransport: Send + Sync {
    fn forward(
        &self,
        target_server_type: &str,
        session: FrontendSession,
        msg: Message,
    ) -> BoxFuture<'static, Result<Value, ServerError>>;
}

/// Delivery intent attached to a scheduled send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushKind {
    /// Reply to a client request.
    Response,
    /// Server-initiated push with no corresponding request id.
    Push,
}

/// Queues an encoded frame for transmission; batching and write policy are
/// the scheduler's business.
pub trait PushScheduler: Send + Sync {
    fn schedule(
        &self,
        request_id: Option<u64>,
        route: &str,
        payload: Vec<u8>,
        recipients: &[SessionId],
        kind: PushKind,
    ) -> BoxFuture<'static, Result<(), ServerError>>;
}

/// Login bookkeeping entry kept per bound uid.
#[derive(Debug, Clone)]
pub struct LoginInfo {
    pub login_time_ms: u64,
    pub uid: String,
    pub address: String,
}

#[derive(Debug, Clone, Copy)]
pub struct StatisticsInfo {
    pub total_conn_count: u64,
}

/// Connection-count and logged-in-user bookkeeping, read by admission
/// control.
pub trait ConnectionStats: Send + Sync {
    fn increase_connection_count(&self);
    fn decrease_connection_count(&self, uid: Option<&str>);
    fn statistics_info(&self) -> StatisticsInfo;
    fn add_logined_user(&self, uid: &str, info: LoginInfo);
    fn remove_logined_user(&self, uid: &str);
}

/// Drains in-flight work keyed by session id when the session closes.
pub trait TaskQueue: Send + Sync {
    fn close_queue(&self, session_id: SessionId, force: bool);
}

/// Asynchronous blacklist lookup, invoked per accepted connection when host
/// filtering is enabled. Yields IP regex patterns.
pub type BlacklistSource =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<String>, ServerError>> + Send + Sync>;

/// Push scheduler that writes each frame straight to the recipient sessions'
/// sockets, without batching.
pub struct DirectPushScheduler {
    sessions: Arc<SessionManager>,
}

impl DirectPushScheduler {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        DirectPushScheduler { sessions }
    }
}

impl PushScheduler for DirectPushScheduler {
    fn schedule(
        &self,
        request_id: Option<u64>,
        route: &str,
        payload: Vec<u8>,
        recipients: &[SessionId],
        kind: PushKind,
    ) -> BoxFuture<'static, Result<(), ServerError>> {
        debug!(?request_id, route, ?kind, count = recipients.len(), "scheduling send");
        let sessions = self.sessions.clone();
        let recipients = recipients.to_vec();
        Box::pin(async move {
            let mut last_err = None;
            for id in recipients {
                match sessions.get(id) {
                    Some(session) => {
                        if let Err(e) = session.send(payload.clone()) {
                            last_err = Some(e);
                        }
                    }
                    None => last_err = Some(ServerError::SessionClosed),
                }
            }
            match last_err {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }
}
