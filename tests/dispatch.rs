//! End-to-end dispatch scenarios: decode, filter chains, the forward/local
//! branch decision, and response delivery, driven through the public API
//! with in-memory collaborators.

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use pylon::server::filter::FilterFuture;
use pylon::server::message::RouteRecord;
use pylon::server::service::DirectPushScheduler;
use pylon::server::{
    BeforeFilter, ClusterView, Connector, ConnectorOptions, Dispatch, EventBus, FrontendSession,
    HandlerService, Message, Router, RpcTransport, ServerInfo, Session, SessionId, SessionManager,
    Socket,
};
use pylon::utils::error::ServerError;

struct MemorySocket {
    id: SessionId,
    addr: SocketAddr,
    sent: Mutex<Vec<Vec<u8>>>,
    disconnects: AtomicUsize,
}

impl MemorySocket {
    fn new() -> Arc<Self> {
        Arc::new(MemorySocket {
            id: Uuid::new_v4(),
            addr: "127.0.0.1:7000".parse().unwrap(),
            sent: Mutex::new(Vec::new()),
            disconnects: AtomicUsize::new(0),
        })
    }

    fn sent_frames(&self) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|raw| serde_json::from_slice(raw).unwrap())
            .collect()
    }
}

impl Socket for MemorySocket {
    fn id(&self) -> SessionId {
        self.id
    }
    fn remote_addr(&self) -> SocketAddr {
        self.addr
    }
    fn send(&self, data: Vec<u8>) -> Result<(), ServerError> {
        self.sent.lock().unwrap().push(data);
        Ok(())
    }
    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockHandler {
    calls: AtomicUsize,
    fail: bool,
}

impl MockHandler {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(MockHandler {
            calls: AtomicUsize::new(0),
            fail,
        })
    }
}

impl HandlerService for MockHandler {
    fn handle(
        &self,
        route: &RouteRecord,
        body: &Value,
        _session: &Arc<Session>,
    ) -> BoxFuture<'static, Result<Value, ServerError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fail = self.fail;
        let method = route.method.clone();
        let body = body.clone();
        Box::pin(async move {
            if fail {
                Err(ServerError::Handler("handler blew up".into()))
            } else {
                Ok(json!({"method": method, "echo": body}))
            }
        })
    }
}

struct MockRpc {
    forwards: Mutex<Vec<(String, Option<String>, String)>>,
}

impl MockRpc {
    fn new() -> Arc<Self> {
        Arc::new(MockRpc {
            forwards: Mutex::new(Vec::new()),
        })
    }
}

impl RpcTransport for MockRpc {
    fn forward(
        &self,
        target_server_type: &str,
        session: FrontendSession,
        msg: Message,
    ) -> BoxFuture<'static, Result<Value, ServerError>> {
        self.forwards
            .lock()
            .unwrap()
            .push((target_server_type.to_string(), session.uid, msg.route));
        Box::pin(async move { Ok(json!({"remote": true})) })
    }
}

struct TraceFilter {
    name: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl BeforeFilter for TraceFilter {
    fn filter(&self, _r: &RouteRecord, _m: &Message, _s: &Arc<Session>) -> FilterFuture {
        self.log.lock().unwrap().push(self.name);
        Box::pin(async { Ok(()) })
    }
}

struct Fixture {
    connector: Arc<Connector>,
    sessions: Arc<SessionManager>,
    router: Arc<Router>,
    handler: Arc<MockHandler>,
    rpc: Arc<MockRpc>,
}

fn fixture(server_type: &str, handler_fails: bool, opts: ConnectorOptions) -> Fixture {
    let cluster = Arc::new(ClusterView::new(ServerInfo {
        id: format!("{server_type}-1"),
        server_type: server_type.into(),
        host: "127.0.0.1".into(),
        port: 3250,
        frontend: server_type == "connector",
        client_port: None,
        max_connections: None,
    }));
    let sessions = Arc::new(SessionManager::new());
    let handler = MockHandler::new(handler_fails);
    let rpc = MockRpc::new();
    let router = Arc::new(Router::new(
        cluster.clone(),
        sessions.clone(),
        handler.clone(),
        rpc.clone(),
    ));
    router.start();
    let push = Arc::new(DirectPushScheduler::new(sessions.clone()));
    let connector = Arc::new(Connector::new(
        cluster,
        sessions.clone(),
        router.clone(),
        push,
        Arc::new(EventBus::new()),
        opts,
    ));
    Fixture {
        connector,
        sessions,
        router,
        handler,
        rpc,
    }
}

async fn admitted(f: &Fixture) -> (Arc<MemorySocket>, Arc<Session>) {
    let socket = MemorySocket::new();
    let session = f.connector.accept(socket.clone()).await.unwrap();
    (socket, session)
}

#[tokio::test]
async fn invalid_route_yields_error_reply_without_touching_filters() {
    let f = fixture("connector", false, ConnectorOptions::default());
    let log = Arc::new(Mutex::new(Vec::new()));
    f.router.before_global(Arc::new(TraceFilter {
        name: "global",
        log: log.clone(),
    }));

    let (socket, session) = admitted(&f).await;
    let msg = Message::request(1, "chat.say", json!({}));
    f.connector
        .handle_data(&session, &serde_json::to_vec(&msg).unwrap())
        .await;

    let frames = socket.sent_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["body"]["code"], json!(500));
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(f.handler.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn reserved_method_kicks_without_invoking_the_handler() {
    let f = fixture("connector", false, ConnectorOptions::default());
    let (socket, session) = admitted(&f).await;

    let msg = Message::request(1, "connector.entry.constructor", json!({}));
    f.connector
        .handle_data(&session, &serde_json::to_vec(&msg).unwrap())
        .await;

    assert_eq!(socket.disconnects.load(Ordering::SeqCst), 1);
    assert!(socket.sent_frames().is_empty());
    assert_eq!(f.handler.calls.load(Ordering::SeqCst), 0);
    assert!(f.sessions.get(session.id).is_none());
}

#[tokio::test]
async fn cross_type_route_is_forwarded_and_skips_local_filters() {
    let f = fixture("connector", false, ConnectorOptions::default());
    let log = Arc::new(Mutex::new(Vec::new()));
    f.router.before_global(Arc::new(TraceFilter {
        name: "global",
        log: log.clone(),
    }));
    f.router.before_local(Arc::new(TraceFilter {
        name: "local",
        log: log.clone(),
    }));

    let (socket, session) = admitted(&f).await;
    session.bind("alice").unwrap();

    let msg = Message::request(5, "chat.room.say", json!({"content": "hi"}));
    f.connector
        .handle_data(&session, &serde_json::to_vec(&msg).unwrap())
        .await;

    let forwards = f.rpc.forwards.lock().unwrap().clone();
    assert_eq!(
        forwards,
        vec![("chat".to_string(), Some("alice".to_string()), "chat.room.say".to_string())]
    );
    assert_eq!(f.handler.calls.load(Ordering::SeqCst), 0);
    assert_eq!(*log.lock().unwrap(), vec!["global"]);

    let frames = socket.sent_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["id"], json!(5));
    assert_eq!(frames[0]["body"]["remote"], json!(true));
}

#[tokio::test]
async fn same_type_route_is_handled_locally_after_both_filter_chains() {
    let f = fixture("chat", false, ConnectorOptions::default());
    let log = Arc::new(Mutex::new(Vec::new()));
    f.router.before_global(Arc::new(TraceFilter {
        name: "global",
        log: log.clone(),
    }));
    f.router.before_local(Arc::new(TraceFilter {
        name: "local",
        log: log.clone(),
    }));

    let (socket, session) = admitted(&f).await;
    let msg = Message::request(2, "chat.room.say", json!({"content": "hi"}));
    f.connector
        .handle_data(&session, &serde_json::to_vec(&msg).unwrap())
        .await;

    assert_eq!(*log.lock().unwrap(), vec!["global", "local"]);
    assert_eq!(f.handler.calls.load(Ordering::SeqCst), 1);
    assert!(f.rpc.forwards.lock().unwrap().is_empty());

    let frames = socket.sent_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["body"]["method"], json!("say"));
}

#[tokio::test]
async fn handler_failure_still_yields_exactly_one_reply() {
    let f = fixture("chat", true, ConnectorOptions::default());
    let (socket, session) = admitted(&f).await;

    let msg = Message::request(9, "chat.room.say", json!({}));
    f.connector
        .handle_data(&session, &serde_json::to_vec(&msg).unwrap())
        .await;

    let frames = socket.sent_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["id"], json!(9));
    assert_eq!(frames[0]["body"]["code"], json!(500));
}

#[tokio::test]
async fn failing_notification_stays_silent() {
    let f = fixture("chat", true, ConnectorOptions::default());
    let (socket, session) = admitted(&f).await;

    let msg = Message::notify("chat.room.say", json!({}));
    f.connector
        .handle_data(&session, &serde_json::to_vec(&msg).unwrap())
        .await;

    assert_eq!(f.handler.calls.load(Ordering::SeqCst), 1);
    assert!(socket.sent_frames().is_empty());
}

#[tokio::test]
async fn stopped_router_refuses_dispatch() {
    let f = fixture("chat", false, ConnectorOptions::default());
    let (_socket, session) = admitted(&f).await;
    f.router.stop();

    let msg = Message::request(1, "chat.room.say", json!({}));
    let outcome = match f.router.dispatch(&msg, &session).await {
        Dispatch::Reply(outcome) => outcome,
        Dispatch::Kicked => panic!("stopped router must not kick"),
    };
    assert!(matches!(outcome.err, Some(ServerError::NotStarted)));
    assert_eq!(f.handler.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn backend_entry_runs_only_the_local_chain() {
    let f = fixture("chat", false, ConnectorOptions::default());
    let log = Arc::new(Mutex::new(Vec::new()));
    f.router.before_global(Arc::new(TraceFilter {
        name: "global",
        log: log.clone(),
    }));
    f.router.before_local(Arc::new(TraceFilter {
        name: "local",
        log: log.clone(),
    }));

    let (_socket, session) = admitted(&f).await;
    let msg = Message::request(4, "chat.room.say", json!({}));
    let outcome = f.router.handle(&msg, &session).await;

    assert!(outcome.err.is_none());
    assert_eq!(outcome.resp.unwrap()["method"], json!("say"));
    assert_eq!(*log.lock().unwrap(), vec!["local"]);
}
