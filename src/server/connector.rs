use dashmap::DashMap;
use regex::Regex;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, warn};

use crate::server::events::EventBus;
use crate::server::message::{
    assemble_response, default_decode, default_encode, DecodeFn, EncodeFn, Message, CRYPTO_FIELD,
};
use crate::server::registry::ClusterView;
use crate::server::router::{Dispatch, Router};
use crate::server::service::{
    BlacklistSource, ConnectionStats, LoginInfo, PushKind, PushScheduler, TaskQueue,
};
use crate::server::session::{Session, SessionId, SessionListener, SessionManager};
use crate::server::transport::Socket;
use crate::utils::decode_hex;
use crate::utils::error::ServerError;

/// Session setting that carries the client's RSA public key once it is
/// associated with a session.
const PUB_KEY_SETTING: &str = "pubKey";

/// Tunables for one connector instance.
#[derive(Clone)]
pub struct ConnectorOptions {
    /// Require a valid RSA signature on every inbound frame.
    pub use_crypto: bool,
    /// Reject connections whose peer address matches the blacklist.
    pub use_host_filter: bool,
    /// When false, frames routed at other server types kick the client
    /// instead of being forwarded.
    pub forward_msg: bool,
    /// Optional async provider of extra blacklist patterns.
    pub blacklist_source: Option<BlacklistSource>,
    /// Custom outbound encoder; the JSON default is used when absent.
    pub encode: Option<EncodeFn>,
    /// Custom inbound decoder; the JSON default is used when absent.
    pub decode: Option<DecodeFn>,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        ConnectorOptions {
            use_crypto: false,
            use_host_filter: false,
            forward_msg: true,
            blacklist_source: None,
            encode: None,
            decode: None,
        }
    }
}

/// Client-facing edge of the routing core.
///
/// Owns connection admission, optional host filtering and message signature
/// verification, and the decode → dispatch → respond path for every inbound
/// frame. Transport servers hand it raw sockets and raw payloads.
pub struct Connector {
    cluster: Arc<ClusterView>,
    sessions: Arc<SessionManager>,
    router: Arc<Router>,
    push: Arc<dyn PushScheduler>,
    events: Arc<EventBus>,
    stats: Option<Arc<dyn ConnectionStats>>,
    tasks: Option<Arc<dyn TaskQueue>>,
    /// Public keys announced during handshake, parked until the first signed
    /// frame moves them into the session.
    keys: DashMap<SessionId, RsaPublicKey>,
    blacklist: RwLock<Vec<Regex>>,
    opts: ConnectorOptions,
}

impl Connector {
    pub fn new(
        cluster: Arc<ClusterView>,
        sessions: Arc<SessionManager>,
        router: Arc<Router>,
        push: Arc<dyn PushScheduler>,
        events: Arc<EventBus>,
        opts: ConnectorOptions,
    ) -> Self {
        Connector {
            cluster,
            sessions,
            router,
            push,
            events,
            stats: None,
            tasks: None,
            keys: DashMap::new(),
            blacklist: RwLock::new(Vec::new()),
            opts,
        }
    }

    pub fn set_stats(&mut self, stats: Arc<dyn ConnectionStats>) {
        self.stats = Some(stats);
    }

    pub fn set_task_queue(&mut self, tasks: Arc<dyn TaskQueue>) {
        self.tasks = Some(tasks);
    }

    /// Adds a static host blacklist pattern, matched against the textual
    /// peer IP of each new connection.
    pub fn ban_host(&self, pattern: &str) -> Result<(), ServerError> {
        let re = Regex::new(pattern)
            .map_err(|e| ServerError::Configuration(format!("bad blacklist pattern: {e}")))?;
        self.blacklist.write().unwrap().push(re);
        Ok(())
    }

    /// Admits a freshly connected socket and creates its session.
    ///
    /// Admission runs the host filter first, then the connection cap of this
    /// server's registry entry. A rejected socket is disconnected before the
    /// error is returned and never gets a session.
    pub async fn accept(&self, socket: Arc<dyn Socket>) -> Result<Arc<Session>, ServerError> {
        let addr = socket.remote_addr();
        if self.opts.use_host_filter && self.host_banned(&addr.ip().to_string()).await {
            warn!(%addr, "connection refused by host filter");
            socket.disconnect();
            return Err(ServerError::Refused(format!("host {} is banned", addr.ip())));
        }

        if let Some(stats) = &self.stats {
            stats.increase_connection_count();
            if let Some(max) = self.cluster.cur_server().max_connections {
                if stats.statistics_info().total_conn_count > max {
                    warn!(
                        "the server {} has reached the max connections {}",
                        self.cluster.server_id(),
                        max
                    );
                    stats.decrease_connection_count(None);
                    socket.disconnect();
                    return Err(ServerError::Refused("max connections reached".into()));
                }
            }
        }

        let known = self.sessions.get(socket.id()).is_some();
        let session =
            self.sessions
                .get_or_create(socket.id(), self.cluster.server_id(), socket.clone());
        if !known {
            session.add_listener(Arc::new(SessionHooks {
                stats: self.stats.clone(),
                tasks: self.tasks.clone(),
                events: self.events.clone(),
                address: addr.to_string(),
            }));
        }
        debug!(session = %session.id, %addr, "connection admitted");
        Ok(session)
    }

    /// Transport-level disconnect notification.
    pub fn disconnected(&self, session: &Arc<Session>) {
        session.close("disconnect");
        self.sessions.remove(session.id);
    }

    /// Entry point for one raw inbound payload from an admitted connection.
    pub async fn handle_data(&self, session: &Arc<Session>, raw: &[u8]) {
        let decoded = match &self.opts.decode {
            Some(decode) => decode(raw),
            None => default_decode(raw),
        };
        let Some(mut msg) = decoded else {
            debug!(session = %session.id, "discarding undecodable frame");
            return;
        };

        if self.opts.use_crypto && !self.verify_message(session, &mut msg) {
            error!(session = %session.id, "fail to verify the data received from client");
            return;
        }

        self.handle_message(session, msg).await;
    }

    /// Routes a decoded frame and, for requests, sends back exactly one
    /// response. Notifications never produce a reply, error or not.
    pub async fn handle_message(&self, session: &Arc<Session>, msg: Message) {
        let Some(server_type) = msg.route.split('.').next().filter(|s| !s.is_empty()) else {
            error!(route = %msg.route, "invalid route string");
            return;
        };

        if !self.opts.forward_msg && server_type != self.cluster.server_type() {
            warn!(session = %session.id, route = %msg.route, "message forwarding is disabled, kick user");
            self.sessions.kick_by_session_id(session.id, "forward disabled");
            return;
        }

        let outcome = match self.router.dispatch(&msg, session).await {
            Dispatch::Kicked => return,
            Dispatch::Reply(outcome) => outcome,
        };

        if msg.id.is_none() {
            if outcome.resp.is_some() {
                warn!("try to response to a notify: {}", msg.route);
            }
            return;
        }

        let body = assemble_response(outcome.err.as_ref(), outcome.resp);
        self.send(msg.id, &msg.route, &body, &[session.id], PushKind::Response)
            .await;
    }

    /// Encodes and schedules one outbound frame for a set of sessions.
    pub async fn send(
        &self,
        request_id: Option<u64>,
        route: &str,
        body: &Value,
        recipients: &[SessionId],
        kind: PushKind,
    ) {
        debug!(?request_id, route, ?kind, count = recipients.len(), "sending message");
        let encoded = match &self.opts.encode {
            Some(encode) => encode(request_id, route, body),
            None => default_encode(request_id, route, body),
        };
        let payload = match encoded {
            Ok(payload) => payload,
            Err(e) => {
                error!(route, error = %e, "fail to encode outbound message");
                return;
            }
        };
        if let Err(e) = self
            .push
            .schedule(request_id, route, payload, recipients, kind)
            .await
        {
            error!(route, error = %e, "fail to schedule outbound message");
        }
    }

    /// Registers the public key a client announced during handshake. The key
    /// moves into the session's settings on its first verified frame.
    pub fn set_pub_key(&self, id: SessionId, n_hex: &str, e: u32) -> Result<(), ServerError> {
        let n = BigUint::parse_bytes(n_hex.as_bytes(), 16)
            .ok_or_else(|| ServerError::Crypto("bad modulus".into()))?;
        let key = RsaPublicKey::new(n, BigUint::from(e))
            .map_err(|e| ServerError::Crypto(e.to_string()))?;
        self.keys.insert(id, key);
        Ok(())
    }

    pub fn get_pub_key(&self, id: SessionId) -> Option<RsaPublicKey> {
        self.keys.get(&id).map(|k| k.clone())
    }

    /// Checks the frame signature carried in the body's crypto field against
    /// the session's public key and strips the field on success.
    pub fn verify_message(&self, session: &Arc<Session>, msg: &mut Message) -> bool {
        let Some(sig_value) = msg.body.get(CRYPTO_FIELD).cloned() else {
            error!(session = %session.id, "miss signature in crypto message");
            return false;
        };
        let Some(sig_hex) = sig_value.as_str() else {
            error!(session = %session.id, "signature is not a string");
            return false;
        };

        let Some(key) = self.session_pub_key(session) else {
            error!(session = %session.id, "miss public key for crypto message");
            return false;
        };

        if let Some(obj) = msg.body.as_object_mut() {
            obj.remove(CRYPTO_FIELD);
        }

        let canonical = match serde_json::to_string(&msg.body) {
            Ok(s) => s,
            Err(e) => {
                error!(session = %session.id, error = %e, "fail to canonicalize message body");
                return false;
            }
        };
        let Some(sig) = decode_hex(sig_hex) else {
            error!(session = %session.id, "signature is not valid hex");
            return false;
        };

        let digest = Sha256::digest(canonical.as_bytes());
        key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &sig)
            .is_ok()
    }

    /// The session's verification key: prefer the one stored in the session
    /// settings, falling back to the handshake-announced key, which is then
    /// promoted into the session.
    fn session_pub_key(&self, session: &Arc<Session>) -> Option<RsaPublicKey> {
        if let Some(stored) = session.get(PUB_KEY_SETTING) {
            let n_hex = stored.get("n")?.as_str()?;
            let e = stored.get("e")?.as_u64()?;
            let n = BigUint::parse_bytes(n_hex.as_bytes(), 16)?;
            return RsaPublicKey::new(n, BigUint::from(e)).ok();
        }

        let (_, key) = self.keys.remove(&session.id)?;
        session.set(
            PUB_KEY_SETTING,
            json!({
                "n": key.n().to_str_radix(16),
                "e": key.e().to_str_radix(10).parse::<u64>().ok()?,
            }),
        );
        Some(key)
    }
}

/// Bridges per-session lifecycle notifications to the connection statistics,
/// the task queue, and the application event bus.
struct SessionHooks {
    stats: Option<Arc<dyn ConnectionStats>>,
    tasks: Option<Arc<dyn TaskQueue>>,
    events: Arc<EventBus>,
    address: String,
}

impl SessionListener for SessionHooks {
    fn session_bound(&self, session: &Session, uid: &str) {
        if let Some(stats) = &self.stats {
            let now_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default();
            stats.add_logined_user(
                uid,
                LoginInfo {
                    login_time_ms: now_ms,
                    uid: uid.to_string(),
                    address: self.address.clone(),
                },
            );
        }
        self.events.emit_bind(session);
    }

    fn session_unbound(&self, session: &Session, uid: &str) {
        if let Some(stats) = &self.stats {
            stats.remove_logined_user(uid);
        }
        self.events.emit_unbind(session);
    }

    fn session_closed(&self, session: &Session, _reason: &str) {
        if let Some(stats) = &self.stats {
            stats.decrease_connection_count(session.uid().as_deref());
        }
        if let Some(tasks) = &self.tasks {
            tasks.close_queue(session.id, true);
        }
        self.events.emit_close(session);
    }
}

impl Connector {
    async fn host_banned(&self, host: &str) -> bool {
        for re in self.blacklist.read().unwrap().iter() {
            if re.is_match(host) {
                return true;
            }
        }
        if let Some(source) = &self.opts.blacklist_source {
            match source().await {
                Ok(patterns) => {
                    for pattern in patterns {
                        match Regex::new(&pattern) {
                            Ok(re) if re.is_match(host) => return true,
                            Ok(_) => {}
                            Err(e) => warn!(pattern, error = %e, "skipping bad blacklist pattern"),
                        }
                    }
                }
                // An unreachable blacklist must not lock everyone out.
                Err(e) => warn!(error = %e, "blacklist source failed, admitting host"),
            }
        }
        false
    }
}

/// Signs a message body the way clients are expected to: strip nothing, hash
/// the compact JSON text, RSA-sign the digest, hex-encode the signature.
#[cfg(test)]
pub fn sign_body(key: &rsa::RsaPrivateKey, body: &Value) -> String {
    let canonical = serde_json::to_string(body).unwrap();
    let digest = Sha256::digest(canonical.as_bytes());
    let sig = key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest).unwrap();
    crate::utils::encode_hex(&sig)
}
