use thiserror::Error;

/// Errors surfaced by the routing and session core.
#[derive(Error, Debug, Clone)]
pub enum ServerError {
    /// The router received a message before `start()` or after `stop()`.
    ///
    /// Every inbound call fails fast with this error; no partial work is
    /// performed.
    #[error("server not started")]
    NotStarted,

    /// The route string did not split into `serverType.handler.method`.
    #[error("unknown route message {0}")]
    InvalidRoute(String),

    /// A second `bind` was attempted while the session already carries a uid.
    ///
    /// Rebinding requires an explicit `unbind` first.
    #[error("session already bound to uid {0}")]
    AlreadyBound(String),

    /// The session reached its terminal state; it accepts no further sends.
    #[error("session closed")]
    SessionClosed,

    /// The connection was refused at accept time (blacklist or max-connections).
    #[error("connection refused: {0}")]
    Refused(String),

    /// A before-filter rejected the request and short-circuited the chain.
    #[error("request rejected by filter: {0}")]
    Filter(String),

    /// The client exceeded its per-session message quota.
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// Business-logic failure carrying an application response code.
    ///
    /// The code ends up in the response frame; errors without one default
    /// to 500 during response assembly.
    #[error("application error {code}: {message}")]
    Application { code: i64, message: String },

    /// The handler service failed without an application code.
    #[error("handler error: {0}")]
    Handler(String),

    /// The RPC forward to a remote node failed.
    #[error("forward error: {0}")]
    Forward(String),

    /// Frame-level failure while decoding or encoding a message.
    #[error("message error: {0}")]
    Message(#[from] crate::server::message::MessageError),

    /// Failure in serializing or deserializing data.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid or inconsistent server configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Transport-level connection failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// Signature material was missing or did not verify.
    #[error("crypto error: {0}")]
    Crypto(String),
}

impl ServerError {
    /// Application response code carried by this error, if any.
    pub fn code(&self) -> Option<i64> {
        match self {
            ServerError::Application { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::Serialization(err.to_string())
    }
}
