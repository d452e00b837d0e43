// src/server/mod.rs
pub mod connector;
pub mod events;
pub mod filter;
pub mod message;
pub mod middleware;
pub mod registry;
pub mod router;
pub mod service;
pub mod session;
pub mod stats;
pub mod transport;

// Re-export public components
pub use connector::{Connector, ConnectorOptions};
pub use events::{EventBus, SessionObserver};
pub use filter::{AfterFilter, BeforeFilter, FilterService};
pub use message::{Message, RouteRecord};
pub use registry::{ClusterView, ServerInfo};
pub use router::{Dispatch, DispatchOutcome, ErrorHandler, Router};
pub use service::{
    ConnectionStats, DirectPushScheduler, HandlerService, PushKind, PushScheduler, RpcTransport,
    TaskQueue,
};
pub use session::{FrontendSession, Session, SessionId, SessionListener, SessionManager};
pub use stats::{Metrics, MetricsStats};
pub use transport::{serve, Socket, WsSocket};
