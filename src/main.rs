//! # Game Server Frontend Node
//!
//! Binary entry point for a frontend (connector) node: admits WebSocket
//! clients, dispatches their requests through the routing core, and serves
//! a Prometheus metrics endpoint.
//!
//! ## Features
//! - Secure TLS support using `tokio-rustls`
//! - Per-session rate limiting and message size validation
//! - Graceful shutdown with a bounded grace period
//! - Environment-based configuration loading
//! - Health monitoring via HTTP metrics endpoint

use futures_util::future::BoxFuture;
use pylon::{config, server};
use serde_json::Value;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::{net::TcpListener, signal};
use tracing::{error, info};

use server::message::{self, RouteRecord};
use server::middleware::{BodySizeFilter, RateLimitFilter};
use server::service::DirectPushScheduler;
use server::{
    ClusterView, Connector, ConnectorOptions, EventBus, FrontendSession, HandlerService, Message,
    Metrics, MetricsStats, Router, RpcTransport, Session, SessionManager,
};
use pylon::utils::error::ServerError;

/// Demo handler: echoes the request body back. Real deployments plug in
/// their own [`HandlerService`].
struct EchoHandler;

impl HandlerService for EchoHandler {
    fn handle(
        &self,
        route: &RouteRecord,
        body: &Value,
        _session: &Arc<Session>,
    ) -> BoxFuture<'static, Result<Value, ServerError>> {
        let route = route.route.clone();
        let body = body.clone();
        Box::pin(async move {
            info!(%route, "handling request");
            Ok(body)
        })
    }
}

/// Placeholder RPC transport for single-node deployments: every forward
/// fails, so misrouted messages surface as errors instead of hanging.
struct NoClusterRpc;

impl RpcTransport for NoClusterRpc {
    fn forward(
        &self,
        target_server_type: &str,
        _session: FrontendSession,
        _msg: Message,
    ) -> BoxFuture<'static, Result<Value, ServerError>> {
        let target = target_server_type.to_string();
        Box::pin(async move { Err(ServerError::Forward(target)) })
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt::init();

    let config = config::ServerConfig::from_env()?;
    config.validate()?;

    let cluster = Arc::new(ClusterView::new(config.server_info()));
    let sessions = Arc::new(SessionManager::new());
    let metrics = Metrics::new();
    let stats = Arc::new(MetricsStats::new(metrics.clone()));

    let router = Arc::new(Router::new(
        cluster.clone(),
        sessions.clone(),
        Arc::new(EchoHandler),
        Arc::new(NoClusterRpc),
    ));
    if let Some(per_second) = NonZeroU32::new(config.message_rate_limit) {
        router.before_global(Arc::new(RateLimitFilter::new(per_second)));
    }
    router.before_global(Arc::new(BodySizeFilter::new(config.max_message_bytes)));
    router.start();

    let push = Arc::new(DirectPushScheduler::new(sessions.clone()));
    let encode: Option<message::EncodeFn> = config.enable_compression.then(|| {
        Arc::new(|id: Option<u64>, route: &str, body: &Value| {
            let bytes = message::default_encode(id, route, body)?;
            message::compress_message(&bytes)
        }) as message::EncodeFn
    });
    let mut connector = Connector::new(
        cluster,
        sessions.clone(),
        router.clone(),
        push,
        Arc::new(EventBus::new()),
        ConnectorOptions {
            use_crypto: config.use_crypto,
            use_host_filter: config.use_host_filter,
            forward_msg: config.forward_msg,
            encode,
            ..Default::default()
        },
    );
    connector.set_stats(stats.clone());
    let connector = Arc::new(connector);

    let metrics_addr = format!("0.0.0.0:{}", config.metrics_port).parse()?;
    tokio::spawn(server::stats::serve_metrics_http(stats, metrics_addr));

    let tls_acceptor = config.create_tls_acceptor()?;
    let listener = TcpListener::bind(format!("{}:{}", config.host, config.port)).await?;
    info!("Server {} listening on port {}", config.server_id, config.port);

    tokio::select! {
        _ = server::serve(listener, tls_acceptor, connector, Some(metrics)) => {},
        _ = shutdown_signal() => {
            info!("Shutting down gracefully");
            // Detached deadline: if the drain below stalls, the process is
            // forced down once the grace period expires. A clean exit
            // simply never reaches the timer.
            let grace = Duration::from_secs(config.shutdown_grace_secs);
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                error!("graceful shutdown timed out, forcing exit");
                std::process::exit(1);
            });
            router.stop();
            sessions.close_all("shutdown");
            // Let the socket writer tasks flush their close frames.
            tokio::task::yield_now().await;
        }
    }

    Ok(())
}

/// Blocks until Ctrl+C, then lets the caller run its shutdown sequence.
async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}
