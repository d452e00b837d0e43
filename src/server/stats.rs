use axum::{extract::State, response::IntoResponse, routing::get, Router};
use dashmap::DashMap;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use crate::server::service::{ConnectionStats, LoginInfo, StatisticsInfo};

/// Process-level counters exposed to Prometheus.
#[derive(Clone)]
pub struct Metrics {
    /// Number of live client connections.
    pub connections: IntGauge,
    /// Total frames received from clients.
    pub messages_received: IntCounter,
    /// Total frames written to client sockets.
    pub messages_sent: IntCounter,
    registry: Registry,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let connections = IntGauge::new("connections", "Active connections").unwrap();
        let messages_received =
            IntCounter::new("messages_received", "Total messages received").unwrap();
        let messages_sent = IntCounter::new("messages_sent", "Total messages sent").unwrap();

        registry.register(Box::new(connections.clone())).unwrap();
        registry.register(Box::new(messages_received.clone())).unwrap();
        registry.register(Box::new(messages_sent.clone())).unwrap();

        Self {
            connections,
            messages_received,
            messages_sent,
            registry,
        }
    }

    /// Current state of all registered metrics in Prometheus text format.
    pub fn expose(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// [`ConnectionStats`] backed by the Prometheus gauge plus a logged-in-user
/// table keyed by uid.
pub struct MetricsStats {
    metrics: Metrics,
    logined: DashMap<String, LoginInfo>,
}

impl MetricsStats {
    pub fn new(metrics: Metrics) -> Self {
        MetricsStats {
            metrics,
            logined: DashMap::new(),
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn logined_user(&self, uid: &str) -> Option<LoginInfo> {
        self.logined.get(uid).map(|info| info.clone())
    }

    pub fn logined_count(&self) -> usize {
        self.logined.len()
    }
}

impl ConnectionStats for MetricsStats {
    fn increase_connection_count(&self) {
        self.metrics.connections.inc();
    }

    fn decrease_connection_count(&self, uid: Option<&str>) {
        self.metrics.connections.dec();
        if let Some(uid) = uid {
            self.logined.remove(uid);
        }
    }

    fn statistics_info(&self) -> StatisticsInfo {
        StatisticsInfo {
            total_conn_count: self.metrics.connections.get().max(0) as u64,
        }
    }

    fn add_logined_user(&self, uid: &str, info: LoginInfo) {
        self.logined.insert(uid.to_string(), info);
    }

    fn remove_logined_user(&self, uid: &str) {
        self.logined.remove(uid);
    }
}

/// Builds the `/metrics` scrape router.
pub fn metrics_router(stats: Arc<MetricsStats>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(stats)
}

/// Serves the Prometheus scrape endpoint until the process exits.
pub async fn serve_metrics_http(stats: Arc<MetricsStats>, addr: SocketAddr) {
    info!(%addr, "metrics endpoint listening");
    axum::Server::bind(&addr)
        .serve(metrics_router(stats).into_make_service())
        .await
        .unwrap();
}

async fn metrics_handler(State(stats): State<Arc<MetricsStats>>) -> impl IntoResponse {
    stats.metrics().expose()
}
