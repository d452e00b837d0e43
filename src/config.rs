use config::Config;
use serde::Deserialize;
use std::{fs, path::PathBuf, sync::Arc};
use tokio_rustls::{
    rustls::{Certificate, PrivateKey, ServerConfig as RustlsServerConfig},
    TlsAcceptor,
};
use rustls_pemfile::{certs, pkcs8_private_keys};

use crate::server::registry::ServerInfo;
use crate::utils::error::ServerError;

/// Configuration settings for one server node.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Unique id of this node in the cluster.
    #[serde(default = "default_server_id")]
    pub server_id: String,
    /// Server type this node handles locally; routes naming other types are
    /// forwarded.
    #[serde(default = "default_server_type")]
    pub server_type: String,
    /// Whether this node accepts client connections.
    #[serde(default = "default_true")]
    pub frontend: bool,
    #[serde(default = "default_host")]
    pub host: String,
    /// The port on which the client listener binds.
    #[serde(default = "default_port")]
    pub port: u16,
    /// The maximum number of simultaneous connections allowed; unlimited
    /// when absent.
    #[serde(default)]
    pub max_connections: Option<u64>,
    /// Require RSA-signed client messages.
    #[serde(default)]
    pub use_crypto: bool,
    /// Check new connections against the host blacklist.
    #[serde(default)]
    pub use_host_filter: bool,
    /// When false, messages routed at other server types kick the client.
    #[serde(default = "default_true")]
    pub forward_msg: bool,
    /// The maximum number of messages a client can send per second.
    #[serde(default = "default_rate_limit")]
    pub message_rate_limit: u32,
    /// Deflate-compress outbound frames.
    #[serde(default)]
    pub enable_compression: bool,
    /// Upper bound on the serialized body of one inbound message.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// Port for the Prometheus scrape endpoint.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Grace period for in-flight work during shutdown, in seconds.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// Whether TLS is enabled for the client listener.
    #[serde(default)]
    pub enable_tls: bool,
    /// Path to the TLS certificate file.
    #[serde(default)]
    pub tls_cert_path: PathBuf,
    /// Path to the TLS private key file.
    #[serde(default)]
    pub tls_key_path: PathBuf,
}

fn default_server_id() -> String {
    "connector-1".into()
}

fn default_server_type() -> String {
    "connector".into()
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    3010
}

fn default_rate_limit() -> u32 {
    100
}

fn default_max_message_bytes() -> usize {
    64 * 1024
}

fn default_metrics_port() -> u16 {
    9100
}

fn default_shutdown_grace() -> u64 {
    10
}

impl ServerConfig {
    /// Loads the server configuration from environment variables.
    ///
    /// Environment variables should be prefixed with `PYLON_`.
    pub fn from_env() -> Result<Self, ServerError> {
        Config::builder()
            .add_source(config::Environment::with_prefix("PYLON"))
            .build()
            .map_err(|e| ServerError::Configuration(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ServerError::Configuration(e.to_string()))
    }

    /// Validates the configuration settings.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.server_id.is_empty() || self.server_type.is_empty() {
            return Err(ServerError::Configuration(
                "server_id and server_type must not be empty".into(),
            ));
        }

        if self.message_rate_limit == 0 {
            return Err(ServerError::Configuration(
                "message_rate_limit must be greater than 0".into(),
            ));
        }

        if self.max_connections == Some(0) {
            return Err(ServerError::Configuration(
                "max_connections must be greater than 0 when set".into(),
            ));
        }

        if self.enable_tls {
            if !self.tls_cert_path.exists() {
                return Err(ServerError::Configuration(format!(
                    "Certificate file not found: {:?}",
                    self.tls_cert_path
                )));
            }

            if !self.tls_key_path.exists() {
                return Err(ServerError::Configuration(format!(
                    "Key file not found: {:?}",
                    self.tls_key_path
                )));
            }
        }

        Ok(())
    }

    /// The registry entry this node announces about itself.
    pub fn server_info(&self) -> ServerInfo {
        ServerInfo {
            id: self.server_id.clone(),
            server_type: self.server_type.clone(),
            host: self.host.clone(),
            port: self.port,
            frontend: self.frontend,
            client_port: self.frontend.then_some(self.port),
            max_connections: self.max_connections,
        }
    }

    /// Creates a TLS acceptor for secure client connections.
    ///
    /// If TLS is disabled, returns `None`. Otherwise, loads the TLS
    /// certificate and private key, and initializes a Rustls TLS acceptor.
    pub fn create_tls_acceptor(&self) -> Result<Option<Arc<TlsAcceptor>>, ServerError> {
        if !self.enable_tls {
            return Ok(None);
        }

        let cert_chain = fs::read(&self.tls_cert_path).map_err(|e| {
            ServerError::Configuration(format!(
                "Certificate error: {} (path: {:?})",
                e, self.tls_cert_path
            ))
        })?;

        let key_der = fs::read(&self.tls_key_path).map_err(|e| {
            ServerError::Configuration(format!(
                "Key error: {} (path: {:?})",
                e, self.tls_key_path
            ))
        })?;

        let certs = certs(&mut cert_chain.as_slice())
            .map_err(|e| ServerError::Configuration(format!("Cert parse error: {}", e)))?;

        let mut keys = pkcs8_private_keys(&mut key_der.as_slice())
            .map_err(|e| ServerError::Configuration(format!("Key parse error: {}", e)))?;

        if keys.is_empty() {
            return Err(ServerError::Configuration(format!(
                "No PKCS#8 key found in {:?}",
                self.tls_key_path
            )));
        }

        let config = RustlsServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                certs.into_iter().map(Certificate).collect(),
                PrivateKey(keys.remove(0)),
            )
            .map_err(|e| ServerError::Configuration(format!("TLS config error: {}", e)))?;

        Ok(Some(Arc::new(TlsAcceptor::from(Arc::new(config)))))
    }
}
