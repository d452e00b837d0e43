use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, warn};
use tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::server::connector::Connector;
use crate::server::session::SessionId;
use crate::server::stats::Metrics;
use crate::utils::error::ServerError;

/// Transport handle the core holds per connection: enough to address, write
/// to, and sever the link, nothing more.
pub trait Socket: Send + Sync {
    fn id(&self) -> SessionId;
    fn remote_addr(&self) -> SocketAddr;
    fn send(&self, data: Vec<u8>) -> Result<(), ServerError>;
    fn disconnect(&self);
}

/// [`Socket`] backed by the write half of a WebSocket connection.
///
/// Writes go through an unbounded channel drained by a dedicated task, so
/// `send` never blocks a dispatch path on socket backpressure.
pub struct WsSocket {
    id: SessionId,
    addr: SocketAddr,
    tx: mpsc::UnboundedSender<WsMessage>,
    metrics: Option<Metrics>,
}

impl WsSocket {
    pub fn new<S>(
        addr: SocketAddr,
        mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
        metrics: Option<Metrics>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let closing = matches!(frame, WsMessage::Close(_));
                if let Err(e) = sink.send(frame).await {
                    debug!(%addr, error = %e, "websocket write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
        });
        Arc::new(WsSocket {
            id: Uuid::new_v4(),
            addr,
            tx,
            metrics,
        })
    }
}

impl Socket for WsSocket {
    fn id(&self) -> SessionId {
        self.id
    }

    fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    fn send(&self, data: Vec<u8>) -> Result<(), ServerError> {
        self.tx
            .send(WsMessage::Binary(data))
            .map_err(|_| ServerError::Connection("websocket writer gone".into()))?;
        if let Some(m) = &self.metrics {
            m.messages_sent.inc();
        }
        Ok(())
    }

    fn disconnect(&self) {
        let _ = self.tx.send(WsMessage::Close(None));
    }
}

/// Runs one client connection: WebSocket handshake, admission, then the
/// read loop feeding the connector until the peer goes away.
pub async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    connector: Arc<Connector>,
    metrics: Option<Metrics>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%addr, error = %e, "websocket handshake failed");
            return;
        }
    };

    let (sink, mut reader) = ws_stream.split();
    let socket = WsSocket::new(addr, sink, metrics.clone());
    let session = match connector.accept(socket).await {
        Ok(session) => session,
        Err(e) => {
            debug!(%addr, error = %e, "connection rejected");
            return;
        }
    };

    while let Some(frame) = reader.next().await {
        match frame {
            Ok(WsMessage::Binary(data)) => {
                if let Some(m) = &metrics {
                    m.messages_received.inc();
                }
                connector.handle_data(&session, &data).await;
            }
            Ok(WsMessage::Text(text)) => {
                if let Some(m) = &metrics {
                    m.messages_received.inc();
                }
                connector.handle_data(&session, text.as_bytes()).await;
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%addr, error = %e, "websocket read failed");
                break;
            }
        }
    }

    connector.disconnected(&session);
    debug!(%addr, session = %session.id, "connection finished");
}

/// Accept loop for client connections, plain TCP or TLS depending on
/// configuration. Runs until the listener is dropped or the task is aborted.
pub async fn serve(
    listener: TcpListener,
    tls_acceptor: Option<Arc<TlsAcceptor>>,
    connector: Arc<Connector>,
    metrics: Option<Metrics>,
) {
    info!(tls = tls_acceptor.is_some(), "client listener accepting connections");
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "accept failed");
                continue;
            }
        };
        let connector = connector.clone();
        let metrics = metrics.clone();
        let tls_acceptor = tls_acceptor.clone();
        tokio::spawn(async move {
            match tls_acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        handle_connection(tls_stream, addr, connector, metrics).await
                    }
                    Err(e) => warn!(%addr, error = %e, "tls handshake failed"),
                },
                None => handle_connection(stream, addr, connector, metrics).await,
            }
        });
    }
}
