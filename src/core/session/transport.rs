//! Abstract duplex message channel to the synthesis service, plus the
//! production websocket implementation.
//!
//! The engine never assumes framing beyond "one complete text message per
//! event". Tests substitute a mock transport through the [`Transport`]
//! trait, the same seam the websocket implementation plugs into.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info};

use crate::config::EngineConfig;

use super::{SessionError, SessionResult};

/// Outbound frame handed to the transport task.
#[derive(Debug)]
pub enum TransportCommand {
    /// Send one complete text message.
    Send(String),
    /// Close the connection cleanly.
    Close,
}

/// Inbound event from the transport task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One complete text message.
    Message(String),
    /// The connection failed.
    Error(String),
    /// The connection closed, with the close code when known.
    Closed(Option<u16>),
}

/// Channel pair for one open connection.
///
/// Dropping the outbound sender lets the transport task shut down; the
/// event receiver yields `None` once the task is gone.
#[derive(Debug)]
pub struct TransportConnection {
    /// Bounded so a stalled connection applies backpressure to senders.
    pub outbound: mpsc::Sender<TransportCommand>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Abstract connection factory for the streaming session.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection, returning its channel pair once the connection
    /// is established.
    async fn connect(&mut self) -> SessionResult<TransportConnection>;
}

/// Websocket transport authenticated with the `xi-api-key` header.
pub struct WebSocketTransport {
    url: String,
    host: String,
    api_key: String,
}

impl WebSocketTransport {
    pub fn new(config: &EngineConfig) -> SessionResult<Self> {
        let url = config.url()?;
        Ok(Self {
            url: url.to_string(),
            host: config.host.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&mut self) -> SessionResult<TransportConnection> {
        let request = tokio_tungstenite::tungstenite::http::Request::builder()
            .method("GET")
            .uri(&self.url)
            .header("Host", &self.host)
            .header("Upgrade", "websocket")
            .header("Connection", "upgrade")
            .header("Sec-WebSocket-Key", generate_key())
            .header("Sec-WebSocket-Version", "13")
            .header("xi-api-key", &self.api_key)
            .body(())
            .map_err(|e| {
                SessionError::ConnectionFailed(format!("failed to build websocket request: {e}"))
            })?;

        let (ws_stream, _response) = connect_async(request).await.map_err(|e| {
            SessionError::ConnectionFailed(format!("websocket connect failed: {e}"))
        })?;

        info!("connected to synthesis websocket");

        let (mut ws_sink, mut ws_stream) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<TransportCommand>(32);
        let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    command = out_rx.recv() => match command {
                        Some(TransportCommand::Send(text)) => {
                            if let Err(e) = ws_sink.send(Message::Text(text.into())).await {
                                error!("websocket send failed: {e}");
                                let _ = event_tx.send(TransportEvent::Error(e.to_string()));
                                break;
                            }
                        }
                        Some(TransportCommand::Close) => {
                            let _ = ws_sink.send(Message::Close(None)).await;
                            let _ = event_tx.send(TransportEvent::Closed(None));
                            break;
                        }
                        None => {
                            // Session dropped the connection handle.
                            let _ = ws_sink.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    inbound = ws_stream.next() => match inbound {
                        Some(Ok(Message::Text(text))) => {
                            if event_tx.send(TransportEvent::Message(text.to_string())).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.map(|f| u16::from(f.code));
                            info!("websocket closed by server: {code:?}");
                            let _ = event_tx.send(TransportEvent::Closed(code));
                            break;
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                            debug!("websocket keepalive");
                        }
                        Some(Ok(other)) => {
                            debug!("ignoring non-text websocket frame: {other:?}");
                        }
                        Some(Err(e)) => {
                            error!("websocket receive failed: {e}");
                            let _ = event_tx.send(TransportEvent::Error(e.to_string()));
                            break;
                        }
                        None => {
                            info!("websocket stream ended");
                            let _ = event_tx.send(TransportEvent::Closed(None));
                            break;
                        }
                    },
                }
            }
        });

        Ok(TransportConnection {
            outbound: out_tx,
            events: event_rx,
        })
    }
}
