//! Signaling relay link
//!
//! A [`RelayLink`] is one established connection to the relay, reduced to two
//! channels of text frames. The transport owns reconnection; a connector only
//! knows how to open a single link.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};

/// One open connection to the relay
///
/// The link is considered closed once `inbound` yields `None`.
pub struct RelayLink {
    /// Frames to send to the relay
    pub outbound: mpsc::UnboundedSender<String>,
    /// Frames received from the relay
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens links to the signaling relay
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self) -> Result<RelayLink>;
}

/// WebSocket relay connector
pub struct WebSocketConnector {
    url: String,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl RelayConnector for WebSocketConnector {
    async fn connect(&self) -> Result<RelayLink> {
        let connect = tokio_tungstenite::connect_async(self.url.as_str());
        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                AppError::TransportUnavailable(format!(
                    "timed out connecting to {} after {:?}",
                    self.url, self.connect_timeout
                ))
            })?
            .map_err(|e| {
                AppError::TransportUnavailable(format!("websocket connect to {} failed: {}", self.url, e))
            })?;

        info!("Signaling websocket connected: {}", self.url);

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        // Writer: ends when the transport drops its sender or the socket breaks
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                    warn!("Signaling websocket send failed: {}", e);
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        // Reader: dropping inbound_tx tells the transport the link is gone
        tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text.to_string()).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => {
                            if inbound_tx.send(text).is_err() {
                                break;
                            }
                        }
                        Err(_) => debug!("Ignoring non-UTF-8 binary frame from relay"),
                    },
                    Ok(Message::Close(frame)) => {
                        info!("Signaling websocket closed by relay: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Signaling websocket receive error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(RelayLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
