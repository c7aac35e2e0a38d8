//! WebSocket relay connector

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};

use super::error::TransportError;
use super::transport::{RelayConnector, RelayLink};

/// Opens relay connections over WebSocket
#[derive(Debug, Clone, Default)]
pub struct WsRelayConnector;

impl WsRelayConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RelayConnector for WsRelayConnector {
    async fn open(&self, url: &str) -> Result<RelayLink, TransportError> {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(TransportError::InvalidUrl(url.to_string()));
        }

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        info!("Connected to relay: {}", url);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let url = url.to_string();
        tokio::spawn(async move {
            if let Err(e) = relay_task(&url, ws_stream, outbound_rx, inbound_tx).await {
                error!("Relay {} error: {}", url, e);
            }
        });

        Ok(RelayLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Pump frames between the socket and the link channels until either side
/// closes
async fn relay_task(
    url: &str,
    ws_stream: WsStream,
    mut outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<String>,
) -> Result<(), TransportError> {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            biased;
            text = outbound.recv() => match text {
                Some(text) => {
                    trace!("Relay {} <- {}", url, text);
                    write
                        .send(Message::Text(text.into()))
                        .await
                        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
                }
                None => {
                    debug!("Closing relay connection: {}", url);
                    let _ = write.send(Message::Close(None)).await;
                    let _ = write.close().await;
                    break;
                }
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if inbound.send(text.to_string()).is_err() {
                        // Transport disconnected; flush what it queued before leaving
                        while let Ok(text) = outbound.try_recv() {
                            let _ = write.send(Message::Text(text.into())).await;
                        }
                        let _ = write.close().await;
                        break;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    warn!("WebSocket closed: {}", url);
                    break;
                }
                Some(Err(e)) => {
                    return Err(TransportError::ConnectionFailed(e.to_string()));
                }
                _ => {}
            },
        }
    }

    Ok(())
}
