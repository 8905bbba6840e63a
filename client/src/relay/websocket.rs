//! WebSocket Relay Transport
//!
//! Connects to a relay server over WebSocket with automatic reconnection.
//! Active channel subscriptions are re-sent after every reconnect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, StreamExt};
use mesh_common::{ChannelName, RelayFrame};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::{RelayError, RelayTransport};

/// Operations sent to the relay server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientOp {
    Subscribe { channel: ChannelName },
    Unsubscribe { channel: ChannelName },
    Publish(RelayFrame),
}

/// Messages received from the relay server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerOp {
    Subscribed { channel: ChannelName },
    Unsubscribed { channel: ChannelName },
    Message(RelayFrame),
    Error { message: String },
}

/// Connection status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

type Subscribers = Arc<Mutex<HashMap<ChannelName, mpsc::UnboundedSender<RelayFrame>>>>;

/// Outbound operations buffered while (re)connecting.
const OUTBOUND_QUEUE: usize = 100;

/// WebSocket relay client.
pub struct WebSocketRelay {
    /// Channel to send operations to the WebSocket.
    tx: mpsc::Sender<ClientOp>,
    /// Local receivers per subscribed channel.
    subscribers: Subscribers,
    /// Connection status.
    status: Arc<RwLock<ConnectionStatus>>,
    /// Handle for shutdown.
    shutdown_tx: mpsc::Sender<()>,
}

impl WebSocketRelay {
    /// Start connecting to `url` in the background.
    pub fn connect(url: impl Into<String>) -> Self {
        let url = url.into();
        let (op_tx, op_rx) = mpsc::channel::<ClientOp>(OUTBOUND_QUEUE);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let status = Arc::new(RwLock::new(ConnectionStatus::Connecting));
        let subscribers = Subscribers::default();

        tokio::spawn(connection_loop(
            url,
            op_rx,
            shutdown_rx,
            subscribers.clone(),
            status.clone(),
        ));

        Self {
            tx: op_tx,
            subscribers,
            status,
            shutdown_tx,
        }
    }

    /// Get the current connection status.
    pub async fn status(&self) -> ConnectionStatus {
        self.status.read().await.clone()
    }

    /// Close the connection and stop reconnecting.
    pub fn disconnect(&self) {
        let _ = self.shutdown_tx.try_send(());
    }

    fn send(&self, op: ClientOp) -> Result<(), RelayError> {
        self.tx.try_send(op).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                RelayError::Transport("outbound queue full".into())
            }
            mpsc::error::TrySendError::Closed(_) => RelayError::Closed,
        })
    }
}

#[async_trait]
impl RelayTransport for WebSocketRelay {
    async fn subscribe(
        &self,
        channel: &ChannelName,
    ) -> Result<mpsc::UnboundedReceiver<RelayFrame>, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel.clone(), tx);

        // A queue overflow here is repaired by the resubscribe on reconnect
        if let Err(e) = self.send(ClientOp::Subscribe {
            channel: channel.clone(),
        }) {
            warn!(channel = %channel, error = %e, "Subscribe not sent");
        }
        Ok(rx)
    }

    async fn unsubscribe(&self, channel: &ChannelName) -> Result<(), RelayError> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(channel);

        self.send(ClientOp::Unsubscribe {
            channel: channel.clone(),
        })
    }

    async fn publish(&self, frame: RelayFrame) -> Result<(), RelayError> {
        self.send(ClientOp::Publish(frame))
    }
}

impl Drop for WebSocketRelay {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Main connection loop with reconnection logic.
async fn connection_loop(
    url: String,
    mut op_rx: mpsc::Receiver<ClientOp>,
    mut shutdown_rx: mpsc::Receiver<()>,
    subscribers: Subscribers,
    status: Arc<RwLock<ConnectionStatus>>,
) {
    let mut attempt = 0u32;
    let max_backoff = Duration::from_secs(30);

    loop {
        if shutdown_rx.try_recv().is_ok() {
            info!("Relay shutdown requested");
            *status.write().await = ConnectionStatus::Disconnected;
            return;
        }

        info!(url = %url, "Connecting to relay");
        *status.write().await = if attempt > 0 {
            ConnectionStatus::Reconnecting { attempt }
        } else {
            ConnectionStatus::Connecting
        };

        match connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => {
                info!("Relay connected");
                attempt = 0;
                *status.write().await = ConnectionStatus::Connected;

                let (mut write, mut read) = ws_stream.split();

                // Restore subscriptions held across the reconnect
                let mut restored = true;
                for op in resubscribe_ops(&subscribers) {
                    if let Err(e) = send_op(&mut write, &op).await {
                        error!("Failed to resubscribe: {}", e);
                        restored = false;
                        break;
                    }
                }

                // Handle messages until disconnected
                if restored {
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        route_server_message(&subscribers, text.as_str());
                                    }
                                    Some(Ok(Message::Ping(data))) => {
                                        if let Err(e) = write.send(Message::Pong(data)).await {
                                            warn!("Failed to send pong: {}", e);
                                        }
                                    }
                                    Some(Ok(Message::Close(_))) => {
                                        info!("Relay closed connection");
                                        break;
                                    }
                                    Some(Err(e)) => {
                                        error!("Relay WebSocket error: {}", e);
                                        break;
                                    }
                                    None => {
                                        info!("Relay stream ended");
                                        break;
                                    }
                                    _ => {}
                                }
                            }

                            op = op_rx.recv() => {
                                let Some(op) = op else {
                                    info!("Relay operation channel closed");
                                    let _ = write.send(Message::Close(None)).await;
                                    *status.write().await = ConnectionStatus::Disconnected;
                                    return;
                                };
                                if let Err(e) = send_op(&mut write, &op).await {
                                    error!("Failed to send relay operation: {}", e);
                                    break;
                                }
                            }

                            _ = shutdown_rx.recv() => {
                                info!("Shutdown received during connection");
                                let _ = write.send(Message::Close(None)).await;
                                *status.write().await = ConnectionStatus::Disconnected;
                                return;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                error!("Failed to connect to relay: {}", e);
            }
        }

        // Connection lost or failed - attempt reconnection
        *status.write().await = ConnectionStatus::Disconnected;

        attempt += 1;
        let backoff = backoff_for(attempt, max_backoff);
        info!("Reconnecting in {:?} (attempt {})", backoff, attempt);

        tokio::select! {
            () = tokio::time::sleep(backoff) => {}
            _ = shutdown_rx.recv() => {
                info!("Shutdown during reconnect backoff");
                return;
            }
        }
    }
}

fn backoff_for(attempt: u32, max: Duration) -> Duration {
    std::cmp::min(Duration::from_secs(2u64.pow(attempt.min(5))), max)
}

async fn send_op<S>(write: &mut S, op: &ClientOp) -> Result<(), RelayError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = serde_json::to_string(op)?;
    debug!("Sending: {}", json);
    write
        .send(Message::text(json))
        .await
        .map_err(|e| RelayError::Transport(e.to_string()))
}

fn resubscribe_ops(subscribers: &Subscribers) -> Vec<ClientOp> {
    subscribers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .keys()
        .map(|channel| ClientOp::Subscribe {
            channel: channel.clone(),
        })
        .collect()
}

/// Hand a server message to the subscriber of its channel.
fn route_server_message(subscribers: &Subscribers, text: &str) {
    match serde_json::from_str::<ServerOp>(text) {
        Ok(ServerOp::Message(frame)) => {
            let mut subscribers = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(tx) = subscribers.get(&frame.channel) else {
                debug!(channel = %frame.channel, "Frame for unsubscribed channel");
                return;
            };
            if tx.send(frame.clone()).is_err() {
                subscribers.remove(&frame.channel);
            }
        }
        Ok(ServerOp::Subscribed { channel }) => {
            debug!(channel = %channel, "Relay confirmed subscription");
        }
        Ok(ServerOp::Unsubscribed { channel }) => {
            debug!(channel = %channel, "Relay confirmed unsubscription");
        }
        Ok(ServerOp::Error { message }) => {
            warn!("Relay error: {}", message);
        }
        Err(e) => {
            warn!("Failed to parse relay message: {} - {}", e, text);
        }
    }
}
