//! Client side of the signaling channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::SignalingError;
use crate::protocol::{ClientMessage, ServerMessage, SessionId};
use crate::relay::Relay;

const CHANNEL_CAPACITY: usize = 100;
const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);

/// An open signaling connection with the session id the relay minted for it.
///
/// `receive` returning `None` means the connection is gone.
pub struct SignalingClient {
    session_id: SessionId,
    tx: mpsc::Sender<ClientMessage>,
    rx: mpsc::Receiver<ServerMessage>,
}

impl SignalingClient {
    pub fn new(
        session_id: SessionId,
        tx: mpsc::Sender<ClientMessage>,
        rx: mpsc::Receiver<ServerMessage>,
    ) -> Self {
        Self { session_id, tx, rx }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
        self.tx.send(msg).await.map_err(|_| SignalingError::Closed)
    }

    pub async fn receive(&mut self) -> Option<ServerMessage> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self) -> Result<SignalingClient, SignalingError>;
}

/// Connects to a relay over WebSocket.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl SignalingConnector for WsConnector {
    async fn connect(&self) -> Result<SignalingClient, SignalingError> {
        let (ws_stream, _) = connect_async(self.url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<ClientMessage>(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "Could not encode signaling message");
                        continue;
                    }
                };
                if write.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(error = %e, "Signaling read failed");
                        break;
                    }
                };
                match decode(&text) {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Dropping relay frame"),
                }
            }
        });

        let welcome = tokio::time::timeout(WELCOME_TIMEOUT, rx.recv())
            .await
            .map_err(|_| SignalingError::Unavailable("no welcome from relay".into()))?;
        match welcome {
            Some(ServerMessage::Welcome { session_id }) => {
                debug!(session = %session_id, url = %self.url, "Signaling connected");
                Ok(SignalingClient::new(session_id, outgoing_tx, rx))
            }
            Some(other) => Err(SignalingError::Unavailable(format!(
                "expected welcome, got {other:?}"
            ))),
            None => Err(SignalingError::Closed),
        }
    }
}

fn decode(text: &str) -> Result<ServerMessage, SignalingError> {
    Ok(serde_json::from_str(text)?)
}

/// Connects straight to an in-process [`Relay`].
///
/// Reachability can be switched off and live connections severed, which is
/// how outages are simulated.
#[derive(Clone)]
pub struct LocalConnector {
    relay: Relay,
    available: Arc<AtomicBool>,
    sever: Arc<watch::Sender<u64>>,
}

impl LocalConnector {
    pub fn new(relay: Relay) -> Self {
        let (sever, _) = watch::channel(0);
        Self {
            relay,
            available: Arc::new(AtomicBool::new(true)),
            sever: Arc::new(sever),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Drop every connection opened through this connector.
    pub fn sever(&self) {
        self.sever.send_modify(|epoch| *epoch += 1);
    }
}

#[async_trait]
impl SignalingConnector for LocalConnector {
    async fn connect(&self) -> Result<SignalingClient, SignalingError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(SignalingError::Unavailable("relay unreachable".into()));
        }

        let (session_id, mut relay_rx) = self.relay.connect().await;
        match relay_rx.recv().await {
            Some(ServerMessage::Welcome { .. }) => {}
            _ => return Err(SignalingError::Closed),
        }

        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(CHANNEL_CAPACITY);
        let mut severed = self.sever.subscribe();
        let relay = self.relay.clone();
        let id = session_id.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = out_rx.recv() => match msg {
                        Some(msg) => relay.handle(&id, msg).await,
                        None => break,
                    },
                    msg = relay_rx.recv() => match msg {
                        Some(msg) => {
                            if in_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = severed.changed() => break,
                }
            }
            relay.disconnect(&id).await;
        });

        Ok(SignalingClient::new(session_id, out_tx, in_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::AllowAll;
    use crate::room::InMemoryRegistry;

    fn relay() -> Relay {
        Relay::new(Arc::new(InMemoryRegistry::new()), Arc::new(AllowAll))
    }

    #[tokio::test]
    async fn local_connection_joins_through_relay() {
        let relay = relay();
        let connector = LocalConnector::new(relay.clone());
        let mut client = connector.connect().await.unwrap();
        client
            .send(ClientMessage::Join {
                room_id: "r".into(),
                display_name: "Ann".into(),
                user_id: None,
            })
            .await
            .unwrap();
        match client.receive().await {
            Some(ServerMessage::JoinResult { accepted, .. }) => assert!(accepted),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(relay.members("r").await.len(), 1);
    }

    #[tokio::test]
    async fn unavailable_relay_refuses_connections() {
        let connector = LocalConnector::new(relay());
        connector.set_available(false);
        let err = connector.connect().await.err().unwrap();
        assert!(matches!(err, SignalingError::Unavailable(_)));
    }

    #[tokio::test]
    async fn refused_websocket_surfaces_as_ws_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = WsConnector::new(format!("ws://{addr}"))
            .connect()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SignalingError::Ws(_)));
    }

    #[test]
    fn unknown_relay_frames_are_malformed() {
        let err = decode("{\"message_type\":\"Teleport\"}").unwrap_err();
        assert!(matches!(err, SignalingError::Malformed(_)));
        assert!(decode("{\"message_type\":\"ParticipantLeft\",\"session_id\":\"b\"}").is_ok());
    }

    #[tokio::test]
    async fn severing_ends_the_stream_and_frees_membership() {
        let relay = relay();
        let connector = LocalConnector::new(relay.clone());
        let mut client = connector.connect().await.unwrap();
        client
            .send(ClientMessage::Join {
                room_id: "r".into(),
                display_name: "Ann".into(),
                user_id: None,
            })
            .await
            .unwrap();
        client.receive().await.unwrap();

        connector.sever();
        assert!(client.receive().await.is_none());
        assert!(relay.members("r").await.is_empty());
        assert_eq!(relay.connection_count().await, 0);
    }
}
