//! WebSocket front end for the relay: accept loop, per-connection pump and
//! the membership reaper.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use super::Relay;
use crate::config::RelayConfig;
use crate::protocol::{ClientMessage, ServerMessage};

/// Serve signaling connections until the listener fails.
pub async fn run(listener: TcpListener, relay: Relay, config: RelayConfig) {
    let reaper_relay = relay.clone();
    let membership_timeout = config.membership_timeout();
    let reap_interval = config.reap_interval();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(reap_interval);
        loop {
            tick.tick().await;
            let reaped = reaper_relay.reap_idle(membership_timeout).await;
            if !reaped.is_empty() {
                tracing::debug!(count = reaped.len(), "Reaper tick");
            }
        }
    });

    let ping_interval = config.ping_interval();
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let relay = relay.clone();
                tokio::spawn(async move {
                    match accept_async(stream).await {
                        Ok(ws) => handle_connection(ws, addr, relay, ping_interval).await,
                        Err(e) => {
                            tracing::warn!(peer = %addr, error = %e, "WS handshake failed");
                        }
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "TCP accept error");
            }
        }
    }
}

/// Pump one WebSocket connection until either side goes away.
pub async fn handle_connection(
    ws: WebSocketStream<TcpStream>,
    addr: SocketAddr,
    relay: Relay,
    ping_interval: Duration,
) {
    let (mut sink, mut stream) = ws.split();
    let (session_id, mut rx) = relay.connect().await;
    tracing::info!(peer = %addr, session = %session_id, "Client connected");

    let mut ping = tokio::time::interval(ping_interval);
    ping.tick().await;

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(msg) = outbound else { break };
                if send_message(&mut sink, &msg).await.is_err() {
                    break;
                }
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => relay.handle(&session_id, msg).await,
                            Err(e) => {
                                tracing::debug!(peer = %addr, error = %e, "Unparseable frame");
                                relay.touch(&session_id).await;
                                let reply = ServerMessage::Error {
                                    message: format!("invalid message: {e}"),
                                };
                                if send_message(&mut sink, &reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        relay.touch(&session_id).await;
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => relay.touch(&session_id).await,
                    Some(Err(e)) => {
                        tracing::debug!(peer = %addr, error = %e, "WS error");
                        break;
                    }
                }
            }

            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::info!(peer = %addr, session = %session_id, "Client disconnected");
    relay.disconnect(&session_id).await;
}

async fn send_message(
    sink: &mut futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>,
    msg: &ServerMessage,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let json = serde_json::to_string(msg).unwrap_or_else(|_| "{}".to_string());
    sink.send(Message::Text(json)).await
}
