// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2015-2025 Nautech Systems Pty Ltd. All rights reserved.
//  https://nautechsystems.io
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! WebSocket feed handler.
//!
//! The handler runs in a dedicated Tokio task as the I/O boundary between the client
//! orchestrator and the network layer. It exclusively owns the WebSocket stream and
//! processes commands from the client via an unbounded channel; frames are dispatched
//! against the shared subscription table.

use std::collections::HashSet;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message,
};

use crate::{
    auth::client::SessionGate,
    common::{
        consts::WS_CONNECT_ACK,
        enums::{AtomicConnectionState, ConnectionState, WsChannel},
    },
    websocket::{
        error::{TradeRepublicWsError, TradeRepublicWsResult},
        messages::{
            FrameCode, InboundMessage, TradeRepublicWsEvent, format_connect, format_sub,
            format_unsub, parse_inbound,
        },
    },
};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Callback invoked with each full answer payload for a subscription.
///
/// Runs on the handler task while the table entry is borrowed: it must return
/// promptly and must not touch the subscription table.
pub type SubscriptionHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// An active subscription in the shared table.
///
/// The stored payload never contains the session token; the token is injected at send
/// time so a replay after reconnection always carries the current one.
#[derive(Clone)]
pub struct Subscription {
    pub id: u64,
    pub channel: WsChannel,
    pub payload: Value,
    pub handler: SubscriptionHandler,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(Subscription))
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

/// Commands sent from the client to the handler.
#[derive(Debug)]
pub enum HandlerCommand {
    /// Send the `sub` frame for a table entry.
    Subscribe { id: u64 },
    /// Send the `unsub` frame.
    Unsubscribe { id: u64 },
    /// Close the connection and stop.
    Disconnect,
}

/// Why the handler's run loop ended.
#[derive(Debug)]
pub enum HandlerExit {
    /// An explicit disconnect was requested.
    Disconnect,
    /// All command senders were dropped.
    Stopped,
    /// The server closed the connection.
    StreamClosed,
    /// The transport failed.
    Transport(String),
}

/// Establishes the transport and performs the `connect` handshake.
///
/// # Errors
///
/// Returns an error if the transport cannot be established, the handshake is not
/// acknowledged within `timeout`, or the server replies with anything other than the
/// acknowledgement literal.
pub(crate) async fn handshake(
    url: &str,
    locale: &str,
    session_token: Option<&str>,
    timeout: Duration,
    state: &AtomicConnectionState,
) -> TradeRepublicWsResult<WsStream> {
    let (mut stream, _response) = tokio::time::timeout(timeout, connect_async(url))
        .await
        .map_err(|_| TradeRepublicWsError::Timeout("Transport connect".to_string()))??;
    state.set(ConnectionState::TransportOpen);

    let frame = format_connect(locale, session_token);
    stream.send(Message::Text(frame.into())).await?;

    let ack = tokio::time::timeout(timeout, async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return if text.as_str() == WS_CONNECT_ACK {
                        Ok(())
                    } else {
                        Err(TradeRepublicWsError::HandshakeError(format!(
                            "Unexpected handshake reply: {text}"
                        )))
                    };
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(other)) => {
                    return Err(TradeRepublicWsError::HandshakeError(format!(
                        "Unexpected handshake frame: {other:?}"
                    )));
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(TradeRepublicWsError::HandshakeError(
                        "Connection closed during handshake".to_string(),
                    ));
                }
            }
        }
    })
    .await
    .map_err(|_| TradeRepublicWsError::Timeout("Handshake acknowledgement".to_string()))?;

    ack?;
    tracing::debug!("Handshake acknowledged");
    Ok(stream)
}

/// Trade Republic WebSocket feed handler.
///
/// Runs in a dedicated Tokio task, processing commands and inbound frames until the
/// connection or the client goes away.
#[allow(missing_debug_implementations)]
pub struct WsFeedHandler {
    signal: Arc<AtomicBool>,
    cmd_rx: tokio::sync::mpsc::UnboundedReceiver<HandlerCommand>,
    out_tx: tokio::sync::mpsc::UnboundedSender<TradeRepublicWsEvent>,
    subscriptions: Arc<DashMap<u64, Subscription>>,
    gate: Arc<dyn SessionGate>,
    stream: WsStream,
    heartbeat: Option<Duration>,
    // Ids already sent on this connection; the table replay at loop start and a
    // `Subscribe` command queued before it may name the same id
    sent: HashSet<u64>,
}

impl WsFeedHandler {
    /// Creates a new feed handler over an established, handshaken stream.
    #[must_use]
    pub fn new(
        signal: Arc<AtomicBool>,
        cmd_rx: tokio::sync::mpsc::UnboundedReceiver<HandlerCommand>,
        out_tx: tokio::sync::mpsc::UnboundedSender<TradeRepublicWsEvent>,
        subscriptions: Arc<DashMap<u64, Subscription>>,
        gate: Arc<dyn SessionGate>,
        stream: WsStream,
        heartbeat: Option<Duration>,
    ) -> Self {
        Self {
            signal,
            cmd_rx,
            out_tx,
            subscriptions,
            gate,
            stream,
            heartbeat,
            sent: HashSet::new(),
        }
    }

    /// Sends the `sub` frame for the given table entry, at most once per connection.
    async fn send_sub(&mut self, id: u64) -> TradeRepublicWsResult<()> {
        if self.sent.contains(&id) {
            tracing::debug!(subscription_id = id, "Already subscribed on this connection");
            return Ok(());
        }
        let payload = match self.subscriptions.get(&id) {
            Some(entry) => entry.payload.clone(),
            None => {
                tracing::debug!(subscription_id = id, "Subscribe for removed entry, skipping");
                return Ok(());
            }
        };
        let token = self.gate.session_token();
        let frame = format_sub(id, &payload, token.as_deref())?;
        tracing::debug!(subscription_id = id, "Subscribing");
        self.stream
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| TradeRepublicWsError::SendError(e.to_string()))?;
        self.sent.insert(id);
        Ok(())
    }

    /// Replays every table entry onto the wire.
    ///
    /// Called once at loop start so queued and surviving subscriptions are sent the
    /// same way on first connect and after every reconnect.
    async fn flush_subscriptions(&mut self) -> TradeRepublicWsResult<()> {
        let mut ids: Vec<u64> = self.subscriptions.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "Replaying subscriptions");
        }
        for id in ids {
            self.send_sub(id).await?;
        }
        Ok(())
    }

    async fn process_command(&mut self, cmd: HandlerCommand) -> Option<HandlerExit> {
        match cmd {
            HandlerCommand::Subscribe { id } => {
                if let Err(e) = self.send_sub(id).await {
                    tracing::error!(subscription_id = id, "Subscribe send failed: {e}");
                    return Some(HandlerExit::Transport(e.to_string()));
                }
            }
            HandlerCommand::Unsubscribe { id } => {
                tracing::debug!(subscription_id = id, "Unsubscribing");
                self.sent.remove(&id);
                if let Err(e) = self.stream.send(Message::Text(format_unsub(id).into())).await {
                    tracing::error!(subscription_id = id, "Unsubscribe send failed: {e}");
                    return Some(HandlerExit::Transport(e.to_string()));
                }
            }
            HandlerCommand::Disconnect => {
                tracing::debug!("Disconnecting WebSocket");
                let _ = self.stream.close(None).await;
                return Some(HandlerExit::Disconnect);
            }
        }
        None
    }

    /// Dispatches one inbound text frame against the subscription table.
    fn dispatch(
        subscriptions: &DashMap<u64, Subscription>,
        out_tx: &tokio::sync::mpsc::UnboundedSender<TradeRepublicWsEvent>,
        text: &str,
    ) {
        let message = match parse_inbound(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping malformed frame: {e}");
                return;
            }
        };

        let InboundMessage::Frame { id, code, payload } = message else {
            tracing::debug!("Spurious handshake acknowledgement, ignoring");
            return;
        };

        match code {
            FrameCode::Answer => {
                let value: Value = match serde_json::from_str(&payload) {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!(subscription_id = id, "Dropping non-JSON answer: {e}");
                        return;
                    }
                };
                {
                    // Invoked under the entry guard; a concurrent removal blocks
                    // until the callback returns
                    let Some(entry) = subscriptions.get(&id) else {
                        tracing::debug!(subscription_id = id, "Answer for unknown subscription");
                        return;
                    };
                    (entry.handler)(value.clone());
                }
                let _ = out_tx.send(TradeRepublicWsEvent::Data {
                    subscription_id: id,
                    payload: value,
                });
            }
            FrameCode::Delta => {
                // Delta decoding is not supported; full answers carry the state
                tracing::debug!(subscription_id = id, "Ignoring delta frame");
            }
            FrameCode::Complete => {
                if subscriptions.remove(&id).is_some() {
                    tracing::debug!(subscription_id = id, "Subscription completed by server");
                    let _ = out_tx.send(TradeRepublicWsEvent::Completed {
                        subscription_id: id,
                    });
                } else {
                    tracing::debug!(subscription_id = id, "Complete for unknown subscription");
                }
            }
            FrameCode::Error => {
                if subscriptions.remove(&id).is_some() {
                    tracing::warn!(subscription_id = id, "Subscription failed: {payload}");
                    let error = serde_json::from_str(&payload)
                        .unwrap_or_else(|_| Value::String(payload));
                    let _ = out_tx.send(TradeRepublicWsEvent::SubscriptionError {
                        subscription_id: id,
                        error,
                    });
                } else {
                    tracing::warn!(subscription_id = id, "Error for unknown subscription: {payload}");
                }
            }
        }
    }

    /// Main message processing loop; returns why it stopped.
    pub async fn run(&mut self) -> HandlerExit {
        if let Err(e) = self.flush_subscriptions().await {
            return HandlerExit::Transport(e.to_string());
        }

        // A disabled heartbeat degrades to an hourly no-op tick
        let mut heartbeat = tokio::time::interval(
            self.heartbeat.unwrap_or(Duration::from_secs(3_600)),
        );
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await; // discard the immediate first tick

        loop {
            if self.signal.load(Ordering::Relaxed) {
                return HandlerExit::Stopped;
            }

            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if let Some(exit) = self.process_command(cmd).await {
                                return exit;
                            }
                        }
                        None => return HandlerExit::Stopped,
                    }
                }
                msg = self.stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            Self::dispatch(&self.subscriptions, &self.out_tx, &text);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = self.stream.send(Message::Pong(data)).await {
                                return HandlerExit::Transport(e.to_string());
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!("Server closed connection: {frame:?}");
                            return HandlerExit::StreamClosed;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!("Transport error: {e}");
                            return HandlerExit::Transport(e.to_string());
                        }
                        None => {
                            tracing::info!("Stream ended");
                            return HandlerExit::StreamClosed;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if self.heartbeat.is_some() {
                        if let Err(e) = self.stream.send(Message::Ping(Vec::new().into())).await {
                            return HandlerExit::Transport(e.to_string());
                        }
                    }
                }
            }
        }
    }
}
