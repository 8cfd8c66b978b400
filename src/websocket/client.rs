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

//! WebSocket client orchestrator.
//!
//! Owns the lifecycle of the connection task: connecting, spawning the feed handler,
//! and driving reconnection with subscription replay when the connection drops. All
//! live data is multiplexed over this one connection.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use futures_util::Stream;
use serde_json::Value;

use crate::{
    auth::client::{SessionGate, SessionValidity},
    common::{
        consts::{DEFAULT_HEARTBEAT_SECS, DEFAULT_LOCALE, HANDSHAKE_TIMEOUT_SECS, TRADE_REPUBLIC_WS_URL},
        enums::{AtomicConnectionState, ConnectionState, WsChannel},
    },
    websocket::{
        error::{TradeRepublicWsError, TradeRepublicWsResult},
        handler::{HandlerCommand, HandlerExit, Subscription, WsFeedHandler, WsStream, handshake},
        messages::TradeRepublicWsEvent,
        reconnect::{ReconnectManager, ReconnectPolicy, ReconnectStep},
    },
};

/// Configuration for [`TradeRepublicWebSocketClient`].
#[derive(Clone, Debug)]
pub struct WsClientConfig {
    pub url: String,
    pub locale: String,
    pub handshake_timeout: Duration,
    pub heartbeat: Option<Duration>,
    pub reconnect: ReconnectPolicy,
}

impl Default for WsClientConfig {
    fn default() -> Self {
        Self {
            url: TRADE_REPUBLIC_WS_URL.to_string(),
            locale: DEFAULT_LOCALE.to_string(),
            handshake_timeout: Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            heartbeat: Some(Duration::from_secs(DEFAULT_HEARTBEAT_SECS)),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Subscription protocol client over a single WebSocket connection.
///
/// Subscriptions registered while disconnected are queued in the table and replayed
/// on connect; the same replay path re-establishes them after a reconnect.
#[allow(missing_debug_implementations)]
pub struct TradeRepublicWebSocketClient {
    config: WsClientConfig,
    gate: Arc<dyn SessionGate>,
    connection_state: Arc<AtomicConnectionState>,
    signal: Arc<AtomicBool>,
    subscriptions: Arc<DashMap<u64, Subscription>>,
    cmd_tx: Arc<tokio::sync::RwLock<tokio::sync::mpsc::UnboundedSender<HandlerCommand>>>,
    out_tx: tokio::sync::mpsc::UnboundedSender<TradeRepublicWsEvent>,
    out_rx: Option<tokio::sync::mpsc::UnboundedReceiver<TradeRepublicWsEvent>>,
    id_counter: AtomicU64,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl TradeRepublicWebSocketClient {
    /// Creates a new client backed by the given session authority.
    #[must_use]
    pub fn new(config: WsClientConfig, gate: Arc<dyn SessionGate>) -> Self {
        let (out_tx, out_rx) = tokio::sync::mpsc::unbounded_channel();
        // Placeholder sender until connect installs the live one
        let (cmd_tx, _cmd_rx) = tokio::sync::mpsc::unbounded_channel();
        Self {
            config,
            gate,
            connection_state: Arc::new(AtomicConnectionState::new(ConnectionState::Disconnected)),
            signal: Arc::new(AtomicBool::new(false)),
            subscriptions: Arc::new(DashMap::new()),
            cmd_tx: Arc::new(tokio::sync::RwLock::new(cmd_tx)),
            out_tx,
            out_rx: Some(out_rx),
            id_counter: AtomicU64::new(1),
            task_handle: None,
        }
    }

    /// Returns the current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state.get()
    }

    /// Whether the connection is active and handshaken.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.connection_state.get() == ConnectionState::Authenticated
    }

    /// Number of entries in the subscription table.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Connects, performs the handshake, and spawns the connection task.
    ///
    /// # Errors
    ///
    /// Returns [`TradeRepublicWsError::ReauthRequired`] if the session is dead, or a
    /// transport/handshake error if the connection cannot be established.
    pub async fn connect(&mut self) -> TradeRepublicWsResult<()> {
        match self.gate.ensure_valid_session().await {
            SessionValidity::Valid => {}
            SessionValidity::RequiresReauth => return Err(TradeRepublicWsError::ReauthRequired),
            SessionValidity::ServerUnreachable => {
                return Err(TradeRepublicWsError::TransportError(
                    "Server unreachable".to_string(),
                ));
            }
        }

        self.signal.store(false, Ordering::Relaxed);
        self.connection_state.set(ConnectionState::Connecting);

        let token = self.gate.session_token();
        let stream = match handshake(
            &self.config.url,
            &self.config.locale,
            token.as_deref(),
            self.config.handshake_timeout,
            &self.connection_state,
        )
        .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.connection_state.set(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        self.connection_state.set(ConnectionState::Authenticated);

        let (cmd_tx, cmd_rx) = tokio::sync::mpsc::unbounded_channel();
        *self.cmd_tx.write().await = cmd_tx;

        let task = ConnectionTask {
            config: self.config.clone(),
            gate: self.gate.clone(),
            connection_state: self.connection_state.clone(),
            signal: self.signal.clone(),
            subscriptions: self.subscriptions.clone(),
            cmd_tx: self.cmd_tx.clone(),
            out_tx: self.out_tx.clone(),
        };
        self.task_handle = Some(tokio::spawn(task.run(stream, cmd_rx)));

        let _ = self.out_tx.send(TradeRepublicWsEvent::Connected);
        tracing::info!(url = %self.config.url, "Connected");
        Ok(())
    }

    /// Registers a subscription and sends it if connected.
    ///
    /// The callback is invoked once per full answer frame. Returns the subscription id.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a JSON object.
    pub async fn subscribe<F>(
        &self,
        channel: WsChannel,
        payload: Value,
        handler: F,
    ) -> TradeRepublicWsResult<u64>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        if !payload.is_object() {
            return Err(TradeRepublicWsError::ClientError(
                "Subscription payload must be a JSON object".to_string(),
            ));
        }

        let id = self.id_counter.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.insert(
            id,
            Subscription {
                id,
                channel,
                payload,
                handler: Arc::new(handler),
            },
        );

        if self.is_active() {
            // Send failure only means the handler is mid-reconnect; the replay
            // covers the entry then
            let _ = self
                .cmd_tx
                .read()
                .await
                .send(HandlerCommand::Subscribe { id });
        } else {
            tracing::debug!(subscription_id = id, "Queued subscription while disconnected");
        }
        Ok(id)
    }

    /// Registers several subscriptions sharing one callback.
    ///
    /// Returns the subscription ids in request order.
    ///
    /// # Errors
    ///
    /// Returns an error on the first payload that is not a JSON object; earlier
    /// entries in the batch stay registered.
    pub async fn subscribe_many<F>(
        &self,
        requests: Vec<(WsChannel, Value)>,
        handler: F,
    ) -> TradeRepublicWsResult<Vec<u64>>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let handler: Arc<dyn Fn(Value) + Send + Sync> = Arc::new(handler);
        let mut ids = Vec::with_capacity(requests.len());
        for (channel, payload) in requests {
            if !payload.is_object() {
                return Err(TradeRepublicWsError::ClientError(
                    "Subscription payload must be a JSON object".to_string(),
                ));
            }
            let id = self.id_counter.fetch_add(1, Ordering::Relaxed);
            self.subscriptions.insert(
                id,
                Subscription {
                    id,
                    channel,
                    payload,
                    handler: handler.clone(),
                },
            );
            if self.is_active() {
                let _ = self
                    .cmd_tx
                    .read()
                    .await
                    .send(HandlerCommand::Subscribe { id });
            }
            ids.push(id);
        }
        Ok(ids)
    }

    /// Removes a subscription, notifying the server when connected.
    ///
    /// The local entry is removed unconditionally so it is not replayed after a
    /// reconnect even if the wire notification cannot be delivered.
    pub async fn unsubscribe(&self, id: u64) {
        let removed = self.subscriptions.remove(&id).is_some();
        if !removed {
            tracing::debug!(subscription_id = id, "Unsubscribe for unknown subscription");
            return;
        }
        if self.is_active() {
            let _ = self
                .cmd_tx
                .read()
                .await
                .send(HandlerCommand::Unsubscribe { id });
        }
    }

    /// Removes several subscriptions.
    pub async fn unsubscribe_many(&self, ids: &[u64]) {
        for &id in ids {
            self.unsubscribe(id).await;
        }
    }

    /// Disconnects and stops the connection task.
    pub async fn disconnect(&mut self) {
        self.signal.store(true, Ordering::Relaxed);
        let _ = self.cmd_tx.read().await.send(HandlerCommand::Disconnect);
        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                tracing::error!("Connection task join failed: {e}");
            }
        }
        self.connection_state.set(ConnectionState::Disconnected);
        tracing::info!("Disconnected");
    }

    /// Returns the event stream.
    ///
    /// # Panics
    ///
    /// Panics if the stream has already been taken.
    pub fn stream(&mut self) -> impl Stream<Item = TradeRepublicWsEvent> + 'static {
        let mut rx = self.out_rx.take().expect("Stream receiver already taken");
        async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield event;
            }
        }
    }

    /// Waits until the connection is active, up to `timeout_secs`.
    ///
    /// # Errors
    ///
    /// Returns [`TradeRepublicWsError::Timeout`] if the connection does not become
    /// active in time.
    pub async fn wait_until_active(&self, timeout_secs: f64) -> TradeRepublicWsResult<()> {
        let timeout = Duration::from_secs_f64(timeout_secs);
        tokio::time::timeout(timeout, async {
            while !self.is_active() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .map_err(|_| TradeRepublicWsError::Timeout("Connection not active".to_string()))
    }
}

/// State captured by the spawned connection task.
struct ConnectionTask {
    config: WsClientConfig,
    gate: Arc<dyn SessionGate>,
    connection_state: Arc<AtomicConnectionState>,
    signal: Arc<AtomicBool>,
    subscriptions: Arc<DashMap<u64, Subscription>>,
    cmd_tx: Arc<tokio::sync::RwLock<tokio::sync::mpsc::UnboundedSender<HandlerCommand>>>,
    out_tx: tokio::sync::mpsc::UnboundedSender<TradeRepublicWsEvent>,
}

impl ConnectionTask {
    async fn run(
        self,
        mut stream: WsStream,
        mut cmd_rx: tokio::sync::mpsc::UnboundedReceiver<HandlerCommand>,
    ) {
        let mut manager = ReconnectManager::new(self.config.reconnect);

        loop {
            let mut handler = WsFeedHandler::new(
                self.signal.clone(),
                cmd_rx,
                self.out_tx.clone(),
                self.subscriptions.clone(),
                self.gate.clone(),
                stream,
                self.config.heartbeat,
            );
            let exit = handler.run().await;
            self.connection_state.set(ConnectionState::Disconnected);

            match exit {
                HandlerExit::Disconnect | HandlerExit::Stopped => {
                    let _ = self.out_tx.send(TradeRepublicWsEvent::Closed);
                    return;
                }
                HandlerExit::StreamClosed | HandlerExit::Transport(_) => {
                    tracing::warn!("Connection lost: {exit:?}");
                }
            }

            let Some(reconnected) = self.reconnect(&mut manager).await else {
                return;
            };
            manager.reset();
            stream = reconnected;

            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            *self.cmd_tx.write().await = tx;
            cmd_rx = rx;

            self.connection_state.set(ConnectionState::Authenticated);
            let _ = self.out_tx.send(TradeRepublicWsEvent::Reconnected);
            tracing::info!("Reconnected");
        }
    }

    /// Retries the connection per the backoff policy.
    ///
    /// Returns `None` once retries must stop; the terminal event has then already
    /// been emitted.
    async fn reconnect(&self, manager: &mut ReconnectManager) -> Option<WsStream> {
        loop {
            if self.signal.load(Ordering::Relaxed) {
                let _ = self.out_tx.send(TradeRepublicWsEvent::Closed);
                return None;
            }

            match manager.next_step(self.gate.as_ref()).await {
                ReconnectStep::ReauthRequired => {
                    tracing::warn!("Session requires re-authentication, stopping");
                    let _ = self.out_tx.send(TradeRepublicWsEvent::ReauthRequired);
                    return None;
                }
                ReconnectStep::Exhausted { attempts } => {
                    tracing::error!("Reconnection exhausted after {attempts} attempts");
                    let _ = self
                        .out_tx
                        .send(TradeRepublicWsEvent::ReconnectExhausted { attempts });
                    return None;
                }
                ReconnectStep::Backoff(delay) => {
                    tracing::info!("Reconnecting in {delay:?}");
                    tokio::time::sleep(delay).await;
                    if self.signal.load(Ordering::Relaxed) {
                        let _ = self.out_tx.send(TradeRepublicWsEvent::Closed);
                        return None;
                    }
                    self.connection_state.set(ConnectionState::Connecting);
                    let token = self.gate.session_token();
                    match handshake(
                        &self.config.url,
                        &self.config.locale,
                        token.as_deref(),
                        self.config.handshake_timeout,
                        &self.connection_state,
                    )
                    .await
                    {
                        Ok(stream) => return Some(stream),
                        Err(e) => {
                            tracing::debug!("Reconnect attempt failed: {e}");
                            self.connection_state.set(ConnectionState::Disconnected);
                        }
                    }
                }
            }
        }
    }
}
