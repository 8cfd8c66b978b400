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

//! Integration tests for the WebSocket client using a mock Axum server.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use futures_util::{StreamExt, pin_mut};
use serde_json::{Value, json};
use traderepublic::{
    ReconnectPolicy, SessionGate, SessionValidity, TradeRepublicWebSocketClient,
    TradeRepublicWsEvent, WsChannel, WsClientConfig,
};

// ------------------------------------------------------------------------------------------------
// Test Helpers
// ------------------------------------------------------------------------------------------------

async fn wait_until_async<F, Fut>(cond: F, timeout: Duration)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Session gate double with switchable validity.
struct TestGate {
    token: String,
    // 0 = Valid, 1 = RequiresReauth, 2 = ServerUnreachable
    validity: AtomicU8,
}

impl TestGate {
    fn valid(token: &str) -> Arc<Self> {
        Arc::new(Self {
            token: token.to_string(),
            validity: AtomicU8::new(0),
        })
    }

    fn set_requires_reauth(&self) {
        self.validity.store(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionGate for TestGate {
    fn session_token(&self) -> Option<String> {
        Some(self.token.clone())
    }

    async fn ensure_valid_session(&self) -> SessionValidity {
        match self.validity.load(Ordering::SeqCst) {
            0 => SessionValidity::Valid,
            1 => SessionValidity::RequiresReauth,
            _ => SessionValidity::ServerUnreachable,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Test Server State
// ------------------------------------------------------------------------------------------------

#[derive(Default)]
struct TestServerState {
    connection_count: AtomicUsize,
    // (connection index, raw frame)
    sub_frames: tokio::sync::Mutex<Vec<(usize, String)>>,
    unsub_ids: tokio::sync::Mutex<Vec<u64>>,
    fail_sub_types: tokio::sync::Mutex<Vec<String>>,
    complete_sub_types: tokio::sync::Mutex<Vec<String>>,
    // Delay before answering a sub frame, in milliseconds
    answer_delay_ms: AtomicUsize,
    // Close the currently open connection once
    kick: AtomicBool,
    // Refuse every subsequent handshake
    refuse_handshakes: AtomicBool,
}

impl TestServerState {
    async fn sub_frames_for(&self, connection: usize) -> Vec<String> {
        self.sub_frames
            .lock()
            .await
            .iter()
            .filter(|(conn, _)| *conn == connection)
            .map(|(_, frame)| frame.clone())
            .collect()
    }
}

// ------------------------------------------------------------------------------------------------
// Mock WebSocket Handler
// ------------------------------------------------------------------------------------------------

async fn handle_ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<TestServerState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<TestServerState>) {
    let connection = state.connection_count.fetch_add(1, Ordering::SeqCst) + 1;

    if state.refuse_handshakes.load(Ordering::SeqCst) {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    // Expect the connect frame, then acknowledge
    let Some(Ok(Message::Text(text))) = socket.recv().await else {
        return;
    };
    if !text.as_str().starts_with("connect 31 ") {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }
    if socket.send(Message::Text("connected".into())).await.is_err() {
        return;
    }

    let mut kick_check = tokio::time::interval(Duration::from_millis(10));
    loop {
        tokio::select! {
            message = socket.recv() => {
                let Some(Ok(message)) = message else { break };
                match message {
                    Message::Text(text) => {
                        if handle_frame(&mut socket, &state, connection, text.as_str())
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Message::Ping(data) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            _ = kick_check.tick() => {
                if state.kick.swap(false, Ordering::SeqCst) {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }
}

async fn handle_frame(
    socket: &mut WebSocket,
    state: &TestServerState,
    connection: usize,
    text: &str,
) -> Result<(), axum::Error> {
    if let Some(rest) = text.strip_prefix("sub ") {
        let Some((id_part, json_part)) = rest.split_once(' ') else {
            return Ok(());
        };
        let id: u64 = id_part.parse().expect("non-numeric sub id");
        let payload: Value = serde_json::from_str(json_part).expect("invalid sub payload");
        let sub_type = payload["type"].as_str().unwrap_or_default().to_string();

        state
            .sub_frames
            .lock()
            .await
            .push((connection, text.to_string()));

        let delay = state.answer_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }

        if state.fail_sub_types.lock().await.contains(&sub_type) {
            let error = json!({"errors": [{"errorCode": "UNSUPPORTED"}]});
            socket.send(Message::Text(format!("{id} E {error}").into())).await?;
            return Ok(());
        }

        let answer = json!({"echo": sub_type});
        socket.send(Message::Text(format!("{id} A {answer}").into())).await?;

        if state.complete_sub_types.lock().await.contains(&sub_type) {
            socket.send(Message::Text(format!("{id} C ").into())).await?;
        }
    } else if let Some(rest) = text.strip_prefix("unsub ") {
        let id: u64 = rest.trim().parse().expect("non-numeric unsub id");
        state.unsub_ids.lock().await.push(id);
    }
    Ok(())
}

async fn start_ws_server(state: Arc<TestServerState>) -> SocketAddr {
    let router = Router::new()
        .route("/", get(handle_ws_upgrade))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind websocket listener");
    let addr = listener.local_addr().expect("missing local addr");

    tokio::spawn(async move {
        axum::serve(listener, router)
            .await
            .expect("websocket server failed");
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

fn create_test_client(
    addr: SocketAddr,
    gate: Arc<TestGate>,
) -> TradeRepublicWebSocketClient {
    let config = WsClientConfig {
        url: format!("ws://{addr}/"),
        handshake_timeout: Duration::from_millis(500),
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(20),
            max_attempts: 5,
        },
        ..WsClientConfig::default()
    };
    TradeRepublicWebSocketClient::new(config, gate)
}

fn spawn_event_collector(
    client: &mut TradeRepublicWebSocketClient,
) -> Arc<tokio::sync::Mutex<Vec<TradeRepublicWsEvent>>> {
    let events = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let sink = events.clone();
    let stream = client.stream();
    tokio::spawn(async move {
        pin_mut!(stream);
        while let Some(event) = stream.next().await {
            sink.lock().await.push(event);
        }
    });
    events
}

async fn has_event<F>(events: &tokio::sync::Mutex<Vec<TradeRepublicWsEvent>>, pred: F) -> bool
where
    F: Fn(&TradeRepublicWsEvent) -> bool,
{
    events.lock().await.iter().any(pred)
}

// ================================================================================================
// Connection Tests
// ================================================================================================

#[tokio::test]
async fn test_connect_and_subscribe_receives_answer() {
    let state = Arc::new(TestServerState::default());
    let addr = start_ws_server(state.clone()).await;
    let gate = TestGate::valid("tok-1");
    let mut client = create_test_client(addr, gate);
    let events = spawn_event_collector(&mut client);

    client.connect().await.expect("connect failed");
    client.wait_until_active(2.0).await.expect("not active");

    let received = Arc::new(tokio::sync::Mutex::new(Vec::<Value>::new()));
    let sink = received.clone();
    let id = client
        .subscribe(WsChannel::Ticker, json!({"type": "ticker", "id": "US0378331005"}), {
            move |value| {
                let sink = sink.clone();
                tokio::spawn(async move {
                    sink.lock().await.push(value);
                });
            }
        })
        .await
        .expect("subscribe failed");

    wait_until_async(
        || async { !received.lock().await.is_empty() },
        Duration::from_secs(2),
    )
    .await;
    assert_eq!(received.lock().await[0]["echo"], "ticker");

    // The session token is injected into the wire payload
    let frames = state.sub_frames_for(1).await;
    assert_eq!(frames.len(), 1);
    assert!(frames[0].starts_with(&format!("sub {id} ")));
    assert!(frames[0].contains(r#""token":"tok-1""#));

    wait_until_async(
        || async {
            has_event(&events, |e| {
                matches!(e, TradeRepublicWsEvent::Data { subscription_id, .. } if *subscription_id == id)
            })
            .await
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(has_event(&events, |e| matches!(e, TradeRepublicWsEvent::Connected)).await);

    client.disconnect().await;
}

#[tokio::test]
async fn test_subscribe_while_disconnected_is_sent_on_connect() {
    let state = Arc::new(TestServerState::default());
    let addr = start_ws_server(state.clone()).await;
    let gate = TestGate::valid("tok-1");
    let mut client = create_test_client(addr, gate);

    let id = client
        .subscribe(WsChannel::Portfolio, json!({"type": "portfolio"}), |_| {})
        .await
        .expect("subscribe failed");
    assert_eq!(client.subscription_count(), 1);

    client.connect().await.expect("connect failed");
    client.wait_until_active(2.0).await.expect("not active");

    wait_until_async(
        || async { !state.sub_frames_for(1).await.is_empty() },
        Duration::from_secs(2),
    )
    .await;
    assert!(state.sub_frames_for(1).await[0].starts_with(&format!("sub {id} ")));

    client.disconnect().await;
}

#[tokio::test]
async fn test_unsubscribe_notifies_server_and_clears_entry() {
    let state = Arc::new(TestServerState::default());
    let addr = start_ws_server(state.clone()).await;
    let gate = TestGate::valid("tok-1");
    let mut client = create_test_client(addr, gate);

    client.connect().await.expect("connect failed");
    client.wait_until_active(2.0).await.expect("not active");

    let id = client
        .subscribe(WsChannel::Cash, json!({"type": "cash"}), |_| {})
        .await
        .expect("subscribe failed");

    wait_until_async(
        || async { !state.sub_frames_for(1).await.is_empty() },
        Duration::from_secs(2),
    )
    .await;

    client.unsubscribe(id).await;
    assert_eq!(client.subscription_count(), 0);

    wait_until_async(
        || async { state.unsub_ids.lock().await.contains(&id) },
        Duration::from_secs(2),
    )
    .await;

    client.disconnect().await;
}

#[tokio::test]
async fn test_callback_never_fires_after_unsubscribe() {
    let state = Arc::new(TestServerState::default());
    state.answer_delay_ms.store(100, Ordering::SeqCst);
    let addr = start_ws_server(state.clone()).await;
    let gate = TestGate::valid("tok-1");
    let mut client = create_test_client(addr, gate);

    client.connect().await.expect("connect failed");
    client.wait_until_active(2.0).await.expect("not active");

    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    let id = client
        .subscribe(WsChannel::Ticker, json!({"type": "ticker"}), move |_| {
            flag.store(true, Ordering::SeqCst);
        })
        .await
        .expect("subscribe failed");

    // Unsubscribe before the delayed answer arrives
    client.unsubscribe(id).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!fired.load(Ordering::SeqCst));
    assert_eq!(client.subscription_count(), 0);

    client.disconnect().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unsubscribe_waits_for_inflight_callback() {
    let state = Arc::new(TestServerState::default());
    let addr = start_ws_server(state.clone()).await;
    let gate = TestGate::valid("tok-1");
    let mut client = create_test_client(addr, gate);

    client.connect().await.expect("connect failed");
    client.wait_until_active(2.0).await.expect("not active");

    let entered = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let entered_cb = entered.clone();
    let finished_cb = finished.clone();
    let id = client
        .subscribe(WsChannel::Ticker, json!({"type": "ticker"}), move |_| {
            entered_cb.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(150));
            finished_cb.store(true, Ordering::SeqCst);
        })
        .await
        .expect("subscribe failed");

    wait_until_async(
        || async { entered.load(Ordering::SeqCst) },
        Duration::from_secs(2),
    )
    .await;

    // Removal blocks on the entry guard held across the callback, so by the time
    // unsubscribe returns the callback has completed
    client.unsubscribe(id).await;
    assert!(finished.load(Ordering::SeqCst));

    client.disconnect().await;
}

#[tokio::test]
async fn test_bulk_subscribe_and_unsubscribe() {
    let state = Arc::new(TestServerState::default());
    let addr = start_ws_server(state.clone()).await;
    let gate = TestGate::valid("tok-1");
    let mut client = create_test_client(addr, gate);

    client.connect().await.expect("connect failed");
    client.wait_until_active(2.0).await.expect("not active");

    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    let ids = client
        .subscribe_many(
            vec![
                (WsChannel::Ticker, json!({"type": "ticker", "id": "A"})),
                (WsChannel::Ticker, json!({"type": "ticker", "id": "B"})),
                (WsChannel::Portfolio, json!({"type": "portfolio"})),
            ],
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await
        .expect("bulk subscribe failed");
    assert_eq!(ids.len(), 3);
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    wait_until_async(
        || async { received.load(Ordering::SeqCst) == 3 },
        Duration::from_secs(2),
    )
    .await;

    client.unsubscribe_many(&ids).await;
    assert_eq!(client.subscription_count(), 0);
    wait_until_async(
        || async { state.unsub_ids.lock().await.len() == 3 },
        Duration::from_secs(2),
    )
    .await;

    client.disconnect().await;
}

// ================================================================================================
// Server-Terminated Subscription Tests
// ================================================================================================

#[tokio::test]
async fn test_server_error_frame_removes_subscription() {
    let state = Arc::new(TestServerState::default());
    state.fail_sub_types.lock().await.push("ticker".to_string());
    let addr = start_ws_server(state.clone()).await;
    let gate = TestGate::valid("tok-1");
    let mut client = create_test_client(addr, gate);
    let events = spawn_event_collector(&mut client);

    client.connect().await.expect("connect failed");
    client.wait_until_active(2.0).await.expect("not active");

    let id = client
        .subscribe(WsChannel::Ticker, json!({"type": "ticker", "id": "XX"}), |_| {})
        .await
        .expect("subscribe failed");

    wait_until_async(
        || async {
            has_event(&events, |e| {
                matches!(
                    e,
                    TradeRepublicWsEvent::SubscriptionError { subscription_id, error }
                        if *subscription_id == id
                            && error["errors"][0]["errorCode"] == "UNSUPPORTED"
                )
            })
            .await
        },
        Duration::from_secs(2),
    )
    .await;
    assert_eq!(client.subscription_count(), 0);

    client.disconnect().await;
}

#[tokio::test]
async fn test_server_complete_frame_removes_subscription() {
    let state = Arc::new(TestServerState::default());
    state
        .complete_sub_types
        .lock()
        .await
        .push("timeline".to_string());
    let addr = start_ws_server(state.clone()).await;
    let gate = TestGate::valid("tok-1");
    let mut client = create_test_client(addr, gate);
    let events = spawn_event_collector(&mut client);

    client.connect().await.expect("connect failed");
    client.wait_until_active(2.0).await.expect("not active");

    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    let id = client
        .subscribe(WsChannel::Timeline, json!({"type": "timeline"}), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .expect("subscribe failed");

    wait_until_async(
        || async {
            has_event(&events, |e| {
                matches!(e, TradeRepublicWsEvent::Completed { subscription_id } if *subscription_id == id)
            })
            .await
        },
        Duration::from_secs(2),
    )
    .await;
    // The answer before the completion was still delivered
    assert_eq!(received.load(Ordering::SeqCst), 1);
    assert_eq!(client.subscription_count(), 0);

    client.disconnect().await;
}

// ================================================================================================
// Reconnection Tests
// ================================================================================================

#[tokio::test]
async fn test_reconnect_replays_active_subscriptions() {
    let state = Arc::new(TestServerState::default());
    let addr = start_ws_server(state.clone()).await;
    let gate = TestGate::valid("tok-1");
    let mut client = create_test_client(addr, gate);
    let events = spawn_event_collector(&mut client);

    client.connect().await.expect("connect failed");
    client.wait_until_active(2.0).await.expect("not active");

    for sub_type in ["ticker", "portfolio", "cash"] {
        client
            .subscribe(WsChannel::Ticker, json!({"type": sub_type}), |_| {})
            .await
            .expect("subscribe failed");
    }
    wait_until_async(
        || async { state.sub_frames_for(1).await.len() == 3 },
        Duration::from_secs(2),
    )
    .await;

    // Kill the connection server-side; the client must reconnect and replay
    state.kick.store(true, Ordering::SeqCst);

    wait_until_async(
        || async { state.sub_frames_for(2).await.len() == 3 },
        Duration::from_secs(5),
    )
    .await;
    wait_until_async(
        || async { has_event(&events, |e| matches!(e, TradeRepublicWsEvent::Reconnected)).await },
        Duration::from_secs(2),
    )
    .await;

    // Replayed frames carry the current token
    for frame in state.sub_frames_for(2).await {
        assert!(frame.contains(r#""token":"tok-1""#));
    }
    assert_eq!(client.subscription_count(), 3);

    client.disconnect().await;
}

#[tokio::test]
async fn test_reconnect_replay_sends_every_entry_despite_server_error() {
    let state = Arc::new(TestServerState::default());
    let addr = start_ws_server(state.clone()).await;
    let gate = TestGate::valid("tok-1");
    let mut client = create_test_client(addr, gate);
    let events = spawn_event_collector(&mut client);

    client.connect().await.expect("connect failed");
    client.wait_until_active(2.0).await.expect("not active");

    let mut ids = Vec::new();
    for sub_type in ["ticker", "portfolio", "cash"] {
        let id = client
            .subscribe(WsChannel::Ticker, json!({"type": sub_type}), |_| {})
            .await
            .expect("subscribe failed");
        ids.push(id);
    }
    wait_until_async(
        || async { state.sub_frames_for(1).await.len() == 3 },
        Duration::from_secs(2),
    )
    .await;

    // The server now rejects the first entry's type; the replay after the kick
    // must still send all three frames
    state.fail_sub_types.lock().await.push("ticker".to_string());
    state.kick.store(true, Ordering::SeqCst);

    wait_until_async(
        || async { state.sub_frames_for(2).await.len() == 3 },
        Duration::from_secs(5),
    )
    .await;
    wait_until_async(
        || async {
            has_event(&events, |e| {
                matches!(
                    e,
                    TradeRepublicWsEvent::SubscriptionError { subscription_id, .. }
                        if *subscription_id == ids[0]
                )
            })
            .await
        },
        Duration::from_secs(2),
    )
    .await;

    // Only the rejected entry was dropped from the table
    assert_eq!(client.subscription_count(), 2);

    client.disconnect().await;
}

#[tokio::test]
async fn test_reconnect_exhausts_after_budget() {
    let state = Arc::new(TestServerState::default());
    let addr = start_ws_server(state.clone()).await;
    let gate = TestGate::valid("tok-1");
    let config = WsClientConfig {
        url: format!("ws://{addr}/"),
        handshake_timeout: Duration::from_millis(200),
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(10),
            max_attempts: 2,
        },
        ..WsClientConfig::default()
    };
    let mut client = TradeRepublicWebSocketClient::new(config, gate);
    let events = spawn_event_collector(&mut client);

    client.connect().await.expect("connect failed");
    client.wait_until_active(2.0).await.expect("not active");

    state.refuse_handshakes.store(true, Ordering::SeqCst);
    state.kick.store(true, Ordering::SeqCst);

    wait_until_async(
        || async {
            has_event(&events, |e| {
                matches!(e, TradeRepublicWsEvent::ReconnectExhausted { attempts: 2 })
            })
            .await
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(!client.is_active());
}

#[tokio::test]
async fn test_dead_session_stops_reconnection() {
    let state = Arc::new(TestServerState::default());
    let addr = start_ws_server(state.clone()).await;
    let gate = TestGate::valid("tok-1");
    let mut client = create_test_client(addr, gate.clone());
    let events = spawn_event_collector(&mut client);

    client.connect().await.expect("connect failed");
    client.wait_until_active(2.0).await.expect("not active");

    // Invalidate the session, then kill the connection
    gate.set_requires_reauth();
    state.kick.store(true, Ordering::SeqCst);

    wait_until_async(
        || async { has_event(&events, |e| matches!(e, TradeRepublicWsEvent::ReauthRequired)).await },
        Duration::from_secs(5),
    )
    .await;
    // No reconnect attempt reached the server
    assert_eq!(state.connection_count.load(Ordering::SeqCst), 1);
    assert!(!client.is_active());
}

#[tokio::test]
async fn test_connect_refused_for_dead_session() {
    let state = Arc::new(TestServerState::default());
    let addr = start_ws_server(state.clone()).await;
    let gate = TestGate::valid("tok-1");
    gate.set_requires_reauth();
    let mut client = create_test_client(addr, gate);

    let err = client.connect().await.unwrap_err();
    assert!(matches!(
        err,
        traderepublic::TradeRepublicWsError::ReauthRequired
    ));
    assert_eq!(state.connection_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_disconnect_emits_closed() {
    let state = Arc::new(TestServerState::default());
    let addr = start_ws_server(state.clone()).await;
    let gate = TestGate::valid("tok-1");
    let mut client = create_test_client(addr, gate);
    let events = spawn_event_collector(&mut client);

    client.connect().await.expect("connect failed");
    client.wait_until_active(2.0).await.expect("not active");
    client.disconnect().await;

    wait_until_async(
        || async { has_event(&events, |e| matches!(e, TradeRepublicWsEvent::Closed)).await },
        Duration::from_secs(2),
    )
    .await;
    assert!(!client.is_active());
}
