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

//! Line-oriented wire codec and engine events.
//!
//! The protocol is text frames of the form `<verb> <id> <json>` outbound and
//! `<id> <code> <payload>` inbound, except for the literal `connected` handshake
//! acknowledgement. The inbound payload may be empty (e.g. `99 C `).

use serde_json::Value;

use crate::{
    common::consts::{WS_CLIENT_ID, WS_CONNECT_ACK, WS_PROTOCOL_VERSION},
    websocket::error::{TradeRepublicWsError, TradeRepublicWsResult},
};

/// Inbound frame type code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameCode {
    /// Full answer: complete current state for the subscription.
    Answer,
    /// Delta: compressed patch against the previous answer.
    Delta,
    /// Continue: the server terminated the subscription normally.
    Complete,
    /// Error: the server rejected or aborted the subscription.
    Error,
}

impl FrameCode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "A" => Some(Self::Answer),
            "D" => Some(Self::Delta),
            "C" => Some(Self::Complete),
            "E" => Some(Self::Error),
            _ => None,
        }
    }
}

/// A decoded inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundMessage {
    /// Handshake acknowledgement.
    Connected,
    /// A subscription-scoped frame.
    Frame {
        id: u64,
        code: FrameCode,
        payload: String,
    },
}

/// Decodes one inbound text frame.
///
/// # Errors
///
/// Returns [`TradeRepublicWsError::ProtocolError`] if the frame matches neither the
/// handshake acknowledgement nor the `<id> <code> <payload>` shape.
pub fn parse_inbound(text: &str) -> TradeRepublicWsResult<InboundMessage> {
    if text == WS_CONNECT_ACK {
        return Ok(InboundMessage::Connected);
    }

    let (id_part, rest) = text
        .split_once(' ')
        .ok_or_else(|| TradeRepublicWsError::ProtocolError(format!("Unframed message: {text}")))?;
    let id: u64 = id_part.parse().map_err(|_| {
        TradeRepublicWsError::ProtocolError(format!("Non-numeric subscription id: {id_part}"))
    })?;

    // The payload may be empty, in which case the code is the final token
    let (code_part, payload) = rest.split_once(' ').unwrap_or((rest, ""));
    let code = FrameCode::parse(code_part).ok_or_else(|| {
        TradeRepublicWsError::ProtocolError(format!("Unknown frame code: {code_part}"))
    })?;

    Ok(InboundMessage::Frame {
        id,
        code,
        payload: payload.to_string(),
    })
}

/// Encodes the `connect` handshake frame.
pub fn format_connect(locale: &str, session_token: Option<&str>) -> String {
    let mut payload = serde_json::json!({
        "locale": locale,
        "platformId": "webtrading",
        "clientId": WS_CLIENT_ID,
    });
    if let Some(token) = session_token {
        payload["sessionToken"] = Value::String(token.to_string());
    }
    format!("connect {WS_PROTOCOL_VERSION} {payload}")
}

/// Encodes a `sub` frame, injecting the session token into the payload.
///
/// # Errors
///
/// Returns an error if the subscription payload is not a JSON object.
pub fn format_sub(
    id: u64,
    payload: &Value,
    session_token: Option<&str>,
) -> TradeRepublicWsResult<String> {
    let mut payload = payload.clone();
    let obj = payload.as_object_mut().ok_or_else(|| {
        TradeRepublicWsError::ClientError("Subscription payload must be a JSON object".to_string())
    })?;
    if let Some(token) = session_token {
        obj.insert("token".to_string(), Value::String(token.to_string()));
    }
    Ok(format!("sub {id} {payload}"))
}

/// Encodes an `unsub` frame.
#[must_use]
pub fn format_unsub(id: u64) -> String {
    format!("unsub {id}")
}

/// Events surfaced to consumers of the engine's event stream.
#[derive(Clone, Debug)]
pub enum TradeRepublicWsEvent {
    /// The initial connection completed its handshake.
    Connected,
    /// A reconnection completed; active subscriptions were replayed.
    Reconnected,
    /// A full answer arrived for a subscription.
    Data {
        subscription_id: u64,
        payload: Value,
    },
    /// The server terminated a subscription with an error.
    ///
    /// `error` is the parsed JSON error payload, or the raw text wrapped in a JSON
    /// string when the payload is not valid JSON.
    SubscriptionError {
        subscription_id: u64,
        error: Value,
    },
    /// The server terminated a subscription normally.
    Completed { subscription_id: u64 },
    /// The session is dead and a new login is required; the engine has stopped.
    ReauthRequired,
    /// The retry budget was exhausted; the engine has stopped.
    ReconnectExhausted { attempts: u32 },
    /// The engine closed after an explicit disconnect.
    Closed,
}
