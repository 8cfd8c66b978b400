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

//! Error types for the WebSocket subscription engine.

use thiserror::Error;

/// Result alias for WebSocket operations.
pub type TradeRepublicWsResult<T> = Result<T, TradeRepublicWsError>;

/// Errors raised by the WebSocket subscription engine.
#[derive(Debug, Error)]
pub enum TradeRepublicWsError {
    /// The client is not connected.
    #[error("Client error: {0}")]
    ClientError(String),
    /// The `connect` handshake failed or was rejected.
    #[error("Handshake error: {0}")]
    HandshakeError(String),
    /// An outbound frame could not be sent.
    #[error("Send error: {0}")]
    SendError(String),
    /// An inbound frame did not match the line protocol.
    #[error("Protocol violation: {0}")]
    ProtocolError(String),
    /// JSON (de)serialization failed.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    /// The operation timed out.
    #[error("Timeout: {0}")]
    Timeout(String),
    /// The session is no longer valid and cannot be refreshed.
    #[error("Session requires re-authentication")]
    ReauthRequired,
    /// Reconnection gave up after exhausting the retry budget.
    #[error("Reconnection exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    /// The server rejected or terminated a subscription.
    #[error("Server error for subscription {subscription_id}: {message}")]
    ServerError {
        subscription_id: u64,
        message: String,
    },
    /// Underlying transport failure.
    #[error("Transport error: {0}")]
    TransportError(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for TradeRepublicWsError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::TransportError(error.to_string())
    }
}
