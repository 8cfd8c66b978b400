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

//! Constants for Trade Republic API endpoints and protocol parameters.

/// Trade Republic REST API base URL.
pub const TRADE_REPUBLIC_API_URL: &str = "https://api.traderepublic.com";

/// Trade Republic WebSocket URL.
pub const TRADE_REPUBLIC_WS_URL: &str = "wss://api.traderepublic.com";

/// Device pairing initiation endpoint.
pub const AUTH_RESET_DEVICE_PATH: &str = "/api/v1/auth/account/reset/device";

/// Login endpoint.
pub const AUTH_LOGIN_PATH: &str = "/api/v1/auth/login";

/// Session refresh endpoint.
pub const AUTH_SESSION_PATH: &str = "/api/v1/auth/session";

/// Lightweight reachability probe endpoint.
pub const AUTH_PING_PATH: &str = "/api/v1/auth/ping";

/// Protocol version sent in the WebSocket `connect` handshake.
pub const WS_PROTOCOL_VERSION: u32 = 31;

/// Literal acknowledgement expected after the `connect` handshake.
pub const WS_CONNECT_ACK: &str = "connected";

/// Client identity reported in the `connect` envelope.
pub const WS_CLIENT_ID: &str = "app.traderepublic.com";

/// Default locale for the `connect` envelope.
pub const DEFAULT_LOCALE: &str = "en";

/// Nominal session token lifetime in seconds.
///
/// Tokens are short-lived by contract; dependents must never assume long-lived tokens.
pub const SESSION_TOKEN_LIFETIME_SECS: i64 = 290;

/// Maximum session age in hours before forced re-authentication.
pub const SESSION_MAX_AGE_HOURS: i64 = 24;

/// Timeout for the `connect`/`connected` handshake in seconds.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Default WebSocket heartbeat interval in seconds.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;

/// Default reconnect backoff base delay in milliseconds.
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 5_000;

/// Default maximum number of reconnect attempts.
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 10;

/// User agent reported on REST requests.
pub const TRADE_REPUBLIC_USER_AGENT: &str = concat!("traderepublic-rs/", env!("CARGO_PKG_VERSION"));
