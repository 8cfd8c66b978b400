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

//! Client for the [Trade Republic](https://traderepublic.com) private API.
//!
//! Trade Republic exposes no public API; this crate implements the two tightly coupled
//! halves of its private surface:
//!
//! - **Device-bound authentication** — one-time device pairing of a client-generated
//!   P-256 key, phone number + PIN login with SMS/app two-factor challenges, short-lived
//!   session tokens (~290 s) with single-flight refresh, and durable session state.
//! - **Subscription streaming** — a single duplex WebSocket multiplexing many logical
//!   data feeds, with a `connect`/`connected` handshake, `sub`/`unsub` framing,
//!   `A`/`D`/`C`/`E` inbound dispatch, and reconnection with full resubscription.
//!
//! The remote surface is undocumented and may change without notice; inbound messages
//! that fail to parse are logged and dropped rather than terminating the feed.

pub mod auth;
pub mod common;
pub mod error;
pub mod websocket;

pub use crate::{
    auth::{
        api::{AuthApi, TradeRepublicAuthApi},
        client::{LoginResult, SessionGate, SessionValidity, TradeRepublicAuthClient},
        models::{AuthChallenge, AuthSession, AuthToken, LoginCredentials},
        store::SessionStore,
    },
    common::{
        credential::DeviceKeyVault,
        enums::{AuthState, ChallengeType, ConnectionState, WsChannel},
    },
    error::TradeRepublicError,
    websocket::{
        client::{TradeRepublicWebSocketClient, WsClientConfig},
        error::{TradeRepublicWsError, TradeRepublicWsResult},
        messages::TradeRepublicWsEvent,
        reconnect::ReconnectPolicy,
    },
};
