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

//! Enumerations for authentication and connection state.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Lifecycle state of the authentication state machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, AsRefStr, Display, EnumIter)]
pub enum AuthState {
    /// No device identity exists.
    #[default]
    Unpaired,
    /// A pairing challenge has been issued and awaits completion.
    PairingInitiated,
    /// A device identity is registered with the remote.
    Paired,
    /// Paired but no active session.
    LoggedOut,
    /// Login issued a two-factor challenge awaiting a response.
    AwaitingMfa,
    /// A valid session is active.
    Authenticated,
    /// The session expired and must be re-established.
    Expired,
}

/// Delivery channel of a two-factor challenge.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, AsRefStr, Display, EnumString, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum ChallengeType {
    /// Code delivered by SMS.
    Sms,
    /// Code confirmed in the paired mobile app.
    App,
    /// Code delivered by email.
    Email,
}

/// Logical data feed types multiplexed over the WebSocket connection.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, AsRefStr, Display, EnumIter, EnumString, Serialize,
    Deserialize,
)]
pub enum WsChannel {
    /// Real-time price quotes for an ISIN.
    #[strum(serialize = "ticker")]
    #[serde(rename = "ticker")]
    Ticker,
    /// Portfolio positions and valuations.
    #[strum(serialize = "portfolio")]
    #[serde(rename = "portfolio")]
    Portfolio,
    /// Cash balances.
    #[strum(serialize = "cash")]
    #[serde(rename = "cash")]
    Cash,
    /// Account activity timeline.
    #[strum(serialize = "timeline")]
    #[serde(rename = "timeline")]
    Timeline,
    /// Instrument metadata.
    #[strum(serialize = "instrument")]
    #[serde(rename = "instrument")]
    Instrument,
    /// Aggregated price history.
    #[strum(serialize = "aggregateHistory")]
    #[serde(rename = "aggregateHistory")]
    AggregateHistory,
}

/// Connection-level state of the subscription protocol engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, AsRefStr, Display)]
#[repr(u8)]
pub enum ConnectionState {
    /// No transport.
    #[default]
    Disconnected = 0,
    /// Transport being established.
    Connecting = 1,
    /// Transport open, handshake in flight.
    TransportOpen = 2,
    /// Handshake acknowledged; subscriptions may flow.
    Authenticated = 3,
}

impl ConnectionState {
    /// Returns the state encoded as a `u8` for atomic storage.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decodes a state from its `u8` representation, defaulting to `Disconnected`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::TransportOpen,
            3 => Self::Authenticated,
            _ => Self::Disconnected,
        }
    }
}

/// Atomic cell holding a [`ConnectionState`], shared between the client and its handler task.
#[derive(Debug, Default)]
pub struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    /// Creates a new cell in the given state.
    #[must_use]
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    /// Returns the current state.
    #[must_use]
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Transitions to the given state.
    pub fn set(&self, state: ConnectionState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}
