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

//! Error types for authentication and REST operations.

use thiserror::Error;

use crate::auth::models::AuthChallenge;

/// Error types for the Trade Republic authentication layer.
#[derive(Debug, Clone, Error)]
pub enum TradeRepublicError {
    /// Local input validation failure; never reaches the network.
    #[error("Format error in {field}: {message}")]
    Format {
        /// The offending input field.
        field: &'static str,
        /// What was wrong with it.
        message: String,
    },
    /// The remote rejected the supplied credentials or token.
    #[error("Authentication error: {0}")]
    Authentication(String),
    /// A two-factor challenge is open and awaits a code.
    ///
    /// This is a resumable control-flow signal rather than a terminal failure: the
    /// carried challenge can be answered again until it expires.
    #[error("Two-factor challenge {} pending ({} digit code)", .0.challenge_id, .0.code_length)]
    TwoFactorRequired(AuthChallenge),
    /// The remote applied rate limiting.
    #[error("Rate limited by remote")]
    RateLimited {
        /// Optional server-advised wait in seconds.
        retry_after_secs: Option<u64>,
    },
    /// The session expired, locally or remotely detected.
    #[error("Session expired: {0}")]
    SessionExpired(String),
    /// No device identity is resident; pairing is required before login.
    #[error("Device not paired")]
    DeviceNotPaired,
    /// Transport-level failure, distinct from an authorization failure.
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),
    /// Malformed or unexpected remote response.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// Persistent state could not be written.
    #[error("Store error: {0}")]
    Store(String),
}

impl TradeRepublicError {
    /// Whether this error invalidates the current session.
    ///
    /// Only authorization failures force session invalidation; transport failures are
    /// left to the reconnection layer.
    #[must_use]
    pub fn invalidates_session(&self) -> bool {
        matches!(self, Self::Authentication(_) | Self::SessionExpired(_))
    }
}

impl From<reqwest::Error> for TradeRepublicError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_connect() || error.is_timeout() {
            Self::NetworkUnreachable(error.to_string())
        } else if error.is_decode() {
            Self::Protocol(error.to_string())
        } else {
            Self::Authentication(error.to_string())
        }
    }
}
