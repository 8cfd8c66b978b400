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

//! Reconnection backoff policy and attempt tracking.

use std::time::Duration;

use crate::{
    auth::client::{SessionGate, SessionValidity},
    common::consts::{DEFAULT_RECONNECT_BASE_DELAY_MS, DEFAULT_RECONNECT_MAX_ATTEMPTS},
};

/// Exponential backoff policy: the n-th attempt waits `base_delay * 2^(n-1)`.
#[derive(Clone, Copy, Debug)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_DELAY_MS),
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Returns the delay before the given 1-based attempt, or `None` once the
    /// retry budget is exhausted.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1)?;
        Some(
            self.base_delay
                .checked_mul(factor)
                .unwrap_or(Duration::MAX),
        )
    }
}

/// Next action decided by the [`ReconnectManager`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectStep {
    /// Wait this long, then attempt to reconnect.
    Backoff(Duration),
    /// The session is dead; stop retrying and demand a new login.
    ReauthRequired,
    /// The retry budget is exhausted; stop retrying.
    Exhausted { attempts: u32 },
}

/// Tracks consecutive reconnection attempts against a policy.
#[derive(Debug)]
pub struct ReconnectManager {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl ReconnectManager {
    #[must_use]
    pub const fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Records a successful connection, resetting the attempt counter.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Decides the next step after a connection loss or failed attempt.
    ///
    /// The session gate is consulted before scheduling a retry: reconnecting with a
    /// dead session would only fail the handshake again. An unreachable server is
    /// retried since the outage may be on either side.
    pub async fn next_step(&mut self, gate: &dyn SessionGate) -> ReconnectStep {
        self.attempt += 1;
        let Some(delay) = self.policy.delay_for(self.attempt) else {
            return ReconnectStep::Exhausted {
                attempts: self.policy.max_attempts,
            };
        };

        match gate.ensure_valid_session().await {
            SessionValidity::RequiresReauth => ReconnectStep::ReauthRequired,
            SessionValidity::Valid | SessionValidity::ServerUnreachable => {
                ReconnectStep::Backoff(delay)
            }
        }
    }
}
