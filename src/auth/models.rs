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

//! Data structures for the authentication lifecycle and REST payloads.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    common::{
        consts::{SESSION_MAX_AGE_HOURS, SESSION_TOKEN_LIFETIME_SECS},
        enums::ChallengeType,
    },
    error::TradeRepublicError,
};

/// Phone number and PIN credentials for pairing and login.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginCredentials {
    /// Phone number in E.164 format (e.g. `+4915212345678`).
    pub phone_number: String,
    /// Four digit account PIN.
    pub pin: String,
}

impl LoginCredentials {
    /// Creates new credentials.
    #[must_use]
    pub fn new(phone_number: impl Into<String>, pin: impl Into<String>) -> Self {
        Self {
            phone_number: phone_number.into(),
            pin: pin.into(),
        }
    }

    /// Validates the credential formats locally, before any network call.
    ///
    /// # Errors
    ///
    /// Returns [`TradeRepublicError::Format`] if the phone number is not E.164 or the
    /// PIN is not exactly four digits.
    pub fn validate(&self) -> Result<(), TradeRepublicError> {
        let digits = self.phone_number.strip_prefix('+').ok_or_else(|| {
            TradeRepublicError::Format {
                field: "phone_number",
                message: "must start with '+' (E.164)".to_string(),
            }
        })?;
        if digits.len() < 8 || digits.len() > 15 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TradeRepublicError::Format {
                field: "phone_number",
                message: "must be 8-15 digits after '+'".to_string(),
            });
        }
        if self.pin.len() != 4 || !self.pin.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TradeRepublicError::Format {
                field: "pin",
                message: "must be exactly 4 digits".to_string(),
            });
        }
        Ok(())
    }
}

/// Ephemeral two-factor challenge issued per pairing or login attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthChallenge {
    /// Server-side process identifier binding challenge responses to this attempt.
    pub challenge_id: String,
    /// How the code is delivered.
    pub challenge_type: ChallengeType,
    /// Human readable prompt from the server.
    pub message: String,
    /// When the challenge stops accepting responses.
    pub expires_at: DateTime<Utc>,
    /// Expected code length, supplied per challenge rather than assumed globally.
    pub code_length: usize,
}

impl AuthChallenge {
    /// Whether the challenge can no longer be answered.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Bearer token pair owned by an [`AuthSession`], rotated in place on refresh.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthToken {
    /// Short-lived access token presented on authenticated calls.
    pub access_token: String,
    /// Longer-lived token used to obtain fresh access tokens.
    pub refresh_token: String,
    /// Access token expiry.
    pub expires_at: DateTime<Utc>,
    /// Token scheme, typically `Bearer`.
    pub token_type: String,
}

impl AuthToken {
    /// Whether the access token has expired.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Rotates the token pair in place.
    ///
    /// `expires_at` is clamped to never decrease across refreshes of the same session,
    /// holding the monotonicity invariant even against a skewed server clock.
    pub fn rotate(
        &mut self,
        access_token: String,
        refresh_token: String,
        expires_at: DateTime<Utc>,
    ) {
        self.access_token = access_token;
        self.refresh_token = refresh_token;
        self.expires_at = self.expires_at.max(expires_at);
    }
}

/// Root aggregate for an authenticated session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthSession {
    /// The live token pair.
    pub token: AuthToken,
    /// User identifier extracted from the login response.
    pub user_id: String,
    /// Client-generated session identifier.
    pub session_id: String,
    /// When the session was established.
    pub created_at: DateTime<Utc>,
    /// Last activity on the session.
    pub last_activity: DateTime<Utc>,
}

impl AuthSession {
    /// Whether the session is usable: token unexpired and session younger than the
    /// 24 hour maximum age.
    #[must_use]
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        !self.token.is_expired(now)
            && now - self.created_at < Duration::hours(SESSION_MAX_AGE_HOURS)
    }

    /// Whether the session exceeded its maximum age regardless of token state.
    #[must_use]
    pub fn is_over_max_age(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at >= Duration::hours(SESSION_MAX_AGE_HOURS)
    }

    /// Records activity on the session.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }
}

fn default_countdown() -> i64 {
    120
}

fn default_challenge_type() -> ChallengeType {
    ChallengeType::Sms
}

fn default_code_length() -> usize {
    4
}

const fn default_expires_in() -> i64 {
    SESSION_TOKEN_LIFETIME_SECS
}

/// Server response announcing a pairing or login challenge.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeResponse {
    /// Server-side process identifier.
    pub process_id: String,
    /// Seconds until the challenge expires.
    #[serde(default = "default_countdown")]
    pub countdown_in_seconds: i64,
    /// Delivery channel of the code.
    #[serde(default = "default_challenge_type")]
    pub challenge_type: ChallengeType,
    /// Expected code length for this challenge.
    #[serde(default = "default_code_length")]
    pub code_length: usize,
    /// Optional server prompt.
    #[serde(default)]
    pub message: Option<String>,
}

impl ChallengeResponse {
    /// Converts the wire response into an [`AuthChallenge`] anchored at `now`.
    #[must_use]
    pub fn into_challenge(self, now: DateTime<Utc>) -> AuthChallenge {
        AuthChallenge {
            challenge_id: self.process_id,
            challenge_type: self.challenge_type,
            message: self.message.unwrap_or_default(),
            expires_at: now + Duration::seconds(self.countdown_in_seconds),
            code_length: self.code_length,
        }
    }
}

/// Server response carrying a session token pair.
///
/// Used for both login completion and refresh; the undocumented API has shipped the
/// user identifier in several locations over time, so all of them are retained for
/// the pluggable extraction strategy.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    /// Access token for the new or refreshed session.
    pub session_token: String,
    /// Refresh token paired with it.
    pub refresh_token: String,
    /// Token lifetime in seconds.
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
    /// Optional embedded user object.
    #[serde(default)]
    pub user: Option<serde_json::Value>,
    /// Optional top-level account identifier (legacy response shape).
    #[serde(default)]
    pub id: Option<String>,
    /// Token scheme if reported.
    #[serde(default)]
    pub token_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn token(expires_at: DateTime<Utc>) -> AuthToken {
        AuthToken {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at,
            token_type: "Bearer".to_string(),
        }
    }

    #[rstest]
    #[case("+4915212345678", "1234", true)]
    #[case("+123456789", "0000", true)]
    #[case("(4915212345678", "1234", false)] // missing '+'
    #[case("+49152abc5678", "1234", false)] // non-digits
    #[case("+491", "1234", false)] // too short
    #[case("+4915212345678", "123", false)] // pin too short
    #[case("+4915212345678", "12a4", false)] // pin non-digit
    fn test_credential_format_validation(
        #[case] phone: &str,
        #[case] pin: &str,
        #[case] valid: bool,
    ) {
        let result = LoginCredentials::new(phone, pin).validate();
        assert_eq!(result.is_ok(), valid);
        if let Err(e) = result {
            assert!(matches!(e, TradeRepublicError::Format { .. }));
        }
    }

    #[rstest]
    fn test_token_rotation_never_decreases_expiry() {
        let now = Utc::now();
        let mut tok = token(now + Duration::seconds(290));

        // A refresh reporting an earlier expiry must not move expires_at backwards
        tok.rotate("a2".to_string(), "r2".to_string(), now + Duration::seconds(100));
        assert_eq!(tok.expires_at, now + Duration::seconds(290));
        assert_eq!(tok.access_token, "a2");

        tok.rotate("a3".to_string(), "r3".to_string(), now + Duration::seconds(600));
        assert_eq!(tok.expires_at, now + Duration::seconds(600));
    }

    #[rstest]
    fn test_session_validity_window() {
        let now = Utc::now();
        let session = AuthSession {
            token: token(now + Duration::seconds(290)),
            user_id: "user-1".to_string(),
            session_id: "session-1".to_string(),
            created_at: now,
            last_activity: now,
        };
        assert!(session.is_valid(now));
        assert!(!session.is_valid(now + Duration::seconds(300)));

        let stale = AuthSession {
            created_at: now - Duration::hours(25),
            token: token(now + Duration::seconds(290)),
            ..session
        };
        assert!(!stale.is_valid(now));
        assert!(stale.is_over_max_age(now));
    }

    #[rstest]
    fn test_challenge_response_defaults() {
        let json = r#"{"processId": "proc-1"}"#;
        let response: ChallengeResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.code_length, 4);
        assert_eq!(response.challenge_type, ChallengeType::Sms);

        let now = Utc::now();
        let challenge = response.into_challenge(now);
        assert_eq!(challenge.challenge_id, "proc-1");
        assert!(!challenge.is_expired(now));
        assert!(challenge.is_expired(now + Duration::seconds(121)));
    }

    #[rstest]
    fn test_challenge_code_length_is_per_challenge() {
        let json = r#"{"processId": "proc-2", "challengeType": "SMS", "codeLength": 6}"#;
        let response: ChallengeResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.code_length, 6);
    }
}
