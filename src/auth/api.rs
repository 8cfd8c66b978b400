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

//! Remote auth endpoint collaborator.
//!
//! The [`AuthApi`] trait is the seam between the authentication state machine and the
//! network; [`TradeRepublicAuthApi`] is the production implementation over the
//! undocumented REST surface.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::{
    auth::models::{ChallengeResponse, LoginCredentials, LoginResponse},
    common::consts::{
        AUTH_LOGIN_PATH, AUTH_PING_PATH, AUTH_RESET_DEVICE_PATH, AUTH_SESSION_PATH,
        TRADE_REPUBLIC_API_URL, TRADE_REPUBLIC_USER_AGENT,
    },
    error::TradeRepublicError,
};

/// Device-signed login request.
#[derive(Clone, Debug)]
pub struct SignedLoginRequest {
    /// Phone number and PIN.
    pub credentials: LoginCredentials,
    /// Identifier of the paired device.
    pub device_id: String,
    /// Signing timestamp in Unix milliseconds.
    pub timestamp_ms: i64,
    /// Base64 device signature over `"{timestamp}.{body}"`.
    pub signature: String,
}

/// Outcome of a login call: either a session, or a two-factor challenge to resolve.
#[derive(Clone, Debug)]
pub enum LoginOutcome {
    /// Credentials and device signature were accepted outright.
    Session(LoginResponse),
    /// The server demands a two-factor code before issuing a session.
    MfaRequired(ChallengeResponse),
}

/// Remote authentication endpoints consumed by the state machine.
#[async_trait]
pub trait AuthApi: Send + Sync {
    /// Starts a device pairing process, returning the server challenge.
    async fn initiate_pairing(
        &self,
        credentials: &LoginCredentials,
    ) -> Result<ChallengeResponse, TradeRepublicError>;

    /// Completes pairing by answering the challenge and registering the device public key.
    async fn complete_pairing(
        &self,
        process_id: &str,
        code: &str,
        device_public_key: &str,
    ) -> Result<(), TradeRepublicError>;

    /// Logs in with device-signed credentials.
    async fn login(&self, request: &SignedLoginRequest)
    -> Result<LoginOutcome, TradeRepublicError>;

    /// Answers a login two-factor challenge.
    async fn complete_mfa(
        &self,
        process_id: &str,
        code: &str,
    ) -> Result<LoginResponse, TradeRepublicError>;

    /// Exchanges a refresh token for a fresh token pair.
    async fn refresh(
        &self,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<LoginResponse, TradeRepublicError>;

    /// Lightweight reachability probe. Succeeds on any HTTP response.
    async fn ping(&self) -> Result<(), TradeRepublicError>;

    /// Server-side session validation. `Ok(false)` means the session was rejected.
    async fn validate_session(&self, access_token: &str) -> Result<bool, TradeRepublicError>;

    /// Terminates the session remotely.
    async fn logout(&self, access_token: &str) -> Result<(), TradeRepublicError>;
}

/// Maps a non-success HTTP status to the error taxonomy.
///
/// `session_scoped` distinguishes calls authorized by a session token (401/403 means
/// the session died) from credential submissions (401/403 means bad credentials).
fn map_status_error(
    status: u16,
    body: &str,
    retry_after_secs: Option<u64>,
    session_scoped: bool,
) -> TradeRepublicError {
    match status {
        429 => TradeRepublicError::RateLimited { retry_after_secs },
        401 | 403 if session_scoped => {
            TradeRepublicError::SessionExpired(format!("HTTP {status}: {body}"))
        }
        400 | 401 | 403 => TradeRepublicError::Authentication(format!("HTTP {status}: {body}")),
        _ => TradeRepublicError::Protocol(format!("Unexpected HTTP {status}: {body}")),
    }
}

/// Production [`AuthApi`] implementation over the Trade Republic REST surface.
#[derive(Clone, Debug)]
pub struct TradeRepublicAuthApi {
    base_url: String,
    client: reqwest::Client,
}

impl TradeRepublicAuthApi {
    /// Creates a new API client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(TRADE_REPUBLIC_USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            base_url: base_url.unwrap_or_else(|| TRADE_REPUBLIC_API_URL.to_string()),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn into_checked_body(
        response: reqwest::Response,
        session_scoped: bool,
    ) -> Result<String, TradeRepublicError> {
        let status = response.status();
        let retry_after_secs = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body = response.text().await.unwrap_or_default();

        if status.is_success() {
            Ok(body)
        } else {
            Err(map_status_error(
                status.as_u16(),
                &body,
                retry_after_secs,
                session_scoped,
            ))
        }
    }
}

#[async_trait]
impl AuthApi for TradeRepublicAuthApi {
    async fn initiate_pairing(
        &self,
        credentials: &LoginCredentials,
    ) -> Result<ChallengeResponse, TradeRepublicError> {
        let response = self
            .client
            .post(self.url(AUTH_RESET_DEVICE_PATH))
            .json(credentials)
            .send()
            .await?;
        let body = Self::into_checked_body(response, false).await?;
        serde_json::from_str(&body)
            .map_err(|e| TradeRepublicError::Protocol(format!("Invalid pairing response: {e}")))
    }

    async fn complete_pairing(
        &self,
        process_id: &str,
        code: &str,
        device_public_key: &str,
    ) -> Result<(), TradeRepublicError> {
        let response = self
            .client
            .post(self.url(&format!("{AUTH_RESET_DEVICE_PATH}/{process_id}/key")))
            .json(&json!({ "code": code, "deviceKey": device_public_key }))
            .send()
            .await?;
        Self::into_checked_body(response, false).await?;
        Ok(())
    }

    async fn login(
        &self,
        request: &SignedLoginRequest,
    ) -> Result<LoginOutcome, TradeRepublicError> {
        let response = self
            .client
            .post(self.url(AUTH_LOGIN_PATH))
            .header("X-Zeta-Timestamp", request.timestamp_ms.to_string())
            .header("X-Zeta-Signature", &request.signature)
            .header("X-Zeta-Device", &request.device_id)
            .json(&request.credentials)
            .send()
            .await?;
        let body = Self::into_checked_body(response, false).await?;

        // A login that requires a second factor answers with a challenge process
        // instead of a token pair.
        let value: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| TradeRepublicError::Protocol(format!("Invalid login response: {e}")))?;
        if value.get("processId").is_some() {
            let challenge = serde_json::from_value(value).map_err(|e| {
                TradeRepublicError::Protocol(format!("Invalid login challenge: {e}"))
            })?;
            return Ok(LoginOutcome::MfaRequired(challenge));
        }
        let login = serde_json::from_value(value)
            .map_err(|e| TradeRepublicError::Protocol(format!("Invalid login session: {e}")))?;
        Ok(LoginOutcome::Session(login))
    }

    async fn complete_mfa(
        &self,
        process_id: &str,
        code: &str,
    ) -> Result<LoginResponse, TradeRepublicError> {
        let response = self
            .client
            .post(self.url(&format!("{AUTH_LOGIN_PATH}/{process_id}/{code}")))
            .send()
            .await?;
        let body = Self::into_checked_body(response, false).await?;
        serde_json::from_str(&body)
            .map_err(|e| TradeRepublicError::Protocol(format!("Invalid MFA response: {e}")))
    }

    async fn refresh(
        &self,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<LoginResponse, TradeRepublicError> {
        let response = self
            .client
            .post(self.url(AUTH_SESSION_PATH))
            .bearer_auth(access_token)
            .json(&json!({ "refreshToken": refresh_token }))
            .send()
            .await?;
        let body = Self::into_checked_body(response, true).await?;
        serde_json::from_str(&body)
            .map_err(|e| TradeRepublicError::Protocol(format!("Invalid refresh response: {e}")))
    }

    async fn ping(&self) -> Result<(), TradeRepublicError> {
        // Any HTTP response proves reachability; only transport failures count
        self.client.get(self.url(AUTH_PING_PATH)).send().await?;
        Ok(())
    }

    async fn validate_session(&self, access_token: &str) -> Result<bool, TradeRepublicError> {
        let response = self
            .client
            .get(self.url(AUTH_SESSION_PATH))
            .bearer_auth(access_token)
            .send()
            .await?;
        match response.status().as_u16() {
            status if (200..300).contains(&status) => Ok(true),
            401 | 403 => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(map_status_error(status, &body, None, true))
            }
        }
    }

    async fn logout(&self, access_token: &str) -> Result<(), TradeRepublicError> {
        let response = self
            .client
            .delete(self.url(AUTH_SESSION_PATH))
            .bearer_auth(access_token)
            .send()
            .await?;
        // A dead session is already logged out
        if response.status().as_u16() == 401 || response.status().as_u16() == 403 {
            return Ok(());
        }
        Self::into_checked_body(response, true).await?;
        Ok(())
    }
}
