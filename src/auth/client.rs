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

//! Authentication state machine.
//!
//! Owns the device key vault and the live session, and drives the lifecycle
//! `Unpaired → PairingInitiated → Paired → LoggedOut ⇄ AwaitingMfa → Authenticated →
//! Expired → LoggedOut`. Token refresh is single-flight: concurrent callers share one
//! in-flight network refresh rather than issuing duplicates.

use std::sync::{
    Arc, Mutex, PoisonError, RwLock,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::{
    auth::{
        api::{AuthApi, LoginOutcome, SignedLoginRequest},
        models::{AuthChallenge, AuthSession, AuthToken, LoginCredentials, LoginResponse},
        store::SessionStore,
    },
    common::{credential::DeviceKeyVault, enums::AuthState},
    error::TradeRepublicError,
};

/// Strategy extracting the user id from a login response.
///
/// The undocumented API has shipped the identifier in several response shapes; the
/// strategy is pluggable so callers can pin one without forking the client.
pub type UserIdExtractor = Arc<dyn Fn(&LoginResponse) -> Option<String> + Send + Sync>;

fn default_user_id_extractor() -> UserIdExtractor {
    Arc::new(|response: &LoginResponse| {
        response
            .user
            .as_ref()
            .and_then(|user| user.get("id"))
            .and_then(|id| id.as_str())
            .map(str::to_string)
            .or_else(|| response.id.clone())
    })
}

/// Result of [`TradeRepublicAuthClient::ensure_valid_session`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionValidity {
    /// The session was validated server-side.
    Valid,
    /// The session is dead; the local copy has already been cleared.
    RequiresReauth,
    /// The remote could not be reached; the session may still be good.
    ServerUnreachable,
}

/// Outcome of [`TradeRepublicAuthClient::login`].
#[derive(Clone, Debug)]
pub enum LoginResult {
    /// A session was established outright.
    Authenticated,
    /// A two-factor challenge must be answered via `handle_mfa`.
    MfaRequired(AuthChallenge),
}

/// Session authority consumed by the subscription protocol engine.
///
/// `session_token` is read at send time for every outbound frame so a concurrent
/// refresh is reflected on any resend; `ensure_valid_session` gates reconnect attempts.
#[async_trait]
pub trait SessionGate: Send + Sync {
    /// Returns the current access token, if a session is resident.
    fn session_token(&self) -> Option<String>;

    /// Validates the session locally and against the remote.
    async fn ensure_valid_session(&self) -> SessionValidity;
}

/// Authentication state machine for the Trade Republic private API.
pub struct TradeRepublicAuthClient {
    api: Arc<dyn AuthApi>,
    store: SessionStore,
    vault: RwLock<Option<DeviceKeyVault>>,
    pending_vault: Mutex<Option<DeviceKeyVault>>,
    pending_challenge: RwLock<Option<AuthChallenge>>,
    session: RwLock<Option<AuthSession>>,
    state: RwLock<AuthState>,
    refresh_lock: tokio::sync::Mutex<()>,
    refresh_generation: AtomicU64,
    user_id_extractor: UserIdExtractor,
}

impl std::fmt::Debug for TradeRepublicAuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(TradeRepublicAuthClient))
            .field("state", &self.state())
            .field("has_device", &self.has_device())
            .field("has_session", &self.read_session().is_some())
            .finish_non_exhaustive()
    }
}

impl TradeRepublicAuthClient {
    /// Creates a client, restoring any persisted device identity and session.
    ///
    /// Structurally invalid persisted state loads as absent and degrades to the
    /// corresponding earlier lifecycle state rather than failing.
    #[must_use]
    pub fn new(api: Arc<dyn AuthApi>, store: SessionStore) -> Self {
        let vault = store
            .load_device()
            .and_then(|record| match DeviceKeyVault::from_record(&record) {
                Ok(vault) => Some(vault),
                Err(e) => {
                    tracing::warn!("Discarding unusable persisted device identity: {e}");
                    None
                }
            });

        let now = Utc::now();
        // A session is only meaningful alongside the device identity it was bound to
        let session = if vault.is_some() {
            store.load_session().filter(|s| {
                if s.is_valid(now) {
                    true
                } else {
                    tracing::info!("Persisted session expired, discarding");
                    false
                }
            })
        } else {
            None
        };

        let state = match (&vault, &session) {
            (Some(_), Some(_)) => AuthState::Authenticated,
            (Some(_), None) => AuthState::LoggedOut,
            (None, _) => AuthState::Unpaired,
        };

        Self {
            api,
            store,
            vault: RwLock::new(vault),
            pending_vault: Mutex::new(None),
            pending_challenge: RwLock::new(None),
            session: RwLock::new(session),
            state: RwLock::new(state),
            refresh_lock: tokio::sync::Mutex::new(()),
            refresh_generation: AtomicU64::new(0),
            user_id_extractor: default_user_id_extractor(),
        }
    }

    /// Replaces the user id extraction strategy.
    #[must_use]
    pub fn with_user_id_extractor(mut self, extractor: UserIdExtractor) -> Self {
        self.user_id_extractor = extractor;
        self
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> AuthState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a device identity is resident.
    #[must_use]
    pub fn has_device(&self) -> bool {
        self.vault
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Whether a locally valid session is resident.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        let now = Utc::now();
        self.read_session().is_some_and(|s| s.is_valid(now))
    }

    /// Returns the user id of the active session.
    #[must_use]
    pub fn user_id(&self) -> Option<String> {
        self.read_session().map(|s| s.user_id)
    }

    /// Returns the `Authorization` header for the active session.
    #[must_use]
    pub fn get_auth_header(&self) -> Option<(&'static str, String)> {
        self.read_session()
            .map(|s| ("Authorization", format!("{} {}", s.token.token_type, s.token.access_token)))
    }

    /// Initiates device pairing.
    ///
    /// Validates credential formats locally before any network call, then requests a
    /// pairing challenge from the remote. A fresh device key is generated and held
    /// pending; it is only installed once the challenge is answered correctly.
    ///
    /// # Errors
    ///
    /// Returns [`TradeRepublicError::Format`] on invalid credentials (no network call
    /// is made), [`TradeRepublicError::RateLimited`] on remote backpressure, or the
    /// mapped remote error.
    pub async fn initiate_device_pairing(
        &self,
        credentials: &LoginCredentials,
    ) -> Result<AuthChallenge, TradeRepublicError> {
        credentials.validate()?;

        let response = self.api.initiate_pairing(credentials).await?;
        let challenge = response.into_challenge(Utc::now());

        let vault = DeviceKeyVault::generate()
            .map_err(|e| TradeRepublicError::Store(format!("Device key generation failed: {e}")))?;
        *self
            .pending_vault
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(vault);

        *self
            .pending_challenge
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(challenge.clone());
        self.set_state(AuthState::PairingInitiated);

        tracing::info!(
            challenge_id = %challenge.challenge_id,
            code_length = challenge.code_length,
            "Device pairing initiated"
        );
        Ok(challenge)
    }

    /// Completes device pairing with the out-of-band code.
    ///
    /// An incorrect code re-raises the *same* challenge as
    /// [`TradeRepublicError::TwoFactorRequired`] so the caller can retry without
    /// restarting pairing, until the challenge expires.
    ///
    /// # Errors
    ///
    /// Returns an error if no pairing is in progress, the challenge expired, the code
    /// format does not match the challenge, or the remote rejects the completion.
    pub async fn complete_device_pairing(&self, code: &str) -> Result<(), TradeRepublicError> {
        let challenge = self
            .read_pending_challenge()
            .ok_or_else(|| TradeRepublicError::Authentication("No pairing in progress".to_string()))?;

        let now = Utc::now();
        if challenge.is_expired(now) {
            self.clear_pending_challenge();
            self.set_state(AuthState::Unpaired);
            return Err(TradeRepublicError::Authentication(
                "Pairing challenge expired".to_string(),
            ));
        }

        if code.len() != challenge.code_length || !code.bytes().all(|b| b.is_ascii_digit()) {
            // Local rejection; the challenge stays open
            return Err(TradeRepublicError::Format {
                field: "code",
                message: format!("expected {} digits", challenge.code_length),
            });
        }

        let public_key = {
            let guard = self
                .pending_vault
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            guard
                .as_ref()
                .map(DeviceKeyVault::public_key_b64)
                .ok_or_else(|| {
                    TradeRepublicError::Authentication("No pending device key".to_string())
                })?
        };

        match self
            .api
            .complete_pairing(&challenge.challenge_id, code, &public_key)
            .await
        {
            Ok(()) => {
                let vault = self
                    .pending_vault
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                    .ok_or_else(|| {
                        TradeRepublicError::Authentication("No pending device key".to_string())
                    })?;
                self.store.save_device(&vault.to_record())?;
                *self.vault.write().unwrap_or_else(PoisonError::into_inner) = Some(vault);
                self.clear_pending_challenge();
                self.set_state(AuthState::Paired);
                tracing::info!("Device paired");
                Ok(())
            }
            Err(e) if e.invalidates_session() && !challenge.is_expired(Utc::now()) => {
                // Wrong code: resumable against the same challenge until expiry
                tracing::debug!(challenge_id = %challenge.challenge_id, "Pairing code rejected");
                Err(TradeRepublicError::TwoFactorRequired(challenge))
            }
            Err(e) => Err(e),
        }
    }

    /// Logs in with device-signed credentials.
    ///
    /// Requires a resident device identity; a missing identity fails with
    /// [`TradeRepublicError::DeviceNotPaired`] rather than silently generating a new
    /// one, since a new identity would invalidate the server-side pairing.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid credential formats, a missing device identity, or
    /// remote rejection.
    pub async fn login(
        &self,
        credentials: &LoginCredentials,
    ) -> Result<LoginResult, TradeRepublicError> {
        credentials.validate()?;

        let timestamp_ms = Utc::now().timestamp_millis();
        let (device_id, signature) = {
            let guard = self.vault.read().unwrap_or_else(PoisonError::into_inner);
            let vault = guard.as_ref().ok_or(TradeRepublicError::DeviceNotPaired)?;
            let payload = serde_json::to_string(credentials)
                .map_err(|e| TradeRepublicError::Protocol(format!("Payload encoding failed: {e}")))?;
            let signature = vault.sign(&payload, timestamp_ms).map_err(|e| {
                TradeRepublicError::Authentication(format!("Device signing failed: {e}"))
            })?;
            (vault.device_id().to_string(), signature)
        };

        let request = SignedLoginRequest {
            credentials: credentials.clone(),
            device_id,
            timestamp_ms,
            signature,
        };

        match self.api.login(&request).await? {
            LoginOutcome::Session(response) => {
                self.install_session(response)?;
                Ok(LoginResult::Authenticated)
            }
            LoginOutcome::MfaRequired(challenge) => {
                let challenge = challenge.into_challenge(Utc::now());
                *self
                    .pending_challenge
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(challenge.clone());
                self.set_state(AuthState::AwaitingMfa);
                tracing::info!(
                    challenge_id = %challenge.challenge_id,
                    challenge_type = %challenge.challenge_type,
                    "Two-factor challenge issued"
                );
                Ok(LoginResult::MfaRequired(challenge))
            }
        }
    }

    /// Answers a login two-factor challenge.
    ///
    /// Mismatched challenge ids and expired challenges are rejected before any network
    /// call. Success fully supersedes the AwaitingMFA state with a new session.
    ///
    /// # Errors
    ///
    /// Returns an error if the challenge does not match, expired, or the remote
    /// rejects the code. A wrong code on an unexpired challenge is returned as the
    /// resumable [`TradeRepublicError::TwoFactorRequired`].
    pub async fn handle_mfa(
        &self,
        challenge_id: &str,
        code: &str,
    ) -> Result<(), TradeRepublicError> {
        let challenge = self.read_pending_challenge().ok_or_else(|| {
            TradeRepublicError::Authentication("No two-factor challenge pending".to_string())
        })?;

        if challenge.challenge_id != challenge_id {
            return Err(TradeRepublicError::Authentication(format!(
                "Challenge id mismatch: expected {}",
                challenge.challenge_id
            )));
        }
        let now = Utc::now();
        if challenge.is_expired(now) {
            self.clear_pending_challenge();
            self.set_state(AuthState::LoggedOut);
            return Err(TradeRepublicError::Authentication(
                "Two-factor challenge expired".to_string(),
            ));
        }
        if code.len() != challenge.code_length || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TradeRepublicError::Format {
                field: "code",
                message: format!("expected {} digits", challenge.code_length),
            });
        }

        match self.api.complete_mfa(&challenge.challenge_id, code).await {
            Ok(response) => {
                self.clear_pending_challenge();
                self.install_session(response)?;
                Ok(())
            }
            Err(e) if e.invalidates_session() && !challenge.is_expired(Utc::now()) => {
                tracing::debug!(challenge_id = %challenge.challenge_id, "MFA code rejected");
                Err(TradeRepublicError::TwoFactorRequired(challenge))
            }
            Err(e) => Err(e),
        }
    }

    /// Refreshes the session token pair in place.
    ///
    /// Single-flight: at most one network refresh is in flight per session; concurrent
    /// callers wait and share its outcome. An authorization failure invalidates the
    /// entire session atomically; transport failures leave it untouched.
    ///
    /// # Errors
    ///
    /// Returns [`TradeRepublicError::SessionExpired`] if no session exists or the
    /// refresh was rejected, or [`TradeRepublicError::NetworkUnreachable`] on
    /// transport failure.
    pub async fn refresh_token(&self) -> Result<(), TradeRepublicError> {
        let entry_generation = self.refresh_generation.load(Ordering::Acquire);
        let _guard = self.refresh_lock.lock().await;

        if self.refresh_generation.load(Ordering::Acquire) != entry_generation {
            // A concurrent caller completed a refresh while we waited; share its outcome
            let now = Utc::now();
            return if self.read_session().is_some_and(|s| s.is_valid(now)) {
                Ok(())
            } else {
                Err(TradeRepublicError::SessionExpired(
                    "Concurrent refresh failed".to_string(),
                ))
            };
        }

        let (access_token, refresh_token) = self
            .read_session()
            .map(|s| (s.token.access_token, s.token.refresh_token))
            .ok_or_else(|| TradeRepublicError::SessionExpired("No active session".to_string()))?;

        let result = self.api.refresh(&access_token, &refresh_token).await;
        self.refresh_generation.fetch_add(1, Ordering::AcqRel);

        match result {
            Ok(response) => {
                let now = Utc::now();
                let expires_at = now + Duration::seconds(response.expires_in);
                let snapshot = {
                    let mut guard = self.session.write().unwrap_or_else(PoisonError::into_inner);
                    let session = guard.as_mut().ok_or_else(|| {
                        TradeRepublicError::SessionExpired("Session vanished during refresh".to_string())
                    })?;
                    session
                        .token
                        .rotate(response.session_token, response.refresh_token, expires_at);
                    session.touch(now);
                    session.clone()
                };
                self.store.save_session(&snapshot)?;
                tracing::debug!(expires_at = %snapshot.token.expires_at, "Session token refreshed");
                Ok(())
            }
            Err(e) if e.invalidates_session() => {
                tracing::warn!("Token refresh rejected, invalidating session: {e}");
                self.clear_session(AuthState::Expired);
                Err(TradeRepublicError::SessionExpired(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Validates the session: local expiry, remote reachability, then server-side
    /// validation. On `RequiresReauth` the local session has already been cleared, so
    /// a stale session never lingers for a subsequent caller.
    pub async fn ensure_valid_session(&self) -> SessionValidity {
        let now = Utc::now();

        let Some(session) = self.read_session() else {
            return SessionValidity::RequiresReauth;
        };
        if session.is_over_max_age(now) {
            tracing::info!("Session exceeded maximum age");
            self.clear_session(AuthState::Expired);
            return SessionValidity::RequiresReauth;
        }
        if session.token.is_expired(now) {
            match self.refresh_token().await {
                Ok(()) => {}
                Err(TradeRepublicError::NetworkUnreachable(_)) => {
                    return SessionValidity::ServerUnreachable;
                }
                Err(_) => {
                    // refresh_token already cleared the session on rejection
                    return SessionValidity::RequiresReauth;
                }
            }
        }

        if let Err(e) = self.api.ping().await {
            tracing::debug!("Reachability probe failed: {e}");
            return SessionValidity::ServerUnreachable;
        }

        let Some(access_token) = self.session_token() else {
            return SessionValidity::RequiresReauth;
        };
        match self.api.validate_session(&access_token).await {
            Ok(true) => SessionValidity::Valid,
            Ok(false) => {
                tracing::info!("Session rejected server-side");
                self.clear_session(AuthState::Expired);
                SessionValidity::RequiresReauth
            }
            Err(e) if e.invalidates_session() => {
                self.clear_session(AuthState::Expired);
                SessionValidity::RequiresReauth
            }
            Err(e) => {
                tracing::debug!("Session validation inconclusive: {e}");
                SessionValidity::ServerUnreachable
            }
        }
    }

    /// Logs out, clearing the local session first and terminating remotely best-effort.
    pub async fn logout(&self) {
        let token = self.session_token();
        self.clear_session(AuthState::LoggedOut);
        if let Some(token) = token {
            if let Err(e) = self.api.logout(&token).await {
                tracing::debug!("Remote logout failed: {e}");
            }
        }
    }

    fn install_session(&self, response: LoginResponse) -> Result<(), TradeRepublicError> {
        let now = Utc::now();
        let user_id = (self.user_id_extractor)(&response).unwrap_or_else(|| {
            tracing::warn!("Login response carried no user id");
            "unknown".to_string()
        });

        let session = AuthSession {
            token: AuthToken {
                access_token: response.session_token,
                refresh_token: response.refresh_token,
                expires_at: now + Duration::seconds(response.expires_in),
                token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
            },
            user_id,
            session_id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            last_activity: now,
        };

        self.store.save_session(&session)?;
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(session);
        self.set_state(AuthState::Authenticated);
        tracing::info!("Session established");
        Ok(())
    }

    fn clear_session(&self, next_state: AuthState) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = None;
        self.store.clear_session();
        self.set_state(next_state);
    }

    fn read_session(&self) -> Option<AuthSession> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn read_pending_challenge(&self) -> Option<AuthChallenge> {
        self.pending_challenge
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn clear_pending_challenge(&self) {
        *self
            .pending_challenge
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn set_state(&self, state: AuthState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

#[async_trait]
impl SessionGate for TradeRepublicAuthClient {
    fn session_token(&self) -> Option<String> {
        self.read_session().map(|s| s.token.access_token)
    }

    async fn ensure_valid_session(&self) -> SessionValidity {
        Self::ensure_valid_session(self).await
    }
}
