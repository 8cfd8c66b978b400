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

//! Durable storage for the device identity and session state.
//!
//! Writes go to a temporary sibling which is atomically renamed over the target, so a
//! partially written file never replaces a previously valid one. Loads treat any
//! structural defect as "absent", degrading to re-authentication instead of failing.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Serialize, de::DeserializeOwned};

use crate::{
    auth::models::AuthSession, common::credential::DeviceKeyRecord, error::TradeRepublicError,
};

const DEVICE_FILE: &str = "device.json";
const SESSION_FILE: &str = "session.json";

/// File-backed store holding one device identity file and one session file.
#[derive(Clone, Debug)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Creates a store rooted at `dir`. The directory is created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the directory this store writes into.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persists the device identity.
    ///
    /// # Errors
    ///
    /// Returns [`TradeRepublicError::Store`] if the write fails.
    pub fn save_device(&self, record: &DeviceKeyRecord) -> Result<(), TradeRepublicError> {
        self.write_atomic(DEVICE_FILE, record)
    }

    /// Loads the device identity, or `None` if absent or structurally incomplete.
    #[must_use]
    pub fn load_device(&self) -> Option<DeviceKeyRecord> {
        self.read_opt(DEVICE_FILE)
    }

    /// Removes the persisted device identity. Idempotent.
    pub fn clear_device(&self) {
        self.remove(DEVICE_FILE);
    }

    /// Persists the session.
    ///
    /// # Errors
    ///
    /// Returns [`TradeRepublicError::Store`] if the write fails.
    pub fn save_session(&self, session: &AuthSession) -> Result<(), TradeRepublicError> {
        self.write_atomic(SESSION_FILE, session)
    }

    /// Loads the session, or `None` if absent or structurally incomplete.
    #[must_use]
    pub fn load_session(&self) -> Option<AuthSession> {
        self.read_opt(SESSION_FILE)
    }

    /// Removes the persisted session. Idempotent.
    pub fn clear_session(&self) {
        self.remove(SESSION_FILE);
    }

    fn write_atomic<T: Serialize>(&self, name: &str, value: &T) -> Result<(), TradeRepublicError> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| TradeRepublicError::Store(format!("Failed to create {:?}: {e}", self.dir)))?;

        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{name}.tmp"));
        let json = serde_json::to_vec_pretty(value)
            .map_err(|e| TradeRepublicError::Store(format!("Serialization failed: {e}")))?;

        fs::write(&tmp, json)
            .map_err(|e| TradeRepublicError::Store(format!("Failed to write {tmp:?}: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600)).map_err(|e| {
                TradeRepublicError::Store(format!("Failed to set permissions on {tmp:?}: {e}"))
            })?;
        }

        fs::rename(&tmp, &path)
            .map_err(|e| TradeRepublicError::Store(format!("Failed to replace {path:?}: {e}")))?;

        tracing::debug!("Persisted {name}");
        Ok(())
    }

    fn read_opt<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let path = self.dir.join(name);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Failed to read {path:?}: {e}");
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Discarding structurally invalid {name}: {e}");
                None
            }
        }
    }

    fn remove(&self, name: &str) {
        let path = self.dir.join(name);
        if let Err(e) = fs::remove_file(&path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!("Failed to remove {path:?}: {e}");
        }
    }
}
