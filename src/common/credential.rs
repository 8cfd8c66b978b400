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

//! Device key vault holding the client's durable asymmetric identity.
//!
//! Trade Republic binds each login session to a device-resident P-256 key registered
//! during pairing. The private key never leaves the vault; login requests carry a
//! signature over `"{timestamp}.{payload}"` and the public key travels as an
//! uncompressed SEC1 point.

use std::fmt::Debug;

use anyhow::Context;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use ring::{
    rand::SystemRandom,
    signature::{ECDSA_P256_SHA256_FIXED_SIGNING, EcdsaKeyPair, KeyPair},
};
use serde::{Deserialize, Serialize};

/// Serialized form of a device identity as persisted by the session store.
///
/// All fields are required; a record missing any of them is treated as absent,
/// which degrades to a fresh pairing flow rather than an error.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceKeyRecord {
    /// Stable device identifier generated at pairing time.
    pub device_id: String,
    /// PKCS#8 private key document, base64 encoded.
    pub pkcs8: String,
    /// Uncompressed SEC1 public point, base64 encoded.
    pub public_key: String,
}

/// Vault owning the device's P-256 signing identity.
pub struct DeviceKeyVault {
    key_pair: EcdsaKeyPair,
    pkcs8: Vec<u8>,
    device_id: String,
    rng: SystemRandom,
}

impl Debug for DeviceKeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(DeviceKeyVault))
            .field("device_id", &self.device_id)
            .field("key_pair", &"<redacted>")
            .finish()
    }
}

impl DeviceKeyVault {
    /// Generates a fresh device identity.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation fails.
    pub fn generate() -> anyhow::Result<Self> {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .map_err(|e| anyhow::anyhow!("Failed to generate device key: {e}"))?;
        let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
            .map_err(|e| anyhow::anyhow!("Generated device key was rejected: {e}"))?;

        Ok(Self {
            key_pair,
            pkcs8: pkcs8.as_ref().to_vec(),
            device_id: uuid::Uuid::new_v4().to_string(),
            rng,
        })
    }

    /// Restores a vault from a persisted record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be decoded into a usable key.
    pub fn from_record(record: &DeviceKeyRecord) -> anyhow::Result<Self> {
        let pkcs8 = BASE64
            .decode(&record.pkcs8)
            .context("Invalid base64 in persisted device key")?;
        let rng = SystemRandom::new();
        let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &pkcs8, &rng)
            .map_err(|e| anyhow::anyhow!("Persisted device key rejected: {e}"))?;

        Ok(Self {
            key_pair,
            pkcs8,
            device_id: record.device_id.clone(),
            rng,
        })
    }

    /// Returns the persistable form of this identity.
    #[must_use]
    pub fn to_record(&self) -> DeviceKeyRecord {
        DeviceKeyRecord {
            device_id: self.device_id.clone(),
            pkcs8: BASE64.encode(&self.pkcs8),
            public_key: self.public_key_b64(),
        }
    }

    /// Returns the stable device identifier.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Returns the public key as an uncompressed SEC1 point (0x04-prefixed).
    #[must_use]
    pub fn public_key_bytes(&self) -> &[u8] {
        self.key_pair.public_key().as_ref()
    }

    /// Returns the public key base64 encoded for wire transmission.
    #[must_use]
    pub fn public_key_b64(&self) -> String {
        BASE64.encode(self.public_key_bytes())
    }

    /// Signs `"{timestamp}.{payload}"` with the resident private key.
    ///
    /// Returns the signature base64 encoded.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn sign(&self, payload: &str, timestamp_ms: i64) -> anyhow::Result<String> {
        let message = format!("{timestamp_ms}.{payload}");
        let signature = self
            .key_pair
            .sign(&self.rng, message.as_bytes())
            .map_err(|e| anyhow::anyhow!("Device key signing failed: {e}"))?;
        Ok(BASE64.encode(signature.as_ref()))
    }
}
