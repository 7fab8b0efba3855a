// Copyright 2025 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use serde::Serialize;
use vodozemac::{
    Curve25519PublicKey, Curve25519SecretKey, Ed25519PublicKey, Ed25519SecretKey, Ed25519Signature,
};

use crate::{
    ciphers::PkDecryption,
    error::SignatureError,
    identities::{DeviceIdentity, TrustState},
    utilities::to_signable_json,
};

/// The long-lived identity of our own device.
///
/// Holds the Ed25519 key used to sign backup versions and the Curve25519 key
/// other devices use to encrypt forwarded room keys for us.
pub struct Account {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    signing_key: Ed25519SecretKey,
    identity_key: Curve25519SecretKey,
}

impl Account {
    /// Create a fresh account with newly generated keys.
    pub fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        Self {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            signing_key: Ed25519SecretKey::new(),
            identity_key: Curve25519SecretKey::new(),
        }
    }

    /// The user that owns this account.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The id of our own device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Our public Ed25519 signing key.
    pub fn signing_key(&self) -> Ed25519PublicKey {
        self.signing_key.public_key()
    }

    /// Our public Curve25519 identity key.
    pub fn identity_key(&self) -> Curve25519PublicKey {
        Curve25519PublicKey::from(&self.identity_key)
    }

    /// Sign the canonical JSON form of the given value.
    pub fn sign_json(&self, value: &impl Serialize) -> Result<Ed25519Signature, SignatureError> {
        let canonical = to_signable_json(value)?;

        Ok(self.signing_key.sign(canonical.as_bytes()))
    }

    /// The public identity of our own device, which we trust implicitly.
    pub fn device_identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(
            &self.user_id,
            &self.device_id,
            self.identity_key(),
            self.signing_key(),
            TrustState::Verified,
        )
    }

    pub(crate) fn decryption(&self) -> PkDecryption<'_> {
        PkDecryption::new(&self.identity_key)
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("signing_key", &self.signing_key().to_base64())
            .field("identity_key", &self.identity_key().to_base64())
            .finish()
    }
}
