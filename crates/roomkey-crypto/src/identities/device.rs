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

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature};

use crate::{error::SignatureError, utilities::to_signable_json};

/// The verification state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustState {
    /// Nobody vouched for the device yet.
    Unverified,
    /// The device has been verified manually.
    Verified,
    /// The device is signed by a verified cross-signing identity.
    CrossSigned,
    /// The device has been blocked from receiving keys.
    Blocked,
}

impl TrustState {
    /// Is a device with this state allowed to receive room keys.
    pub fn is_trusted(self) -> bool {
        matches!(self, TrustState::Verified | TrustState::CrossSigned)
    }
}

/// The public identity of a device.
///
/// Everything but the trust state is fixed once the device is known, the
/// trust state changes only through a verification action on the
/// [`DeviceStore`](crate::store::DeviceStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    identity_key: Curve25519PublicKey,
    signing_key: Ed25519PublicKey,
    trust_state: TrustState,
}

impl DeviceIdentity {
    /// Create a new device identity.
    pub fn new(
        user_id: &UserId,
        device_id: &DeviceId,
        identity_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        trust_state: TrustState,
    ) -> Self {
        Self {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            identity_key,
            signing_key,
            trust_state,
        }
    }

    /// The user that owns the device.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The unique id of the device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The Curve25519 key used to encrypt messages for the device.
    pub fn identity_key(&self) -> Curve25519PublicKey {
        self.identity_key
    }

    /// The Ed25519 key the device signs things with.
    pub fn signing_key(&self) -> Ed25519PublicKey {
        self.signing_key
    }

    /// The current verification state of the device.
    pub fn trust_state(&self) -> TrustState {
        self.trust_state
    }

    /// Is the device verified, either manually or through cross-signing.
    pub fn is_trusted(&self) -> bool {
        self.trust_state.is_trusted()
    }

    /// Has the device been blocked.
    pub fn is_blocked(&self) -> bool {
        self.trust_state == TrustState::Blocked
    }

    /// Check that the device created the given signature over the canonical
    /// JSON form of `value`.
    pub fn verify_json(
        &self,
        value: &impl Serialize,
        signature: &Ed25519Signature,
    ) -> Result<(), SignatureError> {
        let canonical = to_signable_json(value)?;
        self.verify_canonical(&canonical, signature)
    }

    pub(crate) fn verify_canonical(
        &self,
        canonical_json: &str,
        signature: &Ed25519Signature,
    ) -> Result<(), SignatureError> {
        Ok(self.signing_key.verify(canonical_json.as_bytes(), signature)?)
    }

    pub(crate) fn set_trust_state(&mut self, trust_state: TrustState) {
        self.trust_state = trust_state;
    }
}

#[cfg(any(test, feature = "testing"))]
pub(crate) mod testing {
    use ruma::{DeviceId, UserId};

    use super::{DeviceIdentity, TrustState};
    use crate::olm::Account;

    /// Create a device identity backed by a freshly generated account.
    pub fn get_device(
        user_id: &UserId,
        device_id: &DeviceId,
        trust_state: TrustState,
    ) -> (Account, DeviceIdentity) {
        let account = Account::new(user_id, device_id);
        let mut device = account.device_identity();
        device.set_trust_state(trust_state);

        (account, device)
    }
}
