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

use std::{cmp::Ordering, fmt};

use ruma::{DeviceId, OwnedDeviceId, OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use vodozemac::Curve25519PublicKey;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    error::{DecryptionError, KeyDecodeError},
    utilities::{decode, encode},
};

/// The only room key algorithm we know how to handle.
pub const MEGOLM_V1_ALGORITHM: &str = "m.megolm.v1.aes-sha2";

/// The secret part of a room session key.
///
/// The material is zeroized on drop, compared in constant time and never
/// printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeyMaterial(Vec<u8>);

impl SessionKeyMaterial {
    /// Create a new `SessionKeyMaterial` from the given bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Get the raw bytes of the key material.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl PartialEq for SessionKeyMaterial {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_slice().ct_eq(other.0.as_slice()).into()
    }
}

impl Eq for SessionKeyMaterial {}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for SessionKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SessionKeyMaterial").field(&"*****").finish()
    }
}

/// A room session key, the symmetric secret that lets us decrypt the messages
/// a single sender sent in a room.
///
/// A key is identified by its room id, session id and the Curve25519 key of
/// its sender.
#[derive(Clone, PartialEq, Eq)]
pub struct RoomSessionKey {
    room_id: OwnedRoomId,
    session_id: String,
    sender_key: Curve25519PublicKey,
    key_material: SessionKeyMaterial,
    first_known_index: u32,
    forwarding_chain: Vec<OwnedDeviceId>,
}

impl RoomSessionKey {
    /// Create a new room session key that wasn't forwarded to us.
    pub fn new(
        room_id: &RoomId,
        session_id: &str,
        sender_key: Curve25519PublicKey,
        key_material: SessionKeyMaterial,
        first_known_index: u32,
    ) -> Self {
        Self {
            room_id: room_id.to_owned(),
            session_id: session_id.to_owned(),
            sender_key,
            key_material,
            first_known_index,
            forwarding_chain: Vec::new(),
        }
    }

    /// Set the list of devices that relayed this key before it reached us,
    /// oldest first.
    #[must_use]
    pub fn with_forwarding_chain(mut self, chain: Vec<OwnedDeviceId>) -> Self {
        self.forwarding_chain = chain;
        self
    }

    /// The room this key belongs to.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The unique id of the session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The Curve25519 key of the device that created the session.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// The secret key material.
    pub fn key_material(&self) -> &SessionKeyMaterial {
        &self.key_material
    }

    /// The earliest message index this key can decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.first_known_index
    }

    /// The devices that relayed this key, oldest first.
    pub fn forwarding_chain(&self) -> &[OwnedDeviceId] {
        &self.forwarding_chain
    }

    /// Was this key received directly from its creator.
    pub fn is_direct(&self) -> bool {
        self.forwarding_chain.is_empty()
    }

    /// Compare two keys by how desirable they are, `Ordering::Less` means that
    /// `self` is the better key.
    ///
    /// A lower first known index covers a larger range of messages and wins,
    /// on a tie the key with the shorter forwarding chain wins. The remaining
    /// comparisons only make the order total so that picking the better of
    /// two keys doesn't depend on the order they arrived in.
    pub(crate) fn compare_quality(&self, other: &Self) -> Ordering {
        self.first_known_index
            .cmp(&other.first_known_index)
            .then_with(|| self.forwarding_chain.len().cmp(&other.forwarding_chain.len()))
            .then_with(|| self.forwarding_chain.cmp(&other.forwarding_chain))
            .then_with(|| self.key_material.as_bytes().cmp(other.key_material.as_bytes()))
    }

    /// Serialize the key so it can be encrypted, appending `forwarder` to the
    /// forwarding chain if given.
    pub(crate) fn to_payload(&self, forwarder: Option<&DeviceId>) -> RoomKeyPayload {
        let mut forwarding_chain = self.forwarding_chain.clone();
        forwarding_chain.extend(forwarder.map(ToOwned::to_owned));

        RoomKeyPayload {
            algorithm: MEGOLM_V1_ALGORITHM.to_owned(),
            room_id: self.room_id.clone(),
            session_id: self.session_id.clone(),
            sender_key: self.sender_key.to_base64(),
            session_key: encode(self.key_material.as_bytes()),
            first_known_index: self.first_known_index,
            forwarding_chain,
        }
    }

    pub(crate) fn from_payload(payload: &RoomKeyPayload) -> Result<Self, DecryptionError> {
        let sender_key = decode(&payload.sender_key).map_err(KeyDecodeError::from)?;
        let sender_key =
            Curve25519PublicKey::from_slice(&sender_key).map_err(KeyDecodeError::from)?;

        let mut session_key = decode(&payload.session_key).map_err(KeyDecodeError::from)?;
        let key_material = SessionKeyMaterial::from_bytes(&session_key);
        session_key.zeroize();

        Ok(Self {
            room_id: payload.room_id.clone(),
            session_id: payload.session_id.clone(),
            sender_key,
            key_material,
            first_known_index: payload.first_known_index,
            forwarding_chain: payload.forwarding_chain.clone(),
        })
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for RoomSessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomSessionKey")
            .field("room_id", &self.room_id)
            .field("session_id", &self.session_id)
            .field("sender_key", &self.sender_key.to_base64())
            .field("first_known_index", &self.first_known_index)
            .field("forwarding_chain", &self.forwarding_chain)
            .finish_non_exhaustive()
    }
}

/// The plaintext form of a room key, only ever handled right before
/// encryption or right after decryption.
#[derive(Serialize, Deserialize)]
pub(crate) struct RoomKeyPayload {
    pub algorithm: String,
    pub room_id: OwnedRoomId,
    pub session_id: String,
    pub sender_key: String,
    pub session_key: String,
    pub first_known_index: u32,
    #[serde(default)]
    pub forwarding_chain: Vec<OwnedDeviceId>,
}

impl Drop for RoomKeyPayload {
    fn drop(&mut self) {
        self.session_key.zeroize();
    }
}


#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use ruma::{device_id, room_id};

    use super::{testing::room_key, RoomSessionKey};

    #[test]
    fn debug_output_hides_the_key_material() {
        let key = room_key(room_id!("!test:localhost"), "session", 0);
        let debug = format!("{key:?}");

        assert!(debug.contains("session"));
        assert!(!debug.contains(&format!("{:?}", key.key_material().as_bytes())));
        assert!(format!("{:?}", key.key_material()).contains("*****"));
    }

    #[test]
    fn quality_prefers_lower_index_then_shorter_chain() {
        let key = room_key(room_id!("!test:localhost"), "session", 5);
        let better = RoomSessionKey { first_known_index: 2, ..key.clone() };
        let forwarded = key.clone().with_forwarding_chain(vec![device_id!("RELAY").to_owned()]);

        assert_eq!(better.compare_quality(&key), Ordering::Less);
        assert_eq!(key.compare_quality(&forwarded), Ordering::Less);
        assert_eq!(key.compare_quality(&key.clone()), Ordering::Equal);
    }

    #[test]
    fn payload_roundtrip_appends_forwarder() {
        let key = room_key(room_id!("!test:localhost"), "session", 3);
        let payload = key.to_payload(Some(device_id!("FORWARDER")));

        let restored = RoomSessionKey::from_payload(&payload).unwrap();

        assert_eq!(restored.forwarding_chain(), [device_id!("FORWARDER").to_owned()]);
        assert_eq!(restored.with_forwarding_chain(Vec::new()), key);
    }
}
