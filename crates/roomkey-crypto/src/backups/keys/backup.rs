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

use vodozemac::Curve25519PublicKey;
use zeroize::Zeroizing;

use crate::{
    ciphers::PkEncryption,
    error::KeyDecodeError,
    olm::RoomSessionKey,
    types::{BackedUpRoomKey, EncryptedSessionData, KeyBackupEntry},
};

/// The public half of a backup key, room keys are encrypted for this key
/// before they are uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupPublicKey {
    key: Curve25519PublicKey,
}

impl BackupPublicKey {
    pub(crate) fn new(key: Curve25519PublicKey) -> Self {
        Self { key }
    }

    /// Try to create a backup public key from its unpadded base64 form.
    pub fn from_base64(key: &str) -> Result<Self, KeyDecodeError> {
        Ok(Self::new(Curve25519PublicKey::from_base64(key)?))
    }

    /// Encode the key as unpadded base64.
    pub fn to_base64(&self) -> String {
        self.key.to_base64()
    }

    /// Encrypt the room key so it can be stored on the server.
    ///
    /// The result can only be decrypted by the holder of the matching
    /// [`BackupDecryptionKey`](super::BackupDecryptionKey), any modification
    /// of the encrypted data is detected on decryption.
    pub fn encrypt_session_key(&self, key: &RoomSessionKey) -> BackedUpRoomKey {
        let plaintext = Zeroizing::new(
            serde_json::to_vec(&key.to_payload(None))
                .expect("We should always be able to serialize a room key payload"),
        );

        let message = PkEncryption::new(self.key).encrypt(&plaintext);

        BackedUpRoomKey {
            room_id: key.room_id().to_owned(),
            session_id: key.session_id().to_owned(),
            entry: KeyBackupEntry {
                first_message_index: key.first_known_index(),
                forwarded_count: key.forwarding_chain().len().try_into().unwrap_or(u32::MAX),
                is_verified: false,
                session_data: EncryptedSessionData::from(message),
            },
        }
    }
}
