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

use std::collections::BTreeMap;

use ruma::{OwnedDeviceId, OwnedRoomId};
use serde::{Deserialize, Serialize};
use vodozemac::Curve25519PublicKey;

use crate::{
    ciphers::{PkMessage, MAC_SIZE},
    error::KeyDecodeError,
    utilities::{decode, encode},
};

/// Information describing a backup version, as it's uploaded to and
/// downloaded from the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupVersionDescriptor {
    /// The opaque id of the backup version.
    pub version: String,
    /// The algorithm the room keys in this backup are encrypted with.
    pub algorithm: String,
    /// Algorithm specific data used to check the authenticity of the backup.
    pub auth_data: BackupAuthData,
}

/// The auth data of a backup version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupAuthData {
    /// The unpadded base64 encoded Curve25519 key room keys are encrypted
    /// for.
    pub public_key: String,
    /// Ed25519 signatures of the canonical JSON form of the auth data, keyed
    /// by the id of the signing device.
    #[serde(default)]
    pub signatures: BTreeMap<OwnedDeviceId, String>,
}

/// The encrypted part of a backed up room key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSessionData {
    /// The unpadded base64 encoded ciphertext.
    pub ciphertext: String,
    /// The unpadded base64 encoded authentication tag.
    pub mac: String,
    /// The unpadded base64 encoded ephemeral Curve25519 key.
    pub ephemeral_key: String,
}

impl From<PkMessage> for EncryptedSessionData {
    fn from(message: PkMessage) -> Self {
        Self {
            ciphertext: encode(&message.ciphertext),
            mac: encode(message.mac),
            ephemeral_key: message.ephemeral_key.to_base64(),
        }
    }
}

impl TryFrom<&EncryptedSessionData> for PkMessage {
    type Error = KeyDecodeError;

    fn try_from(value: &EncryptedSessionData) -> Result<Self, Self::Error> {
        let ciphertext = decode(&value.ciphertext)?;

        let decoded_mac = decode(&value.mac)?;
        let mac: [u8; MAC_SIZE] = decoded_mac
            .as_slice()
            .try_into()
            .map_err(|_| KeyDecodeError::Length(MAC_SIZE, decoded_mac.len()))?;

        let ephemeral_key = Curve25519PublicKey::from_slice(&decode(&value.ephemeral_key)?)?;

        Ok(PkMessage { ciphertext, mac, ephemeral_key })
    }
}

/// A single room key as it's stored in a backup.
///
/// Only `session_data` is authenticated, the other fields are hints the
/// server may use to decide which of two entries to keep.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBackupEntry {
    /// The first message index the backed up key can decrypt.
    pub first_message_index: u32,
    /// How many times the key was forwarded before it reached the uploader.
    pub forwarded_count: u32,
    /// Was the device that created the key verified by the uploader.
    pub is_verified: bool,
    /// The encrypted room key.
    pub session_data: EncryptedSessionData,
}

/// A backup entry together with the location it's stored under.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackedUpRoomKey {
    /// The room the key belongs to.
    pub room_id: OwnedRoomId,
    /// The id of the session.
    pub session_id: String,
    /// The backup entry itself.
    #[serde(flatten)]
    pub entry: KeyBackupEntry,
}
