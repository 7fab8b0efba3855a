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

use ruma::OwnedDeviceId;
use vodozemac::{Curve25519PublicKey, Ed25519Signature};

use super::BackupPublicKey;
use crate::{
    error::{BackupError, SignatureError},
    olm::Account,
    types::{BackupAuthData, BackupVersionDescriptor},
    utilities::to_signable_json,
};

/// The only backup algorithm we support: room keys are encrypted for a
/// Curve25519 key using an ephemeral key agreement, AES-256-CTR and
/// HMAC-SHA-256.
pub const BACKUP_ALGORITHM: &str = "io.roomkey.backup.v1.curve25519-aes-ctr-hmac-sha2";

/// A version of the server-side key backup.
///
/// The trust of a version is never stored, it's computed on demand from the
/// current state of the devices that signed it, see
/// [`BackupMachine::verify_trust()`](super::BackupMachine::verify_trust).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupVersion {
    version: String,
    algorithm: String,
    public_key: BackupPublicKey,
    signatures: BTreeMap<OwnedDeviceId, Ed25519Signature>,
}

impl BackupVersion {
    /// Create a new, unsigned, backup version.
    pub fn new(version: &str, public_key: BackupPublicKey) -> Self {
        Self {
            version: version.to_owned(),
            algorithm: BACKUP_ALGORITHM.to_owned(),
            public_key,
            signatures: BTreeMap::new(),
        }
    }

    /// The opaque id of the version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The algorithm room keys in this version are encrypted with.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// The key room keys are encrypted for.
    pub fn public_key(&self) -> BackupPublicKey {
        self.public_key
    }

    /// The signatures of the auth data, by device id.
    pub fn signatures(&self) -> &BTreeMap<OwnedDeviceId, Ed25519Signature> {
        &self.signatures
    }

    /// Sign the auth data of the version with the signing key of the given
    /// account.
    pub fn sign(&mut self, account: &Account) -> Result<(), SignatureError> {
        let signature = account.sign_json(&self.auth_data())?;
        self.signatures.insert(account.device_id().to_owned(), signature);

        Ok(())
    }

    /// The canonical JSON form of the auth data the signatures are created
    /// over.
    pub fn signable_json(&self) -> Result<String, SignatureError> {
        to_signable_json(&self.auth_data())
    }

    /// Convert the version into the form it's uploaded to the server in.
    pub fn to_descriptor(&self) -> BackupVersionDescriptor {
        BackupVersionDescriptor {
            version: self.version.clone(),
            algorithm: self.algorithm.clone(),
            auth_data: BackupAuthData {
                public_key: self.public_key.to_base64(),
                signatures: self
                    .signatures
                    .iter()
                    .map(|(device_id, signature)| (device_id.clone(), signature.to_base64()))
                    .collect(),
            },
        }
    }

    fn auth_data(&self) -> BackupAuthData {
        BackupAuthData { public_key: self.public_key.to_base64(), signatures: BTreeMap::new() }
    }
}

impl TryFrom<&BackupVersionDescriptor> for BackupVersion {
    type Error = BackupError;

    fn try_from(descriptor: &BackupVersionDescriptor) -> Result<Self, Self::Error> {
        if descriptor.algorithm != BACKUP_ALGORITHM {
            return Err(BackupError::UnsupportedAlgorithm(descriptor.algorithm.clone()));
        }

        let public_key = Curve25519PublicKey::from_base64(&descriptor.auth_data.public_key)
            .map(BackupPublicKey::new)
            .map_err(SignatureError::from)?;

        let signatures = descriptor
            .auth_data
            .signatures
            .iter()
            .map(|(device_id, signature)| {
                Ed25519Signature::from_base64(signature)
                    .map(|s| (device_id.clone(), s))
                    .map_err(|_| SignatureError::InvalidSignature)
            })
            .collect::<Result<_, _>>()?;

        Ok(Self {
            version: descriptor.version.clone(),
            algorithm: descriptor.algorithm.clone(),
            public_key,
            signatures,
        })
    }
}

/// The outcome of restoring a list of backed up room keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// The number of room keys that were decrypted and handed to the store.
    pub restored: usize,
    /// The number of room keys that couldn't be decrypted.
    pub failed: usize,
}

impl RestoreReport {
    /// The total number of backed up room keys we looked at.
    pub fn total(&self) -> usize {
        self.restored + self.failed
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::{device_id, user_id};

    use super::{BackupVersion, BACKUP_ALGORITHM};
    use crate::{
        backups::BackupDecryptionKey,
        error::{BackupError, SignatureError},
        olm::Account,
    };

    #[test]
    fn descriptor_conversion() {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let key = BackupDecryptionKey::new();

        let mut version = BackupVersion::new("1", key.public_key());
        version.sign(&account).unwrap();

        let descriptor = version.to_descriptor();
        assert_eq!(descriptor.algorithm, BACKUP_ALGORITHM);
        assert_eq!(descriptor.auth_data.public_key, key.public_key().to_base64());
        assert!(descriptor.auth_data.signatures.contains_key(device_id!("ALICEDEVICE")));

        let converted = BackupVersion::try_from(&descriptor).unwrap();
        assert_eq!(converted, version);
    }

    #[test]
    fn signatures_dont_cover_other_signatures() {
        let alice = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let bob = Account::new(user_id!("@alice:localhost"), device_id!("OTHERDEVICE"));

        let mut version = BackupVersion::new("1", BackupDecryptionKey::new().public_key());
        let canonical = version.signable_json().unwrap();

        version.sign(&alice).unwrap();
        version.sign(&bob).unwrap();

        assert_eq!(version.signable_json().unwrap(), canonical);
        assert!(!canonical.contains("signatures"));

        let device = alice.device_identity();
        let signature = version.signatures().get(device_id!("ALICEDEVICE")).unwrap();
        device.verify_canonical(&canonical, signature).unwrap();
    }

    #[test]
    fn unsupported_algorithms_are_rejected() {
        let mut descriptor =
            BackupVersion::new("1", BackupDecryptionKey::new().public_key()).to_descriptor();
        descriptor.algorithm = "m.megolm_backup.v1.curve25519-aes-sha2".to_owned();

        assert_matches!(
            BackupVersion::try_from(&descriptor),
            Err(BackupError::UnsupportedAlgorithm(algorithm)) if algorithm == descriptor.algorithm
        );
    }

    #[test]
    fn invalid_signatures_are_rejected() {
        let mut descriptor =
            BackupVersion::new("1", BackupDecryptionKey::new().public_key()).to_descriptor();
        descriptor
            .auth_data
            .signatures
            .insert(device_id!("ALICEDEVICE").to_owned(), "not a signature".to_owned());

        assert_matches!(
            BackupVersion::try_from(&descriptor),
            Err(BackupError::Signature(SignatureError::InvalidSignature))
        );
    }
}
