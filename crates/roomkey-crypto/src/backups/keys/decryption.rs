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

use hmac::Hmac;
use pbkdf2::pbkdf2;
use rand::{thread_rng, RngCore};
use sha2::Sha512;
use vodozemac::{Curve25519PublicKey, Curve25519SecretKey};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::BackupPublicKey;
use crate::{
    backups::BackupVersion,
    ciphers::{PkDecryption, PkMessage},
    error::{DecryptionError, KeyDecodeError},
    olm::{RoomKeyPayload, RoomSessionKey},
    types::BackedUpRoomKey,
    utilities::{decode, encode},
};

/// The private half of a backup key, also known as the recovery key.
///
/// Whoever holds this key can decrypt every room key in the backup. The key
/// is zeroized when dropped and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BackupDecryptionKey {
    inner: Box<[u8; BackupDecryptionKey::KEY_SIZE]>,
}

impl BackupDecryptionKey {
    /// The number of bytes the decryption key will hold.
    pub const KEY_SIZE: usize = 32;

    const PREFIX: [u8; 2] = [0x8b, 0x01];
    const PREFIX_PARITY: u8 = Self::PREFIX[0] ^ Self::PREFIX[1];
    const DISPLAY_CHUNK_SIZE: usize = 4;

    /// Create a new random decryption key.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let mut rng = thread_rng();
        let mut key = Box::new([0u8; Self::KEY_SIZE]);
        rng.fill_bytes(key.as_mut_slice());

        Self { inner: key }
    }

    /// Create a decryption key from the given bytes.
    pub fn from_bytes(key: &[u8; Self::KEY_SIZE]) -> Self {
        Self { inner: Box::new(*key) }
    }

    /// Derive a decryption key from a passphrase using PBKDF2 with
    /// HMAC-SHA-512.
    pub fn from_passphrase(passphrase: &str, salt: &str, rounds: u32) -> Self {
        let mut key = Box::new([0u8; Self::KEY_SIZE]);

        pbkdf2::<Hmac<Sha512>>(passphrase.as_bytes(), salt.as_bytes(), rounds, key.as_mut_slice())
            .expect(
                "We should be able to expand a passphrase of any length due to \
                 HMAC being able to be initialized with any input size",
            );

        Self { inner: key }
    }

    /// Try to create a decryption key from its unpadded base64 form.
    pub fn from_base64(key: &str) -> Result<Self, KeyDecodeError> {
        let decoded = Zeroizing::new(decode(key)?);
        Self::from_slice(&decoded)
    }

    /// Encode the decryption key as unpadded base64.
    pub fn to_base64(&self) -> String {
        encode(self.inner.as_slice())
    }

    /// Try to create a decryption key from its human readable base58 form,
    /// whitespace is ignored.
    pub fn from_base58(value: &str) -> Result<Self, KeyDecodeError> {
        let value: Zeroizing<String> =
            Zeroizing::new(value.chars().filter(|c| !c.is_whitespace()).collect());

        let decoded = Zeroizing::new(
            bs58::decode(value.as_bytes()).with_alphabet(bs58::Alphabet::BITCOIN).into_vec()?,
        );

        const EXPECTED_LENGTH: usize = 2 + BackupDecryptionKey::KEY_SIZE + 1;

        if decoded.len() != EXPECTED_LENGTH {
            return Err(KeyDecodeError::Length(EXPECTED_LENGTH, decoded.len()));
        }

        let prefix = [decoded[0], decoded[1]];
        let key = &decoded[2..2 + Self::KEY_SIZE];
        let expected_parity = decoded[EXPECTED_LENGTH - 1];
        let parity = Self::parity_byte(key);

        if prefix != Self::PREFIX {
            Err(KeyDecodeError::Prefix(Self::PREFIX, prefix))
        } else if expected_parity != parity {
            Err(KeyDecodeError::Parity(expected_parity, parity))
        } else {
            Self::from_slice(key)
        }
    }

    /// Encode the decryption key in its human readable base58 form.
    pub fn to_base58(&self) -> String {
        let bytes = Zeroizing::new(
            [
                Self::PREFIX.as_ref(),
                self.inner.as_ref(),
                [Self::parity_byte(self.inner.as_ref())].as_ref(),
            ]
            .concat(),
        );

        bs58::encode(bytes.as_slice()).with_alphabet(bs58::Alphabet::BITCOIN).into_string()
    }

    /// The public key room keys are encrypted for.
    pub fn public_key(&self) -> BackupPublicKey {
        BackupPublicKey::new(Curve25519PublicKey::from(&self.secret_key()))
    }

    /// Is this the recovery key of the given backup version.
    pub fn backup_key_matches(&self, version: &BackupVersion) -> bool {
        self.public_key() == version.public_key()
    }

    /// Decrypt a backed up room key.
    ///
    /// The key is only returned if the authentication tag verifies and the
    /// decrypted payload belongs to the room and session the entry is stored
    /// under.
    pub fn decrypt_session_key(
        &self,
        backed_up: &BackedUpRoomKey,
    ) -> Result<RoomSessionKey, DecryptionError> {
        let message = PkMessage::try_from(&backed_up.entry.session_data)?;
        let secret_key = self.secret_key();

        let plaintext = Zeroizing::new(
            PkDecryption::new(&secret_key)
                .decrypt(&message)
                .map_err(|_| DecryptionError::AuthenticationFailed)?,
        );

        let payload: RoomKeyPayload =
            serde_json::from_slice(&plaintext).map_err(DecryptionError::InvalidPayload)?;

        if payload.room_id != backed_up.room_id || payload.session_id != backed_up.session_id {
            return Err(DecryptionError::AuthenticationFailed);
        }

        RoomSessionKey::from_payload(&payload)
    }

    fn from_slice(key: &[u8]) -> Result<Self, KeyDecodeError> {
        let key: &[u8; Self::KEY_SIZE] =
            key.try_into().map_err(|_| KeyDecodeError::Length(Self::KEY_SIZE, key.len()))?;

        Ok(Self::from_bytes(key))
    }

    fn parity_byte(bytes: &[u8]) -> u8 {
        bytes.iter().fold(Self::PREFIX_PARITY, |acc, x| acc ^ x)
    }

    fn secret_key(&self) -> Curve25519SecretKey {
        Curve25519SecretKey::from_slice(&self.inner)
    }
}

impl fmt::Display for BackupDecryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let string = Zeroizing::new(self.to_base58());

        let string = Zeroizing::new(
            string
                .chars()
                .collect::<Vec<char>>()
                .chunks(Self::DISPLAY_CHUNK_SIZE)
                .map(|c| c.iter().collect::<String>())
                .collect::<Vec<_>>()
                .join(" "),
        );

        write!(f, "{}", string.as_str())
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for BackupDecryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupDecryptionKey").field("public_key", &self.public_key()).finish()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::BackupDecryptionKey;
    use crate::error::KeyDecodeError;

    const TEST_KEY: [u8; 32] = [
        0x77, 0x07, 0x6D, 0x0A, 0x73, 0x18, 0xA5, 0x7D, 0x3C, 0x16, 0xC1, 0x72, 0x51, 0xB2, 0x66,
        0x45, 0xDF, 0x4C, 0x2F, 0x87, 0xEB, 0xC0, 0x99, 0x2A, 0xB1, 0x77, 0xFB, 0xA5, 0x1D, 0xB9,
        0x2C, 0x2A,
    ];

    #[test]
    fn base64_decoding() {
        let key = BackupDecryptionKey::new();

        let base64 = key.to_base64();
        let decoded = BackupDecryptionKey::from_base64(&base64).unwrap();
        assert_eq!(key.inner, decoded.inner);

        assert_matches!(
            BackupDecryptionKey::from_base64("AAAA"),
            Err(KeyDecodeError::Length(32, 3))
        );
    }

    #[test]
    fn base58_decoding() {
        let key = BackupDecryptionKey::from_bytes(&TEST_KEY);

        let base58 = key.to_base58();
        let decoded = BackupDecryptionKey::from_base58(&base58).unwrap();
        assert_eq!(key.inner, decoded.inner);

        let displayed = key.to_string();
        assert!(displayed.split(' ').all(|chunk| chunk.len() <= 4));
        let decoded = BackupDecryptionKey::from_base58(&displayed).unwrap();
        assert_eq!(key.inner, decoded.inner);
    }

    #[test]
    fn base58_rejects_tampered_keys() {
        let key = BackupDecryptionKey::from_bytes(&TEST_KEY);

        let mut bytes = bs58::decode(key.to_base58())
            .with_alphabet(bs58::Alphabet::BITCOIN)
            .into_vec()
            .unwrap();
        bytes[10] ^= 0xff;
        let tampered =
            bs58::encode(&bytes).with_alphabet(bs58::Alphabet::BITCOIN).into_string();

        assert_matches!(
            BackupDecryptionKey::from_base58(&tampered),
            Err(KeyDecodeError::Parity(_, _))
        );

        let mut bytes = bs58::decode(key.to_base58())
            .with_alphabet(bs58::Alphabet::BITCOIN)
            .into_vec()
            .unwrap();
        bytes[0] = 0;
        let wrong_prefix =
            bs58::encode(&bytes).with_alphabet(bs58::Alphabet::BITCOIN).into_string();

        assert_matches!(
            BackupDecryptionKey::from_base58(&wrong_prefix),
            Err(KeyDecodeError::Prefix(_, [0, 0x01]))
        );

        assert_matches!(
            BackupDecryptionKey::from_base58("EsTc"),
            Err(KeyDecodeError::Length(35, _))
        );
        assert_matches!(
            BackupDecryptionKey::from_base58("0OIl"),
            Err(KeyDecodeError::Base58(_))
        );
    }

    #[test]
    fn passphrase_derivation_is_deterministic() {
        let first = BackupDecryptionKey::from_passphrase("It's a secret", "salt", 10);
        let second = BackupDecryptionKey::from_passphrase("It's a secret", "salt", 10);
        let other = BackupDecryptionKey::from_passphrase("It's a secret", "pepper", 10);

        assert_eq!(first.inner, second.inner);
        assert_ne!(first.inner, other.inner);
        assert_eq!(first.public_key(), second.public_key());
    }

    #[test]
    fn debug_doesnt_leak_the_key() {
        let key = BackupDecryptionKey::from_bytes(&TEST_KEY);
        let debug = format!("{key:?}");

        assert!(!debug.contains(&key.to_base64()));
        assert!(!debug.contains(&key.to_base58()));
    }
}
