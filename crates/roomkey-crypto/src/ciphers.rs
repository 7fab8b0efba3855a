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

//! Public-key authenticated encryption used for backed up and forwarded room
//! keys.
//!
//! A fresh ephemeral Curve25519 key is generated for every message, the shared
//! secret with the recipient's public key is expanded using HKDF-SHA-256 into
//! an AES-256 key, an HMAC-SHA-256 key and an AES-CTR initialization vector.
//! The MAC covers the ephemeral public key and the whole ciphertext.

use aes::{
    cipher::{generic_array::GenericArray, IvSizeUser, KeyIvInit, KeySizeUser, StreamCipher},
    Aes256,
};
use ctr::Ctr128BE;
use hkdf::Hkdf;
use hmac::{digest::MacError, Hmac, Mac as _};
use sha2::Sha256;
use vodozemac::{Curve25519PublicKey, Curve25519SecretKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub(crate) const IV_SIZE: usize = 16;
pub(crate) const KEY_SIZE: usize = 32;
pub(crate) const MAC_SIZE: usize = 32;

const HKDF_INFO: &[u8] = b"ROOMKEY_PK_ENCRYPTION";

type Aes256Ctr = Ctr128BE<Aes256>;

type Aes256Key = GenericArray<u8, <Aes256Ctr as KeySizeUser>::KeySize>;
type Aes256Iv = GenericArray<u8, <Aes256Ctr as IvSizeUser>::IvSize>;

/// A message produced by [`PkEncryption::encrypt()`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PkMessage {
    pub ciphertext: Vec<u8>,
    pub mac: [u8; MAC_SIZE],
    pub ephemeral_key: Curve25519PublicKey,
}

/// Keys derived from a single Curve25519 shared secret.
#[derive(Zeroize, ZeroizeOnDrop)]
struct MessageKeys {
    aes_key: Box<[u8; KEY_SIZE]>,
    mac_key: Box<[u8; KEY_SIZE]>,
    iv: Box<[u8; IV_SIZE]>,
}

impl MessageKeys {
    fn derive(shared_secret: &[u8; 32]) -> Self {
        let mut expanded_keys = [0u8; KEY_SIZE * 2 + IV_SIZE];

        Hkdf::<Sha256>::new(None, shared_secret)
            .expand(HKDF_INFO, &mut expanded_keys)
            .expect("We should be able to expand the shared secret into 80 bytes");

        let mut aes_key = Box::new([0u8; KEY_SIZE]);
        let mut mac_key = Box::new([0u8; KEY_SIZE]);
        let mut iv = Box::new([0u8; IV_SIZE]);

        aes_key.copy_from_slice(&expanded_keys[0..KEY_SIZE]);
        mac_key.copy_from_slice(&expanded_keys[KEY_SIZE..KEY_SIZE * 2]);
        iv.copy_from_slice(&expanded_keys[KEY_SIZE * 2..]);

        expanded_keys.zeroize();

        Self { aes_key, mac_key, iv }
    }

    fn apply_keystream(&self, mut data: Vec<u8>) -> Vec<u8> {
        let mut cipher = Aes256Ctr::new(
            Aes256Key::from_slice(self.aes_key.as_slice()),
            Aes256Iv::from_slice(self.iv.as_slice()),
        );
        cipher.apply_keystream(&mut data);

        data
    }

    fn hmac(&self, ephemeral_key: &Curve25519PublicKey, ciphertext: &[u8]) -> Hmac<Sha256> {
        let mut hmac = Hmac::<Sha256>::new_from_slice(self.mac_key.as_slice())
            .expect("We should be able to create a new HMAC object from our 32 byte MAC key");

        hmac.update(ephemeral_key.as_bytes());
        hmac.update(ciphertext);

        hmac
    }

    fn create_mac_tag(
        &self,
        ephemeral_key: &Curve25519PublicKey,
        ciphertext: &[u8],
    ) -> [u8; MAC_SIZE] {
        let mut mac = [0u8; MAC_SIZE];
        mac.copy_from_slice(&self.hmac(ephemeral_key, ciphertext).finalize().into_bytes());

        mac
    }

    /// Constant-time check of the authentication tag.
    fn verify_mac(
        &self,
        ephemeral_key: &Curve25519PublicKey,
        ciphertext: &[u8],
        mac: &[u8; MAC_SIZE],
    ) -> Result<(), MacError> {
        self.hmac(ephemeral_key, ciphertext).verify_slice(mac)
    }
}

/// The encrypting half, holds only the recipient's public key.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PkEncryption {
    public_key: Curve25519PublicKey,
}

impl PkEncryption {
    pub(crate) fn new(public_key: Curve25519PublicKey) -> Self {
        Self { public_key }
    }

    pub(crate) fn encrypt(&self, plaintext: &[u8]) -> PkMessage {
        let ephemeral_secret = Curve25519SecretKey::new();
        let ephemeral_key = Curve25519PublicKey::from(&ephemeral_secret);

        let shared_secret = ephemeral_secret.diffie_hellman(&self.public_key);
        let keys = MessageKeys::derive(shared_secret.as_bytes());

        let ciphertext = keys.apply_keystream(plaintext.to_vec());
        let mac = keys.create_mac_tag(&ephemeral_key, &ciphertext);

        PkMessage { ciphertext, mac, ephemeral_key }
    }
}

/// The decrypting half, holds the recipient's secret key.
pub(crate) struct PkDecryption<'a> {
    secret_key: &'a Curve25519SecretKey,
}

impl<'a> PkDecryption<'a> {
    pub(crate) fn new(secret_key: &'a Curve25519SecretKey) -> Self {
        Self { secret_key }
    }

    /// Decrypt the message, the plaintext is only produced if the MAC
    /// verifies.
    pub(crate) fn decrypt(&self, message: &PkMessage) -> Result<Vec<u8>, MacError> {
        let shared_secret = self.secret_key.diffie_hellman(&message.ephemeral_key);
        let keys = MessageKeys::derive(shared_secret.as_bytes());

        keys.verify_mac(&message.ephemeral_key, &message.ciphertext, &message.mac)?;

        Ok(keys.apply_keystream(message.ciphertext.clone()))
    }
}

#[cfg(test)]
mod tests {
    use vodozemac::{Curve25519PublicKey, Curve25519SecretKey};

    use super::{PkDecryption, PkEncryption};

    #[test]
    fn encryption_roundtrip() {
        let plaintext = "It's a secret to everybody";

        let secret_key = Curve25519SecretKey::new();
        let public_key = Curve25519PublicKey::from(&secret_key);

        let message = PkEncryption::new(public_key).encrypt(plaintext.as_bytes());
        let decrypted = PkDecryption::new(&secret_key)
            .decrypt(&message)
            .expect("We should be able to decrypt a message we encrypted");

        assert_eq!(plaintext.as_bytes(), decrypted);
        assert_ne!(plaintext.as_bytes(), message.ciphertext);
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let secret_key = Curve25519SecretKey::new();
        let public_key = Curve25519PublicKey::from(&secret_key);
        let other_key = Curve25519SecretKey::new();

        let message = PkEncryption::new(public_key).encrypt(b"secret");

        PkDecryption::new(&other_key)
            .decrypt(&message)
            .expect_err("A different secret key must not authenticate the message");
    }

    #[test]
    fn swapped_ephemeral_key_fails_authentication() {
        let secret_key = Curve25519SecretKey::new();
        let public_key = Curve25519PublicKey::from(&secret_key);
        let encryption = PkEncryption::new(public_key);

        let mut message = encryption.encrypt(b"secret");
        message.ephemeral_key = encryption.encrypt(b"other").ephemeral_key;

        PkDecryption::new(&secret_key)
            .decrypt(&message)
            .expect_err("The MAC covers the ephemeral key");
    }
}
