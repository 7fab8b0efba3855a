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

use ruma::CanonicalJsonError;
use serde_json::Error as SerdeError;
use thiserror::Error;

use crate::identities::TrustTier;

/// Error representing a failure to decrypt a backed up room key.
///
/// A failed decryption never leaves a partially imported key behind, the
/// room key is only handed to the store once it has been fully decrypted and
/// validated.
#[derive(Error, Debug)]
pub enum DecryptionError {
    /// The MAC of the backed up room key didn't match. The entry was either
    /// tampered with or the wrong recovery secret was used.
    #[error(
        "the MAC of the backed up room key didn't match, wrong recovery secret or tampered data"
    )]
    AuthenticationFailed,

    /// One of the base64 encoded fields of the backed up room key couldn't be
    /// decoded.
    #[error("the backed up room key contains an invalid field: {0}")]
    Decode(#[from] KeyDecodeError),

    /// The room key was authenticated but the decrypted payload isn't a valid
    /// room key.
    #[error("the decrypted room key payload is invalid: {0}")]
    InvalidPayload(#[source] SerdeError),
}

/// Error type describing failures of the key backup engine.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackupError {
    /// The operation was attempted against a backup version that has been
    /// deleted. These errors are not retried.
    #[error("the backup version {0} has been deleted")]
    BackupDeleted(String),

    /// The transport failed repeatedly and the retry limit was reached.
    #[error("the key backup is unavailable after {attempts} attempts: {source}")]
    BackupUnavailable {
        /// How many times the operation was attempted.
        attempts: u32,
        /// The last transport error we received.
        #[source]
        source: TransportError,
    },

    /// The backup version isn't signed by a device we trust, room keys won't
    /// be uploaded to it.
    #[error("the backup version {version} is not trusted, its trust tier is {tier:?}")]
    Untrusted {
        /// The id of the backup version.
        version: String,
        /// The trust tier the backup version was evaluated to.
        tier: TrustTier,
    },

    /// The recovery key doesn't belong to the backup version.
    #[error("the recovery key doesn't match the public key of the backup version {version}")]
    KeyMismatch {
        /// The id of the backup version.
        version: String,
    },

    /// The backup uses an algorithm we don't support.
    #[error("the backup algorithm {0} is not supported")]
    UnsupportedAlgorithm(String),

    /// The auth data of the backup couldn't be signed or its public key
    /// couldn't be decoded.
    #[error(transparent)]
    Signature(#[from] SignatureError),
}

/// A key-share control message was missing required fields or contained
/// invalid values. Such messages are dropped without any state change.
#[derive(Error, Debug)]
pub enum MalformedMessageError {
    /// A required field is missing from the message.
    #[error("the key share message is missing the required field `{0}`")]
    MissingField(&'static str),

    /// A field is present but couldn't be parsed.
    #[error("the key share message contains an invalid `{field}` field: {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Why the field was rejected.
        reason: String,
    },

    /// The message isn't valid JSON or has the wrong shape.
    #[error(transparent)]
    InvalidJson(#[from] SerdeError),
}

/// A delivery or fetch failure reported by the transport collaborator.
///
/// Transport errors are retried with a bounded exponential backoff, once the
/// retry limit is reached they are surfaced as
/// [`BackupError::BackupUnavailable`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The request couldn't be delivered.
    #[error("network error: {0}")]
    Network(String),

    /// The server rejected the request.
    #[error("the server responded with status {status}: {message}")]
    Server {
        /// The HTTP status code of the response.
        status: u16,
        /// The error message of the response.
        message: String,
    },

    /// The request timed out.
    #[error("the request timed out")]
    Timeout,
}

impl TransportError {
    /// Can the failed request be retried.
    ///
    /// Network errors, timeouts, rate limiting and server errors are
    /// considered transient, other rejections by the server are not.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Network(_) | TransportError::Timeout => true,
            TransportError::Server { status, .. } => *status == 429 || *status >= 500,
        }
    }
}

/// Error type describing different errors that happen when we check or create
/// signatures for a backup's auth data.
#[derive(Error, Debug)]
pub enum SignatureError {
    /// The signed object couldn't be converted into canonical JSON.
    #[error(transparent)]
    CanonicalJson(#[from] CanonicalJsonError),

    /// The signed object couldn't be serialized.
    #[error(transparent)]
    Json(#[from] SerdeError),

    /// The public key isn't a valid key.
    #[error(transparent)]
    InvalidKey(#[from] vodozemac::KeyError),

    /// The signature could not be decoded.
    #[error("the given signature is not valid and can't be decoded")]
    InvalidSignature,

    /// The signature couldn't be verified.
    #[error(transparent)]
    VerificationError(#[from] vodozemac::SignatureError),
}

/// Error type for the decoding of recovery keys and base64 encoded key
/// material.
#[derive(Error, Debug)]
pub enum KeyDecodeError {
    /// The decoded recovery key has an invalid prefix.
    #[error("the decoded recovery key has an invalid prefix: expected {0:?}, got {1:?}")]
    Prefix([u8; 2], [u8; 2]),

    /// The parity byte of the recovery key didn't match.
    #[error("the parity byte of the recovery key doesn't match: expected {0:?}, got {1:?}")]
    Parity(u8, u8),

    /// The key has an invalid length.
    #[error("the decoded key has an invalid length: expected {0}, got {1}")]
    Length(usize, usize),

    /// The recovery key isn't valid base58.
    #[error(transparent)]
    Base58(#[from] bs58::decode::Error),

    /// The value isn't valid base64.
    #[error(transparent)]
    Base64(#[from] base64::DecodeError),

    /// The key isn't a valid Curve25519 key.
    #[error(transparent)]
    Key(#[from] vodozemac::KeyError),
}

/// The outcome of a background task that didn't produce a value.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// The task was cancelled before it could finish.
    #[error("the task was cancelled")]
    Cancelled,

    /// The task panicked.
    #[error("the task panicked")]
    Panicked,
}
