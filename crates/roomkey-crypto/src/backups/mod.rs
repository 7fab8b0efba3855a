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

//! Server-side backup support for room keys.
//!
//! Room keys are encrypted for the public half of a backup key and uploaded
//! into a backup version. Whoever holds the [`BackupDecryptionKey`] can
//! restore them on a new device.
//!
//! A backup version is only as trustworthy as the devices that signed it. Its
//! [`TrustTier`] is recomputed every time it's needed, a change compared to
//! the previous evaluation is announced on
//! [`BackupMachine::trust_changes_stream()`].

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    error::{BackupError, DecryptionError},
    identities::{TrustEvaluator, TrustTier},
    machine::CryptoContext,
    olm::RoomSessionKey,
    requests::send_with_retry,
    store::PutOutcome,
    types::{BackedUpRoomKey, BackupVersionDescriptor},
};

mod keys;
mod version;

pub use keys::{BackupDecryptionKey, BackupPublicKey};
pub use version::{BackupVersion, RestoreReport, BACKUP_ALGORITHM};

/// Signals that the trust tier of a backup version changed between two
/// evaluations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustDowngradeEvent {
    /// The id of the backup version.
    pub version: String,
    /// The trust tier of the previous evaluation.
    pub previous: TrustTier,
    /// The trust tier of the current evaluation.
    pub current: TrustTier,
}

impl TrustDowngradeEvent {
    /// Did the backup stop being usable.
    pub fn is_downgrade(&self) -> bool {
        self.previous.is_trusted() && !self.current.is_trusted()
    }
}

#[derive(Debug, Clone)]
enum VersionState {
    Active(BackupVersion),
    Deleted,
}

#[derive(Debug)]
struct BackupMachineInner {
    versions: DashMap<String, VersionState>,
    /// The result of the last trust evaluation of a version, only used to
    /// detect changes.
    last_trust: DashMap<String, TrustTier>,
    trust_changes_sender: broadcast::Sender<TrustDowngradeEvent>,
}

/// A state machine that handles backing up and restoring room keys.
#[derive(Debug, Clone)]
pub struct BackupMachine {
    context: CryptoContext,
    inner: Arc<BackupMachineInner>,
}

impl BackupMachine {
    /// Create a new backup machine operating on the given context.
    pub fn new(context: CryptoContext) -> Self {
        let (trust_changes_sender, _) = broadcast::channel(100);

        Self {
            context,
            inner: Arc::new(BackupMachineInner {
                versions: DashMap::new(),
                last_trust: DashMap::new(),
                trust_changes_sender,
            }),
        }
    }

    /// Create a new backup version for the given key and sign it with our own
    /// device.
    ///
    /// The version only exists locally until it's uploaded, see
    /// [`KeyMachine::create_backup()`](crate::KeyMachine::create_backup).
    /// Cached trust evaluations of older versions are forgotten.
    pub fn create_version(
        &self,
        algorithm: &str,
        key: &BackupDecryptionKey,
    ) -> Result<BackupVersion, BackupError> {
        if algorithm != BACKUP_ALGORITHM {
            return Err(BackupError::UnsupportedAlgorithm(algorithm.to_owned()));
        }

        let mut version = BackupVersion::new(&ulid::Ulid::new().to_string(), key.public_key());
        version.sign(&self.context.account)?;

        self.inner.last_trust.clear();
        self.inner
            .versions
            .insert(version.version().to_owned(), VersionState::Active(version.clone()));

        info!(version = version.version(), "Created a new backup version");

        Ok(version)
    }

    /// Start tracking a backup version we learned about from the server.
    pub fn import_version(
        &self,
        descriptor: &BackupVersionDescriptor,
    ) -> Result<BackupVersion, BackupError> {
        if self.is_deleted(&descriptor.version) {
            return Err(BackupError::BackupDeleted(descriptor.version.clone()));
        }

        let version = BackupVersion::try_from(descriptor)?;
        self.inner
            .versions
            .insert(version.version().to_owned(), VersionState::Active(version.clone()));

        Ok(version)
    }

    /// Get a backup version we know about, deleted versions aren't returned.
    pub fn get_version(&self, version: &str) -> Option<BackupVersion> {
        match self.inner.versions.get(version)?.value() {
            VersionState::Active(v) => Some(v.clone()),
            VersionState::Deleted => None,
        }
    }

    /// Has the given backup version been deleted.
    pub fn is_deleted(&self, version: &str) -> bool {
        self.inner.versions.get(version).is_some_and(|v| matches!(v.value(), VersionState::Deleted))
    }

    fn ensure_not_deleted(&self, version: &str) -> Result<(), BackupError> {
        if self.is_deleted(version) {
            Err(BackupError::BackupDeleted(version.to_owned()))
        } else {
            Ok(())
        }
    }

    /// Encrypt a room key so it can be uploaded to the given backup version.
    ///
    /// Fails with [`BackupError::BackupDeleted`] if the version has been
    /// deleted.
    pub fn encrypt_session_key(
        &self,
        key: &RoomSessionKey,
        version: &BackupVersion,
    ) -> Result<BackedUpRoomKey, BackupError> {
        self.ensure_not_deleted(version.version())?;

        Ok(version.public_key().encrypt_session_key(key))
    }

    /// Decrypt a backed up room key using the recovery key.
    ///
    /// The key isn't added to the store, see [`BackupMachine::restore_all()`]
    /// for that.
    pub fn decrypt_session_key(
        &self,
        backed_up: &BackedUpRoomKey,
        recovery_key: &BackupDecryptionKey,
    ) -> Result<RoomSessionKey, DecryptionError> {
        recovery_key.decrypt_session_key(backed_up)
    }

    /// Decrypt all the given backed up room keys and add them to the store.
    ///
    /// Every key is decrypted on its own, a key that fails to decrypt is
    /// counted and skipped. Only fully decrypted keys are handed to the store,
    /// so cancelling the restore never leaves a partial key behind.
    #[instrument(skip_all, fields(count = backed_up.len()))]
    pub async fn restore_all(
        &self,
        backed_up: &[BackedUpRoomKey],
        recovery_key: &BackupDecryptionKey,
    ) -> RestoreReport {
        let mut report = RestoreReport::default();

        for entry in backed_up {
            match recovery_key.decrypt_session_key(entry) {
                Ok(key) => {
                    if self.context.store.put(key) == PutOutcome::Inserted {
                        trace!(
                            room_id = ?entry.room_id,
                            session_id = entry.session_id,
                            "Restored a room key from the backup"
                        );
                    }

                    report.restored += 1;
                }
                Err(error) => {
                    warn!(
                        room_id = ?entry.room_id,
                        session_id = entry.session_id,
                        ?error,
                        "Couldn't decrypt a backed up room key"
                    );

                    report.failed += 1;
                }
            }

            // Decryption is CPU bound, let other tasks run between keys.
            tokio::task::yield_now().await;
        }

        info!(restored = report.restored, failed = report.failed, "Finished restoring room keys");

        report
    }

    /// Compute the trust tier of the backup version from the current state of
    /// our devices.
    ///
    /// Deleted versions are always `Untrusted`. If the result differs from
    /// the previous evaluation of the same version a [`TrustDowngradeEvent`]
    /// is sent out.
    pub fn verify_trust(&self, version: &BackupVersion) -> TrustTier {
        let tier = if self.is_deleted(version.version()) {
            TrustTier::Untrusted
        } else {
            TrustEvaluator::evaluate(version, &self.context.devices.snapshot())
        };

        let previous = self.inner.last_trust.insert(version.version().to_owned(), tier);

        match previous {
            Some(previous) if previous != tier => {
                info!(
                    version = version.version(),
                    ?previous,
                    current = ?tier,
                    "The trust tier of a backup version changed"
                );

                let _ = self.inner.trust_changes_sender.send(TrustDowngradeEvent {
                    version: version.version().to_owned(),
                    previous,
                    current: tier,
                });
            }
            _ => debug!(
                version = version.version(),
                ?tier,
                "Evaluated the trust of a backup version"
            ),
        }

        tier
    }

    /// Mark the backup version as deleted.
    ///
    /// This is terminal, room keys can't be encrypted for or uploaded to a
    /// deleted version anymore.
    pub fn delete_version(&self, version: &str) {
        self.inner.versions.insert(version.to_owned(), VersionState::Deleted);
        self.inner.last_trust.remove(version);

        info!(version, "Deleted a backup version");
    }

    /// Receive a [`TrustDowngradeEvent`] whenever the trust tier of a backup
    /// version changes.
    pub fn trust_changes_stream(&self) -> impl Stream<Item = TrustDowngradeEvent> {
        BroadcastStream::new(self.inner.trust_changes_sender.subscribe())
            .filter_map(|event| event.ok())
    }

    /// Upload all room keys that aren't yet part of the backup version.
    ///
    /// The keys are uploaded in batches, a batch is only marked as backed up
    /// once the upload succeeded. Returns the number of room keys that were
    /// uploaded.
    #[instrument(skip_all, fields(version = version.version()))]
    pub async fn backup_room_keys(&self, version: &BackupVersion) -> Result<usize, BackupError> {
        self.ensure_not_deleted(version.version())?;

        let tier = self.verify_trust(version);

        if !tier.is_trusted() {
            return Err(BackupError::Untrusted { version: version.version().to_owned(), tier });
        }

        let batch_size = self.context.config.backup.batch_size;
        let mut uploaded = 0;

        loop {
            let keys = self.context.store.keys_for_backup(version.version(), batch_size);

            if keys.is_empty() {
                break;
            }

            let backed_up = keys
                .iter()
                .map(|key| self.encrypt_session_key(key, version))
                .collect::<Result<Vec<_>, _>>()?;

            send_with_retry(&self.context.config.retry, "upload_room_keys", || {
                self.context.transport.upload_room_keys(version.version(), &backed_up)
            })
            .await?;

            let marked = self.context.store.mark_as_backed_up(version.version(), &keys);
            uploaded += keys.len();

            debug!(count = keys.len(), marked, "Uploaded a batch of room keys");

            if marked == 0 {
                break;
            }
        }

        Ok(uploaded)
    }

    /// Download all room keys of the backup version and restore them.
    ///
    /// Fails with [`BackupError::KeyMismatch`] before anything is downloaded
    /// if the recovery key doesn't belong to the backup version.
    #[instrument(skip_all, fields(version = version.version()))]
    pub async fn download_and_restore(
        &self,
        version: &BackupVersion,
        recovery_key: &BackupDecryptionKey,
    ) -> Result<RestoreReport, BackupError> {
        self.ensure_not_deleted(version.version())?;

        if !recovery_key.backup_key_matches(version) {
            warn!("The recovery key doesn't match the public key of the backup version");
            return Err(BackupError::KeyMismatch { version: version.version().to_owned() });
        }

        let backed_up = send_with_retry(&self.context.config.retry, "download_room_keys", || {
            self.context.transport.download_room_keys(version.version())
        })
        .await?;

        Ok(self.restore_all(&backed_up, recovery_key).await)
    }
}
