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

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use ruma::{DeviceId, UserId};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::{
    backups::{
        BackupDecryptionKey, BackupMachine, BackupVersion, RestoreReport, BACKUP_ALGORITHM,
    },
    config::CryptoConfig,
    error::{BackupError, DecryptionError, MalformedMessageError},
    executor::BackgroundTask,
    gossiping::{GossipMachine, RequestState},
    identities::{DeviceIdentity, TrustState},
    olm::{Account, OneTimeKeySupplyTracker, RoomSessionKey},
    requests::{send_with_retry, Transport},
    store::{DeviceStore, PutOutcome, SessionKeyStore},
    types::{events::ForwardedRoomKeyContent, KeySupplyChanges},
};

/// Everything the state machines of this crate share: our own account, the
/// stores, the transport and the configuration.
///
/// Cloning the context is cheap, all clones share the same state.
#[derive(Debug, Clone)]
pub struct CryptoContext {
    pub(crate) account: Arc<Account>,
    pub(crate) store: SessionKeyStore,
    pub(crate) devices: DeviceStore,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) config: CryptoConfig,
}

impl CryptoContext {
    /// Create a new context with empty stores.
    ///
    /// Our own device is added to the device store, it's trusted implicitly.
    pub fn new(account: Account, transport: Arc<dyn Transport>, config: CryptoConfig) -> Self {
        let devices = DeviceStore::new();
        devices.add(account.device_identity());

        Self {
            account: Arc::new(account),
            store: SessionKeyStore::new(),
            devices,
            transport,
            config,
        }
    }

    /// Our own account.
    pub fn account(&self) -> &Account {
        &self.account
    }

    /// The store holding our room keys.
    pub fn store(&self) -> &SessionKeyStore {
        &self.store
    }

    /// The store holding the devices we know about.
    pub fn devices(&self) -> &DeviceStore {
        &self.devices
    }

    /// The configuration the state machines use.
    pub fn config(&self) -> &CryptoConfig {
        &self.config
    }
}

/// The entry point of the crate, ties the room key store, the key backup and
/// the handling of key requests together.
///
/// The machine doesn't do any IO on its own, requests go out through the
/// [`Transport`] and incoming data is handed to the `receive_*` methods.
#[derive(Debug, Clone)]
pub struct KeyMachine {
    context: CryptoContext,
    backups: BackupMachine,
    gossiping: GossipMachine,
    one_time_keys: Arc<StdMutex<OneTimeKeySupplyTracker>>,
}

impl KeyMachine {
    /// Create a new machine for the given device, with freshly generated
    /// keys.
    pub fn new(
        user_id: &UserId,
        device_id: &DeviceId,
        transport: Arc<dyn Transport>,
        config: CryptoConfig,
    ) -> Self {
        Self::with_account(Account::new(user_id, device_id), transport, config)
    }

    /// Create a new machine using an existing account.
    pub fn with_account(
        account: Account,
        transport: Arc<dyn Transport>,
        config: CryptoConfig,
    ) -> Self {
        let context = CryptoContext::new(account, transport, config);

        Self {
            backups: BackupMachine::new(context.clone()),
            gossiping: GossipMachine::new(context.clone()),
            one_time_keys: Arc::new(StdMutex::new(OneTimeKeySupplyTracker::new(
                config.one_time_keys,
            ))),
            context,
        }
    }

    /// The unique user id that owns this machine.
    pub fn user_id(&self) -> &UserId {
        self.context.account.user_id()
    }

    /// The unique device id of this machine.
    pub fn device_id(&self) -> &DeviceId {
        self.context.account.device_id()
    }

    /// The context shared by the state machines.
    pub fn context(&self) -> &CryptoContext {
        &self.context
    }

    /// The store holding our room keys.
    pub fn store(&self) -> &SessionKeyStore {
        &self.context.store
    }

    /// The backup state machine.
    pub fn backup_machine(&self) -> &BackupMachine {
        &self.backups
    }

    /// The state machine handling incoming key requests.
    pub fn gossip_machine(&self) -> &GossipMachine {
        &self.gossiping
    }

    /// Start tracking a device. Returns false if the device was already
    /// known.
    pub fn add_device(&self, device: DeviceIdentity) -> bool {
        self.context.devices.add(device)
    }

    /// Get a device we know about.
    pub fn get_device(&self, user_id: &UserId, device_id: &DeviceId) -> Option<DeviceIdentity> {
        self.context.devices.get(user_id, device_id)
    }

    /// Change the trust state of a device as the result of a verification.
    ///
    /// Returns false if the device is unknown.
    pub fn set_device_trust_state(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        state: TrustState,
    ) -> bool {
        self.context.devices.set_trust_state(user_id, device_id, state)
    }

    /// Add a room key we created or received.
    pub fn add_room_key(&self, key: RoomSessionKey) -> PutOutcome {
        self.context.store.put(key)
    }

    fn one_time_keys(&self) -> MutexGuard<'_, OneTimeKeySupplyTracker> {
        self.one_time_keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle the key supply part of a sync response.
    pub fn receive_sync_changes(&self, changes: &KeySupplyChanges) {
        let mut tracker = self.one_time_keys();

        tracker.update_counts(&changes.counts);
        tracker.update_unused_fallback_keys(changes.unused_fallback_keys.clone());
    }

    /// Lower our estimate of the one-time keys of the given algorithm, the
    /// next sync overrides the estimate.
    pub fn record_one_time_key_claim(&self, algorithm: &str, count: u64) {
        self.one_time_keys().record_claim(algorithm, count);
    }

    /// Should new one-time keys of the given algorithm be uploaded.
    pub fn needs_one_time_key_replenishment(&self, algorithm: &str) -> bool {
        self.one_time_keys().needs_replenishment(algorithm)
    }

    /// How many one-time keys of the given algorithm should be generated.
    pub fn one_time_keys_to_generate(&self, algorithm: &str) -> u64 {
        self.one_time_keys().keys_to_generate(algorithm)
    }

    /// Should a new fallback key of the given algorithm be uploaded.
    pub fn needs_fallback_key(&self, algorithm: &str) -> bool {
        self.one_time_keys().needs_fallback_key(algorithm)
    }

    /// Handle a key share control message another device sent us.
    pub async fn receive_key_share_message(
        &self,
        sender: &UserId,
        content: &Value,
    ) -> Result<Option<RequestState>, MalformedMessageError> {
        self.gossiping.receive_key_share_message(sender, content).await
    }

    /// Handle a room key another device forwarded to us.
    pub fn receive_forwarded_room_key(
        &self,
        sender: &UserId,
        sender_device: &DeviceId,
        content: &ForwardedRoomKeyContent,
    ) -> Result<Option<PutOutcome>, DecryptionError> {
        self.gossiping.receive_forwarded_room_key(sender, sender_device, content)
    }

    /// Create a new backup version for the given key and upload it.
    ///
    /// Room keys are only marked as backed up for a single version, once the
    /// new version is uploaded every key needs to be uploaded again.
    #[instrument(skip_all)]
    pub async fn create_backup(
        &self,
        key: &BackupDecryptionKey,
    ) -> Result<BackupVersion, BackupError> {
        let version = self.backups.create_version(BACKUP_ALGORITHM, key)?;
        let descriptor = version.to_descriptor();

        let result = send_with_retry(&self.context.config.retry, "upload_backup_version", || {
            self.context.transport.upload_backup_version(&descriptor)
        })
        .await;

        if let Err(error) = result {
            warn!(
                version = version.version(),
                error = ?error.error,
                "Couldn't upload the backup version"
            );
            self.backups.delete_version(version.version());

            return Err(error.into());
        }

        self.context.store.reset_backup_state();
        info!(version = version.version(), "Uploaded a new backup version");

        Ok(version)
    }

    /// Delete a backup version.
    ///
    /// The version is invalidated locally before the server is asked to
    /// delete it, so no further room keys are uploaded to it even if the
    /// request fails.
    #[instrument(skip(self))]
    pub async fn delete_backup(&self, version: &str) -> Result<(), BackupError> {
        self.backups.delete_version(version);

        send_with_retry(&self.context.config.retry, "delete_backup_version", || {
            self.context.transport.delete_backup_version(version)
        })
        .await?;

        debug!("Deleted the backup version on the server");

        Ok(())
    }

    /// Upload all room keys that aren't yet part of the backup version.
    pub async fn backup_room_keys(&self, version: &BackupVersion) -> Result<usize, BackupError> {
        self.backups.backup_room_keys(version).await
    }

    /// Restore all room keys of the backup version in the background.
    ///
    /// Aborting the returned task stops the restore, keys restored until then
    /// stay in the store.
    pub fn spawn_restore(
        &self,
        version: BackupVersion,
        recovery_key: BackupDecryptionKey,
    ) -> BackgroundTask<Result<RestoreReport, BackupError>> {
        let backups = self.backups.clone();

        BackgroundTask::spawn(async move {
            backups.download_and_restore(&version, &recovery_key).await
        })
    }
}
