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

use std::{collections::HashMap, sync::Arc};

use dashmap::DashMap;
use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use tracing::{info, warn};

use crate::identities::{DeviceIdentity, TrustState};

/// In-memory store holding the devices of users.
#[derive(Clone, Debug, Default)]
pub struct DeviceStore {
    entries: Arc<DashMap<OwnedUserId, DashMap<OwnedDeviceId, DeviceIdentity>>>,
}

impl DeviceStore {
    /// Create a new empty device store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device to the store.
    ///
    /// The keys of a known device never change, a device with the same id
    /// but different keys is rejected. Re-adding a known device keeps its
    /// current trust state.
    ///
    /// Returns true if the device wasn't in the store before.
    pub fn add(&self, device: DeviceIdentity) -> bool {
        let devices = self.entries.entry(device.user_id().to_owned()).or_default();

        let existing_keys = devices
            .get(device.device_id())
            .map(|existing| (existing.identity_key(), existing.signing_key()));

        match existing_keys {
            Some((identity_key, signing_key))
                if identity_key != device.identity_key() || signing_key != device.signing_key() =>
            {
                warn!(
                    user_id = ?device.user_id(),
                    device_id = ?device.device_id(),
                    "A known device changed its keys, ignoring the new keys"
                );
                false
            }
            Some(_) => false,
            None => {
                devices.insert(device.device_id().to_owned(), device);
                true
            }
        }
    }

    /// Get the device with the given device_id and belonging to the given user.
    pub fn get(&self, user_id: &UserId, device_id: &DeviceId) -> Option<DeviceIdentity> {
        self.entries.get(user_id).and_then(|m| m.get(device_id).map(|d| d.value().clone()))
    }

    /// Remove the device with the given device_id and belonging to the given
    /// user.
    pub fn remove(&self, user_id: &UserId, device_id: &DeviceId) -> Option<DeviceIdentity> {
        self.entries.get(user_id).and_then(|m| m.remove(device_id)).map(|(_, d)| d)
    }

    /// Get all devices of the given user.
    pub fn user_devices(&self, user_id: &UserId) -> HashMap<OwnedDeviceId, DeviceIdentity> {
        self.entries
            .get(user_id)
            .map(|devices| {
                devices.iter().map(|i| (i.key().to_owned(), i.value().clone())).collect()
            })
            .unwrap_or_default()
    }

    /// Change the trust state of a device, this is the result of a
    /// verification action.
    ///
    /// Returns false if the device is unknown.
    pub fn set_trust_state(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        state: TrustState,
    ) -> bool {
        let Some(devices) = self.entries.get(user_id) else {
            return false;
        };

        let Some(mut device) = devices.get_mut(device_id) else {
            return false;
        };

        if device.trust_state() != state {
            info!(
                ?user_id,
                ?device_id,
                previous = ?device.trust_state(),
                current = ?state,
                "The trust state of a device changed"
            );
            device.set_trust_state(state);
        }

        true
    }

    /// A copy of every device we know about.
    pub fn snapshot(&self) -> Vec<DeviceIdentity> {
        self.entries
            .iter()
            .flat_map(|d| d.value().iter().map(|i| i.value().clone()).collect::<Vec<_>>())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};

    use super::DeviceStore;
    use crate::identities::{device::testing::get_device, TrustState};

    #[test]
    fn device_store() {
        let user_id = user_id!("@alice:localhost");
        let (_, device) = get_device(user_id, device_id!("ALICEDEVICE"), TrustState::Unverified);

        let store = DeviceStore::new();

        assert!(store.add(device.clone()));
        assert!(!store.add(device.clone()));

        let loaded_device = store.get(user_id, device.device_id()).unwrap();
        assert_eq!(device, loaded_device);

        let user_devices = store.user_devices(user_id);
        assert!(user_devices.contains_key(device.device_id()));
        assert_eq!(store.snapshot(), vec![device.clone()]);

        store.remove(user_id, device.device_id());
        assert!(store.get(user_id, device.device_id()).is_none());
    }

    #[test]
    fn trust_state_changes() {
        let user_id = user_id!("@alice:localhost");
        let (_, device) = get_device(user_id, device_id!("ALICEDEVICE"), TrustState::Unverified);

        let store = DeviceStore::new();
        store.add(device.clone());

        assert!(store.set_trust_state(user_id, device.device_id(), TrustState::Verified));
        assert_eq!(
            store.get(user_id, device.device_id()).unwrap().trust_state(),
            TrustState::Verified
        );

        // Adding the device again doesn't reset the trust state.
        store.add(device.clone());
        assert!(store.get(user_id, device.device_id()).unwrap().is_trusted());

        assert!(!store.set_trust_state(user_id, device_id!("UNKNOWN"), TrustState::Blocked));
    }

    #[test]
    fn changed_keys_are_rejected() {
        let user_id = user_id!("@alice:localhost");
        let (_, device) = get_device(user_id, device_id!("ALICEDEVICE"), TrustState::Verified);
        let (_, impostor) = get_device(user_id, device_id!("ALICEDEVICE"), TrustState::Verified);

        let store = DeviceStore::new();
        store.add(device.clone());

        assert!(!store.add(impostor));
        assert_eq!(store.get(user_id, device.device_id()).unwrap(), device);
    }
}
