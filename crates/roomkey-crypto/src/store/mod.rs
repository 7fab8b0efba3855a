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

//! In-memory storage of room session keys and devices.
//!
//! The [`SessionKeyStore`] holds every room key we know about. Keys are
//! sharded by `(room_id, session_id)`: a write to one key is atomic with
//! respect to readers of that key while keys in other shards can be read and
//! written concurrently.
//!
//! When two keys with the same `(room_id, session_id, sender_key)` meet, the
//! better one is kept, see [`SessionKeyStore::merge()`]. The choice only
//! depends on the two keys, never on the order they arrived in, so redundant
//! deliveries from backups and other devices always converge to the same
//! result.

use std::{
    cmp::Ordering,
    collections::{btree_map::Entry, BTreeMap},
    sync::Arc,
};

use dashmap::DashMap;
use ruma::{OwnedRoomId, RoomId};
use tokio::sync::broadcast;
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    Stream, StreamExt,
};
use tracing::{debug, trace, warn};
use vodozemac::Curve25519PublicKey;

use crate::olm::RoomSessionKey;

pub(crate) mod caches;

pub use caches::DeviceStore;

/// The result of handing a room key to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The key was new or better than the one we had, it has been stored.
    Inserted,
    /// We already had the same key or a better one.
    Ignored,
}

/// Information about a room key that was added to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomKeyInfo {
    /// The room the key belongs to.
    pub room_id: OwnedRoomId,
    /// The id of the session.
    pub session_id: String,
    /// The Curve25519 key of the device that created the session.
    pub sender_key: Curve25519PublicKey,
    /// The first message index the key can decrypt.
    pub first_known_index: u32,
}

impl From<&RoomSessionKey> for RoomKeyInfo {
    fn from(key: &RoomSessionKey) -> Self {
        Self {
            room_id: key.room_id().to_owned(),
            session_id: key.session_id().to_owned(),
            sender_key: key.sender_key(),
            first_known_index: key.first_known_index(),
        }
    }
}

/// How many room keys we have and how many of them are backed up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomKeyCounts {
    /// The total number of room keys.
    pub total: usize,
    /// The number of room keys that have been uploaded to a backup.
    pub backed_up: usize,
}

#[derive(Debug, Clone)]
struct StoredRoomKey {
    key: RoomSessionKey,
    /// The backup version this exact key was uploaded to.
    backed_up_to: Option<String>,
}

impl StoredRoomKey {
    fn new(key: RoomSessionKey) -> Self {
        Self { key, backed_up_to: None }
    }

    fn is_backed_up_to(&self, version: &str) -> bool {
        self.backed_up_to.as_deref() == Some(version)
    }
}

type SessionKeyId = (OwnedRoomId, String);

#[derive(Debug)]
struct SessionKeyStoreInner {
    /// Keys grouped by `(room_id, session_id)`, then by the base64 encoded
    /// sender key.
    keys: DashMap<SessionKeyId, BTreeMap<String, StoredRoomKey>>,
    room_keys_received_sender: broadcast::Sender<RoomKeyInfo>,
}

/// The store of room session keys.
///
/// Cloning the store is cheap, all clones share the same keys.
#[derive(Debug, Clone)]
pub struct SessionKeyStore {
    inner: Arc<SessionKeyStoreInner>,
}

impl Default for SessionKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionKeyStore {
    /// Create a new, empty, store.
    pub fn new() -> Self {
        let (room_keys_received_sender, _) = broadcast::channel(100);

        Self {
            inner: Arc::new(SessionKeyStoreInner {
                keys: DashMap::new(),
                room_keys_received_sender,
            }),
        }
    }

    /// Pick the better of two keys.
    ///
    /// The key with the lower first known index covers more messages and
    /// wins. If both start at the same index the key with the shorter
    /// forwarding chain, the one that passed through fewer devices, wins.
    ///
    /// The function is commutative and idempotent and the result never has
    /// a higher first known index than either input.
    pub fn merge(existing: &RoomSessionKey, incoming: &RoomSessionKey) -> RoomSessionKey {
        match incoming.compare_quality(existing) {
            Ordering::Less => incoming.clone(),
            Ordering::Equal | Ordering::Greater => existing.clone(),
        }
    }

    /// Store the given room key.
    ///
    /// If we already have a key for the same room, session and sender, the
    /// new key is only stored if [`SessionKeyStore::merge()`] prefers it.
    pub fn put(&self, key: RoomSessionKey) -> PutOutcome {
        let id = (key.room_id().to_owned(), key.session_id().to_owned());
        let info = RoomKeyInfo::from(&key);

        let outcome = {
            let mut sessions = self.inner.keys.entry(id).or_default();

            match sessions.entry(key.sender_key().to_base64()) {
                Entry::Vacant(entry) => {
                    entry.insert(StoredRoomKey::new(key));
                    PutOutcome::Inserted
                }
                Entry::Occupied(mut entry) => {
                    if key.compare_quality(&entry.get().key) == Ordering::Less {
                        // The improved key needs to be backed up again.
                        entry.insert(StoredRoomKey::new(key));
                        PutOutcome::Inserted
                    } else {
                        PutOutcome::Ignored
                    }
                }
            }
        };

        match outcome {
            PutOutcome::Inserted => {
                debug!(
                    room_id = ?info.room_id,
                    session_id = info.session_id,
                    sender_key = ?info.sender_key,
                    first_known_index = info.first_known_index,
                    "Stored a room key"
                );
                let _ = self.inner.room_keys_received_sender.send(info);
            }
            PutOutcome::Ignored => trace!(
                room_id = ?info.room_id,
                session_id = info.session_id,
                "Ignoring a room key, we already have the same or a better one"
            ),
        }

        outcome
    }

    /// Get the room key for the given room and session.
    ///
    /// If keys from multiple senders share the session id, the best one is
    /// returned.
    pub fn get(&self, room_id: &RoomId, session_id: &str) -> Option<RoomSessionKey> {
        let sessions = self.inner.keys.get(&(room_id.to_owned(), session_id.to_owned()))?;

        sessions
            .values()
            .map(|stored| &stored.key)
            .min_by(|a, b| a.compare_quality(b))
            .cloned()
    }

    /// Get the room key for the given room, session and sender.
    pub fn get_with_sender(
        &self,
        room_id: &RoomId,
        session_id: &str,
        sender_key: Curve25519PublicKey,
    ) -> Option<RoomSessionKey> {
        self.inner
            .keys
            .get(&(room_id.to_owned(), session_id.to_owned()))?
            .get(&sender_key.to_base64())
            .map(|stored| stored.key.clone())
    }

    /// Get all the room keys of the store.
    pub fn get_all(&self) -> Vec<RoomSessionKey> {
        self.inner
            .keys
            .iter()
            .flat_map(|s| s.value().values().map(|k| k.key.clone()).collect::<Vec<_>>())
            .collect()
    }

    /// The number of room keys in the store.
    pub fn len(&self) -> usize {
        self.inner.keys.iter().map(|s| s.value().len()).sum()
    }

    /// Is the store empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get up to `limit` room keys that still need to be uploaded to the given
    /// backup version.
    pub fn keys_for_backup(&self, version: &str, limit: usize) -> Vec<RoomSessionKey> {
        self.inner
            .keys
            .iter()
            .flat_map(|s| {
                s.value()
                    .values()
                    .filter(|k| !k.is_backed_up_to(version))
                    .map(|k| k.key.clone())
                    .collect::<Vec<_>>()
            })
            .take(limit)
            .collect()
    }

    /// Remember that the given keys have been uploaded to the backup version.
    ///
    /// Keys that have been replaced by a better key in the meantime are left
    /// alone so the better key gets uploaded as well.
    ///
    /// Returns the number of keys that were marked.
    pub fn mark_as_backed_up(&self, version: &str, keys: &[RoomSessionKey]) -> usize {
        let mut marked = 0;

        for key in keys {
            let id = (key.room_id().to_owned(), key.session_id().to_owned());

            if let Some(mut sessions) = self.inner.keys.get_mut(&id) {
                if let Some(stored) = sessions.get_mut(&key.sender_key().to_base64()) {
                    if stored.key == *key {
                        stored.backed_up_to = Some(version.to_owned());
                        marked += 1;
                    }
                }
            }
        }

        marked
    }

    /// Forget which keys were backed up, used when we switch to a new backup
    /// version.
    pub fn reset_backup_state(&self) {
        for mut sessions in self.inner.keys.iter_mut() {
            for stored in sessions.values_mut() {
                stored.backed_up_to = None;
            }
        }
    }

    /// Count the room keys we have and how many of them are backed up.
    pub fn room_key_counts(&self) -> RoomKeyCounts {
        self.inner.keys.iter().fold(RoomKeyCounts::default(), |mut counts, sessions| {
            counts.total += sessions.len();
            counts.backed_up += sessions.values().filter(|k| k.backed_up_to.is_some()).count();
            counts
        })
    }

    /// Receive notifications of room keys being added to or improved in the
    /// store.
    ///
    /// If the receiver falls behind, the oldest notifications are dropped.
    pub fn room_keys_received_stream(&self) -> impl Stream<Item = RoomKeyInfo> {
        BroadcastStream::new(self.inner.room_keys_received_sender.subscribe()).filter_map(
            |result| match result {
                Ok(info) => Some(info),
                Err(BroadcastStreamRecvError::Lagged(lagged)) => {
                    warn!(
                        lagged,
                        "The room key stream lagged behind, some notifications were dropped"
                    );
                    None
                }
            },
        )
    }
}
