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

//! Handling of room key requests other devices send us.

mod machine;

pub use machine::GossipMachine;
use ruma::{DeviceId, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use tokio::time::Instant;
use vodozemac::Curve25519PublicKey;

use crate::types::events::{KeyShareAction, KeyShareMessage};

/// The state of an incoming key share request.
///
/// Every state but `Requested` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// We received the request but didn't send the key yet.
    Requested,
    /// We sent the key to the requesting device.
    Satisfied,
    /// The requesting device cancelled the request.
    Cancelled,
    /// The request wasn't satisfied in time.
    Expired,
}

impl RequestState {
    /// Is the state terminal.
    pub fn is_finished(self) -> bool {
        self != RequestState::Requested
    }
}

/// A key share request we received from another device.
///
/// Requests are identified by the sender, the requesting device and the
/// request id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyShareRequest {
    request_id: String,
    requesting_user_id: OwnedUserId,
    requesting_device_id: OwnedDeviceId,
    room_id: OwnedRoomId,
    session_id: String,
    sender_key: Option<Curve25519PublicKey>,
    action: KeyShareAction,
    state: RequestState,
    created_at: Instant,
    finished_at: Option<Instant>,
}

impl KeyShareRequest {
    pub(crate) fn new(sender: &UserId, message: &KeyShareMessage, state: RequestState) -> Self {
        let now = Instant::now();

        Self {
            request_id: message.request_id.clone(),
            requesting_user_id: sender.to_owned(),
            requesting_device_id: message.requesting_device_id.clone(),
            room_id: message.room_id.clone(),
            session_id: message.session_id.clone(),
            sender_key: message.sender_key,
            action: message.action.clone(),
            state,
            created_at: now,
            finished_at: state.is_finished().then_some(now),
        }
    }

    /// The id of the request.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// The user owning the requesting device.
    pub fn requesting_user_id(&self) -> &UserId {
        &self.requesting_user_id
    }

    /// The device that wants the room key.
    pub fn requesting_device_id(&self) -> &DeviceId {
        &self.requesting_device_id
    }

    /// The room of the requested key.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The session id of the requested key.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The Curve25519 key of the device that created the requested session,
    /// if the requester told us.
    pub fn sender_key(&self) -> Option<Curve25519PublicKey> {
        self.sender_key
    }

    /// The action of the first message we received for this request.
    pub fn action(&self) -> &KeyShareAction {
        &self.action
    }

    /// The current state of the request.
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// When we first heard of the request.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Move a pending request into a terminal state, finished requests are
    /// never changed.
    pub(crate) fn finish(&mut self, state: RequestState, now: Instant) -> bool {
        if self.state.is_finished() || !state.is_finished() {
            return false;
        }

        self.state = state;
        self.finished_at = Some(now);

        true
    }

    pub(crate) fn finished_at(&self) -> Option<Instant> {
        self.finished_at
    }
}

/// What a call to [`GossipMachine::sweep()`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// The number of pending requests that expired.
    pub expired: usize,
    /// The number of finished requests that were forgotten.
    pub removed: usize,
}
