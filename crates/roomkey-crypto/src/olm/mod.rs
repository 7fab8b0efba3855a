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

//! The cryptographic identity of our own device and the room keys it holds.

mod account;
mod one_time_keys;
mod room_key;

pub use account::Account;
pub use one_time_keys::OneTimeKeySupplyTracker;
pub(crate) use room_key::RoomKeyPayload;
#[cfg(test)]
pub(crate) use room_key::testing;
pub use room_key::{RoomSessionKey, SessionKeyMaterial, MEGOLM_V1_ALGORITHM};
