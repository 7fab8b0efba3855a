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

//! Device-to-device messages used to negotiate the delivery of room keys.

use ruma::{OwnedDeviceId, OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::Curve25519PublicKey;

use super::backup::EncryptedSessionData;
use crate::error::MalformedMessageError;

/// The action of a key share control message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyShareAction {
    /// A device asks for a room key.
    ShareRequest,
    /// A device no longer needs a room key it asked for.
    ShareCancellation,
    /// An action we don't understand.
    Unknown(String),
}

impl KeyShareAction {
    /// The wire representation of the action.
    pub fn as_str(&self) -> &str {
        match self {
            KeyShareAction::ShareRequest => "request",
            KeyShareAction::ShareCancellation => "request_cancellation",
            KeyShareAction::Unknown(action) => action,
        }
    }
}

impl From<&str> for KeyShareAction {
    fn from(action: &str) -> Self {
        match action {
            "request" => KeyShareAction::ShareRequest,
            "request_cancellation" => KeyShareAction::ShareCancellation,
            _ => KeyShareAction::Unknown(action.to_owned()),
        }
    }
}

impl Serialize for KeyShareAction {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// The key share control message as it arrives, every field may be missing.
#[derive(Deserialize)]
struct RawKeyShareMessage {
    action: Option<String>,
    requesting_device_id: Option<String>,
    request_id: Option<String>,
    room_id: Option<String>,
    session_id: Option<String>,
    sender_key: Option<String>,
    algorithm: Option<String>,
}

fn required(value: Option<String>, field: &'static str) -> Result<String, MalformedMessageError> {
    value.filter(|v| !v.is_empty()).ok_or(MalformedMessageError::MissingField(field))
}

/// A validated key share control message.
///
/// The `room_id`, `session_id`, `request_id` and `requesting_device_id`
/// fields are always present, messages missing one of them are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyShareMessage {
    /// Does the device want a key or does it not want it anymore.
    pub action: KeyShareAction,
    /// The device that sent the request.
    pub requesting_device_id: OwnedDeviceId,
    /// The id of the request, unique per requesting device.
    pub request_id: String,
    /// The room of the requested key.
    pub room_id: OwnedRoomId,
    /// The session id of the requested key.
    pub session_id: String,
    /// The Curve25519 key of the device that created the session.
    #[serde(skip_serializing_if = "Option::is_none", with = "curve_key_option")]
    pub sender_key: Option<Curve25519PublicKey>,
    /// The algorithm of the requested key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
}

mod curve_key_option {
    use serde::Serializer;
    use vodozemac::Curve25519PublicKey;

    pub(super) fn serialize<S: Serializer>(
        key: &Option<Curve25519PublicKey>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match key {
            Some(key) => serializer.serialize_str(&key.to_base64()),
            None => serializer.serialize_none(),
        }
    }
}

impl KeyShareMessage {
    /// Parse and validate a control message from its JSON form.
    pub fn from_json(value: &Value) -> Result<Self, MalformedMessageError> {
        let raw = RawKeyShareMessage::deserialize(value)?;

        let action = required(raw.action, "action")?.as_str().into();
        let requesting_device_id = required(raw.requesting_device_id, "requesting_device_id")?;
        let request_id = required(raw.request_id, "request_id")?;
        let room_id = required(raw.room_id, "room_id")?;
        let session_id = required(raw.session_id, "session_id")?;

        let room_id = RoomId::parse(&room_id).map_err(|e| MalformedMessageError::InvalidField {
            field: "room_id",
            reason: e.to_string(),
        })?;

        let sender_key = raw
            .sender_key
            .map(|key| {
                Curve25519PublicKey::from_base64(&key).map_err(|e| {
                    MalformedMessageError::InvalidField {
                        field: "sender_key",
                        reason: e.to_string(),
                    }
                })
            })
            .transpose()?;

        Ok(Self {
            action,
            requesting_device_id: requesting_device_id.into(),
            request_id,
            room_id,
            session_id,
            sender_key,
            algorithm: raw.algorithm,
        })
    }

    /// Serialize the message into its wire format.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// A room key we forward to a device that asked for it.
///
/// The key itself is encrypted for the Curve25519 identity key of the
/// receiving device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedRoomKeyContent {
    /// The algorithm of the forwarded room key.
    pub algorithm: String,
    /// The request this key answers.
    pub request_id: String,
    /// The room the key belongs to.
    pub room_id: OwnedRoomId,
    /// The id of the session.
    pub session_id: String,
    /// The encrypted room key.
    pub session_data: EncryptedSessionData,
}
