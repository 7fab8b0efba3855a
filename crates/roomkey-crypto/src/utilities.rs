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

use base64::{
    alphabet,
    engine::{general_purpose, GeneralPurpose},
    Engine,
};
use ruma::CanonicalJsonValue;
use serde::Serialize;

use crate::error::SignatureError;

const STANDARD_NO_PAD: GeneralPurpose = general_purpose::STANDARD_NO_PAD;

/// Decode the input as base64 with no padding.
///
/// Padded input is accepted as well since some implementations still emit it.
pub(crate) fn decode(input: impl AsRef<[u8]>) -> Result<Vec<u8>, base64::DecodeError> {
    const LENIENT: GeneralPurpose = GeneralPurpose::new(
        &alphabet::STANDARD,
        general_purpose::NO_PAD
            .with_decode_padding_mode(base64::engine::DecodePaddingMode::Indifferent),
    );

    LENIENT.decode(input)
}

/// Encode the input as base64 with no padding.
pub(crate) fn encode(input: impl AsRef<[u8]>) -> String {
    STANDARD_NO_PAD.encode(input)
}

/// Convert the given value into its canonical JSON form, dropping the
/// top-level `signatures` and `unsigned` fields.
///
/// This is the form over which Ed25519 signatures are created and checked.
pub(crate) fn to_signable_json(value: &impl Serialize) -> Result<String, SignatureError> {
    let mut json = serde_json::to_value(value)?;

    if let Some(object) = json.as_object_mut() {
        object.remove("signatures");
        object.remove("unsigned");
    }

    let canonical: CanonicalJsonValue = json.try_into()?;

    Ok(canonical.to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{decode, encode, to_signable_json};

    #[test]
    fn decoding_accepts_padded_input() {
        let bytes = b"Hello, world";

        assert_eq!(encode(bytes), "SGVsbG8sIHdvcmxk");
        assert_eq!(decode("SGVsbG8sIHdvcmxk").unwrap(), bytes);
        assert_eq!(decode("SGVsbG8=").unwrap(), b"Hello");
        assert_eq!(decode("SGVsbG8").unwrap(), b"Hello");
    }

    #[test]
    fn signable_json_is_canonical_and_unsigned() {
        let value = json!({
            "public_key": "abc",
            "algorithm": "m.test",
            "signatures": { "DEVICE": "sig" },
            "nested": { "b": 1, "a": 2 },
        });

        assert_eq!(
            to_signable_json(&value).unwrap(),
            r#"{"algorithm":"m.test","nested":{"a":2,"b":1},"public_key":"abc"}"#
        );
    }
}
