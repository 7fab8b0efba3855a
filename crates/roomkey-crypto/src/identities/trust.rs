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

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{DeviceIdentity, TrustState};
use crate::backups::BackupVersion;

/// How much confidence we have that a backup version was created by us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustTier {
    /// The backup is signed by a cross-signed device.
    CrossSigned,
    /// The backup is signed by a verified device.
    Verified,
    /// None of the signatures belong to a device we know about.
    Unknown,
    /// The backup is only signed by blocked devices.
    Untrusted,
}

impl TrustTier {
    /// Can room keys be uploaded to and restored from a backup with this
    /// trust tier.
    pub fn is_trusted(self) -> bool {
        matches!(self, TrustTier::CrossSigned | TrustTier::Verified)
    }
}

/// Computes the [`TrustTier`] of a backup version from the verification
/// state of the devices that signed it.
///
/// The evaluation is a pure function of its inputs, the result must not be
/// kept around for longer than the device list it was computed from.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustEvaluator;

impl TrustEvaluator {
    /// Evaluate the trust tier of the backup given a snapshot of the known
    /// devices.
    ///
    /// Only signatures that are cryptographically valid count. A valid
    /// signature from a cross-signed device makes the backup `CrossSigned`,
    /// otherwise one from a verified device makes it `Verified`. If every
    /// valid signer is blocked the backup is `Untrusted`, in all other cases
    /// it's `Unknown`.
    pub fn evaluate(backup: &BackupVersion, devices: &[DeviceIdentity]) -> TrustTier {
        let canonical_json = match backup.signable_json() {
            Ok(json) => json,
            Err(error) => {
                warn!(
                    version = backup.version(),
                    ?error,
                    "Couldn't canonicalize the backup auth data"
                );
                return TrustTier::Unknown;
            }
        };

        let mut signers = Vec::new();

        for (device_id, signature) in backup.signatures() {
            for device in devices.iter().filter(|d| d.device_id() == &**device_id) {
                match device.verify_canonical(&canonical_json, signature) {
                    Ok(()) => signers.push(device.trust_state()),
                    Err(error) => debug!(
                        version = backup.version(),
                        user_id = ?device.user_id(),
                        ?device_id,
                        ?error,
                        "Invalid backup signature",
                    ),
                }
            }
        }

        if signers.contains(&TrustState::CrossSigned) {
            TrustTier::CrossSigned
        } else if signers.contains(&TrustState::Verified) {
            TrustTier::Verified
        } else if !signers.is_empty() && signers.iter().all(|s| *s == TrustState::Blocked) {
            TrustTier::Untrusted
        } else {
            TrustTier::Unknown
        }
    }
}
