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

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The number of unclaimed one-time keys the server holds for us, per
/// algorithm.
///
/// Deserializes from an object with a `one_time_key_counts` field, a missing
/// field means that every count is zero.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimeKeyCounts {
    #[serde(default)]
    one_time_key_counts: BTreeMap<String, u64>,
}

impl OneTimeKeyCounts {
    /// Create a new set of counts from a map of algorithm to count.
    pub fn new(counts: BTreeMap<String, u64>) -> Self {
        Self { one_time_key_counts: counts }
    }

    /// The count for the given algorithm, zero if the algorithm isn't listed.
    pub fn get(&self, algorithm: &str) -> u64 {
        self.one_time_key_counts.get(algorithm).copied().unwrap_or_default()
    }

    /// The counts as a map of algorithm to count.
    pub fn as_map(&self) -> &BTreeMap<String, u64> {
        &self.one_time_key_counts
    }
}

/// The parts of a sync response that describe our key supply.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySupplyChanges {
    /// The one-time key counts.
    #[serde(flatten)]
    pub counts: OneTimeKeyCounts,
    /// The algorithms for which the server holds an unused fallback key,
    /// missing if the server doesn't support fallback keys.
    #[serde(default, rename = "device_unused_fallback_key_types")]
    pub unused_fallback_keys: Option<Vec<String>>,
}
