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

use tracing::{debug, trace};

use crate::{config::OneTimeKeyConfig, types::OneTimeKeyCounts};

/// Keeps track of how many one-time keys the server still holds for us.
///
/// The server is authoritative, every count it reports replaces our local
/// view wholesale. Between two reports we decrement the count optimistically
/// when we learn that keys were claimed.
#[derive(Debug, Clone)]
pub struct OneTimeKeySupplyTracker {
    config: OneTimeKeyConfig,
    counts: BTreeMap<String, u64>,
    unused_fallback_keys: Option<Vec<String>>,
}

impl OneTimeKeySupplyTracker {
    /// Create a new tracker, with no counts known every algorithm starts at
    /// zero.
    pub fn new(config: OneTimeKeyConfig) -> Self {
        Self { config, counts: BTreeMap::new(), unused_fallback_keys: None }
    }

    /// Replace the tracked counts with the ones the server reported.
    pub fn update_counts(&mut self, counts: &OneTimeKeyCounts) {
        debug!(counts = ?counts.as_map(), "Updating the one-time key counts");

        self.counts = counts.as_map().clone();
    }

    /// Lower the count of the given algorithm by `n`, never going below zero.
    pub fn record_claim(&mut self, algorithm: &str, n: u64) {
        if let Some(count) = self.counts.get_mut(algorithm) {
            *count = count.saturating_sub(n);
            trace!(algorithm, claimed = n, remaining = *count, "Recorded a one-time key claim");
        }
    }

    /// Does the given algorithm need new keys uploaded.
    pub fn needs_replenishment(&self, algorithm: &str) -> bool {
        self.count(algorithm) < self.config.threshold
    }

    /// The currently known count for the given algorithm.
    pub fn count(&self, algorithm: &str) -> u64 {
        self.counts.get(algorithm).copied().unwrap_or_default()
    }

    /// Did the server report a count for the given algorithm.
    pub fn has_count(&self, algorithm: &str) -> bool {
        self.counts.contains_key(algorithm)
    }

    /// How many keys need to be generated to fill the supply back up.
    pub fn keys_to_generate(&self, algorithm: &str) -> u64 {
        if self.needs_replenishment(algorithm) {
            self.config.max_one_time_keys.saturating_sub(self.count(algorithm))
        } else {
            0
        }
    }

    /// Update the list of algorithms for which the server holds an unused
    /// fallback key.
    ///
    /// `None` means that the server doesn't support fallback keys.
    pub fn update_unused_fallback_keys(&mut self, algorithms: Option<Vec<String>>) {
        self.unused_fallback_keys = algorithms;
    }

    /// Do we need to upload a new fallback key for the given algorithm.
    pub fn needs_fallback_key(&self, algorithm: &str) -> bool {
        self.unused_fallback_keys
            .as_ref()
            .is_some_and(|unused| !unused.iter().any(|a| a == algorithm))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::OneTimeKeySupplyTracker;
    use crate::{config::OneTimeKeyConfig, types::OneTimeKeyCounts};

    const CURVE: &str = "signed_curve25519";

    fn counts(value: serde_json::Value) -> OneTimeKeyCounts {
        serde_json::from_value(value).unwrap()
    }

    fn curve_counts(count: u64) -> OneTimeKeyCounts {
        counts(json!({ "one_time_key_counts": { "signed_curve25519": count } }))
    }

    #[test]
    fn claims_trigger_replenishment() {
        let mut tracker = OneTimeKeySupplyTracker::new(OneTimeKeyConfig::new().threshold(5));
        tracker.update_counts(&curve_counts(10));

        assert!(!tracker.needs_replenishment(CURVE));

        tracker.record_claim(CURVE, 6);

        assert_eq!(tracker.count(CURVE), 4);
        assert!(tracker.needs_replenishment(CURVE));
    }

    #[test]
    fn claims_are_floored_at_zero() {
        let mut tracker = OneTimeKeySupplyTracker::new(OneTimeKeyConfig::new());
        tracker.update_counts(&curve_counts(3));

        tracker.record_claim(CURVE, 10);
        assert_eq!(tracker.count(CURVE), 0);

        tracker.record_claim("unknown", 10);
        assert_eq!(tracker.count("unknown"), 0);
    }

    #[test]
    fn server_counts_override_local_estimates() {
        let mut tracker = OneTimeKeySupplyTracker::new(OneTimeKeyConfig::new().threshold(5));
        tracker.update_counts(&curve_counts(10));
        tracker.record_claim(CURVE, 8);

        tracker.update_counts(&curve_counts(9));

        assert_eq!(tracker.count(CURVE), 9);
        assert!(!tracker.needs_replenishment(CURVE));
    }

    #[test]
    fn absent_counts_are_zero() {
        let mut tracker = OneTimeKeySupplyTracker::new(
            OneTimeKeyConfig::new().threshold(5).max_one_time_keys(50),
        );
        tracker.update_counts(&curve_counts(10));
        tracker.update_counts(&counts(json!({})));

        assert!(!tracker.has_count(CURVE));
        assert_eq!(tracker.count(CURVE), 0);
        assert!(tracker.needs_replenishment(CURVE));
        assert_eq!(tracker.keys_to_generate(CURVE), 50);
    }

    #[test]
    fn fallback_keys() {
        let mut tracker = OneTimeKeySupplyTracker::new(OneTimeKeyConfig::new());

        assert!(!tracker.needs_fallback_key(CURVE), "The server doesn't support fallback keys");

        tracker.update_unused_fallback_keys(Some(vec![]));
        assert!(tracker.needs_fallback_key(CURVE));

        tracker.update_unused_fallback_keys(Some(vec![CURVE.to_owned()]));
        assert!(!tracker.needs_fallback_key(CURVE));
    }
}
