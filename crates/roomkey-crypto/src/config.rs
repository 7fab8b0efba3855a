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

//! Configuration for the different state machines of this crate.
//!
//! All the configuration types are cheap to copy and use a builder style API.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//!
//! use roomkey_crypto::config::{CryptoConfig, KeyRequestConfig, RetryConfig};
//!
//! let config = CryptoConfig::new()
//!     .retry(RetryConfig::new().retry_limit(3))
//!     .key_requests(KeyRequestConfig::new().request_ttl(Duration::from_secs(600)));
//! ```

use std::time::Duration;

/// How transport requests are retried.
///
/// Failed transport requests are retried using an exponential backoff, the
/// wait time starts at `initial_interval` and is multiplied by `multiplier`
/// after every failed attempt, capped at `max_interval`. Once `retry_limit`
/// attempts have failed the error is surfaced to the caller.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryConfig {
    pub(crate) retry_limit: u32,
    pub(crate) initial_interval: Duration,
    pub(crate) max_interval: Duration,
    pub(crate) multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_limit: 5,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a new default `RetryConfig`.
    #[must_use]
    pub fn new() -> Self {
        Default::default()
    }

    /// Attempt requests only once. Same as setting the `retry_limit` to `1`.
    #[must_use]
    pub fn disable_retry(mut self) -> Self {
        self.retry_limit = 1;
        self
    }

    /// The maximal number of attempts for a single request, values smaller
    /// than one are treated as one.
    #[must_use]
    pub fn retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit.max(1);
        self
    }

    /// The time we wait after the first failed attempt.
    #[must_use]
    pub fn initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// The upper bound for the time we wait between two attempts.
    #[must_use]
    pub fn max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// The factor the wait time grows by after each failed attempt.
    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Get the maximal number of attempts.
    pub fn get_retry_limit(&self) -> u32 {
        self.retry_limit
    }
}

/// Timeouts for incoming key share requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyRequestConfig {
    pub(crate) request_ttl: Duration,
    pub(crate) retention: Duration,
}

impl Default for KeyRequestConfig {
    fn default() -> Self {
        Self {
            request_ttl: Duration::from_secs(24 * 60 * 60),
            retention: Duration::from_secs(60 * 60),
        }
    }
}

impl KeyRequestConfig {
    /// Create a new default `KeyRequestConfig`.
    #[must_use]
    pub fn new() -> Self {
        Default::default()
    }

    /// How long a request may stay unanswered before it expires.
    #[must_use]
    pub fn request_ttl(mut self, ttl: Duration) -> Self {
        self.request_ttl = ttl;
        self
    }

    /// How long a request is remembered after it reached a terminal state.
    ///
    /// Duplicate messages for the request are recognized as replays during
    /// this window.
    #[must_use]
    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

/// Replenishment policy for one-time keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OneTimeKeyConfig {
    pub(crate) threshold: u64,
    pub(crate) max_one_time_keys: u64,
}

impl Default for OneTimeKeyConfig {
    fn default() -> Self {
        Self { threshold: 25, max_one_time_keys: 50 }
    }
}

impl OneTimeKeyConfig {
    /// Create a new default `OneTimeKeyConfig`.
    #[must_use]
    pub fn new() -> Self {
        Default::default()
    }

    /// Keys need to be replenished once the count drops below this value.
    #[must_use]
    pub fn threshold(mut self, threshold: u64) -> Self {
        self.threshold = threshold;
        self
    }

    /// The number of keys we want the server to hold after a replenishment.
    #[must_use]
    pub fn max_one_time_keys(mut self, max: u64) -> Self {
        self.max_one_time_keys = max;
        self
    }
}

/// Settings for uploading room keys to a backup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackupConfig {
    pub(crate) batch_size: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

impl BackupConfig {
    /// Create a new default `BackupConfig`.
    #[must_use]
    pub fn new() -> Self {
        Default::default()
    }

    /// How many room keys are uploaded in a single request.
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// The combined configuration of a [`KeyMachine`](crate::KeyMachine).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CryptoConfig {
    pub(crate) retry: RetryConfig,
    pub(crate) key_requests: KeyRequestConfig,
    pub(crate) one_time_keys: OneTimeKeyConfig,
    pub(crate) backup: BackupConfig,
}

impl CryptoConfig {
    /// Create a new default `CryptoConfig`.
    #[must_use]
    pub fn new() -> Self {
        Default::default()
    }

    /// Set the retry policy for transport requests.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the timeouts for incoming key requests.
    #[must_use]
    pub fn key_requests(mut self, config: KeyRequestConfig) -> Self {
        self.key_requests = config;
        self
    }

    /// Set the one-time key replenishment policy.
    #[must_use]
    pub fn one_time_keys(mut self, config: OneTimeKeyConfig) -> Self {
        self.one_time_keys = config;
        self
    }

    /// Set the backup upload settings.
    #[must_use]
    pub fn backup(mut self, config: BackupConfig) -> Self {
        self.backup = config;
        self
    }
}
